//! Shared membership types for repgroup components.
//!
//! Node taxonomy, versioned group snapshots with their hex token encoding,
//! and the stream/format compatibility matrix. No I/O happens here.

pub mod error;
pub mod group;
pub mod node;
pub mod report;
pub mod token;
pub mod version;

pub use error::{FormatError, MembershipError};
pub use group::GroupMembership;
pub use node::{NodeDescriptor, NodeId, NodeType};
pub use version::{CompatibilityGate, FormatVersion, IncompatibleVersion};
