//! Error types for group membership.
//!
//! Two classes live here: `FormatError` for corrupt streams and invariant
//! violations (never repaired, always propagated), and `MembershipError` for
//! precondition failures the caller can correct and retry.

use crate::node::NodeType;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("format version {version} is outside the supported range [{min}, {max}]")]
    UnsupportedVersion { version: u16, min: u16, max: u16 },

    #[error("corrupt stream: header declares {declared} nodes but {actual} node tokens follow")]
    TokenCount { declared: u32, actual: usize },

    #[error("corrupt stream: token {index}: {reason}")]
    MalformedToken { index: usize, reason: String },

    #[error("corrupt stream: {0}")]
    Corrupt(String),

    #[error("format version {version} predates secondary nodes but the group has {count} secondary node(s)")]
    SecondaryNotSupported { version: u16, count: usize },

    #[error("node type code {code} is not defined at format version {version}")]
    UnknownNodeType { code: u8, version: u16 },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MembershipError {
    #[error("node {name} is already a member of group {group}")]
    DuplicateMember { name: String, group: String },

    #[error("node {name} is not a member of group {group}")]
    MemberNotFound { name: String, group: String },

    #[error("node {name} is still active; deactivate or remove it first")]
    MemberActive { name: String },

    #[error("node {name} is a {existing} member and cannot rejoin as {requested}")]
    TypeMismatch {
        name: String,
        existing: NodeType,
        requested: NodeType,
    },

    #[error(transparent)]
    Format(#[from] FormatError),
}

impl MembershipError {
    /// Stable short code for operator tooling
    pub fn code(&self) -> &'static str {
        match self {
            MembershipError::DuplicateMember { .. } => "duplicate_member",
            MembershipError::MemberNotFound { .. } => "member_not_found",
            MembershipError::MemberActive { .. } => "member_active",
            MembershipError::TypeMismatch { .. } => "type_mismatch",
            MembershipError::Format(_) => "invariant_violation",
        }
    }
}
