//! repgroupd - replication group membership daemon
//!
//! Tracks group membership, serves it to joining peers over trusted
//! channels, and gates joins on the stream/format compatibility matrix.

pub mod auth;
pub mod channel;
pub mod config;
pub mod daemon;
pub mod error;
pub mod handshake;
pub mod membership;
pub mod params;
pub mod store;

pub use config::Config;
pub use error::ConfigError;
