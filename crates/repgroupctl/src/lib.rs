//! repgroupctl - operator tool for replication group membership

pub mod cli;
pub mod commands;
