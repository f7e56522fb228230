//! Construction parameters shared by every pluggable implementation.
//!
//! Factories and authenticators are all built from the same pair: a context
//! naming the purpose of the instance plus an opaque class-specific string.

use crate::config::ChannelConfig;
use std::fmt;
use std::sync::Arc;

/// What a channel factory instance is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelPurpose {
    /// Replica to master data stream
    ReplicaStream,
    /// Election traffic
    Election,
    /// Group membership service (join, status)
    GroupService,
}

impl ChannelPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelPurpose::ReplicaStream => "replica-stream",
            ChannelPurpose::Election => "election",
            ChannelPurpose::GroupService => "group-service",
        }
    }
}

impl fmt::Display for ChannelPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct InstanceContext {
    pub purpose: ChannelPurpose,
    pub net: Arc<ChannelConfig>,
}

impl InstanceContext {
    pub fn new(purpose: ChannelPurpose, net: Arc<ChannelConfig>) -> Self {
        Self { purpose, net }
    }
}

/// Immutable construction input for a factory or authenticator
#[derive(Debug, Clone)]
pub struct InstanceParams {
    context: InstanceContext,
    class_params: Option<String>,
}

impl InstanceParams {
    pub fn new(context: InstanceContext, class_params: Option<String>) -> Self {
        // an empty string means "no parameters"
        let class_params = class_params.filter(|p| !p.trim().is_empty());
        Self {
            context,
            class_params,
        }
    }

    pub fn context(&self) -> &InstanceContext {
        &self.context
    }

    pub fn purpose(&self) -> ChannelPurpose {
        self.context.purpose
    }

    pub fn net(&self) -> &ChannelConfig {
        &self.context.net
    }

    pub fn class_params(&self) -> Option<&str> {
        self.class_params.as_deref()
    }

    /// Same context, different class parameters
    pub fn with_class_params(&self, class_params: Option<String>) -> Self {
        Self::new(self.context.clone(), class_params)
    }
}
