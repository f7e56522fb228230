//! Peer trust policies.
//!
//! An authenticator looks at a completed secure session and answers one
//! question: is this peer an internal member of the group. Configuration is
//! read and frozen at construction; `is_trusted` never mutates, so one
//! instance serves every concurrent session.

pub mod dn;
pub mod dn_match;
pub mod mirror;

pub use dn_match::DnMatchAuthenticator;
pub use mirror::MirrorAuthenticator;

use crate::channel::PeerSession;
use crate::error::ConfigError;
use crate::params::InstanceParams;
use std::collections::BTreeMap;
use std::sync::Arc;

pub trait PeerAuthenticator: Send + Sync {
    /// Registry key, used in logs and trust errors
    fn name(&self) -> &'static str;

    /// Any failure to decide yields `false`.
    fn is_trusted(&self, session: &PeerSession) -> bool;
}

pub type AuthenticatorConstructor = fn(&InstanceParams) -> Result<Arc<dyn PeerAuthenticator>, ConfigError>;

#[derive(Clone)]
pub struct AuthenticatorRegistry {
    constructors: BTreeMap<String, AuthenticatorConstructor>,
}

impl AuthenticatorRegistry {
    pub fn empty() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// `dn-match` and `mirror`
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("dn-match", DnMatchAuthenticator::construct);
        registry.register("mirror", MirrorAuthenticator::construct);
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, constructor: AuthenticatorConstructor) {
        self.constructors.insert(name.into(), constructor);
    }

    pub fn names(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }

    pub fn build(&self, name: &str, params: &InstanceParams) -> Result<Arc<dyn PeerAuthenticator>, ConfigError> {
        let constructor = self
            .constructors
            .get(name)
            .ok_or_else(|| ConfigError::UnknownImplementation {
                kind: "peer authenticator",
                name: name.to_string(),
                available: self.names().join(", "),
            })?;
        constructor(params)
    }
}

impl Default for AuthenticatorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
