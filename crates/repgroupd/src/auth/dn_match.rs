//! Trust peers whose subject DN matches a configured pattern.
//!
//! The pattern is searched for anywhere in the RFC 2253 DN, so
//! `CN=node[0-9]+` also accepts `CN=node1,O=Example`. Anchor with `^` and
//! `$` to require the whole DN.

use super::PeerAuthenticator;
use crate::channel::PeerSession;
use crate::error::ConfigError;
use crate::params::InstanceParams;
use regex::Regex;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug)]
pub struct DnMatchAuthenticator {
    pattern: Regex,
}

impl DnMatchAuthenticator {
    /// Compiles `pattern` now so a bad pattern never reaches a session.
    pub fn new(pattern: &str) -> Result<Self, ConfigError> {
        if pattern.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "dn-match requires a non-empty pattern".to_string(),
            ));
        }
        let pattern = Regex::new(pattern).map_err(|source| ConfigError::Regex {
            pattern: pattern.to_string(),
            source,
        })?;
        Ok(Self { pattern })
    }

    pub fn construct(params: &InstanceParams) -> Result<Arc<dyn PeerAuthenticator>, ConfigError> {
        let pattern = params.class_params().ok_or_else(|| {
            ConfigError::Invalid("dn-match requires authenticator_params with a pattern".to_string())
        })?;
        Ok(Arc::new(Self::new(pattern)?))
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    pub fn matches(&self, dn: &str) -> bool {
        self.pattern.is_match(dn)
    }
}

impl PeerAuthenticator for DnMatchAuthenticator {
    fn name(&self) -> &'static str {
        "dn-match"
    }

    fn is_trusted(&self, session: &PeerSession) -> bool {
        match session.subject_dn() {
            Ok(dn) => {
                let trusted = self.matches(&dn);
                debug!("peer DN {:?} against {}: {}", dn, self.pattern, trusted);
                trusted
            }
            Err(e) => {
                warn!("dn-match could not read peer DN: {}", e);
                false
            }
        }
    }
}
