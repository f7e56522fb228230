//! Trust peers presenting the same identity as this node.
//!
//! Every member is assumed to share one identity; the local node's own
//! certificate subject is read once at construction and compared with each
//! peer's.

use super::{dn, PeerAuthenticator};
use crate::channel::tls::load_certs;
use crate::channel::PeerSession;
use crate::error::ConfigError;
use crate::params::InstanceParams;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct MirrorAuthenticator {
    local_dn: String,
}

impl MirrorAuthenticator {
    pub fn new(local_dn: impl Into<String>) -> Self {
        Self {
            local_dn: local_dn.into(),
        }
    }

    /// Use the subject of the first certificate in a PEM file.
    pub fn from_cert_file(path: &Path) -> Result<Self, ConfigError> {
        let certs = load_certs(path)?;
        let leaf = certs
            .first()
            .ok_or_else(|| ConfigError::Tls(format!("no certificate in {}", path.display())))?;
        let local_dn = dn::subject_dn(leaf.as_ref())
            .map_err(|e| ConfigError::Tls(format!("{}: {}", path.display(), e)))?;
        info!("✓ Mirror authenticator bound to {}", local_dn);
        Ok(Self::new(local_dn))
    }

    /// Class params name a certificate file; otherwise the node's own TLS
    /// certificate is used.
    pub fn construct(params: &InstanceParams) -> Result<Arc<dyn PeerAuthenticator>, ConfigError> {
        let path = match params.class_params() {
            Some(path) => Path::new(path).to_path_buf(),
            None => params
                .net()
                .tls
                .as_ref()
                .map(|tls| tls.cert.clone())
                .ok_or_else(|| {
                    ConfigError::Invalid(
                        "mirror requires a certificate path or a [channel.tls] cert".to_string(),
                    )
                })?,
        };
        Ok(Arc::new(Self::from_cert_file(&path)?))
    }

    pub fn local_dn(&self) -> &str {
        &self.local_dn
    }
}

impl PeerAuthenticator for MirrorAuthenticator {
    fn name(&self) -> &'static str {
        "mirror"
    }

    fn is_trusted(&self, session: &PeerSession) -> bool {
        match session.subject_dn() {
            Ok(peer_dn) => {
                let trusted = peer_dn == self.local_dn;
                debug!("peer DN {:?} mirror match: {}", peer_dn, trusted);
                trusted
            }
            Err(e) => {
                warn!("mirror could not read peer DN: {}", e);
                false
            }
        }
    }
}
