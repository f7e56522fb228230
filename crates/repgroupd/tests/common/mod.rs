//! Shared fixtures for repgroupd integration tests

#![allow(dead_code)]

use rcgen::{BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair};
use repgroupd::channel::{ChannelFactory, FactoryRegistry};
use repgroupd::config::{ChannelConfig, TlsConfig};
use repgroupd::params::{ChannelPurpose, InstanceContext, InstanceParams};
use repgroupd::ConfigError;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

pub struct TestCa {
    cert: Certificate,
    key: KeyPair,
    pub dir: TempDir,
    pub ca_path: PathBuf,
}

/// PEM paths of one issued identity
pub struct Identity {
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl TestCa {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, "repgroup test CA");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let cert = params.self_signed(&key).unwrap();

        let ca_path = dir.path().join("ca.pem");
        fs::write(&ca_path, cert.pem()).unwrap();
        Self {
            cert,
            key,
            dir,
            ca_path,
        }
    }

    /// Issue a `localhost` certificate with subject O, OU, CN.
    pub fn issue(&self, label: &str, org: &str, unit: &str, common_name: &str) -> Identity {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::OrganizationName, org);
        params.distinguished_name.push(DnType::OrganizationalUnitName, unit);
        params.distinguished_name.push(DnType::CommonName, common_name);
        let cert = params.signed_by(&key, &self.cert, &self.key).unwrap();

        let cert_path = self.dir.path().join(format!("{label}.pem"));
        let key_path = self.dir.path().join(format!("{label}.key"));
        fs::write(&cert_path, cert.pem()).unwrap();
        write_private(&key_path, &key.serialize_pem());
        Identity {
            cert: cert_path,
            key: key_path,
        }
    }

    pub fn tls_config(&self, identity: &Identity, authenticator: Option<(&str, Option<&str>)>) -> TlsConfig {
        TlsConfig {
            ca_cert: self.ca_path.clone(),
            cert: identity.cert.clone(),
            key: identity.key.clone(),
            server_name: Some("localhost".to_string()),
            authenticator: authenticator.map(|(name, _)| name.to_string()),
            authenticator_params: authenticator.and_then(|(_, p)| p.map(str::to_string)),
        }
    }
}

pub fn write_private(path: &Path, content: &str) {
    fs::write(path, content).unwrap();
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600)).unwrap();
    }
}

pub fn channel_config(factory: &str, tls: Option<TlsConfig>) -> ChannelConfig {
    ChannelConfig {
        factory: factory.to_string(),
        connect_timeout_ms: 2_000,
        handshake_timeout_ms: 2_000,
        tls,
        ..ChannelConfig::default()
    }
}

pub fn build_factory(config: ChannelConfig) -> Result<Arc<dyn ChannelFactory>, ConfigError> {
    let name = config.factory.clone();
    let params = InstanceParams::new(
        InstanceContext::new(ChannelPurpose::GroupService, Arc::new(config)),
        None,
    );
    FactoryRegistry::with_builtins().build(&name, &params)
}
