//! Mutually authenticated TLS factory.
//!
//! Both sides present certificates issued by the configured CA. After the
//! handshake the configured `PeerAuthenticator` decides whether the peer is
//! an internal member; a rejected peer is shut down before any channel is
//! handed out.

use super::factory::{connect_tcp, shutdown_bounded, with_timeout, ChannelFactory, ConnectOptions};
use super::{ChannelError, ChannelTrust, DataChannel, PeerSession, StreamChannel};
use crate::auth::{AuthenticatorRegistry, PeerAuthenticator};
use crate::config::TlsConfig;
use crate::error::ConfigError;
use crate::params::InstanceParams;
use async_trait::async_trait;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, CommonState, RootCertStore, ServerConfig};
use std::fs;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info, warn};

fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Read every certificate in a PEM file.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let pem = fs::read(path).map_err(|e| ConfigError::io(path, e))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(&pem[..]))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConfigError::Tls(format!("failed to parse {}: {}", path.display(), e)))?;
    if certs.is_empty() {
        return Err(ConfigError::Tls(format!("no certificates found in {}", path.display())));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, ConfigError> {
    let pem = fs::read(path).map_err(|e| ConfigError::io(path, e))?;
    rustls_pemfile::private_key(&mut BufReader::new(&pem[..]))
        .map_err(|e| ConfigError::Tls(format!("failed to parse {}: {}", path.display(), e)))?
        .ok_or_else(|| ConfigError::Tls(format!("no private key found in {}", path.display())))
}

fn load_roots(path: &Path) -> Result<RootCertStore, ConfigError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| ConfigError::Tls(format!("bad CA certificate in {}: {}", path.display(), e)))?;
    }
    Ok(roots)
}

/// Server and client configs sharing one identity and one CA
pub fn load_tls_configs(tls: &TlsConfig) -> Result<(Arc<ServerConfig>, Arc<ClientConfig>), ConfigError> {
    tls.check_key_permissions()?;

    let roots = Arc::new(load_roots(&tls.ca_cert)?);
    let certs = load_certs(&tls.cert)?;
    let key = load_key(&tls.key)?;
    let provider = crypto_provider();
    let tls_err = |e: rustls::Error| ConfigError::Tls(e.to_string());

    let verifier = WebPkiClientVerifier::builder_with_provider(roots.clone(), provider.clone())
        .build()
        .map_err(|e| ConfigError::Tls(format!("failed to build client verifier: {}", e)))?;

    let server = ServerConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(tls_err)?
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs.clone(), key.clone_key())
        .map_err(tls_err)?;

    let client = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(tls_err)?
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .map_err(tls_err)?;

    info!("✓ TLS configs loaded (mTLS enabled)");
    Ok((Arc::new(server), Arc::new(client)))
}

/// Name the server certificate must carry: the explicit override, or the
/// host part of `addr`.
fn server_name_for(addr: &str, explicit: Option<&str>) -> Result<ServerName<'static>, ChannelError> {
    let host = match explicit {
        Some(name) => name,
        None => {
            let host = addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(addr);
            host.trim_start_matches('[').trim_end_matches(']')
        }
    };
    ServerName::try_from(host.to_string()).map_err(|e| ChannelError::Handshake {
        peer: addr.to_string(),
        reason: format!("invalid server name {:?}: {}", host, e),
    })
}

fn session_of(state: &CommonState) -> PeerSession {
    let certificates = state
        .peer_certificates()
        .map(|certs| certs.iter().map(|c| c.clone().into_owned()).collect())
        .unwrap_or_default();
    PeerSession::new(certificates).with_negotiated(
        state.protocol_version().map(|v| format!("{:?}", v)),
        state.negotiated_cipher_suite().map(|s| format!("{:?}", s.suite())),
    )
}

pub struct TlsChannelFactory {
    acceptor: TlsAcceptor,
    connector: TlsConnector,
    authenticator: Option<Arc<dyn PeerAuthenticator>>,
    handshake_timeout: Duration,
    tcp_nodelay: bool,
}

impl TlsChannelFactory {
    pub fn new(params: &InstanceParams, authenticators: &AuthenticatorRegistry) -> Result<Self, ConfigError> {
        let tls = params.net().tls.as_ref().ok_or_else(|| {
            ConfigError::Invalid("tls channel factory requires [channel.tls]".to_string())
        })?;
        let (server, client) = load_tls_configs(tls)?;

        let authenticator = match &tls.authenticator {
            Some(name) => {
                let auth_params = params.with_class_params(tls.authenticator_params.clone());
                Some(authenticators.build(name, &auth_params)?)
            }
            None => {
                warn!("no peer authenticator configured; TLS peers will not be trusted");
                None
            }
        };

        Ok(Self {
            acceptor: TlsAcceptor::from(server),
            connector: TlsConnector::from(client),
            authenticator,
            handshake_timeout: params.net().handshake_timeout(),
            tcp_nodelay: params.net().tcp_nodelay,
        })
    }

    pub fn construct(
        params: &InstanceParams,
        authenticators: &AuthenticatorRegistry,
    ) -> Result<Arc<dyn ChannelFactory>, ConfigError> {
        Ok(Arc::new(Self::new(params, authenticators)?))
    }

    /// Run the trust policy; a rejected peer gets its session shut down.
    async fn admit<S>(
        &self,
        mut stream: S,
        state: ChannelTrust,
        session: &PeerSession,
        peer: String,
    ) -> Result<ChannelTrust, ChannelError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let Some(authenticator) = &self.authenticator else {
            return Ok(state);
        };
        if authenticator.is_trusted(session) {
            debug!("peer {} trusted by {}", peer, authenticator.name());
            return Ok(ChannelTrust { trusted: true, ..state });
        }
        warn!("rejecting peer {}: not trusted by {}", peer, authenticator.name());
        shutdown_bounded(&mut stream, &peer, self.handshake_timeout).await;
        Err(ChannelError::Untrusted {
            peer,
            authenticator: authenticator.name().to_string(),
        })
    }
}

fn initial_trust(session: &PeerSession) -> ChannelTrust {
    ChannelTrust {
        secure: true,
        trusted: false,
        trust_capable: !session.certificates().is_empty(),
    }
}

#[async_trait]
impl ChannelFactory for TlsChannelFactory {
    fn name(&self) -> &'static str {
        "tls"
    }

    async fn accept_channel(&self, stream: TcpStream) -> Result<Arc<dyn DataChannel>, ChannelError> {
        stream.set_nodelay(self.tcp_nodelay)?;
        let peer_addr = stream.peer_addr().ok();
        let peer = peer_addr.map(|a| a.to_string()).unwrap_or_else(|| "unknown".to_string());

        let mut tls = with_timeout("TLS handshake", &peer, self.handshake_timeout, self.acceptor.accept(stream))
            .await?
            .map_err(|e| ChannelError::Handshake {
                peer: peer.clone(),
                reason: e.to_string(),
            })?;

        let session = session_of(tls.get_ref().1);
        let trust = initial_trust(&session);
        let trust = self.admit(&mut tls, trust, &session, peer).await?;
        Ok(Arc::new(StreamChannel::new(tls, trust, peer_addr, Some(session))))
    }

    async fn connect(&self, addr: &str, options: &ConnectOptions) -> Result<Arc<dyn DataChannel>, ChannelError> {
        let server_name = server_name_for(addr, options.server_name.as_deref())?;
        let stream = connect_tcp(addr, options).await?;
        let peer_addr = stream.peer_addr().ok();

        let mut tls = with_timeout(
            "TLS handshake",
            addr,
            options.handshake_timeout,
            self.connector.connect(server_name, stream),
        )
        .await?
        .map_err(|e| ChannelError::Handshake {
            peer: addr.to_string(),
            reason: e.to_string(),
        })?;

        let session = session_of(tls.get_ref().1);
        let trust = initial_trust(&session);
        let trust = self.admit(&mut tls, trust, &session, addr.to_string()).await?;
        Ok(Arc::new(StreamChannel::new(tls, trust, peer_addr, Some(session))))
    }
}
