//! Channel factories and the registry that selects one by name.

use super::{ChannelError, DataChannel};
use crate::auth::AuthenticatorRegistry;
use crate::config::ChannelConfig;
use crate::error::ConfigError;
use crate::params::InstanceParams;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info};

/// Connect-time options controlled by the factory, not the caller's socket
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub tcp_nodelay: bool,
    /// Overrides the name the server certificate is verified against
    pub server_name: Option<String>,
}

impl ConnectOptions {
    pub fn from_config(config: &ChannelConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            handshake_timeout: config.handshake_timeout(),
            tcp_nodelay: config.tcp_nodelay,
            server_name: config.tls.as_ref().and_then(|tls| tls.server_name.clone()),
        }
    }
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self::from_config(&ChannelConfig::default())
    }
}

/// Builds channels for accepted sockets and for outbound connections.
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    /// Registry key
    fn name(&self) -> &'static str;

    /// Wrap a socket already accepted by the listener, running any
    /// handshake the variant requires.
    async fn accept_channel(&self, stream: TcpStream) -> Result<Arc<dyn DataChannel>, ChannelError>;

    /// Open `addr` (`host:port`) and wrap it.
    async fn connect(&self, addr: &str, options: &ConnectOptions) -> Result<Arc<dyn DataChannel>, ChannelError>;
}

/// Open a TCP connection within `options.connect_timeout`.
pub(crate) async fn connect_tcp(addr: &str, options: &ConnectOptions) -> Result<TcpStream, ChannelError> {
    let stream = with_timeout("connect", addr, options.connect_timeout, TcpStream::connect(addr))
        .await?
        .map_err(|source| ChannelError::Connect {
            addr: addr.to_string(),
            source,
        })?;
    stream.set_nodelay(options.tcp_nodelay)?;
    Ok(stream)
}

pub(crate) async fn with_timeout<F: Future>(
    operation: &'static str,
    peer: &str,
    timeout: Duration,
    future: F,
) -> Result<F::Output, ChannelError> {
    tokio::time::timeout(timeout, future)
        .await
        .map_err(|_| ChannelError::Timeout {
            operation,
            peer: peer.to_string(),
            timeout,
        })
}

/// Orderly write shutdown, abandoned after `timeout` so a peer that stops
/// reading cannot hold the caller.
pub(crate) async fn shutdown_bounded<S>(stream: &mut S, peer: &str, timeout: Duration)
where
    S: AsyncWrite + Unpin + ?Sized,
{
    match with_timeout("shutdown", peer, timeout, stream.shutdown()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("shutdown to {} failed: {}", peer, e),
        Err(e) => debug!("{}", e),
    }
}

pub type FactoryConstructor =
    fn(&InstanceParams, &AuthenticatorRegistry) -> Result<Arc<dyn ChannelFactory>, ConfigError>;

/// Name -> constructor map. Selecting a factory is a configuration lookup,
/// never a code change at the call site.
#[derive(Clone)]
pub struct FactoryRegistry {
    constructors: BTreeMap<String, FactoryConstructor>,
    authenticators: AuthenticatorRegistry,
}

impl FactoryRegistry {
    pub fn empty(authenticators: AuthenticatorRegistry) -> Self {
        Self {
            constructors: BTreeMap::new(),
            authenticators,
        }
    }

    /// `plain` and `tls`, with the built-in authenticators
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty(AuthenticatorRegistry::with_builtins());
        registry.register("plain", super::plain::PlainChannelFactory::construct);
        registry.register("tls", super::tls::TlsChannelFactory::construct);
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, constructor: FactoryConstructor) {
        self.constructors.insert(name.into(), constructor);
    }

    pub fn names(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }

    pub fn authenticators(&self) -> &AuthenticatorRegistry {
        &self.authenticators
    }

    pub fn build(&self, name: &str, params: &InstanceParams) -> Result<Arc<dyn ChannelFactory>, ConfigError> {
        let constructor = self
            .constructors
            .get(name)
            .ok_or_else(|| ConfigError::UnknownImplementation {
                kind: "channel factory",
                name: name.to_string(),
                available: self.names().join(", "),
            })?;
        let factory = constructor(params, &self.authenticators)?;
        info!("✓ Channel factory {} ready for {}", name, params.purpose());
        Ok(factory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{ChannelPurpose, InstanceContext};
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// A peer that never drains anything
    struct Stalled;

    impl AsyncWrite for Stalled {
        fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, _: &[u8]) -> Poll<io::Result<usize>> {
            Poll::Pending
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Pending
        }

        fn poll_shutdown(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Pending
        }
    }

    #[tokio::test]
    async fn test_shutdown_gives_up_on_stalled_peer() {
        let mut stalled = Stalled;
        let bounded = shutdown_bounded(&mut stalled, "127.0.0.1:1", Duration::from_millis(50));
        tokio::time::timeout(Duration::from_secs(2), bounded)
            .await
            .expect("shutdown ignored its timeout");
    }

    fn params() -> InstanceParams {
        InstanceParams::new(
            InstanceContext::new(ChannelPurpose::GroupService, Arc::new(ChannelConfig::default())),
            None,
        )
    }

    #[test]
    fn test_builtin_names() {
        let registry = FactoryRegistry::with_builtins();
        assert_eq!(registry.names(), vec!["plain", "tls"]);
        assert_eq!(registry.build("plain", &params()).unwrap().name(), "plain");
    }

    #[test]
    fn test_unknown_factory_is_config_error() {
        let registry = FactoryRegistry::with_builtins();
        let err = registry.build("quic", &params()).err().unwrap();
        assert!(matches!(err, ConfigError::UnknownImplementation { .. }));
        assert!(err.to_string().contains("plain, tls"));
    }

    #[test]
    fn test_tls_without_material_is_config_error() {
        let registry = FactoryRegistry::with_builtins();
        let err = registry.build("tls", &params()).err().unwrap();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[tokio::test]
    async fn test_connect_refused_is_retryable() {
        // bind then drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = connect_tcp(&addr, &ConnectOptions::default()).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(err, ChannelError::Connect { .. }));
    }
}
