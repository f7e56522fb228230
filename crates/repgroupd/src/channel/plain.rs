//! Plaintext passthrough factory.

use super::factory::{connect_tcp, ChannelFactory, ConnectOptions};
use super::{ChannelError, ChannelTrust, DataChannel, StreamChannel};
use crate::auth::AuthenticatorRegistry;
use crate::error::ConfigError;
use crate::params::InstanceParams;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, warn};

pub struct PlainChannelFactory {
    tcp_nodelay: bool,
}

impl PlainChannelFactory {
    pub fn new(params: &InstanceParams) -> Self {
        if let Some(extra) = params.class_params() {
            warn!("plain channel factory ignores parameters: {}", extra);
        }
        Self {
            tcp_nodelay: params.net().tcp_nodelay,
        }
    }

    pub fn construct(
        params: &InstanceParams,
        _authenticators: &AuthenticatorRegistry,
    ) -> Result<Arc<dyn ChannelFactory>, ConfigError> {
        Ok(Arc::new(Self::new(params)))
    }

    fn wrap(stream: TcpStream) -> Arc<dyn DataChannel> {
        let peer = stream.peer_addr().ok();
        Arc::new(StreamChannel::new(stream, ChannelTrust::PLAINTEXT, peer, None))
    }
}

#[async_trait]
impl ChannelFactory for PlainChannelFactory {
    fn name(&self) -> &'static str {
        "plain"
    }

    async fn accept_channel(&self, stream: TcpStream) -> Result<Arc<dyn DataChannel>, ChannelError> {
        stream.set_nodelay(self.tcp_nodelay)?;
        debug!("accepted plaintext channel from {:?}", stream.peer_addr().ok());
        Ok(Self::wrap(stream))
    }

    async fn connect(&self, addr: &str, options: &ConnectOptions) -> Result<Arc<dyn DataChannel>, ChannelError> {
        let stream = connect_tcp(addr, options).await?;
        debug!("opened plaintext channel to {}", addr);
        Ok(Self::wrap(stream))
    }
}
