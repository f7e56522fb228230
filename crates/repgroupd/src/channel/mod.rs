//! Uniform byte-stream channels between group members.
//!
//! A `DataChannel` owns exactly one transport connection. Callers read,
//! write, flush and close through it and may inspect connection attributes,
//! but never reach the transport directly. Trust is fixed when the channel
//! is created: a channel that loses trust is closed, not downgraded.

pub mod factory;
pub mod plain;
pub mod stream;
pub mod tls;

pub use factory::{ChannelFactory, ConnectOptions, FactoryRegistry};
pub use stream::StreamChannel;

use crate::auth::dn::{self, DnError};
use async_trait::async_trait;
use rustls::pki_types::CertificateDer;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("{operation} with {peer} timed out after {timeout:?}")]
    Timeout {
        operation: &'static str,
        peer: String,
        timeout: Duration,
    },

    #[error("secure transport handshake with {peer} failed: {reason}")]
    Handshake { peer: String, reason: String },

    #[error("peer {peer} rejected by the {authenticator} trust policy")]
    Untrusted { peer: String, authenticator: String },

    #[error("channel closed")]
    Closed,

    #[error("transport error: {0}")]
    Io(#[from] io::Error),
}

impl ChannelError {
    /// Only connection establishment failures and timeouts may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ChannelError::Connect { .. } | ChannelError::Timeout { .. })
    }

    pub fn code(&self) -> &'static str {
        match self {
            ChannelError::Connect { .. } => "connect_failed",
            ChannelError::Timeout { .. } => "timeout",
            ChannelError::Handshake { .. } => "handshake_failed",
            ChannelError::Untrusted { .. } => "untrusted",
            ChannelError::Closed => "closed",
            ChannelError::Io(_) => "io",
        }
    }
}

/// Trust state established at handshake time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelTrust {
    /// Transport is encrypted
    pub secure: bool,
    /// Peer authenticated as an internal group member
    pub trusted: bool,
    /// Peer presented credentials that authentication could be run against
    pub trust_capable: bool,
}

impl ChannelTrust {
    /// Plaintext channels need no handshake, so they count as trust-capable.
    pub const PLAINTEXT: ChannelTrust = ChannelTrust {
        secure: false,
        trusted: false,
        trust_capable: true,
    };
}

/// What a completed secure handshake tells us about the peer
#[derive(Debug, Clone)]
pub struct PeerSession {
    certificates: Vec<CertificateDer<'static>>,
    protocol: Option<String>,
    cipher_suite: Option<String>,
}

impl PeerSession {
    pub fn new(certificates: Vec<CertificateDer<'static>>) -> Self {
        Self {
            certificates,
            protocol: None,
            cipher_suite: None,
        }
    }

    pub fn with_negotiated(mut self, protocol: Option<String>, cipher_suite: Option<String>) -> Self {
        self.protocol = protocol;
        self.cipher_suite = cipher_suite;
        self
    }

    /// Peer chain, leaf first
    pub fn certificates(&self) -> &[CertificateDer<'static>] {
        &self.certificates
    }

    pub fn leaf_certificate(&self) -> Option<&CertificateDer<'static>> {
        self.certificates.first()
    }

    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    pub fn cipher_suite(&self) -> Option<&str> {
        self.cipher_suite.as_deref()
    }

    /// RFC 2253 subject of the leaf certificate
    pub fn subject_dn(&self) -> Result<String, DnError> {
        let leaf = self
            .leaf_certificate()
            .ok_or_else(|| DnError::new("peer presented no certificate"))?;
        dn::subject_dn(leaf.as_ref())
    }
}

/// A byte stream with fixed trust attributes.
///
/// All methods take `&self`: `close` may be called from one task while
/// another is blocked in `read` or `write`, and the blocked call then fails
/// with `ChannelError::Closed`.
#[async_trait]
pub trait DataChannel: Send + Sync {
    /// Read into `buf`. `Ok(0)` means the peer closed its side.
    async fn read(&self, buf: &mut [u8]) -> Result<usize, ChannelError>;

    async fn write(&self, buf: &[u8]) -> Result<usize, ChannelError>;

    /// `Ok(true)` once buffered bytes have reached the transport,
    /// `Ok(false)` if the channel was closed first.
    async fn flush(&self) -> Result<bool, ChannelError>;

    /// Idempotent. Closes the underlying transport.
    async fn close(&self) -> Result<(), ChannelError>;

    fn is_open(&self) -> bool;

    fn trust(&self) -> ChannelTrust;

    fn is_secure(&self) -> bool {
        self.trust().secure
    }

    fn is_trusted(&self) -> bool {
        self.trust().trusted
    }

    fn is_trust_capable(&self) -> bool {
        self.trust().trust_capable
    }

    fn peer_addr(&self) -> Option<SocketAddr>;

    /// Certificate details of a secure peer
    fn peer_session(&self) -> Option<&PeerSession>;

    async fn write_all(&self, mut buf: &[u8]) -> Result<(), ChannelError> {
        while !buf.is_empty() {
            let n = self.write(buf).await?;
            if n == 0 {
                return Err(ChannelError::Io(io::ErrorKind::WriteZero.into()));
            }
            buf = &buf[n..];
        }
        Ok(())
    }
}
