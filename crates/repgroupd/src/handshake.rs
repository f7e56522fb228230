//! Membership handshake spoken on group-service channels.
//!
//! One request per line, one reply per line:
//!
//! ```text
//! JOIN <stream_version> <token_format> <node_hex>
//!                      ->  GROUP <format_version> <hex>
//!                      |   INCOMPATIBLE <peer_stream> <local_format> <reason>
//! STATUS               ->  STATUS <json>
//! anything else        ->  ERROR <code> <message>
//! ```
//!
//! `node_hex` is the joiner's own node record as one token at
//! `token_format`. The compatibility gate runs before the group is touched
//! and an incompatible peer is disconnected. A compatible joiner is added to
//! the group (or accepted back as an existing member) and receives the
//! snapshot that includes it.

use crate::channel::{ChannelError, DataChannel};
use crate::membership::{ActiveGuard, MembershipService, ServiceError};
use chrono::{DateTime, Utc};
use repgroup_shared::report::{GroupSummary, VersionReport};
use repgroup_shared::version::max_group_format_for;
use repgroup_shared::{
    CompatibilityGate, FormatError, FormatVersion, GroupMembership, IncompatibleVersion, MembershipError,
    NodeDescriptor,
};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Longest accepted line, delimiter included
pub const MAX_LINE: usize = 1 << 20;

#[derive(Error, Debug)]
pub enum HandshakeError {
    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("line exceeds the 1 MiB limit")]
    LineTooLong,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("peer {peer} is not trusted; group service requires trusted peers")]
    Untrusted { peer: String },

    #[error(transparent)]
    Incompatible(#[from] IncompatibleVersion),

    #[error("remote refused join: stream {peer_stream} vs group format {group_format} ({reason})")]
    Refused {
        peer_stream: u32,
        group_format: u16,
        reason: String,
    },

    #[error("remote error {code}: {message}")]
    Remote { code: String, message: String },

    #[error(transparent)]
    Format(#[from] FormatError),
}

/// Buffered line reader over a channel
pub struct LineReader {
    channel: Arc<dyn DataChannel>,
    buf: Vec<u8>,
}

impl LineReader {
    pub fn new(channel: Arc<dyn DataChannel>) -> Self {
        Self {
            channel,
            buf: Vec::new(),
        }
    }

    /// Next line without its terminator; `None` at a clean end of stream.
    pub async fn read_line(&mut self) -> Result<Option<String>, HandshakeError> {
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
                let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return String::from_utf8(line)
                    .map(Some)
                    .map_err(|_| HandshakeError::Protocol("line is not valid UTF-8".to_string()));
            }
            if self.buf.len() >= MAX_LINE {
                return Err(HandshakeError::LineTooLong);
            }

            let n = self.channel.read(&mut chunk).await?;
            if n == 0 {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(HandshakeError::Protocol("stream ended mid-line".to_string()));
            }
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }
}

pub async fn write_line(channel: &dyn DataChannel, line: &str) -> Result<(), HandshakeError> {
    let mut out = Vec::with_capacity(line.len() + 1);
    out.extend_from_slice(line.as_bytes());
    out.push(b'\n');
    channel.write_all(&out).await?;
    channel.flush().await?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Join {
        stream_version: u32,
        /// Format the node record is encoded at
        token_format: FormatVersion,
        node: NodeDescriptor,
    },
    Status,
}

fn field<'a>(parts: &mut impl Iterator<Item = &'a str>, what: &str) -> Result<&'a str, HandshakeError> {
    parts
        .next()
        .ok_or_else(|| HandshakeError::Protocol(format!("JOIN needs a {}", what)))
}

impl Request {
    /// Announce `node` at the newest format `stream_version` reads.
    pub fn join(stream_version: u32, node: NodeDescriptor) -> Result<Self, HandshakeError> {
        let token_format = max_group_format_for(stream_version).ok_or_else(|| {
            HandshakeError::Protocol(format!("stream version {} is unknown to this build", stream_version))
        })?;
        Ok(Request::Join {
            stream_version,
            token_format,
            node,
        })
    }

    pub fn parse(line: &str) -> Result<Self, HandshakeError> {
        let mut parts = line.split_whitespace();
        match parts.next() {
            Some("JOIN") => {
                let stream_version = field(&mut parts, "stream version")?
                    .parse::<u32>()
                    .map_err(|e| HandshakeError::Protocol(format!("bad stream version: {}", e)))?;
                let token_format = field(&mut parts, "token format")?
                    .parse::<u16>()
                    .map_err(|e| HandshakeError::Protocol(format!("bad token format: {}", e)))?;
                let token_format = FormatVersion::from_wire(token_format)?;
                let node = NodeDescriptor::from_token_hex(field(&mut parts, "node record")?, token_format)?;
                if parts.next().is_some() {
                    return Err(HandshakeError::Protocol("trailing JOIN arguments".to_string()));
                }
                Ok(Request::Join {
                    stream_version,
                    token_format,
                    node,
                })
            }
            Some("STATUS") => Ok(Request::Status),
            Some(other) => Err(HandshakeError::Protocol(format!("unknown request {}", other))),
            None => Err(HandshakeError::Protocol("empty request".to_string())),
        }
    }

    pub fn to_line(&self) -> Result<String, HandshakeError> {
        match self {
            Request::Join {
                stream_version,
                token_format,
                node,
            } => Ok(format!(
                "JOIN {} {} {}",
                stream_version,
                token_format,
                node.to_token_hex(*token_format)?
            )),
            Request::Status => Ok("STATUS".to_string()),
        }
    }
}

/// Body of a `STATUS` reply
#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub started_at: DateTime<Utc>,
    pub generated_at: DateTime<Utc>,
    pub versions: VersionReport,
    pub group: GroupSummary,
    pub active: Vec<String>,
}

/// Server side of the handshake
pub struct GroupService {
    membership: Arc<MembershipService>,
    require_trusted: bool,
    started_at: DateTime<Utc>,
}

impl GroupService {
    pub fn new(membership: Arc<MembershipService>, require_trusted: bool) -> Self {
        Self {
            membership,
            require_trusted,
            started_at: Utc::now(),
        }
    }

    pub fn membership(&self) -> &Arc<MembershipService> {
        &self.membership
    }

    pub fn status(&self) -> StatusReport {
        StatusReport {
            started_at: self.started_at,
            generated_at: Utc::now(),
            versions: VersionReport::current(),
            group: GroupSummary::of(&self.membership.snapshot()),
            active: self.membership.active_members(),
        }
    }

    /// Add a joining node, or accept an existing member back. A rejoin at a
    /// new address moves the member, which fails while another connection
    /// holds it active.
    fn register(&self, node: NodeDescriptor) -> Result<Arc<GroupMembership>, ServiceError> {
        let current = self.membership.snapshot();
        let Some(existing) = current.get(node.name()) else {
            return self.membership.add_node(node);
        };
        if existing.is_removed() {
            return Err(MembershipError::MemberNotFound {
                name: node.name().to_string(),
                group: current.name().to_string(),
            }
            .into());
        }
        if existing.node_type() != node.node_type() {
            return Err(MembershipError::TypeMismatch {
                name: node.name().to_string(),
                existing: existing.node_type(),
                requested: node.node_type(),
            }
            .into());
        }
        if existing.host() != node.host() || existing.port() != node.port() {
            return self.membership.update_address(node.name(), node.host(), node.port());
        }
        debug!("node {} rejoined group {}", node.name(), current.name());
        Ok(current)
    }

    /// Serve requests until the peer disconnects. The channel is closed on
    /// return.
    pub async fn serve(&self, channel: Arc<dyn DataChannel>) -> Result<(), HandshakeError> {
        let result = self.serve_requests(channel.clone()).await;
        channel.close().await?;
        result
    }

    async fn serve_requests(&self, channel: Arc<dyn DataChannel>) -> Result<(), HandshakeError> {
        let peer = channel
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|| "unknown".to_string());

        let mut lines = LineReader::new(channel.clone());
        // held while the connection is open
        let mut active: Option<ActiveGuard> = None;

        while let Some(line) = lines.read_line().await? {
            // answer the request so the peer sees why it is dropped
            if self.require_trusted && !channel.is_trusted() {
                warn!("refusing group service to untrusted peer {}", peer);
                write_line(&*channel, "ERROR untrusted peer is not trusted").await?;
                return Err(HandshakeError::Untrusted { peer });
            }

            let request = match Request::parse(&line) {
                Ok(request) => request,
                Err(e) => {
                    debug!("bad request from {}: {}", peer, e);
                    write_line(&*channel, &format!("ERROR bad_request {}", e)).await?;
                    continue;
                }
            };

            match request {
                Request::Join { stream_version, node, .. } => {
                    let gate = CompatibilityGate::new(self.membership.snapshot().format_version());
                    if let Err(e) = gate.check(stream_version) {
                        warn!("✗ Join from {} ({}) rejected: {}", node.name(), peer, e);
                        write_line(
                            &*channel,
                            &format!("INCOMPATIBLE {} {} {}", stream_version, e.format_version, e.reason),
                        )
                        .await?;
                        return Err(e.into());
                    }

                    let name = node.name().to_string();
                    let admitted = self.register(node).and_then(|group| {
                        if active.as_ref().map(|g| g.name()) != Some(name.as_str()) {
                            active = Some(self.membership.activate(&name)?);
                        }
                        Ok(group)
                    });
                    let group = match admitted {
                        Ok(group) => group,
                        Err(e) => {
                            warn!("✗ Join from {} ({}) refused: {}", name, peer, e);
                            write_line(&*channel, &format!("ERROR {} {}", e.code(), e)).await?;
                            continue;
                        }
                    };

                    let hex = group.to_hex()?;
                    info!(
                        "✓ Sent group {} (format {}, change {}) to {} at {}",
                        group.name(),
                        group.format_version(),
                        group.change_version(),
                        name,
                        peer
                    );
                    write_line(&*channel, &format!("GROUP {} {}", group.format_version(), hex)).await?;
                }
                Request::Status => {
                    let json = serde_json::to_string(&self.status())
                        .map_err(|e| HandshakeError::Protocol(e.to_string()))?;
                    write_line(&*channel, &format!("STATUS {}", json)).await?;
                }
            }
        }

        drop(active);
        Ok(())
    }
}

fn reply_parts(line: &str) -> (&str, &str) {
    line.split_once(' ').unwrap_or((line, ""))
}

fn remote_error(rest: &str) -> HandshakeError {
    let (code, message) = reply_parts(rest);
    HandshakeError::Remote {
        code: code.to_string(),
        message: message.to_string(),
    }
}

async fn expect_reply(lines: &mut LineReader) -> Result<String, HandshakeError> {
    lines
        .read_line()
        .await?
        .ok_or_else(|| HandshakeError::Protocol("connection closed before reply".to_string()))
}

/// The fields of an `INCOMPATIBLE` reply. Anything malformed is a protocol
/// error, never a guessed version.
fn parse_refusal(rest: &str) -> HandshakeError {
    let mut parts = rest.splitn(3, ' ');
    let fields = (
        parts.next().and_then(|s| s.parse::<u32>().ok()),
        parts.next().and_then(|s| s.parse::<u16>().ok()),
        parts.next().filter(|s| !s.trim().is_empty()),
    );
    match fields {
        (Some(peer_stream), Some(group_format), Some(reason)) => HandshakeError::Refused {
            peer_stream,
            group_format,
            reason: reason.to_string(),
        },
        _ => HandshakeError::Protocol(format!("malformed INCOMPATIBLE reply: {:?}", rest)),
    }
}

/// Client side: announce `node` with `stream_version` and decode the group
/// the server sends back. The server assigns the node's id; the returned
/// group always lists `node`.
pub async fn request_group(
    channel: Arc<dyn DataChannel>,
    stream_version: u32,
    node: &NodeDescriptor,
) -> Result<GroupMembership, HandshakeError> {
    let request = Request::join(stream_version, node.clone())?;
    send_join(channel, &request).await
}

/// Send an already built JOIN and read the reply.
pub async fn send_join(channel: Arc<dyn DataChannel>, request: &Request) -> Result<GroupMembership, HandshakeError> {
    let Request::Join { node, .. } = request else {
        return Err(HandshakeError::Protocol("not a JOIN request".to_string()));
    };
    write_line(&*channel, &request.to_line()?).await?;

    let mut lines = LineReader::new(channel);
    let reply = expect_reply(&mut lines).await?;
    let (kind, rest) = reply_parts(&reply);
    match kind {
        "GROUP" => {
            let (format, hex) = reply_parts(rest);
            let format = format
                .parse::<u16>()
                .map_err(|e| HandshakeError::Protocol(format!("bad format version: {}", e)))
                .and_then(|v| FormatVersion::from_wire(v).map_err(HandshakeError::from))?;
            let group = GroupMembership::deserialize_hex(hex, format)?;
            if group.get(node.name()).is_none() {
                return Err(HandshakeError::Protocol(format!(
                    "group {} does not list {}",
                    group.name(),
                    node.name()
                )));
            }
            Ok(group)
        }
        "INCOMPATIBLE" => Err(parse_refusal(rest)),
        "ERROR" => Err(remote_error(rest)),
        other => Err(HandshakeError::Protocol(format!("unexpected reply {}", other))),
    }
}

/// Client side: fetch the server's status report as JSON.
pub async fn request_status(channel: Arc<dyn DataChannel>) -> Result<serde_json::Value, HandshakeError> {
    write_line(&*channel, &Request::Status.to_line()?).await?;
    let mut lines = LineReader::new(channel);
    let reply = expect_reply(&mut lines).await?;
    match reply_parts(&reply) {
        ("STATUS", json) => serde_json::from_str(json)
            .map_err(|e| HandshakeError::Protocol(format!("bad status body: {}", e))),
        ("ERROR", rest) => Err(remote_error(rest)),
        (other, _) => Err(HandshakeError::Protocol(format!("unexpected reply {}", other))),
    }
}
