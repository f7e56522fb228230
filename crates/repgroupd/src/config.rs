//! Configuration management for repgroupd.
//!
//! Loads settings from /etc/repgroup/repgroupd.toml or a path given on the
//! command line. Every section has defaults except `[node]`.

use crate::error::ConfigError;
use repgroup_shared::version::{MAX_STREAM_VERSION, MIN_STREAM_VERSION};
use repgroup_shared::{CompatibilityGate, FormatVersion, NodeType};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Config file path
pub const CONFIG_PATH: &str = "/etc/repgroup/repgroupd.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,

    #[serde(default)]
    pub membership: MembershipConfig,

    #[serde(default)]
    pub channel: ChannelConfig,
}

/// Identity of the local node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: String,

    /// Replication group this node belongs to
    pub group: String,

    #[serde(default = "default_node_type")]
    pub node_type: NodeType,

    #[serde(default = "default_listen")]
    pub listen: SocketAddr,

    /// Host peers use to reach this node; the listen address when unset
    #[serde(default)]
    pub advertise_host: Option<String>,

    /// Existing members asked for the group when none is stored locally
    #[serde(default)]
    pub helpers: Vec<String>,

    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_node_type() -> NodeType {
    NodeType::Electable
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 5001))
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/repgroup")
}

impl NodeConfig {
    pub fn advertise_host(&self) -> String {
        match &self.advertise_host {
            Some(host) => host.clone(),
            None if self.listen.ip().is_unspecified() => "localhost".to_string(),
            None => self.listen.ip().to_string(),
        }
    }
}

/// Group encoding and replication protocol versions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipConfig {
    /// Format version used when writing the group
    #[serde(default = "default_format_version")]
    pub format_version: FormatVersion,

    /// Stream protocol version this node speaks
    #[serde(default = "default_stream_version")]
    pub stream_version: u32,

    /// Refuse group service to peers whose channel is not trusted
    #[serde(default)]
    pub require_trusted_peers: bool,
}

fn default_format_version() -> FormatVersion {
    FormatVersion::MAX
}

fn default_stream_version() -> u32 {
    MAX_STREAM_VERSION
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            format_version: default_format_version(),
            stream_version: default_stream_version(),
            require_trusted_peers: false,
        }
    }
}

/// Channel factory selection and connect-time options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Registry key of the channel factory
    #[serde(default = "default_factory")]
    pub factory: String,

    /// Free-form parameters handed to the factory
    #[serde(default)]
    pub factory_params: Option<String>,

    #[serde(default = "default_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_timeout_ms")]
    pub handshake_timeout_ms: u64,

    #[serde(default = "default_tcp_nodelay")]
    pub tcp_nodelay: bool,

    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

fn default_factory() -> String {
    "plain".to_string()
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_tcp_nodelay() -> bool {
    true
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            factory: default_factory(),
            factory_params: None,
            connect_timeout_ms: default_timeout_ms(),
            handshake_timeout_ms: default_timeout_ms(),
            tcp_nodelay: default_tcp_nodelay(),
            tls: None,
        }
    }
}

impl ChannelConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Identity and trust material for the TLS factory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// CA used to verify peers in both directions
    pub ca_cert: PathBuf,
    /// This node's certificate chain, presented as server and as client
    pub cert: PathBuf,
    /// Private key for `cert`
    pub key: PathBuf,
    /// Name verified against the server certificate on outbound connections
    #[serde(default)]
    pub server_name: Option<String>,
    /// Registry key of the peer authenticator; no trust policy when unset
    #[serde(default)]
    pub authenticator: Option<String>,
    #[serde(default)]
    pub authenticator_params: Option<String>,
}

impl TlsConfig {
    /// The key must not be readable by group or others.
    #[cfg(unix)]
    pub fn check_key_permissions(&self) -> Result<(), ConfigError> {
        use std::os::unix::fs::PermissionsExt;

        let metadata = fs::metadata(&self.key).map_err(|e| ConfigError::io(&self.key, e))?;
        let mode = metadata.permissions().mode() & 0o777;
        if mode & 0o077 != 0 {
            return Err(ConfigError::Tls(format!(
                "private key has insecure permissions {:o} (must be 0600 or stricter): {}",
                mode,
                self.key.display()
            )));
        }
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn check_key_permissions(&self) -> Result<(), ConfigError> {
        Ok(())
    }
}

impl Config {
    /// Load from the default path
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path(Path::new(CONFIG_PATH))
    }

    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::io(path, e))?;
        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        config.validate()?;
        info!("✓ Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.node.name.trim().is_empty() {
            return Err(ConfigError::Invalid("node.name must not be empty".to_string()));
        }
        if self.node.group.trim().is_empty() {
            return Err(ConfigError::Invalid("node.group must not be empty".to_string()));
        }

        let format = self.membership.format_version;
        if self.node.node_type.min_format_version() > format {
            return Err(ConfigError::Invalid(format!(
                "node type {} requires format version {} or later, configured {}",
                self.node.node_type,
                self.node.node_type.min_format_version(),
                format
            )));
        }

        let stream = self.membership.stream_version;
        if !(MIN_STREAM_VERSION..=MAX_STREAM_VERSION).contains(&stream) {
            return Err(ConfigError::Invalid(format!(
                "stream_version {} is outside [{}, {}]",
                stream, MIN_STREAM_VERSION, MAX_STREAM_VERSION
            )));
        }
        // the local node must be able to read its own group
        CompatibilityGate::new(format)
            .check(stream)
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;

        if self.channel.connect_timeout_ms == 0 || self.channel.handshake_timeout_ms == 0 {
            return Err(ConfigError::Invalid("channel timeouts must be non-zero".to_string()));
        }
        if self.channel.factory == "tls" && self.channel.tls.is_none() {
            return Err(ConfigError::Invalid(
                "channel.factory = \"tls\" requires a [channel.tls] section".to_string(),
            ));
        }
        if self.channel.factory == "plain" && self.membership.require_trusted_peers {
            warn!("require_trusted_peers is set but plaintext channels are never trusted");
        }
        Ok(())
    }
}
