//! Node taxonomy and node descriptors.

use crate::error::FormatError;
use crate::version::FormatVersion;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Kind of group member. Adding a variant requires a new format version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    /// Full member, votes and may become master
    Electable,
    /// Observes group changes, holds no data
    Monitor,
    /// Replicates data, never votes
    Secondary,
}

impl NodeType {
    pub fn is_electable(self) -> bool {
        matches!(self, NodeType::Electable)
    }

    pub fn is_monitor(self) -> bool {
        matches!(self, NodeType::Monitor)
    }

    pub fn is_secondary(self) -> bool {
        matches!(self, NodeType::Secondary)
    }

    pub fn is_data_node(self) -> bool {
        matches!(self, NodeType::Electable | NodeType::Secondary)
    }

    /// Oldest format version able to encode this type
    pub fn min_format_version(self) -> FormatVersion {
        match self {
            NodeType::Electable | NodeType::Monitor => FormatVersion::MIN,
            NodeType::Secondary => FormatVersion::SECONDARY_SUPPORT,
        }
    }

    pub(crate) fn wire_code(self) -> u8 {
        match self {
            NodeType::Electable => 0,
            NodeType::Monitor => 1,
            NodeType::Secondary => 2,
        }
    }

    pub(crate) fn from_wire_code(code: u8, version: FormatVersion) -> Result<Self, FormatError> {
        let node_type = match code {
            0 => NodeType::Electable,
            1 => NodeType::Monitor,
            2 => NodeType::Secondary,
            _ => {
                return Err(FormatError::UnknownNodeType {
                    code,
                    version: version.as_u16(),
                })
            }
        };
        if node_type.min_format_version() > version {
            return Err(FormatError::SecondaryNotSupported {
                version: version.as_u16(),
                count: 1,
            });
        }
        Ok(node_type)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeType::Electable => "electable",
            NodeType::Monitor => "monitor",
            NodeType::Secondary => "secondary",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str().to_uppercase())
    }
}

impl FromStr for NodeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "electable" => Ok(NodeType::Electable),
            "monitor" => Ok(NodeType::Monitor),
            "secondary" => Ok(NodeType::Secondary),
            other => Err(format!("unknown node type: {}", other)),
        }
    }
}

/// Numeric node id, unique within a group and never reused
pub type NodeId = u32;

/// One member of a replication group.
///
/// Descriptors are immutable once they are part of a published group
/// snapshot; edits happen on the owning group's working copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub(crate) name: String,
    pub(crate) id: NodeId,
    pub(crate) node_type: NodeType,
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) software_version: Option<String>,
    pub(crate) removed: bool,
    pub(crate) change_version: u32,
}

impl NodeDescriptor {
    /// Descriptor for a node that is about to join. The group assigns the id
    /// and change version when the node is added.
    pub fn new(name: impl Into<String>, node_type: NodeType, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            id: 0,
            node_type,
            host: host.into(),
            port,
            software_version: None,
            removed: false,
            change_version: 0,
        }
    }

    pub fn with_software_version(mut self, version: impl Into<String>) -> Self {
        self.software_version = Some(version.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn node_type(&self) -> NodeType {
        self.node_type
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// `host:port` as peers dial it
    pub fn socket_address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn software_version(&self) -> Option<&str> {
        self.software_version.as_deref()
    }

    pub fn is_removed(&self) -> bool {
        self.removed
    }

    pub fn change_version(&self) -> u32 {
        self.change_version
    }

    pub fn is_electable(&self) -> bool {
        self.node_type.is_electable()
    }

    pub fn is_monitor(&self) -> bool {
        self.node_type.is_monitor()
    }

    pub fn is_secondary(&self) -> bool {
        self.node_type.is_secondary()
    }

    pub fn is_data_node(&self) -> bool {
        self.node_type.is_data_node()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exactly_one_base_predicate() {
        for t in [NodeType::Electable, NodeType::Monitor, NodeType::Secondary] {
            let count = [t.is_electable(), t.is_monitor(), t.is_secondary()]
                .iter()
                .filter(|b| **b)
                .count();
            assert_eq!(count, 1, "{t}");
        }
    }

    #[test]
    fn test_data_nodes() {
        assert!(NodeType::Electable.is_data_node());
        assert!(NodeType::Secondary.is_data_node());
        assert!(!NodeType::Monitor.is_data_node());
    }

    #[test]
    fn test_secondary_code_gated_by_version() {
        assert_eq!(
            NodeType::from_wire_code(2, FormatVersion::V3),
            Ok(NodeType::Secondary)
        );
        assert!(matches!(
            NodeType::from_wire_code(2, FormatVersion::V2),
            Err(FormatError::SecondaryNotSupported { version: 2, .. })
        ));
        assert!(matches!(
            NodeType::from_wire_code(7, FormatVersion::V3),
            Err(FormatError::UnknownNodeType { code: 7, .. })
        ));
    }

    #[test]
    fn test_parse_node_type() {
        assert_eq!("Monitor".parse::<NodeType>(), Ok(NodeType::Monitor));
        assert!("arbiter".parse::<NodeType>().is_err());
        assert_eq!(NodeType::Secondary.to_string(), "SECONDARY");
    }

    #[test]
    fn test_socket_address_ipv6() {
        let n = NodeDescriptor::new("n1", NodeType::Electable, "::1", 5001);
        assert_eq!(n.socket_address(), "[::1]:5001");
        let n = NodeDescriptor::new("n2", NodeType::Electable, "db2.example", 5001);
        assert_eq!(n.socket_address(), "db2.example:5001");
    }
}
