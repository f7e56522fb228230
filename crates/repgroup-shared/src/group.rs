//! Group membership snapshots and their versioned token encoding.
//!
//! A `GroupMembership` is a value: edits happen on a private copy and the
//! result is published as a new snapshot. The encoding is one header token
//! followed by one token per node, so a group of `n` nodes always encodes
//! to `n + 1` tokens regardless of format version.

use crate::error::{FormatError, MembershipError};
use crate::node::{NodeDescriptor, NodeId, NodeType};
use crate::token::{self, TokenReader, TokenWriter};
use crate::version::FormatVersion;
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupMembership {
    name: String,
    uuid: Uuid,
    format_version: FormatVersion,
    /// Incremented on every edit
    change_version: u32,
    /// Last node id handed out
    node_id_sequence: u32,
    /// Keyed by node name; iteration order is the wire order
    nodes: BTreeMap<String, NodeDescriptor>,
}

impl GroupMembership {
    /// Empty group with a fresh identity
    pub fn new(name: impl Into<String>, format_version: FormatVersion) -> Self {
        Self::with_uuid(name, Uuid::new_v4(), format_version)
    }

    pub fn with_uuid(name: impl Into<String>, uuid: Uuid, format_version: FormatVersion) -> Self {
        Self {
            name: name.into(),
            uuid,
            format_version,
            change_version: 0,
            node_id_sequence: 0,
            nodes: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn format_version(&self) -> FormatVersion {
        self.format_version
    }

    pub fn change_version(&self) -> u32 {
        self.change_version
    }

    pub fn node_id_sequence(&self) -> u32 {
        self.node_id_sequence
    }

    /// Number of node records, removed nodes included
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Tokens produced by serializing this group at any version
    pub fn token_count(&self) -> usize {
        1 + self.nodes.len()
    }

    pub fn get(&self, name: &str) -> Option<&NodeDescriptor> {
        self.nodes.get(name)
    }

    pub fn node(&self, name: &str) -> Result<&NodeDescriptor, MembershipError> {
        self.nodes.get(name).ok_or_else(|| not_found(&self.name, name))
    }

    pub fn node_by_id(&self, id: NodeId) -> Option<&NodeDescriptor> {
        self.nodes.values().find(|n| n.id == id)
    }

    /// Every node record, including removed ones
    pub fn nodes(&self) -> impl Iterator<Item = &NodeDescriptor> {
        self.nodes.values()
    }

    /// Current (not removed) members
    pub fn members(&self) -> impl Iterator<Item = &NodeDescriptor> {
        self.nodes.values().filter(|n| !n.removed)
    }

    pub fn electable_nodes(&self) -> impl Iterator<Item = &NodeDescriptor> {
        self.members().filter(|n| n.is_electable())
    }

    pub fn monitor_nodes(&self) -> impl Iterator<Item = &NodeDescriptor> {
        self.members().filter(|n| n.is_monitor())
    }

    pub fn secondary_nodes(&self) -> impl Iterator<Item = &NodeDescriptor> {
        self.members().filter(|n| n.is_secondary())
    }

    pub fn data_nodes(&self) -> impl Iterator<Item = &NodeDescriptor> {
        self.members().filter(|n| n.is_data_node())
    }

    /// Secondary records of any state; removed secondaries still need a
    /// format that can encode them.
    fn secondary_records(&self) -> usize {
        self.nodes.values().filter(|n| n.is_secondary()).count()
    }

    /// Add a new member. The group assigns the node id and change version.
    /// Names of removed members stay reserved.
    pub fn add_node(&mut self, mut node: NodeDescriptor) -> Result<&NodeDescriptor, MembershipError> {
        if self.nodes.contains_key(&node.name) {
            return Err(MembershipError::DuplicateMember {
                name: node.name,
                group: self.name.clone(),
            });
        }
        if node.node_type.min_format_version() > self.format_version {
            return Err(FormatError::SecondaryNotSupported {
                version: self.format_version.as_u16(),
                count: self.secondary_records() + 1,
            }
            .into());
        }

        self.change_version += 1;
        self.node_id_sequence += 1;
        node.id = self.node_id_sequence;
        node.change_version = self.change_version;
        node.removed = false;
        if !self.format_version.supports_software_version() {
            node.software_version = None;
        }

        let name = node.name.clone();
        Ok(self.nodes.entry(name).or_insert(node))
    }

    /// Mark a member removed. The record is kept so the name and id are
    /// never reused.
    pub fn remove_node(&mut self, name: &str) -> Result<(), MembershipError> {
        let change_version = self.change_version + 1;
        match self.nodes.get_mut(name) {
            Some(node) if !node.removed => {
                node.removed = true;
                node.change_version = change_version;
                self.change_version = change_version;
                Ok(())
            }
            _ => Err(not_found(&self.name, name)),
        }
    }

    /// Purge a node record entirely. Callers are responsible for checking
    /// that the node is not active.
    pub fn delete_node(&mut self, name: &str) -> Result<NodeDescriptor, MembershipError> {
        match self.nodes.remove(name) {
            Some(node) => {
                self.change_version += 1;
                Ok(node)
            }
            None => Err(not_found(&self.name, name)),
        }
    }

    /// Move a member to a new address. Callers are responsible for checking
    /// that the node is not active.
    pub fn update_address(&mut self, name: &str, host: impl Into<String>, port: u16) -> Result<(), MembershipError> {
        let change_version = self.change_version + 1;
        match self.nodes.get_mut(name) {
            Some(node) if !node.removed => {
                node.host = host.into();
                node.port = port;
                node.change_version = change_version;
                self.change_version = change_version;
                Ok(())
            }
            _ => Err(not_found(&self.name, name)),
        }
    }

    /// Check that every record can be written at `version`.
    pub fn validate_for_version(&self, version: FormatVersion) -> Result<(), FormatError> {
        if !version.supports_secondary() {
            let count = self.secondary_records();
            if count > 0 {
                return Err(FormatError::SecondaryNotSupported {
                    version: version.as_u16(),
                    count,
                });
            }
        }
        Ok(())
    }

    /// The same group declared at another format version. Fields the target
    /// version cannot carry are cleared; secondaries are never dropped.
    pub fn with_format_version(&self, version: FormatVersion) -> Result<Self, FormatError> {
        self.validate_for_version(version)?;
        let mut group = self.clone();
        group.format_version = version;
        if !version.supports_software_version() {
            for node in group.nodes.values_mut() {
                node.software_version = None;
            }
        }
        Ok(group)
    }

    /// Encode at `version` into raw (not yet hex-encoded) tokens.
    pub fn serialize_tokens(&self, version: FormatVersion) -> Result<Vec<Vec<u8>>, FormatError> {
        self.validate_for_version(version)?;

        let node_count = u32::try_from(self.nodes.len())
            .map_err(|_| FormatError::Corrupt("too many nodes".to_string()))?;

        let mut tokens = Vec::with_capacity(self.token_count());

        let mut header = TokenWriter::new();
        header.put_u16(version.as_u16());
        header.put_str(&self.name)?;
        header
            .put_bytes(self.uuid.as_bytes())
            .put_u32(self.change_version)
            .put_u32(self.node_id_sequence)
            .put_u32(node_count);
        tokens.push(header.finish());

        for node in self.nodes.values() {
            tokens.push(encode_node(node, version)?);
        }

        Ok(tokens)
    }

    /// Encode at `version` into the delimited hex stream.
    pub fn serialize_hex(&self, version: FormatVersion) -> Result<String, FormatError> {
        Ok(token::encode_stream(&self.serialize_tokens(version)?))
    }

    /// Encode at the group's own format version.
    pub fn to_hex(&self) -> Result<String, FormatError> {
        self.serialize_hex(self.format_version)
    }

    /// Decode a stream and declare the result at `target`. The stream's own
    /// version comes from its header and must be supported.
    pub fn deserialize_hex(stream: &str, target: FormatVersion) -> Result<Self, FormatError> {
        let tokens = token::decode_stream(stream)?;
        let group = Self::deserialize_tokens(&tokens)?;
        if group.format_version == target {
            return Ok(group);
        }
        group.with_format_version(target)
    }

    /// Decode a stream at the version declared in its header.
    pub fn from_hex(stream: &str) -> Result<Self, FormatError> {
        let tokens = token::decode_stream(stream)?;
        Self::deserialize_tokens(&tokens)
    }

    /// Format version declared by a stream's header, without decoding nodes.
    pub fn stream_format_version(stream: &str) -> Result<FormatVersion, FormatError> {
        let header = stream
            .split(token::TOKEN_DELIMITER)
            .next()
            .unwrap_or_default();
        let tokens = token::decode_stream(header)?;
        let mut reader = TokenReader::new(&tokens[0], 0);
        FormatVersion::from_wire(reader.u16("format version")?)
    }

    /// Decode raw tokens: the header, then exactly the declared node count
    /// in ascending name order.
    pub fn deserialize_tokens<T: AsRef<[u8]>>(tokens: &[T]) -> Result<Self, FormatError> {
        let Some((header, node_tokens)) = tokens.split_first() else {
            return Err(FormatError::Corrupt("missing group header".to_string()));
        };

        let mut reader = TokenReader::new(header.as_ref(), 0);
        let version = FormatVersion::from_wire(reader.u16("format version")?)?;
        let name = reader.string("group name")?;
        let uuid = Uuid::from_slice(reader.bytes(16, "group uuid")?)
            .map_err(|e| FormatError::MalformedToken {
                index: 0,
                reason: e.to_string(),
            })?;
        let change_version = reader.u32("change version")?;
        let node_id_sequence = reader.u32("node id sequence")?;
        let node_count = reader.u32("node count")?;
        reader.finish()?;

        if node_tokens.len() != node_count as usize {
            return Err(FormatError::TokenCount {
                declared: node_count,
                actual: node_tokens.len(),
            });
        }

        let mut group = Self {
            name,
            uuid,
            format_version: version,
            change_version,
            node_id_sequence,
            nodes: BTreeMap::new(),
        };

        for (i, raw) in node_tokens.iter().enumerate() {
            let index = i + 1;
            let node = decode_node(raw.as_ref(), index, version)?;
            if node.id > node_id_sequence {
                return Err(FormatError::MalformedToken {
                    index,
                    reason: format!(
                        "node id {} exceeds the group's id sequence {}",
                        node.id, node_id_sequence
                    ),
                });
            }
            // strictly ascending names: the only order this codec writes
            if let Some((prev, _)) = group.nodes.last_key_value() {
                if node.name <= *prev {
                    return Err(FormatError::MalformedToken {
                        index,
                        reason: format!("node tokens out of order: {} after {}", node.name, prev),
                    });
                }
            }
            group.nodes.insert(node.name.clone(), node);
        }

        Ok(group)
    }
}

impl NodeDescriptor {
    /// This node as a single hex token at `version`, the form a joining node
    /// announces itself in. Id and change version are left for the group to
    /// assign.
    pub fn to_token_hex(&self, version: FormatVersion) -> Result<String, FormatError> {
        if self.node_type.min_format_version() > version {
            return Err(FormatError::SecondaryNotSupported {
                version: version.as_u16(),
                count: 1,
            });
        }
        Ok(token::encode_stream(&[encode_node(self, version)?]))
    }

    pub fn from_token_hex(token: &str, version: FormatVersion) -> Result<Self, FormatError> {
        let tokens = token::decode_stream(token)?;
        match tokens.as_slice() {
            [raw] => decode_node(raw, 0, version),
            _ => Err(FormatError::Corrupt(format!(
                "expected one node token, found {}",
                tokens.len()
            ))),
        }
    }
}

fn not_found(group: &str, name: &str) -> MembershipError {
    MembershipError::MemberNotFound {
        name: name.to_string(),
        group: group.to_string(),
    }
}

fn encode_node(node: &NodeDescriptor, version: FormatVersion) -> Result<Vec<u8>, FormatError> {
    let mut w = TokenWriter::new();
    w.put_str(&node.name)?;
    w.put_u32(node.id).put_u8(node.node_type.wire_code());
    w.put_str(&node.host)?;
    w.put_u16(node.port)
        .put_bool(node.removed)
        .put_u32(node.change_version);
    if version.supports_software_version() {
        w.put_opt_str(node.software_version.as_deref())?;
    }
    Ok(w.finish())
}

fn decode_node(raw: &[u8], index: usize, version: FormatVersion) -> Result<NodeDescriptor, FormatError> {
    let mut r = TokenReader::new(raw, index);
    let name = r.string("node name")?;
    let id = r.u32("node id")?;
    let node_type = NodeType::from_wire_code(r.u8("node type")?, version)?;
    let host = r.string("host")?;
    let port = r.u16("port")?;
    let removed = r.bool("removed")?;
    let change_version = r.u32("node change version")?;
    let software_version = if version.supports_software_version() {
        r.opt_string("software version")?
    } else {
        None
    };
    r.finish()?;

    Ok(NodeDescriptor {
        name,
        id,
        node_type,
        host,
        port,
        software_version,
        removed,
        change_version,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(version: FormatVersion) -> GroupMembership {
        let mut g = GroupMembership::new("orders", version);
        g.add_node(NodeDescriptor::new("n1", NodeType::Electable, "db1", 5001))
            .unwrap();
        g.add_node(NodeDescriptor::new("n2", NodeType::Monitor, "db2", 5001))
            .unwrap();
        g
    }

    #[test]
    fn test_add_assigns_ids_and_versions() {
        let g = sample(FormatVersion::V1);
        assert_eq!(g.node("n1").unwrap().id(), 1);
        assert_eq!(g.node("n2").unwrap().id(), 2);
        assert_eq!(g.change_version(), 2);
        assert_eq!(g.node("n2").unwrap().change_version(), 2);
        assert_eq!(g.node_by_id(2).unwrap().name(), "n2");
    }

    #[test]
    fn test_duplicate_add_leaves_group_unchanged() {
        let mut g = sample(FormatVersion::V3);
        let before = g.clone();
        let err = g
            .add_node(NodeDescriptor::new("n1", NodeType::Secondary, "other", 1))
            .unwrap_err();
        assert!(matches!(err, MembershipError::DuplicateMember { .. }));
        assert_eq!(g, before);
    }

    #[test]
    fn test_removed_name_stays_reserved() {
        let mut g = sample(FormatVersion::V3);
        g.remove_node("n1").unwrap();
        assert!(g.node("n1").unwrap().is_removed());
        assert_eq!(g.members().count(), 1);
        assert_eq!(g.token_count(), 3);
        assert!(matches!(
            g.remove_node("n1"),
            Err(MembershipError::MemberNotFound { .. })
        ));
        assert!(matches!(
            g.add_node(NodeDescriptor::new("n1", NodeType::Electable, "db1", 5001)),
            Err(MembershipError::DuplicateMember { .. })
        ));
    }

    #[test]
    fn test_missing_node() {
        let g = sample(FormatVersion::V1);
        let err = g.node("ghost").unwrap_err();
        assert_eq!(err.code(), "member_not_found");
    }

    #[test]
    fn test_secondary_rejected_below_v3() {
        let mut g = sample(FormatVersion::V2);
        let err = g
            .add_node(NodeDescriptor::new("s1", NodeType::Secondary, "db9", 5001))
            .unwrap_err();
        assert!(matches!(
            err,
            MembershipError::Format(FormatError::SecondaryNotSupported { version: 2, count: 1 })
        ));
        assert_eq!(g.len(), 2);
    }

    #[test]
    fn test_software_version_cleared_on_downgrade() {
        let mut g = GroupMembership::new("orders", FormatVersion::V2);
        g.add_node(
            NodeDescriptor::new("n1", NodeType::Electable, "db1", 5001).with_software_version("7.5.11"),
        )
        .unwrap();
        assert_eq!(g.node("n1").unwrap().software_version(), Some("7.5.11"));

        let v1 = g.with_format_version(FormatVersion::V1).unwrap();
        assert_eq!(v1.node("n1").unwrap().software_version(), None);
        assert_eq!(v1.format_version(), FormatVersion::V1);
    }

    #[test]
    fn test_header_only_stream() {
        let g = GroupMembership::new("empty", FormatVersion::V1);
        let hex = g.to_hex().unwrap();
        assert!(!hex.contains(token::TOKEN_DELIMITER));
        assert_eq!(GroupMembership::from_hex(&hex).unwrap(), g);
    }

    #[test]
    fn test_stream_format_version_peek() {
        let g = sample(FormatVersion::V2);
        let hex = g.serialize_hex(FormatVersion::V1).unwrap();
        assert_eq!(
            GroupMembership::stream_format_version(&hex).unwrap(),
            FormatVersion::V1
        );
    }

    #[test]
    fn test_single_node_token() {
        let node = NodeDescriptor::new("db node", NodeType::Monitor, "db9", 6001).with_software_version("0.3.0");
        let hex = node.to_token_hex(FormatVersion::V2).unwrap();
        assert!(!hex.contains(token::TOKEN_DELIMITER));
        let back = NodeDescriptor::from_token_hex(&hex, FormatVersion::V2).unwrap();
        assert_eq!(back, node);

        let secondary = NodeDescriptor::new("s1", NodeType::Secondary, "db3", 5001);
        assert!(secondary.to_token_hex(FormatVersion::V2).is_err());
        assert!(NodeDescriptor::from_token_hex(&format!("{hex}|{hex}"), FormatVersion::V2).is_err());
    }
}
