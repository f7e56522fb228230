//! Format and stream protocol versions, and the compatibility gate between them.
//!
//! Group membership encoding is versioned independently of the replication
//! stream protocol. The two are coupled through an explicit matrix: every
//! stream version declares the range of group formats it understands, and
//! every group format declares the oldest stream version able to read it.
//! No negotiation happens; a pair outside the matrix is rejected.

use crate::error::FormatError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Group membership format version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum FormatVersion {
    V1 = 1,
    /// Adds the per-node software version.
    V2 = 2,
    /// Adds SECONDARY nodes.
    V3 = 3,
}

impl FormatVersion {
    pub const MIN: FormatVersion = FormatVersion::V1;
    pub const MAX: FormatVersion = FormatVersion::V3;

    /// First version able to carry secondary nodes
    pub const SECONDARY_SUPPORT: FormatVersion = FormatVersion::V3;

    /// First version carrying node software versions
    pub const SOFTWARE_VERSION_SUPPORT: FormatVersion = FormatVersion::V2;

    pub const ALL: [FormatVersion; 3] = [FormatVersion::V1, FormatVersion::V2, FormatVersion::V3];

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Parse a version read from a stream or supplied by an operator.
    /// Anything outside [MIN, MAX] is rejected.
    pub fn from_wire(version: u16) -> Result<Self, FormatError> {
        match version {
            1 => Ok(FormatVersion::V1),
            2 => Ok(FormatVersion::V2),
            3 => Ok(FormatVersion::V3),
            _ => Err(FormatError::UnsupportedVersion {
                version,
                min: Self::MIN.as_u16(),
                max: Self::MAX.as_u16(),
            }),
        }
    }

    pub fn supports_secondary(self) -> bool {
        self >= Self::SECONDARY_SUPPORT
    }

    pub fn supports_software_version(self) -> bool {
        self >= Self::SOFTWARE_VERSION_SUPPORT
    }
}

impl TryFrom<u16> for FormatVersion {
    type Error = FormatError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Self::from_wire(value)
    }
}

impl From<FormatVersion> for u16 {
    fn from(value: FormatVersion) -> Self {
        value.as_u16()
    }
}

impl fmt::Display for FormatVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u16())
    }
}

/// Oldest stream protocol version known to this build
pub const MIN_STREAM_VERSION: u32 = 4;

/// Newest stream protocol version known to this build
pub const MAX_STREAM_VERSION: u32 = 7;

/// One row of the stream-version side of the compatibility matrix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StreamCompat {
    pub stream_version: u32,
    pub min_group_format: FormatVersion,
    pub max_group_format: FormatVersion,
}

/// Stream protocol version -> interoperable group format range.
/// Rows are sorted by stream version and both columns are non-decreasing.
pub const STREAM_COMPAT: [StreamCompat; 4] = [
    StreamCompat {
        stream_version: 4,
        min_group_format: FormatVersion::V1,
        max_group_format: FormatVersion::V1,
    },
    StreamCompat {
        stream_version: 5,
        min_group_format: FormatVersion::V1,
        max_group_format: FormatVersion::V2,
    },
    StreamCompat {
        stream_version: 6,
        min_group_format: FormatVersion::V1,
        max_group_format: FormatVersion::V2,
    },
    StreamCompat {
        stream_version: 7,
        min_group_format: FormatVersion::V1,
        max_group_format: FormatVersion::V3,
    },
];

/// Group format -> oldest stream protocol version able to understand it
pub const FORMAT_MIN_STREAM: [(FormatVersion, u32); 3] = [
    (FormatVersion::V1, 4),
    (FormatVersion::V2, 5),
    (FormatVersion::V3, 7),
];

fn stream_row(stream_version: u32) -> Option<&'static StreamCompat> {
    STREAM_COMPAT
        .iter()
        .find(|row| row.stream_version == stream_version)
}

/// Oldest stream version that can understand `format`
pub fn min_stream_version_for(format: FormatVersion) -> u32 {
    FORMAT_MIN_STREAM
        .iter()
        .find(|(f, _)| *f == format)
        .map(|(_, s)| *s)
        .unwrap_or(MAX_STREAM_VERSION)
}

/// Newest group format `stream_version` understands, `None` if the stream
/// version is unknown to this build
pub fn max_group_format_for(stream_version: u32) -> Option<FormatVersion> {
    stream_row(stream_version).map(|row| row.max_group_format)
}

/// Oldest group format `stream_version` interoperates with
pub fn min_group_format_for(stream_version: u32) -> Option<FormatVersion> {
    stream_row(stream_version).map(|row| row.min_group_format)
}

/// Which rule rejected a (stream, format) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IncompatibilityReason {
    /// The peer's stream version is not in this build's matrix.
    UnknownStreamVersion,
    /// The peer's stream version is older than the local format requires.
    StreamTooOld,
    /// The local format is newer than the peer's stream version can read.
    FormatTooNew,
}

impl IncompatibilityReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnknownStreamVersion => "unknown_stream_version",
            Self::StreamTooOld => "stream_too_old",
            Self::FormatTooNew => "format_too_new",
        }
    }
}

impl fmt::Display for IncompatibilityReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A join attempt whose versions fall outside the matrix. Not retriable
/// without an operator upgrading or downgrading software.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error(
    "incompatible versions: peer stream protocol {stream_version} cannot interoperate \
     with group format {format_version} ({reason}; requires stream >= {required_stream}, \
     peer reads formats up to {peer_max_format})"
)]
pub struct IncompatibleVersion {
    pub stream_version: u32,
    pub format_version: FormatVersion,
    pub reason: IncompatibilityReason,
    pub required_stream: u32,
    /// "unknown" when the stream version is not in the matrix
    pub peer_max_format: String,
}

/// Admission check for replicas joining with a given stream protocol version
#[derive(Debug, Clone, Copy)]
pub struct CompatibilityGate {
    local_format: FormatVersion,
}

impl CompatibilityGate {
    pub fn new(local_format: FormatVersion) -> Self {
        Self { local_format }
    }

    pub fn local_format(&self) -> FormatVersion {
        self.local_format
    }

    /// Both rules must hold:
    /// `peer_stream >= min_stream_version_for(local)` and
    /// `local <= max_group_format_for(peer_stream)`.
    pub fn check(&self, peer_stream: u32) -> Result<(), IncompatibleVersion> {
        judge(
            self.local_format,
            peer_stream,
            min_stream_version_for(self.local_format),
            max_group_format_for(peer_stream),
        )
    }

    pub fn is_compatible(&self, peer_stream: u32) -> bool {
        self.check(peer_stream).is_ok()
    }
}

/// Both rules over one matrix lookup, stream rule first. With the shipped
/// tables the format rule never fails alone.
fn judge(
    local_format: FormatVersion,
    peer_stream: u32,
    required_stream: u32,
    peer_max: Option<FormatVersion>,
) -> Result<(), IncompatibleVersion> {
    let reject = |reason, peer_max: Option<FormatVersion>| IncompatibleVersion {
        stream_version: peer_stream,
        format_version: local_format,
        reason,
        required_stream,
        peer_max_format: peer_max
            .map(|f| f.to_string())
            .unwrap_or_else(|| "unknown".to_string()),
    };

    let Some(peer_max) = peer_max else {
        return Err(reject(IncompatibilityReason::UnknownStreamVersion, None));
    };

    if peer_stream < required_stream {
        return Err(reject(IncompatibilityReason::StreamTooOld, Some(peer_max)));
    }

    if local_format > peer_max {
        return Err(reject(IncompatibilityReason::FormatTooNew, Some(peer_max)));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_version_range() {
        assert_eq!(FormatVersion::from_wire(1), Ok(FormatVersion::V1));
        assert_eq!(FormatVersion::from_wire(3), Ok(FormatVersion::V3));
        assert!(matches!(
            FormatVersion::from_wire(0),
            Err(FormatError::UnsupportedVersion { version: 0, .. })
        ));
        assert!(matches!(
            FormatVersion::from_wire(4),
            Err(FormatError::UnsupportedVersion { version: 4, min: 1, max: 3 })
        ));
    }

    #[test]
    fn test_feature_thresholds() {
        assert!(!FormatVersion::V2.supports_secondary());
        assert!(FormatVersion::V3.supports_secondary());
        assert!(!FormatVersion::V1.supports_software_version());
        assert!(FormatVersion::V2.supports_software_version());
    }

    #[test]
    fn test_every_format_has_a_min_stream() {
        for format in FormatVersion::ALL {
            let min = min_stream_version_for(format);
            assert!((MIN_STREAM_VERSION..=MAX_STREAM_VERSION).contains(&min));
            // the min stream must actually be able to read the format
            assert!(max_group_format_for(min).unwrap() >= format);
        }
    }

    #[test]
    fn test_gate_reports_both_versions() {
        let err = CompatibilityGate::new(FormatVersion::V3).check(6).unwrap_err();
        assert_eq!(err.stream_version, 6);
        assert_eq!(err.format_version, FormatVersion::V3);
        let msg = err.to_string();
        assert!(msg.contains("6"));
        assert!(msg.contains("format 3"));
    }

    #[test]
    fn test_unknown_stream_fails_closed() {
        let gate = CompatibilityGate::new(FormatVersion::V1);
        let err = gate.check(MAX_STREAM_VERSION + 1).unwrap_err();
        assert_eq!(err.reason, IncompatibilityReason::UnknownStreamVersion);
        assert_eq!(err.peer_max_format, "unknown");
        assert!(!gate.is_compatible(0));
    }

    #[test]
    fn test_serde_rejects_unsupported_format() {
        let v: FormatVersion = serde_json::from_str("2").unwrap();
        assert_eq!(v, FormatVersion::V2);
        assert!(serde_json::from_str::<FormatVersion>("9").is_err());
    }

    #[test]
    fn test_format_rule_rejects_on_its_own() {
        // a row claiming stream 5 reads only V1 while V2 needs stream 5
        let err = judge(FormatVersion::V2, 5, 5, Some(FormatVersion::V1)).unwrap_err();
        assert_eq!(err.reason, IncompatibilityReason::FormatTooNew);
        assert_eq!(err.peer_max_format, "1");
        assert_eq!(err.required_stream, 5);

        // just inside on both rules
        assert!(judge(FormatVersion::V2, 5, 5, Some(FormatVersion::V2)).is_ok());
    }

    #[test]
    fn test_stream_rule_checked_before_format_rule() {
        let err = judge(FormatVersion::V3, 4, 7, Some(FormatVersion::V1)).unwrap_err();
        assert_eq!(err.reason, IncompatibilityReason::StreamTooOld);
    }

    #[test]
    fn test_shipped_tables_are_inverse() {
        // the format rule never fires alone with the shipped tables
        for format in FormatVersion::ALL {
            for stream in MIN_STREAM_VERSION..=MAX_STREAM_VERSION {
                let stream_ok = stream >= min_stream_version_for(format);
                let format_ok = max_group_format_for(stream).is_some_and(|max| format <= max);
                assert_eq!(stream_ok, format_ok, "stream {stream} format {format}");
            }
        }
    }
}
