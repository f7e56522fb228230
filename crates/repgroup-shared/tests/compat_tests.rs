//! Tests for the stream/format compatibility matrix

use repgroup_shared::version::{
    max_group_format_for, min_group_format_for, min_stream_version_for, IncompatibilityReason,
    MAX_STREAM_VERSION, MIN_STREAM_VERSION, STREAM_COMPAT,
};
use repgroup_shared::{CompatibilityGate, FormatVersion};

#[test]
fn test_matrix_is_monotonic() {
    for pair in STREAM_COMPAT.windows(2) {
        assert!(pair[0].stream_version < pair[1].stream_version);
        assert!(pair[0].min_group_format <= pair[1].min_group_format);
        assert!(pair[0].max_group_format <= pair[1].max_group_format);
    }
    for s in MIN_STREAM_VERSION..MAX_STREAM_VERSION {
        assert!(min_group_format_for(s) <= min_group_format_for(s + 1));
        assert!(max_group_format_for(s) <= max_group_format_for(s + 1));
    }
    for pair in FormatVersion::ALL.windows(2) {
        assert!(min_stream_version_for(pair[0]) <= min_stream_version_for(pair[1]));
    }
}

#[test]
fn test_gate_matches_both_rules() {
    for format in FormatVersion::ALL {
        let gate = CompatibilityGate::new(format);
        for stream in 0..=MAX_STREAM_VERSION + 2 {
            let expected = match max_group_format_for(stream) {
                Some(max) => stream >= min_stream_version_for(format) && format <= max,
                None => false,
            };
            assert_eq!(gate.is_compatible(stream), expected, "stream {stream} format {format}");
        }
    }
}

#[test]
fn test_secondary_format_boundary() {
    let gate = CompatibilityGate::new(FormatVersion::V3);
    // just inside
    assert!(gate.check(7).is_ok());
    // just outside
    let err = gate.check(6).unwrap_err();
    assert_eq!(err.reason, IncompatibilityReason::StreamTooOld);
    assert_eq!(err.required_stream, 7);
    assert_eq!(err.peer_max_format, "2");
}

#[test]
fn test_v2_boundary() {
    let gate = CompatibilityGate::new(FormatVersion::V2);
    assert!(gate.check(5).is_ok());
    assert!(gate.check(6).is_ok());
    assert!(gate.check(7).is_ok());
    assert_eq!(
        gate.check(4).unwrap_err().reason,
        IncompatibilityReason::StreamTooOld
    );
}

#[test]
fn test_oldest_format_accepts_every_known_stream() {
    let gate = CompatibilityGate::new(FormatVersion::V1);
    for stream in MIN_STREAM_VERSION..=MAX_STREAM_VERSION {
        assert!(gate.check(stream).is_ok(), "stream {stream}");
    }
    assert_eq!(
        gate.check(MIN_STREAM_VERSION - 1).unwrap_err().reason,
        IncompatibilityReason::UnknownStreamVersion
    );
    assert_eq!(
        gate.check(MAX_STREAM_VERSION + 1).unwrap_err().reason,
        IncompatibilityReason::UnknownStreamVersion
    );
}
