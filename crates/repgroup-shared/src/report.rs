//! Operator-facing diagnostics: version constants, the compatibility matrix
//! and a compact group summary. Rendered as JSON by the daemon's STATUS
//! reply and by `repgroupctl`.

use crate::group::GroupMembership;
use crate::version::{
    min_stream_version_for, FormatVersion, StreamCompat, MAX_STREAM_VERSION, MIN_STREAM_VERSION,
    STREAM_COMPAT,
};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct FormatRow {
    pub format_version: FormatVersion,
    pub min_stream_version: u32,
    pub secondary_nodes: bool,
    pub software_versions: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct VersionReport {
    pub min_format_version: FormatVersion,
    pub max_format_version: FormatVersion,
    pub min_stream_version: u32,
    pub max_stream_version: u32,
    pub formats: Vec<FormatRow>,
    pub streams: Vec<StreamCompat>,
}

impl VersionReport {
    pub fn current() -> Self {
        Self {
            min_format_version: FormatVersion::MIN,
            max_format_version: FormatVersion::MAX,
            min_stream_version: MIN_STREAM_VERSION,
            max_stream_version: MAX_STREAM_VERSION,
            formats: FormatVersion::ALL
                .iter()
                .map(|&f| FormatRow {
                    format_version: f,
                    min_stream_version: min_stream_version_for(f),
                    secondary_nodes: f.supports_secondary(),
                    software_versions: f.supports_software_version(),
                })
                .collect(),
            streams: STREAM_COMPAT.to_vec(),
        }
    }

    /// Plain-text table for terminals
    pub fn format_text(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "Group format versions: {}..={}\n",
            self.min_format_version, self.max_format_version
        ));
        out.push_str(&format!(
            "Stream protocol versions: {}..={}\n\n",
            self.min_stream_version, self.max_stream_version
        ));
        out.push_str("format  min-stream  secondary  sw-version\n");
        for row in &self.formats {
            out.push_str(&format!(
                "{:<6}  {:<10}  {:<9}  {}\n",
                row.format_version.to_string(),
                row.min_stream_version,
                yes_no(row.secondary_nodes),
                yes_no(row.software_versions)
            ));
        }
        out.push_str("\nstream  min-format  max-format\n");
        for row in &self.streams {
            out.push_str(&format!(
                "{:<6}  {:<10}  {}\n",
                row.stream_version,
                row.min_group_format.to_string(),
                row.max_group_format
            ));
        }
        out
    }
}

fn yes_no(b: bool) -> &'static str {
    if b {
        "yes"
    } else {
        "no"
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupSummary {
    pub name: String,
    pub uuid: String,
    pub format_version: FormatVersion,
    pub change_version: u32,
    pub electable: usize,
    pub monitor: usize,
    pub secondary: usize,
    pub removed: usize,
    pub token_count: usize,
}

impl GroupSummary {
    pub fn of(group: &GroupMembership) -> Self {
        Self {
            name: group.name().to_string(),
            uuid: group.uuid().to_string(),
            format_version: group.format_version(),
            change_version: group.change_version(),
            electable: group.electable_nodes().count(),
            monitor: group.monitor_nodes().count(),
            secondary: group.secondary_nodes().count(),
            removed: group.nodes().filter(|n| n.is_removed()).count(),
            token_count: group.token_count(),
        }
    }
}
