//! Command implementations. Each returns the text to print.

use anyhow::{Context, Result};
use repgroup_shared::report::{GroupSummary, VersionReport};
use repgroup_shared::{CompatibilityGate, FormatVersion, GroupMembership};
use repgroupd::channel::{ConnectOptions, FactoryRegistry};
use repgroupd::config::{ChannelConfig, Config};
use repgroupd::handshake::request_status;
use repgroupd::params::{ChannelPurpose, InstanceContext, InstanceParams};
use serde_json::json;
use std::fmt::Write;
use std::path::Path;
use std::sync::Arc;

fn format_version(v: u16) -> Result<FormatVersion> {
    FormatVersion::from_wire(v).context("invalid format version")
}

pub fn versions(json: bool) -> Result<String> {
    let report = VersionReport::current();
    if json {
        return Ok(serde_json::to_string_pretty(&report)?);
    }
    Ok(report.format_text())
}

pub fn decode(hex: &str, target: Option<u16>, json: bool) -> Result<String> {
    let hex = hex.trim();
    let group = match target {
        Some(v) => GroupMembership::deserialize_hex(hex, format_version(v)?),
        None => GroupMembership::from_hex(hex),
    }
    .context("failed to decode membership stream")?;

    if json {
        let out = json!({
            "summary": GroupSummary::of(&group),
            "nodes": group.nodes().collect::<Vec<_>>(),
        });
        return Ok(serde_json::to_string_pretty(&out)?);
    }

    let mut out = String::new();
    writeln!(out, "Group:    {} ({})", group.name(), group.uuid())?;
    writeln!(out, "Format:   {}", group.format_version())?;
    writeln!(out, "Change:   {}", group.change_version())?;
    writeln!(out, "Tokens:   {}", group.token_count())?;
    writeln!(out)?;
    writeln!(out, "{:<4}  {:<20}  {:<10}  {:<28}  {:<8}  {}", "id", "name", "type", "address", "removed", "software")?;
    for node in group.nodes() {
        writeln!(
            out,
            "{:<4}  {:<20}  {:<10}  {:<28}  {:<8}  {}",
            node.id(),
            node.name(),
            node.node_type().to_string(),
            node.socket_address(),
            if node.is_removed() { "yes" } else { "no" },
            node.software_version().unwrap_or("-")
        )?;
    }
    Ok(out)
}

/// Errors when the pair is incompatible, so the exit code reflects it.
pub fn check(stream: u32, format: u16) -> Result<String> {
    let gate = CompatibilityGate::new(format_version(format)?);
    gate.check(stream)?;
    Ok(format!(
        "compatible: stream {} can join a group at format {}",
        stream, format
    ))
}

pub fn convert(hex: &str, to: u16) -> Result<String> {
    let group = GroupMembership::from_hex(hex.trim()).context("failed to decode membership stream")?;
    let converted = group
        .with_format_version(format_version(to)?)
        .context("group cannot be written at the target version")?;
    Ok(converted.to_hex()?)
}

pub async fn status(addr: &str, config: Option<&Path>, json: bool) -> Result<String> {
    let channel_config = match config {
        Some(path) => Config::load_from_path(path)?.channel,
        None => ChannelConfig::default(),
    };
    let options = ConnectOptions::from_config(&channel_config);
    let name = channel_config.factory.clone();
    let params = InstanceParams::new(
        InstanceContext::new(ChannelPurpose::GroupService, Arc::new(channel_config.clone())),
        channel_config.factory_params.clone(),
    );
    let factory = FactoryRegistry::with_builtins().build(&name, &params)?;

    let channel = factory
        .connect(addr, &options)
        .await
        .with_context(|| format!("failed to reach {}", addr))?;
    let status = request_status(channel.clone()).await?;
    let _ = channel.close().await;

    if json {
        return Ok(serde_json::to_string_pretty(&status)?);
    }

    let group = &status["group"];
    let mut out = String::new();
    writeln!(out, "Group:     {} ({})", group["name"].as_str().unwrap_or("?"), group["uuid"].as_str().unwrap_or("?"))?;
    writeln!(out, "Started:   {}", status["started_at"].as_str().unwrap_or("?"))?;
    writeln!(out, "Format:    {}", group["format_version"])?;
    writeln!(out, "Change:    {}", group["change_version"])?;
    writeln!(
        out,
        "Members:   {} electable, {} monitor, {} secondary, {} removed",
        group["electable"], group["monitor"], group["secondary"], group["removed"]
    )?;
    let active: Vec<&str> = status["active"]
        .as_array()
        .map(|a| a.iter().filter_map(|v| v.as_str()).collect())
        .unwrap_or_default();
    writeln!(out, "Active:    {}", if active.is_empty() { "-".to_string() } else { active.join(", ") })?;
    Ok(out)
}
