//! CLI commands
//!
//! Local commands (list-monitors, list-sinks, map, unmap) talk to the
//! compositor and `PipeWire` directly. `status` and `shutdown` also use IPC.

use color_eyre::eyre::{self, Result};
use crossterm::style::Stylize;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::audio::{AudioDirectory, DeviceName};
use crate::compositor;
use crate::config::Config;
use crate::ipc::{self, Request, Response};
use crate::logging;
use crate::mapping::{self, MappingTable};
use crate::monitor::{MonitorDescriptor, MonitorKey, MonitorResolver};
use crate::pipewire::{ListSinksJson, PipeWire, PipeWireDirectory, SinkJson};
use crate::style::Palette;

// ============================================================================
// Monitor Selection
// ============================================================================

/// An attached monitor with its resolved key and list position
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorEntry {
    /// 1-based position in left-to-right order
    pub index: usize,
    pub descriptor: MonitorDescriptor,
    pub key: MonitorKey,
}

/// Resolve keys for attached monitors and number them left-to-right
#[must_use]
pub fn monitor_entries(
    monitors: Vec<MonitorDescriptor>,
    resolver: &MonitorResolver,
) -> Vec<MonitorEntry> {
    let mut resolved: Vec<(MonitorKey, MonitorDescriptor)> = monitors
        .into_iter()
        .map(|m| (resolver.resolve_key(&m), m))
        .collect();
    resolved.sort_by(|a, b| a.0.cmp(&b.0));

    resolved
        .into_iter()
        .enumerate()
        .map(|(i, (key, descriptor))| MonitorEntry {
            index: i + 1,
            descriptor,
            key,
        })
        .collect()
}

fn current_monitors() -> Result<Vec<MonitorEntry>> {
    let outputs = compositor::enumerate_outputs()?;
    if outputs.is_empty() {
        eyre::bail!("The compositor reported no monitors");
    }
    Ok(monitor_entries(outputs, &MonitorResolver::new()))
}

/// Find a monitor by 1-based index, full key, connector or name
///
/// # Errors
/// Returns an error if nothing matches or a name matches several monitors.
pub fn select_monitor<'a>(entries: &'a [MonitorEntry], reference: &str) -> Result<&'a MonitorEntry> {
    let reference = reference.trim();

    if let Ok(index) = reference.parse::<usize>() {
        return entries
            .iter()
            .find(|e| e.index == index)
            .ok_or_else(|| eyre::eyre!("No monitor #{index} (found {})", entries.len()));
    }

    if let Some(entry) = entries.iter().find(|e| e.key.to_string() == reference) {
        return Ok(entry);
    }

    if let Some(entry) = entries
        .iter()
        .find(|e| e.descriptor.connector.as_deref() == Some(reference))
    {
        return Ok(entry);
    }

    let by_name: Vec<&MonitorEntry> = entries.iter().filter(|e| e.key.name == reference).collect();
    match by_name.as_slice() {
        [entry] => Ok(*entry),
        [] => {
            let available: Vec<String> = entries
                .iter()
                .map(|e| format!("{}. {}", e.index, e.key))
                .collect();
            eyre::bail!(
                "No monitor matches '{reference}'. Available: [{}]",
                available.join(", ")
            )
        }
        many => {
            let indices: Vec<String> = many.iter().map(|e| e.index.to_string()).collect();
            eyre::bail!(
                "'{reference}' matches several monitors ({}). Use the index instead",
                indices.join(", ")
            )
        }
    }
}

// ============================================================================
// Hardware Queries and Mapping Edits
// ============================================================================

#[derive(Debug, Serialize)]
struct MonitorJson {
    index: usize,
    key: String,
    name: String,
    connector: Option<String>,
    description: Option<String>,
    rect: [i32; 4],
    device: Option<String>,
}

/// List attached monitors and their mapped outputs
///
/// # Errors
/// Returns an error if the compositor cannot be queried.
pub fn list_monitors(json_output: bool) -> Result<()> {
    let entries = current_monitors()?;
    let table = MappingTable::reconcile(
        entries.iter().map(|e| e.key.clone()),
        &mapping::load(&Config::get_mappings_path()?),
    );

    if json_output {
        let output: Vec<MonitorJson> = entries
            .iter()
            .map(|e| MonitorJson {
                index: e.index,
                key: e.key.to_string(),
                name: e.key.name.clone(),
                connector: e.descriptor.connector.clone(),
                description: e.descriptor.description.clone(),
                rect: [e.key.rect.left, e.key.rect.top, e.key.rect.right, e.key.rect.bottom],
                device: table.target_for(&e.key).map(ToString::to_string),
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("{}", "MONITORS:".heading());
    println!("{}", "-".repeat(9));
    for entry in &entries {
        let connector = entry
            .descriptor
            .connector
            .as_deref()
            .filter(|c| *c != entry.key.name)
            .map(|c| format!(" ({c})"))
            .unwrap_or_default();
        println!(
            "  {}. {}{}",
            entry.index.to_string().dim(),
            entry.key.name.as_str().bold(),
            connector.dim()
        );
        println!("     {}", entry.key.to_string().detail());
        match table.target_for(&entry.key) {
            Some(device) => println!("     {} {}", "→".positive(), device.as_str().positive()),
            None => println!("     {}", "no output mapped".dim()),
        }
    }

    if let Ok(path) = Config::get_mappings_path() {
        println!("\n{} {}", "Mappings:".dim(), path.display());
    }

    Ok(())
}

/// List available outputs, the current default and which monitors use them
///
/// # Errors
/// Returns an error if `PipeWire` query fails or JSON serialization fails.
pub fn list_sinks(json_output: bool) -> Result<()> {
    let objects = PipeWire::dump()?;
    let devices = PipeWire::get_playback_devices(&objects);
    let current_default = devices
        .iter()
        .find(|d| d.is_default)
        .map(|d| d.description.clone());

    // device description -> persisted monitor keys
    let mut monitors_by_device: BTreeMap<String, Vec<String>> = BTreeMap::new();
    if let Ok(path) = Config::get_mappings_path() {
        for (key, device) in mapping::load(&path) {
            if !device.is_empty() {
                monitors_by_device.entry(device).or_default().push(key);
            }
        }
    }

    if json_output {
        let output = ListSinksJson {
            sinks: devices
                .iter()
                .map(|d| SinkJson {
                    name: d.description.clone(),
                    node_name: d.node_name.clone(),
                    is_default: d.is_default,
                    monitors: monitors_by_device
                        .get(&d.description)
                        .cloned()
                        .unwrap_or_default(),
                })
                .collect(),
            current_default,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("{}", "OUTPUTS:".heading());
    println!("{}", "-".repeat(8));
    if devices.is_empty() {
        println!("  {}", "(none)".dim());
        return Ok(());
    }

    for device in &devices {
        let marker = if device.is_default { "* " } else { "  " };
        println!("{}{}", marker, device.description.as_str().bold());
        println!("    {}", device.node_name.as_str().dim());
        if let Some(keys) = monitors_by_device.get(&device.description) {
            for key in keys {
                println!("    {} {}", "←".positive(), key.as_str().detail());
            }
        }
    }
    println!("\n  {} = current default", "*".dim());

    Ok(())
}

fn save_table(table: &MappingTable) -> Result<()> {
    let path = Config::get_mappings_path()?;
    mapping::save(&path, table)?;
    println!("{} {}", "Saved".dim(), path.display());

    if table.mapped_count() > 0 {
        println!(
            "{}",
            "A running daemon picks this up automatically (watch_mappings = true)".dim()
        );
    }
    Ok(())
}

fn load_table(entries: &[MonitorEntry]) -> Result<MappingTable> {
    Ok(MappingTable::reconcile(
        entries.iter().map(|e| e.key.clone()),
        &mapping::load(&Config::get_mappings_path()?),
    ))
}

/// Map a monitor to an output and persist the table
///
/// # Errors
/// Returns an error if the monitor cannot be identified, the output is not
/// available (unless `force`), or the mapping file cannot be written.
pub fn map_monitor(monitor_ref: &str, sink: &str, force: bool) -> Result<()> {
    let entries = current_monitors()?;
    let entry = select_monitor(&entries, monitor_ref)?;
    let device = DeviceName::new(sink.trim());

    if device.is_empty() {
        eyre::bail!("Output name must not be empty (use 'mosw unmap' to remove a mapping)");
    }

    if !force {
        let available = PipeWireDirectory.list_playback_devices()?;
        if !available.contains(&device) {
            let names: Vec<String> = available.iter().map(|d| format!("'{d}'")).collect();
            eyre::bail!(
                "No output named '{device}'. Available: [{}]\nUse --force to save it anyway",
                names.join(", ")
            );
        }
    }

    let mut table = load_table(&entries)?;
    table.set(entry.key.clone(), device.clone());
    save_table(&table)?;

    println!(
        "{} {} {} {}",
        "✓".positive(),
        entry.key.name.as_str().bold(),
        "→".dim(),
        device.as_str().positive()
    );
    Ok(())
}

/// Reset a monitor to "no preference" and persist the table
///
/// # Errors
/// Returns an error if the monitor cannot be identified or the file cannot be written.
pub fn unmap_monitor(monitor_ref: &str) -> Result<()> {
    let entries = current_monitors()?;
    let entry = select_monitor(&entries, monitor_ref)?;

    let mut table = load_table(&entries)?;
    let was_mapped = table.target_for(&entry.key).is_some();
    table.clear(&entry.key);
    save_table(&table)?;

    if was_mapped {
        println!("{} {} unmapped", "✓".positive(), entry.key.name.as_str().bold());
    } else {
        println!("{} {} had no output mapped", "•".dim(), entry.key.name.as_str().bold());
    }
    Ok(())
}

/// `42s`, `2m`, `1h`, `2h 1m`; minutes are dropped when they are zero
fn format_uptime(secs: u64) -> String {
    let (hours, mins) = (secs / 3600, secs % 3600 / 60);
    match (hours, mins) {
        (0, 0) => format!("{secs}s"),
        (0, m) => format!("{m}m"),
        (h, 0) => format!("{h}h"),
        (h, m) => format!("{h}h {m}m"),
    }
}

// ============================================================================
// Daemon Control
// ============================================================================

struct DaemonInfo {
    version: String,
    uptime_secs: u64,
    monitor: Option<String>,
    device: Option<String>,
    mapped_monitors: usize,
}

/// Current default output plus, when a daemon answers, what it is tracking
///
/// # Errors
/// Returns an error if `pw-dump` fails or JSON serialization fails.
pub async fn status(json_output: bool) -> Result<()> {
    // PipeWire works with or without the daemon
    let objects = PipeWire::dump()?;
    let current = PipeWire::get_playback_devices(&objects)
        .into_iter()
        .find(|d| d.is_default);

    let daemon_info = if ipc::is_daemon_running().await {
        match ipc::send_request(Request::Status).await {
            Ok(Response::Status {
                version,
                uptime_secs,
                monitor,
                device,
                mapped_monitors,
            }) => Some(DaemonInfo {
                version,
                uptime_secs,
                monitor,
                device,
                mapped_monitors,
            }),
            _ => None,
        }
    } else {
        None
    };

    if json_output {
        let daemon_json = match &daemon_info {
            Some(info) => serde_json::json!({
                "running": true,
                "version": info.version,
                "uptime_secs": info.uptime_secs,
                "uptime_human": format_uptime(info.uptime_secs),
                "monitor": info.monitor,
                "device": info.device,
                "mapped_monitors": info.mapped_monitors,
            }),
            None => serde_json::json!({ "running": false }),
        };

        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "current_sink": current.as_ref().map(|d| serde_json::json!({
                    "name": d.node_name,
                    "description": d.description,
                })),
                "daemon": daemon_json,
            }))?
        );
        return Ok(());
    }

    println!("{}", "Audio Output".heading());
    println!("{}", "-".repeat(12));
    match &current {
        Some(device) => println!("{} {}", "Current:".dim(), device.description.as_str().bold()),
        None => println!("{} {}", "Current:".dim(), "none".caution()),
    }
    println!();
    println!("{}", "Daemon".heading());
    println!("{}", "-".repeat(6));

    match daemon_info {
        Some(info) => {
            println!(
                "{} {}",
                "Status:".dim(),
                format!("Running (uptime: {})", format_uptime(info.uptime_secs)).positive()
            );
            println!("{} {}", "Version:".dim(), info.version);
            if let Some(monitor) = info.monitor {
                println!("{} {}", "Monitor:".dim(), monitor.detail());
            }
            if let Some(device) = info.device {
                println!("{} {}", "Switched to:".dim(), device.bold());
            }
            println!(
                "{} {}",
                "Mapped Monitors:".dim(),
                info.mapped_monitors.to_string().detail()
            );
            if let Ok(path) = logging::get_log_file_path() {
                println!("{} {}", "Log:".dim(), path.display());
            }
        }
        None => {
            println!("{} {}", "Status:".dim(), "Not running".failure());
            println!("  Start with: {}", "mosw daemon".detail());
        }
    }

    Ok(())
}

/// Ask the running daemon to exit
///
/// # Errors
/// Returns an error if no daemon is running or the request fails.
pub async fn shutdown() -> Result<()> {
    if !ipc::is_daemon_running().await {
        eyre::bail!("Daemon is not running");
    }

    match ipc::send_request(Request::Shutdown).await? {
        Response::Ok { message } => {
            println!("{}", message.positive());
            Ok(())
        }
        Response::Error { message } => eyre::bail!("Error: {message}"),
        Response::Status { .. } => eyre::bail!("Unexpected response from daemon"),
    }
}
