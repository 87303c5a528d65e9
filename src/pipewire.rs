//! `PipeWire` integration
//!
//! Playback device discovery and default-sink control via the `PipeWire`
//! command-line tools:
//! - `pw-dump`: JSON snapshot of the graph (sink nodes, default metadata)
//! - `pw-metadata`: writes the configured default sink
//!
//! Devices are addressed by their description (what desktop volume applets
//! show); node names are only used internally to issue the switch.

use color_eyre::eyre::{self, Context, Result};
use serde::{Deserialize, Serialize};
use std::process::Command;
use tracing::{debug, trace};

use crate::audio::{AudioDirectory, DeviceName, SwitchError};

const NODE_TYPE: &str = "PipeWire:Interface:Node";
const METADATA_TYPE: &str = "PipeWire:Interface:Metadata";
const SINK_CLASS: &str = "Audio/Sink";
const DEFAULT_SINK_KEY: &str = "default.audio.sink";

// ============================================================================
// pw-dump model (only the fields read here)
// ============================================================================

/// One element of the `pw-dump` array
#[derive(Debug, Deserialize)]
pub struct DumpObject {
    #[serde(rename = "type")]
    kind: String,
    /// Nodes carry their properties under `info.props`
    #[serde(default)]
    info: Option<DumpInfo>,
    /// Metadata objects carry them at the top level
    #[serde(default)]
    props: Option<DumpProps>,
    #[serde(default)]
    metadata: Option<Vec<MetadataEntry>>,
}

#[derive(Debug, Deserialize)]
struct DumpInfo {
    #[serde(default)]
    props: Option<DumpProps>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct DumpProps {
    #[serde(rename = "node.name")]
    node_name: Option<String>,
    #[serde(rename = "node.description")]
    description: Option<String>,
    #[serde(rename = "node.nick")]
    nick: Option<String>,
    #[serde(rename = "media.class")]
    media_class: Option<String>,
    #[serde(rename = "metadata.name")]
    metadata_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MetadataEntry {
    key: String,
    #[serde(default)]
    value: Option<serde_json::Value>,
}

impl DumpObject {
    fn props(&self) -> Option<&DumpProps> {
        self.info
            .as_ref()
            .and_then(|info| info.props.as_ref())
            .or(self.props.as_ref())
    }

    /// Node name and user-visible name, if this is a playback sink
    fn as_sink(&self) -> Option<(String, String)> {
        if self.kind != NODE_TYPE {
            return None;
        }
        let props = self.props()?;
        if props.media_class.as_deref() != Some(SINK_CLASS) {
            return None;
        }

        let node_name = props.node_name.clone()?;
        let description = props
            .description
            .clone()
            .or_else(|| props.nick.clone())
            .unwrap_or_else(|| node_name.clone());
        Some((node_name, description))
    }

    /// Node name stored under `default.audio.sink`, if this is the `default` metadata
    fn default_sink(&self) -> Option<String> {
        if self.kind != METADATA_TYPE
            || self.props()?.metadata_name.as_deref() != Some("default")
        {
            return None;
        }

        let entry = self
            .metadata
            .as_ref()?
            .iter()
            .find(|entry| entry.key == DEFAULT_SINK_KEY)?;
        metadata_node_name(entry.value.as_ref()?)
    }
}

/// Metadata values are `{"name": "..."}` on current `PipeWire`, a bare string on older releases
fn metadata_node_name(value: &serde_json::Value) -> Option<String> {
    value
        .get("name")
        .unwrap_or(value)
        .as_str()
        .map(ToOwned::to_owned)
}

// ============================================================================
// Device Discovery Types
// ============================================================================

/// A playback device currently available in `PipeWire`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackDevice {
    /// `PipeWire` node name (e.g., `"alsa_output.pci-0000_0c_00.4.analog-stereo"`)
    pub node_name: String,
    /// User-visible name; what mappings refer to
    pub description: String,
    pub is_default: bool,
}

// ============================================================================
// JSON Output Structures (for list-sinks --json)
// ============================================================================

#[derive(Debug, Serialize)]
pub struct ListSinksJson {
    pub sinks: Vec<SinkJson>,
    pub current_default: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SinkJson {
    pub name: String,
    pub node_name: String,
    pub is_default: bool,
    /// Monitors mapped to this device
    pub monitors: Vec<String>,
}

// ============================================================================
// PipeWire Interface
// ============================================================================

/// `PipeWire` interface for audio control
pub struct PipeWire;

impl PipeWire {
    /// Check that `pw-dump` and `pw-metadata` can be run
    ///
    /// # Errors
    /// Returns an error naming the missing tools and the package providing them.
    pub fn validate_tools() -> Result<()> {
        let missing: Vec<&str> = ["pw-dump", "pw-metadata"]
            .into_iter()
            .filter(|tool| {
                !Command::new(tool)
                    .arg("--version")
                    .output()
                    .is_ok_and(|output| output.status.success())
            })
            .collect();

        if !missing.is_empty() {
            eyre::bail!(
                "Missing required PipeWire tools: {}\n\
                 Install the PipeWire utilities for your distribution \
                 (pipewire-tools, pipewire-utils or pipewire-bin)",
                missing.join(", ")
            );
        }

        Ok(())
    }

    /// Snapshot the `PipeWire` graph via `pw-dump`
    ///
    /// # Errors
    /// Returns an error if `pw-dump` fails to execute or returns invalid JSON.
    pub fn dump() -> Result<Vec<DumpObject>> {
        let output = Command::new("pw-dump")
            .output()
            .context("Could not run 'pw-dump'. Is PipeWire installed?")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            eyre::bail!("pw-dump failed: {}", stderr.trim());
        }

        let objects: Vec<DumpObject> =
            serde_json::from_slice(&output.stdout).context("Failed to parse pw-dump JSON")?;

        trace!("pw-dump returned {} objects", objects.len());
        Ok(objects)
    }

    /// Playback devices in a `pw-dump` snapshot, with the default marked
    #[must_use]
    pub fn get_playback_devices(objects: &[DumpObject]) -> Vec<PlaybackDevice> {
        let default_name = Self::get_default_sink_name_from_objects(objects);

        objects
            .iter()
            .filter_map(DumpObject::as_sink)
            .map(|(node_name, description)| PlaybackDevice {
                is_default: default_name.as_deref() == Some(node_name.as_str()),
                node_name,
                description,
            })
            .collect()
    }

    /// Find the device whose description matches exactly
    #[must_use]
    pub fn find_device<'a>(
        devices: &'a [PlaybackDevice],
        name: &DeviceName,
    ) -> Option<&'a PlaybackDevice> {
        devices.iter().find(|d| d.description == name.as_str())
    }

    /// Node name of the current default sink, from the `default` metadata object
    #[must_use]
    pub fn get_default_sink_name_from_objects(objects: &[DumpObject]) -> Option<String> {
        objects.iter().find_map(DumpObject::default_sink)
    }

    /// Set the default audio sink via `pw-metadata`
    ///
    /// Writes `default.configured.audio.sink` so the choice is what the user
    /// would get from a volume applet (and survives the sink disappearing
    /// and coming back).
    ///
    /// # Errors
    /// Returns an error if `pw-metadata` command fails or the sink cannot be set.
    pub fn set_default_sink(node_name: &str) -> Result<()> {
        // Serialized, never formatted by hand: node names may contain quotes
        let value = serde_json::to_string(&serde_json::json!({ "name": node_name }))
            .context("Failed to serialize sink name to JSON")?;

        let output = Command::new("pw-metadata")
            .args(["0", "default.configured.audio.sink", &value, "Spa:String:JSON"])
            .output()
            .with_context(|| format!("Could not run 'pw-metadata' to select '{node_name}'"))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            eyre::bail!(
                "pw-metadata rejected default sink '{}': {}",
                node_name,
                stderr.trim()
            );
        }

        debug!("Set default sink: {}", node_name);
        Ok(())
    }
}

/// [`AudioDirectory`] backed by the `PipeWire` command-line tools
#[derive(Debug, Clone, Copy, Default)]
pub struct PipeWireDirectory;

impl AudioDirectory for PipeWireDirectory {
    fn list_playback_devices(&self) -> Result<Vec<DeviceName>> {
        let objects = PipeWire::dump()?;
        Ok(PipeWire::get_playback_devices(&objects)
            .into_iter()
            .map(|d| DeviceName(d.description))
            .collect())
    }

    fn set_default_playback(&self, name: &DeviceName) -> Result<(), SwitchError> {
        let failed = |e: eyre::Report| SwitchError::Failed {
            device: name.clone(),
            reason: format!("{e:#}"),
        };

        let objects = PipeWire::dump().map_err(failed)?;
        let devices = PipeWire::get_playback_devices(&objects);
        let device = PipeWire::find_device(&devices, name)
            .ok_or_else(|| SwitchError::NotFound(name.clone()))?;

        PipeWire::set_default_sink(&device.node_name).map_err(failed)
    }
}
