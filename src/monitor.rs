//! Monitor identity resolution
//!
//! Turns a compositor output observation into a stable [`MonitorKey`]: the
//! monitor's friendly name plus its rectangle in virtual-screen coordinates.
//!
//! The friendly name comes from the EDID blob the kernel exposes for each DRM
//! connector (`/sys/class/drm/card<N>-<connector>/edid`). When no blob matches or
//! it carries no display name, the connector name is used instead. That fallback
//! is the normal path on many setups (virtual outputs, nested compositors), so
//! it never surfaces as an error.

use color_eyre::eyre::{self, Context, Result};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::LazyLock;
use tracing::trace;

/// Default location of DRM connector records
pub const DEFAULT_DRM_ROOT: &str = "/sys/class/drm";

/// EDID base block size
const EDID_BLOCK_LEN: usize = 128;

/// Fixed 8-byte EDID header
const EDID_HEADER: [u8; 8] = [0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x00];

/// Offsets of the four 18-byte descriptor slots in the base block
const EDID_DESCRIPTOR_OFFSETS: [usize; 4] = [54, 72, 90, 108];

/// Display descriptor tag for "display product name"
const EDID_TAG_PRODUCT_NAME: u8 = 0xFC;

// ============================================================================
// Value Types
// ============================================================================

/// Opaque per-session handle of an output (Wayland protocol object id)
///
/// Cheap to compare, but not stable across compositor restarts. Use
/// [`MonitorKey`] for anything that is persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MonitorId(pub u32);

impl fmt::Display for MonitorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Bounding rectangle in virtual-screen coordinates (right/bottom exclusive)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    /// Build a rectangle from a position and size
    #[must_use]
    pub fn from_origin_size(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            left: x,
            top: y,
            right: x.saturating_add(width),
            bottom: y.saturating_add(height),
        }
    }
}

/// Raw observation of an attached monitor, as reported by the compositor
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonitorDescriptor {
    pub id: MonitorId,
    /// Connector name (e.g. `DP-1`), only advertised by `wl_output` v4+
    pub connector: Option<String>,
    pub make: String,
    pub model: String,
    /// Compositor-provided human description, informational only
    pub description: Option<String>,
    pub rect: Rect,
}

impl MonitorDescriptor {
    /// OS-assigned identifier used when no friendly name can be found
    ///
    /// Connector name if known, otherwise `make model`, otherwise `output-<id>`.
    #[must_use]
    pub fn device_path(&self) -> String {
        if let Some(connector) = self.connector.as_deref().filter(|c| !c.is_empty()) {
            return connector.to_string();
        }

        let make_model = format!("{} {}", self.make.trim(), self.model.trim());
        let make_model = make_model.trim();
        if make_model.is_empty() {
            format!("output-{}", self.id)
        } else {
            make_model.to_string()
        }
    }
}

/// Stable identity of a physical display: friendly name + rectangle
///
/// Equality is structural over all five fields. The string form
/// `"<name>: <left>,<top> -> <right>,<bottom>"` exists for display and for the
/// persisted mapping file; never compare keys through it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MonitorKey {
    // Field order drives `Ord`: sort left-to-right, then top-to-bottom.
    pub rect: Rect,
    pub name: String,
}

impl MonitorKey {
    #[must_use]
    pub fn new(name: impl Into<String>, rect: Rect) -> Self {
        Self {
            rect,
            name: name.into(),
        }
    }
}

impl fmt::Display for MonitorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {},{} -> {},{}",
            self.name, self.rect.left, self.rect.top, self.rect.right, self.rect.bottom
        )
    }
}

static KEY_PATTERN: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(
        r"(?s)^(?P<name>.*): (?P<left>-?\d+),(?P<top>-?\d+) -> (?P<right>-?\d+),(?P<bottom>-?\d+)$",
    )
    .expect("monitor key pattern is a valid regex")
});

impl FromStr for MonitorKey {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        let caps = KEY_PATTERN
            .captures(s)
            .ok_or_else(|| eyre::eyre!("Not a monitor key: '{s}'"))?;

        let coord = |field: &str| -> Result<i32> {
            caps[field]
                .parse()
                .with_context(|| format!("Coordinate '{field}' out of range in '{s}'"))
        };

        Ok(Self::new(
            &caps["name"],
            Rect {
                left: coord("left")?,
                top: coord("top")?,
                right: coord("right")?,
                bottom: coord("bottom")?,
            },
        ))
    }
}

// ============================================================================
// Resolver
// ============================================================================

/// Builds [`MonitorKey`]s from [`MonitorDescriptor`]s
///
/// This is the only constructor of keys from live hardware; the mapping table
/// and the switch loop must both go through it so lookups agree.
#[derive(Debug, Clone)]
pub struct MonitorResolver {
    drm_root: PathBuf,
}

impl Default for MonitorResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl MonitorResolver {
    /// Resolver reading EDID data from [`DEFAULT_DRM_ROOT`]
    #[must_use]
    pub fn new() -> Self {
        Self::with_drm_root(DEFAULT_DRM_ROOT)
    }

    /// Resolver reading EDID data from a custom directory (used by tests)
    #[must_use]
    pub fn with_drm_root(drm_root: impl Into<PathBuf>) -> Self {
        Self {
            drm_root: drm_root.into(),
        }
    }

    /// Resolve the stable key for a monitor. Never fails.
    #[must_use]
    pub fn resolve_key(&self, monitor: &MonitorDescriptor) -> MonitorKey {
        let name = monitor
            .connector
            .as_deref()
            .and_then(|connector| self.friendly_name(connector))
            .unwrap_or_else(|| {
                let path = monitor.device_path();
                trace!("No EDID name for output {}, using '{}'", monitor.id, path);
                path
            });

        MonitorKey::new(name, monitor.rect)
    }

    /// Look up the EDID display name for a connector
    ///
    /// Returns `None` when no connector record matches, when the record has no
    /// usable EDID, or when sysfs cannot be read at all.
    #[must_use]
    pub fn friendly_name(&self, connector: &str) -> Option<String> {
        match self.lookup_edid_name(connector) {
            Ok(name) => name,
            Err(e) => {
                trace!("EDID lookup for {} failed: {:#}", connector, e);
                None
            }
        }
    }

    fn lookup_edid_name(&self, connector: &str) -> Result<Option<String>> {
        let entries = fs::read_dir(&self.drm_root)
            .with_context(|| format!("Failed to read {}", self.drm_root.display()))?;

        for entry in entries {
            let entry = entry?;
            let file_name = entry.file_name();
            let Some(record) = file_name.to_str() else {
                continue;
            };
            if !connector_matches(record, connector) {
                continue;
            }

            // Multi-GPU systems can expose the same connector name on several
            // cards; only the connected one carries a non-empty EDID.
            match read_edid_name(&entry.path()) {
                Some(name) => return Ok(Some(name)),
                None => continue,
            }
        }

        Ok(None)
    }
}

/// `card<N>-<connector>` must match the whole connector name (`DP-1` ≠ `DP-10`)
fn connector_matches(record: &str, connector: &str) -> bool {
    record
        .strip_prefix("card")
        .and_then(|rest| rest.split_once('-'))
        .is_some_and(|(index, name)| {
            !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit()) && name == connector
        })
}

fn read_edid_name(record_dir: &Path) -> Option<String> {
    let edid = fs::read(record_dir.join("edid")).ok()?;
    parse_edid_name(&edid)
}

/// Extract the display product name (descriptor tag `0xFC`) from an EDID blob
#[must_use]
pub fn parse_edid_name(edid: &[u8]) -> Option<String> {
    if edid.len() < EDID_BLOCK_LEN || edid[..EDID_HEADER.len()] != EDID_HEADER {
        return None;
    }

    EDID_DESCRIPTOR_OFFSETS.iter().find_map(|&offset| {
        let descriptor = &edid[offset..offset + 18];
        if descriptor[..3] != [0, 0, 0] || descriptor[3] != EDID_TAG_PRODUCT_NAME {
            return None;
        }

        // Up to 13 characters, terminated by LF and padded with spaces
        let text = &descriptor[5..];
        let end = text.iter().position(|&b| b == 0x0A).unwrap_or(text.len());
        let name = String::from_utf8_lossy(&text[..end]).trim().to_string();
        (!name.is_empty()).then_some(name)
    })
}
