//! Monitor → playback device mapping
//!
//! The table is built by reconciling the persisted mapping file against the
//! monitors attached right now: every attached monitor gets an entry
//! (defaulting to "no preference"), and persisted values survive only for
//! monitors that are still present. Entries for detached monitors are dropped,
//! so the configuration always reflects the current hardware.
//!
//! The file is a flat JSON object of `"<monitor key>": "<device name>"`. It is
//! allowed to be missing (first run) or garbage (treated as empty).

use color_eyre::eyre::{Context, ContextCompat, Result};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::Write;
use std::path::Path;
use tracing::{debug, warn};

use crate::audio::DeviceName;
use crate::monitor::MonitorKey;

/// Raw contents of the mapping file (key strings are not validated yet)
pub type PersistedMappings = BTreeMap<String, String>;

/// Immutable-once-built table from monitor key to desired device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MappingTable {
    entries: HashMap<MonitorKey, DeviceName>,
}

impl MappingTable {
    /// Merge currently attached monitors with persisted values
    ///
    /// Persisted entries whose key does not parse, or does not equal one of
    /// `current`, are dropped.
    #[must_use]
    pub fn reconcile(
        current: impl IntoIterator<Item = MonitorKey>,
        persisted: &PersistedMappings,
    ) -> Self {
        let mut entries: HashMap<MonitorKey, DeviceName> = current
            .into_iter()
            .map(|key| (key, DeviceName::default()))
            .collect();

        for (raw_key, device) in persisted {
            let key = match raw_key.parse::<MonitorKey>() {
                Ok(key) => key,
                Err(e) => {
                    debug!("Dropping unparsable mapping entry: {:#}", e);
                    continue;
                }
            };

            match entries.get_mut(&key) {
                Some(slot) => *slot = DeviceName::new(device.as_str()),
                None => debug!("Dropping mapping for detached monitor: {}", raw_key),
            }
        }

        Self { entries }
    }

    /// Device to switch to for this monitor
    ///
    /// `None` when the monitor is unknown or mapped to "no preference".
    #[must_use]
    pub fn target_for(&self, key: &MonitorKey) -> Option<&DeviceName> {
        self.entries.get(key).filter(|device| !device.is_empty())
    }

    /// Set the device for a monitor (inserting the monitor if needed)
    pub fn set(&mut self, key: MonitorKey, device: DeviceName) {
        self.entries.insert(key, device);
    }

    /// Reset a monitor to "no preference"; returns false if the monitor is unknown
    pub fn clear(&mut self, key: &MonitorKey) -> bool {
        match self.entries.get_mut(key) {
            Some(slot) => {
                *slot = DeviceName::default();
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn contains(&self, key: &MonitorKey) -> bool {
        self.entries.contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of monitors with a device preference
    #[must_use]
    pub fn mapped_count(&self) -> usize {
        self.entries.values().filter(|d| !d.is_empty()).count()
    }

    /// Entries in display order (left-to-right, top-to-bottom)
    #[must_use]
    pub fn iter(&self) -> Vec<(&MonitorKey, &DeviceName)> {
        let mut entries: Vec<_> = self.entries.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries
    }

    /// Serializable form, keyed by the canonical key string
    #[must_use]
    pub fn to_persisted(&self) -> PersistedMappings {
        self.entries
            .iter()
            .map(|(key, device)| (key.to_string(), device.to_string()))
            .collect()
    }
}

/// Load the persisted mapping file, never failing
///
/// A missing file is the first-run case. Unreadable or malformed files are
/// logged and treated as empty so startup always proceeds.
#[must_use]
pub fn load(path: &Path) -> PersistedMappings {
    if !path.exists() {
        debug!("No mapping file at {}", path.display());
        return PersistedMappings::new();
    }

    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => {
            warn!("Could not read mapping file {}: {}", path.display(), e);
            return PersistedMappings::new();
        }
    };

    match serde_json::from_str(&contents) {
        Ok(mappings) => mappings,
        Err(e) => {
            warn!(
                "Ignoring malformed mapping file {}: {}",
                path.display(),
                e
            );
            PersistedMappings::new()
        }
    }
}

/// Persist the table atomically (write to a temp file, then rename)
///
/// # Errors
/// Returns an error if the directory cannot be created or the file cannot be written.
pub fn save(path: &Path, table: &MappingTable) -> Result<()> {
    let dir = path
        .parent()
        .context("Mapping file path has no parent directory")?;
    fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create config dir: {}", dir.display()))?;

    let json = serde_json::to_string_pretty(&table.to_persisted())
        .context("Failed to serialize mappings")?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
    tmp.write_all(json.as_bytes())
        .context("Failed to write mappings")?;
    tmp.write_all(b"\n").context("Failed to write mappings")?;
    tmp.persist(path)
        .with_context(|| format!("Failed to replace {}", path.display()))?;

    debug!("Saved {} mappings to {}", table.len(), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::Rect;
    use pretty_assertions::assert_eq;

    fn key(name: &str, x: i32) -> MonitorKey {
        MonitorKey::new(name, Rect::from_origin_size(x, 0, 1920, 1080))
    }

    fn persisted(entries: &[(&str, &str)]) -> PersistedMappings {
        entries
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_reconcile_defaults_to_no_preference() {
        let table = MappingTable::reconcile([key("A", 0), key("B", 1920)], &PersistedMappings::new());
        assert_eq!(table.len(), 2);
        assert_eq!(table.mapped_count(), 0);
        assert_eq!(table.target_for(&key("A", 0)), None);
    }

    #[test]
    fn test_reconcile_keeps_present_and_drops_stale() {
        let stored = persisted(&[
            ("A: 0,0 -> 1920,1080", "Speakers"),
            ("Old: 3840,0 -> 5760,1080", "Headphones"),
            ("garbage", "Nothing"),
        ]);
        let table = MappingTable::reconcile([key("A", 0), key("B", 1920)], &stored);

        assert_eq!(table.len(), 2);
        assert_eq!(table.target_for(&key("A", 0)), Some(&DeviceName::from("Speakers")));
        assert_eq!(table.target_for(&key("B", 1920)), None);
        assert!(!table.contains(&key("Old", 3840)));
    }

    #[test]
    fn test_reconcile_requires_matching_geometry() {
        // Same monitor, moved: the old position no longer matches
        let stored = persisted(&[("A: 0,0 -> 1920,1080", "Speakers")]);
        let table = MappingTable::reconcile([key("A", 1920)], &stored);
        assert_eq!(table.target_for(&key("A", 1920)), None);
    }

    #[test]
    fn test_target_for_empty_is_none() {
        let stored = persisted(&[("A: 0,0 -> 1920,1080", "")]);
        let table = MappingTable::reconcile([key("A", 0)], &stored);
        assert!(table.contains(&key("A", 0)));
        assert_eq!(table.target_for(&key("A", 0)), None);
    }

    #[test]
    fn test_clear_unknown_monitor() {
        let mut table = MappingTable::reconcile([key("A", 0)], &PersistedMappings::new());
        assert!(!table.clear(&key("B", 1920)));
        assert!(table.clear(&key("A", 0)));
    }

    #[test]
    fn test_iter_orders_by_position() {
        let table = MappingTable::reconcile([key("Z", 1920), key("Y", 0)], &PersistedMappings::new());
        let names: Vec<_> = table.iter().into_iter().map(|(k, _)| k.name.as_str()).collect();
        assert_eq!(names, vec!["Y", "Z"]);
    }

    #[test]
    fn test_load_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(&dir.path().join("mappings.json")).is_empty());
    }

    #[test]
    fn test_load_malformed_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mappings.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(load(&path).is_empty());

        fs::write(&path, r#"["a", "list"]"#).unwrap();
        assert!(load(&path).is_empty());
    }

    #[test]
    fn test_save_creates_parent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("mappings.json");
        let mut table = MappingTable::reconcile([key("A", 0)], &PersistedMappings::new());
        table.set(key("A", 0), DeviceName::from("Speakers"));

        save(&path, &table).unwrap();
        assert_eq!(load(&path), persisted(&[("A: 0,0 -> 1920,1080", "Speakers")]));
    }
}
