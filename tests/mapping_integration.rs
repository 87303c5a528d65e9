//! Integration tests for the monitor key → mapping file → table pipeline
//!
//! Uses a fake DRM sysfs tree so monitor names come from real EDID parsing.

use mosw::audio::DeviceName;
use mosw::mapping::{self, MappingTable};
use mosw::monitor::{MonitorDescriptor, MonitorId, MonitorResolver, Rect};
use pretty_assertions::assert_eq;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// EDID base block carrying only a display product name descriptor
fn edid_with_name(name: &str) -> Vec<u8> {
    let mut edid = vec![0u8; 128];
    edid[..8].copy_from_slice(&[0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x00]);

    let slot = 72;
    edid[slot + 3] = 0xFC;
    let mut text = [0x20u8; 13];
    text[..name.len()].copy_from_slice(name.as_bytes());
    text[name.len()] = 0x0A;
    edid[slot + 5..slot + 18].copy_from_slice(&text);
    edid
}

fn drm_tree(records: &[(&str, &str)]) -> TempDir {
    let dir = TempDir::new().expect("Failed to create temp dir");
    for (record, name) in records {
        let path = dir.path().join(record);
        fs::create_dir_all(&path).expect("Failed to create record dir");
        fs::write(path.join("edid"), edid_with_name(name)).expect("Failed to write EDID");
    }
    dir
}

fn output(id: u32, connector: &str, x: i32) -> MonitorDescriptor {
    MonitorDescriptor {
        id: MonitorId(id),
        connector: Some(connector.to_string()),
        rect: Rect::from_origin_size(x, 0, 2560, 1440),
        ..Default::default()
    }
}

fn build_table(resolver: &MonitorResolver, outputs: &[MonitorDescriptor], path: &Path) -> MappingTable {
    MappingTable::reconcile(outputs.iter().map(|o| resolver.resolve_key(o)), &mapping::load(path))
}

#[test]
fn test_mappings_survive_restart() {
    let drm = drm_tree(&[("card0-DP-1", "DELL U2720Q"), ("card0-HDMI-A-1", "LG TV")]);
    let resolver = MonitorResolver::with_drm_root(drm.path());
    let config = TempDir::new().expect("Failed to create temp dir");
    let path = config.path().join("mappings.json");

    let outputs = [output(1, "DP-1", 0), output(2, "HDMI-A-1", 2560)];

    let mut table = build_table(&resolver, &outputs, &path);
    let tv = resolver.resolve_key(&outputs[1]);
    assert_eq!(tv.to_string(), "LG TV: 2560,0 -> 5120,1440");
    table.set(tv.clone(), DeviceName::from("HDMI Audio"));
    mapping::save(&path, &table).expect("Failed to save mappings");

    // Output ids change across compositor restarts; keys do not
    let restarted = [output(41, "DP-1", 0), output(42, "HDMI-A-1", 2560)];
    let reloaded = build_table(&resolver, &restarted, &path);

    assert_eq!(reloaded.len(), 2);
    assert_eq!(reloaded.mapped_count(), 1);
    assert_eq!(reloaded.target_for(&tv), Some(&DeviceName::from("HDMI Audio")));
    assert_eq!(reloaded.target_for(&resolver.resolve_key(&restarted[0])), None);
}

#[test]
fn test_detached_monitor_mapping_is_dropped_on_save() {
    let drm = drm_tree(&[("card0-DP-1", "DELL U2720Q"), ("card1-DP-2", "BenQ")]);
    let resolver = MonitorResolver::with_drm_root(drm.path());
    let config = TempDir::new().expect("Failed to create temp dir");
    let path = config.path().join("mappings.json");

    let outputs = [output(1, "DP-1", 0), output(2, "DP-2", 2560)];
    let mut table = build_table(&resolver, &outputs, &path);
    table.set(resolver.resolve_key(&outputs[0]), DeviceName::from("Speakers"));
    table.set(resolver.resolve_key(&outputs[1]), DeviceName::from("Headphones"));
    mapping::save(&path, &table).expect("Failed to save mappings");

    // BenQ unplugged
    let remaining = [output(1, "DP-1", 0)];
    let table = build_table(&resolver, &remaining, &path);
    mapping::save(&path, &table).expect("Failed to save mappings");

    let stored = mapping::load(&path);
    assert_eq!(stored.len(), 1);
    assert_eq!(
        stored.get("DELL U2720Q: 0,0 -> 2560,1440").map(String::as_str),
        Some("Speakers")
    );
}

#[test]
fn test_moved_monitor_starts_unmapped() {
    let drm = drm_tree(&[("card0-DP-1", "DELL U2720Q")]);
    let resolver = MonitorResolver::with_drm_root(drm.path());
    let config = TempDir::new().expect("Failed to create temp dir");
    let path = config.path().join("mappings.json");

    let mut table = build_table(&resolver, &[output(1, "DP-1", 0)], &path);
    table.set(resolver.resolve_key(&output(1, "DP-1", 0)), DeviceName::from("Speakers"));
    mapping::save(&path, &table).expect("Failed to save mappings");

    let moved = build_table(&resolver, &[output(1, "DP-1", 1920)], &path);
    assert_eq!(moved.len(), 1);
    assert_eq!(moved.mapped_count(), 0);
}

#[test]
fn test_connector_without_edid_uses_connector_name() {
    let drm = TempDir::new().expect("Failed to create temp dir");
    let resolver = MonitorResolver::with_drm_root(drm.path());

    let key = resolver.resolve_key(&output(7, "eDP-1", 0));
    assert_eq!(key.name, "eDP-1");
}
