//! `MOSW` - Monitor Output Switcher
//!
//! Switches the default `PipeWire` audio output to follow the monitor that holds
//! the focused window. Each monitor can be mapped to one output; moving focus
//! onto a mapped monitor makes its output the default.
//!
//! # Features
//! - Focus tracking on wlroots-based compositors (wlr-foreign-toplevel-management)
//! - Stable monitor keys built from EDID names and desktop geometry
//! - Persistent per-monitor mappings with live reload
//! - Status queries and shutdown over a Unix socket
//!
//! # Supported Compositors
//! - Sway, Hyprland, Niri, River, Wayfire, labwc, dwl (via wlr-foreign-toplevel)

pub mod audio;
pub mod cli;
pub mod commands;
pub mod compositor;
pub mod config;
pub mod daemon;
pub mod ipc;
pub mod logging;
pub mod mapping;
pub mod monitor;
pub mod notification;
pub mod pipewire;
pub mod style;
pub mod switcher;

/// Build-time information (version, git commit, build profile)
#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

// Re-export commonly used types for convenience
pub use cli::Args;
pub use config::Config;
pub use mapping::MappingTable;
pub use monitor::MonitorKey;
