//! Daemon settings
//!
//! `config.toml` holds tunables only. Monitor → device mappings live in their
//! own JSON file (see [`crate::mapping`]) so that `mosw map` can rewrite them
//! without touching hand-edited settings.

use color_eyre::eyre::{self, Context, ContextCompat, Result};
use serde::Deserialize;
use std::fs;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use tracing::info;

/// Allowed poll interval, in milliseconds
pub const POLL_INTERVAL_RANGE: RangeInclusive<u64> = 50..=10_000;
/// Allowed timeout for a single blocking call, in milliseconds
pub const CALL_TIMEOUT_RANGE: RangeInclusive<u64> = 100..=60_000;

const APP_DIR: &str = "mosw";
const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

/// Parsed `config.toml`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub settings: Settings,
}

/// The `[settings]` table; every key is optional
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Delay between two polls of the focused monitor
    pub poll_interval_ms: u64,
    /// Give up on a blocking call (sysfs, `pw-dump`, `pw-metadata`) after this long
    pub call_timeout_ms: u64,
    pub notify_daemon: bool,
    pub notify_switch: bool,
    /// Restart the switch loop when the mapping file changes
    pub watch_mappings: bool,
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            call_timeout_ms: 2000,
            notify_daemon: true,
            notify_switch: false,
            watch_mappings: true,
            log_level: "info".to_string(),
        }
    }
}

const DEFAULT_CONFIG: &str = r#"# MOSW (Monitor Output Switcher) Configuration
#
# Switches the default audio output to follow the monitor that holds the
# focused window. Monitor -> output assignments are stored separately in
# mappings.json next to this file; manage them with 'mosw map' / 'mosw unmap'.

[settings]
poll_interval_ms = 500     # How often the focused monitor is checked (50-10000)
call_timeout_ms = 2000     # Give up on a single PipeWire/sysfs call after this long (100-60000)
notify_daemon = true       # Notifications for daemon start/stop
notify_switch = false      # Notification on every automatic output switch
watch_mappings = true      # Reload mappings.json while the daemon runs
log_level = "info"         # error, warn, info, debug, trace
"#;

impl Config {
    /// Read `$XDG_CONFIG_HOME/mosw/config.toml`, writing the commented
    /// defaults there first if it does not exist yet
    ///
    /// # Errors
    /// Returns an error if the file cannot be created, read, parsed or validated.
    pub fn load() -> Result<Self> {
        let path = Self::get_config_path()?;
        if !path.exists() {
            info!("No config yet, writing defaults to {}", path.display());
            Self::create_default_config(&path)?;
        }
        Self::load_from_path(&path)
    }

    /// # Errors
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;

        Self::parse(&contents).with_context(|| format!("Invalid config: {}", path.display()))
    }

    /// # Errors
    /// Returns an error on malformed TOML, unknown keys or out-of-range values.
    pub fn parse(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents).context("Failed to parse config")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let settings = &self.settings;

        if !LOG_LEVELS.contains(&settings.log_level.as_str()) {
            eyre::bail!(
                "log_level = {:?} is not one of: {}",
                settings.log_level,
                LOG_LEVELS.join(", ")
            );
        }

        if !POLL_INTERVAL_RANGE.contains(&settings.poll_interval_ms) {
            eyre::bail!(
                "poll_interval_ms = {} is out of range ({}-{})",
                settings.poll_interval_ms,
                POLL_INTERVAL_RANGE.start(),
                POLL_INTERVAL_RANGE.end()
            );
        }

        if !CALL_TIMEOUT_RANGE.contains(&settings.call_timeout_ms) {
            eyre::bail!(
                "call_timeout_ms = {} is out of range ({}-{})",
                settings.call_timeout_ms,
                CALL_TIMEOUT_RANGE.start(),
                CALL_TIMEOUT_RANGE.end()
            );
        }

        Ok(())
    }

    fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Could not determine config directory")?
            .join(APP_DIR);
        fs::create_dir_all(&config_dir)
            .with_context(|| format!("Failed to create config dir: {}", config_dir.display()))?;
        Ok(config_dir)
    }

    /// `$XDG_CONFIG_HOME/mosw/config.toml`; the directory is created if missing
    ///
    /// # Errors
    /// Returns an error if the config directory cannot be determined or created.
    pub fn get_config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// `mappings.json` beside the config file
    ///
    /// # Errors
    /// Returns an error if the config directory cannot be determined or created.
    pub fn get_mappings_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("mappings.json"))
    }

    /// Write the commented default config
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn create_default_config(path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config dir: {}", parent.display()))?;
        }
        fs::write(path, DEFAULT_CONFIG)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;

        eprintln!("Created default config at: {}", path.display());
        eprintln!();
        eprintln!("To get going:");
        eprintln!("  mosw list-monitors && mosw list-sinks   # what is connected");
        eprintln!("  mosw map <MONITOR> <SINK>               # pair them up");
        eprintln!("  mosw daemon                             # follow focus");
        eprintln!();

        Ok(())
    }

    /// Effective settings and file locations, as printed by `mosw validate`
    pub fn print_summary(&self) {
        let s = &self.settings;
        println!("✓ Configuration valid\n");
        println!("[settings]");
        for (key, value) in [
            ("poll_interval_ms", s.poll_interval_ms.to_string()),
            ("call_timeout_ms", s.call_timeout_ms.to_string()),
            ("notify_daemon", s.notify_daemon.to_string()),
            ("notify_switch", s.notify_switch.to_string()),
            ("watch_mappings", s.watch_mappings.to_string()),
            ("log_level", s.log_level.clone()),
        ] {
            println!("  {key:<17} {value}");
        }

        if let Ok(path) = Self::get_config_path() {
            println!("\nConfig: {}", path.display());
        }
        if let Ok(path) = Self::get_mappings_path() {
            let persisted = crate::mapping::load(&path);
            let mapped = persisted.values().filter(|d| !d.is_empty()).count();
            println!("Mappings: {} ({} mapped)", path.display(), mapped);
        }
    }

    /// Log filter directive for this config (e.g. `mosw=debug`)
    #[must_use]
    pub fn log_directive(&self) -> String {
        format!("mosw={}", self.settings.log_level)
    }
}

/// Directory for the daemon log (`$XDG_DATA_HOME/mosw`)
///
/// # Errors
/// Returns an error if the data directory cannot be determined.
pub fn get_data_dir() -> Result<PathBuf> {
    Ok(dirs::data_dir()
        .context("Could not determine data directory")?
        .join(APP_DIR))
}
