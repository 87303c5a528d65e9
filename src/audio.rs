//! Audio device directory seam
//!
//! The switch loop only needs two things from the audio system: the list of
//! playback devices by user-visible name, and a way to make one of them the
//! default. [`AudioDirectory`] is that seam; `PipeWireDirectory` is the real
//! implementation and tests plug in in-memory fakes.

use color_eyre::eyre::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// User-visible name of a playback device (e.g. `"Speakers"`)
///
/// Used both as the mapping value and as the lookup key into the directory.
/// Names are best-effort: drivers may rename devices across reboots. An empty
/// name means "no preference".
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceName(pub String);

impl DeviceName {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Empty names mean "no preference, do not switch"
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for DeviceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceName {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Why a default-device switch did not happen
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SwitchError {
    /// No currently enumerated device carries this exact name
    #[error("playback device '{0}' not found")]
    NotFound(DeviceName),
    /// The device exists but the audio system rejected or timed out the switch
    #[error("failed to switch to '{device}': {reason}")]
    Failed { device: DeviceName, reason: String },
}

/// Live directory of playback devices
///
/// Implementations must query the audio system on every call: devices come and
/// go while the daemon runs, so nothing may be cached between calls.
pub trait AudioDirectory: Send + Sync {
    /// Names of all currently available playback devices
    ///
    /// # Errors
    /// Returns an error if the audio system cannot be queried.
    fn list_playback_devices(&self) -> Result<Vec<DeviceName>>;

    /// Make the named device the system default
    ///
    /// # Errors
    /// [`SwitchError::NotFound`] if no device has this name,
    /// [`SwitchError::Failed`] if the switch itself failed.
    fn set_default_playback(&self, name: &DeviceName) -> Result<(), SwitchError>;
}
