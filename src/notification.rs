//! Desktop notifications
//!
//! Handles sending notifications via notify-rust and icon detection
//! using `FreeDesktop` standard icon names.

use color_eyre::eyre::{Context, Result};
use notify_rust::Notification;

use crate::audio::DeviceName;

/// Send a desktop notification
///
/// # Errors
/// Returns an error if the notification cannot be sent (e.g., no notification daemon running).
pub fn send_notification(summary: &str, body: &str, icon: Option<&str>) -> Result<()> {
    let icon = icon.unwrap_or("audio-card");

    Notification::new()
        .summary(summary)
        .body(body)
        .appname("MOSW")
        .icon(icon)
        .timeout(3000)
        .show()
        .context("Failed to show notification")?;

    Ok(())
}

/// Icon for a playback device, guessed from its name
#[must_use]
pub fn get_device_icon(device: &DeviceName) -> &'static str {
    let name = device.as_str().to_lowercase();

    if name.contains("hdmi") || name.contains("tv") || name.contains("display") {
        "video-display"
    } else if name.contains("headphone") || name.contains("headset") || name.contains("bluetooth") {
        "audio-headphones"
    } else {
        // Default for speakers, optical, digital, etc.
        "audio-speakers"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("HDMI Output", "video-display" ; "hdmi")]
    #[test_case("LG TV", "video-display" ; "tv")]
    #[test_case("DisplayPort 2", "video-display" ; "display")]
    #[test_case("Headphones", "audio-headphones" ; "headphones")]
    #[test_case("Bluetooth Headset", "audio-headphones" ; "headset")]
    #[test_case("Analog Stereo", "audio-speakers" ; "analog")]
    #[test_case("Digital Output", "audio-speakers" ; "digital")]
    fn test_get_device_icon(name: &str, icon: &str) {
        assert_eq!(get_device_icon(&DeviceName::from(name)), icon);
    }
}
