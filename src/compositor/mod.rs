//! Compositor abstraction layer
//!
//! Answers the one question the switch loop asks every tick: which monitor
//! holds the focused window right now?
//!
//! The Wayland implementation keeps a [`DesktopSnapshot`] (outputs + focused
//! toplevel) up to date from a dedicated thread using
//! wlr-foreign-toplevel-management, which is supported by Sway, Hyprland, Niri,
//! River, Wayfire, labwc, dwl and hikari. The loop reads the latest snapshot
//! without blocking.

mod wlr_toplevel;

use color_eyre::eyre::{Context, Result};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};
use wayland_client::Connection;

use crate::monitor::{MonitorDescriptor, MonitorId};

/// Source of "where is the user looking" observations
pub trait Desktop: Send + Sync {
    /// Monitor holding the focused window
    ///
    /// `None` when there is no focused window or no monitor information.
    fn active_monitor(&self) -> Option<MonitorDescriptor>;

    /// All currently attached monitors
    fn monitors(&self) -> Vec<MonitorDescriptor>;
}

/// The focused (activated) toplevel and the outputs it is shown on
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FocusedWindow {
    pub id: u64,
    pub app_id: String,
    /// Outputs the window currently overlaps, in the order it entered them
    pub outputs: Vec<MonitorId>,
    /// Output the window most recently left
    pub last_output: Option<MonitorId>,
}

/// Point-in-time view of the compositor
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesktopSnapshot {
    /// Fully described outputs, sorted by id
    pub outputs: Vec<MonitorDescriptor>,
    pub focused: Option<FocusedWindow>,
}

impl DesktopSnapshot {
    #[must_use]
    pub fn output(&self, id: MonitorId) -> Option<&MonitorDescriptor> {
        self.outputs.iter().find(|o| o.id == id)
    }

    /// Monitor holding the focused window, with nearest-output fallback
    ///
    /// A window spanning several outputs resolves to the first one it entered
    /// that is still attached. A window on no output (off-screen, or its
    /// output was unplugged) resolves to the output it last left, then to the
    /// first attached output. Only "no focused window" or "no outputs at all"
    /// yield `None`.
    #[must_use]
    pub fn focused_monitor(&self) -> Option<&MonitorDescriptor> {
        let focused = self.focused.as_ref()?;

        focused
            .outputs
            .iter()
            .chain(focused.last_output.iter())
            .find_map(|id| self.output(*id))
            .or_else(|| self.outputs.first())
    }
}

/// [`Desktop`] fed by the Wayland tracker thread
#[derive(Debug, Clone)]
pub struct WaylandDesktop {
    snapshots: watch::Receiver<DesktopSnapshot>,
}

impl WaylandDesktop {
    #[must_use]
    pub fn new(snapshots: watch::Receiver<DesktopSnapshot>) -> Self {
        Self { snapshots }
    }

    /// Receiver for change notifications (output hotplug, focus changes)
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<DesktopSnapshot> {
        self.snapshots.clone()
    }

    /// Wait until the tracker has reported at least one output
    ///
    /// Returns false on timeout or if the tracker thread died.
    pub async fn wait_for_outputs(&self, timeout: Duration) -> bool {
        let mut rx = self.snapshots.clone();
        let ready = tokio::time::timeout(timeout, rx.wait_for(|s| !s.outputs.is_empty())).await;
        matches!(ready, Ok(Ok(_)))
    }
}

impl Desktop for WaylandDesktop {
    fn active_monitor(&self) -> Option<MonitorDescriptor> {
        self.snapshots.borrow().focused_monitor().cloned()
    }

    fn monitors(&self) -> Vec<MonitorDescriptor> {
        self.snapshots.borrow().outputs.clone()
    }
}

/// Spawn a dedicated thread tracking outputs and the focused toplevel
///
/// Connects to the Wayland display, binds `zwlr_foreign_toplevel_manager_v1`
/// and every `wl_output`, then keeps dispatching events. Each batch of
/// changes is published as a fresh [`DesktopSnapshot`] on the returned
/// channel.
///
/// # Errors
///
/// Returns an error if:
/// - No Wayland display connection can be established
/// - The compositor does not offer wlr-foreign-toplevel-management
///
/// # Channel Behavior
///
/// The sender is dropped (and `changed()` on the receiver starts failing)
/// when the compositor disconnects or the Wayland thread hits a fatal error.
/// The thread exits once every receiver has been dropped and the next event
/// arrives.
pub fn spawn_compositor_thread() -> Result<WaylandDesktop> {
    let conn = Connection::connect_to_env()
        .context("Failed to connect to Wayland display. Is a Wayland compositor running?")?;

    info!("Connected to Wayland display");

    let (tx, rx) = watch::channel(DesktopSnapshot::default());

    // The thread reports setup success/failure before entering its loop
    let (ready_tx, ready_rx) = std::sync::mpsc::sync_channel::<Result<()>>(1);

    std::thread::Builder::new()
        .name("mosw-wayland".to_string())
        .spawn(move || {
            if let Err(e) = wlr_toplevel::run_event_loop(conn, tx, ready_tx) {
                error!("Wayland event loop error: {:#}", e);
            }
            debug!("Wayland thread exiting");
        })
        .context("Failed to spawn Wayland thread")?;

    ready_rx
        .recv()
        .context("Wayland thread exited during setup")??;

    info!("Using wlr-foreign-toplevel-management protocol");
    Ok(WaylandDesktop::new(rx))
}

/// One-shot enumeration of attached outputs (for CLI commands)
///
/// # Errors
/// Returns an error if the Wayland display cannot be reached.
pub fn enumerate_outputs() -> Result<Vec<MonitorDescriptor>> {
    let conn = Connection::connect_to_env()
        .context("Failed to connect to Wayland display. Is a Wayland compositor running?")?;
    wlr_toplevel::probe_outputs(&conn)
}
