//! Daemon mode
//!
//! Wires the compositor tracker, the mapping snapshot and the switch loop
//! together, serves IPC, and restarts the loop when the mapping file or the
//! set of attached monitors changes.

use color_eyre::eyre::{self, Context, Result};
use notify::{RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::audio::AudioDirectory;
use crate::built_info;
use crate::compositor::{self, Desktop};
use crate::config::Config;
use crate::ipc::{self, ControlSocket, Request, Response};
use crate::logging;
use crate::mapping::{self, MappingTable};
use crate::monitor::{MonitorDescriptor, MonitorResolver};
use crate::notification::{get_device_icon, send_notification};
use crate::pipewire::{PipeWire, PipeWireDirectory};
use crate::switcher::{LoopSettings, SwitchEvent, SwitchLoop};

/// How long to wait for the compositor to describe its outputs
const FIRST_SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(2);
/// Coalesce bursts of file events (editors write several times per save)
const RELOAD_DEBOUNCE: Duration = Duration::from_millis(250);

/// What the daemon reports over IPC
#[derive(Debug, Clone, Default)]
struct DaemonStatus {
    monitor: Option<String>,
    device: Option<String>,
    mapped_monitors: usize,
}

impl DaemonStatus {
    fn apply(&mut self, event: &SwitchEvent) {
        match event {
            SwitchEvent::MonitorChanged { key } => self.monitor = Some(key.to_string()),
            SwitchEvent::Switched { device, .. } => self.device = Some(device.to_string()),
            SwitchEvent::SwitchFailed { .. } => {}
        }
    }
}

/// A started switch loop and its cancellation handle
struct RunningLoop {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl RunningLoop {
    fn start(switcher: SwitchLoop) -> Self {
        let (shutdown, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(switcher.run(shutdown_rx));
        Self { shutdown, handle }
    }

    async fn stop(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.handle.await {
            error!("Switch loop task failed: {}", e);
        }
    }
}

/// Everything needed to (re)build and (re)start the switch loop
struct LoopFactory {
    desktop: Arc<dyn Desktop>,
    audio: Arc<dyn AudioDirectory>,
    resolver: Arc<MonitorResolver>,
    settings: LoopSettings,
    mappings_path: PathBuf,
    events: mpsc::UnboundedSender<SwitchEvent>,
}

impl LoopFactory {
    /// Reconcile the mapping file against the monitors attached right now
    async fn build_table(&self) -> Result<Arc<MappingTable>> {
        let desktop = Arc::clone(&self.desktop);
        let resolver = Arc::clone(&self.resolver);
        let path = self.mappings_path.clone();

        let table = tokio::task::spawn_blocking(move || {
            let monitors = desktop.monitors();
            let persisted = mapping::load(&path);
            MappingTable::reconcile(monitors.iter().map(|m| resolver.resolve_key(m)), &persisted)
        })
        .await
        .context("Mapping table build panicked")?;

        for (key, device) in table.iter() {
            if device.is_empty() {
                debug!("  {} -> (no preference)", key);
            } else {
                info!("  {} -> {}", key, device);
            }
        }

        Ok(Arc::new(table))
    }

    async fn start(&self, status: &mut DaemonStatus) -> Result<RunningLoop> {
        let table = self.build_table().await?;
        status.mapped_monitors = table.mapped_count();

        let switcher = SwitchLoop::new(
            Arc::clone(&self.desktop),
            Arc::clone(&self.audio),
            Arc::clone(&self.resolver),
            table,
            self.settings,
        )
        .with_events(self.events.clone());

        Ok(RunningLoop::start(switcher))
    }

    /// Stop `previous` and start a fresh loop on the current mappings
    ///
    /// A failed start leaves the daemon without a loop until the next reload
    /// or hotplug.
    async fn restart(
        &self,
        previous: Option<RunningLoop>,
        status: &mut DaemonStatus,
    ) -> Option<RunningLoop> {
        if let Some(previous) = previous {
            previous.stop().await;
        }
        match self.start(status).await {
            Ok(restarted) => {
                info!("Mappings reloaded ({} mapped)", status.mapped_monitors);
                Some(restarted)
            }
            Err(e) => {
                error!("Failed to restart switch loop, waiting for the next change: {:#}", e);
                status.mapped_monitors = 0;
                None
            }
        }
    }
}

/// Watch the directory of the mapping file (it is replaced by rename on save)
fn watch_mappings(path: &Path, tx: mpsc::UnboundedSender<()>) -> Result<notify::RecommendedWatcher> {
    let dir = path
        .parent()
        .ok_or_else(|| eyre::eyre!("Mapping file has no parent directory"))?;
    let file_name = path.file_name().map(ToOwned::to_owned);

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        match res {
            Ok(event) => {
                if event
                    .paths
                    .iter()
                    .any(|p| p.file_name() == file_name.as_deref())
                {
                    let _ = tx.send(());
                }
            }
            Err(e) => warn!("Mapping file watch error: {}", e),
        }
    })
    .context("Failed to create file watcher")?;

    watcher
        .watch(dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("Failed to watch config directory: {}", dir.display()))?;

    Ok(watcher)
}

fn notify_daemon_event(config: &Config, summary: &str, body: &str) {
    if config.settings.notify_daemon
        && let Err(e) = send_notification(summary, body, None)
    {
        warn!("Could not send notification: {}", e);
    }
}

fn outputs_changed(known: &[MonitorDescriptor], current: &[MonitorDescriptor]) -> bool {
    known.len() != current.len()
        || known
            .iter()
            .zip(current)
            .any(|(a, b)| a.id != b.id || a.rect != b.rect || a.connector != b.connector)
}

/// Run the daemon with the given configuration
///
/// # Errors
/// Returns an error if logging, the compositor connection, `PipeWire` tools or
/// the IPC socket cannot be set up.
pub async fn run(config: Config, foreground: bool) -> Result<()> {
    // Flushes the background log writer when the daemon returns
    let _log_guard = logging::init_daemon(&config.log_directive(), foreground)?;

    info!(
        "Starting MOSW daemon v{} ({}, {})",
        env!("CARGO_PKG_VERSION"),
        built_info::GIT_COMMIT_HASH_SHORT.unwrap_or("unknown commit"),
        built_info::PROFILE
    );

    PipeWire::validate_tools()?;

    let desktop = Arc::new(compositor::spawn_compositor_thread()?);
    if !desktop.wait_for_outputs(FIRST_SNAPSHOT_TIMEOUT).await {
        warn!("Compositor reported no outputs yet; mappings apply once monitors appear");
    }

    let mappings_path = Config::get_mappings_path()?;
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let factory = LoopFactory {
        desktop: Arc::clone(&desktop) as Arc<dyn Desktop>,
        audio: Arc::new(PipeWireDirectory),
        resolver: Arc::new(MonitorResolver::new()),
        settings: LoopSettings::from(&config.settings),
        mappings_path: mappings_path.clone(),
        events: event_tx,
    };

    let ipc_server = ControlSocket::bind().await?;
    info!("IPC server listening on {}", ipc_server.path().display());

    let start_time = Instant::now();
    let mut status = DaemonStatus::default();
    let mut running = Some(factory.start(&mut status).await?);

    let (reload_tx, mut reload_rx) = mpsc::unbounded_channel();
    let _watcher = if config.settings.watch_mappings {
        match watch_mappings(&mappings_path, reload_tx.clone()) {
            Ok(watcher) => {
                debug!("Watching {}", mappings_path.display());
                Some(watcher)
            }
            Err(e) => {
                warn!("Live mapping reload disabled: {:#}", e);
                None
            }
        }
    } else {
        None
    };

    let mut snapshots = desktop.subscribe();
    let mut known_outputs = desktop.monitors();
    let mut reload_at: Option<tokio::time::Instant> = None;

    let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    if let Err(e) = sd_notify::notify(false, &[sd_notify::NotifyState::Ready]) {
        debug!("sd_notify READY failed (not under systemd?): {}", e);
    }
    notify_daemon_event(&config, "MOSW Started", "Audio follows the focused monitor");
    info!("Following focus...");

    loop {
        let reload_deadline = reload_at.unwrap_or_else(tokio::time::Instant::now);

        tokio::select! {
            Some(event) = event_rx.recv() => {
                status.apply(&event);
                match &event {
                    SwitchEvent::Switched { key, device } if config.settings.notify_switch => {
                        let body = format!("{} ({})", device, key.name);
                        if let Err(e) = send_notification("Audio Output", &body, Some(get_device_icon(device))) {
                            warn!("Could not send switch notification: {}", e);
                        }
                    }
                    SwitchEvent::SwitchFailed { reason, .. } => debug!("Switch failed: {}", reason),
                    _ => {}
                }
            }

            Some(()) = reload_rx.recv() => {
                debug!("Mapping file changed");
                reload_at = Some(tokio::time::Instant::now() + RELOAD_DEBOUNCE);
            }

            changed = snapshots.changed() => {
                if changed.is_err() {
                    error!("Compositor connection lost");
                    break;
                }
                let outputs = snapshots.borrow_and_update().outputs.clone();
                if outputs_changed(&known_outputs, &outputs) {
                    info!("Monitor layout changed ({} attached)", outputs.len());
                    known_outputs = outputs;
                    reload_at = Some(tokio::time::Instant::now() + RELOAD_DEBOUNCE);
                }
            }

            () = tokio::time::sleep_until(reload_deadline), if reload_at.is_some() => {
                reload_at = None;
                running = factory.restart(running.take(), &mut status).await;
            }

            Some(mut stream) = ipc_server.accept() => {
                let uptime_secs = start_time.elapsed().as_secs();
                let status = status.clone();
                let shutdown_tx = shutdown_tx.clone();

                tokio::spawn(async move {
                    if let Err(e) = handle_ipc_request(&mut stream, uptime_secs, status, shutdown_tx).await {
                        error!("IPC request handling error: {:#}", e);
                    }
                });
            }

            Some(()) = shutdown_rx.recv() => {
                info!("Shutdown requested via IPC");
                break;
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT, shutting down");
                break;
            }

            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
                break;
            }
        }
    }

    let _ = sd_notify::notify(false, &[sd_notify::NotifyState::Stopping]);
    if let Some(running) = running {
        running.stop().await;
    }
    notify_daemon_event(&config, "MOSW Stopped", "Audio output switching stopped");
    drop(ipc_server);
    info!("Daemon stopped");

    Ok(())
}

/// Handle a single IPC request from a client
async fn handle_ipc_request(
    stream: &mut tokio::net::UnixStream,
    uptime_secs: u64,
    status: DaemonStatus,
    shutdown_tx: mpsc::Sender<()>,
) -> Result<()> {
    let request = ipc::read_request(stream).await?;

    let response = match request {
        Request::Status => Response::Status {
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_secs,
            monitor: status.monitor,
            device: status.device,
            mapped_monitors: status.mapped_monitors,
        },
        Request::Shutdown => {
            // Reply first; the main loop exits once it sees the signal
            ipc::write_response(
                stream,
                &Response::Ok {
                    message: "Daemon shutting down...".to_string(),
                },
            )
            .await?;
            let _ = shutdown_tx.send(()).await;
            return Ok(());
        }
    };

    ipc::write_response(stream, &response).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{DeviceName, SwitchError};
    use crate::monitor::{MonitorId, MonitorKey, Rect};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn output(id: u32, x: i32) -> MonitorDescriptor {
        MonitorDescriptor {
            id: MonitorId(id),
            connector: Some(format!("DP-{id}")),
            rect: Rect::from_origin_size(x, 0, 1920, 1080),
            ..Default::default()
        }
    }

    #[test]
    fn test_outputs_changed() {
        let known = vec![output(1, 0), output(2, 1920)];
        assert!(!outputs_changed(&known, &known.clone()));
        assert!(outputs_changed(&known, &[output(1, 0)]));
        assert!(outputs_changed(&known, &[output(1, 0), output(2, 2560)]));

        // Description changes alone do not matter
        let mut renamed = known.clone();
        renamed[0].description = Some("Dell".to_string());
        assert!(!outputs_changed(&known, &renamed));
    }

    #[test]
    fn test_status_tracks_events() {
        let key = MonitorKey::new("DP-1", Rect::from_origin_size(0, 0, 1920, 1080));
        let mut status = DaemonStatus::default();

        status.apply(&SwitchEvent::MonitorChanged { key: key.clone() });
        assert_eq!(status.monitor.as_deref(), Some("DP-1: 0,0 -> 1920,1080"));
        assert_eq!(status.device, None);

        status.apply(&SwitchEvent::Switched {
            key: key.clone(),
            device: "Speakers".into(),
        });
        status.apply(&SwitchEvent::SwitchFailed {
            key,
            device: "Headphones".into(),
            reason: "gone".to_string(),
        });
        assert_eq!(status.device.as_deref(), Some("Speakers"));
    }

    /// Desktop whose monitor listing can be made to panic
    #[derive(Default)]
    struct FlakyDesktop {
        broken: AtomicBool,
    }

    impl Desktop for FlakyDesktop {
        fn active_monitor(&self) -> Option<MonitorDescriptor> {
            None
        }

        fn monitors(&self) -> Vec<MonitorDescriptor> {
            assert!(!self.broken.load(Ordering::SeqCst), "compositor state unavailable");
            vec![output(1, 0)]
        }
    }

    struct NoAudio;

    impl AudioDirectory for NoAudio {
        fn list_playback_devices(&self) -> Result<Vec<DeviceName>> {
            Ok(Vec::new())
        }

        fn set_default_playback(&self, name: &DeviceName) -> Result<(), SwitchError> {
            Err(SwitchError::NotFound(name.clone()))
        }
    }

    #[tokio::test]
    async fn test_failed_restart_keeps_daemon_alive() {
        let dir = tempfile::tempdir().unwrap();
        let desktop = Arc::new(FlakyDesktop::default());
        let (events, _events_rx) = mpsc::unbounded_channel();
        let factory = LoopFactory {
            desktop: desktop.clone(),
            audio: Arc::new(NoAudio),
            resolver: Arc::new(MonitorResolver::with_drm_root("/nonexistent/drm/root")),
            settings: LoopSettings::default(),
            mappings_path: dir.path().join("mappings.json"),
            events,
        };
        let mut status = DaemonStatus::default();

        let running = factory.restart(None, &mut status).await;
        assert!(running.is_some());

        desktop.broken.store(true, Ordering::SeqCst);
        let running = factory.restart(running, &mut status).await;
        assert!(running.is_none());
        assert_eq!(status.mapped_monitors, 0);

        // The next reload gets another chance
        desktop.broken.store(false, Ordering::SeqCst);
        let running = factory.restart(running, &mut status).await;
        assert!(running.is_some());
        if let Some(running) = running {
            running.stop().await;
        }
    }
}
