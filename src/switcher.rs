//! The switch loop
//!
//! A single long-lived task that polls the focused monitor, maps it to a
//! target device and switches the default playback device only when the
//! target differs from the last one successfully applied.
//!
//! The loop owns [`LoopState`] exclusively and reads an immutable
//! [`MappingTable`] snapshot. Reconfiguration means stopping this loop and
//! starting a new one.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::audio::{AudioDirectory, DeviceName, SwitchError};
use crate::compositor::Desktop;
use crate::config::Settings;
use crate::mapping::MappingTable;
use crate::monitor::{MonitorDescriptor, MonitorId, MonitorKey, MonitorResolver};

/// Timing knobs for the loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopSettings {
    pub poll_interval: Duration,
    /// Upper bound for every blocking call made from a tick
    pub call_timeout: Duration,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            call_timeout: Duration::from_millis(2000),
        }
    }
}

impl From<&Settings> for LoopSettings {
    fn from(settings: &Settings) -> Self {
        Self {
            poll_interval: Duration::from_millis(settings.poll_interval_ms),
            call_timeout: Duration::from_millis(settings.call_timeout_ms),
        }
    }
}

/// The loop's only mutable memory
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopState {
    /// Monitor handle seen on the previous transition (not the key)
    pub last_monitor: Option<MonitorId>,
    /// Device most recently switched to successfully
    pub last_device: Option<DeviceName>,
}

/// What a single tick did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// No focused window or no monitors
    NoFocus,
    /// Focus is still on the same monitor
    Unchanged,
    /// The monitor's key could not be resolved in time; retried next tick
    LookupFailed,
    /// New monitor has no device preference
    Unmapped(MonitorKey),
    /// New monitor wants the device that is already applied
    AlreadyApplied(DeviceName),
    Switched(DeviceName),
    NotFound(DeviceName),
    SwitchFailed(DeviceName),
}

/// Notifications from the loop to whoever started it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchEvent {
    MonitorChanged {
        key: MonitorKey,
    },
    Switched {
        key: MonitorKey,
        device: DeviceName,
    },
    SwitchFailed {
        key: MonitorKey,
        device: DeviceName,
        reason: String,
    },
}

/// Run a blocking closure inside `spawn_blocking` with a timeout
///
/// Returns `Err("timed_out")` if the closure did not finish in time and
/// `Err("join_error")` if it panicked. A timed-out closure keeps running on
/// its blocking thread; only the await is abandoned.
pub async fn run_blocking_with_timeout<T, F>(f: F, timeout: Duration) -> Result<T, &'static str>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let handle = tokio::task::spawn_blocking(f);
    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(_)) => Err("join_error"),
        Err(_) => Err("timed_out"),
    }
}

pub struct SwitchLoop {
    desktop: Arc<dyn Desktop>,
    audio: Arc<dyn AudioDirectory>,
    resolver: Arc<MonitorResolver>,
    mapping: Arc<MappingTable>,
    settings: LoopSettings,
    events: Option<mpsc::UnboundedSender<SwitchEvent>>,
    state: LoopState,
}

impl SwitchLoop {
    #[must_use]
    pub fn new(
        desktop: Arc<dyn Desktop>,
        audio: Arc<dyn AudioDirectory>,
        resolver: Arc<MonitorResolver>,
        mapping: Arc<MappingTable>,
        settings: LoopSettings,
    ) -> Self {
        Self {
            desktop,
            audio,
            resolver,
            mapping,
            settings,
            events: None,
            state: LoopState::default(),
        }
    }

    /// Report transitions and switch results on `events`
    #[must_use]
    pub fn with_events(mut self, events: mpsc::UnboundedSender<SwitchEvent>) -> Self {
        self.events = Some(events);
        self
    }

    #[must_use]
    pub fn state(&self) -> &LoopState {
        &self.state
    }

    fn emit(&self, event: SwitchEvent) {
        if let Some(tx) = &self.events
            && tx.send(event).is_err()
        {
            trace!("Switch event receiver dropped");
        }
    }

    /// Resolve the key off the async runtime (reads sysfs)
    ///
    /// `None` if the lookup timed out or panicked
    async fn resolve_key(&self, monitor: &MonitorDescriptor) -> Option<MonitorKey> {
        let resolver = Arc::clone(&self.resolver);
        let descriptor = monitor.clone();

        run_blocking_with_timeout(
            move || resolver.resolve_key(&descriptor),
            self.settings.call_timeout,
        )
        .await
        .inspect_err(|e| warn!("Monitor name lookup for {} {}", monitor.device_path(), e))
        .ok()
    }

    async fn switch_to(&self, device: &DeviceName) -> Result<(), SwitchError> {
        let audio = Arc::clone(&self.audio);
        let target = device.clone();

        match run_blocking_with_timeout(
            move || audio.set_default_playback(&target),
            self.settings.call_timeout,
        )
        .await
        {
            Ok(result) => result,
            Err("timed_out") => Err(SwitchError::Failed {
                device: device.clone(),
                reason: format!(
                    "timed out after {}ms",
                    self.settings.call_timeout.as_millis()
                ),
            }),
            Err(e) => Err(SwitchError::Failed {
                device: device.clone(),
                reason: e.to_string(),
            }),
        }
    }

    /// Run one poll step
    pub async fn tick(&mut self) -> TickOutcome {
        let Some(monitor) = self.desktop.active_monitor() else {
            return TickOutcome::NoFocus;
        };

        if self.state.last_monitor == Some(monitor.id) {
            return TickOutcome::Unchanged;
        }

        let Some(key) = self.resolve_key(&monitor).await else {
            return TickOutcome::LookupFailed;
        };
        debug!("Focus moved to {}", key);
        self.state.last_monitor = Some(monitor.id);
        self.emit(SwitchEvent::MonitorChanged { key: key.clone() });

        let Some(target) = self.mapping.target_for(&key).cloned() else {
            debug!("No device mapped for {}", key);
            return TickOutcome::Unmapped(key);
        };

        if self.state.last_device.as_ref() == Some(&target) {
            debug!("'{}' already applied", target);
            return TickOutcome::AlreadyApplied(target);
        }

        match self.switch_to(&target).await {
            Ok(()) => {
                info!("Switched default playback to '{}' for {}", target, key);
                self.state.last_device = Some(target.clone());
                self.emit(SwitchEvent::Switched {
                    key,
                    device: target.clone(),
                });
                TickOutcome::Switched(target)
            }
            Err(e) => {
                warn!("{}", e);
                let not_found = matches!(e, SwitchError::NotFound(_));
                self.emit(SwitchEvent::SwitchFailed {
                    key,
                    device: target.clone(),
                    reason: e.to_string(),
                });
                if not_found {
                    TickOutcome::NotFound(target)
                } else {
                    TickOutcome::SwitchFailed(target)
                }
            }
        }
    }

    /// Poll until `shutdown` fires (or its sender is dropped)
    ///
    /// Cancellation is checked between ticks; a tick in progress completes.
    pub async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        let mut interval = tokio::time::interval(self.settings.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Switch loop started ({} monitors, {} mapped, polling every {}ms)",
            self.mapping.len(),
            self.mapping.mapped_count(),
            self.settings.poll_interval.as_millis()
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    debug!("Switch loop cancelled");
                    break;
                }
                _ = interval.tick() => {
                    let outcome = self.tick().await;
                    trace!("Tick: {:?}", outcome);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::PersistedMappings;
    use crate::monitor::Rect;
    use color_eyre::eyre::Result;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    struct FakeDesktop {
        focused: Mutex<Option<MonitorDescriptor>>,
    }

    impl FakeDesktop {
        fn new() -> Self {
            Self {
                focused: Mutex::new(None),
            }
        }

        fn focus(&self, monitor: Option<&MonitorDescriptor>) {
            *self.focused.lock().unwrap() = monitor.cloned();
        }
    }

    impl Desktop for FakeDesktop {
        fn active_monitor(&self) -> Option<MonitorDescriptor> {
            self.focused.lock().unwrap().clone()
        }

        fn monitors(&self) -> Vec<MonitorDescriptor> {
            self.focused.lock().unwrap().iter().cloned().collect()
        }
    }

    #[derive(Default)]
    struct FakeAudio {
        devices: Mutex<Vec<DeviceName>>,
        calls: Mutex<Vec<DeviceName>>,
        failing: Mutex<bool>,
        delay: Option<Duration>,
    }

    impl FakeAudio {
        fn with_devices(names: &[&str]) -> Self {
            Self {
                devices: Mutex::new(names.iter().map(|n| DeviceName::from(*n)).collect()),
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<DeviceName> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl AudioDirectory for FakeAudio {
        fn list_playback_devices(&self) -> Result<Vec<DeviceName>> {
            Ok(self.devices.lock().unwrap().clone())
        }

        fn set_default_playback(&self, name: &DeviceName) -> Result<(), SwitchError> {
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            self.calls.lock().unwrap().push(name.clone());

            if !self.devices.lock().unwrap().contains(name) {
                return Err(SwitchError::NotFound(name.clone()));
            }
            if *self.failing.lock().unwrap() {
                return Err(SwitchError::Failed {
                    device: name.clone(),
                    reason: "rejected".to_string(),
                });
            }
            Ok(())
        }
    }

    fn monitor(id: u32, connector: &str, x: i32) -> MonitorDescriptor {
        MonitorDescriptor {
            id: MonitorId(id),
            connector: Some(connector.to_string()),
            rect: Rect::from_origin_size(x, 0, 1920, 1080),
            ..Default::default()
        }
    }

    struct Harness {
        desktop: Arc<FakeDesktop>,
        audio: Arc<FakeAudio>,
        switcher: SwitchLoop,
        monitors: Vec<MonitorDescriptor>,
        _drm: tempfile::TempDir,
    }

    /// Monitors A, B, C side by side; `mapped` assigns devices by connector
    fn harness(audio: FakeAudio, mapped: &[(&str, &str)]) -> Harness {
        harness_with_drm(tempfile::tempdir().unwrap(), audio, mapped)
    }

    fn harness_with_drm(drm: tempfile::TempDir, audio: FakeAudio, mapped: &[(&str, &str)]) -> Harness {
        let resolver = Arc::new(MonitorResolver::with_drm_root(drm.path()));
        let monitors = vec![
            monitor(1, "A", 0),
            monitor(2, "B", 1920),
            monitor(3, "C", 3840),
        ];

        let mut table = MappingTable::reconcile(
            monitors.iter().map(|m| resolver.resolve_key(m)),
            &PersistedMappings::new(),
        );
        for (connector, device) in mapped {
            let m = monitors
                .iter()
                .find(|m| m.connector.as_deref() == Some(*connector))
                .unwrap();
            table.set(resolver.resolve_key(m), DeviceName::from(*device));
        }

        let desktop = Arc::new(FakeDesktop::new());
        let audio = Arc::new(audio);
        let switcher = SwitchLoop::new(
            desktop.clone(),
            audio.clone(),
            resolver,
            Arc::new(table),
            LoopSettings {
                poll_interval: Duration::from_millis(10),
                call_timeout: Duration::from_millis(500),
            },
        );

        Harness {
            desktop,
            audio,
            switcher,
            monitors,
            _drm: drm,
        }
    }

    impl Harness {
        async fn focus(&mut self, index: usize) -> TickOutcome {
            self.desktop.focus(self.monitors.get(index));
            self.switcher.tick().await
        }
    }

    fn speakers_headphones() -> Harness {
        harness(
            FakeAudio::with_devices(&["Speakers", "Headphones"]),
            &[("A", "Speakers"), ("B", "Headphones")],
        )
    }

    #[tokio::test]
    async fn test_a_b_a_switches_three_times_in_order() {
        let mut h = speakers_headphones();

        assert_eq!(h.focus(0).await, TickOutcome::Switched("Speakers".into()));
        assert_eq!(h.focus(1).await, TickOutcome::Switched("Headphones".into()));
        assert_eq!(h.focus(0).await, TickOutcome::Switched("Speakers".into()));

        assert_eq!(
            h.audio.calls(),
            vec![
                DeviceName::from("Speakers"),
                DeviceName::from("Headphones"),
                DeviceName::from("Speakers"),
            ]
        );
    }

    #[tokio::test]
    async fn test_unmapped_monitor_keeps_last_device() {
        let mut h = speakers_headphones();
        h.focus(0).await;
        h.focus(1).await;

        let outcome = h.focus(2).await;
        assert!(matches!(outcome, TickOutcome::Unmapped(ref key) if key.name == "C"));
        assert_eq!(h.audio.calls().len(), 2);
        assert_eq!(h.switcher.state().last_device, Some("Headphones".into()));
        assert_eq!(h.switcher.state().last_monitor, Some(MonitorId(3)));
    }

    #[tokio::test]
    async fn test_same_monitor_is_unchanged() {
        let mut h = speakers_headphones();
        h.focus(0).await;
        assert_eq!(h.focus(0).await, TickOutcome::Unchanged);
        assert_eq!(h.audio.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_no_focus_changes_nothing() {
        let mut h = speakers_headphones();
        h.focus(0).await;

        h.desktop.focus(None);
        assert_eq!(h.switcher.tick().await, TickOutcome::NoFocus);
        assert_eq!(h.switcher.state().last_monitor, Some(MonitorId(1)));
    }

    #[tokio::test]
    async fn test_monitor_change_alone_does_not_switch() {
        let mut h = harness(
            FakeAudio::with_devices(&["Speakers"]),
            &[("A", "Speakers"), ("B", "Speakers")],
        );

        assert_eq!(h.focus(0).await, TickOutcome::Switched("Speakers".into()));
        assert_eq!(h.focus(1).await, TickOutcome::AlreadyApplied("Speakers".into()));
        assert_eq!(h.audio.calls().len(), 1);
        assert_eq!(h.switcher.state().last_monitor, Some(MonitorId(2)));
    }

    #[tokio::test]
    async fn test_not_found_is_retried_on_next_transition() {
        let mut h = harness(
            FakeAudio::with_devices(&["Speakers"]),
            &[("A", "Dock"), ("B", "Speakers")],
        );

        assert_eq!(h.focus(0).await, TickOutcome::NotFound("Dock".into()));
        assert_eq!(h.switcher.state().last_device, None);
        assert_eq!(h.switcher.state().last_monitor, Some(MonitorId(1)));

        // Staying on A does not retry
        assert_eq!(h.switcher.tick().await, TickOutcome::Unchanged);

        h.audio.devices.lock().unwrap().push("Dock".into());
        h.focus(1).await;
        assert_eq!(h.focus(0).await, TickOutcome::Switched("Dock".into()));
        assert_eq!(
            h.audio.calls(),
            vec![
                DeviceName::from("Dock"),
                DeviceName::from("Speakers"),
                DeviceName::from("Dock"),
            ]
        );
    }

    #[tokio::test]
    async fn test_not_found_is_retried_from_another_monitor() {
        let mut h = harness(
            FakeAudio::with_devices(&["Speakers"]),
            &[("A", "Dock"), ("B", "Dock")],
        );

        assert_eq!(h.focus(0).await, TickOutcome::NotFound("Dock".into()));
        assert_eq!(h.focus(1).await, TickOutcome::NotFound("Dock".into()));

        h.audio.devices.lock().unwrap().push("Dock".into());
        assert_eq!(h.focus(0).await, TickOutcome::Switched("Dock".into()));
        assert_eq!(h.audio.calls(), vec![DeviceName::from("Dock"); 3]);
        assert_eq!(h.switcher.state().last_device, Some("Dock".into()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stalled_name_lookup_is_retried() {
        use crate::monitor::tests::make_edid;
        use std::fs;

        let drm = tempfile::tempdir().unwrap();
        let record = drm.path().join("card0-A");
        let edid = record.join("edid");
        fs::create_dir_all(&record).unwrap();
        fs::write(&edid, make_edid("Studio")).unwrap();

        let mut h = harness_with_drm(drm, FakeAudio::with_devices(&["Speakers"]), &[("A", "Speakers")]);
        h.switcher.settings.call_timeout = Duration::from_millis(100);

        // Reading a FIFO with no writer blocks, like a hung sysfs read
        fs::remove_file(&edid).unwrap();
        let status = std::process::Command::new("mkfifo").arg(&edid).status().unwrap();
        assert!(status.success());

        assert_eq!(h.focus(0).await, TickOutcome::LookupFailed);
        assert_eq!(h.switcher.state().last_monitor, None);

        // Release the stuck reader, then make the EDID readable again
        let writer = {
            let edid = edid.clone();
            std::thread::spawn(move || drop(fs::OpenOptions::new().write(true).open(edid)))
        };
        writer.join().unwrap();
        fs::remove_file(&edid).unwrap();
        fs::write(&edid, make_edid("Studio")).unwrap();

        assert_eq!(h.switcher.tick().await, TickOutcome::Switched("Speakers".into()));
        assert_eq!(h.switcher.state().last_monitor, Some(MonitorId(1)));
        assert_eq!(h.audio.calls(), vec![DeviceName::from("Speakers")]);
    }

    #[tokio::test]
    async fn test_failed_switch_keeps_previous_device() {
        let mut h = speakers_headphones();
        h.focus(0).await;

        *h.audio.failing.lock().unwrap() = true;
        assert_eq!(h.focus(1).await, TickOutcome::SwitchFailed("Headphones".into()));
        assert_eq!(h.switcher.state().last_device, Some("Speakers".into()));

        // Going back to A does not call again: Speakers is still applied
        *h.audio.failing.lock().unwrap() = false;
        assert_eq!(h.focus(0).await, TickOutcome::AlreadyApplied("Speakers".into()));
    }

    #[tokio::test]
    async fn test_slow_switch_times_out() {
        let audio = FakeAudio {
            delay: Some(Duration::from_millis(300)),
            ..FakeAudio::with_devices(&["Speakers"])
        };
        let mut h = harness(audio, &[("A", "Speakers")]);
        h.switcher.settings.call_timeout = Duration::from_millis(20);

        assert_eq!(h.focus(0).await, TickOutcome::SwitchFailed("Speakers".into()));
        assert_eq!(h.switcher.state().last_device, None);
    }

    #[tokio::test]
    async fn test_events_are_reported() {
        let mut h = speakers_headphones();
        let (tx, mut rx) = mpsc::unbounded_channel();
        h.switcher = h.switcher.with_events(tx);

        h.focus(0).await;

        let key = MonitorKey::new("A", Rect::from_origin_size(0, 0, 1920, 1080));
        assert_eq!(
            rx.try_recv().unwrap(),
            SwitchEvent::MonitorChanged { key: key.clone() }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            SwitchEvent::Switched {
                key,
                device: "Speakers".into(),
            }
        );
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let h = speakers_headphones();
        h.desktop.focus(h.monitors.first());
        let audio = h.audio.clone();

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle = tokio::spawn(h.switcher.run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(audio.calls(), vec![DeviceName::from("Speakers")]);
    }
}
