//! wlr-foreign-toplevel-management + `wl_output` tracking
//!
//! Supported by Sway, Hyprland, Wayfire, River, labwc, dwl, hikari, Niri,
//! and other wlroots-based compositors.
//!
//! `wl_output` properties are double-buffered until `done`; only committed
//! outputs appear in snapshots. Toplevel state is applied as it arrives and a
//! snapshot is published after every dispatched batch that changed anything.

use color_eyre::eyre::{Context, Result};
use std::collections::HashMap;
use std::sync::mpsc::SyncSender;
use tokio::sync::watch;
use tracing::{debug, trace};
use wayland_client::{
    Connection, Dispatch, Proxy, QueueHandle, WEnum, event_created_child,
    globals::{GlobalList, GlobalListContents, registry_queue_init},
    protocol::{wl_output, wl_registry},
};
use wayland_protocols_wlr::foreign_toplevel::v1::client::{
    zwlr_foreign_toplevel_handle_v1, zwlr_foreign_toplevel_manager_v1,
};

use super::{DesktopSnapshot, FocusedWindow};
use crate::monitor::{MonitorDescriptor, MonitorId, Rect};

/// v4 adds the connector `name` event
const MAX_OUTPUT_VERSION: u32 = 4;

/// Output properties as announced by the compositor
#[derive(Debug, Clone, Default)]
struct OutputInfo {
    x: i32,
    y: i32,
    width: i32,
    height: i32,
    scale: i32,
    rotated: bool,
    make: String,
    model: String,
    name: Option<String>,
    description: Option<String>,
}

impl OutputInfo {
    /// Rectangle in logical (compositor layout) coordinates
    fn rect(&self) -> Rect {
        let (width, height) = if self.rotated {
            (self.height, self.width)
        } else {
            (self.width, self.height)
        };
        let scale = self.scale.max(1);
        Rect::from_origin_size(self.x, self.y, width / scale, height / scale)
    }

    fn descriptor(&self, id: MonitorId) -> MonitorDescriptor {
        MonitorDescriptor {
            id,
            connector: self.name.clone(),
            make: self.make.clone(),
            model: self.model.clone(),
            description: self.description.clone(),
            rect: self.rect(),
        }
    }
}

struct TrackedOutput {
    /// Registry global name, needed to handle `global_remove`
    global: u32,
    proxy: wl_output::WlOutput,
    pending: OutputInfo,
    current: Option<OutputInfo>,
}

#[derive(Debug, Default)]
struct ToplevelWindow {
    id: u64,
    app_id: String,
    activated: bool,
    /// Ordering of activations, so the newest wins if several claim focus
    activated_at: u64,
    outputs: Vec<u32>,
    last_output: Option<u32>,
    done_received: bool,
}

/// Dispatch state shared by the long-running tracker and one-shot probes
pub struct TrackerState {
    outputs: HashMap<u32, TrackedOutput>,
    toplevels: HashMap<u32, ToplevelWindow>,
    activation_seq: u64,
    dirty: bool,
}

impl TrackerState {
    fn new() -> Self {
        Self {
            outputs: HashMap::new(),
            toplevels: HashMap::new(),
            activation_seq: 0,
            dirty: false,
        }
    }

    fn bind_output(
        &mut self,
        registry: &wl_registry::WlRegistry,
        global: u32,
        version: u32,
        qh: &QueueHandle<Self>,
    ) {
        let proxy = registry.bind::<wl_output::WlOutput, _, _>(
            global,
            version.min(MAX_OUTPUT_VERSION),
            qh,
            global,
        );
        let id = proxy.id().protocol_id();
        debug!("Bound wl_output global {} as object {}", global, id);

        self.outputs.insert(
            id,
            TrackedOutput {
                global,
                proxy,
                pending: OutputInfo {
                    scale: 1,
                    ..Default::default()
                },
                current: None,
            },
        );
    }

    fn bind_existing_outputs(&mut self, globals: &GlobalList, qh: &QueueHandle<Self>) {
        let outputs: Vec<(u32, u32)> = globals.contents().with_list(|list| {
            list.iter()
                .filter(|g| g.interface == "wl_output")
                .map(|g| (g.name, g.version))
                .collect()
        });

        for (global, version) in outputs {
            self.bind_output(globals.registry(), global, version, qh);
        }
    }

    fn remove_output_global(&mut self, global: u32) {
        let Some(id) = self
            .outputs
            .iter()
            .find(|(_, o)| o.global == global)
            .map(|(id, _)| *id)
        else {
            return;
        };

        if let Some(output) = self.outputs.remove(&id) {
            debug!("Output {} removed", id);
            if output.proxy.version() >= 3 {
                output.proxy.release();
            }
            self.dirty = true;
        }
    }

    fn snapshot(&self) -> DesktopSnapshot {
        let mut outputs: Vec<MonitorDescriptor> = self
            .outputs
            .iter()
            .filter_map(|(id, o)| o.current.as_ref().map(|info| info.descriptor(MonitorId(*id))))
            .collect();
        outputs.sort_by_key(|o| o.id);

        let focused = self
            .toplevels
            .values()
            .filter(|t| t.activated && t.done_received)
            .max_by_key(|t| t.activated_at)
            .map(|t| FocusedWindow {
                id: t.id,
                app_id: t.app_id.clone(),
                outputs: t.outputs.iter().copied().map(MonitorId).collect(),
                last_output: t.last_output.map(MonitorId),
            });

        DesktopSnapshot { outputs, focused }
    }
}

fn is_activated(raw_states: &[u8]) -> bool {
    let activated = zwlr_foreign_toplevel_handle_v1::State::Activated as u32;
    raw_states
        .chunks_exact(4)
        .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
        .any(|s| s == activated)
}

impl Dispatch<wl_registry::WlRegistry, GlobalListContents> for TrackerState {
    fn event(
        state: &mut Self,
        registry: &wl_registry::WlRegistry,
        event: wl_registry::Event,
        _data: &GlobalListContents,
        _conn: &Connection,
        qh: &QueueHandle<Self>,
    ) {
        match event {
            wl_registry::Event::Global {
                name,
                interface,
                version,
            } if interface == "wl_output" => {
                debug!("Output hotplugged (global {})", name);
                state.bind_output(registry, name, version, qh);
            }
            wl_registry::Event::GlobalRemove { name } => state.remove_output_global(name),
            _ => {}
        }
    }
}

impl Dispatch<wl_output::WlOutput, u32> for TrackerState {
    fn event(
        state: &mut Self,
        proxy: &wl_output::WlOutput,
        event: wl_output::Event,
        _global: &u32,
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        let Some(output) = state.outputs.get_mut(&proxy.id().protocol_id()) else {
            return;
        };

        match event {
            wl_output::Event::Geometry {
                x,
                y,
                make,
                model,
                transform,
                ..
            } => {
                output.pending.x = x;
                output.pending.y = y;
                output.pending.make = make;
                output.pending.model = model;
                output.pending.rotated = matches!(
                    transform,
                    WEnum::Value(
                        wl_output::Transform::_90
                            | wl_output::Transform::_270
                            | wl_output::Transform::Flipped90
                            | wl_output::Transform::Flipped270
                    )
                );
            }
            wl_output::Event::Mode {
                flags,
                width,
                height,
                ..
            } => {
                if let WEnum::Value(flags) = flags
                    && flags.contains(wl_output::Mode::Current)
                {
                    output.pending.width = width;
                    output.pending.height = height;
                }
            }
            wl_output::Event::Scale { factor } => output.pending.scale = factor.max(1),
            wl_output::Event::Name { name } => output.pending.name = Some(name),
            wl_output::Event::Description { description } => {
                output.pending.description = Some(description);
            }
            wl_output::Event::Done => {
                trace!("Output {} committed: {:?}", proxy.id().protocol_id(), output.pending);
                output.current = Some(output.pending.clone());
                state.dirty = true;
                return;
            }
            _ => return,
        }

        // v1 outputs never send `done`
        if proxy.version() < 2 {
            output.current = Some(output.pending.clone());
            state.dirty = true;
        }
    }
}

impl Dispatch<zwlr_foreign_toplevel_manager_v1::ZwlrForeignToplevelManagerV1, ()> for TrackerState {
    fn event(
        state: &mut Self,
        _proxy: &zwlr_foreign_toplevel_manager_v1::ZwlrForeignToplevelManagerV1,
        event: zwlr_foreign_toplevel_manager_v1::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        use zwlr_foreign_toplevel_manager_v1::Event;

        match event {
            Event::Toplevel { toplevel } => {
                let id = toplevel.id().protocol_id();
                trace!("New toplevel handle: {}", id);
                state.toplevels.insert(
                    id,
                    ToplevelWindow {
                        id: u64::from(id),
                        ..Default::default()
                    },
                );
            }
            Event::Finished => {
                debug!("Toplevel manager finished");
            }
            _ => {}
        }
    }

    event_created_child!(TrackerState, zwlr_foreign_toplevel_manager_v1::ZwlrForeignToplevelManagerV1, [
        zwlr_foreign_toplevel_manager_v1::EVT_TOPLEVEL_OPCODE => (zwlr_foreign_toplevel_handle_v1::ZwlrForeignToplevelHandleV1, ())
    ]);
}

impl Dispatch<zwlr_foreign_toplevel_handle_v1::ZwlrForeignToplevelHandleV1, ()> for TrackerState {
    fn event(
        state: &mut Self,
        proxy: &zwlr_foreign_toplevel_handle_v1::ZwlrForeignToplevelHandleV1,
        event: zwlr_foreign_toplevel_handle_v1::Event,
        _data: &(),
        _conn: &Connection,
        _qh: &QueueHandle<Self>,
    ) {
        use zwlr_foreign_toplevel_handle_v1::Event;

        let handle_id = proxy.id().protocol_id();

        if let Event::Closed = event {
            if state.toplevels.remove(&handle_id).is_some() {
                trace!("Toplevel {} closed", handle_id);
                state.dirty = true;
            }
            proxy.destroy();
            return;
        }

        let Some(window) = state.toplevels.get_mut(&handle_id) else {
            return;
        };

        match event {
            Event::AppId { app_id } => window.app_id = app_id,
            Event::State { state: raw_states } => {
                let activated = is_activated(&raw_states);
                if activated && !window.activated {
                    state.activation_seq += 1;
                    window.activated_at = state.activation_seq;
                    trace!("Toplevel {} ({}) activated", handle_id, window.app_id);
                }
                window.activated = activated;
            }
            Event::OutputEnter { output } => {
                let id = output.id().protocol_id();
                if !window.outputs.contains(&id) {
                    window.outputs.push(id);
                }
            }
            Event::OutputLeave { output } => {
                let id = output.id().protocol_id();
                window.outputs.retain(|o| *o != id);
                window.last_output = Some(id);
            }
            Event::Done => window.done_received = true,
            _ => return,
        }

        state.dirty = true;
    }
}

/// Run the tracker until the compositor goes away or nobody listens
///
/// Setup errors are reported through `ready` so the caller can fail fast.
pub fn run_event_loop(
    conn: Connection,
    tx: watch::Sender<DesktopSnapshot>,
    ready: SyncSender<Result<()>>,
) -> Result<()> {
    let setup = || -> Result<_> {
        let (globals, mut event_queue) = registry_queue_init::<TrackerState>(&conn)
            .context("Failed to initialize Wayland registry")?;
        let qh = event_queue.handle();

        let mut state = TrackerState::new();
        state.bind_existing_outputs(&globals, &qh);

        let _manager: zwlr_foreign_toplevel_manager_v1::ZwlrForeignToplevelManagerV1 = globals
            .bind(&qh, 1..=3, ())
            .context(
                "zwlr_foreign_toplevel_manager_v1 protocol not available. \
                 mosw needs a compositor with wlr-foreign-toplevel-management \
                 (Sway, Hyprland, Niri, River, Wayfire, labwc, ...)",
            )?;

        // Outputs + toplevel handles, then the handles' initial state
        event_queue
            .roundtrip(&mut state)
            .context("Initial Wayland roundtrip failed")?;
        event_queue
            .roundtrip(&mut state)
            .context("Initial Wayland roundtrip failed")?;

        Ok((event_queue, state))
    };

    let (mut event_queue, mut state) = match setup() {
        Ok(parts) => {
            let _ = ready.send(Ok(()));
            parts
        }
        Err(e) => {
            let message = format!("{e:#}");
            let _ = ready.send(Err(e));
            return Err(color_eyre::eyre::eyre!(message));
        }
    };

    tx.send_replace(state.snapshot());
    state.dirty = false;

    loop {
        event_queue
            .blocking_dispatch(&mut state)
            .context("Wayland event dispatch failed")?;

        if tx.is_closed() {
            debug!("Snapshot receivers dropped, shutting down Wayland thread");
            return Ok(());
        }

        if state.dirty {
            state.dirty = false;
            tx.send_replace(state.snapshot());
        }
    }
}

/// Bind all outputs, wait for their properties and return them
pub fn probe_outputs(conn: &Connection) -> Result<Vec<MonitorDescriptor>> {
    let (globals, mut event_queue) = registry_queue_init::<TrackerState>(conn)
        .context("Failed to initialize Wayland registry")?;
    let qh = event_queue.handle();

    let mut state = TrackerState::new();
    state.bind_existing_outputs(&globals, &qh);

    event_queue
        .roundtrip(&mut state)
        .context("Wayland roundtrip failed")?;

    Ok(state.snapshot().outputs)
}
