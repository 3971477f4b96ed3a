/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

#![deny(unsafe_code)]

//! GPU-process lifecycle coordination.
//!
//! Owns process-wide initialization ordering (graphics preferences, feature
//! gating, render-thread boot) and graceful shutdown across the subsystems
//! the process hosts, with a bounded wait for dependent actors so a stuck
//! peer can never hang process exit indefinitely.

use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, bounded};
use log::{debug, warn};
use render_thread::{CompositorProxy, RenderThread, RenderThreadConfig, RenderThreadHandle};
use serde::{Deserialize, Serialize};

/// The build identifier baked into this process. The parent sends its own
/// alongside the init message; a mismatch means protocol framing itself
/// cannot be trusted.
pub const BUILD_ID: &str = env!("CARGO_PKG_VERSION");

/// Identifies one layer tree across process boundaries.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct LayersId(pub u64);

/// The content process owning a layer tree.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct ProcessId(pub u32);

/// Device preferences carried by the init message.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct DevicePrefs {
    pub hw_compositing: bool,
    pub d3d11_compositing: bool,
    pub opengl_compositing: bool,
    pub direct2d: bool,
    pub d3d11_via_angle: bool,
}

impl Default for DevicePrefs {
    fn default() -> Self {
        DevicePrefs {
            hw_compositing: true,
            d3d11_compositing: false,
            opengl_compositing: true,
            direct2d: false,
            d3d11_via_angle: false,
        }
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum GraphicsFeature {
    HwCompositing,
    D3d11Compositing,
    OpenglCompositing,
    Direct2d,
    AngleD3d11,
}

/// Per-feature outcome reported back in the device status.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct FeatureStatus {
    pub feature: GraphicsFeature,
    pub enabled: bool,
    pub failure_reason: Option<String>,
}

/// The acknowledgement sent once initialization completes.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct DeviceStatus {
    pub features: Vec<FeatureStatus>,
    pub max_texture_size: i32,
}

/// One graphics variable update from the parent, applied before any
/// renderer exists.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct GfxVarUpdate {
    pub name: String,
    pub value: String,
}

/// The process initialization message.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct GpuInit {
    pub parent_build_id: String,
    pub device_prefs: DevicePrefs,
    pub gfx_vars: Vec<GfxVarUpdate>,
    pub layer_tree_owners: Vec<(LayersId, ProcessId)>,
    pub max_pending_frames: u8,
    /// Total budget for waiting on dependent actors during shutdown.
    pub shutdown_wait: Duration,
}

impl Default for GpuInit {
    fn default() -> Self {
        GpuInit {
            parent_build_id: String::from(BUILD_ID),
            device_prefs: DevicePrefs::default(),
            gfx_vars: Vec::new(),
            layer_tree_owners: Vec::new(),
            max_pending_frames: 1,
            shutdown_wait: Duration::from_secs(10),
        }
    }
}

/// Failures from which the process cannot recover. The caller exits
/// immediately without graceful cleanup; the invariants clean teardown
/// relies on are exactly what is broken.
#[derive(Clone, Debug, PartialEq)]
pub enum FatalProcessError {
    EndpointBindFailed(String),
    RuntimeInitFailed(String),
    BuildIdMismatch { ours: String, theirs: String },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ShutdownState {
    NotShuttingDown,
    ShuttingDown,
    FinishedShuttingDown,
}

/// What a graceful shutdown actually did, for logging and tests.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    pub torn_down: Vec<&'static str>,
    pub actor_wait: Duration,
    pub actor_wait_timed_out: bool,
}

/// Subsystems torn down during graceful shutdown, in dependency order:
/// later entries are depended upon by earlier ones during their own
/// teardown, so tearing down out of order risks use-after-free on GPU
/// resources still referenced by an active render pass.
pub const TEARDOWN_ORDER: [&str; 15] = [
    "profiler-controller",
    "vsync-bridge",
    "video-bridge",
    "canvas-render-thread",
    "compositor-thread-holder",
    "remote-texture-map",
    "render-thread",
    "platform-window-thread",
    "image-memory-reporter",
    "gl-context-provider",
    "graphics-factory",
    "device-managers",
    "layer-tree-owner-tracker",
    "graphics-vars",
    "crash-reporter-client",
];

struct Subsystem {
    name: &'static str,
    teardown: Box<dyn FnOnce() + Send>,
}

pub struct GpuProcess {
    state: ShutdownState,
    shutdown_wait: Duration,
    render_thread: Option<RenderThread>,
    render_thread_handle: RenderThreadHandle,
    subsystems: Vec<Subsystem>,
    dependent_actors: Vec<Receiver<()>>,
    telemetry_flusher: Option<Box<dyn FnOnce() + Send>>,
    device_status: DeviceStatus,
    layer_tree_owners: Vec<(LayersId, ProcessId)>,
}

impl std::fmt::Debug for GpuProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuProcess")
            .field("state", &self.state)
            .field("shutdown_wait", &self.shutdown_wait)
            .field("device_status", &self.device_status)
            .field("layer_tree_owners", &self.layer_tree_owners)
            .finish_non_exhaustive()
    }
}

impl GpuProcess {
    /// Applies the init message and boots the render thread. The
    /// [`DeviceStatus`] acknowledgement the parent expects is available from
    /// [`GpuProcess::device_status`] once this returns.
    pub fn new(init: GpuInit, compositor: CompositorProxy) -> Result<GpuProcess, FatalProcessError> {
        if init.parent_build_id != BUILD_ID {
            return Err(FatalProcessError::BuildIdMismatch {
                ours: String::from(BUILD_ID),
                theirs: init.parent_build_id,
            });
        }

        for var in &init.gfx_vars {
            debug!("gfx var {} = {}", var.name, var.value);
        }

        let features = compute_feature_statuses(&init.device_prefs);
        for status in &features {
            if let Some(reason) = &status.failure_reason {
                warn!("{:?} unavailable: {reason}", status.feature);
            }
        }

        let render_thread = RenderThread::start(
            RenderThreadConfig {
                max_pending_frames: init.max_pending_frames,
                ..RenderThreadConfig::default()
            },
            compositor,
        );
        let render_thread_handle = render_thread.handle();

        let subsystems = TEARDOWN_ORDER
            .iter()
            .map(|&name| Subsystem {
                name,
                teardown: Box::new(|| {}),
            })
            .collect();

        Ok(GpuProcess {
            state: ShutdownState::NotShuttingDown,
            shutdown_wait: init.shutdown_wait,
            render_thread: Some(render_thread),
            render_thread_handle,
            subsystems,
            dependent_actors: Vec::new(),
            telemetry_flusher: None,
            device_status: DeviceStatus {
                features,
                max_texture_size: 0,
            },
            layer_tree_owners: init.layer_tree_owners,
        })
    }

    pub fn render_thread_handle(&self) -> RenderThreadHandle {
        self.render_thread_handle.clone()
    }

    pub fn device_status(&self) -> &DeviceStatus {
        &self.device_status
    }

    pub fn shutdown_state(&self) -> ShutdownState {
        self.state
    }

    pub fn layer_tree_owner(&self, layers_id: LayersId) -> Option<ProcessId> {
        self.layer_tree_owners
            .iter()
            .find(|(id, _)| *id == layers_id)
            .map(|(_, owner)| *owner)
    }

    pub fn map_layer_tree(&mut self, layers_id: LayersId, owner: ProcessId) {
        self.layer_tree_owners.push((layers_id, owner));
    }

    /// Installs the real teardown hook for a named subsystem. The position
    /// in the teardown order is fixed; only the behavior is injectable.
    pub fn set_subsystem_teardown(
        &mut self,
        name: &'static str,
        teardown: Box<dyn FnOnce() + Send>,
    ) {
        match self
            .subsystems
            .iter_mut()
            .find(|subsystem| subsystem.name == name)
        {
            Some(subsystem) => subsystem.teardown = teardown,
            None => warn!("Unknown subsystem {name:?}."),
        }
    }

    /// Telemetry that must cross the process boundary before the channel
    /// goes away at shutdown.
    pub fn set_telemetry_flusher(&mut self, flusher: Box<dyn FnOnce() + Send>) {
        self.telemetry_flusher = Some(flusher);
    }

    /// Registers a dependent media-manager actor. The returned sender is
    /// held by the actor; sending on it (or dropping it) counts as closed.
    pub fn register_dependent_actor(&mut self) -> crossbeam_channel::Sender<()> {
        let (closed_tx, closed_rx) = bounded(1);
        self.dependent_actors.push(closed_rx);
        closed_tx
    }

    pub fn simulate_device_reset(&self) {
        self.render_thread_handle.simulate_device_reset();
    }

    pub fn flush_memory(&self) {
        self.render_thread_handle.flush_memory();
    }

    /// The channel to the parent was torn down. An abnormal reason means
    /// process state may be corrupt: skip all graceful teardown and let the
    /// caller exit immediately.
    pub fn actor_destroyed(&mut self, abnormal: bool) -> ShutdownReport {
        if abnormal {
            warn!("Parent channel lost abnormally; skipping graceful shutdown.");
            self.state = ShutdownState::FinishedShuttingDown;
            return ShutdownReport::default();
        }
        self.shutdown()
    }

    /// Graceful shutdown: flush telemetry, wait (bounded) for dependent
    /// actors, then tear subsystems down in the fixed order. Idempotent.
    pub fn shutdown(&mut self) -> ShutdownReport {
        if self.state != ShutdownState::NotShuttingDown {
            return ShutdownReport::default();
        }
        self.state = ShutdownState::ShuttingDown;
        let mut report = ShutdownReport::default();

        if let Some(flusher) = self.telemetry_flusher.take() {
            flusher();
        }

        let wait_start = Instant::now();
        let deadline = wait_start + self.shutdown_wait;
        for actor in self.dependent_actors.drain(..) {
            match actor.recv_deadline(deadline) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {},
                Err(RecvTimeoutError::Timeout) => {
                    // Forward progress over strict correctness: the process
                    // is exiting either way.
                    warn!("Timed out waiting for dependent actors to close.");
                    report.actor_wait_timed_out = true;
                    break;
                },
            }
        }
        report.actor_wait = wait_start.elapsed();

        let mut render_thread = self.render_thread.take();
        for subsystem in self.subsystems.drain(..) {
            debug!("Tearing down {}.", subsystem.name);
            (subsystem.teardown)();
            if subsystem.name == "render-thread" {
                if let Some(render_thread) = render_thread.take() {
                    render_thread.shut_down();
                }
            }
            report.torn_down.push(subsystem.name);
        }
        self.layer_tree_owners.clear();

        self.state = ShutdownState::FinishedShuttingDown;
        report
    }
}

fn compute_feature_statuses(prefs: &DevicePrefs) -> Vec<FeatureStatus> {
    let mut features = Vec::with_capacity(5);
    let hw = FeatureStatus {
        feature: GraphicsFeature::HwCompositing,
        enabled: prefs.hw_compositing,
        failure_reason: (!prefs.hw_compositing)
            .then(|| String::from("Hardware compositing is disabled by preference")),
    };
    let d3d11 = if !prefs.hw_compositing {
        FeatureStatus {
            feature: GraphicsFeature::D3d11Compositing,
            enabled: false,
            failure_reason: Some(String::from("Requires hardware compositing")),
        }
    } else {
        FeatureStatus {
            feature: GraphicsFeature::D3d11Compositing,
            enabled: prefs.d3d11_compositing,
            failure_reason: (!prefs.d3d11_compositing)
                .then(|| String::from("Disabled by preference")),
        }
    };
    let opengl = FeatureStatus {
        feature: GraphicsFeature::OpenglCompositing,
        enabled: prefs.hw_compositing && prefs.opengl_compositing,
        failure_reason: if !prefs.hw_compositing {
            Some(String::from("Requires hardware compositing"))
        } else if !prefs.opengl_compositing {
            Some(String::from("Disabled by preference"))
        } else {
            None
        },
    };
    let direct2d = FeatureStatus {
        feature: GraphicsFeature::Direct2d,
        enabled: d3d11.enabled && prefs.direct2d,
        failure_reason: if !d3d11.enabled {
            Some(String::from("Requires D3D11 compositing"))
        } else if !prefs.direct2d {
            Some(String::from("Disabled by preference"))
        } else {
            None
        },
    };
    let angle = FeatureStatus {
        feature: GraphicsFeature::AngleD3d11,
        enabled: d3d11.enabled && prefs.d3d11_via_angle,
        failure_reason: if !d3d11.enabled {
            Some(String::from("Requires D3D11 compositing"))
        } else if !prefs.d3d11_via_angle {
            Some(String::from("Disabled by preference"))
        } else {
            None
        },
    };
    features.push(hw);
    features.push(d3d11);
    features.push(opengl);
    features.push(direct2d);
    features.push(angle);
    features
}
