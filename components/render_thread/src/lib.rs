/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

#![deny(unsafe_code)]

//! The dedicated render thread.
//!
//! Exactly one OS thread performs all GPU submission and owns every
//! renderer. Other threads communicate with it exclusively by posting
//! [`RendererEvent`]s onto its serial queue, which keeps renderer and window
//! mutation single-writer without per-object locking. The only state foreign
//! threads touch directly are two independently locked maps: the per-window
//! frame counters (backpressure, destroyed checks) and the external-image
//! registry. Neither lock is ever held while GPU work runs.

pub mod api;
pub mod event;
pub mod notifier;
pub mod renderer;
pub mod texture;
mod window_state;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use base::{DeviceResetReason, ExternalImageId, WindowId};
use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use log::{debug, error, warn};

pub use crate::api::{RenderApi, Transaction};
pub use crate::event::{RendererEvent, RendererSetup};
pub use crate::notifier::{CompositorMsg, CompositorProxy, EventLoopWaker, NoopWaker};
pub use crate::renderer::{FrameStats, RenderError, Renderer, RendererCapabilities};
pub use crate::texture::{ExternalImageRegistry, RenderTextureHost};
use crate::window_state::FrameStateMap;

#[derive(Clone, Copy, Debug)]
pub struct RenderThreadConfig {
    /// How many frames may be queued per window beyond what is actively
    /// rendering. Deeper values allow more pipelining on high-refresh-rate
    /// displays at the cost of latency.
    pub max_pending_frames: u8,
    /// Render durations above this mark the window's next dispatch as
    /// following a slow frame.
    pub slow_frame_threshold: Duration,
}

impl Default for RenderThreadConfig {
    fn default() -> Self {
        RenderThreadConfig {
            max_pending_frames: 1,
            slow_frame_threshold: Duration::from_millis(16),
        }
    }
}

struct SharedState {
    queue: Sender<RendererEvent>,
    shutdown: AtomicBool,
    handling_device_reset: AtomicBool,
    frame_states: FrameStateMap,
    textures: ExternalImageRegistry,
    config: RenderThreadConfig,
}

/// Thread-safe entry points onto the render thread. Cloneable; every mutating
/// operation either posts an event or touches one of the two locked maps.
#[derive(Clone)]
pub struct RenderThreadHandle {
    shared: Arc<SharedState>,
}

impl RenderThreadHandle {
    /// Posts an event unless shutdown has begun. Returns false if the event
    /// was dropped; any reply sender inside it is dropped with it, which
    /// wakes blocked waiters with a disconnect.
    pub(crate) fn post(&self, event: RendererEvent) -> bool {
        if self.shared.shutdown.load(Ordering::Acquire) {
            debug!("Dropping {event:?} after shutdown.");
            return false;
        }
        self.shared.queue.send(event).is_ok()
    }

    /// Installs a renderer for `window_id` and blocks until the render
    /// thread has constructed it, so the caller holds the GPU capability
    /// flags before proceeding. This is the one deliberate exception to
    /// "never block the calling thread on rendering work"; window creation
    /// is rare. `None` means creation failed and the caller should fall
    /// back to an unaccelerated path rather than retry.
    pub fn create_renderer(&self, window_id: WindowId, setup: RendererSetup) -> Option<RenderApi> {
        let (result_tx, result_rx) = bounded(1);
        if !self.post(RendererEvent::NewRenderer {
            window_id,
            setup,
            result_tx,
        }) {
            return None;
        }
        let capabilities = result_rx.recv().ok().flatten()?;
        Some(RenderApi::new(window_id, self.clone(), capabilities))
    }

    /// Dispatches one frame for the window. No-op once the window is
    /// destroyed, shutdown has begun, or a device reset is being handled.
    pub fn handle_frame(&self, window_id: WindowId, should_render: bool) {
        if self.is_handling_device_reset() || self.shared.frame_states.is_destroyed(window_id) {
            return;
        }
        self.post(RendererEvent::HandleFrame {
            window_id,
            should_render,
        });
    }

    pub fn wake_up(&self, window_id: WindowId) {
        if self.is_handling_device_reset() || self.shared.frame_states.is_destroyed(window_id) {
            return;
        }
        self.post(RendererEvent::WakeUp { window_id });
    }

    /// The flow-control contract of the pipeline: upstream schedulers must
    /// consult this before submitting a frame and skip or defer submission
    /// while it returns true.
    pub fn too_many_pending_frames(&self, window_id: WindowId) -> bool {
        self.shared
            .frame_states
            .too_many_pending_frames(window_id, self.shared.config.max_pending_frames)
    }

    pub fn is_destroyed(&self, window_id: WindowId) -> bool {
        self.shared.frame_states.is_destroyed(window_id)
    }

    pub fn inc_pending_frame_count(&self, window_id: WindowId) {
        self.shared
            .frame_states
            .inc_pending(window_id, Instant::now());
    }

    pub fn dec_pending_frame_count(&self, window_id: WindowId) {
        self.shared
            .frame_states
            .dec_pending(window_id, Instant::now());
    }

    pub fn inc_rendering_frame_count(&self, window_id: WindowId) {
        self.shared.frame_states.inc_rendering(window_id);
    }

    pub fn frame_rendering_complete(&self, window_id: WindowId) {
        self.shared
            .frame_states
            .frame_rendering_complete(window_id, Instant::now());
    }

    pub fn pending_frames(&self, window_id: WindowId) -> u8 {
        self.shared.frame_states.pending_frames(window_id)
    }

    pub fn window_count(&self) -> usize {
        self.shared.frame_states.window_count()
    }

    /// Total latency accumulated across completed frames, and how many
    /// frames contributed to it.
    pub fn accumulated_frame_latency(&self) -> (Duration, u64) {
        self.shared.frame_states.accumulated_latency()
    }

    /// Begins device-reset handling. Idempotent; renderer teardown and
    /// recreation are driven externally once the flag is observed.
    pub fn handle_device_reset(&self, reason: DeviceResetReason, notify: bool) {
        if self.is_handling_device_reset() {
            return;
        }
        self.post(RendererEvent::DeviceReset { reason, notify });
    }

    /// The diagnostic surface for exercising device-loss recovery.
    pub fn simulate_device_reset(&self) {
        self.handle_device_reset(DeviceResetReason::Simulated, true);
    }

    pub fn is_handling_device_reset(&self) -> bool {
        self.shared.handling_device_reset.load(Ordering::Acquire)
    }

    pub fn register_external_image(
        &self,
        id: ExternalImageId,
        texture: Arc<dyn RenderTextureHost>,
    ) {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return;
        }
        self.shared.textures.register(id, texture);
    }

    /// Unregistration may race with rendering. Called on the render thread
    /// the texture is destroyed immediately; from any other thread the
    /// destruction is deferred to a posted cleanup event.
    pub fn unregister_external_image(&self, id: ExternalImageId) {
        if self.shared.textures.unregister(id) {
            self.post(RendererEvent::FlushDeferredTextures);
        }
    }

    pub fn get_render_texture(&self, id: ExternalImageId) -> Option<Arc<dyn RenderTextureHost>> {
        self.shared.textures.get(id)
    }

    pub fn external_image_count(&self) -> usize {
        self.shared.textures.len()
    }

    /// Ask every registered texture to drop cached GPU memory.
    pub fn flush_memory(&self) {
        self.post(RendererEvent::ClearCachedResources);
    }

    /// Blocks for the per-renderer GPU memory estimate. Zero after shutdown.
    pub fn report_memory(&self) -> u64 {
        let (result_tx, result_rx) = bounded(1);
        if !self.post(RendererEvent::ReportMemory { result_tx }) {
            return 0;
        }
        result_rx.recv().unwrap_or(0)
    }
}

/// The render thread itself: spawns on [`RenderThread::start`], joins on
/// [`RenderThread::shut_down`] (or on drop). There is no process-global
/// instance; the embedder constructs one and passes handles down.
pub struct RenderThread {
    handle: RenderThreadHandle,
    join_handle: Option<JoinHandle<()>>,
}

impl RenderThread {
    pub fn start(config: RenderThreadConfig, compositor: CompositorProxy) -> RenderThread {
        let (core, receiver) = RenderThreadCore::new(config, compositor);
        let handle = core.handle();
        let join_handle = std::thread::Builder::new()
            .name(String::from("Renderer"))
            .spawn(move || core.run(receiver))
            .expect("Could not create the render thread.");
        RenderThread {
            handle,
            join_handle: Some(join_handle),
        }
    }

    pub fn handle(&self) -> RenderThreadHandle {
        self.handle.clone()
    }

    /// Sets the shutdown flag, making every future scheduling call a no-op,
    /// posts the blocking teardown task, waits for it, then joins the
    /// thread. Call from the owning thread only.
    pub fn shut_down(mut self) {
        self.shut_down_impl();
    }

    fn shut_down_impl(&mut self) {
        let Some(join_handle) = self.join_handle.take() else {
            return;
        };
        let shared = &self.handle.shared;
        shared.shutdown.store(true, Ordering::Release);
        let (ack_tx, ack_rx) = bounded(1);
        // Bypasses the shutdown gate in post(); the teardown task must be
        // the one event that still goes through.
        if shared.queue.send(RendererEvent::Shutdown { ack_tx }).is_ok() {
            let _ = ack_rx.recv();
        }
        if join_handle.join().is_err() {
            warn!("Render thread panicked during teardown.");
        }
    }
}

impl Drop for RenderThread {
    fn drop(&mut self) {
        self.shut_down_impl();
    }
}

/// The render-thread-affine state and event loop. Owns the renderer map
/// exclusively; only [`RenderThreadCore::handle_event`] mutates it, so the
/// map needs no lock. Constructable without an OS thread so the dispatch
/// logic can be driven synchronously in tests.
pub struct RenderThreadCore {
    shared: Arc<SharedState>,
    compositor: CompositorProxy,
    renderers: rustc_hash::FxHashMap<WindowId, Box<dyn Renderer>>,
}

impl RenderThreadCore {
    pub fn new(
        config: RenderThreadConfig,
        compositor: CompositorProxy,
    ) -> (RenderThreadCore, Receiver<RendererEvent>) {
        let (queue, receiver) = unbounded();
        let shared = Arc::new(SharedState {
            queue,
            shutdown: AtomicBool::new(false),
            handling_device_reset: AtomicBool::new(false),
            frame_states: FrameStateMap::new(),
            textures: ExternalImageRegistry::new(),
            config,
        });
        let core = RenderThreadCore {
            shared,
            compositor,
            renderers: rustc_hash::FxHashMap::default(),
        };
        (core, receiver)
    }

    pub fn handle(&self) -> RenderThreadHandle {
        RenderThreadHandle {
            shared: self.shared.clone(),
        }
    }

    fn run(mut self, receiver: Receiver<RendererEvent>) {
        self.shared
            .textures
            .set_render_thread_id(std::thread::current().id());
        while let Ok(event) = receiver.recv() {
            if self.handle_event(event) {
                break;
            }
        }
    }

    /// Processes one unit of work. Returns true when the event was the
    /// final teardown.
    pub fn handle_event(&mut self, event: RendererEvent) -> bool {
        match event {
            RendererEvent::NewRenderer {
                window_id,
                setup,
                result_tx,
            } => {
                if self.shared.shutdown.load(Ordering::Acquire) {
                    let _ = result_tx.send(None);
                    return false;
                }
                match setup() {
                    Ok(renderer) => {
                        let capabilities = renderer.capabilities();
                        self.add_renderer(window_id, renderer);
                        let _ = result_tx.send(Some(capabilities));
                    },
                    Err(err) => {
                        error!("Failed to create a renderer for {window_id:?}: {err:?}");
                        let _ = result_tx.send(None);
                    },
                }
            },
            RendererEvent::RemoveRenderer { window_id, ack_tx } => {
                self.remove_renderer(window_id);
                let _ = ack_tx.send(());
            },
            RendererEvent::Transaction { window_id, payload } => {
                // Stale work against a device that no longer exists is
                // dropped, not queued.
                if self.shared.handling_device_reset.load(Ordering::Acquire) ||
                    self.shared.frame_states.is_destroyed(window_id)
                {
                    return false;
                }
                let generate_frame = payload.generate_frame;
                if let Some(renderer) = self.renderers.get_mut(&window_id) {
                    renderer.apply_transaction(payload);
                }
                if generate_frame {
                    self.handle_frame(window_id, true);
                }
            },
            RendererEvent::HandleFrame {
                window_id,
                should_render,
            } => self.handle_frame(window_id, should_render),
            RendererEvent::WakeUp { window_id } => {
                if self.shared.handling_device_reset.load(Ordering::Acquire) ||
                    self.shared.frame_states.is_destroyed(window_id)
                {
                    return false;
                }
                if let Some(renderer) = self.renderers.get_mut(&window_id) {
                    renderer.update();
                }
            },
            RendererEvent::Readback {
                window_id,
                size,
                result_tx,
            } => {
                let result = self.renderers.get_mut(&window_id).and_then(|renderer| {
                    let len = (size.width.max(0) as usize) * (size.height.max(0) as usize) * 4;
                    let mut buffer = vec![0; len];
                    renderer.readback(size, &mut buffer).then_some(buffer)
                });
                let _ = result_tx.send(result);
            },
            RendererEvent::Pause { window_id, ack_tx } => {
                if let Some(renderer) = self.renderers.get_mut(&window_id) {
                    renderer.pause();
                }
                let _ = ack_tx.send(());
            },
            RendererEvent::Resume {
                window_id,
                result_tx,
            } => {
                let resumed = self
                    .renderers
                    .get_mut(&window_id)
                    .is_some_and(|renderer| renderer.resume());
                let _ = result_tx.send(resumed);
            },
            RendererEvent::WaitFlushed { ack_tx, .. } => {
                let _ = ack_tx.send(());
            },
            RendererEvent::FlushDeferredTextures => self.shared.textures.flush_deferred(),
            RendererEvent::DeviceReset { reason, notify } => {
                self.begin_device_reset(reason, notify)
            },
            RendererEvent::ClearCachedResources => self.shared.textures.clear_cached_resources(),
            RendererEvent::ReportMemory { result_tx } => {
                let total: u64 = self
                    .renderers
                    .values()
                    .map(|renderer| renderer.report_memory())
                    .sum();
                let _ = result_tx.send(total);
            },
            RendererEvent::Shutdown { ack_tx } => {
                self.renderers.clear();
                self.shared.frame_states.clear();
                self.shared.textures.clear();
                let _ = ack_tx.send(());
                return true;
            },
        }
        false
    }

    /// Must run on the render thread; callers arrive here via a posted
    /// event. No-op once shutdown has begun.
    fn add_renderer(&mut self, window_id: WindowId, renderer: Box<dyn Renderer>) {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return;
        }
        self.renderers.insert(window_id, renderer);
        self.shared.frame_states.insert(window_id);
    }

    fn remove_renderer(&mut self, window_id: WindowId) {
        self.renderers.remove(&window_id);
        let was_last = self.shared.frame_states.remove(window_id);
        if was_last &&
            self.shared
                .handling_device_reset
                .swap(false, Ordering::AcqRel)
        {
            debug!("Last renderer removed; device-reset handling complete.");
        }
    }

    fn handle_frame(&mut self, window_id: WindowId, should_render: bool) {
        if self.shared.shutdown.load(Ordering::Acquire) ||
            self.shared.handling_device_reset.load(Ordering::Acquire) ||
            self.shared.frame_states.is_destroyed(window_id)
        {
            return;
        }
        if !self.renderers.contains_key(&window_id) {
            return;
        }

        let (start_time, had_slow_frame) =
            self.shared.frame_states.begin_frame_dispatch(window_id);
        // A dispatch without a matching pending submission (a bare wake)
        // renders but must not unbalance the counters.
        let paired = start_time.is_some();
        let composite_start = start_time.unwrap_or_else(Instant::now);

        if should_render {
            if paired {
                self.shared.frame_states.inc_rendering(window_id);
            }
            self.update_and_render(window_id, composite_start, had_slow_frame);
            if paired {
                self.shared
                    .frame_states
                    .frame_rendering_complete(window_id, Instant::now());
            }
        } else {
            if let Some(renderer) = self.renderers.get_mut(&window_id) {
                renderer.update();
            }
            if paired {
                self.shared
                    .frame_states
                    .dec_pending(window_id, Instant::now());
            }
        }
    }

    fn update_and_render(
        &mut self,
        window_id: WindowId,
        composite_start: Instant,
        had_slow_frame: bool,
    ) {
        let Some(renderer) = self.renderers.get_mut(&window_id) else {
            return;
        };
        let render_start = Instant::now();
        match renderer.render(had_slow_frame) {
            Ok(stats) => {
                let epochs = renderer.flush_rendered_epochs();
                let end = Instant::now();
                // Completion is posted before waiting on the GPU so the
                // compositor is not delayed by the wait.
                self.compositor.send(CompositorMsg::FrameRendered {
                    window_id,
                    epochs,
                    composite_start,
                    render_start,
                    end,
                    stats,
                });
                self.shared.textures.flush_deferred();
                if end.duration_since(render_start) > self.shared.config.slow_frame_threshold {
                    self.shared.frame_states.set_had_slow_frame(window_id);
                }
                match self
                    .renderers
                    .get_mut(&window_id)
                    .map(|renderer| renderer.wait_for_gpu())
                {
                    Some(Err(RenderError::DeviceLost(reason))) => {
                        warn!("Device lost while waiting for the GPU: {reason:?}");
                        self.begin_device_reset(reason, true);
                    },
                    Some(Err(RenderError::Backend(message))) => {
                        warn!("GPU wait failed for {window_id:?}: {message}");
                    },
                    _ => {},
                }
            },
            Err(RenderError::DeviceLost(reason)) => {
                warn!("Device lost while rendering {window_id:?}: {reason:?}");
                self.begin_device_reset(reason, true);
            },
            Err(RenderError::Backend(message)) => {
                warn!("Failed to render a frame for {window_id:?}: {message}");
            },
        }
    }

    fn begin_device_reset(&mut self, reason: DeviceResetReason, notify: bool) {
        if self
            .shared
            .handling_device_reset
            .swap(true, Ordering::AcqRel)
        {
            return;
        }
        self.shared.textures.on_device_reset();
        if notify {
            self.compositor
                .send(CompositorMsg::DeviceResetDetected(reason));
        }
    }
}
