/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The unit of work consumed by the render thread.

use base::units::DeviceIntSize;
use base::{DeviceResetReason, WindowId};
use crossbeam_channel::Sender;
use strum::IntoStaticStr;

use crate::api::TransactionPayload;
use crate::renderer::{RenderError, Renderer, RendererCapabilities};

/// Constructs a renderer on the render thread. Renderer backends are free to
/// require thread affinity for their GL/driver state, so construction is
/// deferred until the event runs.
pub type RendererSetup =
    Box<dyn FnOnce() -> Result<Box<dyn Renderer>, RenderError> + Send + 'static>;

/// One unit of work posted to the render thread's queue. Ownership transfers
/// from the submitting thread; events execute strictly in post order on the
/// single consumer thread, so no two of them ever run concurrently for the
/// same window.
///
/// Reply senders embedded in a variant double as completion guards: if the
/// event is dropped without running (shutdown race, panic), the sender is
/// dropped and the waiting thread observes a disconnect instead of hanging.
#[derive(IntoStaticStr)]
pub enum RendererEvent {
    NewRenderer {
        window_id: WindowId,
        setup: RendererSetup,
        result_tx: Sender<Option<RendererCapabilities>>,
    },
    RemoveRenderer {
        window_id: WindowId,
        ack_tx: Sender<()>,
    },
    Transaction {
        window_id: WindowId,
        payload: TransactionPayload,
    },
    HandleFrame {
        window_id: WindowId,
        should_render: bool,
    },
    WakeUp {
        window_id: WindowId,
    },
    Readback {
        window_id: WindowId,
        size: DeviceIntSize,
        result_tx: Sender<Option<Vec<u8>>>,
    },
    Pause {
        window_id: WindowId,
        ack_tx: Sender<()>,
    },
    Resume {
        window_id: WindowId,
        result_tx: Sender<bool>,
    },
    /// A barrier: replying proves every previously posted event has been
    /// processed.
    WaitFlushed {
        window_id: WindowId,
        ack_tx: Sender<()>,
    },
    /// Run the deferred external-image destruction list on the thread that
    /// owns the GPU resources.
    FlushDeferredTextures,
    DeviceReset {
        reason: DeviceResetReason,
        notify: bool,
    },
    /// Drop cached GPU resources across all registered textures, without
    /// touching renderer state. The flush-memory surface.
    ClearCachedResources,
    /// Accumulate per-renderer GPU memory estimates and reply with the total.
    ReportMemory {
        result_tx: Sender<u64>,
    },
    /// Teardown; always the last event the thread runs.
    Shutdown {
        ack_tx: Sender<()>,
    },
}

impl std::fmt::Debug for RendererEvent {
    fn fmt(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        let string: &'static str = self.into();
        write!(formatter, "{string}")
    }
}
