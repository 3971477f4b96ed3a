/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

#![deny(unsafe_code)]

//! The compositor-side bridge for one window.
//!
//! Translates inbound transaction messages from a content session into
//! [`Transaction`] submissions, and tracks which epochs are in flight so
//! that, once the render thread reports an epoch as rendered, the original
//! submission's timestamps can be correlated and the first-paint/telemetry
//! callbacks fired exactly once per transaction.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use base::units::DeviceIntSize;
use base::{Epoch, PipelineId, TransactionId, WindowId};
use crossbeam_channel::Sender;
use log::warn;
use render_thread::api::{ResourceUpdate, SceneOp};
use render_thread::{RenderApi, RenderThreadHandle, Transaction};
use smallvec::SmallVec;
use strum::IntoStaticStr;

/// One submitted-but-not-yet-rendered transaction.
#[derive(Clone, Copy, Debug)]
pub struct PendingTransaction {
    pub epoch: Epoch,
    pub transaction_id: TransactionId,
    pub contains_vector_content: bool,
    pub refresh_start: Instant,
    pub txn_start: Instant,
    pub fwd_time: Instant,
    pub is_first_paint: bool,
    pub use_for_telemetry: bool,
}

/// Latency figures for one rendered transaction, measured against the end
/// of its composite.
#[derive(Clone, Copy, Debug)]
pub struct PaintLatency {
    pub transaction_id: TransactionId,
    pub from_refresh_start: Duration,
    pub from_txn_start: Duration,
    pub from_fwd_time: Duration,
    pub contains_vector_content: bool,
}

/// Callbacks the bridge fires toward the UI layer. Implemented by the
/// embedder; by a counting mock in tests.
pub trait UiListener {
    fn notify_first_paint(&self, window_id: WindowId, transaction_id: TransactionId);
    fn record_paint_latency(&self, window_id: WindowId, latency: PaintLatency);
}

/// The in-flight transaction FIFO. Ordered by non-decreasing epoch; consumed
/// strictly in order as the renderer reports completed epochs.
#[derive(Default)]
pub struct PendingTransactionQueue {
    entries: VecDeque<PendingTransaction>,
}

impl PendingTransactionQueue {
    pub fn new() -> PendingTransactionQueue {
        PendingTransactionQueue::default()
    }

    /// Appends at the tail. The bridge never reorders, so epochs must
    /// arrive non-decreasing.
    pub fn hold(&mut self, entry: PendingTransaction) {
        if let Some(last) = self.entries.back() {
            debug_assert!(entry.epoch >= last.epoch, "pending epochs must not regress");
            if entry.epoch < last.epoch {
                warn!(
                    "Pending transaction epoch regressed: {:?} after {:?}.",
                    entry.epoch, last.epoch
                );
            }
        }
        self.entries.push_back(entry);
    }

    /// The sole consume path. Pops every entry whose epoch is at or below
    /// the rendered epoch, in submission order, firing first-paint and
    /// telemetry callbacks for each exactly once. Returns the id of the
    /// last flushed entry, which callers may acknowledge up to.
    pub fn flush_rendered(
        &mut self,
        window_id: WindowId,
        rendered_epoch: Epoch,
        end_time: Instant,
        listener: &dyn UiListener,
    ) -> Option<TransactionId> {
        let mut last_flushed = None;
        while self
            .entries
            .front()
            .is_some_and(|front| front.epoch <= rendered_epoch)
        {
            let Some(entry) = self.entries.pop_front() else {
                break;
            };
            if entry.is_first_paint {
                listener.notify_first_paint(window_id, entry.transaction_id);
            }
            if entry.use_for_telemetry {
                listener.record_paint_latency(
                    window_id,
                    PaintLatency {
                        transaction_id: entry.transaction_id,
                        from_refresh_start: end_time.saturating_duration_since(entry.refresh_start),
                        from_txn_start: end_time.saturating_duration_since(entry.txn_start),
                        from_fwd_time: end_time.saturating_duration_since(entry.fwd_time),
                        contains_vector_content: entry.contains_vector_content,
                    },
                );
            }
            last_flushed = Some(entry.transaction_id);
        }
        last_flushed
    }

    /// Teardown variant: discards stale entries without firing callbacks.
    pub fn remove_prior_to(&mut self, rendered_epoch: Epoch) {
        while let Some(front) = self.entries.front() {
            if front.epoch > rendered_epoch {
                break;
            }
            self.entries.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A transaction as received from the content session, with the resource
/// handles already resolved.
pub struct TransactionRequest {
    pub epoch: Epoch,
    pub scene_ops: Vec<SceneOp>,
    pub resource_updates: SmallVec<[ResourceUpdate; 1]>,
    pub low_priority: bool,
    pub use_scene_builder_thread: bool,
    pub generate_frame: bool,
    pub refresh_start: Instant,
    pub txn_start: Instant,
    pub contains_vector_content: bool,
    pub is_first_paint: bool,
    pub use_for_telemetry: bool,
}

/// Messages from the content session to the bridge. Reply channels are
/// embedded in the variants that need one.
#[derive(IntoStaticStr)]
pub enum BridgeMsg {
    SubmitTransaction(Box<TransactionRequest>),
    PauseCompositing {
        ack_tx: Sender<()>,
    },
    ResumeCompositing {
        result_tx: Sender<bool>,
    },
    RequestScreenshot {
        size: DeviceIntSize,
        result_tx: Sender<Option<Vec<u8>>>,
    },
    SimulateDeviceReset,
    FlushMemory,
}

impl std::fmt::Debug for BridgeMsg {
    fn fmt(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        let string: &'static str = self.into();
        write!(formatter, "{string}")
    }
}

/// The scheduling half of one window's cross-process bridge.
pub struct RenderBridge {
    window_id: WindowId,
    root_pipeline_id: PipelineId,
    api: RenderApi,
    render_thread: RenderThreadHandle,
    pending: PendingTransactionQueue,
    next_transaction_id: TransactionId,
    /// A frame request postponed because the window was backpressured; paid
    /// off when the next completion frees a slot.
    deferred_frame: bool,
}

impl RenderBridge {
    pub fn new(
        root_pipeline_id: PipelineId,
        api: RenderApi,
        render_thread: RenderThreadHandle,
    ) -> RenderBridge {
        let mut transaction = Transaction::new();
        transaction.set_root_pipeline(root_pipeline_id);
        api.send_transaction(&mut transaction);
        RenderBridge {
            window_id: api.window_id(),
            root_pipeline_id,
            api,
            render_thread,
            pending: PendingTransactionQueue::new(),
            next_transaction_id: TransactionId::ZERO,
            deferred_frame: false,
        }
    }

    pub fn window_id(&self) -> WindowId {
        self.window_id
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Barrier: blocks until the render thread has processed everything
    /// this bridge posted so far.
    pub fn wait_flushed(&self) {
        self.api.wait_flushed();
    }

    pub fn process_message(&mut self, msg: BridgeMsg) {
        match msg {
            BridgeMsg::SubmitTransaction(request) => self.submit_transaction(*request),
            BridgeMsg::PauseCompositing { ack_tx } => {
                self.api.pause();
                let _ = ack_tx.send(());
            },
            BridgeMsg::ResumeCompositing { result_tx } => {
                let _ = result_tx.send(self.api.resume());
            },
            BridgeMsg::RequestScreenshot { size, result_tx } => {
                let _ = result_tx.send(self.api.readback(size));
            },
            BridgeMsg::SimulateDeviceReset => self.render_thread.simulate_device_reset(),
            BridgeMsg::FlushMemory => self.render_thread.flush_memory(),
        }
    }

    fn submit_transaction(&mut self, request: TransactionRequest) {
        let transaction_id = self.next_transaction_id.next();
        self.next_transaction_id = transaction_id;

        let mut transaction = Transaction::new();
        for op in request.scene_ops {
            match op {
                SceneOp::UpdateEpoch { pipeline_id, epoch } => {
                    transaction.update_epoch(pipeline_id, epoch)
                },
                SceneOp::SetDisplayList {
                    pipeline_id,
                    epoch,
                    display_list,
                } => transaction.set_display_list(pipeline_id, epoch, display_list),
                SceneOp::SetRootPipeline { pipeline_id } => {
                    transaction.set_root_pipeline(pipeline_id)
                },
                SceneOp::RemovePipeline { pipeline_id } => {
                    transaction.remove_pipeline(pipeline_id)
                },
                SceneOp::UpdateDynamicProperties { updates } => {
                    transaction.update_dynamic_properties(updates)
                },
            }
        }
        for update in request.resource_updates {
            match update {
                ResourceUpdate::AddImage(key, descriptor, data) => {
                    transaction.add_image(key, descriptor, data)
                },
                ResourceUpdate::UpdateImage(key, descriptor, data) => {
                    transaction.update_image(key, descriptor, data)
                },
                ResourceUpdate::DeleteImage(key) => transaction.delete_image(key),
            }
        }
        transaction.set_low_priority(request.low_priority);
        if request.use_scene_builder_thread {
            transaction.use_scene_builder_thread();
        }

        self.pending.hold(PendingTransaction {
            epoch: request.epoch,
            transaction_id,
            contains_vector_content: request.contains_vector_content,
            refresh_start: request.refresh_start,
            txn_start: request.txn_start,
            fwd_time: Instant::now(),
            is_first_paint: request.is_first_paint,
            use_for_telemetry: request.use_for_telemetry,
        });

        if request.generate_frame {
            // Backpressure is policy, not an error: the frame request is
            // deferred, while the scene and resource updates go through so
            // the backend never works against stale data.
            if self.render_thread.too_many_pending_frames(self.window_id) {
                self.deferred_frame = true;
            } else {
                self.render_thread.inc_pending_frame_count(self.window_id);
                transaction.generate_frame();
            }
        }

        self.api.send_transaction(&mut transaction);
    }

    /// Called with the epochs from a frame-rendered notification. Flushes
    /// every pending entry the render covered and pays off a deferred frame
    /// request if a slot has freed up.
    pub fn notify_frame_rendered(
        &mut self,
        epochs: &[(PipelineId, Epoch)],
        end_time: Instant,
        listener: &dyn UiListener,
    ) -> Option<TransactionId> {
        let rendered = epochs
            .iter()
            .find(|(pipeline_id, _)| *pipeline_id == self.root_pipeline_id)
            .map(|(_, epoch)| *epoch)?;
        let flushed = self
            .pending
            .flush_rendered(self.window_id, rendered, end_time, listener);

        if self.deferred_frame && !self.render_thread.too_many_pending_frames(self.window_id) {
            self.deferred_frame = false;
            self.render_thread.inc_pending_frame_count(self.window_id);
            let mut transaction = Transaction::new();
            transaction.generate_frame();
            self.api.send_transaction(&mut transaction);
        }
        flushed
    }

    /// Teardown: discard the queue without callbacks and release the
    /// renderer by dropping the API handle.
    pub fn destroy(mut self) {
        self.pending.remove_prior_to(Epoch(u32::MAX));
    }
}
