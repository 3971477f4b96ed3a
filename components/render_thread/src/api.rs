/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The compositor-thread handle for submitting work to the render thread.
//!
//! Everything here is callable from outside the render thread. Fire-and-forget
//! operations post a [`RendererEvent`] and return; the handful of operations
//! whose callers depend on the render thread having reached a specific point
//! (creation, teardown, pause/resume, readback, flush barriers) block on a
//! one-shot reply channel instead.

use std::sync::Arc;

use base::units::DeviceIntSize;
use base::{Epoch, PipelineId, WindowId};
use bitflags::bitflags;
use crossbeam_channel::bounded;
use log::warn;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::RenderThreadHandle;
use crate::event::RendererEvent;
use crate::renderer::RendererCapabilities;

/// A key naming one image resource inside a window's resource namespace.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct ImageKey(pub u32, pub u32);

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum ImageFormat {
    Rgba8,
    Bgra8,
    A8,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct ImageDescriptor {
    pub size: DeviceIntSize,
    pub stride: Option<i32>,
    pub format: ImageFormat,
}

/// A built display list, already serialized by the content side. The scene
/// representation inside is opaque to scheduling.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct DisplayListPayload {
    pub data: Vec<u8>,
    pub item_count: u32,
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub enum PropertyValue {
    Transform([f32; 16]),
    Opacity(f32),
}

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct PropertyUpdate {
    pub key: u64,
    pub value: PropertyValue,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum ResourceUpdate {
    AddImage(ImageKey, ImageDescriptor, Vec<u8>),
    UpdateImage(ImageKey, ImageDescriptor, Vec<u8>),
    DeleteImage(ImageKey),
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub enum SceneOp {
    UpdateEpoch {
        pipeline_id: PipelineId,
        epoch: Epoch,
    },
    SetDisplayList {
        pipeline_id: PipelineId,
        epoch: Epoch,
        display_list: DisplayListPayload,
    },
    SetRootPipeline {
        pipeline_id: PipelineId,
    },
    RemovePipeline {
        pipeline_id: PipelineId,
    },
    UpdateDynamicProperties {
        updates: Vec<PropertyUpdate>,
    },
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct TransactionFlags(u8);

bitflags! {
    impl TransactionFlags: u8 {
        /// Allow the scene build to be scheduled behind higher-priority work.
        const LOW_PRIORITY = 1 << 0;
        /// Route the scene build through the dedicated scene-builder thread.
        const USE_SCENE_BUILDER_THREAD = 1 << 1;
        /// Invalidate the rendered frame even if the scene is unchanged.
        const INVALIDATE_RENDERED_FRAME = 1 << 2;
    }
}

/// The drained contents of a [`Transaction`], applied atomically by the
/// backend.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct TransactionPayload {
    pub scene_ops: Vec<SceneOp>,
    pub resource_updates: SmallVec<[ResourceUpdate; 1]>,
    pub flags: TransactionFlags,
    pub generate_frame: bool,
}

impl TransactionPayload {
    pub fn is_empty(&self) -> bool {
        self.scene_ops.is_empty() &&
            self.resource_updates.is_empty() &&
            !self.generate_frame &&
            !self
                .flags
                .contains(TransactionFlags::INVALIDATE_RENDERED_FRAME)
    }
}

/// An append-only batch of scene and resource operations. Built on the
/// compositor/content side, transferred to [`RenderApi::send_transaction`]
/// exactly once; sending drains the builder, so a guaranteed-send wrapper
/// that fires after a manual send is a harmless no-op.
#[derive(Debug, Default)]
pub struct Transaction {
    payload: TransactionPayload,
}

impl Transaction {
    pub fn new() -> Transaction {
        Transaction::default()
    }

    pub fn update_epoch(&mut self, pipeline_id: PipelineId, epoch: Epoch) {
        self.payload
            .scene_ops
            .push(SceneOp::UpdateEpoch { pipeline_id, epoch });
    }

    pub fn set_display_list(
        &mut self,
        pipeline_id: PipelineId,
        epoch: Epoch,
        display_list: DisplayListPayload,
    ) {
        self.payload.scene_ops.push(SceneOp::SetDisplayList {
            pipeline_id,
            epoch,
            display_list,
        });
    }

    pub fn set_root_pipeline(&mut self, pipeline_id: PipelineId) {
        self.payload
            .scene_ops
            .push(SceneOp::SetRootPipeline { pipeline_id });
    }

    pub fn remove_pipeline(&mut self, pipeline_id: PipelineId) {
        self.payload
            .scene_ops
            .push(SceneOp::RemovePipeline { pipeline_id });
    }

    pub fn update_dynamic_properties(&mut self, updates: Vec<PropertyUpdate>) {
        self.payload
            .scene_ops
            .push(SceneOp::UpdateDynamicProperties { updates });
    }

    pub fn add_image(&mut self, key: ImageKey, descriptor: ImageDescriptor, data: Vec<u8>) {
        self.payload
            .resource_updates
            .push(ResourceUpdate::AddImage(key, descriptor, data));
    }

    pub fn update_image(&mut self, key: ImageKey, descriptor: ImageDescriptor, data: Vec<u8>) {
        self.payload
            .resource_updates
            .push(ResourceUpdate::UpdateImage(key, descriptor, data));
    }

    pub fn delete_image(&mut self, key: ImageKey) {
        self.payload
            .resource_updates
            .push(ResourceUpdate::DeleteImage(key));
    }

    /// Ask the backend to produce a frame for the current set of display
    /// lists once this transaction is applied.
    pub fn generate_frame(&mut self) {
        self.payload.generate_frame = true;
    }

    pub fn invalidate_rendered_frame(&mut self) {
        self.payload
            .flags
            .insert(TransactionFlags::INVALIDATE_RENDERED_FRAME);
    }

    pub fn set_low_priority(&mut self, low_priority: bool) {
        self.payload
            .flags
            .set(TransactionFlags::LOW_PRIORITY, low_priority);
    }

    pub fn use_scene_builder_thread(&mut self) {
        self.payload
            .flags
            .insert(TransactionFlags::USE_SCENE_BUILDER_THREAD);
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Reset to the empty-but-valid state so the builder can be reused.
    pub fn clear(&mut self) {
        self.payload = TransactionPayload::default();
    }

    fn take_payload(&mut self) -> TransactionPayload {
        std::mem::take(&mut self.payload)
    }
}

/// Owns the renderer installed for one window. Dropping the last API handle
/// for the window tears the renderer down synchronously, so the renderer can
/// never dangle past the handles that submit to it. Exactly one teardown runs
/// per window.
struct RendererOwner {
    window_id: WindowId,
    thread: RenderThreadHandle,
}

impl Drop for RendererOwner {
    fn drop(&mut self) {
        let (ack_tx, ack_rx) = bounded(1);
        if !self.thread.post(RendererEvent::RemoveRenderer {
            window_id: self.window_id,
            ack_tx,
        }) {
            // Shutdown already tore the renderer down.
            return;
        }
        if ack_rx.recv().is_err() {
            warn!(
                "Render thread went away before renderer for {:?} was removed.",
                self.window_id
            );
        }
    }
}

/// The handle by which a compositor-thread client submits scene and resource
/// updates for one window/document.
///
/// Child document handles created with [`RenderApi::clone_document`] share
/// ownership of the underlying renderer; the teardown round trip runs when
/// the last of them goes away.
pub struct RenderApi {
    window_id: WindowId,
    thread: RenderThreadHandle,
    capabilities: RendererCapabilities,
    owner: Arc<RendererOwner>,
}

impl RenderApi {
    pub(crate) fn new(
        window_id: WindowId,
        thread: RenderThreadHandle,
        capabilities: RendererCapabilities,
    ) -> RenderApi {
        let owner = Arc::new(RendererOwner {
            window_id,
            thread: thread.clone(),
        });
        RenderApi {
            window_id,
            thread,
            capabilities,
            owner,
        }
    }

    pub fn window_id(&self) -> WindowId {
        self.window_id
    }

    pub fn capabilities(&self) -> RendererCapabilities {
        self.capabilities
    }

    /// A second handle onto the same window, for a sub-document sharing its
    /// pipeline. Keeps the renderer alive as long as either handle exists.
    pub fn clone_document(&self) -> RenderApi {
        RenderApi {
            window_id: self.window_id,
            thread: self.thread.clone(),
            capabilities: self.capabilities,
            owner: self.owner.clone(),
        }
    }

    /// Hand the built transaction to the backend without blocking. Drains
    /// the builder; sending the same builder again is a no-op.
    pub fn send_transaction(&self, transaction: &mut Transaction) {
        if transaction.is_empty() {
            return;
        }
        let payload = transaction.take_payload();
        self.thread.post(RendererEvent::Transaction {
            window_id: self.window_id,
            payload,
        });
    }

    /// Synchronously read the current frame back. `None` if the render
    /// thread is gone, the window is unknown, or the surface could not be
    /// read.
    pub fn readback(&self, size: DeviceIntSize) -> Option<Vec<u8>> {
        let (result_tx, result_rx) = bounded(1);
        if !self.thread.post(RendererEvent::Readback {
            window_id: self.window_id,
            size,
            result_tx,
        }) {
            return None;
        }
        result_rx.recv().unwrap_or_default()
    }

    /// Blocks until rendering for this window is paused.
    pub fn pause(&self) {
        let (ack_tx, ack_rx) = bounded(1);
        if self.thread.post(RendererEvent::Pause {
            window_id: self.window_id,
            ack_tx,
        }) {
            let _ = ack_rx.recv();
        }
    }

    /// Blocks until the surface is revived. False if it could not be.
    pub fn resume(&self) -> bool {
        let (result_tx, result_rx) = bounded(1);
        if !self.thread.post(RendererEvent::Resume {
            window_id: self.window_id,
            result_tx,
        }) {
            return false;
        }
        result_rx.recv().unwrap_or(false)
    }

    /// Blocks until every event posted before this call has been processed.
    pub fn wait_flushed(&self) {
        let (ack_tx, ack_rx) = bounded(1);
        if self.thread.post(RendererEvent::WaitFlushed {
            window_id: self.window_id,
            ack_tx,
        }) {
            let _ = ack_rx.recv();
        }
    }
}

#[cfg(test)]
mod tests {
    use base::{Epoch, PipelineId};

    use super::{Transaction, TransactionFlags};

    #[test]
    fn transaction_starts_empty_and_clear_resets_it() {
        let mut transaction = Transaction::new();
        assert!(transaction.is_empty());

        transaction.update_epoch(PipelineId::ROOT, Epoch(1));
        transaction.generate_frame();
        transaction.set_low_priority(true);
        assert!(!transaction.is_empty());

        transaction.clear();
        assert!(transaction.is_empty());
        assert_eq!(transaction.payload.flags, TransactionFlags::empty());
    }

    #[test]
    fn take_payload_leaves_an_empty_valid_builder() {
        let mut transaction = Transaction::new();
        transaction.update_epoch(PipelineId::ROOT, Epoch(3));
        transaction.generate_frame();

        let payload = transaction.take_payload();
        assert!(payload.generate_frame);
        assert_eq!(payload.scene_ops.len(), 1);

        // The drained builder can be reused immediately.
        assert!(transaction.is_empty());
        transaction.update_epoch(PipelineId::ROOT, Epoch(4));
        assert_eq!(transaction.payload.scene_ops.len(), 1);
    }

    #[test]
    fn generate_frame_alone_makes_a_transaction_nonempty() {
        let mut transaction = Transaction::new();
        transaction.generate_frame();
        assert!(!transaction.is_empty());
    }
}
