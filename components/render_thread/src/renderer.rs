/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The GPU-facing side of one window.

use base::units::DeviceIntSize;
use base::{DeviceResetReason, Epoch, PipelineId};
use serde::{Deserialize, Serialize};

use crate::api::TransactionPayload;

/// Counters reported by the backend for one rendered frame.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct FrameStats {
    pub resource_upload_bytes: u64,
    pub gpu_cache_upload_bytes: u64,
    pub frame_count: u32,
}

impl FrameStats {
    pub fn merge(&mut self, other: &FrameStats) {
        self.resource_upload_bytes += other.resource_upload_bytes;
        self.gpu_cache_upload_bytes += other.gpu_cache_upload_bytes;
        self.frame_count += other.frame_count;
    }
}

/// Capability flags established when a renderer is installed, before the
/// caller is allowed to proceed.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct RendererCapabilities {
    pub max_texture_size: i32,
    pub supports_partial_present: bool,
    pub supports_async_screenshots: bool,
    pub uses_triple_buffering: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum RenderError {
    /// The device backing this renderer is gone; recovery goes through
    /// device-reset handling, not through retrying the frame.
    DeviceLost(DeviceResetReason),
    Backend(String),
}

/// A renderer owns the GPU device/context resources for one window. It is
/// exclusively owned and mutated by the render thread; no other thread may
/// call into it.
pub trait Renderer: Send {
    /// Apply a transaction's scene and resource updates without producing
    /// a frame.
    fn apply_transaction(&mut self, transaction: TransactionPayload);

    /// The lighter path taken when a frame dispatch asks for an update
    /// without a render.
    fn update(&mut self);

    /// GPU submission and present.
    fn render(&mut self, had_slow_frame: bool) -> Result<FrameStats, RenderError>;

    /// Brief block until the GPU has finished the submitted work. Only ever
    /// called after the completion notification for the frame has been
    /// posted.
    fn wait_for_gpu(&mut self) -> Result<(), RenderError>;

    /// The epochs made visible to the screen by the last render, per
    /// pipeline.
    fn flush_rendered_epochs(&mut self) -> Vec<(PipelineId, Epoch)>;

    /// Synchronously read the current frame back into `buffer`. Returns
    /// false if the surface could not be read.
    fn readback(&mut self, size: DeviceIntSize, buffer: &mut [u8]) -> bool;

    fn pause(&mut self);

    /// Returns false if the underlying surface could not be revived.
    fn resume(&mut self) -> bool;

    fn capabilities(&self) -> RendererCapabilities;

    /// An estimate of GPU memory retained by this renderer, accumulated into
    /// process memory reports.
    fn report_memory(&self) -> u64 {
        0
    }
}
