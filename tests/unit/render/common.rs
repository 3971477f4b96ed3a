/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use base::units::DeviceIntSize;
use base::{Epoch, PipelineId, TransactionId, WindowId};
use bridge::{PaintLatency, UiListener};
use crossbeam_channel::{Receiver, unbounded};
use render_thread::api::{SceneOp, TransactionPayload};
use render_thread::{
    CompositorMsg, CompositorProxy, FrameStats, NoopWaker, RenderError, Renderer,
    RendererCapabilities, RendererSetup,
};

#[derive(Default)]
pub struct RendererProbe {
    pub renders: AtomicUsize,
    pub updates: AtomicUsize,
    pub dropped: AtomicUsize,
}

impl RendererProbe {
    pub fn renders(&self) -> usize {
        self.renders.load(Ordering::SeqCst)
    }

    pub fn updates(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }
}

/// A renderer that counts what happens to it and tracks applied epochs so
/// completion notifications carry real data.
pub struct CountingRenderer {
    probe: Arc<RendererProbe>,
    epochs: Vec<(PipelineId, Epoch)>,
}

impl CountingRenderer {
    pub fn setup(probe: Arc<RendererProbe>) -> RendererSetup {
        Box::new(move || {
            Ok(Box::new(CountingRenderer {
                probe,
                epochs: Vec::new(),
            }) as Box<dyn Renderer>)
        })
    }
}

impl Drop for CountingRenderer {
    fn drop(&mut self) {
        self.probe.dropped.fetch_add(1, Ordering::SeqCst);
    }
}

impl Renderer for CountingRenderer {
    fn apply_transaction(&mut self, transaction: TransactionPayload) {
        for op in &transaction.scene_ops {
            let (SceneOp::UpdateEpoch { pipeline_id, epoch } |
            SceneOp::SetDisplayList {
                pipeline_id, epoch, ..
            }) = op
            else {
                continue;
            };
            match self.epochs.iter_mut().find(|(id, _)| id == pipeline_id) {
                Some(entry) => entry.1 = *epoch,
                None => self.epochs.push((*pipeline_id, *epoch)),
            }
        }
    }

    fn update(&mut self) {
        self.probe.updates.fetch_add(1, Ordering::SeqCst);
    }

    fn render(&mut self, _: bool) -> Result<FrameStats, RenderError> {
        self.probe.renders.fetch_add(1, Ordering::SeqCst);
        Ok(FrameStats::default())
    }

    fn wait_for_gpu(&mut self) -> Result<(), RenderError> {
        Ok(())
    }

    fn flush_rendered_epochs(&mut self) -> Vec<(PipelineId, Epoch)> {
        self.epochs.clone()
    }

    fn readback(&mut self, _: DeviceIntSize, buffer: &mut [u8]) -> bool {
        buffer.fill(0xab);
        true
    }

    fn pause(&mut self) {}

    fn resume(&mut self) -> bool {
        true
    }

    fn capabilities(&self) -> RendererCapabilities {
        RendererCapabilities {
            max_texture_size: 4096,
            supports_partial_present: true,
            supports_async_screenshots: true,
            uses_triple_buffering: false,
        }
    }
}

/// A compositor endpoint backed by a plain channel.
pub fn compositor_pair() -> (CompositorProxy, Receiver<CompositorMsg>) {
    let (sender, receiver) = unbounded();
    (
        CompositorProxy {
            sender,
            event_loop_waker: Box::new(NoopWaker),
        },
        receiver,
    )
}

/// Counts bridge callbacks across threads.
#[derive(Default)]
pub struct CountingListener {
    pub first_paints: AtomicUsize,
    pub telemetry_records: AtomicUsize,
}

impl UiListener for CountingListener {
    fn notify_first_paint(&self, _: WindowId, _: TransactionId) {
        self.first_paints.fetch_add(1, Ordering::SeqCst);
    }

    fn record_paint_latency(&self, _: WindowId, _: PaintLatency) {
        self.telemetry_records.fetch_add(1, Ordering::SeqCst);
    }
}
