/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! A headless shell around the GPU process, for smoke-testing the render
//! pipeline without a compositor embedder: boots the process, drives a few
//! frames through a software renderer, and shuts down in order.

use std::time::Duration;

use base::units::DeviceIntSize;
use base::{Epoch, PipelineId, TransactionId, WindowId};
use bridge::{BridgeMsg, PaintLatency, RenderBridge, TransactionRequest, UiListener};
use crossbeam_channel::{RecvTimeoutError, unbounded};
use gpu::{FatalProcessError, GpuInit, GpuProcess};
use log::{error, info, warn};
use render_thread::api::{DisplayListPayload, SceneOp, TransactionPayload};
use render_thread::{
    CompositorMsg, CompositorProxy, FrameStats, NoopWaker, RenderError, Renderer,
    RendererCapabilities,
};
use smallvec::SmallVec;

/// A renderer with no GPU behind it; tracks epochs so completion
/// notifications stay truthful.
#[derive(Default)]
struct HeadlessRenderer {
    epochs: Vec<(PipelineId, Epoch)>,
}

impl Renderer for HeadlessRenderer {
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

    fn update(&mut self) {}

    fn render(&mut self, _: bool) -> Result<FrameStats, RenderError> {
        Ok(FrameStats {
            frame_count: 1,
            ..FrameStats::default()
        })
    }

    fn wait_for_gpu(&mut self) -> Result<(), RenderError> {
        Ok(())
    }

    fn flush_rendered_epochs(&mut self) -> Vec<(PipelineId, Epoch)> {
        self.epochs.clone()
    }

    fn readback(&mut self, _: DeviceIntSize, buffer: &mut [u8]) -> bool {
        buffer.fill(0);
        true
    }

    fn pause(&mut self) {}

    fn resume(&mut self) -> bool {
        true
    }

    fn capabilities(&self) -> RendererCapabilities {
        RendererCapabilities {
            max_texture_size: 16384,
            supports_partial_present: false,
            supports_async_screenshots: true,
            uses_triple_buffering: false,
        }
    }
}

struct LoggingListener;

impl UiListener for LoggingListener {
    fn notify_first_paint(&self, window_id: WindowId, transaction_id: TransactionId) {
        info!("First paint for {window_id:?} at {transaction_id:?}.");
    }

    fn record_paint_latency(&self, _: WindowId, latency: PaintLatency) {
        info!(
            "Transaction {:?} painted after {:?}.",
            latency.transaction_id, latency.from_txn_start
        );
    }
}

fn transaction_request(epoch: Epoch, first: bool) -> Box<TransactionRequest> {
    let now = std::time::Instant::now();
    Box::new(TransactionRequest {
        epoch,
        scene_ops: vec![SceneOp::SetDisplayList {
            pipeline_id: PipelineId::ROOT,
            epoch,
            display_list: DisplayListPayload {
                data: vec![0; 64],
                item_count: 1,
            },
        }],
        resource_updates: SmallVec::new(),
        low_priority: false,
        use_scene_builder_thread: false,
        generate_frame: true,
        refresh_start: now,
        txn_start: now,
        contains_vector_content: false,
        is_first_paint: first,
        use_for_telemetry: true,
    })
}

fn run(frame_count: u32) -> Result<(), FatalProcessError> {
    let (compositor_tx, compositor_rx) = unbounded();
    let proxy = CompositorProxy {
        sender: compositor_tx,
        event_loop_waker: Box::new(NoopWaker),
    };
    let mut process = GpuProcess::new(GpuInit::default(), proxy)?;
    for status in &process.device_status().features {
        info!(
            "{:?}: {}",
            status.feature,
            if status.enabled { "enabled" } else { "disabled" }
        );
    }

    let render_thread = process.render_thread_handle();
    let window_id = WindowId::new();
    let api = render_thread
        .create_renderer(
            window_id,
            Box::new(|| Ok(Box::new(HeadlessRenderer::default()) as Box<dyn Renderer>)),
        )
        .ok_or_else(|| {
            FatalProcessError::RuntimeInitFailed(String::from("renderer creation failed"))
        })?;

    let mut bridge = RenderBridge::new(PipelineId::ROOT, api, render_thread);
    let listener = LoggingListener;
    let mut epoch = Epoch(0);
    for frame in 0..frame_count {
        epoch.next();
        bridge.process_message(BridgeMsg::SubmitTransaction(transaction_request(
            epoch,
            frame == 0,
        )));
        match compositor_rx.recv_timeout(Duration::from_secs(1)) {
            Ok(CompositorMsg::FrameRendered { epochs, end, .. }) => {
                bridge.notify_frame_rendered(&epochs, end, &listener);
            },
            Ok(other) => warn!("Unexpected compositor message: {other:?}"),
            Err(RecvTimeoutError::Timeout) => {
                warn!("Timed out waiting for frame {frame}.");
                break;
            },
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    bridge.destroy();
    let report = process.shutdown();
    info!("Shut down {} subsystems.", report.torn_down.len());
    Ok(())
}

fn main() {
    env_logger::init();

    let mut frame_count = 10;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--frames" => {
                frame_count = args
                    .next()
                    .and_then(|value| value.parse().ok())
                    .unwrap_or(frame_count);
            },
            "--help" | "-h" => {
                println!("Usage: gpushell [--frames N]");
                return;
            },
            other => {
                eprintln!("Unknown argument: {other}");
                std::process::exit(2);
            },
        }
    }

    if let Err(fatal) = run(frame_count) {
        // Fatal process errors bypass graceful teardown on purpose.
        error!("GPU process failed: {fatal:?}");
        std::process::exit(1);
    }
}
