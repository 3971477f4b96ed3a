/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use base::{Epoch, PipelineId, TransactionId, WindowId};
use bridge::{BridgeMsg, RenderBridge, TransactionRequest};
use crossbeam_channel::Receiver;
use gpu::{GpuInit, GpuProcess, ShutdownState};
use render_thread::CompositorMsg;
use render_thread::api::SceneOp;
use smallvec::SmallVec;

use crate::common::{CountingListener, CountingRenderer, RendererProbe, compositor_pair};

fn submit_request(epoch: Epoch, first_paint: bool, generate_frame: bool) -> BridgeMsg {
    let now = Instant::now();
    BridgeMsg::SubmitTransaction(Box::new(TransactionRequest {
        epoch,
        scene_ops: vec![SceneOp::UpdateEpoch {
            pipeline_id: PipelineId::ROOT,
            epoch,
        }],
        resource_updates: SmallVec::new(),
        low_priority: false,
        use_scene_builder_thread: false,
        generate_frame,
        refresh_start: now,
        txn_start: now,
        contains_vector_content: false,
        is_first_paint: first_paint,
        use_for_telemetry: true,
    }))
}

fn recv_frame_rendered(
    receiver: &Receiver<CompositorMsg>,
) -> (Vec<(PipelineId, Epoch)>, Instant) {
    loop {
        match receiver
            .recv_timeout(Duration::from_secs(5))
            .expect("expected a frame-rendered notification")
        {
            CompositorMsg::FrameRendered { epochs, end, .. } => return (epochs, end),
            CompositorMsg::DeviceResetDetected(..) => continue,
        }
    }
}

#[test]
fn first_paint_fires_exactly_once_end_to_end() {
    let (proxy, compositor_rx) = compositor_pair();
    let mut process = GpuProcess::new(GpuInit::default(), proxy).expect("init should succeed");
    let render_thread = process.render_thread_handle();

    let probe = Arc::new(RendererProbe::default());
    let window = WindowId::new();
    let api = render_thread
        .create_renderer(window, CountingRenderer::setup(probe.clone()))
        .expect("renderer creation should succeed");
    let mut bridge = RenderBridge::new(PipelineId::ROOT, api, render_thread.clone());
    let listener = CountingListener::default();

    bridge.process_message(submit_request(Epoch(7), true, true));
    assert_eq!(bridge.pending_count(), 1);

    let (epochs, end) = recv_frame_rendered(&compositor_rx);
    let flushed = bridge.notify_frame_rendered(&epochs, end, &listener);

    assert_eq!(flushed, Some(TransactionId(1)));
    assert_eq!(listener.first_paints.load(Ordering::SeqCst), 1);
    assert_eq!(listener.telemetry_records.load(Ordering::SeqCst), 1);
    assert_eq!(bridge.pending_count(), 0);
    assert_eq!(probe.renders(), 1);

    // A later frame for the same window is not a first paint.
    bridge.process_message(submit_request(Epoch(8), false, true));
    let (epochs, end) = recv_frame_rendered(&compositor_rx);
    bridge.notify_frame_rendered(&epochs, end, &listener);
    assert_eq!(listener.first_paints.load(Ordering::SeqCst), 1);
    assert_eq!(listener.telemetry_records.load(Ordering::SeqCst), 2);

    bridge.destroy();
    let report = process.shutdown();
    assert!(report.torn_down.contains(&"render-thread"));
    assert_eq!(process.shutdown_state(), ShutdownState::FinishedShuttingDown);
}

#[test]
fn backpressured_frame_requests_are_deferred_not_dropped() {
    let (proxy, compositor_rx) = compositor_pair();
    let mut process = GpuProcess::new(GpuInit::default(), proxy).expect("init should succeed");
    let render_thread = process.render_thread_handle();

    let probe = Arc::new(RendererProbe::default());
    let window = WindowId::new();
    let api = render_thread
        .create_renderer(window, CountingRenderer::setup(probe.clone()))
        .expect("renderer creation should succeed");
    let mut bridge = RenderBridge::new(PipelineId::ROOT, api, render_thread.clone());
    let listener = CountingListener::default();

    // Force the window into a backpressured state: a pending frame the
    // backend has not started.
    render_thread.inc_pending_frame_count(window);
    assert!(render_thread.too_many_pending_frames(window));

    bridge.process_message(submit_request(Epoch(1), false, true));
    // The scene update went through but no frame was generated for it.
    bridge.wait_flushed();
    assert_eq!(probe.renders(), 0);
    assert_eq!(bridge.pending_count(), 1);

    // Resolve the artificial backlog; the deferred frame is paid off by the
    // next completion signal.
    render_thread.dec_pending_frame_count(window);
    render_thread.handle_frame(window, true);
    let (_epochs, _end) = recv_frame_rendered(&compositor_rx);
    let flushed = bridge.notify_frame_rendered(&[(PipelineId::ROOT, Epoch(1))], Instant::now(), &listener);
    assert_eq!(flushed, Some(TransactionId(1)));

    let (epochs, end) = recv_frame_rendered(&compositor_rx);
    assert_eq!(epochs, vec![(PipelineId::ROOT, Epoch(1))]);
    let _ = bridge.notify_frame_rendered(&epochs, end, &listener);
    assert_eq!(probe.renders(), 2);

    bridge.destroy();
    process.shutdown();
}

#[test]
fn screenshot_and_device_status_surface_work_through_the_bridge() {
    let (proxy, _compositor_rx) = compositor_pair();
    let mut process = GpuProcess::new(GpuInit::default(), proxy).expect("init should succeed");
    let render_thread = process.render_thread_handle();

    let probe = Arc::new(RendererProbe::default());
    let window = WindowId::new();
    let api = render_thread
        .create_renderer(window, CountingRenderer::setup(probe))
        .expect("renderer creation should succeed");
    let mut bridge = RenderBridge::new(PipelineId::ROOT, api, render_thread.clone());

    let (result_tx, result_rx) = crossbeam_channel::bounded(1);
    bridge.process_message(BridgeMsg::RequestScreenshot {
        size: base::units::DeviceIntSize::new(2, 2),
        result_tx,
    });
    let pixels = result_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("screenshot reply")
        .expect("screenshot data");
    assert_eq!(pixels.len(), 16);

    assert_eq!(process.device_status().features.len(), 5);

    bridge.process_message(BridgeMsg::SimulateDeviceReset);
    bridge.wait_flushed();
    assert!(render_thread.is_handling_device_reset());

    bridge.destroy();
    assert!(!render_thread.is_handling_device_reset());
    process.shutdown();
}
