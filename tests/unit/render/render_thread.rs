/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;

use base::{ExternalImageId, WindowId};
use render_thread::{RenderTextureHost, RenderThread, RenderThreadConfig, RendererSetup};

use crate::common::{CountingRenderer, RendererProbe, compositor_pair};

struct InertTexture;

impl RenderTextureHost for InertTexture {
    fn clear_cached_resources(&self) {}
}

fn started_thread() -> (RenderThread, crossbeam_channel::Receiver<render_thread::CompositorMsg>) {
    let (proxy, compositor_rx) = compositor_pair();
    (
        RenderThread::start(RenderThreadConfig::default(), proxy),
        compositor_rx,
    )
}

#[test]
fn shutdown_makes_every_scheduling_call_a_no_op() {
    let (thread, _compositor_rx) = started_thread();
    let handle = thread.handle();
    let probe = Arc::new(RendererProbe::default());
    let window = WindowId::new();
    let api = handle
        .create_renderer(window, CountingRenderer::setup(probe.clone()))
        .expect("renderer creation should succeed");
    assert_eq!(handle.window_count(), 1);

    thread.shut_down();
    assert_eq!(handle.window_count(), 0);
    assert_eq!(probe.dropped.load(Ordering::SeqCst), 1);

    // Every subsequent call must be a no-op: no crash, no state mutation.
    assert!(
        handle
            .create_renderer(WindowId::new(), CountingRenderer::setup(probe.clone()))
            .is_none()
    );
    handle.handle_frame(window, true);
    handle.wake_up(window);
    handle.inc_pending_frame_count(window);
    handle.register_external_image(ExternalImageId(1), Arc::new(InertTexture));
    assert_eq!(handle.window_count(), 0);
    assert_eq!(handle.external_image_count(), 0);
    assert_eq!(handle.pending_frames(window), 0);
    assert!(handle.is_destroyed(window));
    assert_eq!(probe.renders(), 0);

    // The API handle outliving shutdown must not hang on teardown.
    drop(api);
}

#[test]
fn renderer_construction_failure_yields_no_handle() {
    let (thread, _compositor_rx) = started_thread();
    let handle = thread.handle();
    let setup: RendererSetup = Box::new(|| {
        Err(render_thread::RenderError::Backend(String::from(
            "no adapter",
        )))
    });

    assert!(handle.create_renderer(WindowId::new(), setup).is_none());
    assert_eq!(handle.window_count(), 0);
    thread.shut_down();
}

#[test]
fn waiter_wakes_when_the_render_thread_dies_mid_create() {
    let (thread, _compositor_rx) = started_thread();
    let handle = thread.handle();
    // A factory that panics kills the render thread; the dropped reply
    // sender must wake the blocked caller instead of hanging it.
    let setup: RendererSetup = Box::new(|| panic!("construction exploded"));
    assert!(handle.create_renderer(WindowId::new(), setup).is_none());
    drop(thread);
}

#[test]
fn concurrent_submitters_and_a_remover_never_corrupt_window_state() {
    let (thread, compositor_rx) = started_thread();
    let handle = thread.handle();
    let probe = Arc::new(RendererProbe::default());
    let window = WindowId::new();
    let api = handle
        .create_renderer(window, CountingRenderer::setup(probe.clone()))
        .expect("renderer creation should succeed");

    // Drain completions so the channel never backs up.
    let drainer = thread::spawn(move || while compositor_rx.recv().is_ok() {});

    let submitters: Vec<_> = (0..4)
        .map(|_| {
            let handle = handle.clone();
            thread::spawn(move || {
                for round in 0..200 {
                    if !handle.too_many_pending_frames(window) {
                        handle.inc_pending_frame_count(window);
                        handle.handle_frame(window, round % 3 != 0);
                    }
                    handle.wake_up(window);
                }
            })
        })
        .collect();

    // One thread tears the renderer down in the middle of the storm.
    let remover = thread::spawn(move || {
        thread::sleep(std::time::Duration::from_millis(5));
        drop(api);
    });

    for submitter in submitters {
        submitter.join().expect("submitter should not panic");
    }
    remover.join().expect("remover should not panic");

    // The window is gone and every counter observation stayed consistent.
    assert!(handle.is_destroyed(window));
    assert_eq!(handle.window_count(), 0);
    assert_eq!(probe.dropped.load(Ordering::SeqCst), 1);

    thread.shut_down();
    drainer.join().expect("drainer should not panic");
}

#[test]
fn device_reset_suppresses_all_windows_until_renderers_are_recreated() {
    let (thread, _compositor_rx) = started_thread();
    let handle = thread.handle();
    let first_probe = Arc::new(RendererProbe::default());
    let second_probe = Arc::new(RendererProbe::default());
    let first = WindowId::new();
    let second = WindowId::new();
    let first_api = handle
        .create_renderer(first, CountingRenderer::setup(first_probe.clone()))
        .unwrap();
    let second_api = handle
        .create_renderer(second, CountingRenderer::setup(second_probe.clone()))
        .unwrap();

    handle.simulate_device_reset();
    // The barrier guarantees the reset event has been processed.
    first_api.wait_flushed();
    assert!(handle.is_handling_device_reset());

    handle.inc_pending_frame_count(first);
    handle.handle_frame(first, true);
    handle.handle_frame(second, true);
    handle.wake_up(second);
    second_api.wait_flushed();
    assert_eq!(first_probe.renders(), 0);
    assert_eq!(second_probe.renders(), 0);
    assert_eq!(second_probe.updates(), 0);

    // Recovery is driven externally by removing every renderer.
    drop(first_api);
    assert!(handle.is_handling_device_reset());
    drop(second_api);
    assert!(!handle.is_handling_device_reset());

    // A recreated renderer schedules frames again.
    let recreated_probe = Arc::new(RendererProbe::default());
    let third = WindowId::new();
    let api = handle
        .create_renderer(third, CountingRenderer::setup(recreated_probe.clone()))
        .unwrap();
    handle.inc_pending_frame_count(third);
    handle.handle_frame(third, true);
    api.wait_flushed();
    assert_eq!(recreated_probe.renders(), 1);

    drop(api);
    thread.shut_down();
}

#[test]
fn readback_round_trip_fills_a_buffer() {
    let (thread, _compositor_rx) = started_thread();
    let handle = thread.handle();
    let probe = Arc::new(RendererProbe::default());
    let window = WindowId::new();
    let api = handle
        .create_renderer(window, CountingRenderer::setup(probe))
        .unwrap();

    let size = base::units::DeviceIntSize::new(4, 2);
    let pixels = api.readback(size).expect("readback should succeed");
    assert_eq!(pixels.len(), 4 * 2 * 4);
    assert!(pixels.iter().all(|&byte| byte == 0xab));

    assert!(api.resume());
    api.pause();

    drop(api);
    thread.shut_down();
}

#[test]
fn unregistering_textures_from_a_foreign_thread_defers_destruction() {
    let (thread, _compositor_rx) = started_thread();
    let handle = thread.handle();
    handle.register_external_image(ExternalImageId(11), Arc::new(InertTexture));
    assert_eq!(handle.external_image_count(), 1);
    assert!(handle.get_render_texture(ExternalImageId(11)).is_some());

    // This test runs on a foreign thread by definition.
    handle.unregister_external_image(ExternalImageId(11));
    assert!(handle.get_render_texture(ExternalImageId(11)).is_none());

    thread.shut_down();
}
