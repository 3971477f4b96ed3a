/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Completion notifications flowing back from the render thread to the
//! compositor thread.

use std::time::Instant;

use base::{DeviceResetReason, Epoch, PipelineId, WindowId};
use crossbeam_channel::Sender;
use log::warn;
use strum::IntoStaticStr;

use crate::renderer::FrameStats;

/// A means of waking up the thread servicing the compositor-side event loop
/// after a message has been queued for it. The method used may have to kick
/// OS event loops awake, so it is supplied by the embedder.
pub trait EventLoopWaker: Send {
    fn clone_box(&self) -> Box<dyn EventLoopWaker>;
    fn wake(&self);
}

/// A waker for callers whose receiving loop blocks on the channel itself.
pub struct NoopWaker;

impl EventLoopWaker for NoopWaker {
    fn clone_box(&self) -> Box<dyn EventLoopWaker> {
        Box::new(NoopWaker)
    }

    fn wake(&self) {}
}

/// Messages from the render thread to the compositor thread.
#[derive(IntoStaticStr)]
pub enum CompositorMsg {
    /// A frame finished rendering. Posted before the render thread waits on
    /// the GPU, so that delivery is not delayed by the wait.
    FrameRendered {
        window_id: WindowId,
        /// The epochs made visible, per pipeline.
        epochs: Vec<(PipelineId, Epoch)>,
        composite_start: Instant,
        render_start: Instant,
        end: Instant,
        stats: FrameStats,
    },
    /// The GPU device backing the given windows was lost.
    DeviceResetDetected(DeviceResetReason),
}

impl std::fmt::Debug for CompositorMsg {
    fn fmt(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        let string: &'static str = self.into();
        write!(formatter, "{string}")
    }
}

/// Sends messages to the compositor thread.
pub struct CompositorProxy {
    pub sender: Sender<CompositorMsg>,
    pub event_loop_waker: Box<dyn EventLoopWaker>,
}

impl CompositorProxy {
    pub fn send(&self, msg: CompositorMsg) {
        if let Err(err) = self.sender.send(msg) {
            warn!("Failed to send compositor message ({err:?}).");
        }
        self.event_loop_waker.wake();
    }
}

impl Clone for CompositorProxy {
    fn clone(&self) -> CompositorProxy {
        CompositorProxy {
            sender: self.sender.clone(),
            event_loop_waker: self.event_loop_waker.clone_box(),
        }
    }
}
