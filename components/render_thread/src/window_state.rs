/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! Per-window frame bookkeeping.
//!
//! The map in this module is the one piece of window state that foreign
//! threads are allowed to read (for backpressure and destroyed checks), so it
//! lives behind a short-held mutex separate from everything the render thread
//! owns exclusively.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use base::WindowId;
use log::warn;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

/// Frame counters and latency bookkeeping for one window.
pub struct WindowFrameState {
    /// Frames submitted but not yet fully presented.
    pub pending_frames: u8,
    /// Frames actively being rendered, as opposed to merely queued.
    pub rendering_frames: u8,
    /// One entry pushed per frame submission, one popped per completion.
    /// Always `len() == pending_frames` outside of a counter transition.
    pub frame_start_times: VecDeque<Instant>,
    /// Monotonic. Once set, all further scheduling calls for this window
    /// are no-ops.
    pub is_destroyed: bool,
    /// Sticky; consumed and cleared by the next frame dispatch.
    pub had_slow_frame: bool,
}

impl WindowFrameState {
    fn new() -> WindowFrameState {
        WindowFrameState {
            pending_frames: 0,
            rendering_frames: 0,
            frame_start_times: VecDeque::new(),
            is_destroyed: false,
            had_slow_frame: false,
        }
    }
}

/// All per-window frame states, plus the latency accumulator fed by frame
/// completions. Guarded by a single mutex held only for the duration of a
/// map operation, never while rendering.
pub struct FrameStateMap {
    inner: Mutex<FrameStateMapInner>,
}

struct FrameStateMapInner {
    windows: FxHashMap<WindowId, WindowFrameState>,
    accumulated_latency: Duration,
    completed_frames: u64,
}

impl FrameStateMap {
    pub fn new() -> FrameStateMap {
        FrameStateMap {
            inner: Mutex::new(FrameStateMapInner {
                windows: FxHashMap::default(),
                accumulated_latency: Duration::ZERO,
                completed_frames: 0,
            }),
        }
    }

    pub fn insert(&self, window_id: WindowId) {
        let mut inner = self.inner.lock();
        if inner
            .windows
            .insert(window_id, WindowFrameState::new())
            .is_some()
        {
            warn!("Inserted a frame state for {window_id:?} twice.");
        }
    }

    /// Marks the window destroyed and forgets its state. Returns true if the
    /// window was the last one alive.
    pub fn remove(&self, window_id: WindowId) -> bool {
        let mut inner = self.inner.lock();
        inner.windows.remove(&window_id);
        inner.windows.is_empty()
    }

    pub fn contains(&self, window_id: WindowId) -> bool {
        self.inner.lock().windows.contains_key(&window_id)
    }

    pub fn is_destroyed(&self, window_id: WindowId) -> bool {
        let inner = self.inner.lock();
        match inner.windows.get(&window_id) {
            Some(state) => state.is_destroyed,
            None => true,
        }
    }

    pub fn set_destroyed(&self, window_id: WindowId) {
        let mut inner = self.inner.lock();
        if let Some(state) = inner.windows.get_mut(&window_id) {
            state.is_destroyed = true;
        }
    }

    /// The backpressure predicate. True when more frames are queued than the
    /// configured cap allows, or when a frame is queued that the backend has
    /// not started rendering yet.
    pub fn too_many_pending_frames(&self, window_id: WindowId, max_pending: u8) -> bool {
        let inner = self.inner.lock();
        let Some(state) = inner.windows.get(&window_id) else {
            return true;
        };
        state.pending_frames > max_pending || state.pending_frames > state.rendering_frames
    }

    pub fn inc_pending(&self, window_id: WindowId, start_time: Instant) {
        let mut inner = self.inner.lock();
        let Some(state) = inner.windows.get_mut(&window_id) else {
            return;
        };
        state.pending_frames += 1;
        state.frame_start_times.push_back(start_time);
    }

    /// Discard path: a submitted frame will never be rendered. Pops its start
    /// time and counts the elapsed time against the latency metric.
    pub fn dec_pending(&self, window_id: WindowId, now: Instant) {
        let mut inner = self.inner.lock();
        let Some(state) = inner.windows.get_mut(&window_id) else {
            return;
        };
        if state.pending_frames == 0 {
            warn!("Unbalanced dec_pending for {window_id:?}.");
            return;
        }
        state.pending_frames -= 1;
        let latency = match state.frame_start_times.pop_front() {
            Some(start) => now.saturating_duration_since(start),
            None => {
                warn!("Frame start time queue empty for {window_id:?}.");
                Duration::ZERO
            },
        };
        inner.accumulated_latency += latency;
        inner.completed_frames += 1;
    }

    pub fn inc_rendering(&self, window_id: WindowId) {
        let mut inner = self.inner.lock();
        if let Some(state) = inner.windows.get_mut(&window_id) {
            state.rendering_frames += 1;
        }
    }

    /// Completion path: one frame is fully presented. Decrements both
    /// counters and pops the matching start time into the latency metric.
    pub fn frame_rendering_complete(&self, window_id: WindowId, now: Instant) {
        let mut inner = self.inner.lock();
        let Some(state) = inner.windows.get_mut(&window_id) else {
            return;
        };
        if state.pending_frames == 0 || state.rendering_frames == 0 {
            warn!("Unbalanced frame_rendering_complete for {window_id:?}.");
            return;
        }
        state.pending_frames -= 1;
        state.rendering_frames -= 1;
        let latency = match state.frame_start_times.pop_front() {
            Some(start) => now.saturating_duration_since(start),
            None => {
                warn!("Frame start time queue empty for {window_id:?}.");
                Duration::ZERO
            },
        };
        inner.accumulated_latency += latency;
        inner.completed_frames += 1;
    }

    /// The start time of the oldest still-pending frame, plus the sticky
    /// slow-frame flag (cleared by this read).
    pub fn begin_frame_dispatch(&self, window_id: WindowId) -> (Option<Instant>, bool) {
        let mut inner = self.inner.lock();
        let Some(state) = inner.windows.get_mut(&window_id) else {
            return (None, false);
        };
        let had_slow_frame = state.had_slow_frame;
        state.had_slow_frame = false;
        (state.frame_start_times.front().copied(), had_slow_frame)
    }

    pub fn set_had_slow_frame(&self, window_id: WindowId) {
        let mut inner = self.inner.lock();
        if let Some(state) = inner.windows.get_mut(&window_id) {
            state.had_slow_frame = true;
        }
    }

    pub fn pending_frames(&self, window_id: WindowId) -> u8 {
        let inner = self.inner.lock();
        inner
            .windows
            .get(&window_id)
            .map_or(0, |state| state.pending_frames)
    }

    pub fn window_count(&self) -> usize {
        self.inner.lock().windows.len()
    }

    /// Teardown: forget every window at once.
    pub fn clear(&self) {
        self.inner.lock().windows.clear();
    }

    pub fn accumulated_latency(&self) -> (Duration, u64) {
        let inner = self.inner.lock();
        (inner.accumulated_latency, inner.completed_frames)
    }

    /// Invariant check used by debug assertions and tests:
    /// `pending >= rendering` and the start-time queue length matches the
    /// pending count.
    pub fn counters_consistent(&self, window_id: WindowId) -> bool {
        let inner = self.inner.lock();
        match inner.windows.get(&window_id) {
            Some(state) => {
                state.pending_frames >= state.rendering_frames &&
                    state.frame_start_times.len() == state.pending_frames as usize
            },
            None => true,
        }
    }
}

impl Default for FrameStateMap {
    fn default() -> Self {
        FrameStateMap::new()
    }
}
