/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

#![deny(unsafe_code)]

//! A crate to hold very common types of the GPU process.
//!
//! You should almost never need to add a data type to this crate. Instead look
//! for a more specific shared crate that has fewer dependents.

pub mod units;

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// A struct for denoting the age of scene builds; prevents race conditions
/// between display lists and the frames rendered from them.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct Epoch(pub u32);

impl Epoch {
    pub fn next(&mut self) {
        self.0 += 1;
    }
}

/// Identifies one on-screen surface's render pipeline. Allocated when a
/// renderer is installed and never reused after the renderer is removed.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct WindowId(pub u64);

static NEXT_WINDOW_ID: AtomicU64 = AtomicU64::new(1);

impl WindowId {
    pub fn new() -> WindowId {
        WindowId(NEXT_WINDOW_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for WindowId {
    fn default() -> Self {
        WindowId::new()
    }
}

/// The rendering context for one document inside a window, consuming a
/// stream of epoch-tagged scenes. Namespace plus index, so that ids minted
/// by different content processes never collide.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct PipelineId(pub u32, pub u32);

impl PipelineId {
    pub const ROOT: PipelineId = PipelineId(0, 0);
}

/// A monotonically increasing sequence number for transactions submitted
/// over one bridge.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct TransactionId(pub u64);

impl TransactionId {
    pub const ZERO: TransactionId = TransactionId(0);

    pub fn next(&self) -> TransactionId {
        TransactionId(self.0 + 1)
    }
}

/// Opaque key under which a GPU-resident image resource is shared across
/// thread boundaries by handle rather than by value.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
pub struct ExternalImageId(pub u64);

/// Why the underlying GPU device/context was lost.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum DeviceResetReason {
    Hung,
    Removed,
    Reset,
    Driver,
    InvalidCall,
    OutOfMemory,
    /// Requested from the diagnostic surface rather than observed from the
    /// driver.
    Simulated,
    Unknown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_next_is_monotonic() {
        let mut epoch = Epoch(0);
        epoch.next();
        epoch.next();
        assert_eq!(epoch, Epoch(2));
        assert!(Epoch(1) < Epoch(2));
    }

    #[test]
    fn window_ids_are_unique() {
        let a = WindowId::new();
        let b = WindowId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn transaction_id_next_does_not_mutate() {
        let id = TransactionId::ZERO;
        assert_eq!(id.next(), TransactionId(1));
        assert_eq!(id, TransactionId::ZERO);
    }
}
