/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/. */

//! The external-image registry.
//!
//! Registration and unregistration race with rendering, and the callers live
//! on arbitrary threads, so this map has its own lock, independent of the
//! frame-state lock. Actual texture destruction must happen on the render
//! thread: unregistration from a foreign thread moves the handle onto a
//! deferred list that a posted event flushes.

use std::sync::Arc;
use std::thread::ThreadId;

use base::ExternalImageId;
use log::warn;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

/// A GPU-resident image shared across thread boundaries by handle. The
/// renderer locks it for the duration of a frame; the registry only ever
/// asks it to drop cached device memory.
pub trait RenderTextureHost: Send + Sync {
    /// Drop any cached GPU resources. Called when the device is lost or
    /// when the process is asked to flush memory.
    fn clear_cached_resources(&self);
}

pub struct ExternalImageRegistry {
    inner: Mutex<RegistryInner>,
}

struct RegistryInner {
    textures: FxHashMap<ExternalImageId, Arc<dyn RenderTextureHost>>,
    /// Handles unregistered off-thread, waiting for the render thread to
    /// drop them.
    deferred_destroys: Vec<Arc<dyn RenderTextureHost>>,
    render_thread_id: Option<ThreadId>,
}

impl ExternalImageRegistry {
    pub fn new() -> ExternalImageRegistry {
        ExternalImageRegistry {
            inner: Mutex::new(RegistryInner {
                textures: FxHashMap::default(),
                deferred_destroys: Vec::new(),
                render_thread_id: None,
            }),
        }
    }

    /// Records which thread owns GPU destruction. Called once, by the render
    /// thread itself, before any texture can be unregistered.
    pub fn set_render_thread_id(&self, id: ThreadId) {
        self.inner.lock().render_thread_id = Some(id);
    }

    pub fn register(&self, id: ExternalImageId, texture: Arc<dyn RenderTextureHost>) {
        let mut inner = self.inner.lock();
        if inner.textures.insert(id, texture).is_some() {
            warn!("External image {id:?} registered twice.");
        }
    }

    /// Removes the texture from the map. If called on the render thread the
    /// handle is dropped immediately; otherwise it is parked on the deferred
    /// list and the caller must post a flush event. Returns true when a
    /// flush is needed.
    pub fn unregister(&self, id: ExternalImageId) -> bool {
        let mut inner = self.inner.lock();
        let Some(texture) = inner.textures.remove(&id) else {
            return false;
        };
        let on_render_thread = inner.render_thread_id == Some(std::thread::current().id());
        if on_render_thread {
            drop(inner);
            drop(texture);
            false
        } else {
            inner.deferred_destroys.push(texture);
            true
        }
    }

    pub fn get(&self, id: ExternalImageId) -> Option<Arc<dyn RenderTextureHost>> {
        self.inner.lock().textures.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().textures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().textures.is_empty()
    }

    /// Runs the deferred destruction list. Render thread only.
    pub fn flush_deferred(&self) {
        let deferred = {
            let mut inner = self.inner.lock();
            std::mem::take(&mut inner.deferred_destroys)
        };
        // Dropped outside the lock; destruction may call into the driver.
        drop(deferred);
    }

    /// Device-reset path: the device the deferred textures belong to no
    /// longer exists, so the list is discarded without GPU work, and every
    /// still-registered texture is asked to drop its cached resources.
    pub fn on_device_reset(&self) {
        let (deferred, textures) = {
            let mut inner = self.inner.lock();
            let deferred = std::mem::take(&mut inner.deferred_destroys);
            let textures: Vec<_> = inner.textures.values().cloned().collect();
            (deferred, textures)
        };
        drop(deferred);
        for texture in textures {
            texture.clear_cached_resources();
        }
    }

    /// Flush-memory path: keep registrations, drop caches.
    pub fn clear_cached_resources(&self) {
        let textures: Vec<_> = {
            let inner = self.inner.lock();
            inner.textures.values().cloned().collect()
        };
        for texture in textures {
            texture.clear_cached_resources();
        }
    }

    pub fn deferred_len(&self) -> usize {
        self.inner.lock().deferred_destroys.len()
    }

    /// Teardown: drop every registration and the deferred list. Render
    /// thread only.
    pub fn clear(&self) {
        let (textures, deferred) = {
            let mut inner = self.inner.lock();
            let textures = std::mem::take(&mut inner.textures);
            let deferred = std::mem::take(&mut inner.deferred_destroys);
            (textures, deferred)
        };
        drop(textures);
        drop(deferred);
    }
}

impl Default for ExternalImageRegistry {
    fn default() -> Self {
        ExternalImageRegistry::new()
    }
}
