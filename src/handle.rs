//! Opaque model handles, their allocator, and the per-engine handle table.

use crate::error::{LyraError, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Opaque, process-local identifier for a loaded model.
///
/// Handles are non-zero, allocated monotonically, and never reused within a
/// process lifetime. Cloning the integer does not extend the model's life;
/// the owning engine frees the underlying resources on unload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelHandle(u64);

impl ModelHandle {
    /// Wrap a raw value. Zero is never a valid handle.
    pub fn from_raw(raw: u64) -> Option<Self> {
        (raw != 0).then_some(Self(raw))
    }

    pub fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Monotonic handle allocator shared by all engines of one runtime, so a
/// handle value identifies at most one model across the whole SDK.
#[derive(Debug)]
pub struct HandleAllocator {
    next: AtomicU64,
}

impl HandleAllocator {
    pub fn new() -> Self {
        Self { next: AtomicU64::new(1) }
    }

    pub fn allocate(&self) -> ModelHandle {
        ModelHandle(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for HandleAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps live handles to their backend state for one engine.
///
/// The outer mutex only guards the map; each backend sits behind its own
/// mutex, so operations on different handles run in parallel while one
/// handle's operations stay serialized.
pub(crate) struct HandleTable<B: ?Sized + Send> {
    map: Mutex<HashMap<ModelHandle, Arc<Mutex<Box<B>>>>>,
}

impl<B: ?Sized + Send> HandleTable<B> {
    pub fn new() -> Self {
        Self { map: Mutex::new(HashMap::new()) }
    }

    pub fn insert(&self, handle: ModelHandle, backend: Box<B>) {
        self.lock().insert(handle, Arc::new(Mutex::new(backend)));
    }

    /// Resolve a handle to its backend slot without touching the backend.
    ///
    /// # Errors
    ///
    /// [`LyraError::not_loaded`] when the handle is unknown to this engine.
    pub fn get(&self, handle: ModelHandle) -> Result<Arc<Mutex<Box<B>>>> {
        self.lock()
            .get(&handle)
            .cloned()
            .ok_or_else(|| LyraError::not_loaded(handle.as_raw()))
    }

    /// Remove a handle. In-flight operations holding the slot's `Arc`
    /// finish against the detached backend.
    ///
    /// # Errors
    ///
    /// [`LyraError::not_loaded`] when the handle is unknown to this engine.
    pub fn remove(&self, handle: ModelHandle) -> Result<Arc<Mutex<Box<B>>>> {
        self.lock()
            .remove(&handle)
            .ok_or_else(|| LyraError::not_loaded(handle.as_raw()))
    }

    pub fn contains(&self, handle: ModelHandle) -> bool {
        self.lock().contains_key(&handle)
    }

    pub fn handles(&self) -> Vec<ModelHandle> {
        self.lock().keys().copied().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ModelHandle, Arc<Mutex<Box<B>>>>> {
        self.map.lock().unwrap_or_else(|e| e.into_inner())
    }
}
