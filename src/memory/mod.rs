//! Per-model memory accounting with pinning and LRU eviction order.
//!
//! One mutex guards the whole account table plus the monotonic access tick,
//! so every LRU query observes a consistent snapshot. A model with a
//! non-zero refcount is pinned and never offered for eviction, regardless
//! of how stale its last access is.

pub mod host;

use crate::error::{ErrorCode, LyraError, Result};
use crate::handle::ModelHandle;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
struct Account {
    size_bytes: u64,
    refcount: u32,
    last_access_tick: u64,
}

#[derive(Debug, Default)]
struct Inner {
    accounts: HashMap<ModelHandle, Account>,
    tick: u64,
}

impl Inner {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }
}

/// Tracks how much memory each loaded model occupies and in what order
/// unpinned models should be evicted.
pub struct MemoryManager {
    inner: Mutex<Inner>,
    /// Soft ceiling on total tracked bytes; 0 disables the check.
    capacity_bytes: u64,
}

impl MemoryManager {
    pub fn new(capacity_bytes: u64) -> Self {
        Self { inner: Mutex::new(Inner::default()), capacity_bytes }
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.capacity_bytes
    }

    /// Register a freshly loaded model. The account starts unpinned with a
    /// fresh access tick.
    ///
    /// # Errors
    ///
    /// - [`ErrorCode::InvalidInputModelHandle`] when the handle is already tracked
    /// - [`ErrorCode::ModelInsufficientMemory`] when the allocation would
    ///   push total usage over the configured limit
    pub fn track_allocation(&self, handle: ModelHandle, size_bytes: u64) -> Result<()> {
        let mut inner = self.lock();
        if inner.accounts.contains_key(&handle) {
            return Err(LyraError::new(
                ErrorCode::InvalidInputModelHandle,
                format!("handle {handle} is already tracked"),
                format!("track_allocation called twice for handle {handle}"),
            ));
        }
        let total: u64 = inner.accounts.values().map(|a| a.size_bytes).sum();
        if self.capacity_bytes > 0 && total.saturating_add(size_bytes) > self.capacity_bytes {
            return Err(LyraError::new(
                ErrorCode::ModelInsufficientMemory,
                "not enough memory budget to load this model",
                format!(
                    "loading {size_bytes} bytes would raise usage to {} of {} allowed",
                    total.saturating_add(size_bytes),
                    self.capacity_bytes
                ),
            )
            .with_recovery("unload unused models or raise memory_limit_bytes"));
        }
        let tick = inner.next_tick();
        inner.accounts.insert(
            handle,
            Account { size_bytes, refcount: 0, last_access_tick: tick },
        );
        debug!(%handle, size_bytes, "allocation tracked");
        Ok(())
    }

    /// Drop a model's account entirely.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::InvalidInputModelHandle`] for untracked handles.
    pub fn track_deallocation(&self, handle: ModelHandle) -> Result<()> {
        let mut inner = self.lock();
        if inner.accounts.remove(&handle).is_none() {
            return Err(LyraError::invalid_handle(handle.as_raw()));
        }
        debug!(%handle, "allocation released");
        Ok(())
    }

    /// Mark a model as just-used; it becomes the most recently used entry.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::InvalidInputModelHandle`] for untracked handles.
    pub fn record_access(&self, handle: ModelHandle) -> Result<()> {
        let mut inner = self.lock();
        let tick = inner.next_tick();
        match inner.accounts.get_mut(&handle) {
            Some(account) => {
                account.last_access_tick = tick;
                Ok(())
            }
            None => Err(LyraError::invalid_handle(handle.as_raw())),
        }
    }

    /// Pin a model (refcount + 1). Pinned models are never evicted.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::InvalidInputModelHandle`] for untracked handles.
    pub fn increment_ref(&self, handle: ModelHandle) -> Result<()> {
        let mut inner = self.lock();
        match inner.accounts.get_mut(&handle) {
            Some(account) => {
                account.refcount += 1;
                Ok(())
            }
            None => Err(LyraError::invalid_handle(handle.as_raw())),
        }
    }

    /// Unpin a model (refcount - 1).
    ///
    /// # Errors
    ///
    /// [`ErrorCode::InvalidInputParameterValue`] when the refcount is
    /// already zero (a caller bug, surfaced rather than wrapped around);
    /// [`ErrorCode::InvalidInputModelHandle`] for untracked handles.
    pub fn decrement_ref(&self, handle: ModelHandle) -> Result<()> {
        let mut inner = self.lock();
        match inner.accounts.get_mut(&handle) {
            Some(account) => {
                if account.refcount == 0 {
                    return Err(LyraError::new(
                        ErrorCode::InvalidInputParameterValue,
                        format!("handle {handle} is not pinned"),
                        format!("decrement_ref on handle {handle} whose refcount is already zero"),
                    ));
                }
                account.refcount -= 1;
                Ok(())
            }
            None => Err(LyraError::invalid_handle(handle.as_raw())),
        }
    }

    /// The unpinned model with the oldest access tick, if any.
    ///
    /// Stable under repeated calls with no intervening accesses.
    pub fn lru_model(&self) -> Option<ModelHandle> {
        let inner = self.lock();
        inner
            .accounts
            .iter()
            .filter(|(_, a)| a.refcount == 0)
            .min_by_key(|(_, a)| a.last_access_tick)
            .map(|(h, _)| *h)
    }

    /// Unpinned handles in LRU order whose cumulative size covers
    /// `required_bytes` (or all of them, when it cannot be covered).
    pub fn eviction_candidates(&self, required_bytes: u64) -> Vec<ModelHandle> {
        let inner = self.lock();
        let mut unpinned: Vec<(ModelHandle, Account)> = inner
            .accounts
            .iter()
            .filter(|(_, a)| a.refcount == 0)
            .map(|(h, a)| (*h, *a))
            .collect();
        unpinned.sort_by_key(|(_, a)| a.last_access_tick);

        let mut selected = Vec::new();
        let mut freed = 0u64;
        for (handle, account) in unpinned {
            if freed >= required_bytes {
                break;
            }
            freed = freed.saturating_add(account.size_bytes);
            selected.push(handle);
        }
        selected
    }

    /// Sum of all tracked allocations.
    pub fn total_usage(&self) -> u64 {
        self.lock().accounts.values().map(|a| a.size_bytes).sum()
    }

    /// Tracked size of one model, if it is tracked.
    pub fn usage_of(&self, handle: ModelHandle) -> Option<u64> {
        self.lock().accounts.get(&handle).map(|a| a.size_bytes)
    }

    /// Number of tracked models.
    pub fn tracked_count(&self) -> usize {
        self.lock().accounts.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// RAII pin: increments on creation, decrements on drop. Engines hold one
/// for the duration of an inference call so the model cannot be evicted
/// out from under it.
pub struct PinGuard<'a> {
    memory: &'a MemoryManager,
    handle: ModelHandle,
}

impl<'a> PinGuard<'a> {
    /// # Errors
    ///
    /// [`ErrorCode::InvalidInputModelHandle`] for untracked handles.
    pub fn new(memory: &'a MemoryManager, handle: ModelHandle) -> Result<Self> {
        memory.increment_ref(handle)?;
        Ok(Self { memory, handle })
    }
}

impl Drop for PinGuard<'_> {
    fn drop(&mut self) {
        // The account can only be gone if the model was unloaded while
        // pinned, which unload prevents; ignore the error regardless.
        let _ = self.memory.decrement_ref(self.handle);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::handle::HandleAllocator;

    fn handles(n: usize) -> Vec<ModelHandle> {
        let alloc = HandleAllocator::new();
        (0..n).map(|_| alloc.allocate()).collect()
    }

    #[test]
    fn lru_follows_access_order() {
        let mem = MemoryManager::new(0);
        let hs = handles(3);
        for h in &hs {
            mem.track_allocation(*h, 1024).unwrap();
        }
        for h in &hs {
            mem.record_access(*h).unwrap();
        }
        assert_eq!(mem.lru_model(), Some(hs[0]));
        // Stable with no intervening accesses.
        assert_eq!(mem.lru_model(), Some(hs[0]));

        mem.record_access(hs[0]).unwrap();
        assert_eq!(mem.lru_model(), Some(hs[1]));
    }

    #[test]
    fn lru_rotation_scenario_with_pinning() {
        // Three 1 KiB models, accessed 1,2,3. LRU is 1; touching 1 moves the
        // LRU to 2; pinning 2 leaves only 3 as a candidate for 1 KiB.
        let mem = MemoryManager::new(4096);
        let hs = handles(3);
        for h in &hs {
            mem.track_allocation(*h, 1024).unwrap();
        }
        for h in &hs {
            mem.record_access(*h).unwrap();
        }
        assert_eq!(mem.lru_model(), Some(hs[0]));

        mem.record_access(hs[0]).unwrap();
        assert_eq!(mem.lru_model(), Some(hs[1]));

        mem.increment_ref(hs[1]).unwrap();
        assert_eq!(mem.eviction_candidates(1024), vec![hs[2]]);
    }

    #[test]
    fn pinned_models_never_appear_as_candidates() {
        let mem = MemoryManager::new(0);
        let hs = handles(2);
        mem.track_allocation(hs[0], 100).unwrap();
        mem.track_allocation(hs[1], 100).unwrap();
        mem.increment_ref(hs[0]).unwrap();

        assert_eq!(mem.lru_model(), Some(hs[1]));
        let candidates = mem.eviction_candidates(u64::MAX);
        assert_eq!(candidates, vec![hs[1]]);

        mem.decrement_ref(hs[0]).unwrap();
        assert_eq!(mem.eviction_candidates(u64::MAX).len(), 2);
    }

    #[test]
    fn eviction_candidates_cover_the_requested_bytes_in_lru_order() {
        let mem = MemoryManager::new(0);
        let hs = handles(4);
        for (i, h) in hs.iter().enumerate() {
            mem.track_allocation(*h, 1000 * (i as u64 + 1)).unwrap();
        }
        // Access order = allocation order, so LRU order is hs[0], hs[1], ...
        let candidates = mem.eviction_candidates(2500);
        assert_eq!(candidates, vec![hs[0], hs[1]]); // 1000 + 2000 >= 2500

        // Unsatisfiable requests return the whole unpinned set.
        let all = mem.eviction_candidates(u64::MAX);
        assert_eq!(all.len(), 4);
    }

    #[test]
    fn deallocated_handles_disappear_from_queries() {
        let mem = MemoryManager::new(0);
        let hs = handles(2);
        mem.track_allocation(hs[0], 512).unwrap();
        mem.track_allocation(hs[1], 512).unwrap();
        mem.track_deallocation(hs[0]).unwrap();

        assert_eq!(mem.usage_of(hs[0]), None);
        assert_eq!(mem.total_usage(), 512);
        assert_eq!(mem.lru_model(), Some(hs[1]));
        assert!(!mem.eviction_candidates(u64::MAX).contains(&hs[0]));
    }

    #[test]
    fn capacity_limit_rejects_oversized_allocations() {
        let mem = MemoryManager::new(1000);
        let hs = handles(2);
        mem.track_allocation(hs[0], 800).unwrap();
        let err = mem.track_allocation(hs[1], 300).unwrap_err();
        assert_eq!(err.code(), ErrorCode::ModelInsufficientMemory);
        // The failed allocation left no trace.
        assert_eq!(mem.total_usage(), 800);
        assert_eq!(mem.tracked_count(), 1);
    }

    #[test]
    fn refcount_never_goes_below_zero() {
        let mem = MemoryManager::new(0);
        let hs = handles(1);
        mem.track_allocation(hs[0], 64).unwrap();
        let err = mem.decrement_ref(hs[0]).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidInputParameterValue);

        mem.increment_ref(hs[0]).unwrap();
        mem.decrement_ref(hs[0]).unwrap();
        assert!(mem.decrement_ref(hs[0]).is_err());
    }

    #[test]
    fn untracked_handles_are_invalid_everywhere() {
        let mem = MemoryManager::new(0);
        let ghost = ModelHandle::from_raw(999).unwrap();
        assert!(mem.record_access(ghost).is_err());
        assert!(mem.increment_ref(ghost).is_err());
        assert!(mem.track_deallocation(ghost).is_err());
        assert_eq!(mem.usage_of(ghost), None);
    }

    #[test]
    fn pin_guard_unpins_on_drop() {
        let mem = MemoryManager::new(0);
        let hs = handles(1);
        mem.track_allocation(hs[0], 64).unwrap();
        {
            let _pin = PinGuard::new(&mem, hs[0]).unwrap();
            assert!(mem.eviction_candidates(u64::MAX).is_empty());
        }
        assert_eq!(mem.eviction_candidates(u64::MAX), vec![hs[0]]);
    }

    #[test]
    fn empty_manager_has_no_lru() {
        let mem = MemoryManager::new(0);
        assert_eq!(mem.lru_model(), None);
        assert!(mem.eviction_candidates(1).is_empty());
        assert_eq!(mem.total_usage(), 0);
    }
}
