//! Per-key reentrant locks.
//!
//! Lock objects live in a map of `key -> (lock, refcount)`. Acquiring bumps
//! the refcount before blocking, releasing drops it and removes the entry
//! once nobody holds or waits on the lock, so the map only ever contains
//! keys that are currently in use.

use std::sync::Arc;
use std::thread::{self, ThreadId};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};

/// RAII guard for a key lock. Dropping it releases the lock.
///
/// Guards are bound to the acquiring thread and must not be held across
/// an `.await`.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct KeyLockGuard {
    release: Option<Box<dyn FnOnce()>>,
}

impl KeyLockGuard {
    /// Build a guard that runs `release` when dropped.
    pub fn new(release: impl FnOnce() + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }

    /// Release the lock now.
    pub fn unlock(mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for KeyLockGuard {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for KeyLockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyLockGuard")
            .field("held", &self.release.is_some())
            .finish()
    }
}

#[derive(Default)]
struct OwnerState {
    owner: Option<ThreadId>,
    depth: usize,
}

/// Reentrant mutual exclusion owned by a thread.
#[derive(Default)]
struct ReentrantLock {
    state: Mutex<OwnerState>,
    released: Condvar,
}

impl ReentrantLock {
    fn lock(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        loop {
            match state.owner {
                None => {
                    state.owner = Some(me);
                    state.depth = 1;
                    return;
                }
                Some(owner) if owner == me => {
                    state.depth += 1;
                    return;
                }
                Some(_) => self.released.wait(&mut state),
            }
        }
    }

    fn unlock(&self) {
        let mut state = self.state.lock();
        state.depth = state.depth.saturating_sub(1);
        if state.depth == 0 {
            state.owner = None;
            drop(state);
            self.released.notify_one();
        }
    }
}

struct LockEntry {
    lock: Arc<ReentrantLock>,
    refs: usize,
}

/// In-process lock service used in standalone mode.
#[derive(Default)]
pub struct LocalLockManager {
    locks: DashMap<String, LockEntry>,
}

impl LocalLockManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Block until the lock for `key` is held by the current thread.
    pub fn acquire(self: &Arc<Self>, key: impl Into<String>) -> KeyLockGuard {
        let key = key.into();
        let lock = {
            let mut entry = self.locks.entry(key.clone()).or_insert_with(|| LockEntry {
                lock: Arc::new(ReentrantLock::default()),
                refs: 0,
            });
            entry.refs += 1;
            Arc::clone(&entry.lock)
        };

        lock.lock();

        let manager = Arc::clone(self);
        KeyLockGuard::new(move || {
            lock.unlock();
            manager.release(&key);
        })
    }

    fn release(&self, key: &str) {
        if let Entry::Occupied(mut entry) = self.locks.entry(key.to_string()) {
            let refs = {
                let e = entry.get_mut();
                e.refs = e.refs.saturating_sub(1);
                e.refs
            };
            if refs == 0 {
                entry.remove();
            }
        }
    }

    /// Number of keys with a live lock object.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Lock-map key scoping `key` to one cache.
pub(crate) fn scoped_key(cache: &str, key: &str) -> String {
    format!("{}/{}", cache, key)
}
