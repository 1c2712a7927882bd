#![forbid(unsafe_code)]

//! Per-entity exclusive locks with bounded acquisition.
//!
//! The id map is only held long enough to clone an entity handle. Mutations run
//! on a copy of the entity and are committed only when the closure succeeds, so
//! a failed operation never leaves a half-written entity behind.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::error::{DispatchError, EntityKind};

#[derive(Debug)]
pub struct EntityTable<T> {
    kind: EntityKind,
    entries: RwLock<BTreeMap<String, Arc<Mutex<T>>>>,
    lock_timeout: Duration,
}

impl<T: Clone> EntityTable<T> {
    #[must_use]
    pub fn new(kind: EntityKind, lock_timeout: Duration) -> Self {
        Self {
            kind,
            entries: RwLock::new(BTreeMap::new()),
            lock_timeout,
        }
    }

    /// Returns false if the id is already taken.
    pub fn insert(&self, id: &str, value: T) -> Result<bool, DispatchError> {
        let mut entries = self
            .entries
            .try_write_for(self.lock_timeout)
            .ok_or_else(|| self.busy(id))?;
        if entries.contains_key(id) {
            return Ok(false);
        }
        entries.insert(id.to_owned(), Arc::new(Mutex::new(value)));
        Ok(true)
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.entries.read().contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Result<T, DispatchError> {
        let handle = self.handle(id)?;
        let guard = handle
            .try_lock_for(self.lock_timeout)
            .ok_or_else(|| self.busy(id))?;
        Ok(guard.clone())
    }

    /// Runs `f` on a copy of the entity while holding its lock and commits the
    /// copy only if `f` returns `Ok`.
    pub fn update<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut T) -> Result<R, DispatchError>,
    ) -> Result<R, DispatchError> {
        let handle = self.handle(id)?;
        let mut guard = handle
            .try_lock_for(self.lock_timeout)
            .ok_or_else(|| self.busy(id))?;
        let mut next = guard.clone();
        let out = f(&mut next)?;
        *guard = next;
        Ok(out)
    }

    /// Copies every entity, each under its own lock. Fails with `RetryLater` if
    /// any entity stays locked past the timeout.
    pub fn snapshot(&self) -> Result<Vec<T>, DispatchError> {
        let handles: Vec<(String, Arc<Mutex<T>>)> = self
            .entries
            .read()
            .iter()
            .map(|(id, h)| (id.clone(), Arc::clone(h)))
            .collect();
        let mut out = Vec::with_capacity(handles.len());
        for (id, handle) in handles {
            let guard = handle
                .try_lock_for(self.lock_timeout)
                .ok_or_else(|| self.busy(&id))?;
            out.push(guard.clone());
        }
        Ok(out)
    }

    fn handle(&self, id: &str) -> Result<Arc<Mutex<T>>, DispatchError> {
        self.entries
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| DispatchError::NotFound {
                kind: self.kind,
                id: id.to_owned(),
            })
    }

    fn busy(&self, id: &str) -> DispatchError {
        DispatchError::RetryLater {
            kind: self.kind,
            id: id.to_owned(),
        }
    }
}

/// Bounded exponential backoff for `RetryLater`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Runs `op` until it succeeds, fails with anything other than
    /// `RetryLater`, or the attempts are used up.
    pub fn run<R>(
        &self,
        mut op: impl FnMut() -> Result<R, DispatchError>,
    ) -> Result<R, DispatchError> {
        let mut delay = self.backoff;
        let mut attempt = 1;
        loop {
            match op() {
                Err(e) if e.is_retryable() && attempt < self.attempts.max(1) => {
                    tracing::debug!(attempt, error = %e, "lock contention, backing off");
                    std::thread::sleep(delay);
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}
