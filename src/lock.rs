//! Per-cluster advisory lock.
//!
//! Repair actions on one cluster must never overlap. [`LockTable`] is an
//! in-memory compare-and-set table keyed by cluster: a second caller does
//! not wait, it gets [`OperatorError::Busy`] immediately and its own retry
//! machinery decides when to come back. The lock is released when the
//! returned [`ClusterLockGuard`] is dropped, on success, error or panic.
//!
//! Nothing here is persisted; a restarted process starts with an empty table.

use crate::error::{OperatorError, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Who holds a cluster lock, and since when.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHolder {
    pub owner: String,
    pub acquired_at: DateTime<Utc>,
}

/// Table of held cluster locks.
#[derive(Debug, Default)]
pub struct LockTable {
    held: Mutex<HashMap<String, LockHolder>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the lock for `key` on behalf of `owner`, or fail with `Busy`.
    pub fn try_acquire(self: &Arc<Self>, key: &str, owner: &str) -> Result<ClusterLockGuard> {
        let mut held = self.held.lock();

        if let Some(holder) = held.get(key) {
            tracing::debug!(
                cluster = key,
                owner,
                holder = %holder.owner,
                "Cluster lock busy"
            );
            return Err(OperatorError::Busy {
                key: key.to_string(),
                holder: holder.owner.clone(),
                since: holder.acquired_at,
            });
        }

        held.insert(
            key.to_string(),
            LockHolder {
                owner: owner.to_string(),
                acquired_at: Utc::now(),
            },
        );
        tracing::trace!(cluster = key, owner, "Cluster lock acquired");

        Ok(ClusterLockGuard {
            table: Arc::clone(self),
            key: key.to_string(),
        })
    }

    /// Current holder of `key`, if any.
    pub fn holder(&self, key: &str) -> Option<LockHolder> {
        self.held.lock().get(key).cloned()
    }

    fn release(&self, key: &str) {
        if self.held.lock().remove(key).is_some() {
            tracing::trace!(cluster = key, "Cluster lock released");
        }
    }
}

/// RAII guard for a cluster lock.
#[derive(Debug)]
pub struct ClusterLockGuard {
    table: Arc<LockTable>,
    key: String,
}

impl ClusterLockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for ClusterLockGuard {
    fn drop(&mut self) {
        self.table.release(&self.key);
    }
}
