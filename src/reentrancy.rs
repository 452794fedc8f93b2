//! Per-owner nesting counts for re-entrant acquisition.
//!
//! Nesting is a same-owner property: the execution context that already
//! holds a lock may re-enter it without touching the store, while every
//! other owner in the same process still contends through the store. An
//! owner is the current tokio task, or the OS thread when no runtime is
//! active; the two never alias, and spawned tasks are deliberately distinct
//! owners from their spawner.
//!
//! The table is guarded by a std mutex held only for map operations, never
//! across an await.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::thread::{self, ThreadId};

/// Identity of the execution context that owns a nesting count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum OwnerId {
    Task(tokio::task::Id),
    Thread(ThreadId),
}

impl OwnerId {
    /// The calling context's identity.
    pub(crate) fn current() -> Self {
        match tokio::task::try_id() {
            Some(task) => OwnerId::Task(task),
            None => OwnerId::Thread(thread::current().id()),
        }
    }
}

type KeyCounts = HashMap<String, u32>;
type ClassCounts = HashMap<String, KeyCounts>;

/// Nesting counts per owner, namespaced by root class name, keyed by lock
/// key. Entries that return to zero are pruned so long-lived owners do not
/// accumulate dead keys.
#[derive(Debug, Default)]
pub(crate) struct ReentrancyTable {
    owners: Mutex<HashMap<OwnerId, ClassCounts>>,
}

impl ReentrancyTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Bump the nesting count, returning the post-increment value. A result
    /// of 1 means the caller must go to the store; anything higher is a
    /// nested re-acquire.
    pub(crate) fn enter(&self, owner: OwnerId, class: &str, key: &str) -> u32 {
        let mut owners = self.guard();
        let count = owners
            .entry(owner)
            .or_default()
            .entry(class.to_string())
            .or_default()
            .entry(key.to_string())
            .or_insert(0);
        *count += 1;
        *count
    }

    /// Drop the nesting count, returning the post-decrement value. A result
    /// of 0 means the caller owes the store a release. Exiting a key that
    /// was never entered stays at 0.
    pub(crate) fn exit(&self, owner: OwnerId, class: &str, key: &str) -> u32 {
        let mut owners = self.guard();
        let Some(classes) = owners.get_mut(&owner) else {
            return 0;
        };
        let Some(keys) = classes.get_mut(class) else {
            return 0;
        };
        let Some(count) = keys.get_mut(key) else {
            return 0;
        };

        *count = count.saturating_sub(1);
        let remaining = *count;
        if remaining == 0 {
            keys.remove(key);
            if keys.is_empty() {
                classes.remove(class);
            }
            if owners.get(&owner).is_some_and(ClassCounts::is_empty) {
                owners.remove(&owner);
            }
        }
        remaining
    }

    /// Current nesting count for an owner.
    pub(crate) fn count(&self, owner: OwnerId, class: &str, key: &str) -> u32 {
        self.guard()
            .get(&owner)
            .and_then(|classes| classes.get(class))
            .and_then(|keys| keys.get(key))
            .copied()
            .unwrap_or(0)
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.guard().is_empty()
    }

    fn guard(&self) -> MutexGuard<'_, HashMap<OwnerId, ClassCounts>> {
        self.owners.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
