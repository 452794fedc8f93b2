//! Advisory, re-entrant mutual exclusion for object graphs, coordinated
//! through a shared document collection.
//!
//! Independent processes serialize access to a logical resource by driving
//! an atomic refcount state machine against one document per lock in a
//! shared collection. Three pieces make up the core:
//!
//! - a **graph resolver** that walks parent references from any registered
//!   [`Lockable`] up to its *root*, whose `(scope, key)` identity names the
//!   lock, so an entire object subtree shares one lock;
//! - a **re-entrancy table** keyed by the current owner (tokio task, or OS
//!   thread outside a runtime), so nested acquisition by the same owner is
//!   non-blocking and store-free;
//! - an **acquire/release engine** that claims the document with an
//!   upserting increment and recovers from contention, races, and expired
//!   holders with bounded, backed-off retries.
//!
//! The lock is advisory: only participants routing through this protocol
//! are protected. Crashed holders are reclaimed once their stamped expiry
//! horizon passes, bounding the wait for a dead peer.
//!
//! ## Example
//!
//! ```ignore
//! use rootlock::{InMemoryLockStore, LockRegistry, LockService, LockableDescriptor, ParentSource};
//!
//! let mut registry = LockRegistry::new();
//! registry.register(LockableDescriptor::root("Order"))?;
//! registry.register(LockableDescriptor::child("OrderItem", ParentSource::related("order")))?;
//!
//! let service = LockService::new(InMemoryLockStore::new(), registry);
//!
//! // Locking an item contends on its order's lock.
//! service.with_lock(&item, || async {
//!     // exclusive across processes, re-entrant within this task
//! }).await?;
//! ```
//!
//! Binding a concrete object model (ORM entities, domain structs) means
//! implementing [`Lockable`] (class identity plus name-addressed reads)
//! and registering a [`LockableDescriptor`] per class. Production
//! deployments implement [`LockStore`] over their document store; the
//! bundled [`InMemoryLockStore`] serves tests and simulation.

#![warn(missing_docs)]

/// Error types for registration, resolution, and acquisition.
pub mod error;
/// Lockable capability surface and per-class descriptors.
pub mod lockable;
mod reentrancy;
/// Registry of lockable class descriptors.
pub mod registry;
/// Resolution from an instance to its root lock identity.
pub mod resolver;
/// The acquire/release engine and closure frontend.
pub mod service;
/// Store adapter contract and the in-memory implementation.
pub mod store;

pub use error::LockError;
pub use lockable::{KeySource, LockTunables, Lockable, LockableDescriptor, ParentSource, ScopeSource};
pub use registry::LockRegistry;
pub use resolver::ResolvedRoot;
pub use service::{LockGuard, LockService};
pub use store::{
    InMemoryLockStore, LockDocument, LockQuery, LockStore, LockStoreError, RefcountFilter, StoreOp,
    now_unix_ms,
};
