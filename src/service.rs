//! Acquire/release engine and the closure frontend.
//!
//! The engine drives the refcount state machine against the store: an
//! upserting increment claims the document, a post-increment count of 1
//! means the lock is ours, anything else routes through the recovery
//! branches (expiry reclamation, compensating decrement, bounded backoff).
//! Same-owner nesting short-circuits before any store interaction.

use std::future::Future;
use std::sync::{Arc, Mutex};

use snafu::{IntoError, ResultExt};
use tokio::sync::OnceCell;
use tracing::{debug, error, warn};

use crate::error::{AcquireTimeoutSnafu, LockError, StoreFailureSnafu};
use crate::lockable::Lockable;
use crate::reentrancy::{OwnerId, ReentrancyTable};
use crate::registry::LockRegistry;
use crate::resolver::{ResolvedRoot, resolve_root};
use crate::store::{BackendSnafu, LockQuery, LockStore, LockStoreError, now_unix_ms};

type StoreProducer<S> = Box<dyn FnOnce() -> Arc<S> + Send>;

/// Outcome of one pass through the claim state machine.
enum Attempt {
    Acquired,
    /// Go around again; `counted` says whether the pass consumes retry
    /// budget (a store anomaly does not).
    Retry { counted: bool },
}

/// Coordinates lock acquisition for registered lockable classes.
///
/// One service per process is the expected shape: the registry is fixed at
/// construction, the store handle is materialized on first use, and the
/// re-entrancy table spans every owner in the process. The service itself is
/// cheap to share behind an [`Arc`].
pub struct LockService<S: LockStore + ?Sized> {
    store: OnceCell<Arc<S>>,
    producer: Mutex<Option<StoreProducer<S>>>,
    registry: Arc<LockRegistry>,
    refcounts: Arc<ReentrancyTable>,
}

impl<S: LockStore + ?Sized + 'static> LockService<S> {
    /// Create a service over an already-resolved store handle.
    ///
    /// The index-ensure step still runs once, on first use.
    pub fn new(store: Arc<S>, registry: LockRegistry) -> Self {
        Self::with_lazy_store(move || store, registry)
    }

    /// Create a service over a lazily produced store handle.
    ///
    /// The producer runs at most once, on first use; `ensure_indexes` runs
    /// right after materialization and never again.
    pub fn with_lazy_store<F>(producer: F, registry: LockRegistry) -> Self
    where
        F: FnOnce() -> Arc<S> + Send + 'static,
    {
        Self {
            store: OnceCell::new(),
            producer: Mutex::new(Some(Box::new(producer))),
            registry: Arc::new(registry),
            refcounts: Arc::new(ReentrancyTable::new()),
        }
    }

    /// Resolve an instance to the root identity that keys its lock, without
    /// touching the store.
    pub fn resolve(&self, instance: &dyn Lockable) -> Result<ResolvedRoot, LockError> {
        resolve_root(&self.registry, instance)
    }

    /// Whether the calling owner currently holds the lock the instance
    /// resolves to.
    pub fn holds_lock(&self, instance: &dyn Lockable) -> Result<bool, LockError> {
        let root = self.resolve(instance)?;
        Ok(self.refcounts.count(OwnerId::current(), root.class_name(), root.key()) > 0)
    }

    /// Acquire the lock the instance resolves to, returning the resolved
    /// root so the matching [`release`] needs no re-resolution.
    ///
    /// A nested acquire by the owner already holding the lock returns
    /// immediately with zero store round-trips. On [`AcquireTimeout`] and
    /// [`StoreFailure`] the caller's nesting count has been rolled back.
    ///
    /// [`release`]: LockService::release
    /// [`AcquireTimeout`]: LockError::AcquireTimeout
    /// [`StoreFailure`]: LockError::StoreFailure
    pub async fn acquire(&self, instance: &dyn Lockable) -> Result<ResolvedRoot, LockError> {
        let root = self.resolve(instance)?;
        self.acquire_root(&root, OwnerId::current()).await?;
        Ok(root)
    }

    /// Release a lock previously acquired by the calling owner.
    ///
    /// A nested release only drops the nesting count. The last release
    /// decrements the document refcount and garbage-collects the document
    /// when nothing else holds it; losing that collection race to a rival
    /// acquirer is expected and silent.
    pub async fn release(&self, root: &ResolvedRoot) -> Result<(), LockError> {
        let owner = OwnerId::current();
        let remaining = self.refcounts.exit(owner, root.class_name(), root.key());
        if remaining > 0 {
            debug!(lock = %root.name(), nesting = remaining, "nested release, lock still held");
            return Ok(());
        }
        let store = self.store().await?;
        finish_release(store.as_ref(), root).await
    }

    /// Acquire and wrap the lock in a guard that releases on drop.
    ///
    /// Prefer [`with_lock`] for block-shaped critical sections; the guard is
    /// for lifetimes that do not nest lexically. Dropping the guard releases
    /// best-effort on a spawned task; call [`LockGuard::release`] to
    /// observe release errors.
    ///
    /// [`with_lock`]: LockService::with_lock
    pub async fn acquire_scoped(&self, instance: &dyn Lockable) -> Result<LockGuard<S>, LockError> {
        let owner = OwnerId::current();
        let root = self.resolve(instance)?;
        self.acquire_root(&root, owner).await?;
        let store = match self.store().await {
            Ok(store) => Arc::clone(store),
            // The store materialized during acquire; failing here means the
            // slow path was skipped and a prior materialization failed.
            Err(err) => {
                self.refcounts.exit(owner, root.class_name(), root.key());
                return Err(err);
            }
        };
        Ok(LockGuard {
            store,
            refcounts: Arc::clone(&self.refcounts),
            root,
            owner,
            armed: true,
        })
    }

    /// Run `body` under the lock the instance resolves to.
    ///
    /// Acquisition errors surface without running the body. The lock is
    /// released on every exit path: explicitly (with errors surfaced) when
    /// the body completes, and best-effort through the guard when the body
    /// panics or the future is dropped mid-flight.
    pub async fn with_lock<T, F, Fut>(&self, instance: &dyn Lockable, body: F) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = self.acquire_scoped(instance).await?;
        let value = body().await;
        guard.release().await?;
        Ok(value)
    }

    /// The store handle, materializing it on first use.
    async fn store(&self) -> Result<&Arc<S>, LockError> {
        self.store
            .get_or_try_init(|| async {
                let producer = self
                    .producer
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .take();
                let Some(producer) = producer else {
                    let source = BackendSnafu {
                        reason: "store producer was consumed by a failed materialization",
                    }
                    .build();
                    return Err(StoreFailureSnafu {
                        operation: "store materialization",
                    }
                    .into_error(source));
                };
                let store = producer();
                store
                    .ensure_indexes()
                    .await
                    .context(StoreFailureSnafu {
                        operation: "index setup",
                    })?;
                Ok(store)
            })
            .await
    }

    async fn acquire_root(&self, root: &ResolvedRoot, owner: OwnerId) -> Result<(), LockError> {
        let name = root.name();
        let nesting = self.refcounts.enter(owner, root.class_name(), root.key());
        if nesting > 1 {
            debug!(lock = %name, nesting, "re-using lock already held by this owner");
            return Ok(());
        }

        let rollback = || self.refcounts.exit(owner, root.class_name(), root.key());
        let store = match self.store().await {
            Ok(store) => store,
            Err(err) => {
                rollback();
                return Err(err);
            }
        };

        let tunables = root.tunables();
        let mut interval = tunables.first_retry_interval;
        let mut retries: u32 = 0;

        loop {
            match try_claim(store.as_ref(), root).await {
                Ok(Attempt::Acquired) => {
                    debug!(lock = %name, "lock acquired");
                    return Ok(());
                }
                Ok(Attempt::Retry { counted }) => {
                    if counted {
                        if retries >= tunables.max_retries {
                            rollback();
                            warn!(lock = %name, retries, "giving up on lock acquisition");
                            return AcquireTimeoutSnafu { name, retries }.fail();
                        }
                        retries += 1;
                    }
                    debug!(
                        lock = %name,
                        retries,
                        backoff_ms = interval.as_millis() as u64,
                        "lock attempt failed, backing off"
                    );
                    tokio::time::sleep(interval).await;
                    interval = (interval * 2).min(tunables.max_retry_interval);
                }
                Err(source) => {
                    rollback();
                    error!(lock = %name, error = %source, "store failed during lock acquisition");
                    return Err(source).context(StoreFailureSnafu {
                        operation: format!("acquire of '{name}'"),
                    });
                }
            }
        }
    }
}

/// One pass through the claim state machine: increment, then classify the
/// post-increment refcount.
async fn try_claim<S: LockStore + ?Sized>(
    store: &S,
    root: &ResolvedRoot,
) -> Result<Attempt, LockStoreError> {
    let name = root.name();
    let ident = LockQuery::ident(root.scope(), root.key());

    let doc = store.find_and_inc(&ident, 1).await?;
    let mut refcount = doc.refcount;

    if refcount < 1 {
        // Impossible in a well-formed document; tolerate transient store
        // inconsistency without consuming retry budget.
        warn!(lock = %name, refcount, "refcount below one after increment, treating as store anomaly");
        return Ok(Attempt::Retry { counted: false });
    }

    if doc.is_expired() {
        // Our increment stacked on top of a dead holder's count. Exactly one
        // contender gets to strip the stale count; the conditional predicate
        // arbitrates, and losing it means someone else already reclaimed.
        let reclaim = ident.clone().refcount_above(1);
        match store.find_and_inc(&reclaim, -1).await {
            Ok(updated) => {
                debug!(lock = %name, refcount = updated.refcount, "reclaimed an expired holder");
                refcount = updated.refcount;
            }
            Err(LockStoreError::Conflict { .. }) => {
                debug!(lock = %name, "lost the expiry-reclamation race, backing off");
                return Ok(Attempt::Retry { counted: true });
            }
            Err(other) => return Err(other),
        }
    }

    if refcount > 1 {
        // Lost the race; strip our own increment before backing off.
        store.find_and_inc(&ident, -1).await?;
        debug!(lock = %name, refcount, "lock contended, backing off");
        Ok(Attempt::Retry { counted: true })
    } else if refcount == 1 {
        // Ours. Stamp the death horizon; it is refreshed only here, never on
        // nested re-acquires.
        let expire_at_ms = now_unix_ms() + root.tunables().max_lifetime.as_millis() as u64;
        store.find_and_set_expiry(&ident, expire_at_ms).await?;
        Ok(Attempt::Acquired)
    } else {
        warn!(lock = %name, refcount, "refcount below one after reclamation, treating as store anomaly");
        Ok(Attempt::Retry { counted: false })
    }
}

/// Store half of a release: decrement, then garbage-collect at zero.
async fn finish_release<S: LockStore + ?Sized>(store: &S, root: &ResolvedRoot) -> Result<(), LockError> {
    let name = root.name();
    release_document(store, root).await.map_err(|source| {
        error!(lock = %name, error = %source, "store failed during lock release");
        StoreFailureSnafu {
            operation: format!("release of '{name}'"),
        }
        .into_error(source)
    })
}

async fn release_document<S: LockStore + ?Sized>(
    store: &S,
    root: &ResolvedRoot,
) -> Result<(), LockStoreError> {
    let name = root.name();
    let ident = LockQuery::ident(root.scope(), root.key());

    let doc = store.find_and_inc(&ident, -1).await?;
    if doc.refcount == 0 {
        // A rival acquire may bump the count between our decrement and this
        // delete; missing the conditional match is that race's expected
        // outcome.
        let collectable = ident.refcount_exactly(0);
        if store.find_and_remove(&collectable).await?.is_none() {
            debug!(lock = %name, "skipped garbage-collection, document busy again");
        } else {
            debug!(lock = %name, "lock released and document collected");
        }
    } else {
        debug!(lock = %name, refcount = doc.refcount, "lock released");
    }
    Ok(())
}

/// Holds a lock until released or dropped.
///
/// Dropping the guard releases best-effort: the nesting count drops
/// synchronously, and any store release this owner owes runs on a spawned
/// task. If no runtime is available for that task the holder simply expires
/// at its death horizon. Use [`LockGuard::release`] to observe errors.
pub struct LockGuard<S: LockStore + ?Sized + 'static> {
    store: Arc<S>,
    refcounts: Arc<ReentrancyTable>,
    root: ResolvedRoot,
    owner: OwnerId,
    armed: bool,
}

impl<S: LockStore + ?Sized + 'static> LockGuard<S> {
    /// The resolved root this guard holds.
    pub fn root(&self) -> &ResolvedRoot {
        &self.root
    }

    /// Release explicitly, surfacing store errors.
    pub async fn release(mut self) -> Result<(), LockError> {
        self.armed = false;
        let remaining = self.refcounts.exit(self.owner, self.root.class_name(), self.root.key());
        if remaining > 0 {
            debug!(lock = %self.root.name(), nesting = remaining, "nested release, lock still held");
            return Ok(());
        }
        finish_release(self.store.as_ref(), &self.root).await
    }
}

impl<S: LockStore + ?Sized + 'static> Drop for LockGuard<S> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let remaining = self.refcounts.exit(self.owner, self.root.class_name(), self.root.key());
        if remaining > 0 {
            debug!(lock = %self.root.name(), nesting = remaining, "nested release on drop");
            return;
        }

        let store = Arc::clone(&self.store);
        let root = self.root.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(error) = release_document(store.as_ref(), &root).await {
                        debug!(
                            lock = %root.name(),
                            %error,
                            "release on drop failed, holder will expire"
                        );
                    }
                });
            }
            Err(_) => {
                warn!(
                    lock = %self.root.name(),
                    "no runtime to release on drop, holder will expire"
                );
            }
        }
    }
}
