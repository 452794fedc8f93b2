//! Shared fixtures for the integration suites: a small Order/OrderItem
//! object model and store wrappers instrumented for deterministic race
//! injection and backoff measurement.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rootlock::{
    InMemoryLockStore, KeySource, LockDocument, LockQuery, LockRegistry, LockStore, LockStoreError,
    LockTunables, Lockable, LockableDescriptor, ParentSource, RefcountFilter,
};

pub struct Order {
    pub id: u64,
}

impl Lockable for Order {
    fn class_name(&self) -> &str {
        "Order"
    }

    fn attribute(&self, name: &str) -> Option<String> {
        (name == "id").then(|| self.id.to_string())
    }
}

pub struct OrderItem {
    pub id: u64,
    pub order: Arc<Order>,
}

impl Lockable for OrderItem {
    fn class_name(&self) -> &str {
        "OrderItem"
    }

    fn attribute(&self, name: &str) -> Option<String> {
        (name == "id").then(|| self.id.to_string())
    }

    fn related(&self, name: &str) -> Option<Arc<dyn Lockable>> {
        (name == "order").then(|| Arc::clone(&self.order) as Arc<dyn Lockable>)
    }
}

/// Registry with `Order` as root (keyed by `id`) and `OrderItem` locked
/// through its order.
pub fn registry(tunables: LockTunables) -> LockRegistry {
    let mut registry = LockRegistry::new();
    registry
        .register(
            LockableDescriptor::root("Order")
                .keyed_by(KeySource::attribute("id"))
                .tuned(tunables),
        )
        .expect("root registration");
    registry
        .register(LockableDescriptor::child("OrderItem", ParentSource::related("order")))
        .expect("child registration");
    registry
}

/// Tunables sized for tests: two counted retries, millisecond backoff.
pub fn fast_tunables() -> LockTunables {
    LockTunables {
        max_retries: 2,
        first_retry_interval: Duration::from_millis(5),
        max_retry_interval: Duration::from_millis(20),
        max_lifetime: Duration::from_secs(60),
    }
}

/// Store wrapper that timestamps every claim attempt (unconditional
/// positive increment) against the tokio clock. With the clock paused, the
/// gaps between consecutive attempts are exactly the engine's sleeps.
pub struct TimedStore {
    inner: Arc<InMemoryLockStore>,
    attempt_starts: Mutex<Vec<tokio::time::Instant>>,
}

impl TimedStore {
    pub fn new(inner: Arc<InMemoryLockStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            attempt_starts: Mutex::new(Vec::new()),
        })
    }

    /// Sleep durations between consecutive claim attempts.
    pub fn backoff_intervals(&self) -> Vec<Duration> {
        let starts = self.attempt_starts.lock().unwrap();
        starts.windows(2).map(|pair| pair[1] - pair[0]).collect()
    }
}

#[async_trait]
impl LockStore for TimedStore {
    async fn find_and_inc(&self, query: &LockQuery, delta: i64) -> Result<LockDocument, LockStoreError> {
        if delta > 0 && query.refcount.is_none() {
            self.attempt_starts.lock().unwrap().push(tokio::time::Instant::now());
        }
        self.inner.find_and_inc(query, delta).await
    }

    async fn find_and_set_expiry(
        &self,
        query: &LockQuery,
        expire_at_ms: u64,
    ) -> Result<LockDocument, LockStoreError> {
        self.inner.find_and_set_expiry(query, expire_at_ms).await
    }

    async fn find_and_remove(&self, query: &LockQuery) -> Result<Option<LockDocument>, LockStoreError> {
        self.inner.find_and_remove(query).await
    }

    async fn find(&self, scope: &str, key: &str) -> Result<Option<LockDocument>, LockStoreError> {
        self.inner.find(scope, key).await
    }

    async fn ensure_indexes(&self) -> Result<(), LockStoreError> {
        self.inner.ensure_indexes().await
    }
}

/// Store wrapper that injects a rival acquire between a releaser's
/// decrement-to-zero and its garbage-collection delete, exactly once.
pub struct RacingStore {
    inner: Arc<InMemoryLockStore>,
    raced: AtomicBool,
}

impl RacingStore {
    pub fn new(inner: Arc<InMemoryLockStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            raced: AtomicBool::new(false),
        })
    }

    pub fn raced(&self) -> bool {
        self.raced.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LockStore for RacingStore {
    async fn find_and_inc(&self, query: &LockQuery, delta: i64) -> Result<LockDocument, LockStoreError> {
        self.inner.find_and_inc(query, delta).await
    }

    async fn find_and_set_expiry(
        &self,
        query: &LockQuery,
        expire_at_ms: u64,
    ) -> Result<LockDocument, LockStoreError> {
        self.inner.find_and_set_expiry(query, expire_at_ms).await
    }

    async fn find_and_remove(&self, query: &LockQuery) -> Result<Option<LockDocument>, LockStoreError> {
        let is_collection = query.refcount == Some(RefcountFilter::Exactly(0));
        if is_collection && !self.raced.swap(true, Ordering::SeqCst) {
            // The rival's upserting increment lands first.
            self.inner
                .find_and_inc(&LockQuery::ident(query.scope.clone(), query.key.clone()), 1)
                .await?;
        }
        self.inner.find_and_remove(query).await
    }

    async fn find(&self, scope: &str, key: &str) -> Result<Option<LockDocument>, LockStoreError> {
        self.inner.find(scope, key).await
    }

    async fn ensure_indexes(&self) -> Result<(), LockStoreError> {
        self.inner.ensure_indexes().await
    }
}
