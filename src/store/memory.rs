//! In-memory implementation of [`LockStore`] for tests and simulation.
//!
//! Stores documents in a `HashMap` behind a single async mutex, which makes
//! every operation one serialized step, exactly the isolation contract the
//! engine depends on, without network or disk I/O. Useful for unit tests,
//! property-based testing, and deterministic multi-"process" simulations
//! where several services share one store.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{ConflictSnafu, LockDocument, LockQuery, LockStore, LockStoreError};

/// One find-and-modify executed against an [`InMemoryLockStore`].
///
/// The store journals every mutation so tests can assert on protocol
/// traffic, e.g. that a nested acquire performed zero store calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    /// A `find_and_inc` with the applied delta; `conditional` records
    /// whether the query carried a refcount predicate.
    Inc {
        /// Key half of the queried identity.
        key: String,
        /// Signed refcount delta.
        delta: i64,
        /// Whether the query carried a refcount predicate.
        conditional: bool,
    },
    /// A `find_and_set_expiry`.
    SetExpiry {
        /// Key half of the queried identity.
        key: String,
    },
    /// A `find_and_remove`; `removed` records whether a document matched.
    Remove {
        /// Key half of the queried identity.
        key: String,
        /// Whether a document matched and was removed.
        removed: bool,
    },
}

#[derive(Default)]
struct Collection {
    documents: HashMap<(String, String), LockDocument>,
    journal: Vec<StoreOp>,
}

/// Deterministic in-memory lock collection.
#[derive(Default)]
pub struct InMemoryLockStore {
    inner: Mutex<Collection>,
    index_builds: AtomicU32,
}

impl InMemoryLockStore {
    /// Create a new empty store.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// How many times `ensure_indexes` has run against this store.
    pub fn index_builds(&self) -> u32 {
        self.index_builds.load(Ordering::SeqCst)
    }

    /// Number of documents currently in the collection.
    pub async fn document_count(&self) -> usize {
        self.inner.lock().await.documents.len()
    }

    /// Snapshot of every mutation executed so far, in order.
    pub async fn operations(&self) -> Vec<StoreOp> {
        self.inner.lock().await.journal.clone()
    }

    /// Drop the journal, keeping the documents.
    pub async fn clear_operations(&self) {
        self.inner.lock().await.journal.clear();
    }

    /// Place a document directly, bypassing the find-and-modify surface.
    /// Lets tests stage states such as a dead holder's leftover document.
    pub async fn seed(&self, doc: LockDocument) {
        let mut inner = self.inner.lock().await;
        inner.documents.insert((doc.scope.clone(), doc.key.clone()), doc);
    }
}

fn conditional_miss<T>(query: &LockQuery) -> Result<T, LockStoreError> {
    ConflictSnafu {
        scope: query.scope.clone(),
        key: query.key.clone(),
    }
    .fail()
}

#[async_trait]
impl LockStore for InMemoryLockStore {
    async fn find_and_inc(&self, query: &LockQuery, delta: i64) -> Result<LockDocument, LockStoreError> {
        let mut inner = self.inner.lock().await;
        inner.journal.push(StoreOp::Inc {
            key: query.key.clone(),
            delta,
            conditional: query.refcount.is_some(),
        });

        let ident = (query.scope.clone(), query.key.clone());
        match inner.documents.get_mut(&ident) {
            Some(doc) => {
                if !query.matches(doc) {
                    return conditional_miss(query);
                }
                doc.refcount += delta;
                Ok(doc.clone())
            }
            None if query.refcount.is_some() => conditional_miss(query),
            None => {
                let doc = LockDocument {
                    scope: query.scope.clone(),
                    key: query.key.clone(),
                    refcount: delta,
                    expire_at_ms: None,
                };
                inner.documents.insert(ident, doc.clone());
                Ok(doc)
            }
        }
    }

    async fn find_and_set_expiry(
        &self,
        query: &LockQuery,
        expire_at_ms: u64,
    ) -> Result<LockDocument, LockStoreError> {
        let mut inner = self.inner.lock().await;
        inner.journal.push(StoreOp::SetExpiry {
            key: query.key.clone(),
        });

        let ident = (query.scope.clone(), query.key.clone());
        match inner.documents.get_mut(&ident) {
            Some(doc) => {
                if !query.matches(doc) {
                    return conditional_miss(query);
                }
                doc.expire_at_ms = Some(expire_at_ms);
                Ok(doc.clone())
            }
            None if query.refcount.is_some() => conditional_miss(query),
            None => {
                let doc = LockDocument {
                    scope: query.scope.clone(),
                    key: query.key.clone(),
                    refcount: 0,
                    expire_at_ms: Some(expire_at_ms),
                };
                inner.documents.insert(ident, doc.clone());
                Ok(doc)
            }
        }
    }

    async fn find_and_remove(&self, query: &LockQuery) -> Result<Option<LockDocument>, LockStoreError> {
        let mut inner = self.inner.lock().await;
        let ident = (query.scope.clone(), query.key.clone());
        let matched = inner.documents.get(&ident).is_some_and(|doc| query.matches(doc));
        let removed = if matched { inner.documents.remove(&ident) } else { None };
        inner.journal.push(StoreOp::Remove {
            key: query.key.clone(),
            removed: removed.is_some(),
        });
        Ok(removed)
    }

    async fn find(&self, scope: &str, key: &str) -> Result<Option<LockDocument>, LockStoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.documents.get(&(scope.to_string(), key.to_string())).cloned())
    }

    async fn ensure_indexes(&self) -> Result<(), LockStoreError> {
        // The HashMap key is the unique compound index; the secondary
        // indexes have no in-memory counterpart. Counted so tests can assert
        // the materialize-once rule.
        self.index_builds.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn inc_upserts_when_unconditional() {
        let store = InMemoryLockStore::new();
        let doc = store.find_and_inc(&LockQuery::ident("Order", "1"), 1).await.unwrap();

        assert_eq!(doc.refcount, 1);
        assert_eq!(doc.expire_at_ms, None);
        assert_eq!(store.document_count().await, 1);
    }

    #[tokio::test]
    async fn inc_accumulates_on_an_existing_document() {
        let store = InMemoryLockStore::new();
        let ident = LockQuery::ident("Order", "1");
        store.find_and_inc(&ident, 1).await.unwrap();
        let doc = store.find_and_inc(&ident, 1).await.unwrap();

        assert_eq!(doc.refcount, 2);
        assert_eq!(store.document_count().await, 1);
    }

    #[tokio::test]
    async fn conditional_inc_refuses_to_upsert() {
        let store = InMemoryLockStore::new();
        let query = LockQuery::ident("Order", "1").refcount_above(1);

        let err = store.find_and_inc(&query, -1).await.unwrap_err();
        assert!(matches!(err, LockStoreError::Conflict { .. }));
        assert_eq!(store.document_count().await, 0);
    }

    #[tokio::test]
    async fn conditional_inc_conflicts_when_the_predicate_misses() {
        let store = InMemoryLockStore::new();
        store.find_and_inc(&LockQuery::ident("Order", "1"), 1).await.unwrap();

        let query = LockQuery::ident("Order", "1").refcount_above(1);
        let err = store.find_and_inc(&query, -1).await.unwrap_err();
        assert!(matches!(err, LockStoreError::Conflict { .. }));

        let doc = store.find("Order", "1").await.unwrap().unwrap();
        assert_eq!(doc.refcount, 1, "a missed predicate must not modify the document");
    }

    #[tokio::test]
    async fn set_expiry_preserves_refcount() {
        let store = InMemoryLockStore::new();
        let ident = LockQuery::ident("Order", "1");
        store.find_and_inc(&ident, 1).await.unwrap();

        let doc = store.find_and_set_expiry(&ident, 42).await.unwrap();
        assert_eq!(doc.refcount, 1);
        assert_eq!(doc.expire_at_ms, Some(42));
    }

    #[tokio::test]
    async fn set_expiry_upserts_a_zero_refcount_document() {
        let store = InMemoryLockStore::new();
        let doc = store
            .find_and_set_expiry(&LockQuery::ident("Order", "1"), 42)
            .await
            .unwrap();

        assert_eq!(doc.refcount, 0);
        assert_eq!(doc.expire_at_ms, Some(42));
    }

    #[tokio::test]
    async fn remove_returns_nothing_on_a_predicate_miss() {
        let store = InMemoryLockStore::new();
        let ident = LockQuery::ident("Order", "1");
        store.find_and_inc(&ident, 1).await.unwrap();

        let removed = store
            .find_and_remove(&LockQuery::ident("Order", "1").refcount_exactly(0))
            .await
            .unwrap();
        assert!(removed.is_none());
        assert_eq!(store.document_count().await, 1, "a miss never removes");
    }

    #[tokio::test]
    async fn remove_returns_the_matched_document() {
        let store = InMemoryLockStore::new();
        let ident = LockQuery::ident("Order", "1");
        store.find_and_inc(&ident, 1).await.unwrap();
        store.find_and_inc(&ident, -1).await.unwrap();

        let removed = store
            .find_and_remove(&LockQuery::ident("Order", "1").refcount_exactly(0))
            .await
            .unwrap()
            .expect("document at refcount 0 matches");
        assert_eq!(removed.refcount, 0);
        assert_eq!(store.document_count().await, 0);
    }

    #[tokio::test]
    async fn journal_records_operations_in_order() {
        let store = InMemoryLockStore::new();
        let ident = LockQuery::ident("Order", "1");
        store.find_and_inc(&ident, 1).await.unwrap();
        store.find_and_set_expiry(&ident, 42).await.unwrap();
        store.find_and_inc(&ident, -1).await.unwrap();
        store
            .find_and_remove(&LockQuery::ident("Order", "1").refcount_exactly(0))
            .await
            .unwrap();

        assert_eq!(
            store.operations().await,
            vec![
                StoreOp::Inc {
                    key: "1".to_string(),
                    delta: 1,
                    conditional: false
                },
                StoreOp::SetExpiry {
                    key: "1".to_string()
                },
                StoreOp::Inc {
                    key: "1".to_string(),
                    delta: -1,
                    conditional: false
                },
                StoreOp::Remove {
                    key: "1".to_string(),
                    removed: true
                },
            ]
        );
    }

    #[tokio::test]
    async fn index_builds_are_counted() {
        let store = InMemoryLockStore::new();
        assert_eq!(store.index_builds(), 0);
        store.ensure_indexes().await.unwrap();
        assert_eq!(store.index_builds(), 1);
    }
}
