//! Store adapter for the shared lock collection.
//!
//! The engine coordinates through a document collection that offers atomic
//! per-document find-and-modify. This module defines that contract
//! ([`LockStore`]) plus the document and query types that cross it.
//!
//! Every operation must behave as one serialized step with respect to any
//! other writer of the same `(scope, key)` document. A backend whose native
//! find-and-modify lacks that isolation has to simulate it, for example with
//! a compare-and-set loop over a version field; the engine only depends on
//! the serialized-step contract, never on how it is met.

mod memory;

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use snafu::Snafu;

pub use memory::{InMemoryLockStore, StoreOp};

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

/// Predicate narrowing a query to documents with a particular refcount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefcountFilter {
    /// Matches documents whose refcount equals the value.
    Exactly(i64),
    /// Matches documents whose refcount is strictly greater than the value.
    Above(i64),
}

impl RefcountFilter {
    /// Whether a refcount satisfies this predicate.
    pub fn matches(&self, refcount: i64) -> bool {
        match self {
            RefcountFilter::Exactly(value) => refcount == *value,
            RefcountFilter::Above(floor) => refcount > *floor,
        }
    }
}

/// Query identifying one lock document, optionally narrowed by refcount.
///
/// `(scope, key)` is the compound identity of a document; the refcount
/// predicate turns an upserting operation into a conditional one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockQuery {
    /// Scope half of the compound identity.
    pub scope: String,
    /// Key half of the compound identity.
    pub key: String,
    /// Optional refcount predicate; `None` matches on identity alone.
    pub refcount: Option<RefcountFilter>,
}

impl LockQuery {
    /// Query matching a document by identity alone.
    pub fn ident(scope: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            key: key.into(),
            refcount: None,
        }
    }

    /// Narrow the query to documents with refcount strictly above `floor`.
    pub fn refcount_above(mut self, floor: i64) -> Self {
        self.refcount = Some(RefcountFilter::Above(floor));
        self
    }

    /// Narrow the query to documents with refcount exactly `value`.
    pub fn refcount_exactly(mut self, value: i64) -> Self {
        self.refcount = Some(RefcountFilter::Exactly(value));
        self
    }

    /// Whether a document satisfies this query.
    pub fn matches(&self, doc: &LockDocument) -> bool {
        doc.scope == self.scope
            && doc.key == self.key
            && self.refcount.is_none_or(|filter| filter.matches(doc.refcount))
    }
}

/// One lock document in the shared collection.
///
/// A healthy held lock has `refcount == 1` and an unexpired `expire_at_ms`.
/// `refcount == 0` is a transient garbage-collectable state during release;
/// `refcount > 1` means racing acquirers, exactly one of which must win the
/// reversal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockDocument {
    /// Scope half of the compound identity.
    pub scope: String,
    /// Key half of the compound identity.
    pub key: String,
    /// Number of outstanding increments against this document.
    pub refcount: i64,
    /// Moment past which the holder is considered dead, in Unix milliseconds.
    /// Absent until the first successful acquisition stamps it.
    pub expire_at_ms: Option<u64>,
}

impl LockDocument {
    /// Whether the holder's death horizon has passed.
    ///
    /// A document without an expiry stamp is never expired.
    pub fn is_expired(&self) -> bool {
        self.expire_at_ms.is_some_and(|deadline| deadline <= now_unix_ms())
    }
}

/// Errors from the store layer.
#[derive(Debug, Snafu, Clone, PartialEq, Eq)]
#[snafu(visibility(pub(crate)))]
pub enum LockStoreError {
    /// A conditional update matched no document and upsert could not proceed.
    #[snafu(display("no document matched the conditional update for '{scope}/{key}'"))]
    Conflict {
        /// Scope of the queried document.
        scope: String,
        /// Key of the queried document.
        key: String,
    },

    /// The backend failed to execute the operation.
    #[snafu(display("store backend error: {reason}"))]
    Backend {
        /// Backend-specific description of the failure.
        reason: String,
    },
}

/// Atomic find-and-modify operations against the shared lock collection.
///
/// The connection to the backing collection is an external concern: an
/// implementation wraps an already-resolved collection handle. Index setup
/// is the one piece of schema the adapter owns, via [`ensure_indexes`].
///
/// [`ensure_indexes`]: LockStore::ensure_indexes
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Find the document matching `query`, or create it when the query has
    /// no refcount predicate, then add `delta` to its refcount. Returns the
    /// post-update document.
    ///
    /// When the query carries a refcount predicate and nothing matches, the
    /// operation fails with [`LockStoreError::Conflict`] instead of
    /// upserting.
    async fn find_and_inc(&self, query: &LockQuery, delta: i64) -> Result<LockDocument, LockStoreError>;

    /// Find or create the document matching `query` and replace its expiry
    /// stamp. Returns the post-update document. Conditional queries behave
    /// as in [`find_and_inc`].
    ///
    /// [`find_and_inc`]: LockStore::find_and_inc
    async fn find_and_set_expiry(&self, query: &LockQuery, expire_at_ms: u64)
    -> Result<LockDocument, LockStoreError>;

    /// Remove the document matching `query`, returning it, or `None` when
    /// nothing matched. Never creates.
    async fn find_and_remove(&self, query: &LockQuery) -> Result<Option<LockDocument>, LockStoreError>;

    /// Read a document by identity without modifying it.
    async fn find(&self, scope: &str, key: &str) -> Result<Option<LockDocument>, LockStoreError>;

    /// Build the indexes the protocol relies on: the unique compound index
    /// on `(scope, key)` plus secondary indexes on `refcount` and
    /// `expire_at_ms` (backends build the secondary pair in the background).
    /// Runs once per materialized collection handle.
    async fn ensure_indexes(&self) -> Result<(), LockStoreError>;
}

#[async_trait]
impl<T: LockStore + ?Sized> LockStore for Arc<T> {
    async fn find_and_inc(&self, query: &LockQuery, delta: i64) -> Result<LockDocument, LockStoreError> {
        (**self).find_and_inc(query, delta).await
    }

    async fn find_and_set_expiry(
        &self,
        query: &LockQuery,
        expire_at_ms: u64,
    ) -> Result<LockDocument, LockStoreError> {
        (**self).find_and_set_expiry(query, expire_at_ms).await
    }

    async fn find_and_remove(&self, query: &LockQuery) -> Result<Option<LockDocument>, LockStoreError> {
        (**self).find_and_remove(query).await
    }

    async fn find(&self, scope: &str, key: &str) -> Result<Option<LockDocument>, LockStoreError> {
        (**self).find(scope, key).await
    }

    async fn ensure_indexes(&self) -> Result<(), LockStoreError> {
        (**self).ensure_indexes().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(refcount: i64, expire_at_ms: Option<u64>) -> LockDocument {
        LockDocument {
            scope: "Order".to_string(),
            key: "1".to_string(),
            refcount,
            expire_at_ms,
        }
    }

    #[test]
    fn refcount_filter_exactly() {
        assert!(RefcountFilter::Exactly(0).matches(0));
        assert!(!RefcountFilter::Exactly(0).matches(1));
    }

    #[test]
    fn refcount_filter_above_is_strict() {
        assert!(RefcountFilter::Above(1).matches(2));
        assert!(!RefcountFilter::Above(1).matches(1));
        assert!(!RefcountFilter::Above(1).matches(0));
    }

    #[test]
    fn ident_query_matches_on_identity_alone() {
        let query = LockQuery::ident("Order", "1");
        assert!(query.matches(&doc(0, None)));
        assert!(query.matches(&doc(17, None)));

        let other = LockDocument {
            key: "2".to_string(),
            ..doc(1, None)
        };
        assert!(!query.matches(&other));
    }

    #[test]
    fn conditional_query_narrows_by_refcount() {
        let query = LockQuery::ident("Order", "1").refcount_above(1);
        assert!(query.matches(&doc(2, None)));
        assert!(!query.matches(&doc(1, None)));

        let gc = LockQuery::ident("Order", "1").refcount_exactly(0);
        assert!(gc.matches(&doc(0, None)));
        assert!(!gc.matches(&doc(1, None)));
    }

    #[test]
    fn document_without_stamp_never_expires() {
        assert!(!doc(1, None).is_expired());
    }

    #[test]
    fn document_expiry_is_inclusive_of_the_deadline() {
        let now = now_unix_ms();
        assert!(doc(1, Some(now.saturating_sub(1))).is_expired());
        assert!(!doc(1, Some(now + 60_000)).is_expired());
    }

    #[test]
    fn conflict_display() {
        let err = LockStoreError::Conflict {
            scope: "Order".to_string(),
            key: "1".to_string(),
        };
        assert_eq!(err.to_string(), "no document matched the conditional update for 'Order/1'");
    }

    #[test]
    fn document_wire_shape() {
        let json = serde_json::to_value(doc(1, Some(42))).expect("serializable");
        assert_eq!(
            json,
            serde_json::json!({
                "scope": "Order",
                "key": "1",
                "refcount": 1,
                "expire_at_ms": 42,
            })
        );
    }
}
