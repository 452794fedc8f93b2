//! Error types for lock registration, resolution, and acquisition.
//!
//! Provides explicit error types with actionable context. Transient
//! contention and expiry reclamation are absorbed by the acquire retry loop
//! and never surface here; what does surface is misconfiguration, cycles,
//! retry exhaustion, and store failures outside the protocol's expected
//! recovery paths.

use snafu::Snafu;

use crate::store::LockStoreError;

/// Errors from lock registration, resolution, and acquisition.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum LockError {
    /// A registration parameter was rejected.
    #[snafu(display("invalid lockable registration for class '{class}': {reason}"))]
    InvalidRegistration {
        /// Class name the registration was for.
        class: String,
        /// Why the registration was rejected.
        reason: String,
    },

    /// A descriptor could not be evaluated against a live instance.
    #[snafu(display("lockable misconfiguration for class '{class}': {reason}"))]
    InvalidConfig {
        /// Class name whose descriptor failed to evaluate.
        class: String,
        /// What went wrong during evaluation.
        reason: String,
    },

    /// Walking parent references revisited a class.
    #[snafu(display("circular lock dependency: {}", chain.join(" -> ")))]
    CircularLock {
        /// Class names in traversal order, ending with the revisited class.
        chain: Vec<String>,
    },

    /// Acquisition exhausted its retry budget.
    ///
    /// The caller's re-entrancy count has been rolled back to its
    /// pre-acquire value by the time this is returned.
    #[snafu(display("timed out acquiring lock '{name}' after {retries} retries"))]
    AcquireTimeout {
        /// Display name of the lock, `scope/key`.
        name: String,
        /// Number of counted retries performed before giving up.
        retries: u32,
    },

    /// The store failed outside the protocol's expected recovery paths.
    #[snafu(display("store operation failed during {operation}: {source}"))]
    StoreFailure {
        /// The operation that was in flight, e.g. `acquire of 'Order/1'`.
        operation: String,
        /// The underlying store error.
        source: LockStoreError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_registration_display() {
        let err = LockError::InvalidRegistration {
            class: "Order".to_string(),
            reason: "max_retries must be at least 1".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "invalid lockable registration for class 'Order': max_retries must be at least 1"
        );
    }

    #[test]
    fn invalid_config_display() {
        let err = LockError::InvalidConfig {
            class: "OrderItem".to_string(),
            reason: "attribute 'id' returned nothing".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "lockable misconfiguration for class 'OrderItem': attribute 'id' returned nothing"
        );
    }

    #[test]
    fn circular_lock_display_cites_the_chain() {
        let err = LockError::CircularLock {
            chain: vec!["OrderItem".to_string(), "Order".to_string(), "OrderItem".to_string()],
        };
        assert_eq!(err.to_string(), "circular lock dependency: OrderItem -> Order -> OrderItem");
    }

    #[test]
    fn acquire_timeout_display() {
        let err = LockError::AcquireTimeout {
            name: "Order/1".to_string(),
            retries: 2,
        };
        assert_eq!(err.to_string(), "timed out acquiring lock 'Order/1' after 2 retries");
    }

    #[test]
    fn store_failure_display_includes_source() {
        let err = LockError::StoreFailure {
            operation: "release of 'Order/1'".to_string(),
            source: LockStoreError::Backend {
                reason: "connection reset".to_string(),
            },
        };
        assert_eq!(
            err.to_string(),
            "store operation failed during release of 'Order/1': store backend error: connection reset"
        );
    }
}
