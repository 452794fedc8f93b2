//! Lockable capability surface and per-class descriptors.
//!
//! The engine never knows the host object model. A participating type
//! implements [`Lockable`] (class identity plus name-addressed reads) and
//! its class registers a [`LockableDescriptor`] describing how to derive the
//! lock `scope`, the lock `key`, and (for non-root classes) the parent
//! lockable. Locking always operates on the *root* of the parent chain, so
//! an entire object subtree shares one lock.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{InvalidConfigSnafu, LockError};

/// Callback deriving a string (scope or key) from a lockable instance.
pub type DeriveFn = Arc<dyn Fn(&dyn Lockable) -> String + Send + Sync>;

/// Callback deriving the parent lockable from an instance.
pub type ParentFn = Arc<dyn Fn(&dyn Lockable) -> Option<Arc<dyn Lockable>> + Send + Sync>;

/// An opaque instance handle the engine can lock.
///
/// The engine touches instances only through this capability set: class
/// identity, a stringified attribute read, and a read of a related lockable
/// (the parent edge). Whether those reads are field accesses, ORM lazy
/// loads, or computed values is the host's business.
pub trait Lockable: Send + Sync {
    /// Class identity; namespaces the re-entrancy table and is the default
    /// lock scope.
    fn class_name(&self) -> &str;

    /// Name-addressed attribute read, stringified.
    fn attribute(&self, name: &str) -> Option<String>;

    /// Name-addressed read of a related lockable instance.
    ///
    /// Only classes registered with [`ParentSource::Related`] need this;
    /// the default resolves nothing.
    fn related(&self, name: &str) -> Option<Arc<dyn Lockable>> {
        let _ = name;
        None
    }
}

/// How a descriptor derives the lock scope from an instance.
#[derive(Clone)]
pub enum ScopeSource {
    /// A fixed string, the same for every instance of the class.
    Literal(String),
    /// The stringified value of a named attribute.
    Attribute(String),
    /// A callback applied to the instance.
    Derived(DeriveFn),
}

impl ScopeSource {
    /// Fixed-string scope.
    pub fn literal(value: impl Into<String>) -> Self {
        ScopeSource::Literal(value.into())
    }

    /// Scope read from a named attribute.
    pub fn attribute(name: impl Into<String>) -> Self {
        ScopeSource::Attribute(name.into())
    }

    /// Scope computed by a callback.
    pub fn derived(derive: impl Fn(&dyn Lockable) -> String + Send + Sync + 'static) -> Self {
        ScopeSource::Derived(Arc::new(derive))
    }
}

impl fmt::Debug for ScopeSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeSource::Literal(value) => f.debug_tuple("Literal").field(value).finish(),
            ScopeSource::Attribute(name) => f.debug_tuple("Attribute").field(name).finish(),
            ScopeSource::Derived(_) => f.write_str("Derived(..)"),
        }
    }
}

/// How a descriptor derives the lock key from an instance.
#[derive(Clone)]
pub enum KeySource {
    /// The stringified value of a named attribute.
    Attribute(String),
    /// A callback applied to the instance.
    Derived(DeriveFn),
}

impl KeySource {
    /// Key read from a named attribute.
    pub fn attribute(name: impl Into<String>) -> Self {
        KeySource::Attribute(name.into())
    }

    /// Key computed by a callback.
    pub fn derived(derive: impl Fn(&dyn Lockable) -> String + Send + Sync + 'static) -> Self {
        KeySource::Derived(Arc::new(derive))
    }
}

impl fmt::Debug for KeySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySource::Attribute(name) => f.debug_tuple("Attribute").field(name).finish(),
            KeySource::Derived(_) => f.write_str("Derived(..)"),
        }
    }
}

/// How a non-root descriptor reaches the parent lockable.
#[derive(Clone)]
pub enum ParentSource {
    /// A named related-object read on the instance.
    Related(String),
    /// A callback applied to the instance.
    Derived(ParentFn),
}

impl ParentSource {
    /// Parent reached through a named related-object read.
    pub fn related(name: impl Into<String>) -> Self {
        ParentSource::Related(name.into())
    }

    /// Parent computed by a callback.
    pub fn derived(
        derive: impl Fn(&dyn Lockable) -> Option<Arc<dyn Lockable>> + Send + Sync + 'static,
    ) -> Self {
        ParentSource::Derived(Arc::new(derive))
    }
}

impl fmt::Debug for ParentSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParentSource::Related(name) => f.debug_tuple("Related").field(name).finish(),
            ParentSource::Derived(_) => f.write_str("Derived(..)"),
        }
    }
}

/// Per-class acquisition tunables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockTunables {
    /// Counted retry budget before acquisition times out.
    pub max_retries: u32,
    /// Sleep before the first retry; doubles on each subsequent retry.
    pub first_retry_interval: Duration,
    /// Ceiling on the doubling backoff.
    pub max_retry_interval: Duration,
    /// Horizon after which other acquirers may reclaim the lock. Stamped on
    /// fresh acquisition only (nested re-acquires never refresh it), so it
    /// must cover the outermost critical section.
    pub max_lifetime: Duration,
}

impl Default for LockTunables {
    fn default() -> Self {
        Self {
            max_retries: 5,
            first_retry_interval: Duration::from_millis(200),
            max_retry_interval: Duration::from_secs(5),
            max_lifetime: Duration::from_secs(60),
        }
    }
}

/// Per-class lock configuration: how instances of one class map to lock
/// documents and how acquisition behaves for them.
///
/// A descriptor is a *root* iff it has no parent source; only root
/// descriptors ever contribute scope and key.
#[derive(Debug, Clone)]
pub struct LockableDescriptor {
    class_name: String,
    scope: ScopeSource,
    key: KeySource,
    parent: Option<ParentSource>,
    tunables: LockTunables,
}

impl LockableDescriptor {
    /// Descriptor for a lock root. Defaults: scope is the class name, key is
    /// the `id` attribute, tunables are [`LockTunables::default`].
    pub fn root(class_name: impl Into<String>) -> Self {
        let class_name = class_name.into();
        Self {
            scope: ScopeSource::Literal(class_name.clone()),
            key: KeySource::Attribute("id".to_string()),
            parent: None,
            tunables: LockTunables::default(),
            class_name,
        }
    }

    /// Descriptor for a class locked through its parent. Scope and key are
    /// never evaluated on non-root classes, so only the parent edge matters.
    pub fn child(class_name: impl Into<String>, parent: ParentSource) -> Self {
        let mut descriptor = Self::root(class_name);
        descriptor.parent = Some(parent);
        descriptor
    }

    /// Replace the scope source.
    pub fn scoped_by(mut self, scope: ScopeSource) -> Self {
        self.scope = scope;
        self
    }

    /// Replace the key source.
    pub fn keyed_by(mut self, key: KeySource) -> Self {
        self.key = key;
        self
    }

    /// Replace the acquisition tunables.
    pub fn tuned(mut self, tunables: LockTunables) -> Self {
        self.tunables = tunables;
        self
    }

    /// Class this descriptor configures.
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// Whether this descriptor is a lock root.
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// Acquisition tunables for this class.
    pub fn tunables(&self) -> &LockTunables {
        &self.tunables
    }

    pub(crate) fn scope_source(&self) -> &ScopeSource {
        &self.scope
    }

    pub(crate) fn key_source(&self) -> &KeySource {
        &self.key
    }

    pub(crate) fn parent_source(&self) -> Option<&ParentSource> {
        self.parent.as_ref()
    }

    /// Evaluate the scope source against an instance.
    pub fn scope_for(&self, instance: &dyn Lockable) -> Result<String, LockError> {
        match &self.scope {
            ScopeSource::Literal(value) => Ok(value.clone()),
            ScopeSource::Attribute(name) => {
                instance.attribute(name).ok_or_else(|| missing_attribute(self, name, "scope"))
            }
            ScopeSource::Derived(derive) => Ok(derive(instance)),
        }
    }

    /// Evaluate the key source against an instance.
    pub fn key_for(&self, instance: &dyn Lockable) -> Result<String, LockError> {
        match &self.key {
            KeySource::Attribute(name) => {
                instance.attribute(name).ok_or_else(|| missing_attribute(self, name, "key"))
            }
            KeySource::Derived(derive) => Ok(derive(instance)),
        }
    }

    /// Evaluate the parent source against an instance. `Ok(None)` means the
    /// chain ends here; the caller decides whether that is legitimate (a
    /// root descriptor) or a broken configuration.
    pub fn parent_for(&self, instance: &dyn Lockable) -> Result<Option<Arc<dyn Lockable>>, LockError> {
        match &self.parent {
            None => Ok(None),
            Some(ParentSource::Related(name)) => Ok(instance.related(name)),
            Some(ParentSource::Derived(derive)) => Ok(derive(instance)),
        }
    }
}

fn missing_attribute(descriptor: &LockableDescriptor, name: &str, role: &str) -> LockError {
    InvalidConfigSnafu {
        class: descriptor.class_name.clone(),
        reason: format!("attribute '{name}' returned nothing for the lock {role}"),
    }
    .build()
}
