//! Registry of lockable class descriptors.
//!
//! Classes register once at process init; the registry is read-only from
//! then on (the service takes it by value and shares it immutably). All
//! registration-parameter validation happens here, so a descriptor that made
//! it into the registry can always be evaluated; runtime failures are then
//! about live instances, not about the registration itself.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{InvalidConfigSnafu, InvalidRegistrationSnafu, LockError};
use crate::lockable::{KeySource, LockableDescriptor, ParentSource, ScopeSource};

/// Process-local set of registered lockable classes.
#[derive(Debug, Default)]
pub struct LockRegistry {
    classes: HashMap<String, Arc<LockableDescriptor>>,
}

impl LockRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a class descriptor, validating its parameters.
    pub fn register(&mut self, descriptor: LockableDescriptor) -> Result<(), LockError> {
        validate(&descriptor)?;
        let class = descriptor.class_name().to_string();
        if self.classes.contains_key(&class) {
            return InvalidRegistrationSnafu {
                class,
                reason: "class is already registered",
            }
            .fail();
        }
        self.classes.insert(class, Arc::new(descriptor));
        Ok(())
    }

    /// Whether a class has been registered.
    pub fn contains(&self, class_name: &str) -> bool {
        self.classes.contains_key(class_name)
    }

    /// Look up the descriptor for a class.
    pub fn descriptor_for(&self, class_name: &str) -> Result<&Arc<LockableDescriptor>, LockError> {
        self.classes.get(class_name).ok_or_else(|| {
            InvalidConfigSnafu {
                class: class_name.to_string(),
                reason: "class is not registered as lockable",
            }
            .build()
        })
    }
}

fn validate(descriptor: &LockableDescriptor) -> Result<(), LockError> {
    let reject = |reason: &str| {
        InvalidRegistrationSnafu {
            class: descriptor.class_name().to_string(),
            reason: reason.to_string(),
        }
        .fail()
    };

    if descriptor.class_name().is_empty() {
        return reject("class name must not be empty");
    }
    match descriptor.scope_source() {
        ScopeSource::Literal(value) if value.is_empty() => {
            return reject("literal scope must not be empty");
        }
        ScopeSource::Attribute(name) if name.is_empty() => {
            return reject("scope attribute name must not be empty");
        }
        _ => {}
    }
    if let KeySource::Attribute(name) = descriptor.key_source()
        && name.is_empty()
    {
        return reject("key attribute name must not be empty");
    }
    if let Some(ParentSource::Related(name)) = descriptor.parent_source()
        && name.is_empty()
    {
        return reject("parent accessor name must not be empty");
    }

    let tunables = descriptor.tunables();
    if tunables.max_retries == 0 {
        return reject("max_retries must be at least 1");
    }
    if tunables.first_retry_interval.is_zero() {
        return reject("first_retry_interval must be positive");
    }
    if tunables.max_retry_interval < tunables.first_retry_interval {
        return reject("max_retry_interval must be at least first_retry_interval");
    }
    if tunables.max_lifetime.is_zero() {
        return reject("max_lifetime must be positive");
    }
    Ok(())
}
