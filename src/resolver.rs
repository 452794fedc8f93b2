//! Resolves an arbitrary lockable to the root whose identity keys the lock.
//!
//! Traversal follows parent references until a root descriptor is reached,
//! remembering visited class names. The walk is short (object-graph depth)
//! and happens entirely in memory; cycle detection fires before any store
//! interaction.

use std::sync::Arc;

use crate::error::{CircularLockSnafu, InvalidConfigSnafu, LockError};
use crate::lockable::{LockTunables, Lockable};
use crate::registry::LockRegistry;

/// The root lockable an instance resolved to: the identity that keys the
/// lock document, plus the root class's tunables.
///
/// Returned by a successful acquire so the matching release needs no
/// re-resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRoot {
    class_name: String,
    scope: String,
    key: String,
    tunables: LockTunables,
}

impl ResolvedRoot {
    /// Root class name; namespaces the re-entrancy table.
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// Scope half of the lock document identity.
    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Key half of the lock document identity.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Tunables of the root class, governing this acquisition.
    pub fn tunables(&self) -> &LockTunables {
        &self.tunables
    }

    /// Display name, `scope/key`.
    pub fn name(&self) -> String {
        format!("{}/{}", self.scope, self.key)
    }
}

/// Walk parent references from `instance` up to the root lockable and
/// evaluate the root descriptor's scope and key there.
pub(crate) fn resolve_root(
    registry: &LockRegistry,
    instance: &dyn Lockable,
) -> Result<ResolvedRoot, LockError> {
    let mut chain = vec![instance.class_name().to_string()];
    let mut descriptor = Arc::clone(registry.descriptor_for(instance.class_name())?);
    let mut parent = descriptor.parent_for(instance)?;
    // Keeps the instance the walk currently points at alive; `None` while we
    // are still on the borrowed starting instance.
    let mut holder: Option<Arc<dyn Lockable>> = None;

    while let Some(next) = parent {
        let class = next.class_name().to_string();
        if chain.contains(&class) {
            chain.push(class);
            return CircularLockSnafu { chain }.fail();
        }
        descriptor = Arc::clone(registry.descriptor_for(&class)?);
        chain.push(class);
        parent = descriptor.parent_for(next.as_ref())?;
        holder = Some(next);
    }

    // The chain legitimately ends only on a root descriptor. A configured
    // parent that evaluated to nothing lands here too, and that is broken
    // configuration, not a root.
    if !descriptor.is_root() {
        return InvalidConfigSnafu {
            class: descriptor.class_name().to_string(),
            reason: "parent chain ended at a non-root class",
        }
        .fail();
    }

    let root: &dyn Lockable = match &holder {
        Some(instance) => instance.as_ref(),
        None => instance,
    };
    Ok(ResolvedRoot {
        class_name: descriptor.class_name().to_string(),
        scope: descriptor.scope_for(root)?,
        key: descriptor.key_for(root)?,
        tunables: descriptor.tunables().clone(),
    })
}
