mod error;
pub mod resolver;

use std::{
    any::{Any, TypeId},
    collections::{HashMap, HashSet},
    sync::{Arc, Weak},
};

use parking_lot::{Mutex, RwLock};

pub use error::{RegistryErr, Result};
pub use resolver::{validate_pattern, RegistryResolver, ResolvedEntry};

/// An opaque value held by a registry.
pub type AnyValue = Arc<dyn Any + Send + Sync>;

/// Shared handle to a registry node.
pub type RegistryRef = Arc<Registry>;

/// A flat `f32` parameter buffer, the exchange format for trainable state.
pub type ParamBuffer = Arc<RwLock<Vec<f32>>>;

/// A single registry entry: either an opaque value or a nested registry.
#[derive(Clone)]
pub enum RegistryValue {
    Value(AnyValue),
    Child(RegistryRef),
}

/// Observer of structural changes in a registry tree.
///
/// Fired whenever a child registry is replaced or removed. Notifications
/// bubble from the mutated registry up through its ancestors, so a listener
/// attached to the root observes every change in the tree.
pub trait HierarchyListener: Send + Sync {
    /// # Args
    /// * `origin` - The registry whose entry changed.
    /// * `replaced` - The child registry that was detached by the change.
    fn hierarchy_changed(&self, origin: &RegistryRef, replaced: &RegistryRef);
}

struct Slot {
    value: RegistryValue,
    ty: Option<TypeId>,
}

/// A tagged, hierarchical key/value store.
///
/// Values may themselves be registries, forming a tree with weak parent
/// back-edges. Each key may carry a type association that rejects future
/// writes of an incompatible type. Used both as the hook invocation context
/// and as the snapshotting substrate.
pub struct Registry {
    tags: HashSet<String>,
    parent: RwLock<Weak<Registry>>,
    entries: RwLock<HashMap<String, Slot>>,
    listeners: Mutex<Vec<Weak<dyn HierarchyListener>>>,
}

impl Registry {
    /// Creates a detached root registry with the given role tags.
    pub fn root<I, S>(tags: I) -> RegistryRef
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Arc::new(Self {
            tags: tags.into_iter().map(Into::into).collect(),
            parent: RwLock::new(Weak::new()),
            entries: RwLock::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
        })
    }

    /// Creates a child registry under `key` and links it into the tree.
    ///
    /// Replacing an existing child notifies hierarchy listeners.
    pub fn child<I, S>(self: &Arc<Self>, key: &str, tags: I) -> RegistryRef
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let child = Registry::root(tags);
        *child.parent.write() = Arc::downgrade(self);
        self.set(key, RegistryValue::Child(Arc::clone(&child)))
            .expect("child entries carry no type association");
        child
    }

    pub fn tags(&self) -> Vec<String> {
        self.tags.iter().cloned().collect()
    }

    /// Whether this registry's tag set is a superset of `required`.
    pub fn has_tags(&self, required: &[String]) -> bool {
        required.iter().all(|t| self.tags.contains(t))
    }

    pub fn parent(&self) -> Option<RegistryRef> {
        self.parent.read().upgrade()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }

    pub fn get(&self, key: &str) -> Option<RegistryValue> {
        self.entries.read().get(key).map(|s| s.value.clone())
    }

    /// Fetches a value and downcasts it to `T`.
    pub fn get_as<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        match self.get(key)? {
            RegistryValue::Value(v) => v.downcast::<T>().ok(),
            RegistryValue::Child(_) => None,
        }
    }

    pub fn get_child(&self, key: &str) -> Option<RegistryRef> {
        match self.get(key)? {
            RegistryValue::Child(c) => Some(c),
            RegistryValue::Value(_) => None,
        }
    }

    /// Snapshot of the current key set.
    ///
    /// Resolution iterates this copy so concurrent inserts are tolerated.
    pub fn keys(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    pub fn values(&self) -> Vec<RegistryValue> {
        self.entries.read().values().map(|s| s.value.clone()).collect()
    }

    /// Writes `value` under `key`.
    ///
    /// Fails with `TypeMismatch` when the key carries a type association the
    /// value does not satisfy. Replacing a child registry notifies hierarchy
    /// listeners up the ancestor chain.
    pub fn set(self: &Arc<Self>, key: &str, value: RegistryValue) -> Result<()> {
        self.set_slot(key, value, None)
    }

    /// Writes `value` and associates the key with type `T` for all future writes.
    pub fn set_typed<T: Any>(self: &Arc<Self>, key: &str, value: AnyValue) -> Result<()> {
        self.set_slot(key, RegistryValue::Value(value), Some(TypeId::of::<T>()))
    }

    /// Convenience wrapper around `set` for opaque values.
    pub fn set_value(self: &Arc<Self>, key: &str, value: AnyValue) -> Result<()> {
        self.set(key, RegistryValue::Value(value))
    }

    fn set_slot(
        self: &Arc<Self>,
        key: &str,
        value: RegistryValue,
        ty: Option<TypeId>,
    ) -> Result<()> {
        let replaced_child = {
            let mut entries = self.entries.write();

            let ty = ty.or_else(|| entries.get(key).and_then(|s| s.ty));
            if let (Some(expected), RegistryValue::Value(v)) = (ty, &value) {
                if (**v).type_id() != expected {
                    return Err(RegistryErr::TypeMismatch {
                        key: key.to_string(),
                    });
                }
            }

            if let RegistryValue::Child(child) = &value {
                // First link wins: a registry mounted under several parents
                // (e.g. a shared channel) keeps bubbling to its original
                // root.
                let mut parent = child.parent.write();
                if parent.upgrade().is_none() {
                    *parent = Arc::downgrade(self);
                }
            }

            let previous = entries.insert(key.to_string(), Slot { value, ty });

            match previous {
                Some(Slot {
                    value: RegistryValue::Child(c),
                    ..
                }) => Some(c),
                _ => None,
            }
        };

        if let Some(replaced) = replaced_child {
            self.notify_hierarchy_changed(&replaced);
        }
        Ok(())
    }

    /// Removes `key`, notifying listeners when the removed entry was a child.
    pub fn remove(self: &Arc<Self>, key: &str) -> Option<RegistryValue> {
        let removed = self.entries.write().remove(key).map(|s| s.value);

        if let Some(RegistryValue::Child(child)) = &removed {
            self.notify_hierarchy_changed(child);
        }
        removed
    }

    pub fn add_listener(&self, listener: Weak<dyn HierarchyListener>) {
        self.listeners.lock().push(listener);
    }

    /// Bubbles a hierarchy change through this registry and its ancestors.
    fn notify_hierarchy_changed(self: &Arc<Self>, replaced: &RegistryRef) {
        let mut node = Some(Arc::clone(self));

        while let Some(current) = node {
            let listeners: Vec<_> = {
                let mut guard = current.listeners.lock();
                guard.retain(|w| w.strong_count() > 0);
                guard.iter().filter_map(Weak::upgrade).collect()
            };

            for listener in listeners {
                listener.hierarchy_changed(self, replaced);
            }
            node = current.parent();
        }
    }
}
