use std::sync::Arc;

use log::warn;
use parking_lot::RwLock;

use crate::{
    hooks::HookRef,
    registry::{Registry, RegistryRef, RegistryResolver, RegistryValue, Result},
};

/// Builds a snapshot registry holding the union of the given match
/// identifiers, preserving the tree shape and tags of the source so the
/// same patterns resolve against it.
///
/// Flat `f32` parameter buffers are copied; other values and child
/// registries are shared by handle, so hooks needing frozen numbers must
/// list the owning buffers explicitly.
pub fn snapshot_registry(
    resolver: &Arc<RegistryResolver>,
    patterns: &[String],
) -> Result<RegistryRef> {
    let root = resolver.root();
    let snapshot = Registry::root(root.tags());

    for pattern in patterns {
        for entry in resolver.resolve_entries(pattern)? {
            let Some(destination) = mirror_path(root, &snapshot, &entry.path) else {
                // The tree changed under us; skip the stale match.
                continue;
            };
            if let Some(value) = entry.registry.get(&entry.key) {
                destination.set(&entry.key, snapshot_value(value)).ok();
            }
        }
    }
    Ok(snapshot)
}

/// Recreates the ancestor chain of `path` (all but the final key) under
/// `snapshot`, copying each level's tags from the source tree.
fn mirror_path(
    source_root: &RegistryRef,
    snapshot: &RegistryRef,
    path: &[String],
) -> Option<RegistryRef> {
    let mut source = Arc::clone(source_root);
    let mut destination = Arc::clone(snapshot);

    for segment in &path[..path.len() - 1] {
        let source_child = source.get_child(segment)?;
        destination = match destination.get_child(segment) {
            Some(existing) => existing,
            None => destination.child(segment, source_child.tags()),
        };
        source = source_child;
    }
    Some(destination)
}

fn snapshot_value(value: RegistryValue) -> RegistryValue {
    match value {
        RegistryValue::Value(v) => match v.clone().downcast::<RwLock<Vec<f32>>>() {
            Ok(buffer) => RegistryValue::Value(Arc::new(RwLock::new(buffer.read().clone()))),
            Err(_) => RegistryValue::Value(v),
        },
        child @ RegistryValue::Child(_) => child,
    }
}

/// Hands a batch of due background hooks to the process-wide task pool.
///
/// `batch` carries `(invocation_target, hook)` pairs in invocation-index
/// order. One snapshot registry is computed for the whole batch; hooks
/// sharing a target run serially in index order on one task, distinct
/// targets run concurrently. Failures are contained within their task.
pub fn dispatch(batch: Vec<(usize, HookRef)>, resolver: &Arc<RegistryResolver>) {
    if batch.is_empty() {
        return;
    }

    let mut patterns: Vec<String> = Vec::new();
    for (_, hook) in &batch {
        for entry in hook.required_registry_entries() {
            if !patterns.contains(&entry) {
                patterns.push(entry);
            }
        }
    }

    let snapshot = match snapshot_registry(resolver, &patterns) {
        Ok(snapshot) => snapshot,
        Err(e) => {
            warn!("background batch dropped, snapshot failed: {e}");
            return;
        }
    };
    let snapshot_resolver = RegistryResolver::new(Arc::clone(&snapshot));

    let mut buckets: Vec<(usize, Vec<HookRef>)> = Vec::new();
    for (target, hook) in batch {
        match buckets.iter_mut().find(|(t, _)| *t == target) {
            Some((_, bucket)) => bucket.push(hook),
            None => buckets.push((target, vec![hook])),
        }
    }

    for (_, bucket) in buckets {
        let registry = Arc::clone(&snapshot);
        let bucket_resolver = Arc::clone(&snapshot_resolver);

        rayon::spawn(move || {
            for hook in bucket {
                if let Err(e) = hook.invoke(&registry, &bucket_resolver) {
                    warn!("background hook failed: {e}");
                }
            }
        });
    }
}
