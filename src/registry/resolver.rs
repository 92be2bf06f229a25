use std::{
    any::Any,
    collections::HashMap,
    sync::{Arc, Weak},
};

use parking_lot::Mutex;

use super::{AnyValue, HierarchyListener, RegistryErr, RegistryRef, RegistryValue, Result};

/// One resolved match: the registry owning the entry, the local key, and the
/// full dotted path from the resolver's root.
#[derive(Clone)]
pub struct ResolvedEntry {
    pub path: Vec<String>,
    pub registry: RegistryRef,
    pub key: String,
}

impl ResolvedEntry {
    pub fn identifier(&self) -> String {
        self.path.join(".")
    }

    pub fn value(&self) -> Option<RegistryValue> {
        self.registry.get(&self.key)
    }
}

#[derive(Clone)]
struct Resolution {
    matches: Vec<ResolvedEntry>,
    /// Registries reached at the terminal level where no key matched.
    /// `resolve_set` uses these for create-if-missing writes.
    unmatched: Vec<RegistryRef>,
    /// Every owning registry plus all of its ancestors. A hierarchy change
    /// to any of these drops the cached entry.
    referred: Vec<RegistryRef>,
}

enum Matcher {
    Literal(String),
    Any,
}

struct Segment {
    matcher: Matcher,
    tags: Option<Vec<String>>,
}

impl Segment {
    fn matches(&self, key: &str) -> bool {
        match &self.matcher {
            Matcher::Literal(lit) => lit == key,
            Matcher::Any => true,
        }
    }

    fn admits(&self, registry: &RegistryRef) -> bool {
        match &self.tags {
            Some(tags) => registry.has_tags(tags),
            None => true,
        }
    }

    fn is_unrestricted_wildcard(&self) -> bool {
        matches!(self.matcher, Matcher::Any) && self.tags.is_none()
    }
}

fn malformed(pattern: &str, reason: &'static str) -> RegistryErr {
    RegistryErr::MalformedPattern {
        pattern: pattern.to_string(),
        reason,
    }
}

/// Parses a dotted match identifier into per-level segments.
///
/// Each segment is a literal, the wildcard `*`, or a tagged wildcard
/// `*<t1,t2>` admitting only registries whose tag set is a superset of the
/// predicate.
fn parse(pattern: &str) -> Result<Vec<Segment>> {
    if pattern.is_empty() {
        return Err(malformed(pattern, "identifier is empty"));
    }

    pattern
        .split('.')
        .map(|seg| {
            if seg.is_empty() {
                return Err(malformed(pattern, "empty segment"));
            }

            match (seg.find('<'), seg.find('>')) {
                (None, None) if seg == "*" => Ok(Segment {
                    matcher: Matcher::Any,
                    tags: None,
                }),
                (None, None) => Ok(Segment {
                    matcher: Matcher::Literal(seg.to_string()),
                    tags: None,
                }),
                (None, Some(_)) => Err(malformed(pattern, "tag predicate ends before it starts")),
                (Some(_), None) => Err(malformed(pattern, "unclosed tag predicate")),
                (Some(lt), Some(gt)) if gt < lt => {
                    Err(malformed(pattern, "tag predicate ends before it starts"))
                }
                (Some(_), Some(gt)) => {
                    if !seg.starts_with("*<") || gt != seg.len() - 1 {
                        return Err(malformed(pattern, "tag predicate must follow a wildcard"));
                    }

                    let tags: Vec<String> = seg[2..gt]
                        .split(',')
                        .map(|t| t.trim().to_string())
                        .collect();
                    if tags.iter().any(String::is_empty) {
                        return Err(malformed(pattern, "empty tag in predicate"));
                    }

                    Ok(Segment {
                        matcher: Matcher::Any,
                        tags: Some(tags),
                    })
                }
            }
        })
        .collect()
}

/// Checks that `pattern` is a well-formed match identifier.
pub fn validate_pattern(pattern: &str) -> Result<()> {
    parse(pattern).map(|_| ())
}

/// Wildcard- and tag-aware lookup over a registry tree, with cached,
/// invalidation-aware results.
///
/// The resolver registers itself as a hierarchy listener on its root; any
/// structural change drops the cache entries whose referred set contains the
/// mutated registry.
pub struct RegistryResolver {
    root: RegistryRef,
    cache: Mutex<HashMap<String, Resolution>>,
}

impl RegistryResolver {
    /// Binds a resolver to `root`.
    pub fn new(root: RegistryRef) -> Arc<Self> {
        let resolver = Arc::new(Self {
            root: Arc::clone(&root),
            cache: Mutex::new(HashMap::new()),
        });
        root.add_listener(Arc::downgrade(&resolver) as Weak<dyn HierarchyListener>);
        resolver
    }

    pub fn root(&self) -> &RegistryRef {
        &self.root
    }

    /// Resolves `pattern` to the registry entries it matches.
    pub fn resolve_entries(&self, pattern: &str) -> Result<Vec<ResolvedEntry>> {
        Ok(self.resolve(pattern)?.matches)
    }

    /// Resolves `pattern` and downcasts every matched value to `T`.
    ///
    /// Entries holding child registries or values of another type are
    /// skipped.
    pub fn resolve_get<T: Any + Send + Sync>(&self, pattern: &str) -> Result<Vec<Arc<T>>> {
        let resolution = self.resolve(pattern)?;

        Ok(resolution
            .matches
            .iter()
            .filter_map(|entry| match entry.value()? {
                RegistryValue::Value(v) => v.downcast::<T>().ok(),
                RegistryValue::Child(_) => None,
            })
            .collect())
    }

    /// Resolves `pattern` to exactly one value of type `T`.
    ///
    /// # Errors
    /// `NotFound` when the pattern matches nothing of that type.
    pub fn resolve_get_single<T: Any + Send + Sync>(&self, pattern: &str) -> Result<Arc<T>> {
        self.resolve_get::<T>(pattern)?
            .into_iter()
            .next()
            .ok_or_else(|| RegistryErr::NotFound {
                pattern: pattern.to_string(),
            })
    }

    /// Writes `value` to every entry matching `pattern`.
    ///
    /// With `add_if_missing`, a literal terminal segment is created in every
    /// registry the pattern reached but did not match in.
    ///
    /// # Returns
    /// The number of entries written.
    pub fn resolve_set(
        &self,
        pattern: &str,
        value: AnyValue,
        add_if_missing: bool,
    ) -> Result<usize> {
        let segments = parse(pattern)?;
        let resolution = self.resolve(pattern)?;
        let mut written = 0;

        for entry in &resolution.matches {
            entry.registry.set_value(&entry.key, Arc::clone(&value))?;
            written += 1;
        }

        if written == 0 && add_if_missing {
            if let Matcher::Literal(key) = &segments[segments.len() - 1].matcher {
                for registry in &resolution.unmatched {
                    registry.set_value(key, Arc::clone(&value))?;
                    written += 1;
                }
            }
        }

        if written > 0 {
            // The cached match set no longer reflects the tree.
            self.cache.lock().remove(pattern);
        }
        Ok(written)
    }

    fn resolve(&self, pattern: &str) -> Result<Resolution> {
        if let Some(hit) = self.cache.lock().get(pattern) {
            return Ok(hit.clone());
        }

        let segments = parse(pattern)?;
        let mut resolution = Resolution {
            matches: Vec::new(),
            unmatched: Vec::new(),
            referred: Vec::new(),
        };

        walk(&self.root, &segments, 0, &mut Vec::new(), &mut resolution);

        for entry in &resolution.matches {
            let mut node = Some(Arc::clone(&entry.registry));
            while let Some(current) = node {
                if !resolution.referred.iter().any(|r| Arc::ptr_eq(r, &current)) {
                    resolution.referred.push(Arc::clone(&current));
                }
                node = current.parent();
            }
        }

        let cacheable = !resolution.matches.is_empty()
            && !segments[segments.len() - 1].is_unrestricted_wildcard();
        if cacheable {
            self.cache
                .lock()
                .insert(pattern.to_string(), resolution.clone());
        }
        Ok(resolution)
    }
}

impl HierarchyListener for RegistryResolver {
    fn hierarchy_changed(&self, origin: &RegistryRef, replaced: &RegistryRef) {
        self.cache.lock().retain(|_, resolution| {
            !resolution
                .referred
                .iter()
                .any(|r| Arc::ptr_eq(r, origin) || Arc::ptr_eq(r, replaced))
        });
    }
}

fn walk(
    registry: &RegistryRef,
    segments: &[Segment],
    level: usize,
    path: &mut Vec<String>,
    out: &mut Resolution,
) {
    let segment = &segments[level];
    let last = level == segments.len() - 1;
    let mut matched_here = false;

    // Iterate a snapshot of the key set to tolerate concurrent inserts.
    for key in registry.keys() {
        if !segment.matches(&key) {
            continue;
        }

        match registry.get(&key) {
            Some(RegistryValue::Child(child)) if !last => {
                if segment.admits(&child) {
                    path.push(key);
                    walk(&child, segments, level + 1, path, out);
                    path.pop();
                }
            }
            Some(value) if last => {
                if let RegistryValue::Child(child) = &value {
                    if !segment.admits(child) {
                        continue;
                    }
                }

                let mut full_path = path.clone();
                full_path.push(key.clone());
                out.matches.push(ResolvedEntry {
                    path: full_path,
                    registry: Arc::clone(registry),
                    key,
                });
                matched_here = true;
            }
            _ => {}
        }
    }

    if last && !matched_here {
        out.unmatched.push(Arc::clone(registry));
    }
}
