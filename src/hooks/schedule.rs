use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use log::warn;

use crate::{
    error::{OperatorErr, Result},
    hooks::{hook_key, HookRef, LocalTimeStep, TimeScale},
    registry::{validate_pattern, RegistryRef, RegistryResolver},
};

/// One tier of hook bookkeeping (the operator keeps one schedule for local
/// hooks and one for global hooks).
///
/// Tracks attach order, per-time-scale buckets, the required-hook DAG with
/// reverse edges, the derived invocation index/target assignment, and the
/// per-worker liveness vectors of local hooks.
#[derive(Default)]
pub struct HookSchedule {
    hooks: Vec<HookRef>,
    by_scale: HashMap<TimeScale, Vec<HookRef>>,
    index: HashMap<usize, usize>,
    target: HashMap<usize, usize>,
    /// Reverse edges: required hook -> hooks depending on it.
    dependents: HashMap<usize, Vec<usize>>,
    /// Forward edges, resolved through functional equivalents at attach time.
    requirements: HashMap<usize, Vec<usize>>,
    /// Hooks attached by the caller, as opposed to pulled in as requirements.
    /// Only implicitly attached hooks cascade away with their last dependent.
    explicit: HashSet<usize>,
    /// Per-worker aliveness of local hooks, initialized all-alive on first
    /// touch.
    alive: HashMap<usize, Vec<bool>>,
}

impl HookSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hooks(&self) -> Vec<HookRef> {
        self.hooks.clone()
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    pub fn contains(&self, hook: &HookRef) -> bool {
        let key = hook_key(hook);
        self.hooks.iter().any(|h| hook_key(h) == key)
    }

    /// Position of `hook` in the derived invocation order.
    pub fn invocation_index(&self, hook: &HookRef) -> Result<usize> {
        self.index
            .get(&hook_key(hook))
            .copied()
            .ok_or(OperatorErr::UnknownHook)
    }

    /// Background bucket of `hook`; foreground hooks are always in target 0.
    pub fn invocation_target(&self, hook: &HookRef) -> Result<usize> {
        self.target
            .get(&hook_key(hook))
            .copied()
            .ok_or(OperatorErr::UnknownHook)
    }

    /// Attaches `hook` together with its required subtree.
    ///
    /// # Returns
    /// `false` when the hook is already physically attached or a functional
    /// equivalent is.
    ///
    /// # Errors
    /// `InvalidHook` when the required-hook graph is cyclic or a background
    /// hook declares a malformed registry entry; attachment leaves no
    /// partial state behind in that case.
    pub fn attach(&mut self, hook: HookRef) -> Result<bool> {
        validate(&hook)?;

        let accepted = self.attach_resolved(hook, true).1;
        if accepted {
            self.rebuild();
        }
        Ok(accepted)
    }

    /// Attaches `hook`, resolving it to an attached functional equivalent if
    /// one exists.
    ///
    /// # Returns
    /// The identity key the hook resolved to, and whether a new attachment
    /// happened.
    fn attach_resolved(&mut self, hook: HookRef, explicit: bool) -> (usize, bool) {
        let key = hook_key(&hook);

        if self.contains(&hook) {
            return (key, false);
        }
        if let Some(equivalent) = self
            .hooks
            .iter()
            .find(|h| h.functionally_equals(hook.as_ref()))
        {
            return (hook_key(equivalent), false);
        }

        self.hooks.push(hook.clone());
        self.by_scale
            .entry(hook.time_step().time_scale)
            .or_default()
            .push(hook.clone());
        if explicit {
            self.explicit.insert(key);
        }

        for required in hook.required_hooks() {
            let (resolved, _) = self.attach_resolved(required, false);

            let requirements = self.requirements.entry(key).or_default();
            if !requirements.contains(&resolved) {
                requirements.push(resolved);
            }
            let dependents = self.dependents.entry(resolved).or_default();
            if !dependents.contains(&key) {
                dependents.push(key);
            }
        }
        (key, true)
    }

    /// Detaches `hook`, cascading through requirements that were only
    /// attached on its behalf.
    ///
    /// # Returns
    /// `false` when the hook was not attached.
    ///
    /// # Errors
    /// `RequiredByDependents` while any attached hook still requires it.
    pub fn detach(&mut self, hook: &HookRef) -> Result<bool> {
        let key = hook_key(hook);
        if !self.contains(hook) {
            return Ok(false);
        }

        let dependents = self.dependents.get(&key).map_or(0, Vec::len);
        if dependents > 0 {
            return Err(OperatorErr::RequiredByDependents { dependents });
        }

        self.detach_by_key(key);
        self.rebuild();
        Ok(true)
    }

    /// Detaches `hook` even when dependents exist, removing them first.
    /// Used by liveness auto-detach.
    pub fn force_detach(&mut self, hook: &HookRef) {
        self.force_detach_by_key(hook_key(hook));
        self.rebuild();
    }

    fn force_detach_by_key(&mut self, key: usize) {
        while let Some(&dependent) = self.dependents.get(&key).and_then(|d| d.first()) {
            self.force_detach_by_key(dependent);
        }
        self.detach_by_key(key);
    }

    fn detach_by_key(&mut self, key: usize) {
        self.hooks.retain(|h| hook_key(h) != key);
        for bucket in self.by_scale.values_mut() {
            bucket.retain(|h| hook_key(h) != key);
        }
        self.explicit.remove(&key);
        self.alive.remove(&key);
        self.dependents.remove(&key);

        for required in self.requirements.remove(&key).unwrap_or_default() {
            let now_unrequired = match self.dependents.get_mut(&required) {
                Some(dependents) => {
                    dependents.retain(|&d| d != key);
                    dependents.is_empty()
                }
                None => false,
            };

            if now_unrequired && !self.explicit.contains(&required) {
                self.detach_by_key(required);
            }
        }
    }

    /// Declares `hook` dead in worker `worker`. The liveness vector is
    /// initialized all-alive on first touch; once every flag is false the
    /// hook is auto-detached, cascading through its dependents.
    ///
    /// # Returns
    /// Whether the hook was auto-detached by this call.
    pub fn mark_dead(
        &mut self,
        hook: &HookRef,
        worker: usize,
        worker_count: usize,
    ) -> Result<bool> {
        if !self.contains(hook) {
            return Err(OperatorErr::UnknownHook);
        }

        let flags = self
            .alive
            .entry(hook_key(hook))
            .or_insert_with(|| vec![true; worker_count]);
        flags[worker] = false;

        if flags.iter().any(|&alive| alive) {
            return Ok(false);
        }
        self.force_detach(hook);
        Ok(true)
    }

    /// Selects the hooks due on one tick of `scale`, advancing the live
    /// time-step copies in `steps` (one map per evaluation site).
    ///
    /// The result is ordered by invocation index.
    pub fn eject(
        &self,
        scale: TimeScale,
        steps: &mut HashMap<usize, LocalTimeStep>,
    ) -> Vec<HookRef> {
        let Some(bucket) = self.by_scale.get(&scale) else {
            return Vec::new();
        };

        let mut due: Vec<HookRef> = bucket
            .iter()
            .filter(|hook| {
                steps
                    .entry(hook_key(hook))
                    .or_insert_with(|| LocalTimeStep::new(hook.time_step()))
                    .tick()
            })
            .cloned()
            .collect();

        due.sort_by_key(|hook| self.index.get(&hook_key(hook)).copied().unwrap_or(usize::MAX));
        due
    }

    /// Attached hooks whose live time-step copy in `steps` has expired.
    pub fn expired(&self, steps: &HashMap<usize, LocalTimeStep>) -> Vec<HookRef> {
        self.hooks
            .iter()
            .filter(|hook| {
                steps
                    .get(&hook_key(hook))
                    .is_some_and(LocalTimeStep::expired)
            })
            .cloned()
            .collect()
    }

    /// Recomputes invocation indices and targets for the current hook set.
    ///
    /// Hooks are placed by a post-order walk of each root's required
    /// subtree, so requirements always precede their dependents. Foreground
    /// hooks land in target 0; each background root opens a fresh target
    /// unless its required closure already contains a placed background
    /// hook, whose target it joins.
    fn rebuild(&mut self) {
        let mut placed: HashMap<usize, usize> = HashMap::new();
        let mut order: Vec<usize> = Vec::new();
        let mut next_target = 1;

        for root in &self.hooks {
            let key = hook_key(root);
            if placed.contains_key(&key) {
                continue;
            }

            let target = if root.invoke_in_background() {
                match self.inherited_target(key, &placed) {
                    Some(existing) => existing,
                    None => {
                        let fresh = next_target;
                        next_target += 1;
                        fresh
                    }
                }
            } else {
                0
            };

            self.place_post_order(key, target, &mut placed, &mut order);
        }

        self.index = order.iter().enumerate().map(|(i, &k)| (k, i)).collect();
        self.target = placed;
    }

    /// Lowest already-assigned background target in `key`'s required
    /// closure, if any.
    fn inherited_target(&self, key: usize, placed: &HashMap<usize, usize>) -> Option<usize> {
        let mut stack = vec![key];
        let mut seen = HashSet::new();
        let mut found: Option<usize> = None;

        while let Some(current) = stack.pop() {
            if !seen.insert(current) {
                continue;
            }
            if current != key {
                if let Some(&target) = placed.get(&current) {
                    if target != 0 {
                        found = Some(found.map_or(target, |t| t.min(target)));
                    }
                }
            }
            if let Some(required) = self.requirements.get(&current) {
                stack.extend(required.iter().copied());
            }
        }
        found
    }

    fn place_post_order(
        &self,
        key: usize,
        target: usize,
        placed: &mut HashMap<usize, usize>,
        order: &mut Vec<usize>,
    ) {
        if placed.contains_key(&key) {
            return;
        }
        // Reserve before recursing; requirement cycles are rejected at
        // attach time, this guards the walk anyway.
        placed.insert(key, target);

        for &required in self.requirements.get(&key).into_iter().flatten() {
            self.place_post_order(required, target, placed, order);
        }
        order.push(key);
    }

    /// Runs the foreground slice of `due` inline, in invocation order.
    /// Failures are logged and do not stop later hooks.
    pub fn invoke_foreground(
        due: &[HookRef],
        registry: &RegistryRef,
        resolver: &Arc<RegistryResolver>,
    ) {
        for hook in due.iter().filter(|h| !h.invoke_in_background()) {
            if let Err(e) = hook.invoke(registry, resolver) {
                warn!("foreground hook failed: {e}");
            }
        }
    }
}

/// Rejects hooks the scheduler cannot soundly run: cyclic requirement
/// graphs, and background hooks whose snapshot entries do not parse.
///
/// Walks the full requirement closure so a defect anywhere in the subtree
/// fails the attachment before any state is touched.
fn validate(hook: &HookRef) -> Result<()> {
    let mut path = Vec::new();
    check_subtree(hook, &mut path)
}

fn check_subtree(hook: &HookRef, path: &mut Vec<usize>) -> Result<()> {
    let key = hook_key(hook);
    if path.contains(&key) {
        return Err(OperatorErr::InvalidHook {
            reason: "required hooks form a cycle".to_string(),
        });
    }

    if hook.invoke_in_background() {
        for entry in hook.required_registry_entries() {
            validate_pattern(&entry).map_err(|e| OperatorErr::InvalidHook {
                reason: format!("bad required registry entry: {e}"),
            })?;
        }
    }

    path.push(key);
    for required in hook.required_hooks() {
        check_subtree(&required, path)?;
    }
    path.pop();
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        hooks::{Hook, TimeStep},
        registry::{RegistryRef, RegistryResolver},
    };

    struct StubHook {
        name: &'static str,
        step: TimeStep,
        background: bool,
        requires: Vec<HookRef>,
    }

    impl StubHook {
        fn new(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                step: TimeStep::every(TimeScale::Iteration),
                background: false,
                requires: Vec::new(),
            })
        }

        fn background(name: &'static str) -> Arc<Self> {
            Arc::new(Self {
                name,
                step: TimeStep::every(TimeScale::Iteration),
                background: true,
                requires: Vec::new(),
            })
        }

        fn requiring(name: &'static str, background: bool, requires: Vec<HookRef>) -> Arc<Self> {
            Arc::new(Self {
                name,
                step: TimeStep::every(TimeScale::Iteration),
                background,
                requires,
            })
        }
    }

    impl Hook for StubHook {
        fn time_step(&self) -> TimeStep {
            self.step
        }

        fn invoke_in_background(&self) -> bool {
            self.background
        }

        fn required_hooks(&self) -> Vec<HookRef> {
            self.requires.clone()
        }

        fn functionally_equals(&self, other: &dyn Hook) -> bool {
            let other: &dyn std::any::Any = other;
            other
                .downcast_ref::<Self>()
                .is_some_and(|o| o.name == self.name)
        }

        fn invoke(
            &self,
            _registry: &RegistryRef,
            _resolver: &Arc<RegistryResolver>,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn functional_duplicates_are_rejected() {
        let mut schedule = HookSchedule::new();
        let a: HookRef = StubHook::new("loss");
        let b: HookRef = StubHook::new("loss");

        assert!(schedule.attach(a.clone()).unwrap());
        assert!(!schedule.attach(a.clone()).unwrap());
        assert!(!schedule.attach(b).unwrap());
        assert_eq!(schedule.len(), 1);
    }

    #[test]
    fn requirements_resolve_to_attached_equivalents() {
        let mut schedule = HookSchedule::new();
        let a: HookRef = StubHook::new("loss");
        let b: HookRef = StubHook::new("loss");
        let c: HookRef = StubHook::requiring("report", false, vec![b]);

        assert!(schedule.attach(a.clone()).unwrap());
        assert!(schedule.attach(c).unwrap());
        // B resolved to A, so only A and C are attached.
        assert_eq!(schedule.len(), 2);

        let err = schedule.detach(&a);
        assert!(matches!(
            err,
            Err(OperatorErr::RequiredByDependents { dependents: 1 })
        ));
    }

    #[test]
    fn detach_cascades_through_implicit_requirements_only() {
        let mut schedule = HookSchedule::new();
        let a: HookRef = StubHook::new("snapshot");
        let c: HookRef = StubHook::requiring("report", false, vec![a.clone()]);

        // A arrives implicitly through C; detaching C takes A with it.
        assert!(schedule.attach(c.clone()).unwrap());
        assert_eq!(schedule.len(), 2);
        assert!(schedule.detach(&c).unwrap());
        assert!(schedule.is_empty());

        // Explicitly attached requirements survive their dependents.
        let a2: HookRef = StubHook::new("snapshot");
        let c2: HookRef = StubHook::requiring("report", false, vec![a2.clone()]);
        assert!(schedule.attach(a2.clone()).unwrap());
        assert!(schedule.attach(c2.clone()).unwrap());
        assert!(schedule.detach(&c2).unwrap());
        assert!(schedule.contains(&a2));
        assert_eq!(schedule.len(), 1);
    }

    #[test]
    fn requirements_precede_dependents_in_invocation_order() {
        let mut schedule = HookSchedule::new();
        let a: HookRef = StubHook::new("base");
        let c: HookRef = StubHook::requiring("on-top", false, vec![a.clone()]);

        schedule.attach(c.clone()).unwrap();
        assert!(schedule.invocation_index(&a).unwrap() < schedule.invocation_index(&c).unwrap());
        assert_eq!(schedule.invocation_target(&a).unwrap(), 0);
        assert_eq!(schedule.invocation_target(&c).unwrap(), 0);
    }

    #[test]
    fn background_roots_get_isolated_targets() {
        let mut schedule = HookSchedule::new();
        let b1: HookRef = StubHook::background("b1");
        let b2: HookRef = StubHook::background("b2");

        schedule.attach(b1.clone()).unwrap();
        schedule.attach(b2.clone()).unwrap();
        assert_eq!(schedule.invocation_index(&b1).unwrap(), 0);
        assert_eq!(schedule.invocation_index(&b2).unwrap(), 1);
        let t1 = schedule.invocation_target(&b1).unwrap();
        let t2 = schedule.invocation_target(&b2).unwrap();
        assert_ne!(t1, 0);
        assert_ne!(t2, 0);
        assert_ne!(t1, t2);

        // B3 depends on B1 and must join its bucket without disturbing B2.
        let b3: HookRef = StubHook::requiring("b3", true, vec![b1.clone()]);
        schedule.attach(b3.clone()).unwrap();
        assert_eq!(schedule.invocation_target(&b3).unwrap(), t1);
        assert!(schedule.invocation_index(&b3).unwrap() > schedule.invocation_index(&b1).unwrap());
        assert_eq!(schedule.invocation_target(&b2).unwrap(), t2);
        assert_eq!(schedule.invocation_index(&b2).unwrap(), 1);
    }

    #[test]
    fn attach_then_detach_restores_previous_state() {
        let mut schedule = HookSchedule::new();
        let a: HookRef = StubHook::new("keep");
        let b: HookRef = StubHook::background("keep-bg");
        schedule.attach(a.clone()).unwrap();
        schedule.attach(b.clone()).unwrap();

        let index_before = (
            schedule.invocation_index(&a).unwrap(),
            schedule.invocation_index(&b).unwrap(),
        );
        let target_before = (
            schedule.invocation_target(&a).unwrap(),
            schedule.invocation_target(&b).unwrap(),
        );

        let extra: HookRef = StubHook::requiring("extra", true, vec![StubHook::new("dep")]);
        schedule.attach(extra.clone()).unwrap();
        schedule.detach(&extra).unwrap();

        assert_eq!(schedule.len(), 2);
        assert_eq!(
            (
                schedule.invocation_index(&a).unwrap(),
                schedule.invocation_index(&b).unwrap()
            ),
            index_before
        );
        assert_eq!(
            (
                schedule.invocation_target(&a).unwrap(),
                schedule.invocation_target(&b).unwrap()
            ),
            target_before
        );
    }

    struct CyclicHook {
        requires: parking_lot::Mutex<Vec<HookRef>>,
    }

    impl Hook for CyclicHook {
        fn time_step(&self) -> TimeStep {
            TimeStep::every(TimeScale::Iteration)
        }

        fn required_hooks(&self) -> Vec<HookRef> {
            self.requires.lock().clone()
        }

        fn functionally_equals(&self, _other: &dyn Hook) -> bool {
            false
        }

        fn invoke(
            &self,
            _registry: &RegistryRef,
            _resolver: &Arc<RegistryResolver>,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct BadSnapshotHook;

    impl Hook for BadSnapshotHook {
        fn time_step(&self) -> TimeStep {
            TimeStep::every(TimeScale::Iteration)
        }

        fn invoke_in_background(&self) -> bool {
            true
        }

        fn required_registry_entries(&self) -> Vec<String> {
            vec!["a..b".to_string()]
        }

        fn functionally_equals(&self, _other: &dyn Hook) -> bool {
            false
        }

        fn invoke(
            &self,
            _registry: &RegistryRef,
            _resolver: &Arc<RegistryResolver>,
        ) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn malformed_entries_in_the_requirement_subtree_fail_the_attach() {
        let bad: HookRef = Arc::new(BadSnapshotHook);
        let mut schedule = HookSchedule::new();

        let err = schedule.attach(bad.clone());
        assert!(matches!(err, Err(OperatorErr::InvalidHook { .. })));
        assert!(schedule.is_empty());

        // The same defect buried in a requirement must also be caught.
        let dependent: HookRef = StubHook::requiring("report", false, vec![bad]);
        let err = schedule.attach(dependent);
        assert!(matches!(err, Err(OperatorErr::InvalidHook { .. })));
        assert!(schedule.is_empty());
    }

    #[test]
    fn cyclic_requirements_are_rejected_without_partial_state() {
        let a = Arc::new(CyclicHook {
            requires: parking_lot::Mutex::new(Vec::new()),
        });
        let b = Arc::new(CyclicHook {
            requires: parking_lot::Mutex::new(vec![a.clone() as HookRef]),
        });
        *a.requires.lock() = vec![b.clone() as HookRef];

        let mut schedule = HookSchedule::new();
        let err = schedule.attach(a as HookRef);
        assert!(matches!(err, Err(OperatorErr::InvalidHook { .. })));
        assert!(schedule.is_empty());
    }

    #[test]
    fn liveness_auto_detaches_after_last_worker() {
        let mut schedule = HookSchedule::new();
        let hook: HookRef = StubHook::new("local");
        schedule.attach(hook.clone()).unwrap();

        assert!(!schedule.mark_dead(&hook, 0, 3).unwrap());
        assert!(!schedule.mark_dead(&hook, 1, 3).unwrap());
        assert!(schedule.mark_dead(&hook, 2, 3).unwrap());
        assert!(!schedule.contains(&hook));

        let err = schedule.mark_dead(&hook, 0, 3);
        assert!(matches!(err, Err(OperatorErr::UnknownHook)));
    }

    #[test]
    fn ejection_respects_interval_live_time_and_order() {
        let mut schedule = HookSchedule::new();
        let every: HookRef = StubHook::new("every");
        let sparse: HookRef = Arc::new(StubHook {
            name: "sparse",
            step: TimeStep::with_interval(
                TimeScale::Iteration,
                std::num::NonZeroUsize::new(3).unwrap(),
            )
            .live_for(2),
            background: false,
            requires: Vec::new(),
        });
        schedule.attach(every.clone()).unwrap();
        schedule.attach(sparse.clone()).unwrap();

        let mut steps = HashMap::new();
        let mut firings = Vec::new();
        for _ in 0..9 {
            let due = schedule.eject(TimeScale::Iteration, &mut steps);
            firings.push(due.len());
        }
        // "sparse" joins on ticks 3 and 6, then expires.
        assert_eq!(firings, [1, 1, 2, 1, 1, 2, 1, 1, 1]);

        assert!(schedule.eject(TimeScale::Epoch, &mut steps).is_empty());
    }
}
