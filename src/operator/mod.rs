mod state;
pub mod worker;

use std::{
    any::Any,
    collections::HashMap,
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc::{channel, Receiver, Sender},
        Arc, Weak,
    },
    thread,
};

use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::{
    data::DataIterator,
    error::{OperatorErr, Result},
    handler::{CpuHandler, Handler},
    hooks::{background, hook_key, HookRef, HookSchedule, LocalTimeStep, TimeScale},
    merge::{AverageMerger, NetworkMerger},
    net::{Network, NetworkRef},
    optimization::Optimizer,
    registry::{Registry, RegistryRef, RegistryResolver, RegistryValue},
};

pub use state::{OperatorState, Transition};
pub use worker::{
    ManagedWorker, SharedIterator, SharedOptimizer, ThreadWorker, ThreadWorkerFactory,
    WorkerFactory, WorkerSeed,
};

/// A worker's view of its own progress, reported into the operator on every
/// tick and used to populate worker registries.
pub struct WorkerProgress<'a> {
    pub index: usize,
    pub epoch: usize,
    pub iteration: usize,
    pub network: &'a NetworkRef,
    pub optimizer: &'a SharedOptimizer,
    pub iterator: &'a SharedIterator,
}

struct Lifecycle {
    current: OperatorState,
    /// Target of the newest accepted transition; validation runs against
    /// this so queued transitions chain correctly.
    requested: OperatorState,
    in_flight: usize,
}

/// Coordinates data-parallel training across a fixed pool of workers:
/// lifecycle transitions, epoch/iteration barriers, parameter merging, and
/// the two-tier hook scheduling.
///
/// Lock order, where held together: state, then network, then pushed epoch
/// networks, then pushed iteration numbers.
pub struct Operator {
    weak_self: Weak<Operator>,
    worker_count: NonZeroUsize,
    trainer_name: String,

    registry: RegistryRef,
    resolver: Arc<RegistryResolver>,
    shared: RegistryRef,

    lifecycle: Mutex<Lifecycle>,
    state_changed: Condvar,
    transitions: Mutex<Option<Sender<Transition>>>,

    network: Mutex<Option<NetworkRef>>,
    optimizer: SharedOptimizer,
    iterator: SharedIterator,
    merger: Box<dyn NetworkMerger>,
    handler: Arc<dyn Handler>,
    factory: Box<dyn WorkerFactory>,

    epoch_number: AtomicUsize,
    highest_iteration_number: AtomicUsize,

    local_hooks: RwLock<HookSchedule>,
    global_hooks: RwLock<HookSchedule>,
    global_time_steps: Mutex<HashMap<usize, LocalTimeStep>>,

    pushed_epoch_networks: Mutex<HashMap<usize, Vec<Option<Box<dyn Network>>>>>,
    pushed_local_iteration_numbers: Mutex<HashMap<usize, Vec<usize>>>,

    workers: Mutex<Vec<Box<dyn ManagedWorker>>>,
}

/// Configures and assembles an `Operator`.
pub struct OperatorBuilder {
    worker_count: NonZeroUsize,
    trainer_name: String,
    handler: Arc<dyn Handler>,
    merger: Box<dyn NetworkMerger>,
}

impl OperatorBuilder {
    pub fn new(worker_count: NonZeroUsize) -> Self {
        Self {
            worker_count,
            trainer_name: "trainer".to_string(),
            handler: Arc::new(CpuHandler),
            merger: Box::new(AverageMerger::default()),
        }
    }

    pub fn trainer_name(mut self, name: impl Into<String>) -> Self {
        self.trainer_name = name.into();
        self
    }

    pub fn handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.handler = handler;
        self
    }

    pub fn merger(mut self, merger: Box<dyn NetworkMerger>) -> Self {
        self.merger = merger;
        self
    }

    /// Assembles the operator around its collaborators: the authoritative
    /// network, the optimizer and iterator prototypes copied into workers,
    /// and the worker factory.
    pub fn build(
        self,
        network: Box<dyn Network>,
        optimizer: Box<dyn Optimizer>,
        iterator: Box<dyn DataIterator>,
        factory: Box<dyn WorkerFactory>,
    ) -> Arc<Operator> {
        let registry = Registry::root(["operator"]);
        let shared = registry.child("shared", ["shared"]);
        let resolver = RegistryResolver::new(Arc::clone(&registry));

        Arc::new_cyclic(|weak_self| Operator {
            weak_self: weak_self.clone(),
            worker_count: self.worker_count,
            trainer_name: self.trainer_name,
            registry,
            resolver,
            shared,
            lifecycle: Mutex::new(Lifecycle {
                current: OperatorState::Inactive,
                requested: OperatorState::Inactive,
                in_flight: 0,
            }),
            state_changed: Condvar::new(),
            transitions: Mutex::new(None),
            network: Mutex::new(Some(Arc::new(Mutex::new(network)))),
            optimizer: Arc::new(Mutex::new(optimizer)),
            iterator: Arc::new(Mutex::new(iterator)),
            merger: self.merger,
            handler: self.handler,
            factory,
            epoch_number: AtomicUsize::new(0),
            highest_iteration_number: AtomicUsize::new(0),
            local_hooks: RwLock::new(HookSchedule::new()),
            global_hooks: RwLock::new(HookSchedule::new()),
            global_time_steps: Mutex::new(HashMap::new()),
            pushed_epoch_networks: Mutex::new(HashMap::new()),
            pushed_local_iteration_numbers: Mutex::new(HashMap::new()),
            workers: Mutex::new(Vec::new()),
        })
    }
}

impl Operator {
    pub fn builder(worker_count: NonZeroUsize) -> OperatorBuilder {
        OperatorBuilder::new(worker_count)
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count.get()
    }

    pub fn registry(&self) -> &RegistryRef {
        &self.registry
    }

    pub fn resolver(&self) -> &Arc<RegistryResolver> {
        &self.resolver
    }

    /// The canonical communication channel between hooks.
    pub fn shared_registry(&self) -> &RegistryRef {
        &self.shared
    }

    pub fn state(&self) -> OperatorState {
        self.lifecycle.lock().current
    }

    /// Handle to the authoritative network.
    pub fn network(&self) -> Option<NetworkRef> {
        self.network.lock().clone()
    }

    pub fn epoch_number(&self) -> usize {
        self.epoch_number.load(Ordering::Acquire)
    }

    pub fn highest_iteration_number(&self) -> usize {
        self.highest_iteration_number.load(Ordering::Acquire)
    }

    // ---- lifecycle -------------------------------------------------------

    pub fn start(&self) -> Result<()> {
        self.signal(Transition::Start)
    }

    pub fn start_once(&self) -> Result<()> {
        self.signal(Transition::StartOnce)
    }

    pub fn signal_pause(&self) -> Result<()> {
        self.signal(Transition::Pause)
    }

    pub fn signal_resume(&self) -> Result<()> {
        self.signal(Transition::Resume)
    }

    pub fn signal_stop(&self) -> Result<()> {
        self.signal(Transition::Stop)
    }

    /// Validates `transition` synchronously and queues it for the dedicated
    /// transition thread; the caller returns immediately.
    fn signal(&self, transition: Transition) -> Result<()> {
        {
            let mut lifecycle = self.lifecycle.lock();
            if !transition.allowed_from(lifecycle.requested) {
                return Err(OperatorErr::BadState {
                    attempted: transition.name(),
                    current: lifecycle.requested,
                });
            }
            lifecycle.requested = transition.target();
            lifecycle.in_flight += 1;
        }

        debug!("transition queued: {}", transition.name());
        self.transition_sender().send(transition).map_err(|_| {
            // The transition thread only dies with the operator.
            OperatorErr::OperatorDropped
        })
    }

    /// Blocks until every queued transition has executed.
    pub fn wait_for_state_changed(&self) -> OperatorState {
        let mut lifecycle = self.lifecycle.lock();
        while lifecycle.in_flight > 0 {
            self.state_changed.wait(&mut lifecycle);
        }
        lifecycle.current
    }

    /// Blocks until the operator publishes `target`.
    pub fn wait_for_state(&self, target: OperatorState) {
        let mut lifecycle = self.lifecycle.lock();
        while lifecycle.current != target {
            self.state_changed.wait(&mut lifecycle);
        }
    }

    fn transition_sender(&self) -> Sender<Transition> {
        let mut guard = self.transitions.lock();
        if guard.is_none() {
            let (sender, receiver) = channel();
            let operator = self.weak_self.clone();
            thread::Builder::new()
                .name("operator-transitions".to_string())
                .spawn(move || transition_loop(operator, receiver))
                .expect("the transition thread must spawn");
            *guard = Some(sender);
        }
        guard.as_ref().expect("just initialized").clone()
    }

    fn execute_transition(&self, transition: Transition) {
        let previous = self.lifecycle.lock().current;

        match transition {
            Transition::Start | Transition::StartOnce => {
                if previous == OperatorState::Stopped {
                    self.reset_run_state();
                }
                self.prepare_workers();
                self.invoke_time_scale_event(TimeScale::Start);

                let mut workers = self.workers.lock();
                for worker in workers.iter_mut() {
                    let result = if transition == Transition::StartOnce {
                        worker.run_once()
                    } else {
                        worker.start()
                    };
                    if let Err(e) = result {
                        warn!("worker failed to start: worker_id={} err={e}", worker.index());
                    }
                }
            }
            Transition::Pause => {
                for worker in self.workers.lock().iter_mut() {
                    worker.pause().ok();
                }
            }
            Transition::Resume => {
                for worker in self.workers.lock().iter_mut() {
                    worker.resume().ok();
                }
            }
            Transition::Stop => {
                {
                    let mut workers = self.workers.lock();
                    for worker in workers.iter_mut() {
                        worker.pause().ok();
                    }
                    for worker in workers.iter_mut() {
                        worker.stop().ok();
                    }
                    // Stopped workers are spent; a later start re-prepares.
                    workers.clear();
                }
                self.invoke_time_scale_event(TimeScale::Stop);
            }
        }

        let mut lifecycle = self.lifecycle.lock();
        lifecycle.current = transition.target();
        lifecycle.in_flight -= 1;
        info!("operator is now {}", lifecycle.current);
        self.state_changed.notify_all();
    }

    /// Creates exactly `worker_count` workers with their own optimizer and
    /// iterator copies. Idempotent: an existing pool is left untouched.
    fn prepare_workers(&self) {
        let mut workers = self.workers.lock();
        if !workers.is_empty() {
            return;
        }

        self.pushed_local_iteration_numbers.lock().clear();

        for index in 0..self.worker_count.get() {
            let seed = WorkerSeed {
                index,
                operator: self.weak_self.clone(),
                optimizer: self.optimizer.lock().duplicate(),
                iterator: self.iterator.lock().split(),
            };
            workers.push(self.factory.create(seed));
        }
        debug!("prepared {} workers", workers.len());
    }

    /// Clears the counters and barrier bookkeeping of a finished run before
    /// a restart from `Stopped`.
    fn reset_run_state(&self) {
        self.epoch_number.store(0, Ordering::Release);
        self.highest_iteration_number.store(0, Ordering::Release);
        self.pushed_epoch_networks.lock().clear();
        self.pushed_local_iteration_numbers.lock().clear();
        self.global_time_steps.lock().clear();
        // A stale stop request must not kill the new run.
        self.shared.remove("stop");
    }

    // ---- hooks -----------------------------------------------------------

    pub fn attach_local_hook(&self, hook: HookRef) -> Result<bool> {
        self.local_hooks.write().attach(hook)
    }

    pub fn detach_local_hook(&self, hook: &HookRef) -> Result<bool> {
        self.local_hooks.write().detach(hook)
    }

    pub fn attach_global_hook(&self, hook: HookRef) -> Result<bool> {
        self.global_hooks.write().attach(hook)
    }

    pub fn detach_global_hook(&self, hook: &HookRef) -> Result<bool> {
        let detached = self.global_hooks.write().detach(hook)?;
        if detached {
            self.global_time_steps.lock().remove(&hook_key(hook));
        }
        Ok(detached)
    }

    /// Read-only views of the attached hooks, in attach order.
    pub fn local_hooks(&self) -> Vec<HookRef> {
        self.local_hooks.read().hooks()
    }

    pub fn global_hooks(&self) -> Vec<HookRef> {
        self.global_hooks.read().hooks()
    }

    pub fn local_hook_invocation_index(&self, hook: &HookRef) -> Result<usize> {
        self.local_hooks.read().invocation_index(hook)
    }

    pub fn local_hook_invocation_target(&self, hook: &HookRef) -> Result<usize> {
        self.local_hooks.read().invocation_target(hook)
    }

    pub fn global_hook_invocation_index(&self, hook: &HookRef) -> Result<usize> {
        self.global_hooks.read().invocation_index(hook)
    }

    pub fn global_hook_invocation_target(&self, hook: &HookRef) -> Result<usize> {
        self.global_hooks.read().invocation_target(hook)
    }

    /// Declares a local hook dead in one worker; the hook is detached once
    /// every worker has done so.
    ///
    /// # Panics
    /// If `worker` is not a valid worker index.
    pub fn mark_hook_dead(&self, hook: &HookRef, worker: usize) -> Result<bool> {
        assert!(worker < self.worker_count.get(), "worker index out of range");
        self.local_hooks
            .write()
            .mark_dead(hook, worker, self.worker_count.get())
    }

    /// Local-hook ejection for one worker tick; called by workers on their
    /// own thread with their own time-step map.
    pub fn eject_local_hooks(
        &self,
        scale: TimeScale,
        steps: &mut HashMap<usize, LocalTimeStep>,
    ) -> Vec<HookRef> {
        self.local_hooks.read().eject(scale, steps)
    }

    /// Local hooks whose live time has run out according to `steps`.
    pub fn expired_local_hooks(&self, steps: &HashMap<usize, LocalTimeStep>) -> Vec<HookRef> {
        self.local_hooks.read().expired(steps)
    }

    /// Pairs the background hooks of `due` with their invocation targets,
    /// in index order, ready for `background::dispatch`.
    pub fn local_background_batch(&self, due: &[HookRef]) -> Vec<(usize, HookRef)> {
        let schedule = self.local_hooks.read();
        due.iter()
            .filter(|hook| hook.invoke_in_background())
            .map(|hook| (schedule.invocation_target(hook).unwrap_or(0), hook.clone()))
            .collect()
    }

    // ---- progress barriers ----------------------------------------------

    /// Reports one worker tick. Crosses at most one epoch barrier per call;
    /// the last worker over a barrier merges (epoch) or records the global
    /// iteration (iteration) and emits the matching time-scale event.
    pub fn push_progress(&self, progress: &WorkerProgress<'_>) -> Result<()> {
        debug_assert!(progress.index < self.worker_count.get());
        let count = self.worker_count.get();

        let mut epoch_event = false;
        if progress.epoch > self.epoch_number.load(Ordering::Acquire) && progress.iteration == 1 {
            let mut pushed = self.pushed_epoch_networks.lock();
            let slots = pushed
                .entry(progress.epoch)
                .or_insert_with(|| (0..count).map(|_| None).collect());

            let Some(free) = slots.iter_mut().find(|slot| slot.is_none()) else {
                return Err(OperatorErr::TooManyPushers {
                    epoch: progress.epoch,
                    worker: progress.index,
                });
            };
            *free = Some(progress.network.lock().duplicate());

            if slots.iter().all(Option::is_some) {
                // Slots are dropped here to release the copies right after
                // the merge consumes them.
                let slots = pushed.remove(&progress.epoch).unwrap_or_default();
                drop(pushed);
                self.merge_epoch(progress.epoch, slots)?;
                epoch_event = true;
            }
        }

        let mut iteration_event = false;
        {
            let mut iterations = self.pushed_local_iteration_numbers.lock();
            let row = iterations
                .entry(progress.epoch)
                .or_insert_with(|| vec![0; count]);
            row[progress.index] = progress.iteration;

            if row.iter().all(|&i| i == progress.iteration) {
                if progress.epoch == self.epoch_number.load(Ordering::Acquire) {
                    self.highest_iteration_number
                        .store(progress.iteration, Ordering::Release);
                }
                iteration_event = true;
            }
        }

        if epoch_event {
            self.invoke_time_scale_event(TimeScale::Epoch);
        }
        if iteration_event {
            self.invoke_time_scale_event(TimeScale::Iteration);
        }
        Ok(())
    }

    /// Hands a worker a fresh deep copy of the authoritative network at the
    /// start of an epoch. Single-worker operators share the authoritative
    /// network instead of copying it.
    pub fn pull_progress(&self, iteration: usize, slot: &mut Option<NetworkRef>) -> Result<()> {
        let single = self.worker_count.get() == 1;
        if slot.is_some() && (iteration != 0 || single) {
            return Ok(());
        }

        let guard = self.network.lock();
        let authoritative = guard.as_ref().ok_or(OperatorErr::UnassignedNetwork)?;

        *slot = Some(if single {
            Arc::clone(authoritative)
        } else {
            Arc::new(Mutex::new(authoritative.lock().duplicate()))
        });
        Ok(())
    }

    fn merge_epoch(&self, epoch: usize, slots: Vec<Option<Box<dyn Network>>>) -> Result<()> {
        let pushed: Vec<Box<dyn Network>> = slots.into_iter().flatten().collect();
        debug_assert_eq!(epoch, self.epoch_number.load(Ordering::Acquire) + 1);
        self.epoch_number.store(epoch, Ordering::Release);

        let guard = self.network.lock();
        let network = guard.as_ref().ok_or(OperatorErr::UnassignedNetwork)?;
        let mut authoritative = network.lock();
        self.merger
            .merge(&mut **authoritative, &pushed, self.handler.as_ref())?;

        info!("merged epoch {epoch} from {} pushed networks", pushed.len());
        Ok(())
    }

    // ---- events ----------------------------------------------------------

    /// Ejects and dispatches the global hooks due on one tick of `scale`.
    fn invoke_time_scale_event(&self, scale: TimeScale) {
        let due = {
            let schedule = self.global_hooks.read();
            let mut steps = self.global_time_steps.lock();
            schedule.eject(scale, &mut steps)
        };

        if !due.is_empty() {
            self.populate_operator_registry();
            HookSchedule::invoke_foreground(&due, &self.registry, &self.resolver);

            let batch = {
                let schedule = self.global_hooks.read();
                due.iter()
                    .filter(|hook| hook.invoke_in_background())
                    .map(|hook| (schedule.invocation_target(hook).unwrap_or(0), hook.clone()))
                    .collect()
            };
            background::dispatch(batch, &self.resolver);
        }

        self.check_stop_request();
    }

    fn populate_operator_registry(&self) {
        if let Some(network) = self.network.lock().as_ref() {
            self.registry
                .set_value("network", Arc::clone(network) as Arc<dyn Any + Send + Sync>)
                .ok();
        }
        self.registry
            .set_value(
                "optimiser",
                Arc::clone(&self.optimizer) as Arc<dyn Any + Send + Sync>,
            )
            .ok();
        self.registry
            .set_value(
                "iterator",
                Arc::clone(&self.iterator) as Arc<dyn Any + Send + Sync>,
            )
            .ok();
        self.registry
            .set_value("trainer", Arc::new(self.trainer_name.clone()))
            .ok();
        self.registry
            .set_value("epoch", Arc::new(self.epoch_number()))
            .ok();
        self.registry
            .set_value("iteration", Arc::new(self.highest_iteration_number()))
            .ok();
    }

    /// Fills a worker registry with the worker's own view: its network,
    /// optimizer, iterator, counters, and a link to the shared channel.
    pub fn populate_worker_registry(&self, registry: &RegistryRef, progress: &WorkerProgress<'_>) {
        registry
            .set_value(
                "network",
                Arc::clone(progress.network) as Arc<dyn Any + Send + Sync>,
            )
            .ok();
        registry
            .set_value(
                "optimiser",
                Arc::clone(progress.optimizer) as Arc<dyn Any + Send + Sync>,
            )
            .ok();
        registry
            .set_value(
                "iterator",
                Arc::clone(progress.iterator) as Arc<dyn Any + Send + Sync>,
            )
            .ok();
        registry
            .set_value("trainer", Arc::new(self.trainer_name.clone()))
            .ok();
        registry.set_value("epoch", Arc::new(progress.epoch)).ok();
        registry
            .set_value("iteration", Arc::new(progress.iteration))
            .ok();
        registry.set_value("worker", Arc::new(progress.index)).ok();

        if registry.get_child("shared").is_none() {
            registry
                .set("shared", RegistryValue::Child(Arc::clone(&self.shared)))
                .ok();
        }
    }

    /// Hooks request a stop by writing `stop = true` into the shared
    /// registry; the operator honors it after each global event.
    fn check_stop_request(&self) {
        let requested = self
            .shared
            .get_as::<bool>("stop")
            .is_some_and(|flag| *flag);
        if requested && self.signal_stop().is_ok() {
            info!("stop requested through the shared registry");
        }
    }
}

fn transition_loop(operator: Weak<Operator>, transitions: Receiver<Transition>) {
    while let Ok(transition) = transitions.recv() {
        let Some(operator) = operator.upgrade() else {
            break;
        };
        operator.execute_transition(transition);
    }
}
