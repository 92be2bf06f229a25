use std::{
    num::NonZeroUsize,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use parking_lot::{Mutex, RwLock};

use maestro::{
    data::{DataIterator, Dataset, SliceIterator},
    error::OperatorErr,
    hooks::library::{LearningRateDecayHook, StopAfterEpochsHook},
    net::{self, DenseNet, Network, NetworkRef},
    operator::{
        ManagedWorker, OperatorState, SharedIterator, SharedOptimizer, WorkerFactory, WorkerSeed,
    },
    optimization::{GradientDescent, Optimizer},
    registry::{RegistryRef, RegistryResolver},
    strategy::MseStep,
    Hook, HookRef, Operator, ThreadWorkerFactory, TimeScale, TimeStep, WorkerProgress,
};

// ---- fixtures --------------------------------------------------------------

struct NoopWorker(usize);

impl ManagedWorker for NoopWorker {
    fn index(&self) -> usize {
        self.0
    }

    fn start(&mut self) -> maestro::Result<()> {
        Ok(())
    }

    fn run_once(&mut self) -> maestro::Result<()> {
        Ok(())
    }

    fn pause(&mut self) -> maestro::Result<()> {
        Ok(())
    }

    fn resume(&mut self) -> maestro::Result<()> {
        Ok(())
    }

    fn stop(&mut self) -> maestro::Result<()> {
        Ok(())
    }
}

/// Workers that never tick; the tests drive push/pull by hand.
struct NoopFactory;

impl WorkerFactory for NoopFactory {
    fn create(&self, seed: WorkerSeed) -> Box<dyn ManagedWorker> {
        Box::new(NoopWorker(seed.index))
    }
}

fn linear_dataset(rows: usize) -> Arc<Dataset> {
    let xs: Vec<f32> = (0..rows).map(|i| i as f32 / rows as f32).collect();
    let ys: Vec<f32> = xs.iter().map(|x| 2. * x + 1.).collect();
    Arc::new(Dataset::new(xs, ys, 1, 1).unwrap())
}

fn manual_operator(workers: usize) -> Arc<Operator> {
    Operator::builder(NonZeroUsize::new(workers).unwrap()).build(
        Box::new(DenseNet::new(&[1, 1], 0).unwrap()),
        Box::new(GradientDescent::new(0.1)),
        Box::new(SliceIterator::new(
            linear_dataset(8),
            NonZeroUsize::new(4).unwrap(),
        )),
        Box::new(NoopFactory),
    )
}

fn constant_network(value: f32) -> NetworkRef {
    let net = DenseNet::new(&[1, 1], 0).unwrap();
    fill_parameters(net.registry(), value);
    net::shared(net)
}

fn fill_parameters(registry: &RegistryRef, value: f32) {
    let resolver = RegistryResolver::new(Arc::clone(registry));
    for buffer in resolver
        .resolve_get::<RwLock<Vec<f32>>>("layers.*.*")
        .unwrap()
    {
        buffer.write().fill(value);
    }
}

fn parameter_values(registry: &RegistryRef) -> Vec<f32> {
    let resolver = RegistryResolver::new(Arc::clone(registry));
    resolver
        .resolve_get::<RwLock<Vec<f32>>>("layers.*.*")
        .unwrap()
        .iter()
        .flat_map(|b| b.read().clone())
        .collect()
}

struct ProgressParts {
    optimizer: SharedOptimizer,
    iterator: SharedIterator,
}

impl ProgressParts {
    fn new() -> Self {
        Self {
            optimizer: Arc::new(Mutex::new(
                Box::new(GradientDescent::new(0.1)) as Box<dyn Optimizer>
            )),
            iterator: Arc::new(Mutex::new(Box::new(SliceIterator::new(
                linear_dataset(8),
                NonZeroUsize::new(4).unwrap(),
            )) as Box<dyn DataIterator>)),
        }
    }

    fn progress<'a>(
        &'a self,
        index: usize,
        epoch: usize,
        iteration: usize,
        network: &'a NetworkRef,
    ) -> WorkerProgress<'a> {
        WorkerProgress {
            index,
            epoch,
            iteration,
            network,
            optimizer: &self.optimizer,
            iterator: &self.iterator,
        }
    }
}

/// Appends its name to a shared log on every invocation.
struct RecordingHook {
    name: &'static str,
    log: Arc<Mutex<Vec<&'static str>>>,
    requires: Vec<HookRef>,
}

impl RecordingHook {
    fn new(name: &'static str, log: &Arc<Mutex<Vec<&'static str>>>) -> Arc<Self> {
        Arc::new(Self {
            name,
            log: Arc::clone(log),
            requires: Vec::new(),
        })
    }

    fn requiring(
        name: &'static str,
        log: &Arc<Mutex<Vec<&'static str>>>,
        requires: Vec<HookRef>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name,
            log: Arc::clone(log),
            requires,
        })
    }
}

impl Hook for RecordingHook {
    fn time_step(&self) -> TimeStep {
        TimeStep::every(TimeScale::Iteration)
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
        self.log.lock().push(self.name);
        Ok(())
    }
}

/// A local hook that counts invocations and expires after two firings per
/// worker.
struct ShortLivedProbe {
    invocations: Arc<AtomicUsize>,
}

impl Hook for ShortLivedProbe {
    fn time_step(&self) -> TimeStep {
        TimeStep::every(TimeScale::Iteration).live_for(2)
    }

    fn functionally_equals(&self, other: &dyn Hook) -> bool {
        let other: &dyn std::any::Any = other;
        other
            .downcast_ref::<Self>()
            .is_some_and(|o| Arc::ptr_eq(&o.invocations, &self.invocations))
    }

    fn invoke(
        &self,
        _registry: &RegistryRef,
        _resolver: &Arc<RegistryResolver>,
    ) -> anyhow::Result<()> {
        self.invocations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---- barrier scenarios -----------------------------------------------------

#[test]
fn two_worker_epoch_and_iteration_barriers() {
    let operator = manual_operator(2);
    let parts = ProgressParts::new();
    let w0 = constant_network(1.);
    let w1 = constant_network(3.);

    // Epoch 0, iteration 1: the barrier only fires on the last pusher.
    operator
        .push_progress(&parts.progress(0, 0, 1, &w0))
        .unwrap();
    assert_eq!(operator.highest_iteration_number(), 0);
    operator
        .push_progress(&parts.progress(1, 0, 1, &w1))
        .unwrap();
    assert_eq!(operator.highest_iteration_number(), 1);
    assert_eq!(operator.epoch_number(), 0);

    // Epoch 1, iteration 1: the first push fills a slot without merging.
    operator
        .push_progress(&parts.progress(0, 1, 1, &w0))
        .unwrap();
    assert_eq!(operator.epoch_number(), 0);

    // The last push merges and advances the global epoch.
    operator
        .push_progress(&parts.progress(1, 1, 1, &w1))
        .unwrap();
    assert_eq!(operator.epoch_number(), 1);
    assert_eq!(operator.highest_iteration_number(), 1);

    let authoritative = operator.network().unwrap();
    let guard = authoritative.lock();
    for value in parameter_values(guard.registry()) {
        assert_eq!(value, 2., "averaged parameter expected");
    }
}

#[test]
fn single_worker_pull_shares_the_authoritative_network() {
    let operator = manual_operator(1);

    let mut first = None;
    operator.pull_progress(0, &mut first).unwrap();
    let mut second = None;
    operator.pull_progress(0, &mut second).unwrap();

    let authoritative = operator.network().unwrap();
    assert!(Arc::ptr_eq(first.as_ref().unwrap(), &authoritative));
    assert!(Arc::ptr_eq(second.as_ref().unwrap(), &authoritative));
}

#[test]
fn multi_worker_pull_deep_copies_per_epoch() {
    let operator = manual_operator(2);

    let mut slot = None;
    operator.pull_progress(0, &mut slot).unwrap();
    let first = slot.clone().unwrap();
    assert!(!Arc::ptr_eq(&first, &operator.network().unwrap()));

    // A later epoch start replaces the copy.
    operator.pull_progress(0, &mut slot).unwrap();
    assert!(!Arc::ptr_eq(&first, slot.as_ref().unwrap()));

    // Mid-epoch pulls keep the current copy.
    let current = slot.clone().unwrap();
    operator.pull_progress(3, &mut slot).unwrap();
    assert!(Arc::ptr_eq(&current, slot.as_ref().unwrap()));
}

// ---- lifecycle scenarios ---------------------------------------------------

#[test]
fn illegal_transitions_fail_with_bad_state() {
    let operator = manual_operator(1);

    operator.start().unwrap();
    assert!(matches!(
        operator.start(),
        Err(OperatorErr::BadState { attempted: "start", .. })
    ));
    assert!(matches!(
        operator.signal_resume(),
        Err(OperatorErr::BadState { attempted: "resume", .. })
    ));

    operator.signal_pause().unwrap();
    operator.signal_resume().unwrap();
    operator.signal_stop().unwrap();
    assert!(matches!(
        operator.signal_stop(),
        Err(OperatorErr::BadState { attempted: "stop", .. })
    ));

    assert_eq!(operator.wait_for_state_changed(), OperatorState::Stopped);
}

#[test]
fn worker_preparation_happens_exactly_once_per_run() {
    struct CountingFactory(Arc<AtomicUsize>);

    impl WorkerFactory for CountingFactory {
        fn create(&self, seed: WorkerSeed) -> Box<dyn ManagedWorker> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Box::new(NoopWorker(seed.index))
        }
    }

    let created = Arc::new(AtomicUsize::new(0));
    let operator = Operator::builder(NonZeroUsize::new(3).unwrap()).build(
        Box::new(DenseNet::new(&[1, 1], 0).unwrap()),
        Box::new(GradientDescent::new(0.1)),
        Box::new(SliceIterator::new(
            linear_dataset(8),
            NonZeroUsize::new(4).unwrap(),
        )),
        Box::new(CountingFactory(Arc::clone(&created))),
    );

    operator.start().unwrap();
    operator.signal_pause().unwrap();
    operator.signal_resume().unwrap();
    operator.wait_for_state_changed();
    assert_eq!(created.load(Ordering::SeqCst), 3);

    // A restart after stop rebuilds the pool.
    operator.signal_stop().unwrap();
    operator.start().unwrap();
    operator.wait_for_state_changed();
    assert_eq!(created.load(Ordering::SeqCst), 6);
}

#[test]
fn pause_resume_preserves_progress_counters() {
    let operator = manual_operator(2);
    let parts = ProgressParts::new();
    let w0 = constant_network(1.);
    let w1 = constant_network(3.);

    operator.start().unwrap();
    operator.wait_for_state_changed();

    for progress in [
        parts.progress(0, 0, 1, &w0),
        parts.progress(1, 0, 1, &w1),
        parts.progress(0, 1, 1, &w0),
        parts.progress(1, 1, 1, &w1),
    ] {
        operator.push_progress(&progress).unwrap();
    }
    let epoch = operator.epoch_number();
    let iteration = operator.highest_iteration_number();

    operator.signal_pause().unwrap();
    operator.signal_resume().unwrap();
    operator.wait_for_state_changed();

    assert_eq!(operator.epoch_number(), epoch);
    assert_eq!(operator.highest_iteration_number(), iteration);
}

// ---- hook scenarios --------------------------------------------------------

#[test]
fn global_hooks_run_in_dependency_order_on_iteration_events() {
    let operator = manual_operator(1);
    let parts = ProgressParts::new();
    let network = constant_network(1.);

    let log = Arc::new(Mutex::new(Vec::new()));
    let base = RecordingHook::new("base", &log);
    let dependent = RecordingHook::requiring("dependent", &log, vec![base.clone() as HookRef]);

    // Attaching the dependent pulls the requirement in with it.
    assert!(operator.attach_global_hook(dependent.clone()).unwrap());
    assert_eq!(operator.global_hooks().len(), 2);

    let base: HookRef = base;
    let dependent: HookRef = dependent;
    assert!(
        operator.global_hook_invocation_index(&base).unwrap()
            < operator.global_hook_invocation_index(&dependent).unwrap()
    );

    // One full iteration barrier -> one global Iteration event.
    operator
        .push_progress(&parts.progress(0, 0, 1, &network))
        .unwrap();
    assert_eq!(*log.lock(), ["base", "dependent"]);

    // The requirement cannot leave while the dependent needs it.
    assert!(matches!(
        operator.detach_global_hook(&base),
        Err(OperatorErr::RequiredByDependents { .. })
    ));

    // Detaching the dependent cascades through the implicit requirement.
    assert!(operator.detach_global_hook(&dependent).unwrap());
    assert!(operator.global_hooks().is_empty());
}

#[test]
fn mark_hook_dead_detaches_after_every_worker_agrees() {
    let operator = manual_operator(3);
    let probe: HookRef = Arc::new(ShortLivedProbe {
        invocations: Arc::new(AtomicUsize::new(0)),
    });

    operator.attach_local_hook(probe.clone()).unwrap();
    assert!(!operator.mark_hook_dead(&probe, 0).unwrap());
    assert!(!operator.mark_hook_dead(&probe, 1).unwrap());
    assert!(operator.mark_hook_dead(&probe, 2).unwrap());
    assert!(operator.local_hooks().is_empty());

    assert!(matches!(
        operator.mark_hook_dead(&probe, 0),
        Err(OperatorErr::UnknownHook)
    ));
}

// ---- full training run -----------------------------------------------------

#[test]
fn parallel_training_converges_and_stops_cooperatively() {
    const WORKERS: usize = 2;
    const EPOCHS: usize = 40;

    let iterator = SliceIterator::new(linear_dataset(16), NonZeroUsize::new(4).unwrap());
    let operator = Operator::builder(NonZeroUsize::new(WORKERS).unwrap())
        .trainer_name("linreg-e2e")
        .build(
            Box::new(DenseNet::new(&[1, 1], 7).unwrap()),
            Box::new(GradientDescent::new(0.5)),
            Box::new(iterator),
            Box::new(ThreadWorkerFactory::new(Box::new(MseStep))),
        );

    let invocations = Arc::new(AtomicUsize::new(0));
    let probe: HookRef = Arc::new(ShortLivedProbe {
        invocations: Arc::clone(&invocations),
    });
    operator.attach_local_hook(probe.clone()).unwrap();
    operator
        .attach_local_hook(Arc::new(LearningRateDecayHook::with_step(
            TimeStep::every(TimeScale::Epoch),
            0.95,
        )))
        .unwrap();
    operator
        .attach_global_hook(Arc::new(StopAfterEpochsHook::new(EPOCHS)))
        .unwrap();

    operator.start().unwrap();
    operator.wait_for_state(OperatorState::Stopped);

    assert!(operator.epoch_number() >= EPOCHS);
    assert!(operator.highest_iteration_number() >= 1);

    // The short-lived probe fired at most twice per worker, then liveness
    // detached it.
    let fired = invocations.load(Ordering::SeqCst);
    assert!(fired >= 1 && fired <= 2 * WORKERS, "probe fired {fired} times");
    assert!(!operator
        .local_hooks()
        .iter()
        .any(|h| Arc::ptr_eq(h, &probe)));

    // The merged model fits y = 2x + 1.
    let network = operator.network().unwrap();
    let guard = network.lock();
    let net = guard.as_any().downcast_ref::<DenseNet>().unwrap();
    let prediction = net.forward(&[0.5])[0];
    assert!(
        (prediction - 2.).abs() < 0.5,
        "expected f(0.5) near 2.0, got {prediction}"
    );
}
