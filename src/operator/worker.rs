use std::{
    collections::HashMap,
    sync::{
        mpsc::{channel, Receiver, Sender, TryRecvError},
        Arc, Weak,
    },
    thread::{self, JoinHandle},
};

use log::{debug, warn};
use parking_lot::Mutex;

use crate::{
    data::DataIterator,
    error::{OperatorErr, Result},
    hooks::{background, HookSchedule, LocalTimeStep, TimeScale},
    net::NetworkRef,
    operator::{Operator, WorkerProgress},
    optimization::Optimizer,
    registry::{Registry, RegistryRef, RegistryResolver},
    strategy::TrainStep,
};

pub type SharedOptimizer = Arc<Mutex<Box<dyn Optimizer>>>;
pub type SharedIterator = Arc<Mutex<Box<dyn DataIterator>>>;

/// Everything the operator hands a freshly prepared worker: a stable index,
/// a way back to the operator, and the worker's own optimizer and iterator
/// copies.
pub struct WorkerSeed {
    pub index: usize,
    pub operator: Weak<Operator>,
    pub optimizer: Box<dyn Optimizer>,
    pub iterator: Box<dyn DataIterator>,
}

/// Creates the concrete worker kind. The only open extension point of the
/// operator; everything else is polymorphic only through `ManagedWorker`.
pub trait WorkerFactory: Send + Sync {
    fn create(&self, seed: WorkerSeed) -> Box<dyn ManagedWorker>;
}

/// The operator-facing side of a worker: lifecycle commands forwarded by
/// state transitions. Workers observe pause/stop cooperatively at
/// iteration boundaries.
pub trait ManagedWorker: Send {
    fn index(&self) -> usize;

    fn start(&mut self) -> Result<()>;

    /// Runs a single iteration instead of the continuous loop.
    fn run_once(&mut self) -> Result<()>;

    fn pause(&mut self) -> Result<()>;

    fn resume(&mut self) -> Result<()>;

    /// Stops the worker and waits for its thread to finish.
    fn stop(&mut self) -> Result<()>;
}

enum WorkerCmd {
    Run,
    RunOnce,
    Pause,
    Resume,
    Stop,
}

/// A worker driving its training loop on a dedicated thread, commanded
/// through a channel.
pub struct ThreadWorker {
    index: usize,
    commands: Sender<WorkerCmd>,
    handle: Option<JoinHandle<()>>,
}

impl ThreadWorker {
    fn send(&self, cmd: WorkerCmd, what: &'static str) {
        if self.commands.send(cmd).is_err() {
            warn!("worker thread is gone: worker_id={} cmd={what}", self.index);
        }
    }
}

impl ManagedWorker for ThreadWorker {
    fn index(&self) -> usize {
        self.index
    }

    fn start(&mut self) -> Result<()> {
        self.send(WorkerCmd::Run, "start");
        Ok(())
    }

    fn run_once(&mut self) -> Result<()> {
        self.send(WorkerCmd::RunOnce, "run once");
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        self.send(WorkerCmd::Pause, "pause");
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        self.send(WorkerCmd::Resume, "resume");
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.send(WorkerCmd::Stop, "stop");
        if let Some(handle) = self.handle.take() {
            handle.join().ok();
        }
        Ok(())
    }
}

/// Builds `ThreadWorker`s around per-worker copies of a training step
/// prototype.
pub struct ThreadWorkerFactory {
    step: Mutex<Box<dyn TrainStep>>,
}

impl ThreadWorkerFactory {
    pub fn new(step: Box<dyn TrainStep>) -> Self {
        Self {
            step: Mutex::new(step),
        }
    }
}

impl WorkerFactory for ThreadWorkerFactory {
    fn create(&self, seed: WorkerSeed) -> Box<dyn ManagedWorker> {
        let (commands, receiver) = channel();
        let index = seed.index;
        let core = WorkerCore::new(seed, self.step.lock().duplicate());

        let handle = thread::Builder::new()
            .name(format!("worker-{index}"))
            .spawn(move || core.run(receiver))
            .expect("worker threads must spawn");

        Box::new(ThreadWorker {
            index,
            commands,
            handle: Some(handle),
        })
    }
}

/// The thread-side state of a `ThreadWorker`: the local network copy,
/// optimizer, iterator, tick counters, and the live time-step copies of the
/// local hooks evaluated in this worker.
struct WorkerCore {
    index: usize,
    operator: Weak<Operator>,
    network: Option<NetworkRef>,
    optimizer: SharedOptimizer,
    iterator: SharedIterator,
    step: Box<dyn TrainStep>,
    epoch: usize,
    iteration: usize,
    last_loss: f32,
    registry: RegistryRef,
    resolver: Arc<RegistryResolver>,
    local_steps: HashMap<usize, LocalTimeStep>,
}

impl WorkerCore {
    fn new(seed: WorkerSeed, step: Box<dyn TrainStep>) -> Self {
        let registry = Registry::root(["worker", "trainer"]);
        let resolver = RegistryResolver::new(Arc::clone(&registry));

        Self {
            index: seed.index,
            operator: seed.operator,
            network: None,
            optimizer: Arc::new(Mutex::new(seed.optimizer)),
            iterator: Arc::new(Mutex::new(seed.iterator)),
            step,
            epoch: 0,
            iteration: 0,
            last_loss: 0.,
            registry,
            resolver,
            local_steps: HashMap::new(),
        }
    }

    fn run(mut self, commands: Receiver<WorkerCmd>) {
        let mut running = false;
        let mut started = false;

        loop {
            let cmd = if running {
                match commands.try_recv() {
                    Ok(cmd) => Some(cmd),
                    Err(TryRecvError::Empty) => None,
                    Err(TryRecvError::Disconnected) => break,
                }
            } else {
                match commands.recv() {
                    Ok(cmd) => Some(cmd),
                    Err(_) => break,
                }
            };

            match cmd {
                Some(WorkerCmd::Run) | Some(WorkerCmd::Resume) => {
                    if !started {
                        started = true;
                        self.emit_local(TimeScale::Start);
                    }
                    running = true;
                }
                Some(WorkerCmd::RunOnce) => {
                    if !started {
                        started = true;
                        self.emit_local(TimeScale::Start);
                    }
                    if let Err(e) = self.tick() {
                        warn!("worker tick failed: worker_id={} err={e}", self.index);
                    }
                }
                Some(WorkerCmd::Pause) => running = false,
                Some(WorkerCmd::Stop) => break,
                None => {
                    if let Err(e) = self.tick() {
                        warn!("worker tick failed, pausing: worker_id={} err={e}", self.index);
                        running = false;
                    }
                }
            }
        }

        self.emit_local(TimeScale::Stop);
        debug!("worker finished: worker_id={}", self.index);
    }

    fn tick(&mut self) -> Result<()> {
        let operator = self.operator.upgrade().ok_or(OperatorErr::OperatorDropped)?;
        if self.network.is_none() {
            operator.pull_progress(0, &mut self.network)?;
        }

        let batch = self.iterator.lock().next_batch();
        let Some(batch) = batch else {
            // Epoch boundary: rewind the data, advance the local epoch,
            // restart the iteration numbering.
            self.iterator.lock().reset();
            self.epoch += 1;
            self.iteration = 0;
            self.emit_local(TimeScale::Epoch);
            return Ok(());
        };

        let network = self
            .network
            .as_ref()
            .ok_or(OperatorErr::UnassignedNetwork)?;
        let loss = {
            let mut net = network.lock();
            let mut optimizer = self.optimizer.lock();
            self.step.step(&mut **net, &mut **optimizer, &batch)?
        };
        self.last_loss = loss;
        self.iteration += 1;

        operator.push_progress(&WorkerProgress {
            index: self.index,
            epoch: self.epoch,
            iteration: self.iteration,
            network: self
                .network
                .as_ref()
                .ok_or(OperatorErr::UnassignedNetwork)?,
            optimizer: &self.optimizer,
            iterator: &self.iterator,
        })?;

        // The epoch-opening push above carried the fully trained
        // previous-epoch network; the rest of this epoch trains on a fresh
        // reference copy.
        if self.iteration == 1 && self.epoch > 0 {
            operator.pull_progress(0, &mut self.network)?;
        }

        self.emit_local(TimeScale::Iteration);
        Ok(())
    }

    /// Runs the local-hook ejection for one tick of `scale` on this
    /// worker's thread, then reports expired hooks dead.
    fn emit_local(&mut self, scale: TimeScale) {
        let Some(operator) = self.operator.upgrade() else {
            return;
        };

        let due = operator.eject_local_hooks(scale, &mut self.local_steps);
        if !due.is_empty() {
            if self.network.is_none()
                && operator
                    .pull_progress(self.iteration, &mut self.network)
                    .is_err()
            {
                return;
            }

            if let Some(network) = self.network.as_ref() {
                operator.populate_worker_registry(
                    &self.registry,
                    &WorkerProgress {
                        index: self.index,
                        epoch: self.epoch,
                        iteration: self.iteration,
                        network,
                        optimizer: &self.optimizer,
                        iterator: &self.iterator,
                    },
                );
            }
            self.registry
                .set_value("loss", Arc::new(self.last_loss))
                .ok();

            HookSchedule::invoke_foreground(&due, &self.registry, &self.resolver);
            background::dispatch(operator.local_background_batch(&due), &self.resolver);
        }

        // Hooks whose live time ran out in this worker are declared dead;
        // once every worker agrees the operator detaches them.
        for hook in operator.expired_local_hooks(&self.local_steps) {
            operator.mark_hook_dead(&hook, self.index).ok();
        }
    }
}
