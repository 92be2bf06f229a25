pub mod background;
pub mod library;
pub mod schedule;

use std::{any::Any, fmt, num::NonZeroUsize, sync::Arc};

use crate::registry::{RegistryRef, RegistryResolver};

pub use schedule::HookSchedule;

/// A named tick type on the training timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeScale {
    Start,
    Iteration,
    Epoch,
    Stop,
}

impl fmt::Display for TimeScale {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TimeScale::Start => "start",
            TimeScale::Iteration => "iteration",
            TimeScale::Epoch => "epoch",
            TimeScale::Stop => "stop",
        };
        write!(f, "{s}")
    }
}

/// How many firings a hook lives for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveTime {
    Forever,
    Count(usize),
}

/// A hook schedule: fire every `interval` ticks of `time_scale`, `live_time`
/// times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeStep {
    pub time_scale: TimeScale,
    pub interval: NonZeroUsize,
    pub live_time: LiveTime,
}

impl TimeStep {
    /// Fires on every tick of `time_scale`, forever.
    pub fn every(time_scale: TimeScale) -> Self {
        Self::with_interval(time_scale, NonZeroUsize::MIN)
    }

    /// Fires every `interval` ticks of `time_scale`, forever.
    pub fn with_interval(time_scale: TimeScale, interval: NonZeroUsize) -> Self {
        Self {
            time_scale,
            interval,
            live_time: LiveTime::Forever,
        }
    }

    /// Fires once on the first tick of `time_scale`, then expires.
    pub fn once(time_scale: TimeScale) -> Self {
        Self {
            time_scale,
            interval: NonZeroUsize::MIN,
            live_time: LiveTime::Count(1),
        }
    }

    pub fn live_for(mut self, firings: usize) -> Self {
        self.live_time = LiveTime::Count(firings);
        self
    }
}

/// A live copy of a `TimeStep`, tracking the remaining interval and firings
/// for one evaluation site (the operator for global hooks, one worker for
/// local hooks).
#[derive(Debug, Clone, Copy)]
pub struct LocalTimeStep {
    step: TimeStep,
    local_interval: usize,
    local_live_time: LiveTime,
}

impl LocalTimeStep {
    pub fn new(step: TimeStep) -> Self {
        Self {
            step,
            local_interval: step.interval.get(),
            local_live_time: step.live_time,
        }
    }

    pub fn expired(&self) -> bool {
        self.local_live_time == LiveTime::Count(0)
    }

    /// Advances one tick of the step's scale.
    ///
    /// # Returns
    /// Whether the hook fires on this tick.
    pub fn tick(&mut self) -> bool {
        if self.expired() {
            return false;
        }

        self.local_interval -= 1;
        if self.local_interval > 0 {
            return false;
        }

        if let LiveTime::Count(n) = self.local_live_time {
            self.local_live_time = LiveTime::Count(n - 1);
        }
        self.local_interval = self.step.interval.get();
        true
    }
}

/// A scheduled callback attached to an operator.
///
/// Hooks are invoked on time-scale events against a registry holding the
/// invocation context. Foreground hooks run inline on the emitting thread;
/// background hooks run on the shared task pool against a snapshot of their
/// `required_registry_entries`.
pub trait Hook: Any + Send + Sync {
    /// When this hook fires.
    fn time_step(&self) -> TimeStep;

    /// Whether to dispatch onto the background task pool instead of the
    /// emitting thread.
    fn invoke_in_background(&self) -> bool {
        false
    }

    /// Hooks this one depends on. Attaching this hook attaches them; they
    /// are invoked before it whenever both share an invocation target.
    ///
    /// Implementations must return stable handles (clones of stored `Arc`s),
    /// never freshly constructed hooks, so identity survives across calls.
    fn required_hooks(&self) -> Vec<HookRef> {
        Vec::new()
    }

    /// Match identifiers snapshotted for background invocation.
    fn required_registry_entries(&self) -> Vec<String> {
        Vec::new()
    }

    /// Whether `other` produces the same observable effect. Must be
    /// reflexive and symmetric; used to deduplicate attachments.
    fn functionally_equals(&self, other: &dyn Hook) -> bool;

    /// Runs the hook against the invocation context.
    ///
    /// Failures are logged by the scheduler and never destabilize training.
    fn invoke(&self, registry: &RegistryRef, resolver: &Arc<RegistryResolver>)
        -> anyhow::Result<()>;
}

/// Shared handle to an attached hook. Identity is pointer identity.
pub type HookRef = Arc<dyn Hook>;

/// Stable identity key for a hook handle.
pub(crate) fn hook_key(hook: &HookRef) -> usize {
    Arc::as_ptr(hook) as *const () as usize
}
