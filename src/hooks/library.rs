use std::{any::Any, sync::Arc};

use anyhow::anyhow;
use log::info;
use parking_lot::{Mutex, RwLock};

use crate::{
    hooks::{Hook, TimeScale, TimeStep},
    net::Network,
    optimization::Optimizer,
    registry::{RegistryRef, RegistryResolver},
};

fn downcast<T: 'static>(other: &dyn Hook) -> Option<&T> {
    let any: &dyn Any = other;
    any.downcast_ref::<T>()
}

/// Logs the reporting worker's last loss. A local foreground hook.
pub struct LossLoggerHook {
    step: TimeStep,
}

impl LossLoggerHook {
    pub fn new(step: TimeStep) -> Self {
        Self { step }
    }
}

impl Hook for LossLoggerHook {
    fn time_step(&self) -> TimeStep {
        self.step
    }

    fn functionally_equals(&self, other: &dyn Hook) -> bool {
        downcast::<Self>(other).is_some_and(|o| o.step == self.step)
    }

    fn invoke(
        &self,
        registry: &RegistryRef,
        _resolver: &Arc<RegistryResolver>,
    ) -> anyhow::Result<()> {
        let loss = registry
            .get_as::<f32>("loss")
            .ok_or_else(|| anyhow!("no loss in the invocation registry"))?;
        let worker = registry.get_as::<usize>("worker").map_or(0, |w| *w);
        let epoch = registry.get_as::<usize>("epoch").map_or(0, |e| *e);
        let iteration = registry.get_as::<usize>("iteration").map_or(0, |i| *i);

        info!("loss: worker_id={worker} epoch={epoch} iteration={iteration} loss={loss}");
        Ok(())
    }
}

/// Multiplies the operator optimizer's learning rate by a fixed factor on
/// every firing. A global foreground hook, epoch-scaled by default.
pub struct LearningRateDecayHook {
    step: TimeStep,
    factor: f32,
}

impl LearningRateDecayHook {
    pub fn new(factor: f32) -> Self {
        Self {
            step: TimeStep::every(TimeScale::Epoch),
            factor,
        }
    }

    pub fn with_step(step: TimeStep, factor: f32) -> Self {
        Self { step, factor }
    }
}

impl Hook for LearningRateDecayHook {
    fn time_step(&self) -> TimeStep {
        self.step
    }

    fn functionally_equals(&self, other: &dyn Hook) -> bool {
        downcast::<Self>(other).is_some_and(|o| o.step == self.step && o.factor == self.factor)
    }

    fn invoke(
        &self,
        registry: &RegistryRef,
        _resolver: &Arc<RegistryResolver>,
    ) -> anyhow::Result<()> {
        let optimizer = registry
            .get_as::<Mutex<Box<dyn Optimizer>>>("optimiser")
            .ok_or_else(|| anyhow!("no optimiser in the invocation registry"))?;

        let mut optimizer = optimizer.lock();
        let decayed = optimizer.learning_rate() * self.factor;
        optimizer.set_learning_rate(decayed);
        info!("learning rate decayed to {decayed}");
        Ok(())
    }
}

/// Computes the L2 norm of the authoritative parameters and publishes it
/// into the shared registry under `param_norm`. A background hook; its
/// snapshot carries the network handle, the epoch, and the shared channel.
pub struct ParameterNormHook {
    step: TimeStep,
    pattern: String,
}

impl ParameterNormHook {
    pub fn new() -> Self {
        Self {
            step: TimeStep::every(TimeScale::Epoch),
            pattern: "layers.*.*".to_string(),
        }
    }
}

impl Default for ParameterNormHook {
    fn default() -> Self {
        Self::new()
    }
}

impl Hook for ParameterNormHook {
    fn time_step(&self) -> TimeStep {
        self.step
    }

    fn invoke_in_background(&self) -> bool {
        true
    }

    fn required_registry_entries(&self) -> Vec<String> {
        vec![
            "network".to_string(),
            "epoch".to_string(),
            "shared".to_string(),
        ]
    }

    fn functionally_equals(&self, other: &dyn Hook) -> bool {
        downcast::<Self>(other).is_some_and(|o| o.step == self.step && o.pattern == self.pattern)
    }

    fn invoke(
        &self,
        registry: &RegistryRef,
        _resolver: &Arc<RegistryResolver>,
    ) -> anyhow::Result<()> {
        let network = registry
            .get_as::<Mutex<Box<dyn Network>>>("network")
            .ok_or_else(|| anyhow!("no network in the snapshot registry"))?;
        let epoch = registry.get_as::<usize>("epoch").map_or(0, |e| *e);

        // Duplicate under the lock, then measure the copy off-lock.
        let copy = network.lock().duplicate();
        let copy_resolver = RegistryResolver::new(Arc::clone(copy.registry()));

        let mut sum = 0.;
        for buffer in copy_resolver.resolve_get::<RwLock<Vec<f32>>>(&self.pattern)? {
            sum += buffer.read().iter().map(|v| v * v).sum::<f32>();
        }
        let norm = sum.sqrt();

        if let Some(shared) = registry.get_child("shared") {
            shared.set_value("param_norm", Arc::new(norm)).ok();
        }
        info!("parameter norm: epoch={epoch} norm={norm}");
        Ok(())
    }
}

/// Requests a cooperative stop once the global epoch reaches a limit, by
/// raising the `stop` flag on the shared registry. A global foreground
/// hook at epoch scale.
pub struct StopAfterEpochsHook {
    step: TimeStep,
    limit: usize,
}

impl StopAfterEpochsHook {
    pub fn new(limit: usize) -> Self {
        Self {
            step: TimeStep::every(TimeScale::Epoch),
            limit,
        }
    }
}

impl Hook for StopAfterEpochsHook {
    fn time_step(&self) -> TimeStep {
        self.step
    }

    fn functionally_equals(&self, other: &dyn Hook) -> bool {
        downcast::<Self>(other).is_some_and(|o| o.limit == self.limit)
    }

    fn invoke(
        &self,
        registry: &RegistryRef,
        _resolver: &Arc<RegistryResolver>,
    ) -> anyhow::Result<()> {
        let epoch = registry
            .get_as::<usize>("epoch")
            .ok_or_else(|| anyhow!("no epoch in the invocation registry"))?;

        if *epoch >= self.limit {
            let shared = registry
                .get_child("shared")
                .ok_or_else(|| anyhow!("no shared channel in the invocation registry"))?;
            shared.set_value("stop", Arc::new(true)).map_err(|e| anyhow!(e))?;
            info!("epoch limit {} reached, requesting stop", self.limit);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{optimization::GradientDescent, registry::Registry};

    #[test]
    fn learning_rate_decay_mutates_the_shared_optimizer() {
        let registry = Registry::root(["operator"]);
        let optimizer: Arc<Mutex<Box<dyn Optimizer>>> =
            Arc::new(Mutex::new(Box::new(GradientDescent::new(1.0))));
        registry.set_value("optimiser", optimizer.clone()).unwrap();
        let resolver = RegistryResolver::new(Arc::clone(&registry));

        let hook = LearningRateDecayHook::new(0.5);
        hook.invoke(&registry, &resolver).unwrap();
        hook.invoke(&registry, &resolver).unwrap();
        assert_eq!(optimizer.lock().learning_rate(), 0.25);
    }

    #[test]
    fn stop_hook_raises_the_flag_at_the_limit() {
        let registry = Registry::root(["operator"]);
        let shared = registry.child("shared", ["shared"]);
        let resolver = RegistryResolver::new(Arc::clone(&registry));
        let hook = StopAfterEpochsHook::new(3);

        registry.set_value("epoch", Arc::new(2usize)).unwrap();
        hook.invoke(&registry, &resolver).unwrap();
        assert!(shared.get_as::<bool>("stop").is_none());

        registry.set_value("epoch", Arc::new(3usize)).unwrap();
        hook.invoke(&registry, &resolver).unwrap();
        assert_eq!(*shared.get_as::<bool>("stop").unwrap(), true);
    }

    #[test]
    fn stock_hooks_deduplicate_by_configuration() {
        let a = StopAfterEpochsHook::new(3);
        let b = StopAfterEpochsHook::new(3);
        let c = StopAfterEpochsHook::new(4);

        assert!(a.functionally_equals(&b));
        assert!(b.functionally_equals(&a));
        assert!(!a.functionally_equals(&c));
        assert!(!a.functionally_equals(&LossLoggerHook::new(TimeStep::every(
            TimeScale::Iteration
        ))));
    }
}
