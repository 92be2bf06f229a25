use std::sync::Arc;

use parking_lot::RwLock;
use rayon::prelude::*;

use crate::{
    error::{OperatorErr, Result},
    handler::Handler,
    net::Network,
    registry::{ParamBuffer, RegistryResolver},
};

/// Reduces the networks pushed by all workers for one epoch into the
/// authoritative network.
///
/// Implementations must be all-or-nothing with respect to the
/// authoritative parameters: on error, nothing may have been written.
pub trait NetworkMerger: Send + Sync {
    /// # Args
    /// * `authoritative` - The operator's network, updated in place.
    /// * `pushed` - One network per worker, in slot order.
    /// * `handler` - The compute backend for the reduction arithmetic.
    fn merge(
        &self,
        authoritative: &mut dyn Network,
        pushed: &[Box<dyn Network>],
        handler: &dyn Handler,
    ) -> Result<()>;
}

/// Averages every parameter buffer selected by a registry match pattern
/// across the pushed networks.
pub struct AverageMerger {
    pattern: String,
}

impl AverageMerger {
    /// Creates a new `AverageMerger`.
    ///
    /// # Arguments
    /// * `pattern` - Match identifier selecting the buffers to average,
    ///   resolved against each network's registry.
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
        }
    }
}

impl Default for AverageMerger {
    fn default() -> Self {
        Self::new("layers.*.*")
    }
}

impl NetworkMerger for AverageMerger {
    fn merge(
        &self,
        authoritative: &mut dyn Network,
        pushed: &[Box<dyn Network>],
        handler: &dyn Handler,
    ) -> Result<()> {
        if pushed.is_empty() {
            return Ok(());
        }

        let resolver = RegistryResolver::new(Arc::clone(authoritative.registry()));
        let sources: Vec<_> = pushed
            .iter()
            .map(|net| RegistryResolver::new(Arc::clone(net.registry())))
            .collect();

        // Validate the whole plan before touching any buffer so a partial
        // merge can never land in the authoritative network.
        let mut plan: Vec<(ParamBuffer, Vec<ParamBuffer>)> = Vec::new();
        for entry in resolver.resolve_entries(&self.pattern)? {
            let identifier = entry.identifier();
            let Some(target) = entry.registry.get_as::<RwLock<Vec<f32>>>(&entry.key) else {
                continue;
            };
            let len = target.read().len();

            let mut inputs = Vec::with_capacity(sources.len());
            for source in &sources {
                let buffer = source
                    .resolve_get_single::<RwLock<Vec<f32>>>(&identifier)
                    .map_err(|_| OperatorErr::MergeMismatch {
                        identifier: identifier.clone(),
                    })?;
                if buffer.read().len() != len {
                    return Err(OperatorErr::MergeMismatch { identifier });
                }
                inputs.push(buffer);
            }
            plan.push((target, inputs));
        }

        let inv = 1. / pushed.len() as f32;
        plan.par_iter().for_each(|(target, inputs)| {
            let mut out = target.write();
            handler.fill(&mut out, 0.);
            for input in inputs {
                handler.accumulate(&mut out, &input.read());
            }
            handler.scale(&mut out, inv);
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{handler::CpuHandler, net::DenseNet};

    fn constant_net(value: f32) -> Box<dyn Network> {
        let net = DenseNet::new(&[1, 1], 0).unwrap();
        let resolver = RegistryResolver::new(Arc::clone(net.registry()));
        for buffer in resolver
            .resolve_get::<RwLock<Vec<f32>>>("layers.*.*")
            .unwrap()
        {
            buffer.write().fill(value);
        }
        Box::new(net)
    }

    #[test]
    fn averages_across_pushed_networks() {
        let mut authoritative = constant_net(0.);
        let pushed = vec![constant_net(1.), constant_net(3.)];

        AverageMerger::default()
            .merge(authoritative.as_mut(), &pushed, &CpuHandler)
            .unwrap();

        let resolver = RegistryResolver::new(Arc::clone(authoritative.registry()));
        for buffer in resolver
            .resolve_get::<RwLock<Vec<f32>>>("layers.*.*")
            .unwrap()
        {
            assert!(buffer.read().iter().all(|&v| v == 2.));
        }
    }

    #[test]
    fn mismatched_topologies_leave_the_authoritative_untouched() {
        let mut authoritative = constant_net(5.);
        let pushed: Vec<Box<dyn Network>> =
            vec![Box::new(DenseNet::new(&[2, 2], 0).unwrap()), constant_net(1.)];

        let err = AverageMerger::default().merge(authoritative.as_mut(), &pushed, &CpuHandler);
        assert!(matches!(err, Err(OperatorErr::MergeMismatch { .. })));

        let resolver = RegistryResolver::new(Arc::clone(authoritative.registry()));
        for buffer in resolver
            .resolve_get::<RwLock<Vec<f32>>>("layers.*.*")
            .unwrap()
        {
            assert!(buffer.read().iter().all(|&v| v == 5.));
        }
    }
}
