use crate::{
    data::Batch,
    error::{OperatorErr, Result},
    net::{DenseNet, Network},
    optimization::Optimizer,
};

/// Abstraction over the local training computation executed by a worker.
///
/// Implementations encapsulate all model-, data-, and loss-specific logic.
/// The worker treats this trait as a black box that turns a batch into
/// parameter updates; the specific composition of models, losses, and
/// batching policies lives behind it.
pub trait TrainStep: Send {
    /// Executes one local training step.
    ///
    /// # Args
    /// * `network` - The worker's local network copy.
    /// * `optimizer` - The worker's local optimizer copy.
    /// * `batch` - The rows to train on.
    ///
    /// # Returns
    /// The step loss on success.
    fn step(
        &mut self,
        network: &mut dyn Network,
        optimizer: &mut dyn Optimizer,
        batch: &Batch,
    ) -> Result<f32>;

    /// A fresh copy for one worker.
    fn duplicate(&self) -> Box<dyn TrainStep>;
}

/// Mean-squared-error backpropagation over a `DenseNet`.
#[derive(Debug, Default, Clone, Copy)]
pub struct MseStep;

impl TrainStep for MseStep {
    fn step(
        &mut self,
        network: &mut dyn Network,
        optimizer: &mut dyn Optimizer,
        batch: &Batch,
    ) -> Result<f32> {
        let net = network
            .as_any_mut()
            .downcast_mut::<DenseNet>()
            .ok_or(OperatorErr::UnsupportedNetwork { expected: "DenseNet" })?;
        net.train_mse(optimizer, batch)
    }

    fn duplicate(&self) -> Box<dyn TrainStep> {
        Box::new(*self)
    }
}
