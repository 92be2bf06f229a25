use ndarray::{ArrayView1, ArrayViewMut1};

use crate::error::{OperatorErr, Result};

/// Defines the strategy for updating model parameters based on calculated
/// gradients.
///
/// The operator deep-copies its optimizer prototype into every worker via
/// `duplicate`, so implementations carry their own state (velocities,
/// moments) per copy.
pub trait Optimizer: Send {
    /// Applies one gradient to a flat parameter buffer.
    ///
    /// # Arguments
    /// * `grad` - A reference to the parameter gradient.
    /// * `params` - The parameters to update.
    ///
    /// # Returns
    /// An error if there's a mismatch in the sizes of `grad` and `params`.
    fn update_params(&mut self, grad: &[f32], params: &mut [f32]) -> Result<()>;

    fn learning_rate(&self) -> f32;

    fn set_learning_rate(&mut self, learning_rate: f32);

    /// A deep copy with freshly reset internal state.
    fn duplicate(&self) -> Box<dyn Optimizer>;
}

fn check_lengths(grad: &[f32], params: &[f32]) -> Result<()> {
    if grad.len() != params.len() {
        return Err(OperatorErr::SizeMismatch {
            got: grad.len(),
            expected: params.len(),
        });
    }
    Ok(())
}

/// Plain stochastic gradient descent: walks each parameter a fixed step
/// against its gradient.
#[derive(Debug, Clone)]
pub struct GradientDescent {
    learning_rate: f32,
}

impl GradientDescent {
    /// # Arguments
    /// * `learning_rate` - Step size applied to every gradient.
    pub fn new(learning_rate: f32) -> Self {
        Self { learning_rate }
    }
}

impl Optimizer for GradientDescent {
    fn update_params(&mut self, grad: &[f32], params: &mut [f32]) -> Result<()> {
        check_lengths(grad, params)?;

        // params -= learning_rate * grad
        ArrayViewMut1::from(params).scaled_add(-self.learning_rate, &ArrayView1::from(grad));
        Ok(())
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, learning_rate: f32) {
        self.learning_rate = learning_rate;
    }

    fn duplicate(&self) -> Box<dyn Optimizer> {
        Box::new(self.clone())
    }
}

/// Gradient descent with a velocity term that smooths successive updates.
#[derive(Debug, Clone)]
pub struct GradientDescentWithMomentum {
    learning_rate: f32,
    momentum: f32,
    velocity: Box<[f32]>,
}

impl GradientDescentWithMomentum {
    /// # Arguments
    /// * `len` - The amount of parameters this instance should hold.
    /// * `learning_rate` - Step size applied to the velocity on every update.
    /// * `momentum` - Fraction of the previous velocity retained per step.
    pub fn new(len: usize, learning_rate: f32, momentum: f32) -> Self {
        Self {
            learning_rate,
            momentum,
            velocity: vec![0.; len].into_boxed_slice(),
        }
    }
}

impl Optimizer for GradientDescentWithMomentum {
    fn update_params(&mut self, grad: &[f32], params: &mut [f32]) -> Result<()> {
        check_lengths(grad, params)?;
        check_lengths(grad, &self.velocity)?;

        // velocity = momentum * velocity + grad, then step along it.
        let mut velocity = ArrayViewMut1::from(&mut self.velocity[..]);
        velocity *= self.momentum;
        velocity += &ArrayView1::from(grad);

        ArrayViewMut1::from(params).scaled_add(-self.learning_rate, &velocity);
        Ok(())
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, learning_rate: f32) {
        self.learning_rate = learning_rate;
    }

    fn duplicate(&self) -> Box<dyn Optimizer> {
        // Fresh velocity: copies train independently from a clean slate.
        Box::new(Self::new(self.velocity.len(), self.learning_rate, self.momentum))
    }
}
