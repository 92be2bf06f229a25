use std::{any::Any, sync::Arc};

use ndarray::{ArrayView1, ArrayView2, ArrayViewMut2};
use parking_lot::{Mutex, RwLock};
use rand::{rngs::StdRng, SeedableRng};
use rand_distr::{Distribution, Uniform};

use crate::{
    data::Batch,
    error::{OperatorErr, Result},
    optimization::Optimizer,
    registry::{ParamBuffer, Registry, RegistryRef},
};

/// The trainable model as the operator sees it: a deep-copyable bundle of
/// flat `f32` parameter buffers exposed through a registry.
///
/// Parameters live under `layers.<name>.<param>` so mergers can address
/// them with match identifiers such as `layers.*.*`.
pub trait Network: Send {
    fn registry(&self) -> &RegistryRef;

    /// A deep copy with freshly owned parameter buffers.
    fn duplicate(&self) -> Box<dyn Network>;

    fn parameter_count(&self) -> usize;

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Shared handle to a network instance.
pub type NetworkRef = Arc<Mutex<Box<dyn Network>>>;

/// Wraps a network for shared ownership between the operator and workers.
pub fn shared(network: impl Network + 'static) -> NetworkRef {
    Arc::new(Mutex::new(Box::new(network)))
}

struct DenseLayer {
    dim_in: usize,
    dim_out: usize,
    weights: ParamBuffer,
    biases: ParamBuffer,
}

impl DenseLayer {
    fn forward(&self, input: &[f32]) -> Vec<f32> {
        let weights = self.weights.read();
        let biases = self.biases.read();

        let w = ArrayView2::from_shape((self.dim_out, self.dim_in), weights.as_slice())
            .expect("buffer length fixed at construction");
        let b = ArrayView1::from(biases.as_slice());
        (w.dot(&ArrayView1::from(input)) + b).to_vec()
    }
}

/// A stack of fully connected linear layers backed by registry-addressable
/// parameter buffers.
pub struct DenseNet {
    registry: RegistryRef,
    layers: Vec<DenseLayer>,
}

impl DenseNet {
    /// Creates a new `DenseNet`.
    ///
    /// # Arguments
    /// * `dims` - Layer widths from input to output, at least two entries.
    /// * `seed` - Seed for the Xavier-uniform weight initialization.
    pub fn new(dims: &[usize], seed: u64) -> Result<Self> {
        if dims.len() < 2 {
            return Err(OperatorErr::InvalidData {
                reason: "a network needs an input and an output width".to_string(),
            });
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let mut parts = Vec::with_capacity(dims.len() - 1);

        for pair in dims.windows(2) {
            let (dim_in, dim_out) = (pair[0], pair[1]);
            let range = (6. / (dim_in + dim_out) as f32).sqrt();
            let dist =
                Uniform::new_inclusive(-range, range).map_err(|e| OperatorErr::InvalidData {
                    reason: e.to_string(),
                })?;

            let weights: Vec<f32> = (0..dim_in * dim_out).map(|_| dist.sample(&mut rng)).collect();
            parts.push((dim_in, dim_out, weights, vec![0.; dim_out]));
        }
        Ok(Self::assemble(parts))
    }

    fn assemble(parts: Vec<(usize, usize, Vec<f32>, Vec<f32>)>) -> Self {
        let registry = Registry::root(["network"]);
        let layers_registry = registry.child("layers", ["layers"]);

        let layers = parts
            .into_iter()
            .enumerate()
            .map(|(i, (dim_in, dim_out, weights, biases))| {
                let weights: ParamBuffer = Arc::new(RwLock::new(weights));
                let biases: ParamBuffer = Arc::new(RwLock::new(biases));

                let layer_registry = layers_registry.child(&format!("l{i}"), Vec::<String>::new());
                layer_registry
                    .set_value("weights", weights.clone())
                    .expect("fresh registry carries no type associations");
                layer_registry
                    .set_value("biases", biases.clone())
                    .expect("fresh registry carries no type associations");

                DenseLayer {
                    dim_in,
                    dim_out,
                    weights,
                    biases,
                }
            })
            .collect();

        Self { registry, layers }
    }

    pub fn forward(&self, input: &[f32]) -> Vec<f32> {
        self.layers
            .iter()
            .fold(input.to_vec(), |activation, layer| layer.forward(&activation))
    }

    /// One mean-squared-error backpropagation pass over `batch`, applying
    /// the resulting gradients through `optimizer`.
    ///
    /// # Returns
    /// The batch-mean MSE loss before the update.
    pub fn train_mse(&mut self, optimizer: &mut dyn Optimizer, batch: &Batch) -> Result<f32> {
        if batch.rows == 0 {
            return Ok(0.);
        }

        let mut grads_w: Vec<Vec<f32>> = self
            .layers
            .iter()
            .map(|l| vec![0.; l.dim_in * l.dim_out])
            .collect();
        let mut grads_b: Vec<Vec<f32>> = self.layers.iter().map(|l| vec![0.; l.dim_out]).collect();
        let mut loss = 0.;

        for row in 0..batch.rows {
            let mut activations = vec![batch.input(row).to_vec()];
            for layer in &self.layers {
                let next = layer.forward(activations.last().expect("seeded with the input"));
                activations.push(next);
            }

            let output = activations.last().expect("seeded with the input");
            let mut delta: Vec<f32> = output
                .iter()
                .zip(batch.target(row))
                .map(|(o, t)| o - t)
                .collect();
            loss += delta.iter().map(|d| d * d).sum::<f32>();

            for k in (0..self.layers.len()).rev() {
                let layer = &self.layers[k];
                {
                    let prev = ArrayView1::from(activations[k].as_slice());
                    let mut gw =
                        ArrayViewMut2::from_shape((layer.dim_out, layer.dim_in), &mut grads_w[k][..])
                            .expect("gradient buffer matches layer shape");
                    for (i, &d) in delta.iter().enumerate() {
                        gw.row_mut(i).scaled_add(d, &prev);
                    }
                }
                grads_b[k].iter_mut().zip(&delta).for_each(|(g, d)| *g += d);

                if k > 0 {
                    let weights = layer.weights.read();
                    let w =
                        ArrayView2::from_shape((layer.dim_out, layer.dim_in), weights.as_slice())
                            .expect("buffer length fixed at construction");
                    delta = w.t().dot(&ArrayView1::from(delta.as_slice())).to_vec();
                }
            }
        }

        let inv_rows = 1. / batch.rows as f32;
        for (gw, gb) in grads_w.iter_mut().zip(&mut grads_b) {
            gw.iter_mut().for_each(|g| *g *= inv_rows);
            gb.iter_mut().for_each(|g| *g *= inv_rows);
        }

        for (k, layer) in self.layers.iter().enumerate() {
            optimizer.update_params(&grads_w[k], &mut layer.weights.write())?;
            optimizer.update_params(&grads_b[k], &mut layer.biases.write())?;
        }
        Ok(loss * 0.5 * inv_rows)
    }
}

impl Network for DenseNet {
    fn registry(&self) -> &RegistryRef {
        &self.registry
    }

    fn duplicate(&self) -> Box<dyn Network> {
        let parts = self
            .layers
            .iter()
            .map(|l| {
                (
                    l.dim_in,
                    l.dim_out,
                    l.weights.read().clone(),
                    l.biases.read().clone(),
                )
            })
            .collect();
        Box::new(Self::assemble(parts))
    }

    fn parameter_count(&self) -> usize {
        self.layers
            .iter()
            .map(|l| l.dim_in * l.dim_out + l.dim_out)
            .sum()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::RegistryResolver;

    #[test]
    fn parameters_resolve_through_the_registry() {
        let net = DenseNet::new(&[2, 3, 1], 7).unwrap();
        let resolver = RegistryResolver::new(Arc::clone(net.registry()));

        let buffers = resolver
            .resolve_get::<RwLock<Vec<f32>>>("layers.*.*")
            .unwrap();
        // Two layers, weights and biases each.
        assert_eq!(buffers.len(), 4);
        assert_eq!(net.parameter_count(), 2 * 3 + 3 + 3 + 1);
    }

    #[test]
    fn duplicate_owns_its_buffers() {
        let net = DenseNet::new(&[1, 1], 7).unwrap();
        let copy = net.duplicate();

        net.layers[0].weights.write()[0] = 42.0;
        let resolver = RegistryResolver::new(Arc::clone(copy.registry()));
        let weights = resolver
            .resolve_get_single::<RwLock<Vec<f32>>>("layers.l0.weights")
            .unwrap();
        assert_ne!(weights.read()[0], 42.0);
    }

    #[test]
    fn training_reduces_loss_on_a_linear_fit() {
        // y = 2x + 1
        let batch = Batch {
            inputs: vec![1., 2., 3., 4.],
            targets: vec![3., 5., 7., 9.],
            input_size: 1,
            target_size: 1,
            rows: 4,
        };

        let mut net = DenseNet::new(&[1, 1], 3).unwrap();
        let mut opt = crate::optimization::GradientDescent::new(0.05);

        let first = net.train_mse(&mut opt, &batch).unwrap();
        let mut last = first;
        for _ in 0..200 {
            last = net.train_mse(&mut opt, &batch).unwrap();
        }
        assert!(last < first * 0.01, "loss did not shrink: {first} -> {last}");

        let prediction = net.forward(&[5.])[0];
        assert!((prediction - 11.).abs() < 0.5, "prediction off: {prediction}");
    }
}
