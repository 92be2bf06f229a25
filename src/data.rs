use std::{num::NonZeroUsize, sync::Arc};

use rand::seq::SliceRandom;

use crate::error::{OperatorErr, Result};

/// One batch of training rows, row-major.
#[derive(Debug, Clone)]
pub struct Batch {
    pub inputs: Vec<f32>,
    pub targets: Vec<f32>,
    pub input_size: usize,
    pub target_size: usize,
    pub rows: usize,
}

impl Batch {
    pub fn input(&self, row: usize) -> &[f32] {
        &self.inputs[row * self.input_size..(row + 1) * self.input_size]
    }

    pub fn target(&self, row: usize) -> &[f32] {
        &self.targets[row * self.target_size..(row + 1) * self.target_size]
    }
}

/// An immutable in-memory training set, row-major.
#[derive(Debug)]
pub struct Dataset {
    input_size: usize,
    target_size: usize,
    rows: usize,
    inputs: Vec<f32>,
    targets: Vec<f32>,
}

impl Dataset {
    /// Creates a new `Dataset`.
    ///
    /// # Arguments
    /// * `inputs` - Row-major input values, `rows * input_size` long.
    /// * `targets` - Row-major target values, `rows * target_size` long.
    pub fn new(
        inputs: Vec<f32>,
        targets: Vec<f32>,
        input_size: usize,
        target_size: usize,
    ) -> Result<Self> {
        if input_size == 0 || target_size == 0 {
            return Err(OperatorErr::InvalidData {
                reason: "row sizes must be positive".to_string(),
            });
        }
        if inputs.len() % input_size != 0 {
            return Err(OperatorErr::InvalidData {
                reason: format!(
                    "input length {} is not a multiple of row size {input_size}",
                    inputs.len()
                ),
            });
        }

        let rows = inputs.len() / input_size;
        if targets.len() != rows * target_size {
            return Err(OperatorErr::InvalidData {
                reason: format!(
                    "target length {} does not cover {rows} rows of size {target_size}",
                    targets.len()
                ),
            });
        }

        Ok(Self {
            input_size,
            target_size,
            rows,
            inputs,
            targets,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    pub fn target_size(&self) -> usize {
        self.target_size
    }
}

/// Yields batches of a training set. One copy per worker.
pub trait DataIterator: Send {
    /// The next batch of the current epoch, or `None` once exhausted.
    fn next_batch(&mut self) -> Option<Batch>;

    /// Rewinds to the start of a fresh epoch.
    fn reset(&mut self);

    /// A shallow copy sharing the backing data, with an independent cursor.
    fn split(&self) -> Box<dyn DataIterator>;
}

/// Sequential batches over a shared in-memory dataset.
pub struct SliceIterator {
    data: Arc<Dataset>,
    batch_size: NonZeroUsize,
    /// Visit order of rows, reshuffled on every reset when a seed is set.
    order: Vec<usize>,
    shuffle: Option<rand::rngs::StdRng>,
    cursor: usize,
}

impl SliceIterator {
    pub fn new(data: Arc<Dataset>, batch_size: NonZeroUsize) -> Self {
        Self {
            order: (0..data.rows()).collect(),
            data,
            batch_size,
            shuffle: None,
            cursor: 0,
        }
    }

    /// Shuffles the visit order on every reset, seeded for reproducibility.
    pub fn shuffled(mut self, seed: u64) -> Self {
        use rand::SeedableRng;

        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        self.order.shuffle(&mut rng);
        self.shuffle = Some(rng);
        self
    }
}

impl DataIterator for SliceIterator {
    fn next_batch(&mut self) -> Option<Batch> {
        if self.cursor >= self.data.rows() {
            return None;
        }

        let end = (self.cursor + self.batch_size.get()).min(self.data.rows());
        let rows = end - self.cursor;
        let input_size = self.data.input_size();
        let target_size = self.data.target_size();

        let mut inputs = Vec::with_capacity(rows * input_size);
        let mut targets = Vec::with_capacity(rows * target_size);
        for &row in &self.order[self.cursor..end] {
            inputs.extend_from_slice(&self.data.inputs[row * input_size..(row + 1) * input_size]);
            targets
                .extend_from_slice(&self.data.targets[row * target_size..(row + 1) * target_size]);
        }

        self.cursor = end;
        Some(Batch {
            inputs,
            targets,
            input_size,
            target_size,
            rows,
        })
    }

    fn reset(&mut self) {
        self.cursor = 0;
        if let Some(rng) = &mut self.shuffle {
            self.order.shuffle(rng);
        }
    }

    fn split(&self) -> Box<dyn DataIterator> {
        let mut copy = SliceIterator::new(Arc::clone(&self.data), self.batch_size);
        if let Some(rng) = &self.shuffle {
            copy.shuffle = Some(rng.clone());
            copy.order = self.order.clone();
        }
        Box::new(copy)
    }
}
