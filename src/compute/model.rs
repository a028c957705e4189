//! Trainable model abstraction and a softmax-regression reference model.

use rand::prelude::*;
use rand_distr::Normal;

use super::dataset::{Batch, Dataset};
use super::tensor::{Tensor, Weights, check_same_shape};
use super::FederatedError;
use crate::schema::ModelConfig;

/// Training loss and accuracy for one epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EpochMetrics {
    pub loss: f32,
    pub accuracy: f32,
}

/// A model instance whose parameters can be read, replaced and trained.
pub trait Model: Send {
    /// Copy of the current parameters.
    fn weights(&self) -> Weights;

    /// Replace the parameters. Shapes must match the model's own.
    fn set_weights(&mut self, weights: Weights) -> Result<(), FederatedError>;

    /// Run `steps` mini-batches of `batch_size` over `data`, in stored order.
    fn fit_epoch(
        &mut self,
        data: &Dataset,
        batch_size: usize,
        steps: usize,
    ) -> Result<EpochMetrics, FederatedError>;

    /// Loss and accuracy over all of `data` in a single pass.
    fn evaluate(&self, data: &Dataset) -> Result<(f32, f32), FederatedError>;
}

/// Creates fresh model instances.
pub trait ModelProvider: Send + Sync {
    /// A new model. `epoch_base` is the number of epochs already trained
    /// globally, used for schedules that depend on training progress.
    fn init_model(&self, epoch_base: Option<usize>) -> Box<dyn Model>;
}

/// Linear layer followed by softmax, trained with plain mini-batch SGD.
///
/// Weights are `[W: feature_dim x num_classes, b: num_classes]`.
#[derive(Debug, Clone)]
pub struct SoftmaxRegression {
    kernel: Tensor,
    bias: Tensor,
    feature_dim: usize,
    num_classes: usize,
    learning_rate: f32,
    lr_decay: f32,
    epoch: usize,
}

impl SoftmaxRegression {
    /// Zero-initialised model.
    pub fn new(feature_dim: usize, num_classes: usize, config: &ModelConfig) -> Self {
        Self {
            kernel: Tensor::zeros(&[feature_dim, num_classes]),
            bias: Tensor::zeros(&[num_classes]),
            feature_dim,
            num_classes,
            learning_rate: config.learning_rate,
            lr_decay: config.lr_decay,
            epoch: 0,
        }
    }

    /// Set the global epoch the next `fit_epoch` call counts as.
    pub fn with_epoch(mut self, epoch: usize) -> Self {
        self.epoch = epoch;
        self
    }

    /// Learning rate for the current epoch.
    #[inline]
    pub fn current_learning_rate(&self) -> f32 {
        self.learning_rate / (1.0 + self.lr_decay * self.epoch as f32)
    }

    fn check_data(&self, data: &Dataset) -> Result<(), FederatedError> {
        if data.feature_dim() != self.feature_dim {
            return Err(FederatedError::contract(format!(
                "model expects {} features, dataset has {}",
                self.feature_dim,
                data.feature_dim()
            )));
        }
        if let Some(&label) = data.labels().iter().find(|&&l| l >= self.num_classes) {
            return Err(FederatedError::contract(format!(
                "label {} out of range for {} classes",
                label, self.num_classes
            )));
        }
        Ok(())
    }

    /// Softmax probabilities for one row, written into `probs`.
    fn predict_into(&self, x: &[f32], probs: &mut [f32]) {
        let w = self.kernel.data();
        probs.copy_from_slice(self.bias.data());
        for (f, &xf) in x.iter().enumerate() {
            let row = &w[f * self.num_classes..(f + 1) * self.num_classes];
            for (p, &wfc) in probs.iter_mut().zip(row) {
                *p += xf * wfc;
            }
        }

        let max = probs.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0.0;
        for p in probs.iter_mut() {
            *p = (*p - max).exp();
            sum += *p;
        }
        for p in probs.iter_mut() {
            *p /= sum;
        }
    }

    /// Summed loss and number of correct predictions for a batch.
    fn batch_stats(&self, batch: Batch<'_>, probs: &mut [f32]) -> (f32, usize) {
        let mut loss = 0.0;
        let mut correct = 0;
        for (x, &y) in batch.features.chunks(self.feature_dim).zip(batch.labels) {
            self.predict_into(x, probs);
            loss -= probs[y].max(1e-12).ln();
            if argmax(probs) == y {
                correct += 1;
            }
        }
        (loss, correct)
    }

    /// One SGD step on `batch`, returning its pre-update loss and hits.
    fn train_batch(&mut self, batch: Batch<'_>, lr: f32) -> (f32, usize) {
        let c = self.num_classes;
        let mut probs = vec![0.0f32; c];
        let mut grad_w = vec![0.0f32; self.feature_dim * c];
        let mut grad_b = vec![0.0f32; c];
        let mut loss = 0.0;
        let mut correct = 0;

        for (x, &y) in batch.features.chunks(self.feature_dim).zip(batch.labels) {
            self.predict_into(x, &mut probs);
            loss -= probs[y].max(1e-12).ln();
            if argmax(&probs) == y {
                correct += 1;
            }

            // d(loss)/d(logits) = p - onehot(y)
            probs[y] -= 1.0;
            for (f, &xf) in x.iter().enumerate() {
                for (g, &d) in grad_w[f * c..(f + 1) * c].iter_mut().zip(&probs) {
                    *g += xf * d;
                }
            }
            for (g, &d) in grad_b.iter_mut().zip(&probs) {
                *g += d;
            }
        }

        let step = lr / batch.len().max(1) as f32;
        for (w, g) in self.kernel.data_mut().iter_mut().zip(&grad_w) {
            *w -= step * g;
        }
        for (b, g) in self.bias.data_mut().iter_mut().zip(&grad_b) {
            *b -= step * g;
        }

        (loss, correct)
    }
}

impl Model for SoftmaxRegression {
    fn weights(&self) -> Weights {
        vec![self.kernel.clone(), self.bias.clone()]
    }

    fn set_weights(&mut self, weights: Weights) -> Result<(), FederatedError> {
        check_same_shape(&self.weights(), &weights)?;
        let mut it = weights.into_iter();
        if let (Some(kernel), Some(bias)) = (it.next(), it.next()) {
            self.kernel = kernel;
            self.bias = bias;
        }
        Ok(())
    }

    fn fit_epoch(
        &mut self,
        data: &Dataset,
        batch_size: usize,
        steps: usize,
    ) -> Result<EpochMetrics, FederatedError> {
        self.check_data(data)?;
        if data.is_empty() {
            return Err(FederatedError::contract("cannot train on an empty dataset"));
        }

        let lr = self.current_learning_rate();
        let mut loss = 0.0;
        let mut correct = 0;
        let mut seen = 0;
        for batch in data.batches(batch_size).take(steps.max(1)) {
            let (l, c) = self.train_batch(batch, lr);
            loss += l;
            correct += c;
            seen += batch.len();
        }
        self.epoch += 1;

        Ok(EpochMetrics {
            loss: loss / seen as f32,
            accuracy: correct as f32 / seen as f32,
        })
    }

    fn evaluate(&self, data: &Dataset) -> Result<(f32, f32), FederatedError> {
        self.check_data(data)?;
        if data.is_empty() {
            return Err(FederatedError::contract("cannot evaluate on an empty dataset"));
        }
        let mut probs = vec![0.0f32; self.num_classes];
        let (loss, correct) = self.batch_stats(data.as_batch(), &mut probs);
        let n = data.len() as f32;
        Ok((loss / n, correct as f32 / n))
    }
}

fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |best, (i, &v)| {
            if v > best.1 { (i, v) } else { best }
        })
        .0
}

/// Builds `SoftmaxRegression` models that all start from the same
/// seeded random initialisation.
#[derive(Debug, Clone)]
pub struct SoftmaxRegressionProvider {
    feature_dim: usize,
    num_classes: usize,
    config: ModelConfig,
    seed: u64,
}

impl SoftmaxRegressionProvider {
    pub fn new(feature_dim: usize, num_classes: usize, config: ModelConfig, seed: u64) -> Self {
        Self {
            feature_dim,
            num_classes,
            config,
            seed,
        }
    }

    fn initial_model(&self) -> SoftmaxRegression {
        let mut model = SoftmaxRegression::new(self.feature_dim, self.num_classes, &self.config);
        if self.config.init_scale > 0.0
            && let Ok(dist) = Normal::new(0.0f32, self.config.init_scale)
        {
            let mut rng = StdRng::seed_from_u64(self.seed);
            for w in model.kernel.data_mut() {
                *w = rng.sample(dist);
            }
        }
        model
    }
}

impl ModelProvider for SoftmaxRegressionProvider {
    fn init_model(&self, epoch_base: Option<usize>) -> Box<dyn Model> {
        Box::new(self.initial_model().with_epoch(epoch_base.unwrap_or(0)))
    }
}
