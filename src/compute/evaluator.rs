//! Scoring a weight set on a fixed validation set.

use std::sync::Arc;

use super::dataset::Dataset;
use super::model::ModelProvider;
use super::tensor::Weights;
use super::FederatedError;

/// Maps a weight set to `(loss, accuracy)`.
pub trait Evaluator: Send + Sync {
    fn evaluate(&self, weights: &Weights) -> Result<(f32, f32), FederatedError>;
}

/// Evaluates weights by loading them into a fresh provider model.
pub struct ModelEvaluator {
    provider: Arc<dyn ModelProvider>,
    xy_val: Dataset,
}

impl ModelEvaluator {
    pub fn new(provider: Arc<dyn ModelProvider>, xy_val: Dataset) -> Self {
        Self { provider, xy_val }
    }
}

impl Evaluator for ModelEvaluator {
    fn evaluate(&self, weights: &Weights) -> Result<(f32, f32), FederatedError> {
        let mut model = self.provider.init_model(None);
        model.set_weights(weights.clone())?;
        // The validation set is scored in one pass.
        model.evaluate(&self.xy_val)
    }
}
