//! Simulated federated participant holding a private data partition.

use std::sync::Arc;

use super::aggregate::WeightUpdate;
use super::dataset::Dataset;
use super::model::ModelProvider;
use super::tensor::Weights;
use super::FederatedError;
use crate::schema::{ParticipantMetrics, TrainingHistory};

/// One client: an immutable train/validation partition plus a model provider.
pub struct Participant {
    cid: usize,
    provider: Arc<dyn ModelProvider>,
    xy_train: Dataset,
    xy_val: Dataset,
    batch_size: usize,
    num_examples: usize,
    steps_train: usize,
    /// Label distribution of `xy_train`, computed once.
    volume_by_class: Vec<usize>,
}

impl Participant {
    pub fn new(
        cid: usize,
        provider: Arc<dyn ModelProvider>,
        xy_train: Dataset,
        xy_val: Dataset,
        num_classes: usize,
        batch_size: usize,
    ) -> Result<Self, FederatedError> {
        if xy_train.is_empty() {
            return Err(FederatedError::contract(format!(
                "participant {} has no training examples",
                cid
            )));
        }
        if batch_size == 0 {
            return Err(FederatedError::contract("batch size must be non-zero"));
        }
        if !xy_val.is_empty() && xy_val.feature_dim() != xy_train.feature_dim() {
            return Err(FederatedError::contract(format!(
                "participant {} has mismatched train/validation features",
                cid
            )));
        }

        let num_examples = xy_train.len();
        let volume_by_class = xy_train.volume_by_class(num_classes)?;

        Ok(Self {
            cid,
            provider,
            xy_train,
            xy_val,
            batch_size,
            num_examples,
            // A partition smaller than one batch still trains on what it has.
            steps_train: (num_examples / batch_size).max(1),
            volume_by_class,
        })
    }

    #[inline]
    pub fn cid(&self) -> usize {
        self.cid
    }

    #[inline]
    pub fn num_examples(&self) -> usize {
        self.num_examples
    }

    #[inline]
    pub fn steps_per_epoch(&self) -> usize {
        self.steps_train
    }

    /// Train one round starting from the broadcast weights `theta`.
    ///
    /// A fresh local model is created and overwritten with `theta`, so every
    /// selected participant starts the round from the same global state.
    pub fn train_round(
        &self,
        theta: Weights,
        epochs: usize,
        epoch_base: usize,
    ) -> Result<(WeightUpdate, TrainingHistory), FederatedError> {
        log::info!(
            "Participant {}: train_round START (epoch_base: {})",
            self.cid,
            epoch_base
        );

        let mut model = self.provider.init_model(Some(epoch_base));
        model.set_weights(theta)?;

        let mut history = TrainingHistory::default();
        for epoch in 0..epochs {
            let metrics = model.fit_epoch(&self.xy_train, self.batch_size, self.steps_train)?;
            history.loss.push(metrics.loss);
            history.acc.push(metrics.accuracy);

            if !self.xy_val.is_empty() {
                let (val_loss, val_acc) = model.evaluate(&self.xy_val)?;
                history.val_loss.push(val_loss);
                history.val_acc.push(val_acc);
            }
            log::debug!(
                "CID {} epoch {}: loss {:.4}, acc {:.4}",
                self.cid,
                epoch,
                metrics.loss,
                metrics.accuracy
            );
        }

        let update = WeightUpdate {
            weights: model.weights(),
            num_examples: self.num_examples,
        };
        log::info!("Participant {}: train_round FINISH", self.cid);
        Ok((update, history))
    }

    /// Participant id and per-class example counts of the training partition.
    pub fn metrics(&self) -> ParticipantMetrics {
        ParticipantMetrics {
            cid: self.cid,
            volume_by_class: self.volume_by_class.clone(),
        }
    }

    /// Diagnostic helper: score `theta` on `xy_test` with a fresh model.
    pub fn evaluate(&self, theta: Weights, xy_test: &Dataset) -> Result<(f32, f32), FederatedError> {
        let mut model = self.provider.init_model(None);
        model.set_weights(theta)?;
        model.evaluate(xy_test)
    }
}
