//! Configuration types for federated learning simulations.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level simulation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederatedConfig {
    /// Number of simulated participants (N).
    pub num_participants: usize,
    /// Fraction of participants selected per round (C).
    pub participation: f64,
    /// Local epochs each selected participant trains per round (E).
    pub local_epochs: usize,
    /// Number of federated rounds.
    pub rounds: usize,
    /// Local mini-batch size.
    pub batch_size: usize,
    /// How local training is dispatched.
    #[serde(default)]
    pub dispatch: DispatchMode,
    /// Aggregation strategy.
    #[serde(default)]
    pub aggregator: AggregatorConfig,
    /// Participant selection strategy.
    #[serde(default)]
    pub controller: ControllerConfig,
    /// Synthetic dataset and partitioning.
    #[serde(default)]
    pub dataset: DatasetConfig,
    /// Reference model hyperparameters.
    #[serde(default)]
    pub model: ModelConfig,
    /// Random seed for reproducibility.
    #[serde(default)]
    pub random_seed: Option<u64>,
    /// Directory for results and per-round logs.
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
}

impl Default for FederatedConfig {
    fn default() -> Self {
        Self {
            num_participants: 10,
            participation: 0.3,
            local_epochs: 1,
            rounds: 5,
            batch_size: 16,
            dispatch: DispatchMode::default(),
            aggregator: AggregatorConfig::default(),
            controller: ControllerConfig::default(),
            dataset: DatasetConfig::default(),
            model: ModelConfig::default(),
            random_seed: None,
            output_dir: None,
        }
    }
}

/// Local training dispatch mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DispatchMode {
    /// One parallel task per selected participant.
    #[default]
    Concurrent,
    /// Train participants one after another on the coordinator thread.
    Sequential,
}

/// Aggregation strategy selection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum AggregatorConfig {
    /// Pass through the single participant's weights.
    Identity,
    /// Example-count weighted average (FedAvg).
    #[default]
    FederatedAveraging,
    /// Random weightings scored on the validation set.
    Evolutionary(EvolutionaryConfig),
}

/// Evolutionary aggregation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolutionaryConfig {
    /// Number of candidate weightings per round.
    #[serde(default = "default_candidates")]
    pub candidates: usize,
    /// Lower bound of each weighting entry.
    #[serde(default = "default_weighting_low")]
    pub low: f32,
    /// Upper bound of each weighting entry.
    #[serde(default = "default_weighting_high")]
    pub high: f32,
}

impl Default for EvolutionaryConfig {
    fn default() -> Self {
        Self {
            candidates: default_candidates(),
            low: default_weighting_low(),
            high: default_weighting_high(),
        }
    }
}

fn default_candidates() -> usize {
    3
}
fn default_weighting_low() -> f32 {
    0.5
}
fn default_weighting_high() -> f32 {
    1.5
}

/// Participant selection strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControllerConfig {
    /// Fresh random sample every round.
    #[default]
    Random,
    /// Walk a random permutation so every participant is visited before repeats.
    CycleRandom,
}

/// Synthetic classification dataset settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// Number of label classes.
    pub num_classes: usize,
    /// Feature vector length.
    pub feature_dim: usize,
    /// Examples shared out across participants.
    pub train_examples: usize,
    /// Examples held back for global validation.
    pub validation_examples: usize,
    /// Fraction of each participant's partition kept for local validation.
    #[serde(default = "default_local_validation")]
    pub local_validation: f32,
    /// Standard deviation of class centroids.
    #[serde(default = "default_class_separation")]
    pub class_separation: f32,
    /// Standard deviation of examples around their centroid.
    #[serde(default = "default_noise")]
    pub noise: f32,
    /// How training examples are split between participants.
    #[serde(default)]
    pub partition: PartitionConfig,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            num_classes: 10,
            feature_dim: 16,
            train_examples: 2000,
            validation_examples: 500,
            local_validation: default_local_validation(),
            class_separation: default_class_separation(),
            noise: default_noise(),
            partition: PartitionConfig::default(),
        }
    }
}

fn default_local_validation() -> f32 {
    0.1
}
fn default_class_separation() -> f32 {
    2.0
}
fn default_noise() -> f32 {
    1.0
}

/// Partitioning of the training set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method")]
pub enum PartitionConfig {
    /// Shuffle then cut into equal-sized splits.
    #[default]
    Iid,
    /// Sort by label, cut into sections, give each participant a few sections.
    SortedLabels { classes_per_partition: usize },
}

/// Reference model hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// SGD learning rate.
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f32,
    /// Inverse-time learning rate decay per epoch.
    #[serde(default)]
    pub lr_decay: f32,
    /// Standard deviation of initial weights.
    #[serde(default = "default_init_scale")]
    pub init_scale: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            lr_decay: 0.0,
            init_scale: default_init_scale(),
        }
    }
}

fn default_learning_rate() -> f32 {
    0.1
}
fn default_init_scale() -> f32 {
    0.01
}

impl FederatedConfig {
    /// Validate configuration parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_participants == 0 {
            return Err(ConfigError::NoParticipants);
        }
        if !self.participation.is_finite() || !(0.0..=1.0).contains(&self.participation) {
            return Err(ConfigError::InvalidParticipation(self.participation));
        }
        if self.local_epochs == 0 {
            return Err(ConfigError::InvalidEpochs);
        }
        if self.batch_size == 0 {
            return Err(ConfigError::InvalidBatchSize);
        }

        match &self.aggregator {
            AggregatorConfig::Identity => {
                let per_round = crate::compute::abs_c(self.participation, self.num_participants);
                if per_round != 1 {
                    return Err(ConfigError::IdentityNeedsSingleParticipant(per_round));
                }
            }
            AggregatorConfig::FederatedAveraging => {}
            AggregatorConfig::Evolutionary(evo) => {
                if evo.candidates == 0 {
                    return Err(ConfigError::NoCandidates);
                }
                if !(evo.low > 0.0 && evo.low <= evo.high && evo.high.is_finite()) {
                    return Err(ConfigError::InvalidWeightingBounds {
                        low: evo.low,
                        high: evo.high,
                    });
                }
            }
        }

        self.dataset.validate(self.num_participants)?;

        if !(self.model.learning_rate > 0.0) || self.model.lr_decay < 0.0 {
            return Err(ConfigError::InvalidLearningRate);
        }

        Ok(())
    }
}

impl DatasetConfig {
    /// Validate dataset settings for a given participant count.
    pub fn validate(&self, num_participants: usize) -> Result<(), ConfigError> {
        if self.num_classes < 2 {
            return Err(ConfigError::InvalidClasses);
        }
        if self.feature_dim == 0 {
            return Err(ConfigError::InvalidFeatureDim);
        }
        if self.validation_examples == 0 {
            return Err(ConfigError::NoValidationExamples);
        }
        if !(0.0..1.0).contains(&self.local_validation) {
            return Err(ConfigError::InvalidLocalValidation(self.local_validation));
        }
        if !(self.noise >= 0.0) || !(self.class_separation >= 0.0) {
            return Err(ConfigError::InvalidSpread);
        }

        let sections = match self.partition {
            PartitionConfig::Iid => num_participants,
            PartitionConfig::SortedLabels {
                classes_per_partition,
            } => {
                if classes_per_partition == 0 {
                    return Err(ConfigError::InvalidPartition(
                        "classes_per_partition must be non-zero".into(),
                    ));
                }
                num_participants * classes_per_partition
            }
        };
        if self.train_examples < sections {
            return Err(ConfigError::NotEnoughExamples {
                needed: sections,
                available: self.train_examples,
            });
        }

        Ok(())
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("At least one participant is required")]
    NoParticipants,
    #[error("Participation fraction must be within [0, 1], got {0}")]
    InvalidParticipation(f64),
    #[error("Local epoch count must be non-zero")]
    InvalidEpochs,
    #[error("Batch size must be non-zero")]
    InvalidBatchSize,
    #[error("Identity aggregation needs exactly one participant per round, got {0}")]
    IdentityNeedsSingleParticipant(usize),
    #[error("Evolutionary aggregation needs at least one candidate")]
    NoCandidates,
    #[error("Invalid weighting bounds [{low}, {high}]")]
    InvalidWeightingBounds { low: f32, high: f32 },
    #[error("At least two classes are required")]
    InvalidClasses,
    #[error("Feature dimension must be non-zero")]
    InvalidFeatureDim,
    #[error("Validation set must not be empty")]
    NoValidationExamples,
    #[error("Local validation fraction must be within [0, 1), got {0}")]
    InvalidLocalValidation(f32),
    #[error("Class separation and noise must be non-negative")]
    InvalidSpread,
    #[error("Invalid partition: {0}")]
    InvalidPartition(String),
    #[error("Partitioning needs {needed} training examples, only {available} configured")]
    NotEnoughExamples { needed: usize, available: usize },
    #[error("Learning rate must be positive and decay non-negative")]
    InvalidLearningRate,
}
