//! Wires a `FederatedConfig` into a ready-to-run coordinator.

use std::fs;
use std::sync::Arc;

use rand::prelude::*;

use crate::compute::{
    Aggregator, Coordinator, CycleRandomController, FederatedError, ModelEvaluator,
    ModelProvider, Participant, RandomController, SelectionController,
    SoftmaxRegressionProvider, partition, synthetic_dataset,
};
use crate::report::{JsonLinesRecorder, LogObserver};
use crate::schema::{ControllerConfig, FederatedConfig, FitResult};

/// A configured federated run.
pub struct Simulation {
    config: FederatedConfig,
    coordinator: Coordinator,
    seed: u64,
}

impl Simulation {
    /// File name of the per-round log written into `output_dir`.
    pub const ROUNDS_FILE: &'static str = "rounds.jsonl";

    /// Validate `config`, generate and partition data, and build the coordinator.
    pub fn from_config(config: FederatedConfig) -> Result<Self, FederatedError> {
        config.validate()?;

        let seed = config.random_seed.unwrap_or_else(rand::random);
        let mut rng = StdRng::seed_from_u64(seed);
        let ds = &config.dataset;

        let data = synthetic_dataset(ds, rng.next_u64())?;
        let (xy_val, xy_train) = data.split_at(ds.validation_examples);
        let partitions = partition(&xy_train, config.num_participants, &ds.partition, &mut rng)?;

        let provider: Arc<dyn ModelProvider> = Arc::new(SoftmaxRegressionProvider::new(
            ds.feature_dim,
            ds.num_classes,
            config.model.clone(),
            rng.next_u64(),
        ));

        let participants = partitions
            .into_iter()
            .enumerate()
            .map(|(cid, part)| {
                let local_val = ((part.len() as f32 * ds.local_validation) as usize)
                    .min(part.len().saturating_sub(1));
                let (xy_train, xy_val) = part.split_at(part.len() - local_val);
                Participant::new(
                    cid,
                    Arc::clone(&provider),
                    xy_train,
                    xy_val,
                    ds.num_classes,
                    config.batch_size,
                )
            })
            .collect::<Result<Vec<_>, _>>()?;

        let controller: Box<dyn SelectionController> = match config.controller {
            ControllerConfig::Random => {
                Box::new(RandomController::new(config.num_participants, rng.next_u64()))
            }
            ControllerConfig::CycleRandom => Box::new(CycleRandomController::new(
                config.num_participants,
                rng.next_u64(),
            )),
        };

        let evaluator = Arc::new(ModelEvaluator::new(Arc::clone(&provider), xy_val.clone()));
        let aggregator = Aggregator::from_config(&config.aggregator, evaluator, rng.next_u64())?;

        let mut coordinator = Coordinator::new(
            controller,
            provider.as_ref(),
            participants,
            config.participation,
            config.local_epochs,
            xy_val,
        )?
        .with_aggregator(aggregator)
        .with_dispatch(config.dispatch)
        .with_observer(Box::new(LogObserver));

        if let Some(dir) = &config.output_dir {
            fs::create_dir_all(dir)?;
            let recorder = JsonLinesRecorder::new(dir.join(Self::ROUNDS_FILE))?;
            coordinator = coordinator.with_observer(Box::new(recorder));
        }

        log::info!(
            "Simulation ready: {} participants, {} aggregation, seed {}",
            config.num_participants,
            coordinator.aggregator().name(),
            seed
        );

        Ok(Self {
            config,
            coordinator,
            seed,
        })
    }

    pub fn config(&self) -> &FederatedConfig {
        &self.config
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    /// Seed actually used (drawn at random when the config has none).
    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Run all configured rounds; saves results when `output_dir` is set.
    pub fn run(&mut self) -> Result<FitResult, FederatedError> {
        let result = self.coordinator.fit(self.config.rounds)?;
        if let Some(dir) = &self.config.output_dir {
            let path = result.save(dir)?;
            log::info!("Results saved: {}", path.display());
        }
        Ok(result)
    }
}
