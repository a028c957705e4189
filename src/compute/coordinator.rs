//! Round orchestration: select, train locally, aggregate, evaluate.
//!
//! The coordinator is the only owner of the global model. Each round it
//! broadcasts a copy of the current weights to every selected participant,
//! waits for all of them, aggregates, and only then mutates global state.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

use rayon::prelude::*;

use super::aggregate::{Aggregator, WeightUpdate};
use super::controller::SelectionController;
use super::dataset::Dataset;
use super::model::{Model, ModelProvider};
use super::participant::Participant;
use super::tensor::{Weights, check_same_shape};
use super::FederatedError;
use crate::report::RoundObserver;
use crate::schema::{DispatchMode, FitResult, ParticipantMetrics, RoundSummary, TrainingHistory};

/// Number of participants selected per round: `int(min(N, max(1, C * N)))`.
///
/// The cast truncates, so `abs_c(0.35, 10) == 3`.
pub fn abs_c(c: f64, num_participants: usize) -> usize {
    let n = num_participants as f64;
    n.min((c * n).max(1.0)) as usize
}

/// Output of one participant's local training task.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalResult {
    pub update: WeightUpdate,
    pub history: TrainingHistory,
    pub metrics: ParticipantMetrics,
}

/// Federated learning coordinator.
pub struct Coordinator {
    controller: Box<dyn SelectionController>,
    model: Box<dyn Model>,
    participants: Vec<Participant>,
    participation: f64,
    local_epochs: usize,
    xy_val: Dataset,
    aggregator: Aggregator,
    dispatch: DispatchMode,
    /// Cumulative local epochs trained across all rounds.
    epoch: usize,
    observers: Vec<Box<dyn RoundObserver>>,
}

impl Coordinator {
    /// Create a coordinator. The initial global weights come from `provider`.
    pub fn new(
        controller: Box<dyn SelectionController>,
        provider: &dyn ModelProvider,
        participants: Vec<Participant>,
        participation: f64,
        local_epochs: usize,
        xy_val: Dataset,
    ) -> Result<Self, FederatedError> {
        if participants.is_empty() {
            return Err(FederatedError::contract("coordinator needs participants"));
        }
        if controller.num_participants() != participants.len() {
            return Err(FederatedError::contract(format!(
                "controller selects from {} participants, coordinator has {}",
                controller.num_participants(),
                participants.len()
            )));
        }
        if !participation.is_finite() || participation < 0.0 {
            return Err(FederatedError::contract(format!(
                "invalid participation fraction {}",
                participation
            )));
        }
        if local_epochs == 0 {
            return Err(FederatedError::contract("local epoch count must be non-zero"));
        }
        if xy_val.is_empty() {
            return Err(FederatedError::contract("global validation set is empty"));
        }

        Ok(Self {
            controller,
            model: provider.init_model(None),
            participants,
            participation,
            local_epochs,
            xy_val,
            aggregator: Aggregator::default(),
            dispatch: DispatchMode::default(),
            epoch: 0,
            observers: Vec::new(),
        })
    }

    /// Set the aggregation strategy.
    pub fn with_aggregator(mut self, aggregator: Aggregator) -> Self {
        self.aggregator = aggregator;
        self
    }

    /// Set how local training is dispatched.
    pub fn with_dispatch(mut self, dispatch: DispatchMode) -> Self {
        self.dispatch = dispatch;
        self
    }

    /// Register a per-round observer.
    pub fn with_observer(mut self, observer: Box<dyn RoundObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn num_participants(&self) -> usize {
        self.participants.len()
    }

    /// Cumulative local epochs trained so far.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Copy of the current global weights.
    pub fn weights(&self) -> Weights {
        self.model.weights()
    }

    pub fn aggregator(&self) -> &Aggregator {
        &self.aggregator
    }

    /// Run `num_rounds` rounds and return the accumulated history.
    ///
    /// Any failure aborts the run; no partial history is returned.
    pub fn fit(&mut self, num_rounds: usize) -> Result<FitResult, FederatedError> {
        let start = Instant::now();
        let mut result = FitResult::default();

        for r in 0..num_rounds {
            let num_indices = abs_c(self.participation, self.num_participants());
            let indices = self.controller.indices(num_indices)?;
            self.check_selection(&indices, num_indices)?;
            log::info!("Round {}/{}: Participants {:?}", r + 1, num_rounds, indices);

            let (histories, metrics) = self.fit_round(&indices)?;

            let (val_loss, val_acc) = self.evaluate(&self.xy_val)?;
            result.history.val_loss.push(val_loss);
            result.history.val_acc.push(val_acc);

            let summary = RoundSummary {
                round: r,
                num_rounds,
                participants: indices,
                val_loss,
                val_acc,
                metrics,
            };
            for observer in &mut self.observers {
                observer.on_round(&summary)?;
            }

            result.participant_histories.push(histories);
            result.participant_metrics.push(summary.metrics);
        }

        result.elapsed_seconds = start.elapsed().as_secs_f64();
        Ok(result)
    }

    /// Train the selected participants, aggregate, and replace the global
    /// weights. Returns their histories and metrics in selection order.
    pub fn fit_round(
        &mut self,
        indices: &[usize],
    ) -> Result<(Vec<TrainingHistory>, Vec<ParticipantMetrics>), FederatedError> {
        let theta = self.model.weights();

        let results = match self.dispatch {
            DispatchMode::Concurrent => self.train_local_concurrently(&theta, indices)?,
            DispatchMode::Sequential => self.train_local_sequentially(&theta, indices)?,
        };

        let mut updates = Vec::with_capacity(results.len());
        let mut histories = Vec::with_capacity(results.len());
        let mut metrics = Vec::with_capacity(results.len());
        for local in results {
            check_same_shape(&theta, &local.update.weights)?;
            updates.push(local.update);
            histories.push(local.history);
            metrics.push(local.metrics);
        }

        let theta_prime = self.aggregator.aggregate(updates)?;
        check_same_shape(&theta, &theta_prime)?;
        self.model.set_weights(theta_prime)?;
        self.epoch += self.local_epochs;

        Ok((histories, metrics))
    }

    /// One parallel task per selected participant, each with its own copy
    /// of `theta`. Blocks until every task has finished; results come back
    /// in `indices` order regardless of completion order.
    pub fn train_local_concurrently(
        &self,
        theta: &Weights,
        indices: &[usize],
    ) -> Result<Vec<LocalResult>, FederatedError> {
        let participants = self.select(indices)?;
        let epochs = self.local_epochs;
        let epoch_base = self.epoch;

        let outcomes: Vec<Result<LocalResult, FederatedError>> = participants
            .par_iter()
            .map(|p| train_local(p, theta.clone(), epochs, epoch_base))
            .collect();

        // Every task has joined; report the first failure in selection order.
        outcomes.into_iter().collect()
    }

    /// Same contract as `train_local_concurrently`, on the calling thread.
    pub fn train_local_sequentially(
        &self,
        theta: &Weights,
        indices: &[usize],
    ) -> Result<Vec<LocalResult>, FederatedError> {
        self.select(indices)?
            .into_iter()
            .map(|p| train_local(p, theta.clone(), self.local_epochs, self.epoch))
            .collect()
    }

    /// Global model loss and accuracy on `xy_val`.
    pub fn evaluate(&self, xy_val: &Dataset) -> Result<(f32, f32), FederatedError> {
        self.model.evaluate(xy_val)
    }

    fn select(&self, indices: &[usize]) -> Result<Vec<&Participant>, FederatedError> {
        indices
            .iter()
            .map(|&i| {
                self.participants.get(i).ok_or_else(|| {
                    FederatedError::contract(format!(
                        "participant index {} out of range for {} participants",
                        i,
                        self.participants.len()
                    ))
                })
            })
            .collect()
    }

    fn check_selection(&self, indices: &[usize], expected: usize) -> Result<(), FederatedError> {
        if indices.len() != expected {
            return Err(FederatedError::contract(format!(
                "controller returned {} participants, expected {}",
                indices.len(),
                expected
            )));
        }
        let mut sorted = indices.to_vec();
        sorted.sort_unstable();
        if sorted.windows(2).any(|w| w[0] == w[1]) {
            return Err(FederatedError::contract(format!(
                "controller returned duplicate participants {:?}",
                indices
            )));
        }
        if let Some(&i) = sorted.last()
            && i >= self.participants.len()
        {
            return Err(FederatedError::contract(format!(
                "participant index {} out of range",
                i
            )));
        }
        Ok(())
    }
}

/// Train one participant, turning errors and panics into `TaskFailure`.
fn train_local(
    p: &Participant,
    theta: Weights,
    epochs: usize,
    epoch_base: usize,
) -> Result<LocalResult, FederatedError> {
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        p.train_round(theta, epochs, epoch_base)
    }));

    match outcome {
        Ok(Ok((update, history))) => Ok(LocalResult {
            update,
            history,
            metrics: p.metrics(),
        }),
        Ok(Err(e)) => Err(FederatedError::TaskFailure {
            participant: p.cid(),
            reason: e.to_string(),
        }),
        Err(payload) => Err(FederatedError::TaskFailure {
            participant: p.cid(),
            reason: panic_message(payload.as_ref()),
        }),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::controller::RandomController;
    use crate::compute::tensor::Tensor;
    use crate::compute::EpochMetrics;
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    /// Partition size that makes `CountingModel::fit_epoch` fail.
    const FAIL_SIZE: usize = 13;
    /// Partition size that makes `CountingModel::fit_epoch` panic.
    const PANIC_SIZE: usize = 17;

    /// Single-scalar model: each epoch adds the partition size to the weight.
    /// Smaller partitions sleep longer so tasks finish out of order.
    struct CountingModel {
        value: f32,
    }

    impl Model for CountingModel {
        fn weights(&self) -> Weights {
            vec![Tensor::from_vec(vec![self.value])]
        }

        fn set_weights(&mut self, weights: Weights) -> Result<(), FederatedError> {
            check_same_shape(&self.weights(), &weights)?;
            self.value = weights[0].data()[0];
            Ok(())
        }

        fn fit_epoch(
            &mut self,
            data: &Dataset,
            _batch_size: usize,
            _steps: usize,
        ) -> Result<EpochMetrics, FederatedError> {
            thread::sleep(Duration::from_millis((40 / data.len().max(1)) as u64));
            match data.len() {
                FAIL_SIZE => Err(FederatedError::contract("diverged")),
                PANIC_SIZE => panic!("out of memory"),
                n => {
                    self.value += n as f32;
                    Ok(EpochMetrics {
                        loss: 1.0 / n as f32,
                        accuracy: 0.5,
                    })
                }
            }
        }

        fn evaluate(&self, _data: &Dataset) -> Result<(f32, f32), FederatedError> {
            Ok((self.value, 0.25))
        }
    }

    struct CountingProvider;

    impl ModelProvider for CountingProvider {
        fn init_model(&self, _epoch_base: Option<usize>) -> Box<dyn Model> {
            Box::new(CountingModel { value: 0.0 })
        }
    }

    /// Records the `epoch_base` of every model built for local training.
    struct EpochRecordingProvider(Arc<Mutex<Vec<usize>>>);

    impl ModelProvider for EpochRecordingProvider {
        fn init_model(&self, epoch_base: Option<usize>) -> Box<dyn Model> {
            if let Some(base) = epoch_base {
                self.0.lock().unwrap().push(base);
            }
            Box::new(CountingModel { value: 0.0 })
        }
    }

    fn data(n: usize) -> Dataset {
        Dataset::new(vec![0.0; n], (0..n).map(|i| i % 2).collect(), 1).unwrap()
    }

    fn coordinator(sizes: &[usize], participation: f64, epochs: usize) -> Coordinator {
        let provider: Arc<dyn ModelProvider> = Arc::new(CountingProvider);
        let participants = sizes
            .iter()
            .enumerate()
            .map(|(cid, &n)| {
                Participant::new(cid, provider.clone(), data(n), Dataset::default(), 2, 4).unwrap()
            })
            .collect();
        Coordinator::new(
            Box::new(RandomController::new(sizes.len(), 7)),
            provider.as_ref(),
            participants,
            participation,
            epochs,
            data(4),
        )
        .unwrap()
    }

    /// Observer that stores every summary it receives.
    struct Collect(Arc<Mutex<Vec<RoundSummary>>>);

    impl RoundObserver for Collect {
        fn on_round(&mut self, summary: &RoundSummary) -> std::io::Result<()> {
            self.0.lock().unwrap().push(summary.clone());
            Ok(())
        }
    }

    #[test]
    fn test_abs_c() {
        assert_eq!(abs_c(0.0, 10), 1);
        assert_eq!(abs_c(1.0, 10), 10);
        assert_eq!(abs_c(0.35, 10), 3);
        assert_eq!(abs_c(0.1, 10), 1);
        assert_eq!(abs_c(0.99, 10), 9);
        assert_eq!(abs_c(2.0, 10), 10);
        assert_eq!(abs_c(0.5, 1), 1);
    }

    #[test]
    fn test_concurrent_results_follow_selection_order() {
        let coordinator = coordinator(&[1, 2, 3, 4, 5, 6, 7, 8], 1.0, 1);
        let theta = coordinator.weights();
        let indices = [6, 0, 3, 1];

        let results = coordinator.train_local_concurrently(&theta, &indices).unwrap();
        assert_eq!(results.len(), 4);
        let counts: Vec<usize> = results.iter().map(|r| r.update.num_examples).collect();
        assert_eq!(counts, vec![7, 1, 4, 2]);
        let cids: Vec<usize> = results.iter().map(|r| r.metrics.cid).collect();
        assert_eq!(cids, indices.to_vec());
        // Every task started from the broadcast weights.
        for (r, &n) in results.iter().zip(&counts) {
            assert_eq!(r.update.weights[0].data()[0], n as f32);
        }
    }

    #[test]
    fn test_sequential_matches_concurrent() {
        let coordinator = coordinator(&[3, 5, 2], 1.0, 2);
        let theta = coordinator.weights();
        let concurrent = coordinator.train_local_concurrently(&theta, &[2, 0, 1]).unwrap();
        let sequential = coordinator.train_local_sequentially(&theta, &[2, 0, 1]).unwrap();
        assert_eq!(concurrent, sequential);
    }

    #[test]
    fn test_fit_round_updates_global_state() {
        let mut coordinator = coordinator(&[1, 3], 1.0, 2);
        let (histories, metrics) = coordinator.fit_round(&[0, 1]).unwrap();
        assert_eq!(histories.len(), 2);
        assert_eq!(histories[0].epochs(), 2);
        assert_eq!(metrics[1].cid, 1);

        // Participant 0 ends at 2, participant 1 at 6; FedAvg (1*2 + 3*6) / 4 = 5.
        assert_eq!(coordinator.weights()[0].data(), &[5.0]);
        assert_eq!(coordinator.epoch(), 2);

        coordinator.fit_round(&[1]).unwrap();
        // Starts from 5, trains two epochs of +3.
        assert_eq!(coordinator.weights()[0].data(), &[11.0]);
        assert_eq!(coordinator.epoch(), 4);
    }

    #[test]
    fn test_fit_history_lengths() {
        let summaries = Arc::new(Mutex::new(Vec::new()));
        let mut coordinator = coordinator(&[2, 4, 6, 8, 10], 0.4, 1)
            .with_observer(Box::new(Collect(summaries.clone())));

        let result = coordinator.fit(4).unwrap();
        assert_eq!(result.history.val_loss.len(), 4);
        assert_eq!(result.history.val_acc.len(), 4);
        assert_eq!(result.participant_histories.len(), 4);
        assert_eq!(result.participant_metrics.len(), 4);
        for round in &result.participant_metrics {
            assert_eq!(round.len(), 2);
        }

        let summaries = summaries.lock().unwrap();
        assert_eq!(summaries.len(), 4);
        assert_eq!(summaries[3].round, 3);
        assert_eq!(summaries[3].val_loss, result.history.val_loss[3]);
        assert_eq!(coordinator.epoch(), 4);
    }

    #[test]
    fn test_fit_zero_rounds() {
        let mut coordinator = coordinator(&[2, 2], 1.0, 1);
        let result = coordinator.fit(0).unwrap();
        assert_eq!(result.history.rounds(), 0);
        assert_eq!(coordinator.weights()[0].data(), &[0.0]);
    }

    #[test]
    fn test_task_failure_aborts_round() {
        let mut coordinator = coordinator(&[2, FAIL_SIZE, 4], 1.0, 1);
        let before = coordinator.weights();

        let err = coordinator.fit(3).unwrap_err();
        assert!(matches!(
            err,
            FederatedError::TaskFailure { participant: 1, .. }
        ));
        // No partial aggregation happened.
        assert_eq!(coordinator.weights(), before);
        assert_eq!(coordinator.epoch(), 0);
    }

    #[test]
    fn test_panicking_task_becomes_task_failure() {
        let coordinator = coordinator(&[2, PANIC_SIZE], 1.0, 1);
        let theta = coordinator.weights();
        let err = coordinator.train_local_concurrently(&theta, &[0, 1]).unwrap_err();
        match err {
            FederatedError::TaskFailure { participant, reason } => {
                assert_eq!(participant, 1);
                assert!(reason.contains("out of memory"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_identity_rejects_multiple_updates() {
        let mut coordinator =
            coordinator(&[2, 3], 1.0, 1).with_aggregator(Aggregator::Identity);
        assert!(matches!(
            coordinator.fit_round(&[0, 1]),
            Err(FederatedError::ContractViolation(_))
        ));

        let mut single = coordinator_single();
        single.fit_round(&[0]).unwrap();
        assert_eq!(single.weights()[0].data(), &[3.0]);
    }

    fn coordinator_single() -> Coordinator {
        coordinator(&[3, 5], 0.0, 1).with_aggregator(Aggregator::Identity)
    }

    #[test]
    fn test_rejects_out_of_range_selection() {
        let coordinator = coordinator(&[2, 3], 1.0, 1);
        let theta = coordinator.weights();
        assert!(matches!(
            coordinator.train_local_concurrently(&theta, &[0, 2]),
            Err(FederatedError::ContractViolation(_))
        ));
        assert!(coordinator.check_selection(&[1, 1], 2).is_err());
        assert!(coordinator.check_selection(&[1], 2).is_err());
        assert!(coordinator.check_selection(&[1, 0], 2).is_ok());
    }

    #[test]
    fn test_new_rejects_bad_arguments() {
        let provider: Arc<dyn ModelProvider> = Arc::new(CountingProvider);
        let make = |n: usize, controller_n: usize, c: f64, e: usize| {
            let participants = (0..n)
                .map(|cid| {
                    Participant::new(cid, provider.clone(), data(2), Dataset::default(), 2, 1)
                        .unwrap()
                })
                .collect();
            Coordinator::new(
                Box::new(RandomController::new(controller_n, 0)),
                provider.as_ref(),
                participants,
                c,
                e,
                data(2),
            )
        };
        assert!(make(0, 0, 0.5, 1).is_err());
        assert!(make(2, 3, 0.5, 1).is_err());
        assert!(make(2, 2, f64::NAN, 1).is_err());
        assert!(make(2, 2, 0.5, 0).is_err());
        assert!(make(2, 2, 0.5, 1).is_ok());
    }

    #[test]
    fn test_new_rejects_empty_validation_set() {
        let provider: Arc<dyn ModelProvider> = Arc::new(CountingProvider);
        let participants = vec![
            Participant::new(0, provider.clone(), data(2), Dataset::default(), 2, 1).unwrap(),
        ];
        let result = Coordinator::new(
            Box::new(RandomController::new(1, 0)),
            provider.as_ref(),
            participants,
            1.0,
            1,
            Dataset::default(),
        );
        assert!(matches!(result, Err(FederatedError::ContractViolation(_))));
    }

    #[test]
    fn test_local_training_starts_at_running_epoch() {
        for dispatch in [DispatchMode::Concurrent, DispatchMode::Sequential] {
            let seen = Arc::new(Mutex::new(Vec::new()));
            let provider: Arc<dyn ModelProvider> =
                Arc::new(EpochRecordingProvider(seen.clone()));
            let participants = (0..2)
                .map(|cid| {
                    Participant::new(cid, provider.clone(), data(2), Dataset::default(), 2, 1)
                        .unwrap()
                })
                .collect();
            let mut coordinator = Coordinator::new(
                Box::new(RandomController::new(2, 3)),
                provider.as_ref(),
                participants,
                0.0,
                2,
                data(2),
            )
            .unwrap()
            .with_dispatch(dispatch);

            coordinator.fit(3).unwrap();
            assert_eq!(*seen.lock().unwrap(), vec![0, 2, 4], "{:?}", dispatch);
            assert_eq!(coordinator.epoch(), 6);
        }
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn abs_c_is_within_population(c in 0.0f64..=1.0, n in 1usize..500) {
                let k = abs_c(c, n);
                prop_assert!(k >= 1 && k <= n);
                prop_assert!(k as f64 <= (c * n as f64).max(1.0));
            }
        }
    }
}
