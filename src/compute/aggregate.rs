//! Aggregation strategies that combine participant updates into one weight set.

use std::sync::Arc;

use rand::prelude::*;
use rayon::prelude::*;

use super::evaluator::Evaluator;
use super::tensor::{Tensor, Weights, check_same_shape};
use super::FederatedError;
use crate::schema::{AggregatorConfig, EvolutionaryConfig};

/// Weights produced by one participant in one round, with its example count.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightUpdate {
    pub weights: Weights,
    pub num_examples: usize,
}

/// How participant updates are reduced to the next global model.
#[derive(Default)]
pub enum Aggregator {
    /// Exactly one update, returned unchanged.
    Identity,
    /// Example-count weighted mean (FedAvg).
    #[default]
    FederatedAveraging,
    /// Best of several randomly weighted means, scored by an evaluator.
    Evolutionary(EvolutionaryAggregator),
}

impl Aggregator {
    /// Build from configuration. `evaluator` is only used by the
    /// evolutionary variant.
    pub fn from_config(
        config: &AggregatorConfig,
        evaluator: Arc<dyn Evaluator>,
        seed: u64,
    ) -> Result<Self, FederatedError> {
        Ok(match config {
            AggregatorConfig::Identity => Self::Identity,
            AggregatorConfig::FederatedAveraging => Self::FederatedAveraging,
            AggregatorConfig::Evolutionary(evo) => {
                Self::Evolutionary(EvolutionaryAggregator::from_config(evo, evaluator, seed)?)
            }
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::FederatedAveraging => "federated-averaging",
            Self::Evolutionary(_) => "evolutionary",
        }
    }

    /// Reduce `updates` to a single weight set with the same shape.
    pub fn aggregate(&mut self, updates: Vec<WeightUpdate>) -> Result<Weights, FederatedError> {
        match self {
            Self::Identity => match <[WeightUpdate; 1]>::try_from(updates) {
                Ok([update]) => Ok(update.weights),
                Err(updates) => Err(FederatedError::contract(format!(
                    "identity aggregation takes exactly one update, got {}",
                    updates.len()
                ))),
            },
            Self::FederatedAveraging => {
                let weighting = updates
                    .iter()
                    .map(|u| {
                        if u.num_examples == 0 {
                            Err(FederatedError::contract("example counts must be positive"))
                        } else {
                            Ok(u.num_examples as f32)
                        }
                    })
                    .collect::<Result<Vec<f32>, _>>()?;
                let thetas: Vec<Weights> = updates.into_iter().map(|u| u.weights).collect();
                federated_averaging(&thetas, &weighting)
            }
            Self::Evolutionary(evo) => {
                let thetas: Vec<Weights> = updates.into_iter().map(|u| u.weights).collect();
                evo.aggregate(&thetas)
            }
        }
    }
}

/// Weighted elementwise mean: `sum_j w_j * theta_j[i] / sum_j w_j` per array `i`.
///
/// Arrays are reduced in parallel; within one array participants are summed
/// in order.
pub fn federated_averaging(
    thetas: &[Weights],
    weighting: &[f32],
) -> Result<Weights, FederatedError> {
    let first = thetas
        .first()
        .ok_or_else(|| FederatedError::contract("cannot aggregate zero updates"))?;
    if thetas.len() != weighting.len() {
        return Err(FederatedError::contract(format!(
            "{} updates but {} weights",
            thetas.len(),
            weighting.len()
        )));
    }
    for theta in &thetas[1..] {
        check_same_shape(first, theta)?;
    }

    let total: f32 = weighting.iter().sum();
    if !(total.is_finite() && total > 0.0) {
        return Err(FederatedError::contract(format!(
            "weighting must sum to a positive number, got {}",
            total
        )));
    }

    Ok((0..first.len())
        .into_par_iter()
        .map(|i| {
            let mut acc = Tensor::zeros(first[i].shape());
            for (theta, &w) in thetas.iter().zip(weighting) {
                acc.scaled_add(w, &theta[i]);
            }
            acc.scale(1.0 / total);
            acc
        })
        .collect())
}

/// Source of per-participant weightings for evolutionary aggregation.
pub trait WeightingSource: Send {
    /// A weighting vector of length `len`.
    fn weighting(&mut self, len: usize) -> Vec<f32>;
}

/// Entries drawn independently and uniformly from the closed range `[low, high]`.
pub struct UniformWeighting {
    rng: StdRng,
    low: f32,
    high: f32,
}

impl UniformWeighting {
    pub fn new(seed: u64, low: f32, high: f32) -> Result<Self, FederatedError> {
        if !(low.is_finite() && high.is_finite() && low <= high) {
            return Err(FederatedError::contract(format!(
                "invalid weighting bounds [{}, {}]",
                low, high
            )));
        }
        Ok(Self {
            rng: StdRng::seed_from_u64(seed),
            low,
            high,
        })
    }
}

impl WeightingSource for UniformWeighting {
    fn weighting(&mut self, len: usize) -> Vec<f32> {
        (0..len)
            .map(|_| self.rng.gen_range(self.low..=self.high))
            .collect()
    }
}

/// One scored candidate aggregate.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Generation order within the round.
    pub index: usize,
    pub weighting: Vec<f32>,
    pub weights: Weights,
    pub loss: f32,
    pub accuracy: f32,
}

/// Evolutionary aggregation: several random weightings are applied with
/// `federated_averaging`, each result is scored, the lowest loss wins.
pub struct EvolutionaryAggregator {
    evaluator: Arc<dyn Evaluator>,
    source: Box<dyn WeightingSource>,
    candidates: usize,
}

impl EvolutionaryAggregator {
    /// Default number of candidates per round.
    pub const DEFAULT_CANDIDATES: usize = 3;

    pub fn new(
        evaluator: Arc<dyn Evaluator>,
        source: Box<dyn WeightingSource>,
        candidates: usize,
    ) -> Self {
        Self {
            evaluator,
            source,
            candidates,
        }
    }

    pub fn from_config(
        config: &EvolutionaryConfig,
        evaluator: Arc<dyn Evaluator>,
        seed: u64,
    ) -> Result<Self, FederatedError> {
        Ok(Self::new(
            evaluator,
            Box::new(UniformWeighting::new(seed, config.low, config.high)?),
            config.candidates,
        ))
    }

    /// Generate and score this round's candidates, in generation order.
    ///
    /// Weightings are drawn sequentially so the order is fixed by the source;
    /// scoring runs in parallel and keeps that order.
    pub fn compute_candidates(&mut self, thetas: &[Weights]) -> Result<Vec<Candidate>, FederatedError> {
        if self.candidates == 0 {
            return Err(FederatedError::contract("evolutionary aggregation needs candidates"));
        }
        let weightings: Vec<Vec<f32>> = (0..self.candidates)
            .map(|_| self.source.weighting(thetas.len()))
            .collect();

        let evaluator = &self.evaluator;
        weightings
            .into_par_iter()
            .enumerate()
            .map(|(index, weighting)| {
                let weights = federated_averaging(thetas, &weighting)?;
                let (loss, accuracy) = evaluator.evaluate(&weights)?;
                log::debug!(
                    "candidate {} (weighting {:?}): loss {:.4}, accuracy {:.4}",
                    index,
                    weighting,
                    loss,
                    accuracy
                );
                Ok(Candidate {
                    index,
                    weighting,
                    weights,
                    loss,
                    accuracy,
                })
            })
            .collect::<Vec<Result<Candidate, FederatedError>>>()
            .into_iter()
            .collect()
    }

    pub fn aggregate(&mut self, thetas: &[Weights]) -> Result<Weights, FederatedError> {
        let candidates = self.compute_candidates(thetas)?;
        let best = pick_best_candidate(candidates)
            .ok_or_else(|| FederatedError::contract("no candidate produced"))?;
        log::debug!("candidate {} selected with loss {:.4}", best.index, best.loss);
        Ok(best.weights)
    }
}

/// The candidate with strictly lowest loss; ties keep the earlier one.
/// A NaN incumbent is replaced by any candidate with a real loss.
pub fn pick_best_candidate(candidates: Vec<Candidate>) -> Option<Candidate> {
    let mut iter = candidates.into_iter();
    let mut best = iter.next()?;
    for candidate in iter {
        if candidate.loss < best.loss || (best.loss.is_nan() && !candidate.loss.is_nan()) {
            best = candidate;
        }
    }
    Some(best)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn scalar(v: f32) -> Weights {
        vec![Tensor::from_vec(vec![v])]
    }

    fn update(v: f32, n: usize) -> WeightUpdate {
        WeightUpdate {
            weights: scalar(v),
            num_examples: n,
        }
    }

    /// Hands out a fixed list of weightings in order.
    struct Scripted(VecDeque<Vec<f32>>);

    impl WeightingSource for Scripted {
        fn weighting(&mut self, _len: usize) -> Vec<f32> {
            self.0.pop_front().unwrap()
        }
    }

    /// Loss is the distance of the single scalar from a target.
    struct DistanceEvaluator {
        target: f32,
        calls: Mutex<usize>,
    }

    impl Evaluator for DistanceEvaluator {
        fn evaluate(&self, weights: &Weights) -> Result<(f32, f32), FederatedError> {
            *self.calls.lock().unwrap() += 1;
            let v = weights[0].data()[0];
            Ok(((v - self.target).abs(), 0.0))
        }
    }

    fn evo(target: f32, script: Vec<Vec<f32>>) -> (EvolutionaryAggregator, Arc<DistanceEvaluator>) {
        let evaluator = Arc::new(DistanceEvaluator {
            target,
            calls: Mutex::new(0),
        });
        let agg = EvolutionaryAggregator::new(
            evaluator.clone(),
            Box::new(Scripted(script.into())),
            EvolutionaryAggregator::DEFAULT_CANDIDATES,
        );
        (agg, evaluator)
    }

    #[test]
    fn test_fedavg_equal_counts() {
        let mut agg = Aggregator::FederatedAveraging;
        let result = agg.aggregate(vec![update(2.0, 1), update(4.0, 1)]).unwrap();
        assert_eq!(result, scalar(3.0));
    }

    #[test]
    fn test_fedavg_weighted_counts() {
        let mut agg = Aggregator::default();
        let result = agg.aggregate(vec![update(0.0, 1), update(4.0, 3)]).unwrap();
        assert_eq!(result, scalar(3.0));
    }

    #[test]
    fn test_fedavg_multiple_arrays() {
        let a = vec![
            Tensor::new(vec![2, 2], vec![1.0, 2.0, 3.0, 4.0]).unwrap(),
            Tensor::from_vec(vec![0.0]),
        ];
        let b = vec![
            Tensor::new(vec![2, 2], vec![3.0, 2.0, 1.0, 0.0]).unwrap(),
            Tensor::from_vec(vec![10.0]),
        ];
        let result = federated_averaging(&[a, b], &[1.0, 1.0]).unwrap();
        assert_eq!(result[0].shape(), &[2, 2]);
        assert_eq!(result[0].data(), &[2.0, 2.0, 2.0, 2.0]);
        assert_eq!(result[1].data(), &[5.0]);
    }

    #[test]
    fn test_fedavg_rejects_bad_input() {
        assert!(federated_averaging(&[], &[]).is_err());
        assert!(federated_averaging(&[scalar(1.0)], &[1.0, 2.0]).is_err());
        assert!(federated_averaging(&[scalar(1.0)], &[0.0]).is_err());

        let mismatched = vec![Tensor::from_vec(vec![1.0, 2.0])];
        assert!(matches!(
            federated_averaging(&[scalar(1.0), mismatched], &[1.0, 1.0]),
            Err(FederatedError::ModelState(_))
        ));

        let mut agg = Aggregator::FederatedAveraging;
        assert!(matches!(
            agg.aggregate(vec![update(1.0, 0)]),
            Err(FederatedError::ContractViolation(_))
        ));
    }

    #[test]
    fn test_identity() {
        let mut agg = Aggregator::Identity;
        let weights = vec![Tensor::from_vec(vec![1.5, -2.0])];
        let result = agg
            .aggregate(vec![WeightUpdate {
                weights: weights.clone(),
                num_examples: 7,
            }])
            .unwrap();
        assert_eq!(result, weights);

        assert!(matches!(
            agg.aggregate(vec![update(1.0, 1), update(2.0, 1)]),
            Err(FederatedError::ContractViolation(_))
        ));
        assert!(agg.aggregate(vec![]).is_err());
    }

    #[test]
    fn test_evolutionary_picks_lowest_loss() {
        // thetas 0 and 4; candidates average to 1.0, 3.0, 2.0
        let script = vec![vec![3.0, 1.0], vec![1.0, 3.0], vec![1.0, 1.0]];
        let (mut agg, evaluator) = evo(3.2, script);
        let result = agg.aggregate(&[scalar(0.0), scalar(4.0)]).unwrap();
        assert_eq!(result, scalar(3.0));
        assert_eq!(*evaluator.calls.lock().unwrap(), 3);
    }

    #[test]
    fn test_evolutionary_tie_keeps_earliest() {
        // candidates average to 1.0, 3.0, 1.0 -> 1.0 and 3.0 tie around 2.0
        let script = vec![vec![3.0, 1.0], vec![1.0, 3.0], vec![3.0, 1.0]];
        let (mut agg, _) = evo(2.0, script);
        let candidates = agg.compute_candidates(&[scalar(0.0), scalar(4.0)]).unwrap();
        assert_eq!(
            candidates.iter().map(|c| c.index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        let best = pick_best_candidate(candidates).unwrap();
        assert_eq!(best.index, 0);
        assert_eq!(best.weights, scalar(1.0));
    }

    #[test]
    fn test_pick_best_skips_nan() {
        let make = |index, loss| Candidate {
            index,
            weighting: vec![],
            weights: scalar(index as f32),
            loss,
            accuracy: 0.0,
        };
        let best = pick_best_candidate(vec![make(0, f32::NAN), make(1, 2.0), make(2, 2.0)]);
        assert_eq!(best.unwrap().index, 1);
        assert!(pick_best_candidate(vec![]).is_none());
    }

    #[test]
    fn test_uniform_weighting_range_and_seed() {
        let mut a = UniformWeighting::new(11, 0.5, 1.5).unwrap();
        let mut b = UniformWeighting::new(11, 0.5, 1.5).unwrap();
        let wa = a.weighting(50);
        assert_eq!(wa, b.weighting(50));
        assert_eq!(wa.len(), 50);
        assert!(wa.iter().all(|&w| (0.5..=1.5).contains(&w)));
    }

    #[test]
    fn test_uniform_weighting_bounds() {
        let mut fixed = UniformWeighting::new(1, 1.0, 1.0).unwrap();
        assert_eq!(fixed.weighting(3), vec![1.0, 1.0, 1.0]);

        assert!(matches!(
            UniformWeighting::new(1, 1.5, 0.5),
            Err(FederatedError::ContractViolation(_))
        ));
        assert!(UniformWeighting::new(1, 0.5, f32::INFINITY).is_err());
    }

    #[test]
    fn test_evolutionary_seeded_is_reproducible() {
        let thetas = vec![scalar(0.0), scalar(1.0), scalar(5.0)];
        let run = || {
            let evaluator = Arc::new(DistanceEvaluator {
                target: 1.7,
                calls: Mutex::new(0),
            });
            let mut agg = Aggregator::from_config(
                &AggregatorConfig::Evolutionary(EvolutionaryConfig::default()),
                evaluator,
                99,
            )
            .unwrap();
            agg.aggregate(
                thetas
                    .iter()
                    .map(|w| WeightUpdate {
                        weights: w.clone(),
                        num_examples: 1,
                    })
                    .collect(),
            )
            .unwrap()
        };
        assert_eq!(run(), run());
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn fedavg_stays_within_input_range(
                values in prop::collection::vec(-100.0f32..100.0, 1..8),
                counts in prop::collection::vec(1usize..1000, 8),
            ) {
                let thetas: Vec<Weights> = values.iter().map(|&v| scalar(v)).collect();
                let weighting: Vec<f32> = counts[..values.len()].iter().map(|&c| c as f32).collect();
                let result = federated_averaging(&thetas, &weighting).unwrap();

                let lo = values.iter().cloned().fold(f32::INFINITY, f32::min);
                let hi = values.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
                let v = result[0].data()[0];
                prop_assert!(v >= lo - 1e-3 && v <= hi + 1e-3);
            }

            #[test]
            fn fedavg_of_identical_updates_is_identity(
                value in -50.0f32..50.0,
                counts in prop::collection::vec(1usize..100, 1..6),
            ) {
                let mut agg = Aggregator::FederatedAveraging;
                let updates = counts.iter().map(|&n| update(value, n)).collect();
                let result = agg.aggregate(updates).unwrap();
                prop_assert!((result[0].data()[0] - value).abs() <= 1e-4 * value.abs().max(1.0));
            }
        }
    }
}
