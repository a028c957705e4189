//! In-memory labelled datasets, synthetic generation and partitioning.
//!
//! Shuffling happens only here, while preparing partitions. Training
//! iterates a partition in stored order.

use rand::prelude::*;
use rand_distr::Normal;

use super::FederatedError;
use crate::schema::{DatasetConfig, PartitionConfig};

/// Feature matrix (row-major) with one label per row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    features: Vec<f32>,
    labels: Vec<usize>,
    feature_dim: usize,
}

/// A contiguous run of rows.
#[derive(Debug, Clone, Copy)]
pub struct Batch<'a> {
    pub features: &'a [f32],
    pub labels: &'a [usize],
}

impl Batch<'_> {
    #[inline]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

impl Dataset {
    /// Create a dataset, checking features and labels agree in length.
    pub fn new(
        features: Vec<f32>,
        labels: Vec<usize>,
        feature_dim: usize,
    ) -> Result<Self, FederatedError> {
        if feature_dim == 0 {
            return Err(FederatedError::contract("feature dimension must be non-zero"));
        }
        if features.len() != labels.len() * feature_dim {
            return Err(FederatedError::contract(format!(
                "{} labels need {} feature values, got {}",
                labels.len(),
                labels.len() * feature_dim,
                features.len()
            )));
        }
        Ok(Self {
            features,
            labels,
            feature_dim,
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    #[inline]
    pub fn feature_dim(&self) -> usize {
        self.feature_dim
    }

    #[inline]
    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    /// Feature row `i`.
    #[inline]
    pub fn row(&self, i: usize) -> &[f32] {
        &self.features[i * self.feature_dim..(i + 1) * self.feature_dim]
    }

    /// The whole dataset as one batch.
    pub fn as_batch(&self) -> Batch<'_> {
        Batch {
            features: &self.features,
            labels: &self.labels,
        }
    }

    /// Consecutive batches in stored order; the last one may be short.
    pub fn batches(&self, batch_size: usize) -> impl Iterator<Item = Batch<'_>> {
        let batch_size = batch_size.max(1);
        self.features
            .chunks(batch_size * self.feature_dim.max(1))
            .zip(self.labels.chunks(batch_size))
            .map(|(features, labels)| Batch { features, labels })
    }

    /// Count of examples per class id.
    pub fn volume_by_class(&self, num_classes: usize) -> Result<Vec<usize>, FederatedError> {
        let mut counts = vec![0usize; num_classes];
        for &label in &self.labels {
            let slot = counts.get_mut(label).ok_or_else(|| {
                FederatedError::contract(format!(
                    "label {} out of range for {} classes",
                    label, num_classes
                ))
            })?;
            *slot += 1;
        }
        Ok(counts)
    }

    /// Rows at `indices`, in that order.
    pub fn subset(&self, indices: &[usize]) -> Dataset {
        let mut features = Vec::with_capacity(indices.len() * self.feature_dim);
        let mut labels = Vec::with_capacity(indices.len());
        for &i in indices {
            features.extend_from_slice(self.row(i));
            labels.push(self.labels[i]);
        }
        Dataset {
            features,
            labels,
            feature_dim: self.feature_dim,
        }
    }

    /// Split into the first `n` rows and the rest.
    pub fn split_at(&self, n: usize) -> (Dataset, Dataset) {
        let n = n.min(self.len());
        let (fa, fb) = self.features.split_at(n * self.feature_dim);
        let (la, lb) = self.labels.split_at(n);
        (
            Dataset {
                features: fa.to_vec(),
                labels: la.to_vec(),
                feature_dim: self.feature_dim,
            },
            Dataset {
                features: fb.to_vec(),
                labels: lb.to_vec(),
                feature_dim: self.feature_dim,
            },
        )
    }
}

/// Gaussian-cluster classification data.
///
/// Each class gets a random centroid; examples are the centroid plus
/// isotropic noise. Labels are balanced and the row order is shuffled.
pub fn synthetic_dataset(config: &DatasetConfig, seed: u64) -> Result<Dataset, FederatedError> {
    let mut rng = StdRng::seed_from_u64(seed);
    let total = config.train_examples + config.validation_examples;
    let dim = config.feature_dim;

    let centroid_dist = Normal::new(0.0f32, config.class_separation)
        .map_err(|e| FederatedError::contract(format!("class separation: {}", e)))?;
    let noise_dist = Normal::new(0.0f32, config.noise)
        .map_err(|e| FederatedError::contract(format!("noise: {}", e)))?;

    let centroids: Vec<Vec<f32>> = (0..config.num_classes)
        .map(|_| (0..dim).map(|_| rng.sample(centroid_dist)).collect())
        .collect();

    let mut labels: Vec<usize> = (0..total).map(|i| i % config.num_classes).collect();
    labels.shuffle(&mut rng);

    let mut features = Vec::with_capacity(total * dim);
    for &label in &labels {
        for &c in &centroids[label] {
            features.push(c + rng.sample(noise_dist));
        }
    }

    Dataset::new(features, labels, dim)
}

/// Split a training set into `num_partitions` participant datasets.
pub fn partition(
    dataset: &Dataset,
    num_partitions: usize,
    method: &PartitionConfig,
    rng: &mut StdRng,
) -> Result<Vec<Dataset>, FederatedError> {
    if num_partitions == 0 {
        return Err(FederatedError::contract("cannot partition into zero parts"));
    }

    let index_sets = match *method {
        PartitionConfig::Iid => {
            if dataset.len() < num_partitions {
                return Err(FederatedError::contract(format!(
                    "{} examples cannot fill {} partitions",
                    dataset.len(),
                    num_partitions
                )));
            }
            let mut order: Vec<usize> = (0..dataset.len()).collect();
            order.shuffle(rng);
            split_even(&order, num_partitions)
        }
        PartitionConfig::SortedLabels {
            classes_per_partition,
        } => {
            let num_sections = num_partitions * classes_per_partition;
            if classes_per_partition == 0 || dataset.len() < num_sections {
                return Err(FederatedError::contract(format!(
                    "{} examples cannot fill {} label sections",
                    dataset.len(),
                    num_sections
                )));
            }
            let mut order: Vec<usize> = (0..dataset.len()).collect();
            order.sort_by_key(|&i| dataset.labels[i]);

            let mut sections = split_even(&order, num_sections);
            sections.shuffle(rng);

            sections
                .chunks(classes_per_partition)
                .map(|group| {
                    let mut indices: Vec<usize> = group.concat();
                    indices.shuffle(rng);
                    indices
                })
                .collect()
        }
    };

    Ok(index_sets
        .iter()
        .map(|indices| dataset.subset(indices))
        .collect())
}

/// Cut `items` into `parts` contiguous runs whose sizes differ by at most one.
fn split_even(items: &[usize], parts: usize) -> Vec<Vec<usize>> {
    let base = items.len() / parts;
    let extra = items.len() % parts;
    let mut out = Vec::with_capacity(parts);
    let mut start = 0;
    for p in 0..parts {
        let len = base + usize::from(p < extra);
        out.push(items[start..start + len].to_vec());
        start += len;
    }
    out
}
