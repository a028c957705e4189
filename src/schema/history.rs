//! History and result types accumulated over a federated run.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Per-epoch training history of one participant in one round.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    /// Training loss per epoch.
    pub loss: Vec<f32>,
    /// Training accuracy per epoch.
    pub acc: Vec<f32>,
    /// Local validation loss per epoch (empty without a local validation set).
    pub val_loss: Vec<f32>,
    /// Local validation accuracy per epoch.
    pub val_acc: Vec<f32>,
}

impl TrainingHistory {
    /// Number of recorded epochs.
    pub fn epochs(&self) -> usize {
        self.loss.len()
    }
}

/// Label distribution of one participant's training partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantMetrics {
    /// Participant identifier.
    pub cid: usize,
    /// Example count per class, indexed by class id.
    pub volume_by_class: Vec<usize>,
}

impl ParticipantMetrics {
    /// Total examples across all classes.
    pub fn total(&self) -> usize {
        self.volume_by_class.iter().sum()
    }
}

/// Global model validation history, one entry per round.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalHistory {
    pub val_loss: Vec<f32>,
    pub val_acc: Vec<f32>,
}

impl GlobalHistory {
    /// Number of recorded rounds.
    pub fn rounds(&self) -> usize {
        self.val_loss.len()
    }
}

/// What observers see after each round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundSummary {
    /// Zero-based round index.
    pub round: usize,
    /// Total rounds in this run.
    pub num_rounds: usize,
    /// Selected participant ids, in selection order.
    pub participants: Vec<usize>,
    /// Global validation loss after aggregation.
    pub val_loss: f32,
    /// Global validation accuracy after aggregation.
    pub val_acc: f32,
    /// Label distribution of each selected participant.
    pub metrics: Vec<ParticipantMetrics>,
}

/// Final result of `Coordinator::fit`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FitResult {
    /// Global validation loss/accuracy per round.
    pub history: GlobalHistory,
    /// Training histories of the selected participants, per round.
    pub participant_histories: Vec<Vec<TrainingHistory>>,
    /// Metrics of the selected participants, per round.
    pub participant_metrics: Vec<Vec<ParticipantMetrics>>,
    /// Wall-clock duration of the run.
    #[serde(default)]
    pub elapsed_seconds: f64,
}

impl FitResult {
    /// File name used by `save`.
    pub const FILE_NAME: &'static str = "results.json";

    /// Write the result as pretty JSON into `dir`.
    pub fn save<P: AsRef<Path>>(&self, dir: P) -> io::Result<PathBuf> {
        fs::create_dir_all(dir.as_ref())?;
        let path = dir.as_ref().join(Self::FILE_NAME);
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&path, json)?;
        Ok(path)
    }

    /// Load a previously saved result file.
    pub fn load<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let json = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Validation accuracy after the last round.
    pub fn final_accuracy(&self) -> Option<f32> {
        self.history.val_acc.last().copied()
    }

    /// Validation loss after the last round.
    pub fn final_loss(&self) -> Option<f32> {
        self.history.val_loss.last().copied()
    }
}
