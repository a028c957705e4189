//! Report module - per-round observability sinks.
//!
//! The coordinator hands every registered observer a `RoundSummary` once per
//! round, after the new global model has been evaluated.

mod recorder;

pub use recorder::JsonLinesRecorder;

use std::io;

use crate::schema::RoundSummary;

/// Receives one summary per completed round.
pub trait RoundObserver: Send {
    fn on_round(&mut self, summary: &RoundSummary) -> io::Result<()>;
}

/// Writes round summaries through the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl RoundObserver for LogObserver {
    fn on_round(&mut self, summary: &RoundSummary) -> io::Result<()> {
        log::info!(
            "Round {}/{}: val_loss={:.4}, val_acc={:.4}",
            summary.round + 1,
            summary.num_rounds,
            summary.val_loss,
            summary.val_acc
        );
        for m in &summary.metrics {
            log::debug!("  participant {} volume by class {:?}", m.cid, m.volume_by_class);
        }
        Ok(())
    }
}
