//! JSON lines recorder for round summaries.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use super::RoundObserver;
use crate::schema::RoundSummary;

/// Appends one JSON object per round to a file.
///
/// Usage:
/// ```ignore
/// let recorder = JsonLinesRecorder::new("rounds.jsonl")?;
/// let coordinator = coordinator.with_observer(Box::new(recorder));
/// ```
pub struct JsonLinesRecorder {
    writer: BufWriter<File>,
    rounds_written: usize,
}

impl JsonLinesRecorder {
    /// Create (or truncate) the output file.
    pub fn new<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            rounds_written: 0,
        })
    }

    /// Number of rounds written so far.
    pub fn rounds_written(&self) -> usize {
        self.rounds_written
    }
}

impl RoundObserver for JsonLinesRecorder {
    fn on_round(&mut self, summary: &RoundSummary) -> io::Result<()> {
        serde_json::to_writer(&mut self.writer, summary)?;
        self.writer.write_all(b"\n")?;
        // Flush per round so an aborted run keeps completed rounds.
        self.writer.flush()?;
        self.rounds_written += 1;
        Ok(())
    }
}
