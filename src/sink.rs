use crate::engine::StepSummary;
use anyhow::{Context, Result};
use rmp_serde::{decode, encode};
use std::{
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::Path,
};

/// Consumer of per-step summaries.
pub trait MetricsSink {
    fn record(&mut self, summary: &StepSummary) -> Result<()>;
}

/// Sink that discards every summary.
pub struct NullSink;

impl MetricsSink for NullSink {
    fn record(&mut self, _summary: &StepSummary) -> Result<()> {
        Ok(())
    }
}

impl MetricsSink for Vec<StepSummary> {
    fn record(&mut self, summary: &StepSummary) -> Result<()> {
        self.push(summary.clone());
        Ok(())
    }
}

/// Sink that appends MessagePack-encoded summaries to a file.
pub struct TrajectoryWriter {
    writer: BufWriter<File>,
    n_records: usize,
}

impl TrajectoryWriter {
    pub fn create<P: AsRef<Path>>(file: P) -> Result<Self> {
        let file = file.as_ref();
        let file = File::create(file).with_context(|| format!("failed to create {file:?}"))?;
        Ok(Self {
            writer: BufWriter::new(file),
            n_records: 0,
        })
    }

    /// Flush buffered records and return how many were written.
    pub fn finish(mut self) -> Result<usize> {
        self.writer
            .flush()
            .context("failed to flush writer stream")?;
        Ok(self.n_records)
    }
}

impl MetricsSink for TrajectoryWriter {
    fn record(&mut self, summary: &StepSummary) -> Result<()> {
        encode::write(&mut self.writer, summary).context("failed to serialize summary")?;
        self.n_records += 1;
        Ok(())
    }
}

/// Read the first `n_records` summaries of a trajectory file.
pub fn read_trajectory<P: AsRef<Path>>(file: P, n_records: usize) -> Result<Vec<StepSummary>> {
    let file = file.as_ref();
    let file = File::open(file).with_context(|| format!("failed to open {file:?}"))?;
    let mut reader = BufReader::new(file);

    let mut summaries = Vec::with_capacity(n_records);
    for i_record in 0..n_records {
        let summary = decode::from_read(&mut reader)
            .with_context(|| format!("failed to deserialize record {i_record}"))?;
        summaries.push(summary);
    }
    Ok(summaries)
}
