//! Two-phase aggregation of records by key.
//!
//! The map phase extracts a key per record and emits `(key, 1)`; the reduce
//! phase sums per key. Output is always ordered by count descending with ties
//! broken by key ascending, and every run replaces the previous output.

mod mapper;
mod reducer;
mod runner;

pub use mapper::{MapStats, extract_key, map_lines};
pub(crate) use mapper::truncate;
pub use reducer::{Reducer, parse_pair, reduce_lines};
pub use runner::{
    JobRunner, JobSpec, LocalJobRunner, SUCCESS_MARKER, StreamingJobRunner, partition_for,
    partition_name,
};

use snafu::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::emit;
use crate::error::{
    ClearOutputSnafu, InvalidReducerCountSnafu, JobError, MalformedOutputSnafu, ReadInputSnafu,
    ReadOutputSnafu, StaleOutputSnafu,
};
use crate::metrics::events::{RecordsAggregated, RecordsSkipped};
use crate::storage::{StorageRef, count_lines};

/// Totals per key in their canonical order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregationResult {
    rows: Vec<(String, u64)>,
}

impl AggregationResult {
    /// Build from `(key, count)` pairs, merging repeated keys.
    pub fn from_counts(counts: impl IntoIterator<Item = (String, u64)>) -> Self {
        let mut merged: HashMap<String, u64> = HashMap::new();
        for (key, count) in counts {
            let total = merged.entry(key).or_default();
            *total = total.saturating_add(count);
        }
        let mut rows: Vec<_> = merged.into_iter().collect();
        rows.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        Self { rows }
    }

    /// Parse `key<TAB>count` lines, e.g. the concatenation of all partitions.
    pub fn parse_tsv(text: &str) -> Result<Self, JobError> {
        let mut pairs = Vec::new();
        for line in text.lines().filter(|l| !l.trim().is_empty()) {
            let (key, count) = parse_pair(line).context(MalformedOutputSnafu { line })?;
            pairs.push((key.to_string(), count));
        }
        Ok(Self::from_counts(pairs))
    }

    pub fn rows(&self) -> &[(String, u64)] {
        &self.rows
    }

    pub fn get(&self, key: &str) -> Option<u64> {
        self.rows.iter().find(|(k, _)| k == key).map(|(_, c)| *c)
    }

    /// Sum of all counts.
    pub fn total(&self) -> u64 {
        self.rows.iter().map(|(_, c)| c).sum()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn to_tsv(&self) -> String {
        self.rows
            .iter()
            .map(|(key, count)| format!("{key}\t{count}\n"))
            .collect()
    }
}

/// Result of a job run with its accounting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    pub result: AggregationResult,
    /// Non-blank input lines.
    pub input_records: u64,
    /// Input records that yielded no key.
    pub skipped: u64,
    /// Data files found in the output path.
    pub partitions: usize,
}

/// Runs aggregation jobs and reads their output back.
pub struct AggregationEngine {
    storage: StorageRef,
    runner: Arc<dyn JobRunner>,
}

impl AggregationEngine {
    pub fn new(storage: StorageRef, runner: Arc<dyn JobRunner>) -> Self {
        Self { storage, runner }
    }

    /// Replace `output` with the aggregation of `input`.
    pub async fn run_job(
        &self,
        input: &str,
        output: &str,
        reducers: usize,
    ) -> Result<JobReport, JobError> {
        ensure!(reducers >= 1, InvalidReducerCountSnafu);

        self.storage
            .delete_recursive(output)
            .await
            .context(ClearOutputSnafu { path: output })?;
        let stale = self
            .storage
            .exists(output)
            .await
            .context(ClearOutputSnafu { path: output })?;
        ensure!(!stale, StaleOutputSnafu { path: output });

        let raw = self
            .storage
            .read_merged(input)
            .await
            .context(ReadInputSnafu { path: input })?;
        let input_records = count_lines(&raw);

        info!(input, output, reducers, input_records, "Submitting aggregation job");
        self.runner
            .submit(&JobSpec {
                input: input.to_string(),
                output: output.to_string(),
                reducers,
            })
            .await?;

        let (result, partitions) = self.read_output(output).await?;
        let skipped = input_records.saturating_sub(result.total());

        emit!(RecordsAggregated {
            count: result.total()
        });
        emit!(RecordsSkipped { count: skipped });
        info!(
            keys = result.len(),
            total = result.total(),
            skipped,
            partitions,
            "Aggregation complete"
        );

        Ok(JobReport {
            result,
            input_records,
            skipped,
            partitions,
        })
    }

    /// Merge every output partition into one globally ordered result.
    pub async fn read_output(&self, output: &str) -> Result<(AggregationResult, usize), JobError> {
        read_output(&self.storage, output).await
    }
}

/// Read all partitions under `output`; returns the merged result and partition count.
pub async fn read_output(
    storage: &StorageRef,
    output: &str,
) -> Result<(AggregationResult, usize), JobError> {
    let entries = storage
        .list(output, false)
        .await
        .context(ReadOutputSnafu { path: output })?;
    let partitions = entries.iter().filter(|e| e.is_data_file()).count();

    let merged = storage
        .read_merged(output)
        .await
        .context(ReadOutputSnafu { path: output })?;
    let result = AggregationResult::parse_tsv(&String::from_utf8_lossy(&merged))?;
    Ok((result, partitions))
}
