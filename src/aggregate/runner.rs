//! Job runners for the two-phase aggregation.

use async_trait::async_trait;
use bytes::Bytes;
use snafu::prelude::*;
use std::hash::{DefaultHasher, Hash, Hasher};
use tracing::{debug, info};

use crate::command::{CommandRunnerRef, Invocation};
use crate::error::{JobError, ReadInputSnafu, SubmitSnafu, WriteOutputSnafu};
use crate::storage::{StorageRef, join_path};

use super::mapper::extract_key;
use super::reducer::Reducer;

/// Marker written once every partition is committed.
pub const SUCCESS_MARKER: &str = "_SUCCESS";

/// Input, output, and reduce fan-out of one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub input: String,
    pub output: String,
    pub reducers: usize,
}

/// Name of reduce partition `index`.
pub fn partition_name(index: usize) -> String {
    format!("part-{index:05}")
}

/// Reduce partition for `key`.
///
/// Deterministic within one build only: `DefaultHasher` may change between
/// Rust releases. Read-back merges every partition, so the final result never
/// depends on where a key lands.
pub fn partition_for(key: &str, reducers: usize) -> usize {
    if reducers <= 1 {
        return 0;
    }
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % reducers as u64) as usize
}

/// Executes the map and reduce phases, writing partition files to `output`.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn submit(&self, job: &JobSpec) -> Result<(), JobError>;
}

/// Runs both phases in-process against the storage service.
pub struct LocalJobRunner {
    storage: StorageRef,
}

impl LocalJobRunner {
    pub fn new(storage: StorageRef) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl JobRunner for LocalJobRunner {
    async fn submit(&self, job: &JobSpec) -> Result<(), JobError> {
        let input = self
            .storage
            .read_merged(&job.input)
            .await
            .context(ReadInputSnafu { path: &job.input })?;

        let reducers = job.reducers.max(1);
        let mut partitions: Vec<Reducer> = (0..reducers).map(|_| Reducer::new()).collect();
        for line in String::from_utf8_lossy(&input).lines() {
            if let Some(key) = extract_key(line) {
                partitions[partition_for(&key, reducers)].add(&key, 1);
            }
        }

        for (index, reducer) in partitions.into_iter().enumerate() {
            let path = join_path(&job.output, &partition_name(index));
            let body = reducer.finish().to_tsv();
            debug!(path = %path, bytes = body.len(), "Writing partition");
            self.storage
                .write(&path, Bytes::from(body))
                .await
                .context(WriteOutputSnafu { path: &path })?;
        }

        let marker = join_path(&job.output, SUCCESS_MARKER);
        self.storage
            .write(&marker, Bytes::new())
            .await
            .context(WriteOutputSnafu { path: &marker })?;

        info!(input = %job.input, output = %job.output, reducers, "Local job finished");
        Ok(())
    }
}

/// Submits a hadoop-streaming job whose mapper and reducer are this binary.
pub struct StreamingJobRunner {
    runner: CommandRunnerRef,
    jar: String,
    mapper_command: String,
    reducer_command: String,
    exec_prefix: Vec<String>,
}

impl StreamingJobRunner {
    pub fn new(
        runner: CommandRunnerRef,
        jar: impl Into<String>,
        mapper_command: impl Into<String>,
        reducer_command: impl Into<String>,
        exec_prefix: Vec<String>,
    ) -> Self {
        Self {
            runner,
            jar: jar.into(),
            mapper_command: mapper_command.into(),
            reducer_command: reducer_command.into(),
            exec_prefix,
        }
    }

    pub(crate) fn invocation(&self, job: &JobSpec) -> Invocation {
        Invocation::new("hadoop")
            .args(["jar", &self.jar])
            .args([
                "-D".to_string(),
                format!("mapreduce.job.reduces={}", job.reducers.max(1)),
            ])
            .args(["-input", &job.input])
            .args(["-output", &job.output])
            .args(["-mapper", &self.mapper_command])
            .args(["-reducer", &self.reducer_command])
            .prefixed(&self.exec_prefix)
    }
}

#[async_trait]
impl JobRunner for StreamingJobRunner {
    async fn submit(&self, job: &JobSpec) -> Result<(), JobError> {
        let invocation = self.invocation(job);
        info!(job = %invocation, "Submitting streaming job");
        self.runner.run(&invocation).await.context(SubmitSnafu)?;
        Ok(())
    }
}
