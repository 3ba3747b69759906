//! End-to-end pipeline orchestration.
//!
//! Stages run strictly in sequence on a single control path, each reading
//! what the previous one committed:
//!
//! ```text
//! Idle -> Provisioning -> Ingesting -> Importing -> Aggregating -> Verifying -> Done
//!                                                                           \-> Aborted
//! ```
//!
//! Under `HaltOnFirstFailure` the first failing stage moves the run straight to
//! `Aborted`; under `ContinueAndAggregate` every stage runs and its outcome is
//! recorded.

mod run;

pub use run::{PipelineRun, PipelineState, RunPolicy, Stage, StageOutcome, Status};

use snafu::prelude::*;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::aggregate::{AggregationEngine, JobReport, JobRunner, LocalJobRunner, StreamingJobRunner};
use crate::command::{CommandRunnerRef, ProcessRunner};
use crate::config::{Config, RunnerKind};
use crate::emit;
use crate::error::{
    AggregatingSnafu, ImportError, ImportingSnafu, IngestError, IngestingSnafu,
    InvalidArgumentSnafu, JobError, PipelineError, PipelineStorageSnafu, ProvisionError,
    ProvisioningSnafu, VerifyingSnafu, error_chain,
};
use crate::import::{BulkCopy, ExtractFilterLoader, ImportResult, ImportSpec, RelationalSource, SqoopCli};
use crate::ingest::{IngestOutcome, StreamingIngest};
use crate::metrics::events::StageCompleted;
use crate::provision::{ProvisionedTree, ResourceProvisioner};
use crate::storage::{StorageProvider, StorageRef};
use crate::verify::VerificationReporter;

/// Status and human-readable detail of a stage that did not abort.
type StageSummary = (Status, String);

/// Wires every component from one `Config` and sequences the stages.
pub struct Orchestrator {
    config: Config,
    storage: StorageRef,
    runner: CommandRunnerRef,
    source: Arc<dyn RelationalSource>,
    loader: ExtractFilterLoader,
    engine: AggregationEngine,
}

impl Orchestrator {
    /// Build the production collaborators described by `config`.
    pub fn from_config(config: Config) -> Result<Self, PipelineError> {
        let runner: CommandRunnerRef = Arc::new(ProcessRunner::new());
        // Service probes must not hang verification.
        let probe_runner = bounded_runner(config.verification.command_timeout_secs);

        let storage = StorageProvider::for_url(
            &config.storage.url,
            bounded_runner(config.storage.command_timeout_secs),
            config.storage.exec_prefix.clone(),
        )
        .context(PipelineStorageSnafu)?;

        let sqoop = Arc::new(
            SqoopCli::new(config.relational.clone(), runner.clone()).with_connectivity_runner(
                bounded_runner(config.relational.connectivity_timeout_secs),
            ),
        );

        let aggregation = &config.aggregation;
        let jobs: Arc<dyn JobRunner> = match aggregation.runner {
            RunnerKind::Local => Arc::new(LocalJobRunner::new(storage.clone())),
            RunnerKind::Streaming => Arc::new(StreamingJobRunner::new(
                runner.clone(),
                aggregation.streaming_jar.clone().unwrap_or_default(),
                aggregation.mapper_command.clone(),
                aggregation.reducer_command.clone(),
                aggregation.exec_prefix.clone(),
            )),
        };

        info!(
            storage = %storage.describe(),
            runner = ?aggregation.runner,
            imports = config.imports.len(),
            "Orchestrator configured"
        );

        Ok(Self::with_collaborators(
            config,
            storage,
            probe_runner,
            sqoop.clone(),
            sqoop,
            jobs,
        ))
    }

    /// Build from explicit collaborators; `runner` executes command service probes.
    pub fn with_collaborators(
        config: Config,
        storage: StorageRef,
        runner: CommandRunnerRef,
        source: Arc<dyn RelationalSource>,
        copier: Arc<dyn BulkCopy>,
        jobs: Arc<dyn JobRunner>,
    ) -> Self {
        let loader = ExtractFilterLoader::new(
            source.clone(),
            copier,
            storage.clone(),
            config.relational.probe_query.clone(),
        );
        let engine = AggregationEngine::new(storage.clone(), jobs);
        Self {
            config,
            storage,
            runner,
            source,
            loader,
            engine,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn storage(&self) -> &StorageRef {
        &self.storage
    }

    /// Ensure the namespace tree.
    pub async fn provision(&self) -> Result<ProvisionedTree, ProvisionError> {
        ResourceProvisioner::new(self.storage.clone(), self.config.storage.readiness)
            .ensure_tree(&self.config.namespace)
            .await
    }

    /// Wait for the streaming collaborator to produce data.
    pub async fn ingest(&self) -> Result<IngestOutcome, IngestError> {
        StreamingIngest::new(self.storage.clone(), self.config.ingestion.clone())
            .await_data()
            .await
    }

    /// Configured imports restricted to `names`; all of them when `names` is empty.
    pub fn select_imports(&self, names: &[String]) -> Result<Vec<ImportSpec>, PipelineError> {
        if let Some(unknown) = names
            .iter()
            .find(|n| !self.config.imports.iter().any(|spec| &spec.name == *n))
        {
            return InvalidArgumentSnafu {
                message: format!("no import named '{unknown}'"),
            }
            .fail();
        }
        Ok(self
            .config
            .imports
            .iter()
            .filter(|spec| names.is_empty() || names.contains(&spec.name))
            .cloned()
            .collect())
    }

    /// Run `specs` concurrently; results follow `specs` order.
    pub async fn import(
        &self,
        specs: &[ImportSpec],
        policy: RunPolicy,
    ) -> Vec<Result<ImportResult, ImportError>> {
        self.loader.run_all(specs, policy).await
    }

    /// Run the configured aggregation job.
    pub async fn aggregate(&self) -> Result<JobReport, JobError> {
        let aggregation = &self.config.aggregation;
        self.engine
            .run_job(&aggregation.input, &aggregation.output, aggregation.reducers)
            .await
    }

    /// Reporter over the same collaborators.
    pub fn reporter(&self) -> VerificationReporter {
        VerificationReporter::new(
            self.config.clone(),
            self.storage.clone(),
            self.runner.clone(),
            self.source.clone(),
        )
    }

    /// One line per stage describing what a run would do.
    pub fn plan(&self) -> Vec<String> {
        let config = &self.config;
        let mut lines = vec![
            format!(
                "{}: ensure {} with [{}] mode {} on {}",
                Stage::Provisioning,
                config.namespace.root,
                config.namespace.children.join(", "),
                config.namespace.mode,
                self.storage.describe()
            ),
            format!(
                "{}: wait up to {}s for data in {}{}",
                Stage::Ingesting,
                config.ingestion.timeout_secs,
                config.ingestion.area,
                if config.ingestion.require_data {
                    " (required)"
                } else {
                    ""
                }
            ),
        ];
        for spec in &config.imports {
            lines.push(format!(
                "{}: {} <- {} where {} (split by {}, {} mapper(s))",
                Stage::Importing,
                spec.target,
                spec.table,
                spec.predicate.as_deref().unwrap_or("true"),
                spec.split_column,
                spec.parallelism
            ));
        }
        lines.push(format!(
            "{}: {} -> {} with {} reducer(s) ({:?} runner)",
            Stage::Aggregating,
            config.aggregation.input,
            config.aggregation.output,
            config.aggregation.reducers,
            config.aggregation.runner
        ));
        lines.push(format!(
            "{}: {} import(s), {} service(s)",
            Stage::Verifying,
            config.imports.len(),
            config.services.len()
        ));
        lines
    }

    /// Run every stage in order under `policy`.
    pub async fn run(&self, policy: RunPolicy) -> PipelineRun {
        let mut state = PipelineState::Idle;
        let mut outcomes = Vec::with_capacity(Stage::ALL.len());
        let mut failure = None;

        info!(policy = ?policy, "Starting pipeline run");

        for stage in Stage::ALL {
            state = transition(state, PipelineState::Running(stage));
            let start = Instant::now();
            let result = self.execute(stage, policy).await;
            let duration = start.elapsed();

            let (status, detail, error) = match result {
                Ok((status, detail)) => (status, detail, None),
                Err(e) => (Status::Fail, error_chain(&e), Some(e)),
            };

            emit!(StageCompleted {
                stage,
                status,
                duration,
            });
            match status {
                Status::Ok => info!(stage = stage.as_str(), detail = %detail, "Stage complete"),
                Status::Warn => warn!(stage = stage.as_str(), detail = %detail, "Stage complete with warnings"),
                Status::Fail => error!(stage = stage.as_str(), detail = %detail, "Stage failed"),
            }

            outcomes.push(StageOutcome {
                stage,
                status,
                detail,
                duration,
            });

            if policy == RunPolicy::HaltOnFirstFailure {
                if let Some(e) = error {
                    failure = Some(e);
                    break;
                }
            }
        }

        let terminal = if failure.is_some() {
            PipelineState::Aborted
        } else {
            PipelineState::Done
        };
        state = transition(state, terminal);

        let run = PipelineRun::new(policy, state, outcomes, failure);
        info!(
            state = %run.state(),
            status = run.status().as_str(),
            failed = run.failed_stages(),
            "Pipeline run finished"
        );
        run
    }

    async fn execute(&self, stage: Stage, policy: RunPolicy) -> Result<StageSummary, PipelineError> {
        match stage {
            Stage::Provisioning => {
                let tree = self.provision().await.context(ProvisioningSnafu)?;
                Ok((
                    Status::Ok,
                    format!("{} ready with {} children", tree.root, tree.children.len()),
                ))
            }
            Stage::Ingesting => {
                let outcome = self.ingest().await.context(IngestingSnafu)?;
                let detail = if outcome.files == 0 {
                    format!(
                        "no data in {} after {} poll(s), continuing",
                        self.config.ingestion.area, outcome.polls
                    )
                } else {
                    format!("{} file(s) in {}", outcome.files, self.config.ingestion.area)
                };
                Ok((outcome.status(), detail))
            }
            Stage::Importing => self.import_stage(policy).await,
            Stage::Aggregating => {
                let report = self.aggregate().await.context(AggregatingSnafu)?;
                let status = if report.result.is_empty() {
                    Status::Warn
                } else {
                    Status::Ok
                };
                Ok((
                    status,
                    format!(
                        "{} key(s) from {} record(s), {} skipped, {} partition(s)",
                        report.result.len(),
                        report.result.total(),
                        report.skipped,
                        report.partitions
                    ),
                ))
            }
            Stage::Verifying => {
                let report = self.reporter().verify_all().await;
                for check in report.checks() {
                    debug!(check = %check.name, status = check.status.as_str(), detail = %check.detail, "Check");
                }
                ensure!(
                    report.failed() == 0,
                    VerifyingSnafu {
                        failed: report.failed()
                    }
                );
                Ok((
                    report.status(),
                    format!(
                        "{} check(s), {} warning(s)",
                        report.checks().len(),
                        report.warned()
                    ),
                ))
            }
        }
    }

    async fn import_stage(&self, policy: RunPolicy) -> Result<StageSummary, PipelineError> {
        let results = self.import(&self.config.imports, policy).await;

        let mut status = Status::Ok;
        let mut parts = Vec::with_capacity(results.len());
        let mut first_error = None;
        for result in results {
            match result {
                Ok(imported) => {
                    status = status.max(imported.status());
                    parts.push(format!(
                        "{}: {} row(s) in {} partition(s)",
                        imported.dataset, imported.rows, imported.partitions
                    ));
                }
                // Aborted siblings only follow a real failure.
                Err(ImportError::Aborted { dataset }) => {
                    parts.push(format!("{dataset}: aborted"));
                }
                Err(e) => {
                    parts.push(e.to_string());
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_error {
            debug!(datasets = %parts.join("; "), "Import stage failed");
            return Err(e).context(ImportingSnafu);
        }
        if parts.is_empty() {
            return Ok((Status::Warn, "no imports configured".to_string()));
        }
        Ok((status, parts.join("; ")))
    }
}

fn transition(state: PipelineState, next: PipelineState) -> PipelineState {
    match state.advance(next) {
        Some(next) => {
            debug!(from = %state, to = %next, "Pipeline state change");
            next
        }
        None => {
            warn!(from = %state, to = %next, "Ignoring backward state change");
            state
        }
    }
}

/// A process runner that kills commands after `secs` seconds; 0 means unbounded.
fn bounded_runner(secs: u64) -> CommandRunnerRef {
    match secs {
        0 => Arc::new(ProcessRunner::new()),
        secs => Arc::new(ProcessRunner::new().with_timeout(Duration::from_secs(secs))),
    }
}
