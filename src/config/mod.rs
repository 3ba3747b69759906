//! Configuration parsing and defaults.
//!
//! Every component receives its settings from an explicit `Config` built once
//! at startup. The YAML file is optional; missing sections and fields fall back
//! to defaults matching the reference deployment (HDFS namenode, MySQL retail
//! database, four-directory namespace under `/pipeline`).

mod vars;

use serde::{Deserialize, Serialize};
use snafu::prelude::*;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::error::{
    ConfigError, DuplicateImportSnafu, EmptyImportFieldSnafu, EnvInterpolationSnafu,
    InvalidRootSnafu, MissingServiceCommandSnafu, MissingStreamingJarSnafu, NoChildrenSnafu,
    ReadFileSnafu, YamlParseSnafu, ZeroAttemptsSnafu, ZeroParallelismSnafu, ZeroPollIntervalSnafu,
    ZeroReducersSnafu,
};
use crate::import::{Dataset, ImportSpec};
use crate::provision::NamespaceTree;
use crate::readiness::{Protocol, ServiceEndpoint};

/// Main configuration structure for the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub namespace: NamespaceTree,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub relational: RelationalConfig,
    /// Bulk imports, run concurrently during the import stage.
    #[serde(default = "default_imports")]
    pub imports: Vec<ImportSpec>,
    #[serde(default)]
    pub aggregation: AggregationConfig,
    #[serde(default)]
    pub ingestion: IngestionConfig,
    /// Services whose reachability is reported by `verify`.
    #[serde(default = "default_services")]
    pub services: Vec<ServiceEndpoint>,
    #[serde(default)]
    pub verification: VerificationConfig,
    /// Metrics configuration (optional, disabled by default).
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            namespace: NamespaceTree::default(),
            storage: StorageConfig::default(),
            relational: RelationalConfig::default(),
            imports: default_imports(),
            aggregation: AggregationConfig::default(),
            ingestion: IngestionConfig::default(),
            services: default_services(),
            verification: VerificationConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

/// Bounded polling budget for a readiness gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadinessPolicy {
    pub max_attempts: u32,
    pub interval_secs: u64,
}

impl ReadinessPolicy {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 30,
            interval_secs: 2,
        }
    }
}

/// Storage backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// `hdfs://authority/base` for the HDFS CLI, `file:///dir` or `/dir` for a local tree.
    #[serde(default = "default_storage_url")]
    pub url: String,
    /// Argv prefix for storage commands, e.g. `[docker, exec, namenode]`.
    #[serde(default)]
    pub exec_prefix: Vec<String>,
    /// Gate applied before provisioning.
    #[serde(default)]
    pub readiness: ReadinessPolicy,
    /// Kill a single storage command after this many seconds (0 disables).
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            url: default_storage_url(),
            exec_prefix: Vec::new(),
            readiness: ReadinessPolicy::default(),
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

fn default_storage_url() -> String {
    "hdfs:///".to_string()
}

fn default_command_timeout_secs() -> u64 {
    600
}

/// Relational source reached through the bulk copy CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationalConfig {
    /// JDBC connect string.
    #[serde(default = "default_connect")]
    pub connect: String,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default)]
    pub password: String,
    /// Argv prefix for bulk copy commands.
    #[serde(default)]
    pub exec_prefix: Vec<String>,
    /// Trivial query used as the primary connectivity proof.
    #[serde(default = "default_probe_query")]
    pub probe_query: String,
    /// Kill a connectivity check (`eval`, `list-tables`) after this many seconds (0 disables).
    #[serde(default = "default_connectivity_timeout_secs")]
    pub connectivity_timeout_secs: u64,
}

impl Default for RelationalConfig {
    fn default() -> Self {
        Self {
            connect: default_connect(),
            username: default_username(),
            password: String::new(),
            exec_prefix: Vec::new(),
            probe_query: default_probe_query(),
            connectivity_timeout_secs: default_connectivity_timeout_secs(),
        }
    }
}

fn default_connect() -> String {
    "jdbc:mysql://mysql:3306/retail".to_string()
}

fn default_username() -> String {
    "root".to_string()
}

fn default_probe_query() -> String {
    "SELECT 1".to_string()
}

fn default_connectivity_timeout_secs() -> u64 {
    60
}

fn default_imports() -> Vec<ImportSpec> {
    vec![
        ImportSpec {
            name: "customers".to_string(),
            table: "customers".to_string(),
            predicate: Some("country = 'USA'".to_string()),
            target: "/pipeline/imported/customers".to_string(),
            delimiter: ',',
            parallelism: 2,
            split_column: "customer_id".to_string(),
            schema: Some(Dataset::Customers),
        },
        ImportSpec {
            name: "orders".to_string(),
            table: "orders".to_string(),
            predicate: Some("order_status = 'COMPLETE'".to_string()),
            target: "/pipeline/imported/orders".to_string(),
            delimiter: ',',
            parallelism: 2,
            split_column: "order_id".to_string(),
            schema: Some(Dataset::Orders),
        },
    ]
}

/// Which job runner executes the aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerKind {
    /// Map and reduce in-process against the storage service.
    #[default]
    Local,
    /// Submit a hadoop-streaming job that shells out to `avalanche map`/`reduce`.
    Streaming,
}

/// Aggregation job configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationConfig {
    #[serde(default = "default_aggregation_input")]
    pub input: String,
    #[serde(default = "default_aggregation_output")]
    pub output: String,
    #[serde(default = "default_reducers")]
    pub reducers: usize,
    #[serde(default)]
    pub runner: RunnerKind,
    /// Path of the hadoop-streaming jar (streaming runner only).
    #[serde(default)]
    pub streaming_jar: Option<String>,
    #[serde(default = "default_mapper_command")]
    pub mapper_command: String,
    #[serde(default = "default_reducer_command")]
    pub reducer_command: String,
    /// Argv prefix for job submission.
    #[serde(default)]
    pub exec_prefix: Vec<String>,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            input: default_aggregation_input(),
            output: default_aggregation_output(),
            reducers: default_reducers(),
            runner: RunnerKind::default(),
            streaming_jar: None,
            mapper_command: default_mapper_command(),
            reducer_command: default_reducer_command(),
            exec_prefix: Vec::new(),
        }
    }
}

fn default_aggregation_input() -> String {
    "/pipeline/raw".to_string()
}

fn default_aggregation_output() -> String {
    "/pipeline/aggregated/action_counts".to_string()
}

fn default_reducers() -> usize {
    1
}

fn default_mapper_command() -> String {
    "avalanche map".to_string()
}

fn default_reducer_command() -> String {
    "avalanche reduce".to_string()
}

/// Streaming ingestion wait.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionConfig {
    /// Directory the streaming collaborator writes into.
    #[serde(default = "default_ingestion_area")]
    pub area: String,
    #[serde(default = "default_ingestion_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Fail the stage instead of warning when nothing arrives before the timeout.
    #[serde(default)]
    pub require_data: bool,
}

impl IngestionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Number of polls that fit in the timeout, at least one.
    pub fn max_polls(&self) -> u32 {
        let polls = self
            .timeout_secs
            .checked_div(self.poll_interval_secs)
            .unwrap_or(0);
        u32::try_from(polls).unwrap_or(u32::MAX).max(1)
    }
}

impl Default for IngestionConfig {
    fn default() -> Self {
        Self {
            area: default_ingestion_area(),
            timeout_secs: default_ingestion_timeout_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            require_data: false,
        }
    }
}

fn default_ingestion_area() -> String {
    "/pipeline/streaming".to_string()
}

fn default_ingestion_timeout_secs() -> u64 {
    60
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_services() -> Vec<ServiceEndpoint> {
    vec![
        ServiceEndpoint {
            name: "namenode".to_string(),
            address: "http://namenode:9870".to_string(),
            protocol: Protocol::Http,
            command: Vec::new(),
        },
        ServiceEndpoint {
            name: "mysql".to_string(),
            address: "mysql:3306".to_string(),
            protocol: Protocol::Tcp,
            command: Vec::new(),
        },
    ]
}

/// Verification report settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationConfig {
    /// Lines sampled from each dataset.
    #[serde(default = "default_sample_lines")]
    pub sample_lines: usize,
    /// Probe attempts per service; verification never blocks long on one service.
    #[serde(default = "default_probe_attempts")]
    pub probe_attempts: u32,
    #[serde(default = "default_probe_interval_secs")]
    pub probe_interval_secs: u64,
    #[serde(default = "default_http_timeout_secs")]
    pub http_timeout_secs: u64,
    /// Kill a command-protocol service probe after this many seconds (0 disables).
    #[serde(default = "default_probe_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

impl VerificationConfig {
    pub fn probe_policy(&self) -> ReadinessPolicy {
        ReadinessPolicy {
            max_attempts: self.probe_attempts,
            interval_secs: self.probe_interval_secs,
        }
    }
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            sample_lines: default_sample_lines(),
            probe_attempts: default_probe_attempts(),
            probe_interval_secs: default_probe_interval_secs(),
            http_timeout_secs: default_http_timeout_secs(),
            command_timeout_secs: default_probe_command_timeout_secs(),
        }
    }
}

fn default_sample_lines() -> usize {
    5
}

fn default_probe_attempts() -> u32 {
    1
}

fn default_probe_interval_secs() -> u64 {
    1
}

fn default_http_timeout_secs() -> u64 {
    5
}

fn default_probe_command_timeout_secs() -> u64 {
    30
}

/// Metrics configuration for Prometheus endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether the metrics endpoint is served (default: false).
    #[serde(default)]
    pub enabled: bool,
    /// Address to bind the metrics HTTP server (default: "0.0.0.0:9090").
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            address: default_metrics_address(),
        }
    }
}

fn default_metrics_address() -> String {
    "0.0.0.0:9090".to_string()
}

impl Config {
    /// Load configuration from a YAML file with environment variable interpolation.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::from_file_with_options(path, true)
    }

    /// Load configuration from a YAML file with optional environment variable interpolation.
    pub fn from_file_with_options(
        path: impl AsRef<Path>,
        interpolate_env: bool,
    ) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).context(ReadFileSnafu)?;
        Self::from_yaml(&content, interpolate_env)
    }

    /// Parse configuration from YAML text.
    pub fn from_yaml(content: &str, interpolate_env: bool) -> Result<Self, ConfigError> {
        let content = if interpolate_env {
            let result = vars::interpolate(content);
            ensure!(
                result.is_ok(),
                EnvInterpolationSnafu {
                    message: result.report()
                }
            );
            result.text
        } else {
            content.to_string()
        };

        let config: Config = serde_yaml::from_str(&content).context(YamlParseSnafu)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let root = self.namespace.root.trim();
        ensure!(
            root.starts_with('/'),
            InvalidRootSnafu {
                root: self.namespace.root.clone()
            }
        );
        ensure!(
            self.namespace.children.iter().any(|c| !c.trim().is_empty()),
            NoChildrenSnafu
        );
        self.namespace.mode_bits()?;

        ensure!(
            self.storage.readiness.max_attempts > 0,
            ZeroAttemptsSnafu { target: "storage" }
        );
        ensure!(
            self.verification.probe_attempts > 0,
            ZeroAttemptsSnafu {
                target: "verification"
            }
        );

        let mut seen = HashSet::new();
        for spec in &self.imports {
            ensure!(
                !spec.name.trim().is_empty(),
                EmptyImportFieldSnafu {
                    name: spec.table.clone(),
                    field: "name"
                }
            );
            ensure!(
                seen.insert(spec.name.as_str()),
                DuplicateImportSnafu {
                    name: spec.name.clone()
                }
            );
            for (field, value) in [
                ("table", &spec.table),
                ("target", &spec.target),
                ("split_column", &spec.split_column),
            ] {
                ensure!(
                    !value.trim().is_empty(),
                    EmptyImportFieldSnafu {
                        name: spec.name.clone(),
                        field
                    }
                );
            }
            ensure!(
                spec.parallelism > 0,
                ZeroParallelismSnafu {
                    name: spec.name.clone()
                }
            );
        }

        ensure!(self.aggregation.reducers > 0, ZeroReducersSnafu);
        ensure!(
            self.ingestion.timeout_secs == 0 || self.ingestion.poll_interval_secs > 0,
            ZeroPollIntervalSnafu {
                timeout_secs: self.ingestion.timeout_secs
            }
        );
        if self.aggregation.runner == RunnerKind::Streaming {
            ensure!(
                self.aggregation
                    .streaming_jar
                    .as_deref()
                    .is_some_and(|jar| !jar.trim().is_empty()),
                MissingStreamingJarSnafu
            );
        }

        for service in &self.services {
            if service.protocol == Protocol::Command {
                ensure!(
                    !service.command.is_empty(),
                    MissingServiceCommandSnafu {
                        name: service.name.clone()
                    }
                );
            }
        }

        Ok(())
    }
}
