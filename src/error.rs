//! Error types for Avalanche using snafu.
//!
//! This module defines structured error types with context selectors for
//! all error conditions in the codebase. The per-stage errors (`ProvisionError`,
//! `ImportError`, `JobError`, `IngestError`) abort an end-to-end run; a
//! `VerificationFailure` only ever marks a single check as failed.

use snafu::prelude::*;

use crate::pipeline::Stage;

// ============ Command Errors ============

/// Errors from invoking an external collaborator command.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CommandError {
    /// The invocation has no program to run.
    #[snafu(display("Command line is empty"))]
    EmptyCommand,

    /// The process could not be started.
    #[snafu(display("Failed to spawn '{program}': {source}"))]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    /// Writing stdin or collecting output failed.
    #[snafu(display("Failed to communicate with '{program}': {source}"))]
    Wait {
        program: String,
        source: std::io::Error,
    },

    /// The process did not finish within the configured timeout.
    #[snafu(display("Command '{program}' timed out after {secs}s"))]
    Timeout { program: String, secs: u64 },

    /// The process exited with a non-zero status.
    #[snafu(display("Command '{program}' exited with status {code}: {stderr}"))]
    NonZeroExit {
        program: String,
        code: i32,
        stderr: String,
    },
}

// ============ Storage Errors ============

/// Errors that can occur during storage operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StorageError {
    /// Invalid storage URL format.
    #[snafu(display("Invalid storage URL: {url}"))]
    InvalidUrl { url: String },

    /// A storage CLI command failed.
    #[snafu(display("Storage command failed: {source}"))]
    StorageCommand { source: CommandError },

    /// IO error against the local backend.
    #[snafu(display("IO error on {path}: {source}"))]
    Io {
        path: String,
        source: std::io::Error,
    },

    /// Path does not exist.
    #[snafu(display("Path not found: {path}"))]
    NotFound { path: String },

    /// Listing output could not be interpreted.
    #[snafu(display("Unrecognized listing line: {line}"))]
    ListingParse { line: String },
}

impl StorageError {
    /// Check if this error represents a "not found" condition.
    pub fn is_not_found(&self) -> bool {
        match self {
            StorageError::NotFound { .. } => true,
            StorageError::Io { source, .. } => source.kind() == std::io::ErrorKind::NotFound,
            StorageError::StorageCommand {
                source: CommandError::NonZeroExit { stderr, .. },
            } => stderr.contains("No such file or directory"),
            _ => false,
        }
    }
}

// ============ Config Errors ============

/// Errors that can occur during configuration parsing and validation.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    /// Namespace root is empty or relative.
    #[snafu(display("Namespace root must be an absolute path, got '{root}'"))]
    InvalidRoot { root: String },

    /// Namespace has no children.
    #[snafu(display("Namespace must declare at least one child path"))]
    NoChildren,

    /// Permission mode is not a valid octal string.
    #[snafu(display("Invalid permission mode '{mode}' (expected octal such as 775)"))]
    InvalidMode { mode: String },

    /// An import is missing a required field.
    #[snafu(display("Import '{name}' has an empty {field}"))]
    EmptyImportField { name: String, field: &'static str },

    /// An import requests zero mappers.
    #[snafu(display("Import '{name}' must have parallelism of at least 1"))]
    ZeroParallelism { name: String },

    /// Two imports share a name.
    #[snafu(display("Duplicate import name '{name}'"))]
    DuplicateImport { name: String },

    /// Aggregation reducer count is zero.
    #[snafu(display("Aggregation requires at least one reducer"))]
    ZeroReducers,

    /// Ingestion would wait without ever re-polling.
    #[snafu(display("ingestion.poll_interval_secs must be positive when timeout_secs is {timeout_secs}"))]
    ZeroPollInterval { timeout_secs: u64 },

    /// Readiness attempts must be positive.
    #[snafu(display("Readiness for {target} must allow at least one attempt"))]
    ZeroAttempts { target: &'static str },

    /// Command-protocol service without a command.
    #[snafu(display("Service '{name}' uses the command protocol but has no command"))]
    MissingServiceCommand { name: String },

    /// Streaming runner without a jar.
    #[snafu(display("Streaming aggregation runner requires streaming_jar"))]
    MissingStreamingJar,

    /// Environment variable interpolation failed.
    #[snafu(display("Environment variable interpolation failed:\n{message}"))]
    EnvInterpolation { message: String },

    /// Failed to parse YAML configuration.
    #[snafu(display("Failed to parse YAML configuration: {source}"))]
    YamlParse { source: serde_yaml::Error },

    /// Failed to read configuration file.
    #[snafu(display("Failed to read configuration file: {source}"))]
    ReadFile { source: std::io::Error },
}

// ============ Readiness Errors ============

/// Errors from the readiness gate.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ReadinessError {
    /// The probe never succeeded within the attempt budget.
    #[snafu(display("{target} not ready after {attempts} attempts: {last_error}"))]
    TimedOut {
        target: String,
        attempts: u32,
        last_error: String,
    },

    /// The HTTP client for a probe could not be built.
    #[snafu(display("Failed to build HTTP probe for {target}: {source}"))]
    HttpClient {
        target: String,
        source: reqwest::Error,
    },
}

// ============ Provision Errors ============

/// Errors that abort namespace provisioning.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ProvisionError {
    /// Storage service never became reachable.
    #[snafu(display("Storage service not ready: {source}"))]
    StorageNotReady { source: ReadinessError },

    /// The tree definition itself is invalid.
    #[snafu(display("Invalid namespace tree: {source}"))]
    InvalidTree { source: ConfigError },

    /// Creating a directory failed.
    #[snafu(display("Failed to create {path}: {source}"))]
    CreatePath { path: String, source: StorageError },

    /// Applying permissions failed.
    #[snafu(display("Failed to set permissions on {path}: {source}"))]
    SetPermissions { path: String, source: StorageError },

    /// Re-listing the tree failed.
    #[snafu(display("Failed to list {path}: {source}"))]
    ListTree { path: String, source: StorageError },

    /// A required child is absent after creation.
    #[snafu(display("Required path {path} missing after provisioning"))]
    MissingChild { path: String },

    /// A required child exists but is not a directory.
    #[snafu(display("Required path {path} is not a directory"))]
    NotDirectory { path: String },

    /// A path carries permission bits beyond the requested mode.
    #[snafu(display("Path {path} has mode {actual:o}, exceeds requested {requested:o}"))]
    PermissionMismatch {
        path: String,
        actual: u32,
        requested: u32,
    },
}

// ============ Import Errors ============

/// Errors from a single bulk import.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ImportError {
    /// Neither the probe query nor the table listing succeeded.
    #[snafu(display(
        "Relational source unreachable for '{dataset}' (query: {query_error}; list-tables: {list_error})"
    ))]
    ConnectivityUnconfirmed {
        dataset: String,
        query_error: String,
        list_error: String,
    },

    /// Removing stale output failed.
    #[snafu(display("Failed to clear target for '{dataset}': {source}"))]
    ClearTarget {
        dataset: String,
        source: StorageError,
    },

    /// The bulk copy job failed.
    #[snafu(display("Bulk copy for '{dataset}' failed: {source}"))]
    BulkCopy {
        dataset: String,
        source: CommandError,
    },

    /// Listing the imported partitions failed.
    #[snafu(display("Failed to list output of '{dataset}': {source}"))]
    ListOutput {
        dataset: String,
        source: StorageError,
    },

    /// Reading back the imported rows failed.
    #[snafu(display("Failed to count rows of '{dataset}': {source}"))]
    CountRows {
        dataset: String,
        source: StorageError,
    },

    /// Another import failed first and this one was cancelled.
    #[snafu(display("Import '{dataset}' aborted after a sibling import failed"))]
    Aborted { dataset: String },
}

// ============ Record Errors ============

/// Structured parse errors for imported dataset rows.
#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub))]
pub enum RecordError {
    /// Row does not have the expected number of columns.
    #[snafu(display("{dataset} row has {found} columns, expected {expected}"))]
    ColumnCount {
        dataset: &'static str,
        expected: usize,
        found: usize,
    },

    /// A required field is blank.
    #[snafu(display("{dataset} field '{field}' is empty"))]
    EmptyField {
        dataset: &'static str,
        field: &'static str,
    },

    /// A field could not be converted to its type.
    #[snafu(display("{dataset} field '{field}' has invalid value '{value}'"))]
    InvalidField {
        dataset: &'static str,
        field: &'static str,
        value: String,
    },
}

// ============ Job Errors ============

/// Errors from the aggregation job.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum JobError {
    /// Reducer count of zero.
    #[snafu(display("Reducer count must be at least 1"))]
    InvalidReducerCount,

    /// Deleting the previous output failed.
    #[snafu(display("Failed to clear output {path}: {source}"))]
    ClearOutput { path: String, source: StorageError },

    /// Output path still exists after deletion.
    #[snafu(display("Output path {path} still exists before job submission"))]
    StaleOutput { path: String },

    /// Reading the job input failed.
    #[snafu(display("Failed to read job input {path}: {source}"))]
    ReadInput { path: String, source: StorageError },

    /// The external job runner failed.
    #[snafu(display("Job submission failed: {source}"))]
    Submit { source: CommandError },

    /// Writing job output failed.
    #[snafu(display("Failed to write job output {path}: {source}"))]
    WriteOutput { path: String, source: StorageError },

    /// Reading job output failed.
    #[snafu(display("Failed to read job output {path}: {source}"))]
    ReadOutput { path: String, source: StorageError },

    /// An output row is not `key<TAB>count`.
    #[snafu(display("Malformed output row: {line:?}"))]
    MalformedOutput { line: String },
}

// ============ Ingest Errors ============

/// Errors from waiting on the streaming ingestion collaborator.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum IngestError {
    /// No data arrived and the configuration requires it.
    #[snafu(display("No streaming output in {area} after {attempts} polls"))]
    NoStreamingData { area: String, attempts: u32 },
}

// ============ Verification Errors ============

/// A single verification check failed. Never aborts the report.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum VerificationFailure {
    /// Required resource is absent.
    #[snafu(display("{resource} is missing"))]
    Missing { resource: String },

    /// A storage read failed while checking.
    #[snafu(display("Storage check on {path} failed: {source}"))]
    CheckStorage { path: String, source: StorageError },

    /// A service did not answer its probe.
    #[snafu(display("{source}"))]
    Unreachable { source: ReadinessError },

    /// Aggregation output is unreadable.
    #[snafu(display("{source}"))]
    CheckJob { source: JobError },
}

// ============ Generator Errors ============

/// Errors from the synthetic log generator.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum GenerateError {
    /// Rate is zero, negative, or not finite.
    #[snafu(display("--rate must be positive, got {rate}"))]
    InvalidRate { rate: f64 },

    /// Duration is negative or not finite.
    #[snafu(display("--duration must be non-negative, got {duration}"))]
    InvalidDuration { duration: f64 },

    /// Writing a record failed.
    #[snafu(display("Failed to write record: {source}"))]
    WriteRecord { source: std::io::Error },

    /// A record could not be serialized.
    #[snafu(display("Failed to serialize record: {source}"))]
    SerializeRecord { source: serde_json::Error },
}

// ============ Metrics Errors ============

/// Errors that can occur during metrics initialization.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MetricsError {
    /// Failed to initialize Prometheus recorder.
    #[snafu(display("Failed to initialize Prometheus recorder: {source}"))]
    PrometheusInit {
        source: metrics_exporter_prometheus::BuildError,
    },

    /// Metrics address could not be bound.
    #[snafu(display("Failed to bind metrics endpoint on {addr}: {source}"))]
    Bind {
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },
}

// ============ Pipeline Error (top-level) ============

/// Top-level pipeline errors that aggregate all error types.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum PipelineError {
    /// Configuration error.
    #[snafu(display("Configuration error"))]
    Config { source: ConfigError },

    /// Storage backend could not be constructed.
    #[snafu(display("Storage error"))]
    PipelineStorage { source: StorageError },

    /// Provisioning stage failed.
    #[snafu(display("Stage '{}' failed", Stage::Provisioning))]
    Provisioning { source: ProvisionError },

    /// Ingestion stage failed.
    #[snafu(display("Stage '{}' failed", Stage::Ingesting))]
    Ingesting { source: IngestError },

    /// Import stage failed.
    #[snafu(display("Stage '{}' failed", Stage::Importing))]
    Importing { source: ImportError },

    /// Aggregation stage failed.
    #[snafu(display("Stage '{}' failed", Stage::Aggregating))]
    Aggregating { source: JobError },

    /// Verification stage reported failing checks.
    #[snafu(display("Stage '{}' failed: {failed} check(s) failed", Stage::Verifying))]
    Verifying { failed: usize },

    /// Log generator failed.
    #[snafu(display("Generator error"))]
    Generating { source: GenerateError },

    /// Address parsing error.
    #[snafu(display("Failed to parse address"))]
    AddressParse { source: std::net::AddrParseError },

    /// Metrics error.
    #[snafu(display("Metrics error"))]
    Metrics { source: MetricsError },

    /// Writing CLI output failed.
    #[snafu(display("Failed to write output"))]
    Output { source: std::io::Error },

    /// Invalid command-line argument.
    #[snafu(display("Invalid argument: {message}"))]
    InvalidArgument { message: String },
}

impl PipelineError {
    /// The stage whose failure produced this error, if any.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            PipelineError::Provisioning { .. } => Some(Stage::Provisioning),
            PipelineError::Ingesting { .. } => Some(Stage::Ingesting),
            PipelineError::Importing { .. } => Some(Stage::Importing),
            PipelineError::Aggregating { .. } => Some(Stage::Aggregating),
            PipelineError::Verifying { .. } => Some(Stage::Verifying),
            _ => None,
        }
    }
}

/// Render an error and its sources as `outer: inner: root`.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut rendered = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let message = cause.to_string();
        if !rendered.ends_with(&message) {
            rendered.push_str(": ");
            rendered.push_str(&message);
        }
        source = cause.source();
    }
    rendered
}
