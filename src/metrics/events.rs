//! Internal events for metrics emission.
//!
//! Each event struct represents a measurable occurrence in the pipeline.
//! Events implement the `InternalEvent` trait which emits the corresponding
//! Prometheus metric.

use metrics::{counter, histogram};
use std::time::Duration;
use tracing::trace;

use crate::pipeline::{Stage, Status};

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

// ============================================================================
// Collaborator command events
// ============================================================================

/// Event emitted when an external command finishes.
pub struct CommandExecuted {
    pub program: String,
    pub success: bool,
    pub duration: Duration,
}

impl InternalEvent for CommandExecuted {
    fn emit(self) {
        let status = if self.success { "success" } else { "error" };
        trace!(
            program = %self.program,
            status,
            duration_ms = self.duration.as_millis(),
            "Command executed"
        );
        counter!("avalanche_commands_total", "program" => self.program.clone(), "status" => status)
            .increment(1);
        histogram!("avalanche_command_duration_seconds", "program" => self.program)
            .record(self.duration.as_secs_f64());
    }
}

/// Storage operation types.
#[derive(Debug, Clone, Copy)]
pub enum StorageOperation {
    Mkdir,
    List,
    Test,
    Chmod,
    Delete,
    Read,
    Write,
}

impl StorageOperation {
    fn as_str(&self) -> &'static str {
        match self {
            StorageOperation::Mkdir => "mkdir",
            StorageOperation::List => "list",
            StorageOperation::Test => "test",
            StorageOperation::Chmod => "chmod",
            StorageOperation::Delete => "delete",
            StorageOperation::Read => "read",
            StorageOperation::Write => "write",
        }
    }
}

/// Request status for storage operations.
#[derive(Debug, Clone, Copy)]
pub enum RequestStatus {
    Success,
    Error,
}

impl RequestStatus {
    fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Success => "success",
            RequestStatus::Error => "error",
        }
    }
}

/// Event emitted for each storage request.
pub struct StorageRequest {
    pub operation: StorageOperation,
    pub status: RequestStatus,
}

impl InternalEvent for StorageRequest {
    fn emit(self) {
        trace!(
            operation = self.operation.as_str(),
            status = self.status.as_str(),
            "Storage request"
        );
        counter!(
            "avalanche_storage_requests_total",
            "operation" => self.operation.as_str(),
            "status" => self.status.as_str()
        )
        .increment(1);
    }
}

// ============================================================================
// Readiness events
// ============================================================================

/// Event emitted for every readiness probe attempt.
pub struct ProbeAttempt {
    pub target: String,
    pub success: bool,
}

impl InternalEvent for ProbeAttempt {
    fn emit(self) {
        let status = if self.success { "success" } else { "error" };
        trace!(target = %self.target, status, "Probe attempt");
        counter!("avalanche_probe_attempts_total", "target" => self.target, "status" => status)
            .increment(1);
    }
}

// ============================================================================
// Stage events
// ============================================================================

/// Event emitted when an orchestrator stage finishes.
pub struct StageCompleted {
    pub stage: Stage,
    pub status: Status,
    pub duration: Duration,
}

impl InternalEvent for StageCompleted {
    fn emit(self) {
        trace!(
            stage = self.stage.as_str(),
            status = self.status.as_str(),
            "Stage completed"
        );
        counter!(
            "avalanche_stages_total",
            "stage" => self.stage.as_str(),
            "status" => self.status.as_str()
        )
        .increment(1);
        histogram!("avalanche_stage_duration_seconds", "stage" => self.stage.as_str())
            .record(self.duration.as_secs_f64());
    }
}

/// Event emitted when a bulk import finishes.
pub struct ImportCompleted {
    pub dataset: String,
    pub rows: u64,
    pub partitions: usize,
}

impl InternalEvent for ImportCompleted {
    fn emit(self) {
        trace!(
            dataset = %self.dataset,
            rows = self.rows,
            partitions = self.partitions,
            "Import completed"
        );
        counter!("avalanche_import_rows_total", "dataset" => self.dataset).increment(self.rows);
    }
}

/// Event emitted with the number of records that produced a key.
pub struct RecordsAggregated {
    pub count: u64,
}

impl InternalEvent for RecordsAggregated {
    fn emit(self) {
        trace!(count = self.count, "Records aggregated");
        counter!("avalanche_records_aggregated_total").increment(self.count);
    }
}

/// Event emitted with the number of records skipped as malformed.
pub struct RecordsSkipped {
    pub count: u64,
}

impl InternalEvent for RecordsSkipped {
    fn emit(self) {
        trace!(count = self.count, "Records skipped");
        counter!("avalanche_records_skipped_total").increment(self.count);
    }
}

/// Event emitted when a verification check finishes.
pub struct CheckCompleted {
    pub check: String,
    pub status: Status,
}

impl InternalEvent for CheckCompleted {
    fn emit(self) {
        trace!(check = %self.check, status = self.status.as_str(), "Check completed");
        counter!(
            "avalanche_checks_total",
            "check" => self.check,
            "status" => self.status.as_str()
        )
        .increment(1);
    }
}

/// Event emitted when the generator writes records.
pub struct RecordsGenerated {
    pub count: u64,
}

impl InternalEvent for RecordsGenerated {
    fn emit(self) {
        trace!(count = self.count, "Records generated");
        counter!("avalanche_records_generated_total").increment(self.count);
    }
}
