//! Stage bookkeeping for an orchestrator run.

use std::fmt;
use std::time::Duration;

use crate::error::PipelineError;

/// Pipeline stages in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Provisioning,
    Ingesting,
    Importing,
    Aggregating,
    Verifying,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Provisioning,
        Stage::Ingesting,
        Stage::Importing,
        Stage::Aggregating,
        Stage::Verifying,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Provisioning => "provisioning",
            Stage::Ingesting => "ingesting",
            Stage::Importing => "importing",
            Stage::Aggregating => "aggregating",
            Stage::Verifying => "verifying",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Outcome severity, ordered so that `max` picks the worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Status {
    Ok,
    /// Structurally valid but empty.
    Warn,
    /// Missing, unreachable, or failed.
    Fail,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "ok",
            Status::Warn => "warn",
            Status::Fail => "fail",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Whether a failure stops the remaining work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunPolicy {
    /// Abort at the first failing stage (end-to-end runs).
    #[default]
    HaltOnFirstFailure,
    /// Record every failure and keep going (reporting).
    ContinueAndAggregate,
}

/// Orchestrator state machine. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PipelineState {
    Idle,
    Running(Stage),
    Done,
    Aborted,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Done | PipelineState::Aborted)
    }

    /// Next state if `self -> next` is a legal forward transition.
    pub fn advance(self, next: PipelineState) -> Option<PipelineState> {
        let legal = match (self, next) {
            (PipelineState::Idle, PipelineState::Running(_)) => true,
            (PipelineState::Running(a), PipelineState::Running(b)) => b > a,
            (PipelineState::Running(_), PipelineState::Done | PipelineState::Aborted) => true,
            _ => false,
        };
        legal.then_some(next)
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineState::Idle => f.write_str("idle"),
            PipelineState::Running(stage) => write!(f, "{stage}"),
            PipelineState::Done => f.write_str("done"),
            PipelineState::Aborted => f.write_str("aborted"),
        }
    }
}

/// One finished stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageOutcome {
    pub stage: Stage,
    pub status: Status,
    pub detail: String,
    pub duration: Duration,
}

impl fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:<4}] {:<12} {} ({:.1}s)",
            self.status,
            self.stage,
            self.detail,
            self.duration.as_secs_f64()
        )
    }
}

/// Completed orchestrator invocation. Immutable once returned.
#[derive(Debug)]
pub struct PipelineRun {
    policy: RunPolicy,
    state: PipelineState,
    outcomes: Vec<StageOutcome>,
    /// Error of the stage that aborted a halting run.
    failure: Option<PipelineError>,
}

impl PipelineRun {
    pub(crate) fn new(
        policy: RunPolicy,
        state: PipelineState,
        outcomes: Vec<StageOutcome>,
        failure: Option<PipelineError>,
    ) -> Self {
        Self {
            policy,
            state,
            outcomes,
            failure,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn outcomes(&self) -> &[StageOutcome] {
        &self.outcomes
    }

    pub fn failed_stages(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.status == Status::Fail)
            .count()
    }

    /// First failing stage, if any.
    pub fn failed_stage(&self) -> Option<Stage> {
        self.outcomes
            .iter()
            .find(|o| o.status == Status::Fail)
            .map(|o| o.stage)
    }

    /// Worst status across all stages.
    pub fn status(&self) -> Status {
        self.outcomes
            .iter()
            .map(|o| o.status)
            .max()
            .unwrap_or(Status::Ok)
    }

    /// 0/1 for a halting run; the number of failing stages otherwise.
    pub fn exit_status(&self) -> usize {
        match self.policy {
            RunPolicy::HaltOnFirstFailure => usize::from(self.failed_stages() > 0),
            RunPolicy::ContinueAndAggregate => self.failed_stages(),
        }
    }

    /// The error that aborted the run, if it was aborted.
    pub fn into_result(self) -> Result<Vec<StageOutcome>, PipelineError> {
        match self.failure {
            Some(e) => Err(e),
            None => Ok(self.outcomes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(stage: Stage, status: Status) -> StageOutcome {
        StageOutcome {
            stage,
            status,
            detail: String::new(),
            duration: Duration::ZERO,
        }
    }

    #[test]
    fn test_forward_only_transitions() {
        let state = PipelineState::Idle;
        let state = state
            .advance(PipelineState::Running(Stage::Provisioning))
            .unwrap();
        let state = state
            .advance(PipelineState::Running(Stage::Importing))
            .unwrap();
        assert_eq!(
            state.advance(PipelineState::Running(Stage::Provisioning)),
            None
        );
        assert_eq!(state.advance(PipelineState::Running(Stage::Importing)), None);
        let done = state.advance(PipelineState::Done).unwrap();
        assert!(done.is_terminal());
        assert_eq!(done.advance(PipelineState::Running(Stage::Verifying)), None);
        assert_eq!(PipelineState::Idle.advance(PipelineState::Done), None);
    }

    #[test]
    fn test_status_ordering() {
        assert!(Status::Fail > Status::Warn);
        assert!(Status::Warn > Status::Ok);
    }

    #[test]
    fn test_exit_status_by_policy() {
        let outcomes = vec![
            outcome(Stage::Provisioning, Status::Ok),
            outcome(Stage::Importing, Status::Fail),
            outcome(Stage::Aggregating, Status::Fail),
        ];

        let run = PipelineRun::new(
            RunPolicy::ContinueAndAggregate,
            PipelineState::Done,
            outcomes.clone(),
            None,
        );
        assert_eq!(run.exit_status(), 2);
        assert_eq!(run.failed_stage(), Some(Stage::Importing));
        assert_eq!(run.status(), Status::Fail);

        let run = PipelineRun::new(
            RunPolicy::HaltOnFirstFailure,
            PipelineState::Aborted,
            outcomes,
            None,
        );
        assert_eq!(run.exit_status(), 1);
    }

    #[test]
    fn test_outcome_display() {
        let line = StageOutcome {
            stage: Stage::Aggregating,
            status: Status::Warn,
            detail: "no keys".to_string(),
            duration: Duration::from_millis(1500),
        }
        .to_string();
        assert_eq!(line, "[warn] aggregating  no keys (1.5s)");
    }
}
