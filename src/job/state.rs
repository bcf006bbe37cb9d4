use std::fmt;

use serde::{Deserialize, Serialize};

use super::record::{AudioReference, JobRecord, JobResult, OperationHandle};
use crate::error::{FailureKind, GatewayError};

/// Lifecycle states of a transcription job.
///
/// Each job flows through: ADMITTED → UPLOADING → SUBMITTED → POLLING →
/// one of SUCCEEDED / FAILED / TIMED_OUT. Declaration order is progression
/// order; no state is ever revisited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum JobState {
    Admitted,
    Uploading,
    Submitted,
    Polling,
    Succeeded,
    Failed,
    TimedOut,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed | JobState::TimedOut)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Admitted => write!(f, "ADMITTED"),
            JobState::Uploading => write!(f, "UPLOADING"),
            JobState::Submitted => write!(f, "SUBMITTED"),
            JobState::Polling => write!(f, "POLLING"),
            JobState::Succeeded => write!(f, "SUCCEEDED"),
            JobState::Failed => write!(f, "FAILED"),
            JobState::TimedOut => write!(f, "TIMED_OUT"),
        }
    }
}

/// What a stage hands back to the supervisor.
#[derive(Debug, Clone, PartialEq)]
pub enum StageReport {
    /// Supervisor picked the job up; upload may begin.
    Started,
    /// Upload stage finished.
    Stored(AudioReference),
    /// Recognition stage obtained an operation handle.
    Submitted(OperationHandle),
    /// Poll stage extracted a transcript.
    Transcribed(String),
    /// Any stage failed with a classified error.
    Failed(GatewayError),
    /// The job's wall-clock deadline elapsed.
    DeadlineExceeded,
}

/// The result of applying a stage report to a record.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    /// Advance to the next stage.
    Next(JobState),
    /// Re-run the current stage after backoff.
    Retry { state: JobState, attempt: u32, reason: GatewayError },
    /// The job reached a terminal state.
    Complete(JobState),
    /// Report arrived for a terminal record or out of order; nothing changed.
    Ignored,
}

/// Applies stage reports to a `JobRecord`. The supervisor is the only caller.
pub struct StateMachine;

impl StateMachine {
    /// Compute and apply the transition for `report` given the record's
    /// current state.
    ///
    /// - Success reports advance exactly one stage and only from the state
    ///   that stage runs in.
    /// - A retryable failure retries while fewer than `max_attempts`
    ///   attempts have failed in the current stage; any other failure is
    ///   terminal.
    /// - Terminal records ignore everything, so a late result from a
    ///   timed-out stage is discarded.
    pub fn next(record: &mut JobRecord, report: StageReport, max_attempts: u32) -> Transition {
        if record.state.is_terminal() {
            return Transition::Ignored;
        }

        let transition = match (record.state, report) {
            (_, StageReport::DeadlineExceeded) => {
                record.result = Some(JobResult::Failure {
                    kind: FailureKind::Timeout,
                    detail: format!("deadline exceeded in {}", record.state),
                });
                Transition::Complete(JobState::TimedOut)
            }
            (_, StageReport::Failed(err)) => Self::handle_failure(record, err, max_attempts),
            (JobState::Admitted, StageReport::Started) => Transition::Next(JobState::Uploading),
            (JobState::Uploading, StageReport::Stored(reference)) => {
                record.audio_reference = Some(reference);
                Transition::Next(JobState::Submitted)
            }
            (JobState::Submitted, StageReport::Submitted(handle)) => {
                record.operation_handle = Some(handle);
                Transition::Next(JobState::Polling)
            }
            (JobState::Polling, StageReport::Transcribed(text)) => {
                record.result = Some(JobResult::Transcript(text));
                Transition::Complete(JobState::Succeeded)
            }
            _ => return Transition::Ignored,
        };

        match &transition {
            Transition::Next(next) | Transition::Complete(next) => {
                record.state_history.push(record.state);
                record.state = *next;
                record.attempt_count = 0;
            }
            Transition::Retry { .. } | Transition::Ignored => {}
        }

        transition
    }

    fn handle_failure(record: &mut JobRecord, err: GatewayError, max_attempts: u32) -> Transition {
        record.attempt_count += 1;
        record.total_attempts += 1;
        if err.is_retryable() && record.attempt_count < max_attempts {
            Transition::Retry {
                state: record.state,
                attempt: record.attempt_count,
                reason: err,
            }
        } else {
            record.result = Some(JobResult::Failure {
                kind: err.kind(),
                detail: err.to_string(),
            });
            Transition::Complete(JobState::Failed)
        }
    }
}
