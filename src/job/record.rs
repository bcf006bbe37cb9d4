use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use uuid::Uuid;

use super::state::JobState;
use crate::error::FailureKind;

/// Opaque job identifier. Random v4, so never reused after retirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s.trim()).ok().map(Self)
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Where the transcript goes. Only the dispatch stage looks at it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatRef(pub String);

impl fmt::Display for ChatRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Stable reference to audio in the object store (an object URL).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioReference(pub String);

/// Identifier of an asynchronous recognition operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationHandle(pub String);

/// Incoming audio as received at the ingress boundary.
#[derive(Debug, Clone)]
pub struct AudioPayload {
    pub bytes: Bytes,
    pub file_name: String,
    pub mime_type: Option<String>,
}

impl AudioPayload {
    pub fn new(bytes: impl Into<Bytes>, file_name: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            file_name: file_name.into(),
            mime_type: None,
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Terminal payload of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobResult {
    Transcript(String),
    Failure { kind: FailureKind, detail: String },
}

/// One voice message travelling through the pipeline.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub job_id: JobId,
    pub chat: ChatRef,
    pub audio_reference: Option<AudioReference>,
    pub operation_handle: Option<OperationHandle>,
    pub state: JobState,
    pub state_history: Vec<JobState>,
    /// Failed attempts in the current stage. Reset on every stage transition.
    pub attempt_count: u32,
    /// Failed attempts across all stages.
    pub total_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub deadline: Instant,
    pub result: Option<JobResult>,
}

impl JobRecord {
    pub fn new(chat: ChatRef, deadline: Instant) -> Self {
        Self {
            job_id: JobId::new(),
            chat,
            audio_reference: None,
            operation_handle: None,
            state: JobState::Admitted,
            state_history: Vec::new(),
            attempt_count: 0,
            total_attempts: 0,
            created_at: Utc::now(),
            deadline,
            result: None,
        }
    }

    pub fn failure_kind(&self) -> Option<FailureKind> {
        match &self.result {
            Some(JobResult::Failure { kind, .. }) => Some(*kind),
            _ => None,
        }
    }
}

/// Structured record emitted when a job is retired.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: JobId,
    pub state: JobState,
    pub state_transitions: Vec<JobState>,
    pub total_attempts: u32,
    pub failure: Option<FailureKind>,
    pub delivered: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: i64,
}

impl JobReport {
    pub fn from_record(record: &JobRecord, delivered: bool) -> Self {
        let now = Utc::now();
        let mut transitions = record.state_history.clone();
        transitions.push(record.state);

        Self {
            job_id: record.job_id,
            state: record.state,
            state_transitions: transitions,
            total_attempts: record.total_attempts,
            failure: record.failure_kind(),
            delivered,
            started_at: record.created_at,
            completed_at: now,
            duration_ms: (now - record.created_at).num_milliseconds(),
        }
    }
}
