//! The four pipeline stages: upload, recognition, poll, dispatch.
//!
//! Stages never touch a `JobRecord`'s state. They take what they need, call
//! a gateway, and hand a classified result back to the supervisor.

use tokio::time::{Instant, sleep_until};
use tracing::debug;

use crate::error::GatewayError;
use crate::gateway::{Messenger, ObjectStore, PollStatus, Recognizer};
use crate::job::{
    AudioPayload, AudioReference, JobId, JobRecord, JobResult, JobState, OperationHandle,
    PollSchedule,
};

pub const FAILURE_NOTICE: &str =
    "Sorry, this voice message could not be transcribed. Please try sending it again later.";
pub const TIMEOUT_NOTICE: &str =
    "Sorry, transcribing this voice message took too long. Please try sending it again later.";

/// Object key for a job's audio: `queue/<job_id>/<file name>`.
pub fn object_key(job_id: JobId, file_name: &str) -> String {
    let sanitized: String = file_name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect();
    let name = sanitized.trim_matches('.');
    let name = if name.is_empty() { "audio" } else { name };
    format!("queue/{job_id}/{name}")
}

/// Copy the payload into the object store.
pub async fn upload(
    store: &dyn ObjectStore,
    job_id: JobId,
    payload: &AudioPayload,
    max_bytes: usize,
) -> Result<AudioReference, GatewayError> {
    if payload.is_empty() {
        return Err(GatewayError::Permanent("empty audio payload".into()));
    }
    if payload.len() > max_bytes {
        return Err(GatewayError::Permanent(format!(
            "payload too large: {} bytes (limit {max_bytes})",
            payload.len()
        )));
    }
    store.put(&object_key(job_id, &payload.file_name), payload).await
}

/// Submit stored audio for recognition.
pub async fn recognize(
    recognizer: &dyn Recognizer,
    audio: &AudioReference,
) -> Result<OperationHandle, GatewayError> {
    recognizer.submit(audio).await
}

/// Query the operation until it is done.
///
/// `Pending` is a scheduled continuation, not a failure: the next query is
/// scheduled at a point in time that backs off geometrically up to the cap.
/// Query errors end the stage so the supervisor can decide on a retry.
pub async fn poll(
    recognizer: &dyn Recognizer,
    handle: &OperationHandle,
    schedule: &PollSchedule,
    filter: &TranscriptFilter,
) -> Result<String, GatewayError> {
    let mut pending = 0u32;
    loop {
        match recognizer.poll(handle).await? {
            PollStatus::Pending => {
                let wait = schedule.interval(pending);
                debug!(operation_id = %handle.0, pending, wait_ms = wait.as_millis() as u64, "recognition pending");
                pending = pending.saturating_add(1);
                sleep_until(Instant::now() + wait).await;
            }
            PollStatus::Success(text) => {
                if text.trim().is_empty() {
                    return Err(GatewayError::RemoteJob("empty transcript".into()));
                }
                return Ok(filter.clean(&text));
            }
            PollStatus::Error(detail) => return Err(GatewayError::RemoteJob(detail)),
        }
    }
}

/// User-facing text for a terminal record. Never includes error detail.
pub fn format_message(record: &JobRecord) -> String {
    match (&record.state, &record.result) {
        (JobState::Succeeded, Some(JobResult::Transcript(text))) => text.clone(),
        (JobState::TimedOut, _) => TIMEOUT_NOTICE.to_string(),
        _ => FAILURE_NOTICE.to_string(),
    }
}

/// Deliver the outcome of a terminal record.
pub async fn dispatch(messenger: &dyn Messenger, record: &JobRecord) -> Result<(), GatewayError> {
    messenger.send(&record.chat, &format_message(record)).await
}

/// Drops recorded greetings (e.g. "calls are recorded for quality purposes")
/// from the start of a transcript.
#[derive(Debug, Clone, Default)]
pub struct TranscriptFilter {
    markers: Vec<String>,
}

impl TranscriptFilter {
    /// Shortest remainder worth keeping after a cut.
    const MIN_REMAINDER: usize = 5;

    pub fn new(markers: &[String]) -> Self {
        Self {
            markers: markers
                .iter()
                .map(|m| m.trim().to_lowercase())
                .filter(|m| !m.is_empty())
                .collect(),
        }
    }

    /// Cut everything up to the end of the last occurrence of the first
    /// marker that leaves a meaningful remainder.
    pub fn clean(&self, text: &str) -> String {
        for marker in &self.markers {
            let Some(end) = text
                .char_indices()
                .rev()
                .find_map(|(start, _)| match_lowercase(&text[start..], marker).map(|len| start + len))
            else {
                continue;
            };
            let rest = text[end..].trim_start_matches(|c: char| c.is_whitespace() || c.is_ascii_punctuation());
            let rest = rest.trim();
            if rest.chars().count() > Self::MIN_REMAINDER {
                return rest.to_string();
            }
        }
        text.trim().to_string()
    }
}

/// Byte length of the prefix of `text` whose lowercase form equals
/// `needle`, which must already be lowercase.
fn match_lowercase(text: &str, needle: &str) -> Option<usize> {
    let mut expected = needle.chars().peekable();
    for (offset, c) in text.char_indices() {
        if expected.peek().is_none() {
            return Some(offset);
        }
        for lower in c.to_lowercase() {
            if expected.next() != Some(lower) {
                return None;
            }
        }
    }
    expected.peek().is_none().then_some(text.len())
}
