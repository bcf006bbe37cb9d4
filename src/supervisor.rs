//! Job supervisor: the single authority over in-flight transcription jobs.
//!
//! The supervisor admits jobs up to a fixed capacity, drives each one
//! through upload → recognition → poll → dispatch on its own task, retries
//! retryable stage failures with exponential backoff, and enforces a
//! wall-clock deadline per job. Every state change goes through
//! [`StateMachine::next`] under the in-flight set's lock.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};
use tokio::time::{Instant, sleep, timeout_at};
use tracing::{Instrument, error, info, info_span, warn};

use crate::config::BotConfig;
use crate::error::{AdmitError, GatewayError};
use crate::gateway::{Messenger, ObjectStore, Recognizer};
use crate::job::{
    AudioPayload, ChatRef, JobId, JobRecord, JobReport, JobState, PollSchedule, RetryPolicy,
    StageReport, StateMachine, Transition,
};
use crate::stages::{self, TranscriptFilter};

/// Tunables fixed at process start.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub capacity: usize,
    pub retry: RetryPolicy,
    pub poll: PollSchedule,
    pub deadline: Duration,
    pub max_payload_bytes: usize,
    pub cleanup_uploads: bool,
    pub filter: TranscriptFilter,
}

impl SupervisorSettings {
    pub fn from_config(config: &BotConfig) -> Self {
        let s = &config.supervisor;
        Self {
            capacity: s.capacity,
            retry: s.retry_policy(),
            poll: s.poll_schedule(),
            deadline: s.deadline(),
            max_payload_bytes: s.max_payload_bytes,
            cleanup_uploads: config.storage.cleanup,
            filter: TranscriptFilter::new(&config.transcript.strip_markers),
        }
    }
}

/// The services a job talks to.
#[derive(Clone)]
pub struct Gateways {
    pub store: Arc<dyn ObjectStore>,
    pub recognizer: Arc<dyn Recognizer>,
    pub messenger: Arc<dyn Messenger>,
}

struct Inner {
    settings: SupervisorSettings,
    gateways: Gateways,
    jobs: Mutex<HashMap<JobId, JobRecord>>,
    reports: Option<mpsc::UnboundedSender<JobReport>>,
}

/// Cheap to clone; all clones share one in-flight set.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(settings: SupervisorSettings, gateways: Gateways) -> Self {
        Self::build(settings, gateways, None)
    }

    /// Like [`Supervisor::new`], also returning a stream of reports for
    /// retired jobs.
    pub fn with_reports(
        settings: SupervisorSettings,
        gateways: Gateways,
    ) -> (Self, mpsc::UnboundedReceiver<JobReport>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::build(settings, gateways, Some(tx)), rx)
    }

    fn build(
        settings: SupervisorSettings,
        gateways: Gateways,
        reports: Option<mpsc::UnboundedSender<JobReport>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                gateways,
                jobs: Mutex::new(HashMap::new()),
                reports,
            }),
        }
    }

    /// Admit a new job and start driving it. Fails without touching the
    /// in-flight set when capacity is reached.
    pub async fn admit(&self, chat: ChatRef, payload: AudioPayload) -> Result<JobId, AdmitError> {
        let capacity = self.inner.settings.capacity;
        let deadline = Instant::now() + self.inner.settings.deadline;

        let job_id = {
            let mut jobs = self.inner.jobs.lock().await;
            if jobs.len() >= capacity {
                warn!(capacity, "job rejected: at capacity");
                return Err(AdmitError::CapacityRejected { capacity });
            }
            let record = JobRecord::new(chat, deadline);
            let job_id = record.job_id;
            jobs.insert(job_id, record);
            job_id
        };

        info!(%job_id, bytes = payload.len(), file = %payload.file_name, "job admitted");
        let span = info_span!("job", %job_id);
        tokio::spawn(self.clone().drive(job_id, payload).instrument(span));
        Ok(job_id)
    }

    /// Current state of an in-flight job; `None` once retired or unknown.
    pub async fn status(&self, job_id: JobId) -> Option<JobState> {
        self.inner.jobs.lock().await.get(&job_id).map(|r| r.state)
    }

    pub async fn in_flight(&self) -> usize {
        self.inner.jobs.lock().await.len()
    }

    async fn drive(self, job_id: JobId, payload: AudioPayload) {
        let Some(deadline) = self.inner.jobs.lock().await.get(&job_id).map(|r| r.deadline) else {
            error!("job vanished before its stages started");
            return;
        };

        // Stages run on their own task so a panicking gateway still ends in
        // a dispatch and a retirement.
        let worker = self.clone();
        let mut stages =
            tokio::spawn(async move { worker.run_stages(job_id, &payload).await }.in_current_span());

        match timeout_at(deadline, &mut stages).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                error!(%err, "stage task died");
                let reason = GatewayError::Permanent(format!("stage task died: {err}"));
                self.apply(job_id, StageReport::Failed(reason)).await;
            }
            Err(_) => {
                stages.abort();
                self.apply(job_id, StageReport::DeadlineExceeded).await;
                warn!(deadline_secs = self.inner.settings.deadline.as_secs(), "job timed out");
            }
        }

        let Some(record) = self.snapshot(job_id).await else {
            error!("job vanished before dispatch");
            return;
        };
        if !record.state.is_terminal() {
            error!(state = %record.state, "stages ended without a terminal state");
        }

        let delivered = match stages::dispatch(&*self.inner.gateways.messenger, &record).await {
            Ok(()) => true,
            Err(err) => {
                error!(%err, chat = %record.chat, "dispatch failed");
                false
            }
        };

        self.retire(job_id, delivered).await;
    }

    async fn run_stages(&self, job_id: JobId, payload: &AudioPayload) {
        if !matches!(
            self.apply(job_id, StageReport::Started).await,
            Transition::Next(_)
        ) {
            return;
        }

        let settings = &self.inner.settings;
        let store: &dyn ObjectStore = &*self.inner.gateways.store;
        let recognizer: &dyn Recognizer = &*self.inner.gateways.recognizer;

        let max_bytes = settings.max_payload_bytes;
        let Some(audio) = self
            .run_stage(
                job_id,
                "upload",
                move || stages::upload(store, job_id, payload, max_bytes),
                StageReport::Stored,
            )
            .await
        else {
            return;
        };

        let audio = &audio;
        let Some(handle) = self
            .run_stage(
                job_id,
                "recognition",
                move || stages::recognize(recognizer, audio),
                StageReport::Submitted,
            )
            .await
        else {
            return;
        };

        let (handle, schedule, filter) = (&handle, &settings.poll, &settings.filter);
        self.run_stage(
            job_id,
            "poll",
            move || stages::poll(recognizer, handle, schedule, filter),
            StageReport::Transcribed,
        )
        .await;
    }

    /// Run one stage to completion, retrying retryable failures as the
    /// state machine allows. Returns the stage output if the job advanced.
    async fn run_stage<T, F, Fut>(
        &self,
        job_id: JobId,
        stage: &'static str,
        mut call: F,
        wrap: fn(T) -> StageReport,
    ) -> Option<T>
    where
        T: Clone,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let policy = &self.inner.settings.retry;
        loop {
            let err = match call().await {
                Ok(value) => {
                    return match self.apply(job_id, wrap(value.clone())).await {
                        Transition::Next(_) | Transition::Complete(JobState::Succeeded) => Some(value),
                        _ => None,
                    };
                }
                Err(err) => err,
            };

            match self.apply(job_id, StageReport::Failed(err)).await {
                Transition::Retry { attempt, reason, .. } => {
                    let delay = policy.delay_for_attempt(attempt);
                    warn!(
                        stage,
                        attempt,
                        max_attempts = policy.max_attempts,
                        %reason,
                        delay_ms = delay.as_millis() as u64,
                        "stage failed, retrying"
                    );
                    sleep(delay).await;
                }
                _ => return None,
            }
        }
    }

    /// Apply a stage report under the in-flight lock.
    async fn apply(&self, job_id: JobId, report: StageReport) -> Transition {
        let mut jobs = self.inner.jobs.lock().await;
        let Some(record) = jobs.get_mut(&job_id) else {
            return Transition::Ignored;
        };
        // An aborted stage task may still report once after the deadline.
        let report = if Instant::now() >= record.deadline {
            StageReport::DeadlineExceeded
        } else {
            report
        };
        let from = record.state;
        let transition = StateMachine::next(record, report, self.inner.settings.retry.max_attempts);
        if record.state != from {
            info!(from = %from, to = %record.state, "state transition");
        }
        if let Some(kind) = record.failure_kind().filter(|_| record.state != from) {
            warn!(failure = %kind, "job failed");
        }
        transition
    }

    async fn snapshot(&self, job_id: JobId) -> Option<JobRecord> {
        self.inner.jobs.lock().await.get(&job_id).cloned()
    }

    /// Remove a dispatched job from the in-flight set, clean up its stored
    /// audio and publish its report.
    async fn retire(&self, job_id: JobId, delivered: bool) {
        let Some(record) = self.inner.jobs.lock().await.remove(&job_id) else {
            return;
        };

        let report = JobReport::from_record(&record, delivered);
        info!(
            state = %report.state,
            duration_ms = report.duration_ms,
            report = %serde_json::to_string(&report).unwrap_or_default(),
            "job retired"
        );

        if self.inner.settings.cleanup_uploads
            && let Some(reference) = &record.audio_reference
        {
            match self.inner.gateways.store.delete(reference).await {
                Ok(()) => info!(reference = %reference.0, "stored audio removed"),
                Err(err) => warn!(%err, reference = %reference.0, "failed to remove stored audio"),
            }
        }

        // Published last so a receiver that exits on the report doesn't cut
        // the cleanup short.
        if let Some(tx) = &self.inner.reports {
            let _ = tx.send(report);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::gateway::PollStatus;
    use crate::job::{AudioReference, OperationHandle};
    use crate::stages::{FAILURE_NOTICE, TIMEOUT_NOTICE};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;

    // --- Mock gateways ---

    #[derive(Default)]
    struct MockStore {
        puts: StdMutex<VecDeque<Result<(), GatewayError>>>,
        put_calls: StdMutex<Vec<Instant>>,
        deleted: StdMutex<Vec<AudioReference>>,
    }

    impl MockStore {
        fn scripted(puts: Vec<Result<(), GatewayError>>) -> Self {
            Self {
                puts: StdMutex::new(puts.into()),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl ObjectStore for MockStore {
        async fn put(&self, key: &str, _payload: &AudioPayload) -> Result<AudioReference, GatewayError> {
            self.put_calls.lock().unwrap().push(Instant::now());
            self.puts.lock().unwrap().pop_front().unwrap_or(Ok(()))?;
            Ok(AudioReference(format!("https://storage.test/voice/{key}")))
        }

        async fn delete(&self, reference: &AudioReference) -> Result<(), GatewayError> {
            self.deleted.lock().unwrap().push(reference.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockRecognizer {
        submit_delay: Option<Duration>,
        panic_on_submit: bool,
        submits: StdMutex<VecDeque<Result<OperationHandle, GatewayError>>>,
        polls: StdMutex<VecDeque<Result<PollStatus, GatewayError>>>,
        poll_calls: StdMutex<u32>,
    }

    impl MockRecognizer {
        fn scripted(polls: Vec<Result<PollStatus, GatewayError>>) -> Self {
            Self {
                polls: StdMutex::new(polls.into()),
                ..Default::default()
            }
        }

        fn pending_forever() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl Recognizer for MockRecognizer {
        async fn submit(&self, _audio: &AudioReference) -> Result<OperationHandle, GatewayError> {
            if self.panic_on_submit {
                panic!("recognizer bug");
            }
            if let Some(delay) = self.submit_delay {
                sleep(delay).await;
            }
            self.submits
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(OperationHandle("H1".into())))
        }

        async fn poll(&self, handle: &OperationHandle) -> Result<PollStatus, GatewayError> {
            assert_eq!(handle.0, "H1");
            *self.poll_calls.lock().unwrap() += 1;
            self.polls
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(PollStatus::Pending))
        }
    }

    #[derive(Default)]
    struct RecordingMessenger {
        fail: bool,
        sent: StdMutex<Vec<(ChatRef, String, Instant)>>,
    }

    impl RecordingMessenger {
        fn sends_to(&self, chat: &ChatRef) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(c, _, _)| c == chat)
                .map(|(_, text, _)| text.clone())
                .collect()
        }
    }

    #[async_trait]
    impl Messenger for RecordingMessenger {
        async fn send(&self, chat: &ChatRef, text: &str) -> Result<(), GatewayError> {
            self.sent
                .lock()
                .unwrap()
                .push((chat.clone(), text.to_string(), Instant::now()));
            if self.fail {
                return Err(GatewayError::Transient("telegram unreachable".into()));
            }
            Ok(())
        }
    }

    // --- Harness ---

    fn settings(capacity: usize) -> SupervisorSettings {
        SupervisorSettings {
            capacity,
            retry: RetryPolicy::default(),
            poll: PollSchedule::default(),
            deadline: Duration::from_secs(300),
            max_payload_bytes: 20 * 1024 * 1024,
            cleanup_uploads: true,
            filter: TranscriptFilter::default(),
        }
    }

    struct Harness {
        supervisor: Supervisor,
        reports: mpsc::UnboundedReceiver<JobReport>,
        store: Arc<MockStore>,
        recognizer: Arc<MockRecognizer>,
        messenger: Arc<RecordingMessenger>,
    }

    fn harness(
        settings: SupervisorSettings,
        store: MockStore,
        recognizer: MockRecognizer,
        messenger: RecordingMessenger,
    ) -> Harness {
        let store = Arc::new(store);
        let recognizer = Arc::new(recognizer);
        let messenger = Arc::new(messenger);
        let gateways = Gateways {
            store: store.clone(),
            recognizer: recognizer.clone(),
            messenger: messenger.clone(),
        };
        let (supervisor, reports) = Supervisor::with_reports(settings, gateways);
        Harness {
            supervisor,
            reports,
            store,
            recognizer,
            messenger,
        }
    }

    fn voice(bytes: usize) -> AudioPayload {
        AudioPayload::new(vec![7u8; bytes], "voice.ogg").with_mime_type("audio/ogg")
    }

    fn chat(id: &str) -> ChatRef {
        ChatRef(id.to_string())
    }

    // --- Scenarios ---

    #[tokio::test(start_paused = true)]
    async fn pending_twice_then_success_delivers_transcript() {
        let mut h = harness(
            settings(4),
            MockStore::default(),
            MockRecognizer::scripted(vec![
                Ok(PollStatus::Pending),
                Ok(PollStatus::Pending),
                Ok(PollStatus::Success("hello world".into())),
            ]),
            RecordingMessenger::default(),
        );

        let job_id = h.supervisor.admit(chat("100"), voice(10 * 1024)).await.unwrap();
        let report = h.reports.recv().await.unwrap();

        assert_eq!(report.job_id, job_id);
        assert_eq!(report.state, JobState::Succeeded);
        assert_eq!(
            report.state_transitions,
            vec![
                JobState::Admitted,
                JobState::Uploading,
                JobState::Submitted,
                JobState::Polling,
                JobState::Succeeded
            ]
        );
        assert!(report.delivered);
        assert_eq!(h.messenger.sends_to(&chat("100")), vec!["hello world".to_string()]);
        assert_eq!(*h.recognizer.poll_calls.lock().unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_upload_error_fails_in_one_attempt() {
        let mut h = harness(
            settings(4),
            MockStore::scripted(vec![Err(GatewayError::Permanent("unsupported codec".into()))]),
            MockRecognizer::pending_forever(),
            RecordingMessenger::default(),
        );

        h.supervisor.admit(chat("100"), voice(1024)).await.unwrap();
        let report = h.reports.recv().await.unwrap();

        assert_eq!(report.state, JobState::Failed);
        assert_eq!(report.failure, Some(FailureKind::Permanent));
        assert_eq!(report.total_attempts, 1);
        assert_eq!(h.store.put_calls.lock().unwrap().len(), 1);
        assert_eq!(h.messenger.sends_to(&chat("100")), vec![FAILURE_NOTICE.to_string()]);
        assert_eq!(*h.recognizer.poll_calls.lock().unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_below_limit_eventually_succeed() {
        let throttled = || Err(GatewayError::Transient("SlowDown".into()));
        let mut h = harness(
            settings(4),
            MockStore::scripted(vec![throttled(), throttled()]),
            MockRecognizer::scripted(vec![Ok(PollStatus::Success("recovered".into()))]),
            RecordingMessenger::default(),
        );

        h.supervisor.admit(chat("100"), voice(1024)).await.unwrap();
        let report = h.reports.recv().await.unwrap();

        assert_eq!(report.state, JobState::Succeeded);
        assert_eq!(report.total_attempts, 2);
        assert_eq!(h.messenger.sends_to(&chat("100")), vec!["recovered".to_string()]);

        // Exponential backoff between attempts: 1s then 2s.
        let calls = h.store.put_calls.lock().unwrap();
        let gaps: Vec<u64> = calls.windows(2).map(|w| (w[1] - w[0]).as_secs()).collect();
        assert_eq!(gaps, vec![1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_beyond_limit_fail_with_generic_notice() {
        let throttled = || Err(GatewayError::Transient("SlowDown: bucket voice-internal".into()));
        let mut h = harness(
            settings(4),
            MockStore::scripted(vec![throttled(), throttled(), throttled(), Ok(())]),
            MockRecognizer::pending_forever(),
            RecordingMessenger::default(),
        );

        h.supervisor.admit(chat("100"), voice(1024)).await.unwrap();
        let report = h.reports.recv().await.unwrap();

        assert_eq!(report.state, JobState::Failed);
        assert_eq!(report.failure, Some(FailureKind::Transient));
        assert_eq!(h.store.put_calls.lock().unwrap().len(), 3);
        let sent = h.messenger.sends_to(&chat("100"));
        assert_eq!(sent, vec![FAILURE_NOTICE.to_string()]);
        assert!(!sent[0].contains("SlowDown"));
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_submit_errors_use_their_own_attempt_budget() {
        let recognizer = MockRecognizer {
            submits: StdMutex::new(
                vec![
                    Err(GatewayError::Transient("quota".into())),
                    Err(GatewayError::Transient("quota".into())),
                    Ok(OperationHandle("H1".into())),
                ]
                .into(),
            ),
            polls: StdMutex::new(vec![Ok(PollStatus::Success("ok then".into()))].into()),
            ..Default::default()
        };
        let mut h = harness(
            settings(4),
            MockStore::scripted(vec![Err(GatewayError::Transient("blip".into()))]),
            recognizer,
            RecordingMessenger::default(),
        );

        h.supervisor.admit(chat("100"), voice(1024)).await.unwrap();
        let report = h.reports.recv().await.unwrap();
        assert_eq!(report.state, JobState::Succeeded);
        assert_eq!(report.total_attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_job_error_fails_without_retry() {
        let mut h = harness(
            settings(4),
            MockStore::default(),
            MockRecognizer::scripted(vec![Ok(PollStatus::Error("code 3: invalid audio".into()))]),
            RecordingMessenger::default(),
        );

        h.supervisor.admit(chat("100"), voice(1024)).await.unwrap();
        let report = h.reports.recv().await.unwrap();

        assert_eq!(report.state, JobState::Failed);
        assert_eq!(report.failure, Some(FailureKind::RemoteJob));
        assert_eq!(*h.recognizer.poll_calls.lock().unwrap(), 1);
        assert_eq!(h.messenger.sends_to(&chat("100")), vec![FAILURE_NOTICE.to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn pending_forever_times_out_exactly_at_deadline() {
        let mut h = harness(
            settings(4),
            MockStore::default(),
            MockRecognizer::pending_forever(),
            RecordingMessenger::default(),
        );

        let admitted_at = Instant::now();
        h.supervisor.admit(chat("100"), voice(1024)).await.unwrap();
        let report = h.reports.recv().await.unwrap();

        assert_eq!(report.state, JobState::TimedOut);
        assert_eq!(report.failure, Some(FailureKind::Timeout));
        assert_eq!(
            report.state_transitions.last().copied(),
            Some(JobState::TimedOut)
        );

        let sent = h.messenger.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, TIMEOUT_NOTICE);
        let elapsed = sent[0].2 - admitted_at;
        assert!(elapsed >= Duration::from_secs(300), "dispatched early: {elapsed:?}");
        assert!(elapsed < Duration::from_secs(301), "dispatched late: {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn slow_stage_result_is_discarded_after_timeout() {
        let recognizer = MockRecognizer {
            submit_delay: Some(Duration::from_secs(600)),
            ..Default::default()
        };
        let mut h = harness(settings(4), MockStore::default(), recognizer, RecordingMessenger::default());

        let job_id = h.supervisor.admit(chat("100"), voice(1024)).await.unwrap();
        let report = h.reports.recv().await.unwrap();
        assert_eq!(report.state, JobState::TimedOut);

        // Long after the stalled call would have returned, nothing else happens.
        sleep(Duration::from_secs(900)).await;
        assert_eq!(h.messenger.sent.lock().unwrap().len(), 1);
        assert_eq!(*h.recognizer.poll_calls.lock().unwrap(), 0);
        assert_eq!(h.supervisor.status(job_id).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn admission_beyond_capacity_is_rejected_without_mutation() {
        let h = harness(
            settings(1),
            MockStore::default(),
            MockRecognizer::pending_forever(),
            RecordingMessenger::default(),
        );

        let first = h.supervisor.admit(chat("1"), voice(1024)).await.unwrap();
        assert_eq!(h.supervisor.in_flight().await, 1);

        let err = h.supervisor.admit(chat("2"), voice(1024)).await.unwrap_err();
        assert_eq!(err, AdmitError::CapacityRejected { capacity: 1 });
        assert_eq!(h.supervisor.in_flight().await, 1);
        assert!(h.supervisor.status(first).await.is_some());
        assert!(h.messenger.sends_to(&chat("2")).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_frees_after_retirement() {
        let mut h = harness(
            settings(1),
            MockStore::default(),
            MockRecognizer::scripted(vec![Ok(PollStatus::Success("one".into()))]),
            RecordingMessenger::default(),
        );

        h.supervisor.admit(chat("1"), voice(1024)).await.unwrap();
        h.reports.recv().await.unwrap();
        assert_eq!(h.supervisor.in_flight().await, 0);
        assert!(h.supervisor.admit(chat("2"), voice(1024)).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn every_job_gets_exactly_one_dispatch() {
        let polls = (0..6)
            .map(|i| {
                if i % 2 == 0 {
                    Ok(PollStatus::Success(format!("text {i}")))
                } else {
                    Ok(PollStatus::Error("bad".into()))
                }
            })
            .collect();
        let store = MockStore::scripted(vec![
            Ok(()),
            Err(GatewayError::Permanent("unsupported codec".into())),
            Err(GatewayError::Transient("blip".into())),
        ]);
        let mut h = harness(
            settings(16),
            store,
            MockRecognizer::scripted(polls),
            RecordingMessenger::default(),
        );

        let mut chats = HashMap::new();
        for i in 0..10 {
            let chat_ref = chat(&format!("chat-{i}"));
            let job_id = h.supervisor.admit(chat_ref.clone(), voice(512)).await.unwrap();
            chats.insert(job_id, chat_ref);
        }

        let mut seen = HashMap::new();
        for _ in 0..10 {
            let report = h.reports.recv().await.unwrap();
            assert!(report.state.is_terminal());
            *seen.entry(report.job_id).or_insert(0) += 1;
        }
        assert_eq!(seen.len(), 10);
        assert!(seen.values().all(|&n| n == 1));

        sleep(Duration::from_secs(600)).await;
        for (job_id, chat_ref) in &chats {
            assert_eq!(h.messenger.sends_to(chat_ref).len(), 1, "job {job_id}");
        }
        assert_eq!(h.supervisor.in_flight().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dispatch_failure_still_retires_job() {
        let messenger = RecordingMessenger {
            fail: true,
            ..Default::default()
        };
        let mut h = harness(
            settings(4),
            MockStore::default(),
            MockRecognizer::scripted(vec![Ok(PollStatus::Success("lost".into()))]),
            messenger,
        );

        let job_id = h.supervisor.admit(chat("100"), voice(1024)).await.unwrap();
        let report = h.reports.recv().await.unwrap();

        assert_eq!(report.state, JobState::Succeeded);
        assert!(!report.delivered);
        assert_eq!(h.messenger.sent.lock().unwrap().len(), 1);
        assert_eq!(h.supervisor.status(job_id).await, None);
        assert_eq!(h.supervisor.in_flight().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stored_audio_is_cleaned_up_after_retirement() {
        let mut h = harness(
            settings(4),
            MockStore::default(),
            MockRecognizer::scripted(vec![Ok(PollStatus::Success("done".into()))]),
            RecordingMessenger::default(),
        );

        let job_id = h.supervisor.admit(chat("100"), voice(1024)).await.unwrap();
        h.reports.recv().await.unwrap();
        sleep(Duration::from_millis(10)).await;

        let deleted = h.store.deleted.lock().unwrap();
        assert_eq!(
            *deleted,
            vec![AudioReference(format!("https://storage.test/voice/queue/{job_id}/voice.ogg"))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_can_be_disabled() {
        let mut cfg = settings(4);
        cfg.cleanup_uploads = false;
        let mut h = harness(
            cfg,
            MockStore::default(),
            MockRecognizer::scripted(vec![Ok(PollStatus::Success("done".into()))]),
            RecordingMessenger::default(),
        );

        h.supervisor.admit(chat("100"), voice(1024)).await.unwrap();
        h.reports.recv().await.unwrap();
        sleep(Duration::from_millis(10)).await;
        assert!(h.store.deleted.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn status_tracks_progress_until_retired() {
        let mut h = harness(
            settings(4),
            MockStore::default(),
            MockRecognizer::scripted(vec![
                Ok(PollStatus::Pending),
                Ok(PollStatus::Success("later".into())),
            ]),
            RecordingMessenger::default(),
        );

        let job_id = h.supervisor.admit(chat("100"), voice(1024)).await.unwrap();
        assert!(h.supervisor.status(job_id).await.is_some());

        // First poll answers Pending; the next query is a second away.
        sleep(Duration::from_millis(500)).await;
        assert_eq!(h.supervisor.status(job_id).await, Some(JobState::Polling));

        h.reports.recv().await.unwrap();
        assert_eq!(h.supervisor.status(job_id).await, None);
        assert_eq!(h.supervisor.status(JobId::new()).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_payload_is_a_permanent_failure() {
        let mut cfg = settings(4);
        cfg.max_payload_bytes = 100;
        let mut h = harness(
            cfg,
            MockStore::default(),
            MockRecognizer::pending_forever(),
            RecordingMessenger::default(),
        );

        h.supervisor.admit(chat("100"), voice(101)).await.unwrap();
        let report = h.reports.recv().await.unwrap();
        assert_eq!(report.failure, Some(FailureKind::Permanent));
        assert!(h.store.put_calls.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_gateway_still_dispatches_and_retires() {
        let recognizer = MockRecognizer {
            panic_on_submit: true,
            ..Default::default()
        };
        let mut h = harness(settings(1), MockStore::default(), recognizer, RecordingMessenger::default());

        let job_id = h.supervisor.admit(chat("100"), voice(1024)).await.unwrap();
        let report = h.reports.recv().await.unwrap();

        assert_eq!(report.state, JobState::Failed);
        assert_eq!(report.failure, Some(FailureKind::Permanent));
        assert_eq!(h.messenger.sends_to(&chat("100")), vec![FAILURE_NOTICE.to_string()]);
        assert_eq!(h.supervisor.status(job_id).await, None);
        assert_eq!(h.supervisor.in_flight().await, 0);

        // The slot is free again.
        h.supervisor.admit(chat("101"), voice(1024)).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn reports_after_the_deadline_become_timeouts() {
        let h = harness(
            settings(4),
            MockStore::default(),
            MockRecognizer::pending_forever(),
            RecordingMessenger::default(),
        );
        let mut record = JobRecord::new(chat("100"), Instant::now() + Duration::from_secs(5));
        record.state = JobState::Polling;
        let job_id = record.job_id;
        h.supervisor.inner.jobs.lock().await.insert(job_id, record);

        sleep(Duration::from_secs(5)).await;
        let transition = h
            .supervisor
            .apply(job_id, StageReport::Transcribed("too late".into()))
            .await;
        assert!(matches!(transition, Transition::Complete(JobState::TimedOut)));
        assert_eq!(h.supervisor.status(job_id).await, Some(JobState::TimedOut));
    }
}
