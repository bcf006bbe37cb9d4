//! Bot configuration loaded from `voxbot.toml`.
//!
//! [`BotConfig`] holds every tunable. Values missing from the file fall back
//! to defaults; secrets and deployment identifiers from the environment take
//! precedence over the file. The configuration is immutable once loaded.

use std::path::Path;
use std::time::Duration;

use anyhow::{Result, bail};
use serde::Deserialize;

use crate::job::{PollSchedule, RetryPolicy};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub telegram: TelegramConfig,
    pub storage: StorageConfig,
    pub speechkit: SpeechKitConfig,
    pub supervisor: SupervisorConfig,
    pub transcript: TranscriptConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub bot_token: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    /// Delete the uploaded object once its job is retired.
    pub cleanup: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://storage.yandexcloud.net".to_string(),
            region: "ru-central1".to_string(),
            bucket: String::new(),
            access_key_id: String::new(),
            secret_access_key: String::new(),
            cleanup: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SpeechKitConfig {
    pub api_key: String,
    pub iam_token: String,
    pub recognize_url: String,
    pub operations_url: String,
    pub language: String,
    pub model: String,
}

impl Default for SpeechKitConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            iam_token: String::new(),
            recognize_url: "https://transcribe.api.cloud.yandex.net/speech/stt/v2/longRunningRecognize"
                .to_string(),
            operations_url: "https://operation.api.cloud.yandex.net/operations".to_string(),
            language: "ru-RU".to_string(),
            model: "general:rc".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Maximum number of jobs in flight at once.
    pub capacity: usize,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub deadline_secs: u64,
    pub poll_initial_ms: u64,
    pub poll_max_ms: u64,
    pub max_payload_bytes: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            capacity: 8,
            max_attempts: 3,
            base_delay_ms: 1000,
            deadline_secs: 300,
            poll_initial_ms: 1000,
            poll_max_ms: 30_000,
            max_payload_bytes: 20 * 1024 * 1024,
        }
    }
}

impl SupervisorConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay_ms: self.base_delay_ms,
        }
    }

    pub fn poll_schedule(&self) -> PollSchedule {
        PollSchedule {
            initial_ms: self.poll_initial_ms,
            max_ms: self.poll_max_ms,
        }
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TranscriptConfig {
    /// Phrases closing a recorded greeting; text up to the last one is dropped.
    pub strip_markers: Vec<String>,
}

impl Default for TranscriptConfig {
    fn default() -> Self {
        Self {
            strip_markers: vec![
                "разговоры записываются".to_string(),
                "целях контроля качества".to_string(),
            ],
        }
    }
}

impl BotConfig {
    /// Load configuration from `path`, using defaults when the file is absent.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<BotConfig>(&contents)?
        } else {
            Self::default()
        };

        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Environment overrides. Empty values are ignored.
    fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let overrides: [(&str, &mut String); 6] = [
            ("TELEGRAM_BOT_TOKEN", &mut self.telegram.bot_token),
            ("YANDEX_API_KEY", &mut self.speechkit.api_key),
            ("YANDEX_IAM_TOKEN", &mut self.speechkit.iam_token),
            ("AWS_ACCESS_KEY_ID", &mut self.storage.access_key_id),
            ("AWS_SECRET_ACCESS_KEY", &mut self.storage.secret_access_key),
            ("BUCKET_NAME", &mut self.storage.bucket),
        ];
        for (key, slot) in overrides {
            if let Some(value) = lookup(key)
                && !value.is_empty()
            {
                *slot = value;
            }
        }
    }

    /// Longest accepted per-job deadline.
    const MAX_DEADLINE_SECS: u64 = 24 * 60 * 60;
    /// Longest accepted retry base delay or poll interval.
    const MAX_INTERVAL_MS: u64 = 60 * 60 * 1000;

    pub fn validate(&self) -> Result<()> {
        let s = &self.supervisor;
        if s.capacity == 0 {
            bail!("supervisor.capacity must be at least 1");
        }
        if s.max_attempts == 0 {
            bail!("supervisor.max_attempts must be at least 1");
        }
        if s.deadline_secs == 0 {
            bail!("supervisor.deadline_secs must be at least 1");
        }
        if s.deadline_secs > Self::MAX_DEADLINE_SECS {
            bail!("supervisor.deadline_secs must be at most {}", Self::MAX_DEADLINE_SECS);
        }
        if s.poll_initial_ms == 0 || s.poll_max_ms < s.poll_initial_ms {
            bail!("supervisor.poll_max_ms must be >= poll_initial_ms > 0");
        }
        if s.poll_max_ms > Self::MAX_INTERVAL_MS {
            bail!("supervisor.poll_max_ms must be at most {}", Self::MAX_INTERVAL_MS);
        }
        if s.base_delay_ms > Self::MAX_INTERVAL_MS {
            bail!("supervisor.base_delay_ms must be at most {}", Self::MAX_INTERVAL_MS);
        }
        Ok(())
    }
}
