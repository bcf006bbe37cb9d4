use thiserror::Error;

#[derive(Debug, Error)]
pub enum BotError {
    #[error("Missing credentials: {0}")]
    MissingCredentials(&'static str),

    #[error("Telegram error: {0}")]
    Telegram(#[from] teloxide::RequestError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// The only error shape pipeline stages ever see.
///
/// Each gateway client maps its native failures (transport errors, HTTP
/// statuses, provider error objects) into one of these at its own boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// Network blip, throttling, quota exhaustion, 5xx. Worth retrying.
    #[error("transient: {0}")]
    Transient(String),

    /// Bad input, malformed request, unsupported payload. Retrying won't help.
    #[error("permanent: {0}")]
    Permanent(String),

    /// The remote recognition job itself reported failure.
    #[error("remote job failed: {0}")]
    RemoteJob(String),
}

impl GatewayError {
    /// Classify a non-success HTTP status.
    pub fn from_status(status: u16, body: &str) -> Self {
        let detail = format!("status {status}: {body}");
        match status {
            408 | 429 | 500..=599 => GatewayError::Transient(detail),
            _ => GatewayError::Permanent(detail),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, GatewayError::Transient(_))
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            GatewayError::Transient(_) => FailureKind::Transient,
            GatewayError::Permanent(_) => FailureKind::Permanent,
            GatewayError::RemoteJob(_) => FailureKind::RemoteJob,
        }
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            GatewayError::Permanent(format!("undecodable response: {err}"))
        } else {
            GatewayError::Transient(format!("network error: {err}"))
        }
    }
}

/// Job-level failure classification stored in a terminal record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum FailureKind {
    /// Retries exhausted on a network/throttling error.
    Transient,
    /// Bad input or format, surfaced on the first attempt.
    Permanent,
    /// Recognition service reported failure for the submitted audio.
    RemoteJob,
    /// Per-job deadline elapsed before a terminal outcome.
    Timeout,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Transient => write!(f, "Transient"),
            FailureKind::Permanent => write!(f, "Permanent"),
            FailureKind::RemoteJob => write!(f, "RemoteJob"),
            FailureKind::Timeout => write!(f, "Timeout"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmitError {
    #[error("capacity reached ({capacity} jobs in flight)")]
    CapacityRejected { capacity: usize },
}
