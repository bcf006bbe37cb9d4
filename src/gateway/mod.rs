//! Narrow contracts to the services the pipeline depends on.
//!
//! Implementations map every native failure into [`GatewayError`] before
//! returning, so stages only ever see the classified kinds.

pub mod speechkit;
pub mod storage;

use async_trait::async_trait;

use crate::error::GatewayError;
use crate::job::{AudioPayload, AudioReference, ChatRef, OperationHandle};

pub use speechkit::SpeechKitClient;
pub use storage::S3Store;

/// Durable storage for uploaded audio.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Store `payload` under `key` and return a stable reference to it.
    async fn put(&self, key: &str, payload: &AudioPayload) -> Result<AudioReference, GatewayError>;

    async fn delete(&self, reference: &AudioReference) -> Result<(), GatewayError>;
}

/// Outcome of one status query against a recognition operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollStatus {
    Pending,
    Success(String),
    Error(String),
}

/// Asynchronous speech recognition service.
#[async_trait]
pub trait Recognizer: Send + Sync {
    async fn submit(&self, audio: &AudioReference) -> Result<OperationHandle, GatewayError>;

    async fn poll(&self, handle: &OperationHandle) -> Result<PollStatus, GatewayError>;
}

/// Outbound messaging channel back to the user.
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send(&self, chat: &ChatRef, text: &str) -> Result<(), GatewayError>;
}
