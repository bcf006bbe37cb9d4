use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use tracing::{debug, info};

use super::types::{
    AudioEncoding, AudioSource, Operation, RecognitionConfig, RecognizeRequest, Specification,
};
use crate::config::SpeechKitConfig;
use crate::error::{BotError, GatewayError};
use crate::gateway::{PollStatus, Recognizer};
use crate::job::{AudioReference, OperationHandle};

/// Credentials accepted by Yandex Cloud. An API key wins over an IAM token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpeechKitAuth {
    ApiKey(String),
    IamToken(String),
}

impl SpeechKitAuth {
    fn header_value(&self) -> String {
        match self {
            SpeechKitAuth::ApiKey(key) => format!("Api-Key {key}"),
            SpeechKitAuth::IamToken(token) => format!("Bearer {token}"),
        }
    }
}

pub struct SpeechKitClient {
    auth: SpeechKitAuth,
    client: Client,
    recognize_url: String,
    operations_url: String,
    language: String,
    model: String,
}

impl SpeechKitClient {
    pub fn new(config: &SpeechKitConfig) -> Result<Self, BotError> {
        let auth = if !config.api_key.is_empty() {
            SpeechKitAuth::ApiKey(config.api_key.clone())
        } else if !config.iam_token.is_empty() {
            SpeechKitAuth::IamToken(config.iam_token.clone())
        } else {
            return Err(BotError::MissingCredentials(
                "SpeechKit credentials (YANDEX_API_KEY or YANDEX_IAM_TOKEN)",
            ));
        };
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            auth,
            client,
            recognize_url: config.recognize_url.clone(),
            operations_url: config.operations_url.trim_end_matches('/').to_string(),
            language: config.language.clone(),
            model: config.model.clone(),
        })
    }

    fn request(&self, audio: &AudioReference) -> RecognizeRequest {
        RecognizeRequest {
            config: RecognitionConfig {
                specification: Specification {
                    language_code: self.language.clone(),
                    model: self.model.clone(),
                    literature_text: true,
                    profanity_filter: false,
                    audio_encoding: AudioEncoding::from_reference(&audio.0),
                },
            },
            audio: AudioSource {
                uri: audio.0.clone(),
            },
        }
    }

    async fn execute(&self, builder: RequestBuilder) -> Result<Operation, GatewayError> {
        let response: Response = builder
            .header("Authorization", self.auth.header_value())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(GatewayError::from_status(status.as_u16(), &message));
        }

        Ok(response.json::<Operation>().await?)
    }
}

#[async_trait]
impl Recognizer for SpeechKitClient {
    async fn submit(&self, audio: &AudioReference) -> Result<OperationHandle, GatewayError> {
        let body = self.request(audio);
        let operation = self
            .execute(self.client.post(&self.recognize_url).json(&body))
            .await?;
        if operation.id.is_empty() {
            return Err(GatewayError::Permanent("recognition accepted without an operation id".into()));
        }
        info!(operation_id = %operation.id, "recognition operation started");
        Ok(OperationHandle(operation.id))
    }

    async fn poll(&self, handle: &OperationHandle) -> Result<PollStatus, GatewayError> {
        let url = format!("{}/{}", self.operations_url, handle.0);
        let operation = self.execute(self.client.get(url)).await?;

        if !operation.done {
            return Ok(PollStatus::Pending);
        }
        if let Some(error) = operation.error {
            return Ok(PollStatus::Error(format!("code {}: {}", error.code, error.message)));
        }
        let response = operation.response.unwrap_or_default();
        debug!(operation_id = %handle.0, chunks = response.chunks.len(), "recognition finished");
        Ok(PollStatus::Success(response.transcript()))
    }
}
