//! Wire types for SpeechKit long-running recognition (`stt/v2`) and the
//! Yandex Cloud operations API.

use serde::{Deserialize, Serialize};

/// Body of `POST /speech/stt/v2/longRunningRecognize`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognizeRequest {
    pub config: RecognitionConfig,
    pub audio: AudioSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognitionConfig {
    pub specification: Specification,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Specification {
    pub language_code: String,
    pub model: String,
    /// Punctuation and normalization.
    #[serde(rename = "literature_text")]
    pub literature_text: bool,
    #[serde(rename = "profanity_filter")]
    pub profanity_filter: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_encoding: Option<AudioEncoding>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AudioEncoding {
    OggOpus,
    Mp3,
}

impl AudioEncoding {
    /// Infer encoding from an object reference's extension. `None` lets the
    /// service auto-detect.
    pub fn from_reference(reference: &str) -> Option<Self> {
        let lower = reference.to_lowercase();
        if lower.ends_with(".mp3") {
            Some(AudioEncoding::Mp3)
        } else if lower.ends_with(".ogg") || lower.ends_with(".oga") || lower.ends_with(".opus") {
            Some(AudioEncoding::OggOpus)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioSource {
    pub uri: String,
}

/// Long-running operation as returned by both endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub response: Option<RecognitionResponse>,
    #[serde(default)]
    pub error: Option<OperationError>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecognitionResponse {
    #[serde(default)]
    pub chunks: Vec<Chunk>,
}

impl RecognitionResponse {
    /// First alternative of every chunk, joined by single spaces.
    pub fn transcript(&self) -> String {
        self.chunks
            .iter()
            .filter_map(|chunk| chunk.alternatives.first())
            .map(|alt| alt.text.trim())
            .filter(|text| !text.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    #[serde(default)]
    pub alternatives: Vec<Alternative>,
    #[serde(default)]
    pub channel_tag: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alternative {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub confidence: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationError {
    #[serde(default)]
    pub code: i32,
    #[serde(default)]
    pub message: String,
}
