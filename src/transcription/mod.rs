//! Speech-to-text engines
//!
//! An engine takes mono samples at a fixed rate and returns text, a language
//! tag and a confidence. Engines are tried in priority order; the first one
//! that reports itself available is used.

mod openai;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use openai::{is_api_key_configured, OpenAiTranscriber};

/// Errors that can occur during transcription
#[derive(Debug)]
pub enum TranscriptionError {
    /// No configured engine can run on this machine
    EngineUnavailable(String),
    /// OpenAI API key not configured
    MissingApiKey,
    /// Failed to encode the audio for upload
    EncodeError(String),
    /// Network/HTTP error
    NetworkError(String),
    /// Engine API returned an error
    ApiError { status: u16, message: String },
    /// Failed to parse the engine response
    ParseError(String),
}

impl std::fmt::Display for TranscriptionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TranscriptionError::EngineUnavailable(e) => {
                write!(f, "No transcription engine available: {}", e)
            }
            TranscriptionError::MissingApiKey => {
                write!(
                    f,
                    "OpenAI API key not configured. Set OPENAI_API_KEY environment variable."
                )
            }
            TranscriptionError::EncodeError(e) => write!(f, "Failed to encode audio: {}", e),
            TranscriptionError::NetworkError(e) => write!(f, "Network error: {}", e),
            TranscriptionError::ApiError { status, message } => {
                write!(f, "Transcription API error ({}): {}", status, message)
            }
            TranscriptionError::ParseError(e) => write!(f, "Failed to parse API response: {}", e),
        }
    }
}

impl std::error::Error for TranscriptionError {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionResult {
    pub text: String,
    /// Language tag, e.g. "en"
    pub language: String,
    /// Engine confidence in [0, 1], if the engine reports one
    pub confidence: Option<f32>,
}

impl TranscriptionResult {
    pub fn new(text: impl Into<String>, language: impl Into<String>, confidence: Option<f32>) -> Self {
        Self {
            text: text.into(),
            language: language.into(),
            confidence,
        }
    }
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(
        &self,
        samples: &[f32],
        sample_rate: u32,
    ) -> Result<TranscriptionResult, TranscriptionError>;

    /// Whether the engine can run right now (credentials, model files).
    fn is_available(&self) -> bool {
        true
    }

    fn name(&self) -> &str;
}

/// Engines in priority order.
#[derive(Clone, Default)]
pub struct TranscriberSet {
    engines: Vec<Arc<dyn Transcriber>>,
}

impl TranscriberSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, engine: Arc<dyn Transcriber>) -> Self {
        self.engines.push(engine);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.engines.iter().map(|e| e.name().to_string()).collect()
    }

    /// First available engine.
    pub fn select(&self) -> Result<Arc<dyn Transcriber>, TranscriptionError> {
        for (i, engine) in self.engines.iter().enumerate() {
            if engine.is_available() {
                if i > 0 {
                    log::warn!("Falling back to transcription engine {}", engine.name());
                }
                return Ok(engine.clone());
            }
            log::debug!("Transcription engine {} unavailable", engine.name());
        }
        Err(TranscriptionError::EngineUnavailable(if self.engines.is_empty() {
            "none configured".to_string()
        } else {
            format!("tried {}", self.names().join(", "))
        }))
    }
}

impl std::fmt::Debug for TranscriberSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranscriberSet")
            .field("engines", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed {
        name: &'static str,
        available: bool,
    }

    #[async_trait]
    impl Transcriber for Fixed {
        async fn transcribe(
            &self,
            _samples: &[f32],
            _sample_rate: u32,
        ) -> Result<TranscriptionResult, TranscriptionError> {
            Ok(TranscriptionResult::new(self.name, "en", Some(1.0)))
        }
        fn is_available(&self) -> bool {
            self.available
        }
        fn name(&self) -> &str {
            self.name
        }
    }

    #[test]
    fn select_skips_unavailable() {
        let set = TranscriberSet::new()
            .with(Arc::new(Fixed {
                name: "local",
                available: false,
            }))
            .with(Arc::new(Fixed {
                name: "cloud",
                available: true,
            }));
        assert_eq!(set.select().unwrap().name(), "cloud");
    }

    #[test]
    fn nothing_available_is_engine_unavailable() {
        let set = TranscriberSet::new().with(Arc::new(Fixed {
            name: "local",
            available: false,
        }));
        let err = set.select().err().unwrap();
        assert!(matches!(err, TranscriptionError::EngineUnavailable(_)));
        assert!(err.to_string().contains("local"));

        assert!(TranscriberSet::new().select().is_err());
    }

    #[tokio::test]
    async fn selected_engine_transcribes() {
        let set = TranscriberSet::new().with(Arc::new(Fixed {
            name: "stub",
            available: true,
        }));
        let result = set.select().unwrap().transcribe(&[0.0; 16], 16_000).await.unwrap();
        assert_eq!(result.text, "stub");
        assert_eq!(result.language, "en");
    }

    #[test]
    fn result_serializes_with_all_fields() {
        let json =
            serde_json::to_value(TranscriptionResult::new("hi", "en", Some(0.5))).unwrap();
        assert_eq!(json["text"], "hi");
        assert_eq!(json["language"], "en");
        assert_eq!(json["confidence"], 0.5);
    }
}
