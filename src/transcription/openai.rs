//! OpenAI Whisper API engine
//!
//! Samples are encoded to an in-memory WAV and uploaded; nothing touches disk.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use super::{Transcriber, TranscriptionError, TranscriptionResult};
use crate::audio::{encode_wav, SAMPLE_RATE};

const ENDPOINT: &str = "https://api.openai.com/v1/audio/transcriptions";

/// OpenAI Whisper API response
#[derive(Debug, Deserialize)]
struct WhisperVerboseResponse {
    text: String,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    segments: Vec<WhisperSegment>,
}

#[derive(Debug, Deserialize)]
struct WhisperSegment {
    #[serde(default)]
    avg_logprob: Option<f32>,
}

/// OpenAI API error response
#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

fn get_api_key() -> Option<String> {
    std::env::var("OPENAI_API_KEY")
        .ok()
        .filter(|key| !key.is_empty())
}

/// Check if an API key is configured (for status display)
pub fn is_api_key_configured() -> bool {
    get_api_key().is_some()
}

/// exp(mean avg_logprob) over segments that report one.
fn confidence(segments: &[WhisperSegment]) -> Option<f32> {
    let logprobs: Vec<f32> = segments.iter().filter_map(|s| s.avg_logprob).collect();
    if logprobs.is_empty() {
        return None;
    }
    let mean = logprobs.iter().sum::<f32>() / logprobs.len() as f32;
    Some(mean.exp().clamp(0.0, 1.0))
}

/// Whisper verbose_json reports full language names ("english").
fn language_tag(language: Option<&str>) -> String {
    match language.map(|l| l.to_ascii_lowercase()) {
        Some(l) if l == "english" => "en".to_string(),
        Some(l) if l == "german" => "de".to_string(),
        Some(l) if l == "french" => "fr".to_string(),
        Some(l) if l == "spanish" => "es".to_string(),
        Some(l) if l == "italian" => "it".to_string(),
        Some(l) if l == "japanese" => "ja".to_string(),
        Some(l) if l == "chinese" => "zh".to_string(),
        Some(l) if !l.is_empty() => l,
        _ => "unknown".to_string(),
    }
}

pub struct OpenAiTranscriber {
    client: Client,
    model: String,
    language: Option<String>,
}

impl OpenAiTranscriber {
    pub fn new(model: impl Into<String>, language: Option<String>) -> Self {
        // Reused across requests to avoid TLS handshake overhead
        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_else(|e| {
                log::warn!("Failed to build HTTP client with timeout: {}", e);
                Client::new()
            });
        Self {
            client,
            model: model.into(),
            language,
        }
    }
}

#[async_trait]
impl Transcriber for OpenAiTranscriber {
    async fn transcribe(
        &self,
        samples: &[f32],
        sample_rate: u32,
    ) -> Result<TranscriptionResult, TranscriptionError> {
        let api_key = get_api_key().ok_or(TranscriptionError::MissingApiKey)?;

        if sample_rate != SAMPLE_RATE {
            return Err(TranscriptionError::EncodeError(format!(
                "expected {}Hz audio, got {}Hz",
                SAMPLE_RATE, sample_rate
            )));
        }
        let wav = encode_wav(samples).map_err(|e| TranscriptionError::EncodeError(e.to_string()))?;

        log::info!(
            "Transcribing {:.1}s of audio ({} bytes) with {}",
            samples.len() as f32 / sample_rate as f32,
            wav.len(),
            self.model
        );

        let file_part = Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| TranscriptionError::ParseError(e.to_string()))?;

        let mut form = Form::new()
            .part("file", file_part)
            .text("model", self.model.clone())
            .text("response_format", "verbose_json")
            .text("temperature", "0");
        if let Some(language) = &self.language {
            form = form.text("language", language.clone());
        }

        let response = self
            .client
            .post(ENDPOINT)
            .header("Authorization", format!("Bearer {}", api_key))
            .multipart(form)
            .send()
            .await
            .map_err(|e| TranscriptionError::NetworkError(e.to_string()))?;

        let status = response.status();

        if status.is_success() {
            let whisper_response: WhisperVerboseResponse = response
                .json()
                .await
                .map_err(|e| TranscriptionError::ParseError(e.to_string()))?;

            let confidence = confidence(&whisper_response.segments);
            let language = match &self.language {
                Some(l) => l.clone(),
                None => language_tag(whisper_response.language.as_deref()),
            };
            log::info!(
                "Transcription successful: {} chars (language={}, confidence={:?})",
                whisper_response.text.len(),
                language,
                confidence
            );

            Ok(TranscriptionResult {
                text: whisper_response.text.trim().to_string(),
                language,
                confidence,
            })
        } else {
            let error_text = response.text().await.unwrap_or_default();

            let message =
                if let Ok(error_response) = serde_json::from_str::<ApiErrorResponse>(&error_text) {
                    error_response.error.message
                } else {
                    error_text
                };

            log::error!("OpenAI API error ({}): {}", status.as_u16(), message);

            Err(TranscriptionError::ApiError {
                status: status.as_u16(),
                message,
            })
        }
    }

    fn is_available(&self) -> bool {
        is_api_key_configured()
    }

    fn name(&self) -> &str {
        "openai"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_api_key_error_display() {
        let err = TranscriptionError::MissingApiKey;
        assert!(err.to_string().contains("OPENAI_API_KEY"));
    }

    #[test]
    fn test_api_error_display() {
        let err = TranscriptionError::ApiError {
            status: 401,
            message: "Invalid API key".to_string(),
        };
        assert!(err.to_string().contains("401"));
        assert!(err.to_string().contains("Invalid API key"));
    }

    #[test]
    fn confidence_is_exp_of_mean_logprob() {
        let segments = vec![
            WhisperSegment {
                avg_logprob: Some(-0.2),
            },
            WhisperSegment {
                avg_logprob: Some(-0.4),
            },
            WhisperSegment { avg_logprob: None },
        ];
        let c = confidence(&segments).unwrap();
        assert!((c - (-0.3f32).exp()).abs() < 1e-6);
        assert_eq!(confidence(&[]), None);
    }

    #[test]
    fn verbose_response_parses() {
        let body = r#"{"text":" hello world","language":"english","segments":[{"avg_logprob":-0.1,"no_speech_prob":0.01}]}"#;
        let parsed: WhisperVerboseResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.text, " hello world");
        assert_eq!(language_tag(parsed.language.as_deref()), "en");
        assert!(confidence(&parsed.segments).is_some());
    }

    #[test]
    fn language_tag_fallbacks() {
        assert_eq!(language_tag(None), "unknown");
        assert_eq!(language_tag(Some("Klingon")), "klingon");
    }
}
