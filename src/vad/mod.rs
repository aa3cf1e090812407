//! Speech boundary detection.
//!
//! A [`SpeechClassifier`] turns one fixed-size window into a speech
//! probability. The [`SpeechBoundaryDetector`] layers debounce and the
//! end-of-speech deadline on top, so every backend gets identical
//! start/end semantics.

pub mod detector;
#[cfg(feature = "silero")]
mod silero;
mod webrtc;
pub mod worker;

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use detector::{SpeechBoundaryDetector, SpeechEvent, SpeechState, VadConfig};
#[cfg(feature = "silero")]
pub use silero::SileroClassifier;
pub use webrtc::WebRtcClassifier;
pub use worker::{VadSignal, VadWorker};

#[derive(Debug, Clone)]
pub enum VadError {
    /// The backend's runtime or model is not present on this machine.
    BackendUnavailable(String),
    InitError(String),
    ProcessingError(String),
}

impl std::fmt::Display for VadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VadError::BackendUnavailable(e) => write!(f, "VAD backend unavailable: {}", e),
            VadError::InitError(e) => write!(f, "VAD initialization error: {}", e),
            VadError::ProcessingError(e) => write!(f, "VAD processing error: {}", e),
        }
    }
}

impl std::error::Error for VadError {}

/// Frame-in, probability-out. Implementations may keep model state between
/// calls; `reset` returns them to a fresh state.
pub trait SpeechClassifier {
    /// Samples per analysis window.
    fn frame_len(&self) -> usize;

    /// Trailing samples of the previous window prepended to each call.
    fn context_len(&self) -> usize {
        0
    }

    /// Speech probability in [0, 1] for `window` (context + frame samples).
    fn speech_probability(&mut self, window: &[f32]) -> Result<f32, VadError>;

    fn reset(&mut self);

    fn name(&self) -> &'static str;
}

/// Builds a classifier on the thread that will own it.
pub type ClassifierFactory =
    Arc<dyn Fn() -> Result<Box<dyn SpeechClassifier>, VadError> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VadBackend {
    /// WebRTC VAD: tiny, fast, coarse.
    Webrtc,
    /// Silero neural VAD: heavier, more accurate.
    Silero,
}

impl VadBackend {
    pub fn alternate(self) -> Self {
        match self {
            VadBackend::Webrtc => VadBackend::Silero,
            VadBackend::Silero => VadBackend::Webrtc,
        }
    }
}

/// Backend parameters taken from settings.
#[derive(Debug, Clone)]
pub struct BackendOptions {
    pub webrtc_aggressiveness: u8,
    pub silero_model_path: Option<PathBuf>,
    pub threshold: f32,
}

/// Construct one backend, reporting a missing dependency immediately.
pub fn create_classifier(
    backend: VadBackend,
    options: &BackendOptions,
) -> Result<Box<dyn SpeechClassifier>, VadError> {
    match backend {
        VadBackend::Webrtc => Ok(Box::new(WebRtcClassifier::new(
            options.webrtc_aggressiveness,
        ))),
        #[cfg(feature = "silero")]
        VadBackend::Silero => Ok(Box::new(SileroClassifier::new(
            options.silero_model_path.clone(),
            options.threshold,
        )?)),
        #[cfg(not(feature = "silero"))]
        VadBackend::Silero => Err(VadError::BackendUnavailable(
            "built without the `silero` feature".to_string(),
        )),
    }
}

/// Factory that tries `preferred` first and falls back to the alternate backend.
pub fn factory_with_fallback(preferred: VadBackend, options: BackendOptions) -> ClassifierFactory {
    Arc::new(move || match create_classifier(preferred, &options) {
        Ok(c) => Ok(c),
        Err(VadError::BackendUnavailable(reason)) => {
            let alternate = preferred.alternate();
            log::warn!(
                "VAD backend {:?} unavailable ({}), falling back to {:?}",
                preferred,
                reason,
                alternate
            );
            create_classifier(alternate, &options)
        }
        Err(e) => Err(e),
    })
}
