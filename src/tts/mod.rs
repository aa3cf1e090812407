//! Text-to-speech side of the voice channel
//!
//! [`TtsEngine`] synthesizes and plays one utterance and can be aborted
//! mid-flight. [`Narrator`] queues utterances for an engine and honors the
//! cross-process stop-speaking signal.

mod command;
mod narrator;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

pub use command::CommandTts;
pub use narrator::Narrator;
pub(crate) use narrator::preview;

use crate::signal::SignalError;

#[derive(Debug)]
pub enum TtsError {
    SpawnFailed(String),
    PlaybackFailed(String),
    Signal(SignalError),
}

impl std::fmt::Display for TtsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TtsError::SpawnFailed(e) => write!(f, "Failed to start speech synthesis: {}", e),
            TtsError::PlaybackFailed(e) => write!(f, "Speech playback failed: {}", e),
            TtsError::Signal(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for TtsError {}

impl From<SignalError> for TtsError {
    fn from(e: SignalError) -> Self {
        TtsError::Signal(e)
    }
}

/// How a single utterance ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackEnd {
    Finished,
    /// Cancelled locally or terminated from outside.
    Aborted,
}

#[async_trait]
pub trait TtsEngine: Send + Sync {
    /// Speak `text`, returning when playback ends or `cancel` fires.
    /// `speed` is relative: 1.0 = normal.
    async fn speak(
        &self,
        text: &str,
        voice: Option<&str>,
        speed: f32,
        cancel: CancellationToken,
    ) -> Result<PlaybackEnd, TtsError>;

    fn name(&self) -> &str;
}
