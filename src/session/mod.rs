//! Recording sessions
//!
//! [`VoiceService`] is the control surface. Starting a session installs the
//! hotkey hook and spawns one loop task that owns the [`Recorder`] and the
//! PTT state; key events, VAD events and control commands all reach it over
//! channels. Listening mode instead keeps the microphone open and lets the
//! VAD cut utterances.

mod auto_start;
mod controller;
mod listen;
mod recorder;
mod transcript_log;

use std::sync::Arc;

use crate::audio::AudioError;
use crate::hotkey::HotkeyError;
use crate::settings::VoiceSettings;
use crate::transcription::{TranscriptionError, TranscriptionResult};

pub use controller::{ServiceParts, VoiceService};
pub use listen::LISTEN_SILENCE_MS;
pub use recorder::{Finisher, Recorder, RecorderConfig, VadSetup};
pub use transcript_log::TranscriptLog;

/// Called with every transcription, after the audio is persisted.
pub type ReadyHook = Arc<dyn Fn(&TranscriptionResult) + Send + Sync>;

/// Called on every status change.
pub type StateHook = Arc<dyn Fn(SessionStatus) + Send + Sync>;

/// Per-session overrides of the persisted settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub hotkey: String,
    pub auto_stop: bool,
    pub auto_start: bool,
    pub silence_ms: u64,
    /// None: use the settings value for the active input device.
    pub echo_delay_ms: Option<u64>,
}

impl SessionOptions {
    pub fn from_settings(settings: &VoiceSettings) -> Self {
        Self {
            hotkey: settings.hotkey.clone(),
            auto_stop: settings.auto_stop,
            auto_start: settings.auto_start,
            silence_ms: settings.silence_ms,
            echo_delay_ms: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Inactive,
    Ready,
    Recording,
    Transcribing,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Inactive => "inactive",
            SessionStatus::Ready => "ready",
            SessionStatus::Recording => "recording",
            SessionStatus::Transcribing => "transcribing",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Answer to `get_result`: the text if one is ready, else where the session is.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultReply {
    Text(TranscriptionResult),
    Inactive,
    Ready,
    Recording,
    Transcribing,
    Timeout,
}

impl ResultReply {
    fn from_status(status: SessionStatus) -> Self {
        match status {
            SessionStatus::Inactive => ResultReply::Inactive,
            SessionStatus::Ready => ResultReply::Ready,
            SessionStatus::Recording => ResultReply::Recording,
            SessionStatus::Transcribing => ResultReply::Transcribing,
        }
    }
}

impl std::fmt::Display for ResultReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResultReply::Text(r) => f.write_str(&r.text),
            ResultReply::Inactive => f.write_str("inactive"),
            ResultReply::Ready => f.write_str("ready"),
            ResultReply::Recording => f.write_str("recording"),
            ResultReply::Transcribing => f.write_str("transcribing"),
            ResultReply::Timeout => f.write_str("timeout"),
        }
    }
}

/// How a stopped recording ended.
#[derive(Debug, Clone, PartialEq)]
pub enum StopOutcome {
    Transcribed(TranscriptionResult),
    /// Nothing was captured; the engine was not called.
    NoAudio,
    /// Audio dropped on purpose (interrupt).
    Discarded,
}

#[derive(Debug)]
pub enum SessionError {
    Hotkey(HotkeyError),
    Audio(AudioError),
    Transcription(TranscriptionError),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Hotkey(e) => write!(f, "{}", e),
            SessionError::Audio(e) => write!(f, "{}", e),
            SessionError::Transcription(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Hotkey(e) => Some(e),
            SessionError::Audio(e) => Some(e),
            SessionError::Transcription(e) => Some(e),
        }
    }
}

impl From<HotkeyError> for SessionError {
    fn from(e: HotkeyError) -> Self {
        SessionError::Hotkey(e)
    }
}

impl From<AudioError> for SessionError {
    fn from(e: AudioError) -> Self {
        SessionError::Audio(e)
    }
}

impl From<TranscriptionError> for SessionError {
    fn from(e: TranscriptionError) -> Self {
        SessionError::Transcription(e)
    }
}

/// Run a user hook, logging instead of unwinding if it panics.
pub(crate) fn call_hook<F: FnOnce()>(name: &str, f: F) {
    if std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)).is_err() {
        log::error!("{} hook panicked; ignoring", name);
    }
}
