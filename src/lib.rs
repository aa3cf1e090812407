//! Push-to-talk voice sessions that cooperate with a separate narration
//! process through marker files.
//!
//! [`VoiceService`] owns the microphone, the hotkey hook and the session
//! loop. [`Narrator`] is the speaking side. Both meet in a [`SignalBus`]
//! directory, so either can live in another process.

pub mod audio;
pub mod coordinator;
pub mod hotkey;
pub mod session;
pub mod settings;
pub mod signal;
pub mod transcription;
pub mod tts;
pub mod vad;

pub use coordinator::VoiceCoordinator;
pub use session::{
    ResultReply, ServiceParts, SessionError, SessionOptions, SessionStatus, StopOutcome,
    VoiceService,
};
pub use settings::{default_settings_path, load_settings, save_settings, VoiceSettings};
pub use signal::{SignalBus, SignalKind};
pub use transcription::{Transcriber, TranscriberSet, TranscriptionResult};
pub use tts::{CommandTts, Narrator, TtsEngine};
