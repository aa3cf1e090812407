//! Audio capture module for talkback
//!
//! Owns the microphone: opening it on demand, buffering what it hears, and
//! releasing it the moment recording ends. Uses CPAL for capture and hound for
//! WAV encoding.

mod cpal_input;
pub mod device;
mod paths;
mod wav;

pub use cpal_input::{list_input_devices, CpalInput};
pub use device::{
    AudioDevice, AudioError, AudioFrame, AudioSession, CaptureShared, InputBackend, InputStream,
    DEFAULT_MAX_BUFFERED_FRAMES, FRAME_SAMPLES, SAMPLE_RATE,
};
pub use paths::{cleanup_old_recordings, default_recordings_dir, generate_wav_path};
pub use wav::{encode_wav, sample_to_i16, write_wav};
