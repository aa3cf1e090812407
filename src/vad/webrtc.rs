//! WebRTC VAD backend.

use webrtc_vad::{SampleRate, Vad, VadMode};

use super::{SpeechClassifier, VadError};
use crate::audio::sample_to_i16;

/// WebRTC VAD supports only 10/20/30ms frames. 30ms at 16kHz.
const FRAME_LEN: usize = 480;

/// Binary classifier: probability is 1.0 for a voiced frame, 0.0 otherwise.
pub struct WebRtcClassifier {
    vad: Vad,
    mode: u8,
    frame: Vec<i16>,
}

fn vad_mode(aggressiveness: u8) -> VadMode {
    match aggressiveness {
        0 => VadMode::Quality,
        1 => VadMode::LowBitrate,
        2 => VadMode::Aggressive,
        _ => VadMode::VeryAggressive,
    }
}

impl WebRtcClassifier {
    /// `aggressiveness` 0..=3, higher rejects more non-speech.
    pub fn new(aggressiveness: u8) -> Self {
        let mode = aggressiveness.min(3);
        Self {
            vad: Vad::new_with_rate_and_mode(SampleRate::Rate16kHz, vad_mode(mode)),
            mode,
            frame: Vec::with_capacity(FRAME_LEN),
        }
    }
}

impl SpeechClassifier for WebRtcClassifier {
    fn frame_len(&self) -> usize {
        FRAME_LEN
    }

    fn speech_probability(&mut self, window: &[f32]) -> Result<f32, VadError> {
        self.frame.clear();
        self.frame.extend(window.iter().map(|&s| sample_to_i16(s)));
        match self.vad.is_voice_segment(&self.frame) {
            Ok(true) => Ok(1.0),
            Ok(false) => Ok(0.0),
            Err(()) => Err(VadError::ProcessingError(format!(
                "invalid frame length {}",
                self.frame.len()
            ))),
        }
    }

    fn reset(&mut self) {
        self.vad = Vad::new_with_rate_and_mode(SampleRate::Rate16kHz, vad_mode(self.mode));
    }

    fn name(&self) -> &'static str {
        "webrtc"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silence_is_not_speech() {
        let mut c = WebRtcClassifier::new(3);
        let p = c.speech_probability(&[0.0; FRAME_LEN]).unwrap();
        assert_eq!(p, 0.0);
    }

    #[test]
    fn wrong_frame_length_is_an_error() {
        let mut c = WebRtcClassifier::new(3);
        assert!(c.speech_probability(&[0.0; 100]).is_err());
    }

    #[test]
    fn aggressiveness_is_clamped() {
        let c = WebRtcClassifier::new(9);
        assert_eq!(c.mode, 3);
    }
}
