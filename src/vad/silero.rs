//! Silero neural VAD via sherpa-rs.

use std::path::PathBuf;

use sherpa_rs::silero_vad::{SileroVad, SileroVadConfig};

use super::{SpeechClassifier, VadError};
use crate::audio::SAMPLE_RATE;

const WINDOW_SIZE: usize = 512;
const MODEL_FILE: &str = "silero_vad.onnx";

/// Default model location: ~/.local/share/talkback/models/silero_vad.onnx
pub fn default_model_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("talkback")
        .join("models")
        .join(MODEL_FILE)
}

pub struct SileroClassifier {
    vad: SileroVad,
}

impl SileroClassifier {
    pub fn new(model_path: Option<PathBuf>, threshold: f32) -> Result<Self, VadError> {
        let model_path = model_path.unwrap_or_else(default_model_path);
        if !model_path.exists() {
            return Err(VadError::BackendUnavailable(format!(
                "Silero model not found at {}",
                model_path.display()
            )));
        }

        let config = SileroVadConfig {
            model: model_path.to_string_lossy().to_string(),
            sample_rate: SAMPLE_RATE,
            threshold,
            // Segmenting is handled by the boundary detector; keep sherpa's own
            // hangover as short as it allows.
            min_silence_duration: 0.1,
            min_speech_duration: 0.05,
            window_size: WINDOW_SIZE as i32,
            ..Default::default()
        };

        log::info!("Loading Silero VAD from {}", model_path.display());
        let vad = SileroVad::new(config, 30.0).map_err(|e| VadError::InitError(e.to_string()))?;
        Ok(Self { vad })
    }
}

impl SpeechClassifier for SileroClassifier {
    fn frame_len(&self) -> usize {
        WINDOW_SIZE
    }

    fn speech_probability(&mut self, window: &[f32]) -> Result<f32, VadError> {
        self.vad.accept_waveform(window.to_vec());
        let speech = self.vad.is_speech();
        // Completed segments are not used; drain them so the buffer stays small.
        while !self.vad.is_empty() {
            self.vad.pop();
        }
        Ok(if speech { 1.0 } else { 0.0 })
    }

    fn reset(&mut self) {
        self.vad.clear();
    }

    fn name(&self) -> &'static str {
        "silero"
    }
}
