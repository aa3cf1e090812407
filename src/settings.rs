use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audio::{default_recordings_dir, DEFAULT_MAX_BUFFERED_FRAMES, SAMPLE_RATE};
use crate::signal::default_coordination_dir;
use crate::vad::{BackendOptions, VadBackend, VadConfig};

const SETTINGS_FILE_NAME: &str = "settings.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceSettings {
    /// Push-to-talk combo, e.g. "cmd_r" or "ctrl_l+shift_l+m".
    pub hotkey: String,

    /// Stop recording automatically after `silence_ms` of silence.
    pub auto_stop: bool,

    /// Start recording automatically when narration finishes.
    pub auto_start: bool,

    pub silence_ms: u64,

    /// Pause after narration ends before the microphone is re-armed, so the
    /// tail of the speaker output is not recorded.
    pub echo_delay_ms: u64,

    /// Per input device overrides of `echo_delay_ms`, keyed by device name.
    pub echo_delay_overrides: HashMap<String, u64>,

    pub vad_backend: VadBackend,

    /// Speech probability threshold in [0, 1].
    pub vad_threshold: f32,

    /// Consecutive speech frames needed to confirm speech start.
    pub min_speech_frames: usize,

    /// WebRTC VAD aggressiveness, 0..=3.
    pub webrtc_aggressiveness: u8,

    /// Silero ONNX model. Defaults to ~/.local/share/talkback/models/silero_vad.onnx
    pub silero_model_path: Option<PathBuf>,

    /// Stop narration as soon as the user starts speaking.
    pub barge_in: bool,

    /// Capture buffer cap in callback chunks; oldest chunks are dropped past it.
    pub max_buffered_frames: usize,

    /// Recordings longer than this are stopped automatically.
    pub max_recording_secs: u64,

    /// Number of diagnostics WAV files to keep.
    pub keep_recordings: usize,

    pub recordings_dir: PathBuf,

    /// Directory holding the cross-process signal markers.
    pub coordination_dir: PathBuf,

    pub signal_poll_ms: u64,

    /// Optional JSONL log of status changes and transcriptions.
    pub transcript_log: Option<PathBuf>,

    pub openai_model: String,

    /// Language hint for transcription (ISO 639-1).
    pub language: Option<String>,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            hotkey: "cmd_r".to_string(),
            auto_stop: false,
            auto_start: false,
            silence_ms: 1500,
            echo_delay_ms: 800,
            echo_delay_overrides: HashMap::new(),
            vad_backend: VadBackend::Webrtc,
            vad_threshold: 0.5,
            min_speech_frames: 3,
            webrtc_aggressiveness: 3,
            silero_model_path: None,
            barge_in: true,
            max_buffered_frames: DEFAULT_MAX_BUFFERED_FRAMES,
            max_recording_secs: 120,
            keep_recordings: 5,
            recordings_dir: default_recordings_dir(),
            coordination_dir: default_coordination_dir(),
            signal_poll_ms: 50,
            transcript_log: None,
            openai_model: "whisper-1".to_string(),
            language: None,
        }
    }
}

impl VoiceSettings {
    /// Echo delay for `device`, falling back to the global value.
    pub fn echo_delay_for(&self, device: Option<&str>) -> Duration {
        let ms = device
            .and_then(|d| self.echo_delay_overrides.get(d))
            .copied()
            .unwrap_or(self.echo_delay_ms);
        Duration::from_millis(ms)
    }

    pub fn vad_config(&self, silence_ms: u64) -> VadConfig {
        VadConfig {
            threshold: self.vad_threshold.clamp(0.0, 1.0),
            min_speech_frames: self.min_speech_frames.max(1),
            silence_duration: Duration::from_millis(silence_ms),
            sample_rate: SAMPLE_RATE,
        }
    }

    pub fn backend_options(&self) -> BackendOptions {
        BackendOptions {
            webrtc_aggressiveness: self.webrtc_aggressiveness,
            silero_model_path: self.silero_model_path.clone(),
            threshold: self.vad_threshold.clamp(0.0, 1.0),
        }
    }

    pub fn signal_poll_interval(&self) -> Duration {
        Duration::from_millis(self.signal_poll_ms.max(1))
    }

    pub fn max_recording(&self) -> Duration {
        Duration::from_secs(self.max_recording_secs.max(1))
    }
}

/// Default location: ~/.config/talkback/settings.json
pub fn default_settings_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("talkback").join(SETTINGS_FILE_NAME))
}

pub fn load_settings(path: &Path) -> VoiceSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<VoiceSettings>(&contents) {
            Ok(settings) => settings,
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                VoiceSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => VoiceSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            VoiceSettings::default()
        }
    }
}

pub fn save_settings(path: &Path, settings: &VoiceSettings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory {:?}: {}", parent, e))?;
    }

    let contents =
        serde_json::to_string_pretty(settings).map_err(|e| format!("Serialize settings: {}", e))?;

    // Write to a temp file in the same directory, then rename over the target.
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents)
        .map_err(|e| format!("Write temp settings {:?}: {}", tmp_path, e))?;

    // Windows rename fails if the destination exists
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(format!("Remove existing settings file {:?}: {}", path, e));
            }
        }
    }

    std::fs::rename(&tmp_path, path)
        .map_err(|e| format!("Rename temp settings {:?} to {:?}: {}", tmp_path, path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings(&dir.path().join("settings.json"));
        assert_eq!(settings, VoiceSettings::default());
        assert_eq!(settings.hotkey, "cmd_r");
        assert_eq!(settings.silence_ms, 1500);
    }

    #[test]
    fn corrupt_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert_eq!(load_settings(&path), VoiceSettings::default());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"auto_stop": true, "vad_backend": "silero"}"#).unwrap();
        let settings = load_settings(&path);
        assert!(settings.auto_stop);
        assert_eq!(settings.vad_backend, VadBackend::Silero);
        assert_eq!(settings.echo_delay_ms, 800);
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");
        let mut settings = VoiceSettings::default();
        settings.hotkey = "ctrl_l+m".to_string();
        settings.echo_delay_overrides.insert("USB Mic".to_string(), 200);

        save_settings(&path, &settings).unwrap();
        assert!(!path.with_extension("json.tmp").exists());
        assert_eq!(load_settings(&path), settings);
    }

    #[test]
    fn echo_delay_uses_device_override() {
        let mut settings = VoiceSettings::default();
        settings.echo_delay_overrides.insert("Headset".to_string(), 100);

        assert_eq!(settings.echo_delay_for(Some("Headset")), Duration::from_millis(100));
        assert_eq!(settings.echo_delay_for(Some("Laptop")), Duration::from_millis(800));
        assert_eq!(settings.echo_delay_for(None), Duration::from_millis(800));
    }

    #[test]
    fn vad_config_clamps() {
        let mut settings = VoiceSettings::default();
        settings.vad_threshold = 3.0;
        settings.min_speech_frames = 0;
        let config = settings.vad_config(700);
        assert_eq!(config.threshold, 1.0);
        assert_eq!(config.min_speech_frames, 1);
        assert_eq!(config.silence_duration, Duration::from_millis(700));
    }
}
