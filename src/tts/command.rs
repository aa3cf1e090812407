//! TTS via an external speech command (`espeak-ng`, `say`).

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::{PlaybackEnd, TtsEngine, TtsError};
use crate::signal::SignalBus;

/// Words per minute at speed 1.0
const BASE_WPM: f32 = 175.0;

/// Runs one player process per utterance and publishes its pid so the
/// recorder side can terminate it directly.
#[derive(Debug, Clone)]
pub struct CommandTts {
    program: String,
    rate_flag: Option<String>,
    voice_flag: Option<String>,
    extra_args: Vec<String>,
    bus: Option<SignalBus>,
}

impl CommandTts {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            rate_flag: None,
            voice_flag: None,
            extra_args: Vec::new(),
            bus: None,
        }
    }

    /// `espeak-ng -s <wpm> -v <voice> <text>`
    pub fn espeak() -> Self {
        Self::new("espeak-ng").rate_flag("-s").voice_flag("-v")
    }

    /// macOS `say -r <wpm> -v <voice> <text>`
    pub fn say() -> Self {
        Self::new("say").rate_flag("-r").voice_flag("-v")
    }

    /// Platform default player.
    pub fn system_default() -> Self {
        if cfg!(target_os = "macos") {
            Self::say()
        } else {
            Self::espeak()
        }
    }

    pub fn rate_flag(mut self, flag: impl Into<String>) -> Self {
        self.rate_flag = Some(flag.into());
        self
    }

    pub fn voice_flag(mut self, flag: impl Into<String>) -> Self {
        self.voice_flag = Some(flag.into());
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    /// Publish player pids on `bus`.
    pub fn with_signal_bus(mut self, bus: SignalBus) -> Self {
        self.bus = Some(bus);
        self
    }

    fn command(&self, text: &str, voice: Option<&str>, speed: f32) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.extra_args);
        if let Some(flag) = &self.rate_flag {
            let wpm = (BASE_WPM * speed.clamp(0.25, 4.0)).round() as u32;
            cmd.arg(flag).arg(wpm.to_string());
        }
        if let (Some(flag), Some(voice)) = (&self.voice_flag, voice) {
            cmd.arg(flag).arg(voice);
        }
        cmd.arg(text)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

#[cfg(unix)]
fn killed_by_signal(status: &std::process::ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;
    status.signal().is_some()
}

#[cfg(not(unix))]
fn killed_by_signal(_status: &std::process::ExitStatus) -> bool {
    false
}

#[async_trait]
impl TtsEngine for CommandTts {
    async fn speak(
        &self,
        text: &str,
        voice: Option<&str>,
        speed: f32,
        cancel: CancellationToken,
    ) -> Result<PlaybackEnd, TtsError> {
        let mut child = self
            .command(text, voice, speed)
            .spawn()
            .map_err(|e| TtsError::SpawnFailed(format!("{}: {}", self.program, e)))?;

        if let (Some(bus), Some(pid)) = (&self.bus, child.id()) {
            if let Err(e) = bus.write_playback_pid(pid, &self.program) {
                log::warn!("Could not publish playback pid: {}", e);
            }
        }

        let outcome = tokio::select! {
            status = child.wait() => match status {
                Ok(s) if s.success() => Ok(PlaybackEnd::Finished),
                Ok(s) if killed_by_signal(&s) => Ok(PlaybackEnd::Aborted),
                Ok(s) => Err(TtsError::PlaybackFailed(format!("{} exited with {}", self.program, s))),
                Err(e) => Err(TtsError::PlaybackFailed(e.to_string())),
            },
            _ = cancel.cancelled() => {
                if let Err(e) = child.kill().await {
                    log::warn!("Failed to kill {}: {}", self.program, e);
                }
                Ok(PlaybackEnd::Aborted)
            }
        };

        if let Some(bus) = &self.bus {
            bus.clear_playback_pid();
        }
        outcome
    }

    fn name(&self) -> &str {
        &self.program
    }
}
