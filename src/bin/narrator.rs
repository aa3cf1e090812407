//! Reads lines from stdin and speaks them through the system TTS command.
//!
//! `/stop`, `/skip`, `/status` and `/wait <text>` control the queue; every
//! other line is queued for speech.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use talkback::{default_settings_path, load_settings, CommandTts, Narrator, SignalBus, VoiceSettings};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

const DEFAULT_SPEED: f32 = 1.0;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let settings = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .or_else(default_settings_path)
        .map(|path| load_settings(&path))
        .unwrap_or_else(VoiceSettings::default);

    let bus = SignalBus::new(settings.coordination_dir.clone(), settings.signal_poll_interval());
    let engine = CommandTts::system_default().with_signal_bus(bus.clone());
    let narrator = Narrator::start(Arc::new(engine), bus, settings.signal_poll_interval());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut interrupted = false;
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                interrupted = true;
                break;
            }
            line = lines.next_line() => line,
        };
        let line = match line {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                log::error!("Failed to read stdin: {}", e);
                break;
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let reply = match line {
            "/stop" => narrator.stop_speaking(),
            "/skip" => narrator.skip(),
            "/status" => narrator.queue_status(),
            _ => match line.strip_prefix("/wait ") {
                Some(text) => narrator.speak_and_wait(text, None, DEFAULT_SPEED).await,
                None => narrator.speak(line, None, DEFAULT_SPEED),
            },
        };
        println!("{}", reply);
    }

    // End of input: let the queue finish unless asked to quit
    while !interrupted && (narrator.is_speaking() || narrator.queue_len() > 0) {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => interrupted = true,
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }
    narrator.shutdown();
}
