use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use talkback::audio::{list_input_devices, CpalInput};
use talkback::hotkey::EvdevKeySource;
use talkback::transcription::OpenAiTranscriber;
use talkback::{
    default_settings_path, load_settings, ResultReply, ServiceParts, SessionOptions,
    TranscriberSet, VoiceService, VoiceSettings,
};
use tracing_subscriber::EnvFilter;

/// `talkback [--list-devices] [--listen] [--device <name>] [settings.json]`
#[derive(Debug, Default, PartialEq)]
struct Args {
    list_devices: bool,
    listen: bool,
    device: Option<String>,
    settings_path: Option<PathBuf>,
}

impl Args {
    fn parse(args: impl IntoIterator<Item = OsString>) -> Self {
        let mut parsed = Args::default();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.to_str() {
                Some("--list-devices") => parsed.list_devices = true,
                Some("--listen") => parsed.listen = true,
                Some("--device") => parsed.device = args.next().and_then(|d| d.into_string().ok()),
                _ => parsed.settings_path = Some(PathBuf::from(arg)),
            }
        }
        parsed
    }
}

#[tokio::main]
async fn main() {
    // Load .env file if present (for development convenience)
    // Silently ignore if not found - production uses system env vars
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse(std::env::args_os().skip(1));
    if args.list_devices {
        let devices = list_input_devices();
        if devices.is_empty() {
            eprintln!("No input devices found");
            std::process::exit(1);
        }
        for name in devices {
            println!("{}", name);
        }
        return;
    }
    let settings_path = args.settings_path.or_else(default_settings_path);
    let settings = match &settings_path {
        Some(path) => {
            log::info!("Settings: {:?}", path);
            load_settings(path)
        }
        None => VoiceSettings::default(),
    };
    let options = SessionOptions::from_settings(&settings);

    let transcribers = TranscriberSet::new().with(Arc::new(OpenAiTranscriber::new(
        settings.openai_model.clone(),
        settings.language.clone(),
    )));
    let input = match args.device {
        Some(name) => CpalInput::with_device(name),
        None => CpalInput::new(),
    };
    let service = VoiceService::new(ServiceParts::new(
        settings,
        Arc::new(input),
        Arc::new(EvdevKeySource),
        transcribers,
    ));

    if args.listen {
        run_listening(&service).await;
        return;
    }

    let message = service.start_session(options).await;
    println!("{}", message);
    if message.starts_with("Failed") {
        std::process::exit(1);
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            reply = service.get_result(true, Duration::from_secs(30)) => match reply {
                ResultReply::Text(result) => println!("{}", result.text),
                ResultReply::Inactive => break,
                _ => {}
            },
        }
    }

    println!("{}", service.stop_session().await);
}

async fn run_listening(service: &VoiceService) {
    let message = service.start_listening(None).await;
    println!("{}", message);
    if message.starts_with("Error") {
        std::process::exit(1);
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            reply = service.get_result(true, Duration::from_secs(30)) => match reply {
                ResultReply::Text(result) => println!("{}", result.text),
                ResultReply::Inactive => break,
                _ => {}
            },
        }
    }

    println!("{}", service.stop_listening().await);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::parse(args.iter().map(|a| OsString::from(*a)))
    }

    #[test]
    fn no_args_uses_defaults() {
        assert_eq!(parse(&[]), Args::default());
    }

    #[test]
    fn flags_and_settings_path() {
        let args = parse(&["--listen", "--device", "USB Mic", "/tmp/voice.json"]);
        assert!(args.listen);
        assert!(!args.list_devices);
        assert_eq!(args.device.as_deref(), Some("USB Mic"));
        assert_eq!(args.settings_path, Some(PathBuf::from("/tmp/voice.json")));
    }

    #[test]
    fn list_devices_flag() {
        assert!(parse(&["--list-devices"]).list_devices);
    }
}
