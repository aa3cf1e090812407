//! Control surface and the per-session event loop.
//!
//! Every public operation returns a status string or a [`ResultReply`];
//! errors are reported in the text, never thrown across this boundary.
//! Push-to-talk sessions and continuous listening share the microphone and
//! never run at the same time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::auto_start::AutoStartWatcher;
use super::listen::{transcribe_segments, ListenCommand, ListenLoop, LISTEN_SILENCE_MS};
use super::recorder::Finisher;
use super::{
    call_hook, ReadyHook, Recorder, RecorderConfig, ResultReply, SessionError, SessionOptions,
    SessionStatus, StateHook, StopOutcome, TranscriptLog, VadSetup,
};
use crate::audio::InputBackend;
use crate::coordinator::{VoiceCoordinator, ACK_TIMEOUT};
use crate::hotkey::{
    install_hook, reduce, ComboDetector, HookHandle, KeyCombo, KeyEvent, KeySource, PttEffect,
    PttEvent, PttState, StopReason,
};
use crate::settings::VoiceSettings;
use crate::signal::{SignalBus, SignalKind};
use crate::transcription::{TranscriberSet, TranscriptionResult};
use crate::tts::preview;
use crate::vad::{factory_with_fallback, ClassifierFactory, SpeechEvent, VadSignal};

/// Session loop tick: max-duration checks.
const LOOP_TICK: Duration = Duration::from_millis(50);
/// VAD worker tick: how often a pending end-of-speech deadline is checked.
const VAD_TICK: Duration = Duration::from_millis(10);

/// Collaborators a [`VoiceService`] is built from.
pub struct ServiceParts {
    pub settings: VoiceSettings,
    pub input: Arc<dyn InputBackend>,
    pub keys: Arc<dyn KeySource>,
    pub transcribers: TranscriberSet,
    /// Replaces the classifier chosen from settings.
    pub classifier: Option<ClassifierFactory>,
    pub on_ready: Option<ReadyHook>,
    pub on_state_change: Option<StateHook>,
}

impl ServiceParts {
    pub fn new(
        settings: VoiceSettings,
        input: Arc<dyn InputBackend>,
        keys: Arc<dyn KeySource>,
        transcribers: TranscriberSet,
    ) -> Self {
        Self {
            settings,
            input,
            keys,
            transcribers,
            classifier: None,
            on_ready: None,
            on_state_change: None,
        }
    }

    pub fn with_classifier(mut self, factory: ClassifierFactory) -> Self {
        self.classifier = Some(factory);
        self
    }

    pub fn on_ready(mut self, hook: ReadyHook) -> Self {
        self.on_ready = Some(hook);
        self
    }

    pub fn on_state_change(mut self, hook: StateHook) -> Self {
        self.on_state_change = Some(hook);
        self
    }
}

enum Command {
    AutoStart,
    Deactivate {
        discard: bool,
        reply: oneshot::Sender<Option<Result<StopOutcome, SessionError>>>,
    },
}

/// State visible to the service handle and whichever loop owns the microphone.
pub(super) struct Shared {
    pub(super) coordinator: VoiceCoordinator,
    status: watch::Sender<SessionStatus>,
    result: watch::Sender<Option<TranscriptionResult>>,
    /// Last transcription from any source, kept for status reports.
    last: std::sync::Mutex<Option<TranscriptionResult>>,
    on_state_change: Option<StateHook>,
    transcript_log: Option<TranscriptLog>,
}

impl Shared {
    pub(super) fn publish(&self, status: SessionStatus) {
        let previous = self.status.send_replace(status);
        if previous == status {
            return;
        }
        log::info!("Session status: {} -> {}", previous, status);
        if let Some(log) = &self.transcript_log {
            log.status(status.as_str());
        }
        if let Some(hook) = &self.on_state_change {
            call_hook("on_state_change", || hook(status));
        }
    }

    /// Log the text and remember it as the latest.
    fn record(&self, result: &TranscriptionResult) {
        log::info!("Transcription ready: {} chars", result.text.len());
        if let Some(log) = &self.transcript_log {
            log.transcription(&result.text);
        }
        *self.last.lock().unwrap_or_else(|e| e.into_inner()) = Some(result.clone());
    }

    /// `record`, then fill the result slot for `get_result`.
    pub(super) fn deliver(&self, result: &TranscriptionResult) {
        self.record(result);
        self.result.send_replace(Some(result.clone()));
    }

    fn last(&self) -> Option<TranscriptionResult> {
        self.last.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Stop narration on user speech, then wait for the narrator's ack
    /// without holding up the caller.
    pub(super) fn barge_in(self: &Arc<Self>) {
        if self.coordinator.on_speech_detected() {
            let shared = self.clone();
            tokio::spawn(async move {
                shared.coordinator.await_ack(ACK_TIMEOUT).await;
            });
        }
    }
}

struct ActiveSession {
    hotkey: String,
    commands: UnboundedSender<Command>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct ActiveListen {
    commands: UnboundedSender<ListenCommand>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
    transcriber: JoinHandle<()>,
    finisher: Finisher,
    speech: Arc<AtomicBool>,
}

impl ActiveListen {
    fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

/// Explicit handle for the voice session. Owns at most one active session
/// or one listening loop. Locks are taken `active` first, then `listening`.
pub struct VoiceService {
    parts: ServiceParts,
    shared: Arc<Shared>,
    active: Mutex<Option<ActiveSession>>,
    listening: Mutex<Option<ActiveListen>>,
}

impl VoiceService {
    pub fn new(parts: ServiceParts) -> Self {
        let bus = SignalBus::new(
            parts.settings.coordination_dir.clone(),
            parts.settings.signal_poll_interval(),
        );
        let shared = Arc::new(Shared {
            coordinator: VoiceCoordinator::new(bus),
            status: watch::channel(SessionStatus::Inactive).0,
            result: watch::channel(None).0,
            last: std::sync::Mutex::new(None),
            on_state_change: parts.on_state_change.clone(),
            transcript_log: parts.settings.transcript_log.clone().map(TranscriptLog::new),
        });
        Self {
            parts,
            shared,
            active: Mutex::new(None),
            listening: Mutex::new(None),
        }
    }

    fn recorder_config(&self) -> RecorderConfig {
        let settings = &self.parts.settings;
        RecorderConfig {
            max_buffered_frames: settings.max_buffered_frames,
            recordings_dir: Some(settings.recordings_dir.clone()),
            keep_recordings: settings.keep_recordings,
        }
    }

    fn vad_setup(&self, silence_ms: u64) -> VadSetup {
        let settings = &self.parts.settings;
        VadSetup {
            factory: self.parts.classifier.clone().unwrap_or_else(|| {
                factory_with_fallback(settings.vad_backend, settings.backend_options())
            }),
            config: settings.vad_config(silence_ms),
            tick: VAD_TICK,
        }
    }

    pub fn settings(&self) -> &VoiceSettings {
        &self.parts.settings
    }

    pub fn coordinator(&self) -> &VoiceCoordinator {
        &self.shared.coordinator
    }

    pub fn status(&self) -> SessionStatus {
        *self.shared.status.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.shared.status.subscribe()
    }

    /// Install the hotkey hook and start the session loop.
    pub async fn start_session(&self, options: SessionOptions) -> String {
        let mut active = self.active.lock().await;
        if let Some(session) = active.as_ref() {
            if !session.task.is_finished() {
                return format!("PTT mode already active (hotkey: {})", session.hotkey);
            }
        }
        *active = None;

        if let Some(listen) = self.listening.lock().await.as_ref() {
            if listen.is_running() {
                return "Failed to start PTT mode: listening mode is active".to_string();
            }
        }

        let combo = match KeyCombo::parse(&options.hotkey) {
            Ok(c) => c,
            Err(e) => return format!("Failed to start PTT mode: {}", e),
        };

        let (key_tx, key_rx) = mpsc::unbounded_channel();
        let hook = match install_hook(self.parts.keys.as_ref(), key_tx) {
            Ok(h) => h,
            Err(e) => {
                log::error!("Hotkey hook failed: {}", e);
                return format!("Failed to start PTT mode: {}", e);
            }
        };

        let settings = &self.parts.settings;
        let vad = (options.auto_stop || settings.barge_in).then(|| self.vad_setup(options.silence_ms));

        let (vad_tx, vad_rx) = mpsc::unbounded_channel();
        let recorder = Recorder::new(
            self.parts.input.clone(),
            self.recorder_config(),
            self.parts.transcribers.clone(),
            vad,
            vad_tx,
            self.parts.on_ready.clone(),
        );

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let auto_start = Arc::new(AtomicBool::new(options.auto_start));

        if options.auto_start {
            let bus = self.shared.coordinator.bus().clone();
            // A completion left over from before this session must not start a recording
            bus.clear(SignalKind::TtsComplete);
            let echo_delay = options
                .echo_delay_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| settings.echo_delay_for(self.parts.input.device_name().as_deref()));
            let watcher = AutoStartWatcher {
                bus,
                echo_delay,
                enabled: auto_start.clone(),
                status: self.shared.status.subscribe(),
                cancel: cancel.child_token(),
            };
            tokio::spawn(watcher.run(cmd_tx.clone(), || Command::AutoStart));
        }

        let mut message = format!("PTT mode started. Press {} to start/stop recording.", combo);
        if options.auto_stop {
            message.push_str(&format!(
                " Auto-stop after {}ms of silence.",
                options.silence_ms
            ));
        }
        if options.auto_start {
            message.push_str(" Auto-start after narration.");
        }

        let mut session_loop = SessionLoop {
            state: PttState::Idle,
            detector: ComboDetector::new(combo.clone()),
            recorder,
            hook: Some(hook),
            auto_stop: options.auto_stop,
            barge_in: settings.barge_in,
            max_recording: settings.max_recording(),
            shared: self.shared.clone(),
            auto_start,
            cancel: cancel.clone(),
        };
        // Ready is visible before this call returns
        session_loop.dispatch(PttEvent::HookInstalled).await;
        let task = tokio::spawn(session_loop.run(key_rx, vad_rx, cmd_rx));

        log::info!("{}", message);
        *active = Some(ActiveSession {
            hotkey: combo.to_string(),
            commands: cmd_tx,
            cancel,
            task,
        });
        message
    }

    /// End the session. A recording in progress is transcribed first.
    pub async fn stop_session(&self) -> String {
        let mut active = self.active.lock().await;
        let Some(session) = active.take() else {
            return "PTT mode not active".to_string();
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let outcome = if session
            .commands
            .send(Command::Deactivate {
                discard: false,
                reply: reply_tx,
            })
            .is_ok()
        {
            reply_rx.await.ok().flatten()
        } else {
            None
        };
        session.cancel.cancel();
        if let Err(e) = session.task.await {
            log::error!("Session task failed: {}", e);
        }

        match outcome {
            Some(Ok(StopOutcome::Transcribed(result))) => {
                format!("PTT mode stopped. Final transcription: {}", result.text)
            }
            Some(Ok(StopOutcome::NoAudio)) => "PTT mode stopped. No audio captured.".to_string(),
            Some(Err(e)) => format!("PTT mode stopped. Transcription failed: {}", e),
            _ => "PTT mode stopped.".to_string(),
        }
    }

    /// Take the latest transcription, optionally waiting up to `timeout` for one.
    pub async fn get_result(&self, wait: bool, timeout: Duration) -> ResultReply {
        if let Some(result) = self.shared.result.send_replace(None) {
            return ResultReply::Text(result);
        }

        let status = self.status();
        if !wait || status == SessionStatus::Inactive {
            return ResultReply::from_status(status);
        }

        let mut rx = self.shared.result.subscribe();
        let arrived = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|r| r.is_some())).await,
            Ok(Ok(_))
        );
        if !arrived {
            return ResultReply::Timeout;
        }
        match self.shared.result.send_replace(None) {
            Some(result) => ResultReply::Text(result),
            // Another caller took it first
            None => ResultReply::from_status(self.status()),
        }
    }

    /// Open the microphone and transcribe every utterance the VAD brackets.
    /// `silence_ms` ends an utterance; None uses the listening default.
    pub async fn start_listening(&self, silence_ms: Option<u64>) -> String {
        let active = self.active.lock().await;
        if active.as_ref().map(|s| !s.task.is_finished()).unwrap_or(false) {
            return "Cannot start listening while PTT mode is active.".to_string();
        }
        let mut listening = self.listening.lock().await;
        if listening.as_ref().map(ActiveListen::is_running).unwrap_or(false) {
            return "Already listening.".to_string();
        }
        *listening = None;

        let silence_ms = silence_ms.unwrap_or(LISTEN_SILENCE_MS);
        let (vad_tx, vad_rx) = mpsc::unbounded_channel();
        let mut recorder = Recorder::new(
            self.parts.input.clone(),
            self.recorder_config(),
            self.parts.transcribers.clone(),
            Some(self.vad_setup(silence_ms)),
            vad_tx,
            self.parts.on_ready.clone(),
        );
        let recording_id = Uuid::new_v4();
        if let Err(e) = recorder.start(recording_id).await {
            log::error!("Listening failed to start: {}", e);
            return format!("Error starting listening: {}", e);
        }
        if !recorder.has_vad() {
            drop(recorder.release());
            return "Error starting listening: no VAD backend available".to_string();
        }

        self.shared.coordinator.start_listening();
        self.shared.result.send_replace(None);
        self.shared.publish(SessionStatus::Ready);

        let finisher = recorder.finisher();
        let (segment_tx, segment_rx) = mpsc::unbounded_channel();
        let transcriber = tokio::spawn(transcribe_segments(
            finisher.clone(),
            self.shared.clone(),
            segment_rx,
        ));

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let speech = Arc::new(AtomicBool::new(false));
        let listen_loop = ListenLoop {
            recorder,
            recording_id,
            shared: self.shared.clone(),
            speech: speech.clone(),
            segments: segment_tx,
            cancel: cancel.clone(),
            onset: Vec::new(),
        };
        let task = tokio::spawn(listen_loop.run(vad_rx, cmd_rx));

        *listening = Some(ActiveListen {
            commands: cmd_tx,
            cancel,
            task,
            transcriber,
            finisher,
            speech,
        });
        log::info!("Listening started, {}ms of silence ends an utterance", silence_ms);
        format!(
            "Listening started. Speak now - transcribing after {}ms of silence.",
            silence_ms
        )
    }

    /// Close the microphone. Utterances already queued are still transcribed.
    pub async fn stop_listening(&self) -> String {
        let mut listening = self.listening.lock().await;
        let Some(listen) = listening.take() else {
            return "Not currently listening.".to_string();
        };
        listen.cancel.cancel();
        if let Err(e) = listen.task.await {
            log::error!("Listen task failed: {}", e);
        }
        "Listening stopped.".to_string()
    }

    /// Text of the next transcription, or a bracketed status.
    pub async fn get_transcription(&self, wait: bool, timeout: Duration) -> String {
        match self.get_result(wait, timeout).await {
            ResultReply::Text(result) => result.text,
            ResultReply::Timeout => "[Timeout: No speech detected]".to_string(),
            _ => "[No transcription available]".to_string(),
        }
    }

    pub async fn listening_status(&self) -> String {
        let listening = self.listening.lock().await;
        let running = listening.as_ref().filter(|l| l.is_running());
        let yes_no = |b: bool| if b { "Yes" } else { "No" };

        let mut lines = vec![
            format!("Listening: {}", yes_no(running.is_some())),
            format!(
                "Speaking (TTS): {}",
                yes_no(self.shared.coordinator.is_speaking())
            ),
        ];
        if let Some(listen) = running {
            lines.push(format!(
                "Speech detected: {}",
                yes_no(listen.speech.load(Ordering::SeqCst))
            ));
        }
        if let Some(last) = self.shared.last() {
            lines.push(format!("Last transcription: \"{}\"", preview(&last.text)));
            lines.push(format!("Language: {}", last.language));
        }
        lines.join("\n")
    }

    /// Transcribe whatever is buffered without waiting for silence.
    pub async fn transcribe_now(&self) -> String {
        let (commands, finisher) = match self.listening.lock().await.as_ref() {
            Some(listen) if listen.is_running() => {
                (listen.commands.clone(), listen.finisher.clone())
            }
            _ => return "[No audio buffered]".to_string(),
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        if commands
            .send(ListenCommand::TakeBuffer { reply: reply_tx })
            .is_err()
        {
            return "[No audio buffered]".to_string();
        }
        let samples = reply_rx.await.unwrap_or_default();

        match finisher.finish_samples(Uuid::new_v4(), samples).await {
            Ok(StopOutcome::Transcribed(result)) => {
                self.shared.record(&result);
                result.text
            }
            Ok(_) => "[No audio buffered]".to_string(),
            Err(e) => {
                log::error!("Transcription failed: {}", e);
                format!("[Transcription failed: {}]", e)
            }
        }
    }

    /// Full reset: stop narration, drop any recording, end the session or
    /// listening loop. Safe to call any number of times.
    pub async fn interrupt(&self) -> String {
        let mut active = self.active.lock().await;
        let mut listening = self.listening.lock().await;
        let mut actions = Vec::new();

        if self.shared.coordinator.is_speaking() {
            match self.shared.coordinator.force_stop() {
                Ok(()) => {
                    actions.push("narration stopped");
                    self.shared.coordinator.await_ack(ACK_TIMEOUT).await;
                }
                Err(e) => log::error!("Interrupt could not stop narration: {}", e),
            }
            self.shared.coordinator.stop_speaking();
        }

        if let Some(session) = active.take() {
            session.cancel.cancel();
            if let Err(e) = session.task.await {
                log::error!("Session task failed: {}", e);
            }
            actions.push("session reset");
        }

        if let Some(listen) = listening.take() {
            listen.cancel.cancel();
            listen.transcriber.abort();
            if let Err(e) = listen.task.await {
                log::error!("Listen task failed: {}", e);
            }
            actions.push("listening stopped");
        }
        self.shared.result.send_replace(None);

        if actions.is_empty() {
            "already idle".to_string()
        } else {
            format!("Interrupted: {}", actions.join(", "))
        }
    }
}

impl Drop for VoiceService {
    fn drop(&mut self) {
        if let Some(session) = self.active.get_mut().take() {
            session.cancel.cancel();
        }
        if let Some(listen) = self.listening.get_mut().take() {
            listen.cancel.cancel();
            listen.transcriber.abort();
        }
    }
}

fn status_of(state: &PttState) -> SessionStatus {
    match state {
        PttState::Idle => SessionStatus::Inactive,
        PttState::Listening => SessionStatus::Ready,
        PttState::Recording { .. } => SessionStatus::Recording,
    }
}

/// Single writer for one session: owns the PTT state, the recorder and the hook.
struct SessionLoop {
    state: PttState,
    detector: ComboDetector,
    recorder: Recorder,
    hook: Option<HookHandle>,
    auto_stop: bool,
    barge_in: bool,
    max_recording: Duration,
    shared: Arc<Shared>,
    auto_start: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl SessionLoop {
    async fn run(
        mut self,
        mut keys: UnboundedReceiver<KeyEvent>,
        mut vad: UnboundedReceiver<VadSignal>,
        mut commands: UnboundedReceiver<Command>,
    ) {
        log::info!("Session loop started");

        let cancel = self.cancel.clone();
        let mut tick = tokio::time::interval(LOOP_TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    self.dispatch(PttEvent::Deactivate { discard: true }).await;
                    break;
                }

                Some(command) = commands.recv() => match command {
                    Command::AutoStart => {
                        self.dispatch(PttEvent::AutoStart).await;
                    }
                    Command::Deactivate { discard, reply } => {
                        let outcome = self.dispatch(PttEvent::Deactivate { discard }).await;
                        let _ = reply.send(outcome);
                        break;
                    }
                },

                Some(event) = keys.recv() => {
                    if self.detector.process_key(event.key, event.value) {
                        log::info!("Hotkey triggered: {}", self.detector.combo());
                        self.dispatch(PttEvent::Trigger).await;
                    }
                }

                Some(signal) = vad.recv() => self.on_vad(signal).await,

                _ = tick.tick() => {
                    self.dispatch(PttEvent::Tick {
                        now: Instant::now(),
                        max_recording: self.max_recording,
                    })
                    .await;
                }
            }
        }

        // Deactivate already ran; make sure nothing outlives the loop
        self.cancel.cancel();
        drop(self.hook.take());
        self.shared.coordinator.stop_listening();
        self.shared.publish(SessionStatus::Inactive);
        log::info!("Session loop ended");
    }

    async fn dispatch(&mut self, event: PttEvent) -> Option<Result<StopOutcome, SessionError>> {
        let (next, effects) = reduce(&self.state, event);
        if std::mem::discriminant(&self.state) != std::mem::discriminant(&next) {
            log::info!("PTT transition: {:?} -> {:?}", self.state, next);
        }
        self.state = next;

        let mut outcome = None;
        for effect in effects {
            match effect {
                PttEffect::StartRecording { recording_id } => {
                    self.start_recording(recording_id).await
                }
                PttEffect::StopRecording {
                    recording_id,
                    reason,
                } => outcome = Some(self.stop_recording(recording_id, reason).await),
                PttEffect::ReleaseHook => {
                    self.auto_start.store(false, Ordering::SeqCst);
                    drop(self.hook.take());
                    self.detector.reset();
                }
                PttEffect::EmitStatus => self.shared.publish(status_of(&self.state)),
            }
        }
        outcome
    }

    async fn start_recording(&mut self, recording_id: Uuid) {
        match self.recorder.start(recording_id).await {
            Ok(()) => {
                self.shared.coordinator.start_listening();
            }
            Err(e) => {
                log::error!("Failed to start recording: {}", e);
                let (next, _) = reduce(&self.state, PttEvent::StartFailed { recording_id });
                self.state = next;
            }
        }
    }

    async fn stop_recording(
        &mut self,
        recording_id: Uuid,
        reason: StopReason,
    ) -> Result<StopOutcome, SessionError> {
        log::info!("Stopping recording {} ({})", recording_id, reason.as_str());
        let session = self.recorder.release();
        self.shared.coordinator.stop_listening();

        if !reason.transcribes() {
            log::info!("Recording {} discarded", recording_id);
            return Ok(StopOutcome::Discarded);
        }

        self.shared.publish(SessionStatus::Transcribing);
        let cancel = self.cancel.clone();
        let result = tokio::select! {
            result = self.recorder.transcribe(recording_id, session) => result,
            _ = cancel.cancelled() => {
                log::info!("Transcription of {} abandoned", recording_id);
                Ok(StopOutcome::Discarded)
            }
        };

        match &result {
            Ok(StopOutcome::Transcribed(r)) => self.shared.deliver(r),
            Ok(StopOutcome::NoAudio) => log::info!("Recording {} had no audio", recording_id),
            Ok(StopOutcome::Discarded) => {}
            Err(e) => log::error!("Transcription failed: {}", e),
        }
        result
    }

    async fn on_vad(&mut self, signal: VadSignal) {
        if self.state.recording_id() != Some(signal.recording_id) {
            log::trace!("Ignoring VAD event for stale recording {}", signal.recording_id);
            return;
        }
        match signal.event {
            SpeechEvent::Started => {
                if self.barge_in {
                    self.shared.barge_in();
                }
            }
            SpeechEvent::Ended => {
                if self.auto_stop {
                    log::info!("Silence detected, auto-stopping");
                    self.dispatch(PttEvent::ForceStop {
                        recording_id: signal.recording_id,
                    })
                    .await;
                }
            }
        }
    }
}
