//! One microphone, one recording at a time.
//!
//! Stop order: stop the VAD worker, flip the running flag, snapshot the
//! buffer, release the hardware. Only then is anything slow attempted, by the
//! [`Finisher`]: persisting the WAV, engine selection, transcription, the
//! ready hook.

use std::path::PathBuf;
use std::sync::mpsc::sync_channel;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use super::{call_hook, ReadyHook, SessionError, StopOutcome};
use crate::audio::{
    cleanup_old_recordings, generate_wav_path, write_wav, AudioDevice, AudioSession,
    InputBackend, SAMPLE_RATE,
};
use crate::transcription::TranscriberSet;
use crate::vad::{ClassifierFactory, VadConfig, VadError, VadSignal, VadWorker};

/// Chunks the VAD worker may lag behind before the tap starts dropping.
const TAP_CAPACITY: usize = 256;

/// Everything needed to start a VAD worker per recording.
#[derive(Clone)]
pub struct VadSetup {
    pub factory: ClassifierFactory,
    pub config: VadConfig,
    pub tick: Duration,
}

#[derive(Debug, Clone)]
pub struct RecorderConfig {
    pub max_buffered_frames: usize,
    /// Where diagnostics WAVs go; None disables persisting.
    pub recordings_dir: Option<PathBuf>,
    pub keep_recordings: usize,
}

/// Turns released audio into a transcription. Cloneable so finished
/// segments can be handled off the task that owns the microphone.
#[derive(Clone)]
pub struct Finisher {
    transcribers: TranscriberSet,
    recordings_dir: Option<PathBuf>,
    keep_recordings: usize,
    on_ready: Option<ReadyHook>,
}

impl Finisher {
    pub fn new(config: &RecorderConfig, transcribers: TranscriberSet, on_ready: Option<ReadyHook>) -> Self {
        Self {
            transcribers,
            recordings_dir: config.recordings_dir.clone(),
            keep_recordings: config.keep_recordings,
            on_ready,
        }
    }

    pub async fn finish(
        &self,
        recording_id: Uuid,
        session: AudioSession,
    ) -> Result<StopOutcome, SessionError> {
        self.finish_samples(recording_id, session.into_samples()).await
    }

    /// Persist, then transcribe. The WAV is on disk even when the engine fails.
    pub async fn finish_samples(
        &self,
        recording_id: Uuid,
        samples: Vec<f32>,
    ) -> Result<StopOutcome, SessionError> {
        if samples.is_empty() {
            log::info!("Recording {}: no audio captured, skipping transcription", recording_id);
            return Ok(StopOutcome::NoAudio);
        }

        let samples: Arc<[f32]> = samples.into();
        if let Some(dir) = self.recordings_dir.clone() {
            let keep = self.keep_recordings;
            let audio = samples.clone();
            let persisted =
                tokio::task::spawn_blocking(move || persist(&dir, recording_id, &audio, keep)).await;
            match persisted {
                Ok(Ok(path)) => log::debug!("Saved recording to {:?}", path),
                Ok(Err(e)) => log::warn!("Failed to save recording: {}", e),
                Err(e) => log::warn!("Recording save task failed: {}", e),
            }
        }

        let engine = self.transcribers.select()?;
        let result = engine.transcribe(&samples, SAMPLE_RATE).await?;

        if let Some(hook) = &self.on_ready {
            call_hook("on_ready", || hook(&result));
        }
        Ok(StopOutcome::Transcribed(result))
    }
}

pub struct Recorder {
    backend: Arc<dyn InputBackend>,
    device: Option<AudioDevice>,
    max_buffered_frames: usize,
    finisher: Finisher,
    vad: Option<VadSetup>,
    vad_events: UnboundedSender<VadSignal>,
    worker: Option<VadWorker>,
    active: Option<Uuid>,
}

impl Recorder {
    pub fn new(
        backend: Arc<dyn InputBackend>,
        config: RecorderConfig,
        transcribers: TranscriberSet,
        vad: Option<VadSetup>,
        vad_events: UnboundedSender<VadSignal>,
        on_ready: Option<ReadyHook>,
    ) -> Self {
        Self {
            backend,
            device: None,
            max_buffered_frames: config.max_buffered_frames,
            finisher: Finisher::new(&config, transcribers, on_ready),
            vad,
            vad_events,
            worker: None,
            active: None,
        }
    }

    pub fn active_recording(&self) -> Option<Uuid> {
        self.active
    }

    pub fn has_vad(&self) -> bool {
        self.vad.is_some()
    }

    pub fn device_name(&self) -> Option<String> {
        self.backend.device_name()
    }

    pub fn finisher(&self) -> Finisher {
        self.finisher.clone()
    }

    /// Whether the microphone is currently held.
    pub fn is_capturing(&self) -> bool {
        self.device.as_ref().map(|d| d.is_running()).unwrap_or(false)
    }

    /// Open the microphone for `recording_id`, with a fresh buffer. The VAD
    /// classifier is built on a blocking thread so model loading never stalls
    /// the runtime.
    pub async fn start(&mut self, recording_id: Uuid) -> Result<(), SessionError> {
        if self.active.is_some() {
            log::warn!("Recorder: start while recording, releasing previous capture first");
            drop(self.release());
        }

        let mut tap = None;
        if let Some(setup) = self.vad.clone() {
            let (tap_tx, tap_rx) = sync_channel(TAP_CAPACITY);
            let events = self.vad_events.clone();
            let spawned = tokio::task::spawn_blocking(move || {
                VadWorker::spawn(
                    recording_id,
                    setup.factory,
                    setup.config,
                    tap_rx,
                    events,
                    setup.tick,
                )
            })
            .await
            .unwrap_or_else(|e| Err(VadError::InitError(format!("VAD startup task failed: {}", e))));
            match spawned {
                Ok(worker) => {
                    tap = Some(tap_tx);
                    self.worker = Some(worker);
                }
                Err(e) => {
                    log::warn!(
                        "No VAD backend available ({}); auto-stop and barge-in disabled",
                        e
                    );
                    self.vad = None;
                }
            }
        }

        let max_frames = self.max_buffered_frames;
        let backend = self.backend.clone();
        let device = self
            .device
            .get_or_insert_with(|| AudioDevice::new(backend, max_frames));
        device.clear_buffer();
        device.set_tap(tap);

        if let Err(e) = device.start() {
            device.set_tap(None);
            if let Some(worker) = self.worker.take() {
                worker.shutdown();
            }
            return Err(e.into());
        }

        self.active = Some(recording_id);
        log::info!("Recording {} started", recording_id);
        Ok(())
    }

    /// Take what has been captured so far without stopping the microphone.
    pub fn take_buffer(&self) -> AudioSession {
        self.device
            .as_ref()
            .map(|d| d.get_and_clear_buffer())
            .unwrap_or_default()
    }

    /// Stop capture and release the microphone, returning what was captured.
    /// Safe to call when nothing is recording.
    pub fn release(&mut self) -> AudioSession {
        if let Some(worker) = self.worker.take() {
            worker.shutdown();
        }
        let id = self.active.take();

        let Some(device) = self.device.as_mut() else {
            return AudioSession::default();
        };
        device.set_tap(None);
        let (session, released) = device.finish();
        if let Err(e) = released {
            log::warn!("Microphone release reported an error: {}", e);
        }
        if let Some(id) = id {
            log::info!(
                "Recording {} stopped: {:.1}s captured",
                id,
                session.duration_secs()
            );
        }
        session
    }

    /// Transcribe a released capture. The microphone is not touched here.
    pub async fn transcribe(
        &self,
        recording_id: Uuid,
        session: AudioSession,
    ) -> Result<StopOutcome, SessionError> {
        self.finisher.finish(recording_id, session).await
    }

    /// `release` then, unless discarding, `transcribe`.
    pub async fn stop(&mut self, transcribe: bool) -> Result<StopOutcome, SessionError> {
        let id = self.active.unwrap_or_else(Uuid::nil);
        let session = self.release();
        if !transcribe {
            return Ok(StopOutcome::Discarded);
        }
        self.transcribe(id, session).await
    }
}

impl Drop for Recorder {
    fn drop(&mut self) {
        if self.active.is_some() {
            drop(self.release());
        }
    }
}

fn persist(
    dir: &std::path::Path,
    recording_id: Uuid,
    samples: &[f32],
    keep: usize,
) -> Result<PathBuf, String> {
    let path = generate_wav_path(dir, recording_id).map_err(|e| e.to_string())?;
    write_wav(&path, samples).map_err(|e| e.to_string())?;
    match cleanup_old_recordings(dir, keep) {
        Ok(0) => {}
        Ok(n) => log::debug!("Removed {} old recording(s)", n),
        Err(e) => log::warn!("Recording cleanup failed: {}", e),
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{AudioError, CaptureShared, InputStream};
    use crate::transcription::{Transcriber, TranscriptionError, TranscriptionResult};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Pushes `frames` once on open.
    struct Burst {
        frames: usize,
        fail: AtomicBool,
    }

    struct Closed;

    impl InputStream for Closed {
        fn close(self: Box<Self>) -> Result<(), AudioError> {
            Ok(())
        }
    }

    impl InputBackend for Burst {
        fn open(&self, shared: Arc<CaptureShared>) -> Result<Box<dyn InputStream>, AudioError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(AudioError::NoInputDevice);
            }
            for _ in 0..self.frames {
                shared.push(vec![0.25; 512]);
            }
            Ok(Box::new(Closed))
        }
    }

    struct Stub {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Transcriber for Stub {
        async fn transcribe(
            &self,
            samples: &[f32],
            sample_rate: u32,
        ) -> Result<TranscriptionResult, TranscriptionError> {
            assert_eq!(sample_rate, SAMPLE_RATE);
            assert!(!samples.is_empty());
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(TranscriptionResult::new("hello world", "en", Some(0.9)))
        }
        fn name(&self) -> &str {
            "stub"
        }
    }

    fn recorder(
        frames: usize,
        transcribers: TranscriberSet,
        dir: Option<PathBuf>,
    ) -> (Recorder, Arc<Burst>) {
        let backend = Arc::new(Burst {
            frames,
            fail: AtomicBool::new(false),
        });
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let rec = Recorder::new(
            backend.clone(),
            RecorderConfig {
                max_buffered_frames: 100,
                recordings_dir: dir,
                keep_recordings: 2,
            },
            transcribers,
            None,
            tx,
            None,
        );
        (rec, backend)
    }

    #[tokio::test]
    async fn stop_transcribes_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let stub = Arc::new(Stub {
            calls: AtomicUsize::new(0),
        });
        let (mut rec, _) = recorder(
            10,
            TranscriberSet::new().with(stub.clone()),
            Some(dir.path().to_path_buf()),
        );

        rec.start(Uuid::new_v4()).await.unwrap();
        assert!(rec.is_capturing());
        let outcome = rec.stop(true).await.unwrap();

        assert!(!rec.is_capturing());
        match outcome {
            StopOutcome::Transcribed(r) => assert_eq!(r.text, "hello world"),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(stub.calls.load(Ordering::SeqCst), 1);
        let wavs = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(wavs, 1);
    }

    #[tokio::test]
    async fn empty_buffer_skips_engine() {
        let stub = Arc::new(Stub {
            calls: AtomicUsize::new(0),
        });
        let (mut rec, _) = recorder(0, TranscriberSet::new().with(stub.clone()), None);
        rec.start(Uuid::new_v4()).await.unwrap();
        assert_eq!(rec.stop(true).await.unwrap(), StopOutcome::NoAudio);
        assert_eq!(stub.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_engine_fails_after_release() {
        let (mut rec, _) = recorder(5, TranscriberSet::new(), None);
        rec.start(Uuid::new_v4()).await.unwrap();
        let err = rec.stop(true).await.err().unwrap();
        assert!(matches!(
            err,
            SessionError::Transcription(TranscriptionError::EngineUnavailable(_))
        ));
        assert!(!rec.is_capturing());
        assert_eq!(rec.active_recording(), None);
    }

    #[tokio::test]
    async fn discard_releases_without_transcribing() {
        let stub = Arc::new(Stub {
            calls: AtomicUsize::new(0),
        });
        let (mut rec, _) = recorder(5, TranscriberSet::new().with(stub.clone()), None);
        rec.start(Uuid::new_v4()).await.unwrap();
        assert_eq!(rec.stop(false).await.unwrap(), StopOutcome::Discarded);
        assert_eq!(stub.calls.load(Ordering::SeqCst), 0);
        assert!(!rec.is_capturing());
    }

    #[tokio::test]
    async fn failed_start_is_retryable() {
        let (mut rec, backend) = recorder(3, TranscriberSet::new(), None);
        backend.fail.store(true, Ordering::SeqCst);
        assert!(matches!(
            rec.start(Uuid::new_v4()).await,
            Err(SessionError::Audio(AudioError::NoInputDevice))
        ));
        assert!(!rec.is_capturing());
        assert_eq!(rec.active_recording(), None);

        backend.fail.store(false, Ordering::SeqCst);
        rec.start(Uuid::new_v4()).await.unwrap();
        assert!(rec.is_capturing());
    }

    #[tokio::test]
    async fn new_recording_starts_with_empty_buffer() {
        let (mut rec, _) = recorder(4, TranscriberSet::new(), None);
        rec.start(Uuid::new_v4()).await.unwrap();
        let first = rec.release();
        assert_eq!(first.frame_count(), 4);

        rec.start(Uuid::new_v4()).await.unwrap();
        let second = rec.release();
        assert_eq!(second.frame_count(), 4);
    }

    struct Unreachable;

    #[async_trait]
    impl Transcriber for Unreachable {
        async fn transcribe(
            &self,
            _samples: &[f32],
            _sample_rate: u32,
        ) -> Result<TranscriptionResult, TranscriptionError> {
            Err(TranscriptionError::NetworkError("connection refused".into()))
        }
        fn name(&self) -> &str {
            "unreachable"
        }
    }

    #[tokio::test]
    async fn recording_is_saved_when_engine_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (mut rec, _) = recorder(
            6,
            TranscriberSet::new().with(Arc::new(Unreachable)),
            Some(dir.path().to_path_buf()),
        );
        rec.start(Uuid::new_v4()).await.unwrap();
        let err = rec.stop(true).await.err().unwrap();
        assert!(matches!(
            err,
            SessionError::Transcription(TranscriptionError::NetworkError(_))
        ));

        let wavs: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map(|x| x == "wav").unwrap_or(false))
            .collect();
        assert_eq!(wavs.len(), 1);
        let reader = hound::WavReader::open(wavs[0].path()).unwrap();
        assert_eq!(reader.len(), 6 * 512);
    }

    struct Silent;

    impl crate::vad::SpeechClassifier for Silent {
        fn frame_len(&self) -> usize {
            512
        }
        fn speech_probability(&mut self, _window: &[f32]) -> Result<f32, VadError> {
            Ok(0.0)
        }
        fn reset(&mut self) {}
        fn name(&self) -> &'static str {
            "silent"
        }
    }

    #[tokio::test]
    async fn slow_vad_startup_does_not_stall_the_runtime() {
        let backend = Arc::new(Burst {
            frames: 0,
            fail: AtomicBool::new(false),
        });
        let factory: ClassifierFactory = Arc::new(|| {
            std::thread::sleep(Duration::from_millis(300));
            Ok(Box::new(Silent))
        });
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        let mut rec = Recorder::new(
            backend,
            RecorderConfig {
                max_buffered_frames: 100,
                recordings_dir: None,
                keep_recordings: 2,
            },
            TranscriberSet::new(),
            Some(VadSetup {
                factory,
                config: VadConfig::default(),
                tick: Duration::from_millis(10),
            }),
            tx,
            None,
        );

        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = ticks.clone();
        let ticker = tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_millis(10)).await;
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        rec.start(Uuid::new_v4()).await.unwrap();
        ticker.abort();
        assert!(rec.has_vad());
        assert!(ticks.load(Ordering::SeqCst) >= 5);
        drop(rec.release());
    }

    #[test]
    fn release_when_idle_is_harmless() {
        let (mut rec, _) = recorder(4, TranscriberSet::new(), None);
        assert!(rec.release().is_empty());
        assert!(rec.release().is_empty());
    }
}
