//! Background VAD thread for one recording.
//!
//! Frames arrive from the capture tap; speech events leave over a tokio
//! channel tagged with the recording they belong to, so the session loop can
//! drop events from a recording that has already ended.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use super::detector::{SpeechBoundaryDetector, SpeechEvent, VadConfig};
use super::{ClassifierFactory, VadError};
use crate::audio::AudioFrame;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VadSignal {
    pub recording_id: Uuid,
    pub event: SpeechEvent,
}

pub struct VadWorker {
    recording_id: Uuid,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl VadWorker {
    /// Start the worker. The classifier is built on the worker thread and a
    /// construction failure is returned here, before any audio is consumed.
    pub fn spawn(
        recording_id: Uuid,
        factory: ClassifierFactory,
        config: VadConfig,
        frames: Receiver<AudioFrame>,
        events: UnboundedSender<VadSignal>,
        tick: Duration,
    ) -> Result<Self, VadError> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let (ready_tx, ready_rx) = mpsc::sync_channel::<Result<&'static str, VadError>>(1);

        let thread = std::thread::Builder::new()
            .name("talkback-vad".into())
            .spawn(move || {
                let classifier = match factory() {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(classifier.name()));
                let mut detector = SpeechBoundaryDetector::new(classifier, config);
                run(recording_id, &mut detector, frames, events, tick, &stop_flag);
            })
            .map_err(|e| VadError::InitError(format!("Failed to spawn VAD thread: {}", e)))?;

        match ready_rx.recv() {
            Ok(Ok(name)) => {
                log::info!("VAD worker started for {} ({})", recording_id, name);
                Ok(Self {
                    recording_id,
                    stop,
                    thread: Some(thread),
                })
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(VadError::InitError("VAD thread exited during startup".into()))
            }
        }
    }

    pub fn recording_id(&self) -> Uuid {
        self.recording_id
    }

    /// Signal the thread to stop and join it off the async runtime when one is
    /// running. Events it emits before exiting still carry its recording id.
    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        let Some(thread) = self.thread.take() else {
            return;
        };
        let recording_id = self.recording_id;
        let join = move || {
            if thread.join().is_err() {
                log::error!("VAD thread panicked");
            }
            log::debug!("VAD worker stopped for {}", recording_id);
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => drop(handle.spawn_blocking(join)),
            Err(_) => join(),
        }
    }

    /// Stop the thread and wait for it. Safe to call more than once.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("VAD thread panicked");
            }
            log::debug!("VAD worker stopped for {}", self.recording_id);
        }
    }
}

impl Drop for VadWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(
    recording_id: Uuid,
    detector: &mut SpeechBoundaryDetector,
    frames: Receiver<AudioFrame>,
    events: UnboundedSender<VadSignal>,
    tick: Duration,
    stop: &AtomicBool,
) {
    let emit = |event: SpeechEvent| {
        log::debug!("VAD {:?} for {}", event, recording_id);
        events
            .send(VadSignal {
                recording_id,
                event,
            })
            .is_ok()
    };

    while !stop.load(Ordering::SeqCst) {
        match frames.recv_timeout(tick) {
            Ok(frame) => match detector.process(&frame, Instant::now()) {
                Ok(evs) => {
                    if !evs.into_iter().all(&emit) {
                        break;
                    }
                }
                Err(e) => log::warn!("VAD frame skipped: {}", e),
            },
            Err(RecvTimeoutError::Timeout) => {
                if let Some(ev) = detector.poll(Instant::now()) {
                    if !emit(ev) {
                        break;
                    }
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vad::SpeechClassifier;

    struct Energy;

    impl SpeechClassifier for Energy {
        fn frame_len(&self) -> usize {
            160
        }
        fn speech_probability(&mut self, window: &[f32]) -> Result<f32, VadError> {
            let peak = window.iter().fold(0.0f32, |m, s| m.max(s.abs()));
            Ok(if peak > 0.1 { 1.0 } else { 0.0 })
        }
        fn reset(&mut self) {}
        fn name(&self) -> &'static str {
            "energy"
        }
    }

    fn config() -> VadConfig {
        VadConfig {
            threshold: 0.5,
            min_speech_frames: 1,
            silence_duration: Duration::from_millis(100),
            sample_rate: 16_000,
        }
    }

    #[test]
    fn factory_error_surfaces_from_spawn() {
        let factory: ClassifierFactory =
            Arc::new(|| Err(VadError::BackendUnavailable("no model".into())));
        let (_tx, rx) = mpsc::sync_channel(4);
        let (ev_tx, _ev_rx) = tokio::sync::mpsc::unbounded_channel();
        let err = VadWorker::spawn(
            Uuid::new_v4(),
            factory,
            config(),
            rx,
            ev_tx,
            Duration::from_millis(10),
        )
        .err()
        .unwrap();
        assert!(matches!(err, VadError::BackendUnavailable(_)));
    }

    #[test]
    fn emits_start_then_end_on_tick() {
        let factory: ClassifierFactory = Arc::new(|| Ok(Box::new(Energy)));
        let (tx, rx) = mpsc::sync_channel(16);
        let (ev_tx, mut ev_rx) = tokio::sync::mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        let mut worker =
            VadWorker::spawn(id, factory, config(), rx, ev_tx, Duration::from_millis(10))
                .unwrap();

        tx.send(vec![0.5; 160]).unwrap();
        tx.send(vec![0.0; 160]).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut seen = Vec::new();
        while seen.len() < 2 && Instant::now() < deadline {
            match ev_rx.try_recv() {
                Ok(sig) => seen.push(sig),
                Err(_) => std::thread::sleep(Duration::from_millis(5)),
            }
        }
        worker.stop();

        assert_eq!(
            seen,
            vec![
                VadSignal {
                    recording_id: id,
                    event: SpeechEvent::Started
                },
                VadSignal {
                    recording_id: id,
                    event: SpeechEvent::Ended
                },
            ]
        );
    }

    #[tokio::test]
    async fn shutdown_returns_without_waiting_for_the_thread() {
        let factory: ClassifierFactory = Arc::new(|| Ok(Box::new(Energy)));
        let (tx, rx) = mpsc::sync_channel(16);
        let (ev_tx, _ev_rx) = tokio::sync::mpsc::unbounded_channel();
        let worker = VadWorker::spawn(
            Uuid::new_v4(),
            factory,
            config(),
            rx,
            ev_tx,
            Duration::from_millis(500),
        )
        .unwrap();

        let started = Instant::now();
        worker.shutdown();
        assert!(started.elapsed() < Duration::from_millis(100));
        drop(tx);
    }
}
