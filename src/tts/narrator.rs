//! Narrator - FIFO speech queue for one TTS engine.
//!
//! A single worker task speaks queued items in order. While an item plays,
//! the worker polls the stop-speaking signal; when it fires, the queue is
//! flushed, playback is aborted and barge-in-ack is raised. When the queue
//! drains after speaking normally, tts-complete is raised so the recorder
//! side can re-arm the microphone.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;

use super::{PlaybackEnd, TtsEngine};
use crate::signal::{SignalBus, SignalKind};

const PREVIEW_CHARS: usize = 50;

struct QueueItem {
    text: String,
    voice: Option<String>,
    speed: f32,
    done: Option<oneshot::Sender<PlaybackEnd>>,
}

#[derive(Default)]
struct NarratorState {
    queue: VecDeque<QueueItem>,
    current: Option<CancellationToken>,
    /// Set by a halt; a narration that was cut short does not raise tts-complete.
    halted: bool,
}

struct Inner {
    engine: Arc<dyn TtsEngine>,
    bus: SignalBus,
    poll_interval: Duration,
    state: Mutex<NarratorState>,
    wake: Notify,
    shutdown: CancellationToken,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, NarratorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Flush the queue and abort the current item. Returns (cleared, was_playing).
    fn halt(&self) -> (usize, bool) {
        let mut state = self.lock();
        let cleared = state.queue.len();
        state.queue.clear();
        state.halted = true;
        let was_playing = match state.current.take() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        };
        (cleared, was_playing)
    }
}

/// Handle to the speech queue. Cheap to clone.
#[derive(Clone)]
pub struct Narrator {
    inner: Arc<Inner>,
}

pub(crate) fn preview(text: &str) -> String {
    if text.chars().count() > PREVIEW_CHARS {
        let head: String = text.chars().take(PREVIEW_CHARS).collect();
        format!("{}...", head)
    } else {
        text.to_string()
    }
}

impl Narrator {
    /// Start the worker. Must be called inside a tokio runtime.
    pub fn start(engine: Arc<dyn TtsEngine>, bus: SignalBus, poll_interval: Duration) -> Self {
        let inner = Arc::new(Inner {
            engine,
            bus,
            poll_interval: poll_interval.max(Duration::from_millis(1)),
            state: Mutex::new(NarratorState::default()),
            wake: Notify::new(),
            shutdown: CancellationToken::new(),
        });
        // A stale stop request from a previous run must not eat our first item
        inner.bus.clear(SignalKind::StopSpeaking);
        log::info!("Narrator started with engine {}", inner.engine.name());
        tokio::spawn(run_worker(inner.clone()));
        Self { inner }
    }

    fn enqueue(&self, text: &str, voice: Option<&str>, speed: f32) -> oneshot::Receiver<PlaybackEnd> {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().queue.push_back(QueueItem {
            text: text.to_string(),
            voice: voice.map(str::to_string),
            speed,
            done: Some(tx),
        });
        self.inner.wake.notify_one();
        rx
    }

    /// Queue `text` and return immediately.
    pub fn speak(&self, text: &str, voice: Option<&str>, speed: f32) -> String {
        drop(self.enqueue(text, voice, speed));
        format!("Added to queue: {}", preview(text))
    }

    /// Queue `text` and wait until it has been spoken or dropped.
    pub async fn speak_and_wait(&self, text: &str, voice: Option<&str>, speed: f32) -> String {
        match self.enqueue(text, voice, speed).await {
            Ok(PlaybackEnd::Finished) => "Speech completed".to_string(),
            Ok(PlaybackEnd::Aborted) | Err(_) => "Speech stopped".to_string(),
        }
    }

    /// Abort the current item and clear the queue.
    pub fn stop_speaking(&self) -> String {
        let (cleared, was_playing) = self.inner.halt();
        if was_playing {
            format!("Stopped. {} message(s) cleared from queue.", cleared)
        } else {
            format!("Nothing playing. {} message(s) cleared from queue.", cleared)
        }
    }

    /// Abort only the current item.
    pub fn skip(&self) -> String {
        match self.inner.lock().current.take() {
            Some(token) => {
                token.cancel();
                "Current message skipped, moving to next.".to_string()
            }
            None => "No message currently playing.".to_string(),
        }
    }

    pub fn is_speaking(&self) -> bool {
        self.inner.lock().current.is_some()
    }

    pub fn queue_len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn queue_status(&self) -> String {
        let state = self.inner.lock();
        let status = if state.current.is_some() {
            "Speaking"
        } else {
            "Silent"
        };
        format!("Status: {}\nMessages in queue: {}", status, state.queue.len())
    }

    /// Stop the worker after aborting any playback.
    pub fn shutdown(&self) {
        self.inner.halt();
        self.inner.shutdown.cancel();
    }
}

fn honor_stop(inner: &Inner) {
    let (cleared, was_playing) = inner.halt();
    log::info!(
        "Stop-speaking received (playing={}, cleared {} queued)",
        was_playing,
        cleared
    );
    if let Err(e) = inner.bus.signal(SignalKind::BargeInAck) {
        log::error!("Failed to signal barge-in-ack: {}", e);
    }
}

async fn run_worker(inner: Arc<Inner>) {
    let mut spoke_since_drain = false;

    loop {
        if inner.bus.check_and_clear(SignalKind::StopSpeaking) {
            honor_stop(&inner);
            spoke_since_drain = false;
        }

        let next = {
            let mut state = inner.lock();
            match state.queue.pop_front() {
                Some(item) => {
                    let token = CancellationToken::new();
                    state.current = Some(token.clone());
                    state.halted = false;
                    Some((item, token))
                }
                None => None,
            }
        };

        let Some((mut item, token)) = next else {
            if spoke_since_drain {
                spoke_since_drain = false;
                log::debug!("Queue drained, signalling tts-complete");
                if let Err(e) = inner.bus.signal(SignalKind::TtsComplete) {
                    log::error!("Failed to signal tts-complete: {}", e);
                }
            }
            tokio::select! {
                _ = inner.shutdown.cancelled() => break,
                _ = inner.wake.notified() => {}
                _ = tokio::time::sleep(inner.poll_interval) => {}
            }
            continue;
        };

        log::debug!("Speaking: {}", preview(&item.text));
        let result = {
            let speak = inner.engine.speak(
                &item.text,
                item.voice.as_deref(),
                item.speed,
                token.clone(),
            );
            tokio::pin!(speak);
            loop {
                tokio::select! {
                    result = &mut speak => break result,
                    _ = tokio::time::sleep(inner.poll_interval) => {
                        if inner.bus.check_and_clear(SignalKind::StopSpeaking) {
                            honor_stop(&inner);
                        }
                    }
                }
            }
        };

        let end = result.unwrap_or_else(|e| {
            log::error!("TTS failed: {}", e);
            PlaybackEnd::Aborted
        });

        let halted = {
            let mut state = inner.lock();
            state.current = None;
            state.halted
        };
        spoke_since_drain = !halted;

        if let Some(done) = item.done.take() {
            let _ = done.send(end);
        }

        if inner.shutdown.is_cancelled() {
            break;
        }
    }

    log::info!("Narrator worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::tts::TtsError;

    /// Plays for a fixed time unless cancelled.
    struct Timed {
        duration: Duration,
        spoken: AtomicUsize,
    }

    #[async_trait]
    impl TtsEngine for Timed {
        async fn speak(
            &self,
            _text: &str,
            _voice: Option<&str>,
            _speed: f32,
            cancel: CancellationToken,
        ) -> Result<PlaybackEnd, TtsError> {
            tokio::select! {
                _ = tokio::time::sleep(self.duration) => {
                    self.spoken.fetch_add(1, Ordering::SeqCst);
                    Ok(PlaybackEnd::Finished)
                }
                _ = cancel.cancelled() => Ok(PlaybackEnd::Aborted),
            }
        }
        fn name(&self) -> &str {
            "timed"
        }
    }

    fn narrator(play: Duration) -> (tempfile::TempDir, Narrator, Arc<Timed>, SignalBus) {
        let dir = tempfile::tempdir().unwrap();
        let bus = SignalBus::new(dir.path(), Duration::from_millis(5));
        let engine = Arc::new(Timed {
            duration: play,
            spoken: AtomicUsize::new(0),
        });
        let narrator = Narrator::start(engine.clone(), bus.clone(), Duration::from_millis(5));
        (dir, narrator, engine, bus)
    }

    #[test]
    fn preview_truncates_long_text() {
        assert_eq!(preview("short"), "short");
        let long = "x".repeat(60);
        assert_eq!(preview(&long), format!("{}...", "x".repeat(50)));
    }

    #[tokio::test]
    async fn speak_and_wait_signals_tts_complete() {
        let (_dir, narrator, engine, bus) = narrator(Duration::from_millis(20));
        assert_eq!(
            narrator.speak_and_wait("hello", None, 1.0).await,
            "Speech completed"
        );
        assert_eq!(engine.spoken.load(Ordering::SeqCst), 1);
        assert!(bus.wait(SignalKind::TtsComplete, Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn speak_returns_queue_message() {
        let (_dir, narrator, _engine, _bus) = narrator(Duration::from_millis(20));
        assert_eq!(narrator.speak("hi there", None, 1.0), "Added to queue: hi there");
        narrator.shutdown();
    }

    #[tokio::test]
    async fn stop_speaking_clears_queue() {
        let (_dir, narrator, _engine, bus) = narrator(Duration::from_secs(30));
        narrator.speak("one", None, 1.0);
        narrator.speak("two", None, 1.0);
        narrator.speak("three", None, 1.0);

        for _ in 0..200 {
            if narrator.is_speaking() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(
            narrator.stop_speaking(),
            "Stopped. 2 message(s) cleared from queue."
        );
        assert_eq!(
            narrator.stop_speaking(),
            "Nothing playing. 0 message(s) cleared from queue."
        );

        // A halted narration does not report completion
        assert!(!bus.wait(SignalKind::TtsComplete, Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn stop_signal_from_other_process_is_honored_and_acked() {
        let (_dir, narrator, _engine, bus) = narrator(Duration::from_secs(30));
        let waiter = {
            let narrator = narrator.clone();
            tokio::spawn(async move { narrator.speak_and_wait("long story", None, 1.0).await })
        };
        for _ in 0..200 {
            if narrator.is_speaking() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        bus.signal(SignalKind::StopSpeaking).unwrap();
        assert!(bus.wait(SignalKind::BargeInAck, Duration::from_secs(2)).await);
        assert_eq!(waiter.await.unwrap(), "Speech stopped");
        assert!(!bus.is_set(SignalKind::StopSpeaking));
        assert!(!narrator.is_speaking());
    }

    #[tokio::test]
    async fn barge_in_waits_for_the_narrator_ack() {
        let (_dir, narrator, _engine, bus) = narrator(Duration::from_secs(30));
        let coordinator = crate::coordinator::VoiceCoordinator::new(bus.clone());
        narrator.speak("long story", None, 1.0);
        for _ in 0..200 {
            if narrator.is_speaking() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        coordinator.start_speaking();
        // Left over from an earlier stop
        bus.signal(SignalKind::BargeInAck).unwrap();

        assert!(coordinator.barge_in(Duration::from_secs(2)).await);
        assert!(!bus.is_set(SignalKind::BargeInAck));
        assert!(!bus.is_set(SignalKind::StopSpeaking));
        assert!(!narrator.is_speaking());
        narrator.shutdown();
    }

    #[tokio::test]
    async fn skip_moves_to_next_item() {
        let (_dir, narrator, engine, bus) = narrator(Duration::from_millis(200));
        narrator.speak("first", None, 1.0);
        narrator.speak("second", None, 1.0);
        for _ in 0..200 {
            if narrator.is_speaking() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(narrator.skip(), "Current message skipped, moving to next.");

        // Skipping is not a halt: the drain after "second" still completes
        assert!(bus.wait(SignalKind::TtsComplete, Duration::from_secs(2)).await);
        assert_eq!(engine.spoken.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn status_reports_queue() {
        let (_dir, narrator, _engine, _bus) = narrator(Duration::from_secs(30));
        assert_eq!(narrator.queue_status(), "Status: Silent\nMessages in queue: 0");
        assert_eq!(narrator.skip(), "No message currently playing.");
        narrator.shutdown();
    }
}
