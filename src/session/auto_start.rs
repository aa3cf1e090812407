//! Re-arms the microphone when narration finishes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc::UnboundedSender, watch};
use tokio_util::sync::CancellationToken;

use super::SessionStatus;
use crate::signal::{SignalBus, SignalKind};

/// How long each bounded wait on tts-complete lasts before re-checking
/// cancellation.
const WAIT_SLICE: Duration = Duration::from_secs(1);

pub(crate) struct AutoStartWatcher {
    pub bus: SignalBus,
    pub echo_delay: Duration,
    pub enabled: Arc<AtomicBool>,
    pub status: watch::Receiver<SessionStatus>,
    pub cancel: CancellationToken,
}

impl AutoStartWatcher {
    /// Wait for tts-complete, sleep the echo delay, then ask for a start if
    /// auto-start is still on and nothing is recording yet.
    pub async fn run<T, F>(self, starts: UnboundedSender<T>, make: F)
    where
        T: Send + 'static,
        F: Fn() -> T + Send + 'static,
    {
        log::info!(
            "Auto-start armed (echo delay {}ms)",
            self.echo_delay.as_millis()
        );

        loop {
            let observed = tokio::select! {
                _ = self.cancel.cancelled() => break,
                observed = self.bus.wait(SignalKind::TtsComplete, WAIT_SLICE) => observed,
            };
            if !observed {
                continue;
            }

            log::debug!("Narration finished, waiting {}ms for echo", self.echo_delay.as_millis());
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(self.echo_delay) => {}
            }

            if !self.enabled.load(Ordering::SeqCst) {
                log::debug!("Auto-start disabled during echo delay");
                continue;
            }
            if *self.status.borrow() != SessionStatus::Ready {
                log::debug!("Auto-start skipped: session is {}", *self.status.borrow());
                continue;
            }

            log::info!("Auto-starting recording");
            if starts.send(make()).is_err() {
                break;
            }
        }

        log::debug!("Auto-start watcher stopped");
    }
}
