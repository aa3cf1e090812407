//! Barge-in decision layer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::signal::{SignalBus, SignalError, SignalKind};

/// How long a barge-in waits for the narrator to confirm.
pub const ACK_TIMEOUT: Duration = Duration::from_millis(500);

/// Tracks whether this side is listening and whether narration is playing,
/// and turns speech-while-speaking into an immediate stop of the TTS side.
#[derive(Debug)]
pub struct VoiceCoordinator {
    bus: SignalBus,
    listening: AtomicBool,
    speaking: AtomicBool,
}

impl VoiceCoordinator {
    pub fn new(bus: SignalBus) -> Self {
        Self {
            bus,
            listening: AtomicBool::new(false),
            speaking: AtomicBool::new(false),
        }
    }

    pub fn bus(&self) -> &SignalBus {
        &self.bus
    }

    pub fn start_listening(&self) {
        self.listening.store(true, Ordering::SeqCst);
    }

    pub fn stop_listening(&self) {
        self.listening.store(false, Ordering::SeqCst);
    }

    pub fn start_speaking(&self) {
        self.speaking.store(true, Ordering::SeqCst);
    }

    pub fn stop_speaking(&self) {
        self.speaking.store(false, Ordering::SeqCst);
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    /// Local flag, or a live playback process published by the narrator.
    pub fn is_speaking(&self) -> bool {
        self.speaking.load(Ordering::SeqCst) || self.bus.playback_active()
    }

    /// Called on every speech start, ungated by any confirmation step.
    /// Returns true if a barge-in was issued.
    pub fn on_speech_detected(&self) -> bool {
        if !self.is_speaking() {
            return false;
        }
        log::info!("Barge-in: user speech while narrating, stopping TTS");
        match self.force_stop() {
            Ok(()) => true,
            Err(e) => {
                log::error!("Barge-in signal failed: {}", e);
                false
            }
        }
    }

    /// Request a stop from the narrator and kill live playback. Any ack left
    /// over from an earlier stop is dropped first so the next ack answers
    /// this request.
    pub fn force_stop(&self) -> Result<(), SignalError> {
        self.bus.clear(SignalKind::BargeInAck);
        self.bus.force_stop_speaking()?;
        self.speaking.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Wait up to `timeout` for the narrator to confirm a stop, consuming the ack.
    pub async fn await_ack(&self, timeout: Duration) -> bool {
        if self.bus.wait(SignalKind::BargeInAck, timeout).await {
            log::debug!("Narrator acknowledged stop");
            true
        } else {
            log::warn!("Narrator did not acknowledge stop within {:?}", timeout);
            false
        }
    }

    /// `on_speech_detected`, then wait for the narrator's ack.
    /// Returns true only if a barge-in was issued and acknowledged.
    pub async fn barge_in(&self, timeout: Duration) -> bool {
        self.on_speech_detected() && self.await_ack(timeout).await
    }
}
