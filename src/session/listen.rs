//! Continuous listening: the microphone stays open and every utterance the
//! VAD brackets is queued for transcription, in order, while capture goes on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::controller::Shared;
use super::recorder::{Finisher, Recorder};
use super::{SessionStatus, StopOutcome};
use crate::audio::SAMPLE_RATE;
use crate::vad::{SpeechEvent, VadSignal};

/// Silence that ends an utterance when the caller gives none.
pub const LISTEN_SILENCE_MS: u64 = 2000;

/// Audio kept from before the VAD confirmed speech, so onsets survive.
const PRE_ROLL: Duration = Duration::from_millis(500);

pub(super) enum ListenCommand {
    /// Hand over everything buffered so far.
    TakeBuffer { reply: oneshot::Sender<Vec<f32>> },
}

/// One finished utterance waiting for the engine.
pub(super) struct Segment {
    pub id: Uuid,
    pub samples: Vec<f32>,
}

pub(super) struct ListenLoop {
    pub recorder: Recorder,
    pub recording_id: Uuid,
    pub shared: Arc<Shared>,
    pub speech: Arc<AtomicBool>,
    pub segments: UnboundedSender<Segment>,
    pub cancel: CancellationToken,
    pub onset: Vec<f32>,
}

impl ListenLoop {
    pub async fn run(
        mut self,
        mut vad: UnboundedReceiver<VadSignal>,
        mut commands: UnboundedReceiver<ListenCommand>,
    ) {
        log::info!("Listen loop started");
        let cancel = self.cancel.clone();

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                Some(command) = commands.recv() => match command {
                    ListenCommand::TakeBuffer { reply } => {
                        let _ = reply.send(self.take_pending());
                    }
                },

                Some(signal) = vad.recv() => self.on_vad(signal),
            }
        }

        // An utterance still open at stop is dropped
        drop(self.recorder.release());
        self.speech.store(false, Ordering::SeqCst);
        self.shared.coordinator.stop_listening();
        self.shared.publish(SessionStatus::Inactive);
        log::info!("Listen loop ended");
    }

    fn take_pending(&mut self) -> Vec<f32> {
        let mut samples = std::mem::take(&mut self.onset);
        samples.extend(self.recorder.take_buffer().into_samples());
        samples
    }

    fn on_vad(&mut self, signal: VadSignal) {
        if signal.recording_id != self.recording_id {
            log::trace!("Ignoring VAD event for stale recording {}", signal.recording_id);
            return;
        }
        match signal.event {
            SpeechEvent::Started => {
                let buffered = self.recorder.take_buffer().into_samples();
                let keep = buffered.len().min(pre_roll_samples());
                self.onset = buffered[buffered.len() - keep..].to_vec();
                self.speech.store(true, Ordering::SeqCst);
                self.shared.publish(SessionStatus::Recording);
                self.shared.barge_in();
            }
            SpeechEvent::Ended => {
                self.speech.store(false, Ordering::SeqCst);
                let samples = self.take_pending();
                let id = Uuid::new_v4();
                log::info!(
                    "Utterance {} ended: {:.1}s",
                    id,
                    samples.len() as f32 / SAMPLE_RATE as f32
                );
                if self.segments.send(Segment { id, samples }).is_err() {
                    log::warn!("Transcription queue closed, utterance {} dropped", id);
                }
                self.shared.publish(SessionStatus::Ready);
            }
        }
    }
}

fn pre_roll_samples() -> usize {
    (SAMPLE_RATE as u128 * PRE_ROLL.as_millis() / 1000) as usize
}

/// Transcribe queued utterances one at a time until the queue closes.
pub(super) async fn transcribe_segments(
    finisher: Finisher,
    shared: Arc<Shared>,
    mut segments: UnboundedReceiver<Segment>,
) {
    while let Some(segment) = segments.recv().await {
        match finisher.finish_samples(segment.id, segment.samples).await {
            Ok(StopOutcome::Transcribed(result)) => shared.deliver(&result),
            Ok(_) => log::debug!("Utterance {} had no audio", segment.id),
            Err(e) => log::error!("Transcription of utterance {} failed: {}", segment.id, e),
        }
    }
    log::debug!("Transcription queue drained");
}
