//! Debounced speech start/end on top of any [`SpeechClassifier`].
//!
//! Silence -> Speaking needs `min_speech_frames` consecutive speech frames.
//! Speaking -> Silence uses a single deadline: `last speech frame +
//! silence_duration`. It is armed by the first silent frame after speech,
//! cleared by any speech frame, and checked both per frame and by `poll`
//! from the owner's periodic tick. Frames are stamped with their end time.

use std::time::{Duration, Instant};

use super::{SpeechClassifier, VadError};

#[derive(Debug, Clone)]
pub struct VadConfig {
    /// Probability at or above which a frame counts as speech.
    pub threshold: f32,
    /// Consecutive speech frames required to confirm speech start.
    pub min_speech_frames: usize,
    /// Silence after the last speech frame that ends an utterance.
    pub silence_duration: Duration,
    pub sample_rate: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            min_speech_frames: 3,
            silence_duration: Duration::from_millis(1500),
            sample_rate: crate::audio::SAMPLE_RATE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechState {
    Silence,
    Speaking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpeechEvent {
    Started,
    Ended,
}

pub struct SpeechBoundaryDetector {
    classifier: Box<dyn SpeechClassifier>,
    config: VadConfig,
    pending: Vec<f32>,
    context: Vec<f32>,
    state: SpeechState,
    consecutive_speech: usize,
    last_speech_at: Option<Instant>,
    silence_deadline: Option<Instant>,
}

impl SpeechBoundaryDetector {
    pub fn new(classifier: Box<dyn SpeechClassifier>, config: VadConfig) -> Self {
        let context = vec![0.0; classifier.context_len()];
        log::info!(
            "VAD detector ({}): threshold={}, min_speech_frames={}, silence={}ms, frame={} samples",
            classifier.name(),
            config.threshold,
            config.min_speech_frames,
            config.silence_duration.as_millis(),
            classifier.frame_len()
        );
        Self {
            classifier,
            config,
            pending: Vec::new(),
            context,
            state: SpeechState::Silence,
            consecutive_speech: 0,
            last_speech_at: None,
            silence_deadline: None,
        }
    }

    pub fn state(&self) -> SpeechState {
        self.state
    }

    pub fn is_speaking(&self) -> bool {
        self.state == SpeechState::Speaking
    }

    pub fn silence_deadline(&self) -> Option<Instant> {
        self.silence_deadline
    }

    pub fn frame_duration(&self) -> Duration {
        self.samples_to_duration(self.classifier.frame_len())
    }

    fn samples_to_duration(&self, samples: usize) -> Duration {
        Duration::from_secs_f64(samples as f64 / self.config.sample_rate.max(1) as f64)
    }

    /// Feed a chunk that ended at `now`. Returns the events it produced, in order.
    pub fn process(&mut self, samples: &[f32], now: Instant) -> Result<Vec<SpeechEvent>, VadError> {
        let frame_len = self.classifier.frame_len().max(1);
        self.pending.extend_from_slice(samples);

        let total = self.pending.len();
        let full_frames = total / frame_len;
        let mut events = Vec::new();

        let pending = std::mem::take(&mut self.pending);
        for k in 0..full_frames {
            let frame = &pending[k * frame_len..(k + 1) * frame_len];
            let remaining_after = total - (k + 1) * frame_len;
            let stamp = now
                .checked_sub(self.samples_to_duration(remaining_after))
                .unwrap_or(now);
            match self.classify_frame(frame, stamp) {
                Ok(Some(event)) => events.push(event),
                Ok(None) => {}
                Err(e) => {
                    self.pending = pending[full_frames * frame_len..].to_vec();
                    return Err(e);
                }
            }
        }
        self.pending = pending[full_frames * frame_len..].to_vec();

        if let Some(event) = self.poll(now) {
            events.push(event);
        }
        Ok(events)
    }

    /// Fire end-of-speech if its deadline has passed.
    pub fn poll(&mut self, now: Instant) -> Option<SpeechEvent> {
        match (self.state, self.silence_deadline) {
            (SpeechState::Speaking, Some(deadline)) if now >= deadline => Some(self.end_speech()),
            _ => None,
        }
    }

    /// Back to a fresh Silence state, cancelling any pending deadline.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.context.iter_mut().for_each(|s| *s = 0.0);
        self.state = SpeechState::Silence;
        self.consecutive_speech = 0;
        self.last_speech_at = None;
        self.silence_deadline = None;
        self.classifier.reset();
    }

    fn classify_frame(
        &mut self,
        frame: &[f32],
        at: Instant,
    ) -> Result<Option<SpeechEvent>, VadError> {
        let probability = if self.context.is_empty() {
            self.classifier.speech_probability(frame)?
        } else {
            let mut window = Vec::with_capacity(self.context.len() + frame.len());
            window.extend_from_slice(&self.context);
            window.extend_from_slice(frame);
            let p = self.classifier.speech_probability(&window)?;
            let ctx_len = self.context.len();
            self.context
                .copy_from_slice(&window[window.len() - ctx_len..]);
            p
        };

        if probability >= self.config.threshold {
            self.consecutive_speech += 1;
            self.last_speech_at = Some(at);
            self.silence_deadline = None;

            if self.state == SpeechState::Silence
                && self.consecutive_speech >= self.config.min_speech_frames.max(1)
            {
                self.state = SpeechState::Speaking;
                log::debug!("Speech started (p={:.2})", probability);
                return Ok(Some(SpeechEvent::Started));
            }
            return Ok(None);
        }

        self.consecutive_speech = 0;
        if self.state == SpeechState::Speaking {
            let silence = self.config.silence_duration;
            let last = self.last_speech_at.unwrap_or(at);
            let deadline = *self.silence_deadline.get_or_insert(last + silence);
            if at >= deadline {
                return Ok(Some(self.end_speech()));
            }
        }
        Ok(None)
    }

    fn end_speech(&mut self) -> SpeechEvent {
        if let Some(last) = self.last_speech_at {
            log::info!(
                "End of speech after {}ms of silence",
                last.elapsed().as_millis()
            );
        }
        self.state = SpeechState::Silence;
        self.silence_deadline = None;
        self.consecutive_speech = 0;
        SpeechEvent::Ended
    }
}
