//! Push-to-talk state machine.
//!
//! All PTT transitions go through [`reduce`], which returns the next state
//! and the effects the session loop must execute. Events tagged with a
//! recording id that no longer matches the current recording are ignored.

use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PttState {
    /// No hook installed.
    #[default]
    Idle,
    /// Hook installed, waiting for the combo.
    Listening,
    Recording {
        recording_id: Uuid,
        started_at: Instant,
    },
}

impl PttState {
    pub fn recording_id(&self) -> Option<Uuid> {
        match self {
            PttState::Recording { recording_id, .. } => Some(*recording_id),
            _ => None,
        }
    }

    pub fn is_recording(&self) -> bool {
        matches!(self, PttState::Recording { .. })
    }
}

/// Why a recording is being stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Hotkey,
    /// End of speech reported by the VAD.
    Silence,
    MaxDuration,
    /// Session stopped while recording: transcribe what was captured.
    SessionEnd,
    /// Full reset: drop the audio.
    Interrupt,
}

impl StopReason {
    pub fn transcribes(self) -> bool {
        !matches!(self, StopReason::Interrupt)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StopReason::Hotkey => "hotkey",
            StopReason::Silence => "silence",
            StopReason::MaxDuration => "max_duration",
            StopReason::SessionEnd => "session_end",
            StopReason::Interrupt => "interrupt",
        }
    }
}

#[derive(Debug, Clone)]
pub enum PttEvent {
    /// OS hook registered.
    HookInstalled,
    /// The combo was pressed.
    Trigger,
    /// Synthetic start after narration finished.
    AutoStart,
    /// The microphone could not be opened for this recording.
    StartFailed { recording_id: Uuid },
    /// Out-of-band stop without a key event (VAD auto-stop).
    ForceStop { recording_id: Uuid },
    /// Periodic loop tick; enforces the maximum recording length.
    Tick { now: Instant, max_recording: Duration },
    /// Tear the session down, stopping any recording first.
    Deactivate { discard: bool },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PttEffect {
    StartRecording { recording_id: Uuid },
    StopRecording { recording_id: Uuid, reason: StopReason },
    ReleaseHook,
    /// Publish the new state to observers.
    EmitStatus,
}

/// Reducer function: (state, event) -> (next_state, effects)
pub fn reduce(state: &PttState, event: PttEvent) -> (PttState, Vec<PttEffect>) {
    use PttEffect::*;
    use PttEvent::*;
    use PttState::*;

    let start = || {
        let recording_id = Uuid::new_v4();
        (
            Recording {
                recording_id,
                started_at: Instant::now(),
            },
            vec![StartRecording { recording_id }, EmitStatus],
        )
    };
    let stop = |recording_id: Uuid, reason: StopReason| {
        (
            Listening,
            vec![
                StopRecording {
                    recording_id,
                    reason,
                },
                EmitStatus,
            ],
        )
    };

    match (state, event) {
        // -----------------
        // Idle
        // -----------------
        (Idle, HookInstalled) => (Listening, vec![EmitStatus]),
        (Idle, _) => (Idle, vec![]),

        // -----------------
        // Listening
        // -----------------
        (Listening, Trigger) | (Listening, AutoStart) => start(),
        (Listening, Deactivate { .. }) => (Idle, vec![ReleaseHook, EmitStatus]),

        // -----------------
        // Recording
        // -----------------
        (Recording { recording_id, .. }, Trigger) => stop(*recording_id, StopReason::Hotkey),
        (Recording { recording_id, .. }, ForceStop { recording_id: id }) if *recording_id == id => {
            stop(*recording_id, StopReason::Silence)
        }
        (Recording { recording_id, .. }, StartFailed { recording_id: id }) if *recording_id == id => {
            (Listening, vec![EmitStatus])
        }
        (
            Recording {
                recording_id,
                started_at,
            },
            Tick { now, max_recording },
        ) if now.saturating_duration_since(*started_at) >= max_recording => {
            log::warn!(
                "Recording {} auto-stopped after {:?} (max duration reached)",
                recording_id,
                max_recording
            );
            stop(*recording_id, StopReason::MaxDuration)
        }
        (Recording { recording_id, .. }, Deactivate { discard }) => {
            let reason = if discard {
                StopReason::Interrupt
            } else {
                StopReason::SessionEnd
            };
            (
                Idle,
                vec![
                    StopRecording {
                        recording_id: *recording_id,
                        reason,
                    },
                    ReleaseHook,
                    EmitStatus,
                ],
            )
        }

        // -----------------
        // Unhandled / stale: no transition
        // -----------------
        _ => (state.clone(), vec![]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording() -> (PttState, Uuid) {
        let id = Uuid::new_v4();
        (
            PttState::Recording {
                recording_id: id,
                started_at: Instant::now(),
            },
            id,
        )
    }

    #[test]
    fn hook_installed_moves_idle_to_listening() {
        let (next, effects) = reduce(&PttState::Idle, PttEvent::HookInstalled);
        assert_eq!(next, PttState::Listening);
        assert_eq!(effects, vec![PttEffect::EmitStatus]);
    }

    #[test]
    fn trigger_while_idle_is_ignored() {
        let (next, effects) = reduce(&PttState::Idle, PttEvent::Trigger);
        assert_eq!(next, PttState::Idle);
        assert!(effects.is_empty());
    }

    #[test]
    fn trigger_while_listening_starts_recording() {
        let (next, effects) = reduce(&PttState::Listening, PttEvent::Trigger);
        let id = next.recording_id().unwrap();
        assert!(effects.contains(&PttEffect::StartRecording { recording_id: id }));
        assert!(effects.contains(&PttEffect::EmitStatus));
    }

    #[test]
    fn trigger_while_recording_stops_and_returns_to_listening() {
        let (state, id) = recording();
        let (next, effects) = reduce(&state, PttEvent::Trigger);
        assert_eq!(next, PttState::Listening);
        assert!(effects.contains(&PttEffect::StopRecording {
            recording_id: id,
            reason: StopReason::Hotkey
        }));
    }

    #[test]
    fn each_recording_gets_a_fresh_id() {
        let (first, _) = reduce(&PttState::Listening, PttEvent::Trigger);
        let (listening, _) = reduce(&first, PttEvent::Trigger);
        let (second, _) = reduce(&listening, PttEvent::Trigger);
        assert_ne!(first.recording_id(), second.recording_id());
    }

    #[test]
    fn auto_start_only_from_listening() {
        let (next, effects) = reduce(&PttState::Listening, PttEvent::AutoStart);
        assert!(next.is_recording());
        assert_eq!(effects.len(), 2);

        let (state, id) = recording();
        let (next, effects) = reduce(&state, PttEvent::AutoStart);
        assert_eq!(next.recording_id(), Some(id));
        assert!(effects.is_empty());
    }

    #[test]
    fn force_stop_with_matching_id_stops() {
        let (state, id) = recording();
        let (next, effects) = reduce(&state, PttEvent::ForceStop { recording_id: id });
        assert_eq!(next, PttState::Listening);
        assert!(effects.contains(&PttEffect::StopRecording {
            recording_id: id,
            reason: StopReason::Silence
        }));
    }

    #[test]
    fn force_stop_with_stale_id_is_ignored() {
        let (state, id) = recording();
        let (next, effects) = reduce(
            &state,
            PttEvent::ForceStop {
                recording_id: Uuid::new_v4(),
            },
        );
        assert_eq!(next.recording_id(), Some(id));
        assert!(effects.is_empty());

        // And a late auto-stop after the recording ended does nothing
        let (next, effects) = reduce(&PttState::Listening, PttEvent::ForceStop { recording_id: id });
        assert_eq!(next, PttState::Listening);
        assert!(effects.is_empty());
    }

    #[test]
    fn start_failure_returns_to_listening_without_stop() {
        let (state, id) = recording();
        let (next, effects) = reduce(&state, PttEvent::StartFailed { recording_id: id });
        assert_eq!(next, PttState::Listening);
        assert_eq!(effects, vec![PttEffect::EmitStatus]);
    }

    #[test]
    fn tick_enforces_max_duration() {
        let (state, id) = recording();
        let max = Duration::from_secs(120);
        let started = match &state {
            PttState::Recording { started_at, .. } => *started_at,
            _ => unreachable!(),
        };

        let (next, effects) = reduce(
            &state,
            PttEvent::Tick {
                now: started + Duration::from_secs(60),
                max_recording: max,
            },
        );
        assert!(next.is_recording());
        assert!(effects.is_empty());

        let (next, effects) = reduce(
            &state,
            PttEvent::Tick {
                now: started + max,
                max_recording: max,
            },
        );
        assert_eq!(next, PttState::Listening);
        assert!(effects.contains(&PttEffect::StopRecording {
            recording_id: id,
            reason: StopReason::MaxDuration
        }));
    }

    #[test]
    fn deactivate_while_recording_stops_before_releasing_hook() {
        let (state, id) = recording();
        let (next, effects) = reduce(&state, PttEvent::Deactivate { discard: false });
        assert_eq!(next, PttState::Idle);
        assert_eq!(
            effects,
            vec![
                PttEffect::StopRecording {
                    recording_id: id,
                    reason: StopReason::SessionEnd
                },
                PttEffect::ReleaseHook,
                PttEffect::EmitStatus,
            ]
        );
    }

    #[test]
    fn interrupt_discards_recording() {
        let (state, id) = recording();
        let (_, effects) = reduce(&state, PttEvent::Deactivate { discard: true });
        assert!(effects.contains(&PttEffect::StopRecording {
            recording_id: id,
            reason: StopReason::Interrupt
        }));
        assert!(!StopReason::Interrupt.transcribes());
    }

    #[test]
    fn deactivate_while_listening_releases_hook() {
        let (next, effects) = reduce(&PttState::Listening, PttEvent::Deactivate { discard: true });
        assert_eq!(next, PttState::Idle);
        assert!(effects.contains(&PttEffect::ReleaseHook));
    }

    #[test]
    fn deactivate_while_idle_is_noop() {
        let (next, effects) = reduce(&PttState::Idle, PttEvent::Deactivate { discard: false });
        assert_eq!(next, PttState::Idle);
        assert!(effects.is_empty());
    }
}
