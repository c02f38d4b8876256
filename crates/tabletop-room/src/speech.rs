//! Speech-to-text state and its interaction with muting.
//!
//! Starting or stopping a recognizer is slow, so the session runs those calls
//! on spawned tasks. [`SpeechController`] only tracks the state machine: at
//! most one transition is in flight, overlapping requests are dropped, and
//! when a transition settles the session asks [`SpeechController::reconcile`]
//! what the latest mute state now requires.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::media::MediaStream;

#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    async fn start(&self, stream: Arc<MediaStream>) -> anyhow::Result<()>;
    async fn stop(&self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeechTransition {
    /// User or join-time start.
    Start,
    /// User-requested stop.
    Stop,
    /// Stop because the microphone was muted.
    Pause,
    /// Restart after an unmute.
    Resume,
}

impl SpeechTransition {
    /// Whether the recognizer ends up running.
    pub fn starts(self) -> bool {
        matches!(self, Self::Start | Self::Resume)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SpeechSnapshot {
    pub enabled: bool,
    pub paused_for_mute: bool,
    pub user_stopped: bool,
    pub in_flight: Option<SpeechTransition>,
}

#[derive(Debug, Default)]
pub struct SpeechController {
    enabled: bool,
    paused_for_mute: bool,
    user_stopped: bool,
    in_flight: Option<SpeechTransition>,
}

impl SpeechController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_paused_for_mute(&self) -> bool {
        self.paused_for_mute
    }

    pub fn in_flight(&self) -> Option<SpeechTransition> {
        self.in_flight
    }

    /// Claim the in-flight slot for `transition`. Returns `false` (and changes
    /// nothing) when another transition is running or this one makes no sense
    /// from the current state.
    pub fn begin(&mut self, transition: SpeechTransition) -> bool {
        if let Some(running) = self.in_flight {
            tracing::debug!(?running, requested = ?transition, "Speech transition dropped");
            return false;
        }
        let valid = match transition {
            SpeechTransition::Start => !self.enabled,
            SpeechTransition::Stop | SpeechTransition::Pause => self.enabled,
            SpeechTransition::Resume => !self.enabled && self.paused_for_mute,
        };
        if valid {
            self.in_flight = Some(transition);
        }
        valid
    }

    /// Apply the result of the in-flight transition. Results for anything
    /// other than the in-flight transition are ignored.
    pub fn complete(&mut self, transition: SpeechTransition, ok: bool) -> bool {
        if self.in_flight != Some(transition) {
            return false;
        }
        self.in_flight = None;
        if !ok {
            return true;
        }
        match transition {
            SpeechTransition::Start | SpeechTransition::Resume => {
                self.enabled = true;
                self.paused_for_mute = false;
                self.user_stopped = false;
            }
            SpeechTransition::Pause => {
                self.enabled = false;
                self.paused_for_mute = true;
            }
            SpeechTransition::Stop => {
                self.enabled = false;
                self.paused_for_mute = false;
                self.user_stopped = true;
            }
        }
        true
    }

    /// Record that recognition would be running if the microphone were live.
    pub fn mark_paused_for_mute(&mut self) {
        if !self.enabled {
            self.paused_for_mute = true;
        }
    }

    /// The user turned recognition off while it was paused for mute; no
    /// recognizer call is needed.
    pub fn cancel_pause(&mut self) -> bool {
        if self.paused_for_mute && self.in_flight.is_none() {
            self.paused_for_mute = false;
            self.user_stopped = true;
            return true;
        }
        false
    }

    /// The transition the current mute state calls for, if any.
    ///
    /// `may_resume` is only consulted when resuming is on the table; it
    /// should report consent and the presence of an audio track.
    pub fn reconcile(&self, muted: bool, may_resume: impl FnOnce() -> bool) -> Option<SpeechTransition> {
        if self.in_flight.is_some() {
            return None;
        }
        if muted && self.enabled {
            return Some(SpeechTransition::Pause);
        }
        if !muted && !self.enabled && self.paused_for_mute && may_resume() {
            return Some(SpeechTransition::Resume);
        }
        None
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn snapshot(&self) -> SpeechSnapshot {
        SpeechSnapshot {
            enabled: self.enabled,
            paused_for_mute: self.paused_for_mute,
            user_stopped: self.user_stopped,
            in_flight: self.in_flight,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running() -> SpeechController {
        let mut c = SpeechController::new();
        assert!(c.begin(SpeechTransition::Start));
        c.complete(SpeechTransition::Start, true);
        c
    }

    #[test]
    fn overlapping_requests_are_dropped() {
        let mut c = running();
        assert!(c.begin(SpeechTransition::Pause));
        assert!(!c.begin(SpeechTransition::Resume));
        assert!(!c.begin(SpeechTransition::Stop));
        assert_eq!(c.in_flight(), Some(SpeechTransition::Pause));
    }

    #[test]
    fn mute_toggle_burst_settles_on_latest_state() {
        let mut c = running();
        let mut muted = false;

        // mute → pause starts; unmute, mute, unmute arrive while it runs.
        for next in [true, false, true, false] {
            muted = next;
            if let Some(t) = c.reconcile(muted, || true) {
                c.begin(t);
            }
        }
        assert_eq!(c.in_flight(), Some(SpeechTransition::Pause));

        // Each settle reconciles against the latest mute state.
        let mut settled = c.in_flight();
        while let Some(t) = settled {
            c.complete(t, true);
            settled = c.reconcile(muted, || true);
            if let Some(t) = settled {
                assert!(c.begin(t));
            }
        }
        assert_eq!(c.is_enabled(), !muted);
    }

    #[test]
    fn resume_requires_pause_and_permission() {
        let mut c = running();
        assert_eq!(c.reconcile(false, || true), None);

        c.begin(SpeechTransition::Pause);
        c.complete(SpeechTransition::Pause, true);
        assert!(c.is_paused_for_mute());
        assert_eq!(c.reconcile(false, || false), None);
        assert_eq!(c.reconcile(false, || true), Some(SpeechTransition::Resume));
    }

    #[test]
    fn user_stop_is_not_resumed_by_unmute() {
        let mut c = running();
        c.begin(SpeechTransition::Stop);
        c.complete(SpeechTransition::Stop, true);
        assert!(!c.is_paused_for_mute());
        assert_eq!(c.reconcile(false, || true), None);
        assert!(c.snapshot().user_stopped);
    }

    #[test]
    fn failed_transition_keeps_previous_state() {
        let mut c = running();
        c.begin(SpeechTransition::Pause);
        c.complete(SpeechTransition::Pause, false);
        assert!(c.is_enabled());
        assert_eq!(c.in_flight(), None);
        assert_eq!(c.reconcile(true, || true), Some(SpeechTransition::Pause));
    }

    #[test]
    fn stale_completion_is_ignored() {
        let mut c = running();
        assert!(!c.complete(SpeechTransition::Resume, true));
        assert!(c.is_enabled());
    }
}
