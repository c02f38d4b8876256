//! Consent-gated features (speech-to-text, recording) and local media toggles.

use std::sync::Arc;

use tabletop_common::models::{Feature, RecordingMetadata};

use super::{Internal, RoomNotice, RoomSession, SessionState};
use crate::error::RoomError;
use crate::media::MediaStream;
use crate::recording::RecordingController;
use crate::speech::SpeechTransition;

impl RoomSession {
    /// Missing or failed lookups count as no consent.
    async fn consent_given(&self, feature: Feature) -> bool {
        match self.consent.status(feature).await {
            Ok(status) => status.consent_given,
            Err(e) => {
                tracing::warn!(feature = feature.as_str(), error = %e, "Consent lookup failed");
                false
            }
        }
    }

    fn has_audio(&self) -> bool {
        self.local_stream.as_ref().is_some_and(|s| s.has_audio())
    }

    pub(super) async fn start_consented_features(&mut self) {
        let Some(stream) = self.local_stream.clone() else { return };

        if self.room.features.speech_to_text.enabled && self.recognizer.is_some() {
            if !stream.has_audio() {
                self.notify(RoomNotice::FeatureUnavailable {
                    feature: Feature::SpeechToText,
                    message: "Speech-to-text needs a microphone.".into(),
                });
            } else if !self.consent_given(Feature::SpeechToText).await {
                tracing::info!(room = %self.room.room_id, "No speech-to-text consent, not starting");
            } else if self.muted {
                self.speech.mark_paused_for_mute();
            } else {
                self.begin_speech(SpeechTransition::Start);
            }
        }

        if self.room.features.recording.enabled && self.recording_setup.is_some() {
            if self.consent_given(Feature::Recording).await {
                self.start_recording(stream).await;
            } else {
                tracing::info!(room = %self.room.room_id, "No recording consent, not starting");
            }
        }
    }

    async fn start_recording(&mut self, stream: Arc<MediaStream>) {
        let Some(setup) = &self.recording_setup else { return };
        let provider = (setup.uploads)();
        let metadata = RecordingMetadata::new(&self.room.room_id, &self.me.user_id);
        let started =
            RecordingController::start(setup.recorder.clone(), provider, metadata, stream, setup.tuning.clone())
                .await;
        match started {
            Ok(controller) => {
                self.recording = Some(controller);
                self.notify(RoomNotice::FeatureStarted { feature: Feature::Recording });
            }
            Err(e) => {
                tracing::warn!(room = %self.room.room_id, error = %e, "Recording did not start");
                self.notify(RoomNotice::FeatureUnavailable {
                    feature: Feature::Recording,
                    message: "Recording could not be started.".into(),
                });
            }
        }
    }

    /// Stops on a spawned task so that a leave timeout does not cut the
    /// final upload short.
    pub(super) async fn stop_recording(&mut self) {
        let Some(recording) = self.recording.take() else { return };
        let notices = self.notices.clone();
        let task = tokio::spawn(async move {
            match recording.stop().await {
                Ok(Some(receipt)) => {
                    tracing::info!(recording = ?receipt.recording_id, bytes = receipt.size_bytes, "Recording saved");
                    let _ = notices.send(RoomNotice::RecordingSaved { receipt });
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(error = %e, "Recording could not be saved");
                    let _ = notices.send(RoomNotice::FeatureUnavailable {
                        feature: Feature::Recording,
                        message: "The recording could not be saved.".into(),
                    });
                }
            }
            let _ = notices.send(RoomNotice::FeatureStopped { feature: Feature::Recording });
        });
        let _ = task.await;
    }

    /// Run a recognizer call on its own task; the result comes back as
    /// [`Internal::SpeechSettled`]. `false` if the transition was dropped.
    fn begin_speech(&mut self, transition: SpeechTransition) -> bool {
        let Some(recognizer) = self.recognizer.clone() else { return false };
        let stream = self.local_stream.clone();
        if transition.starts() && stream.is_none() {
            return false;
        }
        if !self.speech.begin(transition) {
            return false;
        }

        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = match stream {
                Some(stream) if transition.starts() => recognizer.start(stream).await,
                _ => recognizer.stop().await,
            };
            if let Err(e) = &result {
                tracing::warn!(?transition, error = %e, "Speech recognizer call failed");
            }
            let _ = tx.send(Internal::SpeechSettled { transition, ok: result.is_ok() });
        });
        true
    }

    pub(super) async fn on_speech_settled(&mut self, transition: SpeechTransition, ok: bool) {
        if !self.speech.complete(transition, ok) {
            // Settled after the session moved on; don't leave it running.
            if ok && transition.starts() && self.state != SessionState::Joined {
                if let Some(recognizer) = self.recognizer.clone() {
                    tokio::spawn(async move {
                        let _ = recognizer.stop().await;
                    });
                }
            }
            return;
        }

        let feature = Feature::SpeechToText;
        match (transition, ok) {
            (SpeechTransition::Start | SpeechTransition::Resume, true) => {
                self.notify(RoomNotice::FeatureStarted { feature })
            }
            (SpeechTransition::Stop, true) => self.notify(RoomNotice::FeatureStopped { feature }),
            (SpeechTransition::Start, false) => self.notify(RoomNotice::FeatureUnavailable {
                feature,
                message: "Speech-to-text could not be started.".into(),
            }),
            _ => {}
        }

        // A failed call waits for the next mute change instead of looping.
        if ok {
            self.reconcile_speech().await;
        }
    }

    /// Start whichever transition the latest mute state calls for.
    async fn reconcile_speech(&mut self) {
        let wants_resume = self.speech.reconcile(self.muted, || true) == Some(SpeechTransition::Resume);
        let may_resume = wants_resume && self.has_audio() && self.consent_given(Feature::SpeechToText).await;
        if let Some(transition) = self.speech.reconcile(self.muted, || may_resume) {
            self.begin_speech(transition);
        }
    }

    pub(super) async fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
        if self.local_stream.is_some() {
            self.media.set_audio_enabled(!muted);
        }
        if self.state == SessionState::Joined {
            self.reconcile_speech().await;
        }
    }

    pub(super) fn set_video_hidden(&mut self, hidden: bool) {
        self.video_hidden = hidden;
        if self.local_stream.is_some() {
            self.media.set_video_enabled(!hidden);
        }
    }

    pub(super) async fn start_speech(&mut self) -> Result<(), RoomError> {
        if self.state != SessionState::Joined {
            return Err(RoomError::InvalidState { actual: self.state });
        }
        let available = self.room.features.speech_to_text.enabled && self.recognizer.is_some();
        if !available || !self.has_audio() || !self.consent_given(Feature::SpeechToText).await {
            return Err(RoomError::FeatureUnavailable(Feature::SpeechToText));
        }
        if self.muted {
            self.speech.mark_paused_for_mute();
        } else {
            self.begin_speech(SpeechTransition::Start);
        }
        Ok(())
    }

    pub(super) fn stop_speech(&mut self) -> bool {
        if self.speech.cancel_pause() {
            self.notify(RoomNotice::FeatureStopped { feature: Feature::SpeechToText });
            return true;
        }
        self.begin_speech(SpeechTransition::Stop)
    }

    pub(super) async fn stop_speech_for_leave(&mut self) {
        let running = self.speech.is_enabled() || self.speech.in_flight().is_some();
        self.speech.reset();
        if !running {
            return;
        }
        let Some(recognizer) = self.recognizer.clone() else { return };
        let task = tokio::spawn(async move {
            if let Err(e) = recognizer.stop().await {
                tracing::warn!(error = %e, "Speech recognizer did not stop cleanly");
            }
        });
        let _ = task.await;
    }
}
