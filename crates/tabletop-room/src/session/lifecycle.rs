//! Initialize, join, leave and shutdown.

use std::sync::Arc;

use tokio::time::Instant;

use super::{LeaveOutcome, RoomNotice, RoomSession, SessionState, SlotOccupant};
use crate::error::RoomError;
use crate::media::MediaStream;
use crate::peer::{PeerId, should_initiate};
use crate::signaling::{ParticipantData, ROOM_EVENTS, RoomSignal, SlotId};

impl RoomSession {
    /// Register with the media plane, then connect signaling under the new
    /// peer id and ask the room who is already seated.
    pub async fn initialize(&mut self) -> Result<PeerId, RoomError> {
        if self.state != SessionState::Idle {
            return Err(RoomError::InvalidState { actual: self.state });
        }
        self.set_state(SessionState::Initializing);

        let peer_id = match self.peers.initialize().await {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(room = %self.room.room_id, error = %e, "Peer initialization failed");
                self.set_state(SessionState::Failed);
                return Err(e.into());
            }
        };

        // Frames published without a sender id cannot be attributed.
        self.signaling.set_current_peer_id(peer_id.clone());
        for event in ROOM_EVENTS {
            self.signaling.subscribe(event);
        }
        if let Err(e) = self.signaling.connect(&self.room.room_id).await {
            tracing::error!(room = %self.room.room_id, error = %e, "Signaling connect failed");
            self.set_state(SessionState::Failed);
            return Err(e.into());
        }

        // Warm the relay credential cache before the first call needs it.
        let _ = self.ice.current().await;

        self.publish(RoomSignal::RequestState { requester_id: peer_id.clone() }).await;
        self.set_state(SessionState::Ready);
        tracing::info!(room = %self.room.room_id, peer = %peer_id, "Room session ready");
        Ok(peer_id)
    }

    pub async fn join(&mut self, slot_id: SlotId) -> Result<(), RoomError> {
        match self.state {
            SessionState::Ready => {}
            SessionState::Joining | SessionState::Joined => return Err(RoomError::AlreadyJoined),
            actual => return Err(RoomError::InvalidState { actual }),
        }
        if !self.slots.contains_slot(slot_id) {
            return Err(RoomError::InvalidSlot(slot_id));
        }
        if self.slots.get(slot_id).is_some() {
            return Err(RoomError::SlotOccupied(slot_id));
        }
        let me = self.local_participant()?;

        self.set_state(SessionState::Joining);
        let stream = match self.acquire_media().await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(room = %self.room.room_id, slot = slot_id, error = %e, "Join failed");
                self.notify(RoomNotice::JoinFailed { message: e.user_message() });
                self.set_state(SessionState::Ready);
                return Err(e);
            }
        };

        let occupant = SlotOccupant {
            peer_id: me.peer_id.clone(),
            stream: Arc::downgrade(&stream),
            participant: me.clone(),
            is_local: true,
        };
        self.slots.occupy(slot_id, occupant)?;
        self.local_slot = Some(slot_id);
        self.local_stream = Some(stream.clone());
        self.peers.set_local_stream(Some(stream));
        self.media.set_audio_enabled(!self.muted);
        self.media.set_video_enabled(!self.video_hidden);
        self.notify(RoomNotice::SlotOccupied { slot_id, participant: me.clone(), is_local: true });

        self.announce_presence().await;
        // Seats may have changed while we were not listening for them.
        self.publish(RoomSignal::RequestState { requester_id: me.peer_id.clone() }).await;

        let ice = self.ice.current().await;
        for remote in self.slots.remote_peers() {
            if should_initiate(&me.peer_id, &remote) {
                self.dial(&remote, &ice).await;
            }
        }

        self.set_state(SessionState::Joined);
        tracing::info!(room = %self.room.room_id, slot = slot_id, "Joined room");
        self.notify(RoomNotice::Joined { slot_id });

        self.start_consented_features().await;
        Ok(())
    }

    /// Announce departure and release everything, giving up on graceful
    /// cleanup after the leave timeout.
    pub async fn leave(&mut self) -> Result<LeaveOutcome, RoomError> {
        if self.state != SessionState::Joined {
            return Err(RoomError::InvalidState { actual: self.state });
        }
        let started = Instant::now();
        self.set_state(SessionState::Leaving);

        let limit = self.timings.leave_timeout;
        let clean = match tokio::time::timeout(limit, self.cleanup()).await {
            Ok(()) => true,
            Err(_) => {
                tracing::warn!(room = %self.room.room_id, ?limit, "Leave cleanup timed out, forcing it");
                false
            }
        };
        self.clear_local_state();

        let outcome = LeaveOutcome { clean, elapsed: started.elapsed() };
        self.set_state(SessionState::Ready);
        tracing::info!(room = %self.room.room_id, clean, elapsed = ?outcome.elapsed, "Left room");
        self.notify(RoomNotice::Left { clean });
        Ok(outcome)
    }

    pub(super) async fn shutdown(&mut self) {
        if self.state == SessionState::Joined {
            let _ = self.leave().await;
        }
        self.peers.connector().shutdown().await;
        self.signaling.disconnect().await;
        self.health.reset_all();
        self.set_state(SessionState::Idle);
    }

    pub(super) async fn announce_presence(&self) {
        let Some(slot_id) = self.local_slot else { return };
        let Ok(participant_data) = self.local_participant() else { return };
        self.publish(RoomSignal::UserJoined { slot_id, participant_data }).await;
    }

    pub(super) async fn publish(&self, signal: RoomSignal) {
        let event = signal.event_name();
        if let Err(e) = self.signaling.send_signal(signal).await {
            tracing::warn!(room = %self.room.room_id, event, error = %e, "Failed to publish signal");
        }
    }

    fn local_participant(&self) -> Result<ParticipantData, RoomError> {
        let peer_id = self.peers.peer_id().ok_or(RoomError::InvalidState { actual: self.state })?;
        Ok(ParticipantData {
            peer_id: peer_id.to_owned(),
            user_id: self.me.user_id.clone(),
            character_name: self.me.character_name.clone(),
            username: self.me.username.clone(),
        })
    }

    async fn acquire_media(&self) -> Result<Arc<MediaStream>, RoomError> {
        let stream = self.media.acquire().await.map_err(RoomError::MediaUnavailable)?;
        if stream.is_empty() {
            self.media.release().await;
            return Err(RoomError::NoTracks);
        }
        Ok(stream)
    }

    async fn cleanup(&mut self) {
        if let Some(slot_id) = self.local_slot {
            self.publish(RoomSignal::UserLeft { slot_id }).await;
        }
        self.stop_recording().await;
        self.stop_speech_for_leave().await;

        self.media.release().await;
        self.local_stream = None;
        self.peers.set_local_stream(None);
        self.peers.close_all().await;
        self.vacate_all();

        // Let the media plane finish tearing down before the seat is reused.
        tokio::time::sleep(self.timings.settle_delay).await;
    }

    /// Whatever cleanup did not get to is torn down in the background.
    fn clear_local_state(&mut self) {
        let leftover = self.peers.detach_all();
        let release = self.local_stream.take().is_some();
        if release || !leftover.is_empty() {
            let media = self.media.clone();
            let connector = self.peers.connector();
            tokio::spawn(async move {
                if release {
                    media.release().await;
                }
                for peer in leftover {
                    connector.hang_up(&peer).await;
                }
            });
        }
        self.peers.set_local_stream(None);
        self.speech.reset();
        self.health.reset_all();
        self.vacate_all();
    }

    fn vacate_all(&mut self) {
        self.slots.clear();
        self.local_slot = None;
        self.parked_streams.clear();
    }
}
