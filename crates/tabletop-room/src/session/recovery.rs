//! Inbound signals, media-plane events, reconnection recovery and the
//! periodic health check.

use std::sync::Weak;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;

use super::{Internal, RoomNotice, RoomSession, SessionState, SlotOccupant};
use crate::health::HealthReport;
use crate::ice::IceServer;
use crate::peer::{PeerEvent, PeerNotice, should_initiate};
use crate::signaling::{ParticipantData, RoomSignal, SignalFrame, SignalingEvent, SlotId};

impl RoomSession {
    pub(super) async fn handle_signaling(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::StateChanged { previous, current } => {
                tracing::debug!(room = %self.room.room_id, ?previous, ?current, "Signaling state changed");
            }
            SignalingEvent::Connected => {}
            SignalingEvent::Reconnected => {
                self.notify(RoomNotice::ConnectionRestored);
                self.start_recovery().await;
            }
            SignalingEvent::Disconnected => self.notify(RoomNotice::ConnectionWarning {
                message: "Connection to the room was interrupted. Reconnecting...".into(),
            }),
            SignalingEvent::Suspended => self.notify(RoomNotice::ConnectionWarning {
                message: "Still trying to reach the room server.".into(),
            }),
            SignalingEvent::Failed(reason) => {
                tracing::error!(room = %self.room.room_id, %reason, "Signaling failed permanently");
                self.notify(RoomNotice::ConnectionWarning {
                    message: "Lost connection to the room. Reload to reconnect.".into(),
                });
            }
            SignalingEvent::Message(frame) => self.handle_frame(frame).await,
        }
    }

    async fn handle_frame(&mut self, frame: SignalFrame) {
        let signal = match RoomSignal::parse(&frame) {
            Ok(signal) => signal,
            Err(e) => {
                tracing::warn!(event = %frame.event, sender = %frame.sender, error = %e, "Malformed room signal");
                return;
            }
        };
        match signal {
            RoomSignal::UserJoined { slot_id, participant_data } => {
                self.on_user_joined(&frame.sender, slot_id, participant_data).await
            }
            RoomSignal::UserLeft { slot_id } => self.on_user_left(&frame.sender, slot_id).await,
            RoomSignal::RequestState { requester_id } => {
                if self.state == SessionState::Joined {
                    tracing::debug!(requester = %requester_id, "Re-announcing seat");
                    self.announce_presence().await;
                }
            }
        }
    }

    async fn on_user_joined(&mut self, sender: &str, slot_id: SlotId, mut participant: ParticipantData) {
        if !matches!(self.state, SessionState::Ready | SessionState::Joining | SessionState::Joined) {
            return;
        }
        if participant.peer_id != sender {
            tracing::warn!(sender, claimed = %participant.peer_id, "Announcement peer id does not match sender");
            participant.peer_id = sender.to_owned();
        }
        if self.local_slot == Some(slot_id) {
            tracing::warn!(slot = slot_id, peer = sender, "Peer announced our seat, keeping it");
            return;
        }

        let current = self.slots.slot_of(sender).and_then(|s| self.slots.get(s).map(|o| (s, o)));
        let unchanged = current.is_some_and(|(s, o)| s == slot_id && o.participant == participant);
        let stream = current.map(|(_, o)| o.stream.clone()).unwrap_or_else(Weak::new);

        if !unchanged {
            let occupant = SlotOccupant {
                peer_id: sender.to_owned(),
                stream,
                participant: participant.clone(),
                is_local: false,
            };
            let displaced = match self.slots.occupy(slot_id, occupant) {
                Ok(displaced) => displaced,
                Err(e) => {
                    tracing::warn!(slot = slot_id, peer = sender, error = %e, "Ignoring announcement");
                    return;
                }
            };
            // Latest announcement wins the seat.
            if let Some(old) = displaced {
                tracing::info!(slot = slot_id, old = %old.peer_id, new = sender, "Seat taken over");
                self.peers.close_call(&old.peer_id).await;
                self.health.reset(&old.peer_id);
                self.notify(RoomNotice::SlotVacated { slot_id, peer_id: old.peer_id });
            }
            self.notify(RoomNotice::SlotOccupied { slot_id, participant, is_local: false });
        }
        self.health.reset(sender);

        if let Some(stream) = self.parked_streams.remove(sender) {
            self.slots.attach_stream(sender, &stream);
            self.notify(RoomNotice::RemoteStream { slot_id, peer_id: sender.to_owned(), stream });
        }

        let initiate = self.peers.peer_id().is_some_and(|me| should_initiate(me, sender));
        if self.state == SessionState::Joined && initiate {
            let ice = self.ice.current().await;
            self.dial(sender, &ice).await;
        }
    }

    async fn on_user_left(&mut self, sender: &str, slot_id: SlotId) {
        let slot = match self.slots.get(slot_id) {
            Some(o) if o.peer_id == sender => Some(slot_id),
            _ => self.slots.slot_of(sender),
        };
        if let Some(slot_id) = slot {
            self.slots.vacate(slot_id);
            self.notify(RoomNotice::SlotVacated { slot_id, peer_id: sender.to_owned() });
        }
        self.parked_streams.remove(sender);
        self.peers.close_call(sender).await;
        self.health.reset(sender);
    }

    pub(super) async fn handle_peer_event(&mut self, event: PeerEvent) {
        let Some(notice) = self.peers.handle_event(event).await else { return };
        match notice {
            PeerNotice::RemoteStream { peer_id, stream } => {
                self.health.reset(&peer_id);
                match self.slots.attach_stream(&peer_id, &stream) {
                    Some(slot_id) => self.notify(RoomNotice::RemoteStream { slot_id, peer_id, stream }),
                    None => {
                        tracing::debug!(peer = %peer_id, "Stream arrived before announcement, parking it");
                        self.parked_streams.insert(peer_id, stream);
                    }
                }
            }
            PeerNotice::Disconnected { peer_id } => {
                self.parked_streams.remove(&peer_id);
                self.slots.detach_stream(&peer_id);
                self.notify(RoomNotice::PeerDisconnected { peer_id });
            }
        }
    }

    /// After signaling comes back: ask for seats, re-announce ours, then
    /// redial whoever is seated but not connected.
    async fn start_recovery(&mut self) {
        self.recovery_epoch += 1;
        let epoch = self.recovery_epoch;
        tracing::info!(room = %self.room.room_id, epoch, "Signaling reconnected, recovering room");

        if let Some(me) = self.peers.peer_id().map(str::to_owned) {
            self.publish(RoomSignal::RequestState { requester_id: me }).await;
        }
        self.schedule(self.timings.reannounce_delay, Internal::Reannounce { epoch });
        self.schedule(self.timings.reconcile_delay, Internal::Reconcile { epoch });
    }

    pub(super) async fn reconcile_after_reconnect(&mut self, epoch: u64) {
        // Calls still pending from before the reconnect will not complete now.
        let expired = self.peers.expire_stale_dials(self.timings.reconcile_delay).await;
        if !expired.is_empty() {
            tracing::debug!(expired = expired.len(), "Dropped pending calls from before the outage");
        }

        let connected = self.peers.connected_peers();
        let missing: Vec<_> =
            self.slots.remote_peers().into_iter().filter(|p| !connected.contains(p)).collect();
        if missing.is_empty() {
            return;
        }
        tracing::info!(room = %self.room.room_id, missing = missing.len(), "Redialing peers after reconnect");

        // Spread redials so the whole room does not dial at once.
        let jitter_ms = self.timings.reconnect_jitter.as_millis() as u64;
        let delays: Vec<Duration> = {
            let mut rng = rand::rng();
            missing
                .iter()
                .map(|_| Duration::from_millis(if jitter_ms == 0 { 0 } else { rng.random_range(0..jitter_ms) }))
                .collect()
        };
        for (peer_id, delay) in missing.into_iter().zip(delays) {
            self.schedule(delay, Internal::RetryPeer { peer_id, epoch });
        }
    }

    pub(super) async fn retry_after_reconnect(&mut self, peer_id: &str) {
        if self.slots.slot_of(peer_id).is_none() || self.peers.has_call(peer_id) {
            return;
        }
        if !self.health.try_attempt(peer_id, Instant::now()) {
            tracing::debug!(peer = peer_id, "Skipping redial, attempts on backoff");
            return;
        }
        self.redial(peer_id).await;
    }

    /// Compare seated peers with connected ones and redial the gaps.
    pub(super) async fn run_health_check(&mut self) -> HealthReport {
        if self.state != SessionState::Joined {
            return HealthReport { skipped: true, ..HealthReport::default() };
        }

        if !self.signaling.is_connected() {
            tracing::debug!(room = %self.room.room_id, "Health check skipped: signaling is down");
            let report = HealthReport { skipped: true, ..HealthReport::default() };
            self.last_health = Some(report.clone());
            return report;
        }

        let expired = self.peers.expire_stale_dials(self.timings.dial_timeout).await;
        for peer in &expired {
            tracing::info!(peer = %peer, "Call attempt timed out");
        }

        let expected = self.slots.remote_peers();
        // A call still being set up counts as present.
        let present: Vec<_> = expected.iter().filter(|p| self.peers.has_call(p)).cloned().collect();
        let report = self.health.check(true, &expected, &present, Instant::now());

        for peer in &report.retry {
            self.redial(peer).await;
        }
        for peer in &report.exhausted {
            tracing::warn!(room = %self.room.room_id, peer = %peer, "Peer unreachable, freeing its seat");
            if let Some((slot_id, _)) = self.slots.vacate_peer(peer) {
                self.notify(RoomNotice::SlotVacated { slot_id, peer_id: peer.clone() });
            }
            self.peers.close_call(peer).await;
            self.notify(RoomNotice::PeerUnreachable { peer_id: peer.clone() });
        }

        self.last_health = Some(report.clone());
        report
    }

    pub(super) async fn redial(&mut self, peer_id: &str) -> bool {
        if self.state != SessionState::Joined {
            return false;
        }
        let ice = self.ice.current().await;
        self.dial(peer_id, &ice).await
    }

    pub(super) async fn dial(&mut self, peer_id: &str, ice: &[IceServer]) -> bool {
        match self.peers.call_peer(peer_id, ice).await {
            Ok(placed) => placed,
            Err(e) => {
                tracing::warn!(peer = peer_id, error = %e, "Call failed");
                false
            }
        }
    }
}
