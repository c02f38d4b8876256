//! Session lifecycle states and seat occupancy.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use serde::Serialize;

use crate::error::RoomError;
use crate::health::HealthReport;
use crate::media::MediaStream;
use crate::peer::{PeerId, PeerStats};
use crate::recording::RecordingStats;
use crate::signaling::{ConnectionState, ParticipantData, SlotId};
use crate::speech::SpeechSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Initializing,
    Ready,
    Joining,
    Joined,
    Leaving,
    Failed,
}

#[derive(Debug, Clone)]
pub struct SlotOccupant {
    pub peer_id: PeerId,
    pub stream: Weak<MediaStream>,
    pub participant: ParticipantData,
    pub is_local: bool,
}

/// Seats of one room. A slot holds at most one occupant and a peer sits in
/// at most one slot.
#[derive(Debug)]
pub struct SlotMap {
    slot_count: usize,
    slots: BTreeMap<SlotId, SlotOccupant>,
}

impl SlotMap {
    pub fn new(slot_count: usize) -> Self {
        Self { slot_count, slots: BTreeMap::new() }
    }

    pub fn contains_slot(&self, slot: SlotId) -> bool {
        slot >= 1 && (slot as usize) <= self.slot_count
    }

    pub fn get(&self, slot: SlotId) -> Option<&SlotOccupant> {
        self.slots.get(&slot)
    }

    pub fn slot_of(&self, peer: &str) -> Option<SlotId> {
        self.slots.iter().find(|(_, o)| o.peer_id == peer).map(|(s, _)| *s)
    }

    /// Seat `occupant` in `slot`, moving it out of any other slot. Returns
    /// whoever was displaced from `slot`.
    pub fn occupy(&mut self, slot: SlotId, occupant: SlotOccupant) -> Result<Option<SlotOccupant>, RoomError> {
        if !self.contains_slot(slot) {
            return Err(RoomError::InvalidSlot(slot));
        }
        if let Some(previous) = self.slot_of(&occupant.peer_id).filter(|s| *s != slot) {
            self.slots.remove(&previous);
        }
        let peer = occupant.peer_id.clone();
        let displaced = self.slots.insert(slot, occupant);
        Ok(displaced.filter(|d| d.peer_id != peer))
    }

    pub fn vacate(&mut self, slot: SlotId) -> Option<SlotOccupant> {
        self.slots.remove(&slot)
    }

    pub fn vacate_peer(&mut self, peer: &str) -> Option<(SlotId, SlotOccupant)> {
        let slot = self.slot_of(peer)?;
        self.slots.remove(&slot).map(|o| (slot, o))
    }

    /// Point the peer's seat at `stream`; `None` if the peer has no seat yet.
    pub fn attach_stream(&mut self, peer: &str, stream: &Arc<MediaStream>) -> Option<SlotId> {
        let (slot, occupant) = self.slots.iter_mut().find(|(_, o)| o.peer_id == peer)?;
        occupant.stream = Arc::downgrade(stream);
        Some(*slot)
    }

    pub fn detach_stream(&mut self, peer: &str) -> Option<SlotId> {
        let (slot, occupant) = self.slots.iter_mut().find(|(_, o)| o.peer_id == peer)?;
        occupant.stream = Weak::new();
        Some(*slot)
    }

    /// Remote peers, sorted.
    pub fn remote_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> =
            self.slots.values().filter(|o| !o.is_local).map(|o| o.peer_id.clone()).collect();
        peers.sort();
        peers
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }

    pub fn occupants(&self) -> Vec<OccupantInfo> {
        self.slots
            .iter()
            .map(|(slot, o)| OccupantInfo {
                slot_id: *slot,
                peer_id: o.peer_id.clone(),
                user_id: o.participant.user_id.clone(),
                character_name: o.participant.character_name.clone(),
                username: o.participant.username.clone(),
                is_local: o.is_local,
                has_stream: o.stream.strong_count() > 0,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OccupantInfo {
    pub slot_id: SlotId,
    pub peer_id: PeerId,
    pub user_id: String,
    pub character_name: Option<String>,
    pub username: String,
    pub is_local: bool,
    pub has_stream: bool,
}

/// Point-in-time view of a session for debugging and UI.
#[derive(Debug, Clone, Serialize)]
pub struct RoomSnapshot {
    pub room_id: String,
    pub state: SessionState,
    pub peer_id: Option<PeerId>,
    pub local_slot: Option<SlotId>,
    pub muted: bool,
    pub video_hidden: bool,
    pub signaling: ConnectionState,
    pub occupants: Vec<OccupantInfo>,
    pub peers: PeerStats,
    pub speech: SpeechSnapshot,
    pub recording: Option<RecordingStats>,
    pub last_health: Option<HealthReport>,
}
