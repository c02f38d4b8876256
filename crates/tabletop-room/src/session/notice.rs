use std::sync::Arc;

use serde::Serialize;
use tabletop_common::models::{Feature, UploadReceipt};

use super::state::SessionState;
use crate::media::MediaStream;
use crate::peer::PeerId;
use crate::signaling::{ParticipantData, SlotId};

/// Everything the UI is told about a room session.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoomNotice {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    Joined {
        slot_id: SlotId,
    },
    JoinFailed {
        message: String,
    },
    Left {
        /// Cleanup finished before the leave timeout.
        clean: bool,
    },
    SlotOccupied {
        slot_id: SlotId,
        participant: ParticipantData,
        is_local: bool,
    },
    SlotVacated {
        slot_id: SlotId,
        peer_id: PeerId,
    },
    RemoteStream {
        slot_id: SlotId,
        peer_id: PeerId,
        #[serde(skip)]
        stream: Arc<MediaStream>,
    },
    PeerDisconnected {
        peer_id: PeerId,
    },
    PeerUnreachable {
        peer_id: PeerId,
    },
    ConnectionWarning {
        message: String,
    },
    ConnectionRestored,
    FeatureStarted {
        feature: Feature,
    },
    FeatureStopped {
        feature: Feature,
    },
    FeatureUnavailable {
        feature: Feature,
        message: String,
    },
    RecordingSaved {
        receipt: UploadReceipt,
    },
}
