//! Room events carried over the pub/sub channel.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::SignalFrame;

/// Seats are numbered from 1.
pub type SlotId = u32;

pub const USER_JOINED: &str = "user-joined";
pub const USER_LEFT: &str = "user-left";
pub const REQUEST_STATE: &str = "request-state";

/// Every event a room session listens for.
pub const ROOM_EVENTS: [&str; 3] = [USER_JOINED, USER_LEFT, REQUEST_STATE];

/// What a seated participant announces about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantData {
    pub peer_id: String,
    pub user_id: String,
    #[serde(default)]
    pub character_name: Option<String>,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "kebab-case")]
pub enum RoomSignal {
    UserJoined {
        slot_id: SlotId,
        participant_data: ParticipantData,
    },
    UserLeft {
        slot_id: SlotId,
    },
    RequestState {
        requester_id: String,
    },
}

impl RoomSignal {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::UserJoined { .. } => USER_JOINED,
            Self::UserLeft { .. } => USER_LEFT,
            Self::RequestState { .. } => REQUEST_STATE,
        }
    }

    /// Split into the `(event, payload)` pair published on the channel.
    pub fn into_parts(self) -> Result<(String, Value), serde_json::Error> {
        let mut value = serde_json::to_value(&self)?;
        let payload = value
            .get_mut("payload")
            .map(Value::take)
            .unwrap_or(Value::Null);
        Ok((self.event_name().to_owned(), payload))
    }

    pub fn parse(frame: &SignalFrame) -> Result<Self, serde_json::Error> {
        serde_json::from_value(serde_json::json!({
            "event": frame.event,
            "payload": frame.payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_joined_wire_shape() {
        let signal = RoomSignal::UserJoined {
            slot_id: 3,
            participant_data: ParticipantData {
                peer_id: "p1".into(),
                user_id: "7".into(),
                character_name: Some("Vex".into()),
                username: "alex".into(),
            },
        };
        let (event, payload) = signal.clone().into_parts().unwrap();
        assert_eq!(event, "user-joined");
        assert_eq!(payload["slot_id"], 3);
        assert_eq!(payload["participant_data"]["character_name"], "Vex");

        let frame = SignalFrame { event, sender: "p1".into(), payload };
        assert_eq!(RoomSignal::parse(&frame).unwrap(), signal);
    }

    #[test]
    fn unknown_event_does_not_parse() {
        let frame = SignalFrame {
            event: "dice-roll".into(),
            sender: "p1".into(),
            payload: serde_json::json!({ "d": 20 }),
        };
        assert!(RoomSignal::parse(&frame).is_err());
    }
}
