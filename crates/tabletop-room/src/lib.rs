//! Real-time core of a tabletop room.
//!
//! A [`RoomSession`] owns every per-room component (signaling channel, peer
//! mesh, health monitor, speech and recording controllers) and runs them on a
//! single task. The UI talks to it through a cloneable [`RoomHandle`] and
//! listens for [`RoomNotice`]s.

pub mod consent;
pub mod error;
pub mod health;
pub mod ice;
pub mod media;
pub mod peer;
pub mod recording;
pub mod session;
pub mod signaling;
pub mod speech;

pub use error::{PeerError, RoomError, SignalingError};
pub use session::{
    LeaveOutcome, RecordingSetup, RoomDeps, RoomHandle, RoomNotice, RoomSession, RoomSnapshot,
    RoomTimings, SessionState,
};
