use tokio::sync::{broadcast, mpsc, oneshot};

use super::{LeaveOutcome, RoomNotice, RoomSnapshot};
use crate::error::RoomError;
use crate::health::HealthReport;
use crate::peer::PeerId;
use crate::signaling::SlotId;

/// Requests accepted by a running session.
#[derive(Debug)]
pub enum RoomCommand {
    Join { slot_id: SlotId, reply: oneshot::Sender<Result<(), RoomError>> },
    Leave { reply: oneshot::Sender<Result<LeaveOutcome, RoomError>> },
    SetMuted { muted: bool, reply: oneshot::Sender<()> },
    SetVideoHidden { hidden: bool, reply: oneshot::Sender<()> },
    StartSpeech { reply: oneshot::Sender<Result<(), RoomError>> },
    StopSpeech { reply: oneshot::Sender<bool> },
    RetryPeer { peer_id: PeerId, reply: oneshot::Sender<bool> },
    CheckHealth { reply: oneshot::Sender<HealthReport> },
    Snapshot { reply: oneshot::Sender<RoomSnapshot> },
    Shutdown { reply: oneshot::Sender<()> },
}

/// Cloneable front end to a session running on its own task.
#[derive(Clone)]
pub struct RoomHandle {
    commands: mpsc::Sender<RoomCommand>,
    notices: broadcast::Sender<RoomNotice>,
}

impl RoomHandle {
    pub(super) fn new(commands: mpsc::Sender<RoomCommand>, notices: broadcast::Sender<RoomNotice>) -> Self {
        Self { commands, notices }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> RoomCommand) -> Result<T, RoomError> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(make(tx)).await.map_err(|_| RoomError::SessionClosed)?;
        rx.await.map_err(|_| RoomError::SessionClosed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoomNotice> {
        self.notices.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    pub async fn join(&self, slot_id: SlotId) -> Result<(), RoomError> {
        self.request(|reply| RoomCommand::Join { slot_id, reply }).await?
    }

    pub async fn leave(&self) -> Result<LeaveOutcome, RoomError> {
        self.request(|reply| RoomCommand::Leave { reply }).await?
    }

    pub async fn set_muted(&self, muted: bool) -> Result<(), RoomError> {
        self.request(|reply| RoomCommand::SetMuted { muted, reply }).await
    }

    pub async fn set_video_hidden(&self, hidden: bool) -> Result<(), RoomError> {
        self.request(|reply| RoomCommand::SetVideoHidden { hidden, reply }).await
    }

    pub async fn start_speech(&self) -> Result<(), RoomError> {
        self.request(|reply| RoomCommand::StartSpeech { reply }).await?
    }

    /// `false` if there was nothing to stop or another transition is running.
    pub async fn stop_speech(&self) -> Result<bool, RoomError> {
        self.request(|reply| RoomCommand::StopSpeech { reply }).await
    }

    /// Manually redial a peer, clearing its attempt history first.
    pub async fn retry_peer(&self, peer_id: impl Into<PeerId>) -> Result<bool, RoomError> {
        let peer_id = peer_id.into();
        self.request(|reply| RoomCommand::RetryPeer { peer_id, reply }).await
    }

    pub async fn check_health(&self) -> Result<HealthReport, RoomError> {
        self.request(|reply| RoomCommand::CheckHealth { reply }).await
    }

    pub async fn snapshot(&self) -> Result<RoomSnapshot, RoomError> {
        self.request(|reply| RoomCommand::Snapshot { reply }).await
    }

    /// Leave if seated, then tear down signaling and the media plane.
    pub async fn shutdown(&self) -> Result<(), RoomError> {
        self.request(|reply| RoomCommand::Shutdown { reply }).await
    }
}
