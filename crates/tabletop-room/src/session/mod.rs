//! The room session actor.
//!
//! One [`RoomSession`] per joined room. All state lives on the session task;
//! commands arrive through a [`RoomHandle`], and signaling events, media-plane
//! events, timers and health ticks are multiplexed into the same loop, so no
//! component ever observes another mid-update.
//!
//! ```text
//!  Idle ─initialize─▶ Initializing ─▶ Ready ─join─▶ Joining ─▶ Joined
//!                          │            ▲                         │
//!                          ▼            └──────── Leaving ◀─leave─┘
//!                        Failed
//! ```

mod features;
mod handle;
mod lifecycle;
mod notice;
mod recovery;
mod state;
mod timings;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tabletop_common::http::ApiClient;
use tabletop_common::models::{ParticipantRecord, RoomDescriptor, UploadProviderKind};
use tabletop_upload::{UploadProvider, UploadTuning};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::consent::ConsentProvider;
use crate::health::{ConnectionHealthMonitor, HealthReport};
use crate::ice::IceNegotiationConfig;
use crate::media::{MediaSource, MediaStream};
use crate::peer::{PeerConnectionManager, PeerConnector, PeerEvent, PeerId};
use crate::recording::{MediaRecorder, RecordingController, RecordingTuning};
use crate::signaling::{PubSubTransport, SignalingChannel, SignalingEvent, SlotId};
use crate::speech::{SpeechController, SpeechRecognizer, SpeechTransition};

pub use handle::{RoomCommand, RoomHandle};
pub use notice::RoomNotice;
pub use state::{OccupantInfo, RoomSnapshot, SessionState, SlotMap, SlotOccupant};
pub use timings::RoomTimings;

const COMMAND_BUFFER: usize = 64;
const NOTICE_BUFFER: usize = 256;

/// Builds a fresh upload provider for each recording segment.
pub type UploadFactory = Arc<dyn Fn() -> Box<dyn UploadProvider> + Send + Sync>;

pub struct RecordingSetup {
    pub recorder: Arc<dyn MediaRecorder>,
    pub uploads: UploadFactory,
    pub tuning: RecordingTuning,
}

impl RecordingSetup {
    /// Recordings go to the provider `kind`, fixed for the whole session.
    pub fn new(
        recorder: Arc<dyn MediaRecorder>,
        kind: UploadProviderKind,
        api: ApiClient,
        upload: UploadTuning,
        tuning: RecordingTuning,
    ) -> Self {
        Self {
            recorder,
            uploads: Arc::new(move || tabletop_upload::providers::create(kind, api.clone(), &upload)),
            tuning,
        }
    }
}

/// Collaborators a session is built from.
pub struct RoomDeps {
    pub transport: Arc<dyn PubSubTransport>,
    pub connector: Arc<dyn PeerConnector>,
    pub media: Arc<dyn MediaSource>,
    pub consent: Arc<dyn ConsentProvider>,
    pub ice: IceNegotiationConfig,
    pub speech: Option<Arc<dyn SpeechRecognizer>>,
    pub recording: Option<RecordingSetup>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LeaveOutcome {
    /// Cleanup finished within the leave timeout.
    pub clean: bool,
    pub elapsed: Duration,
}

/// Work the session schedules for itself.
#[derive(Debug)]
enum Internal {
    Reannounce { epoch: u64 },
    Reconcile { epoch: u64 },
    RetryPeer { peer_id: PeerId, epoch: u64 },
    SpeechSettled { transition: SpeechTransition, ok: bool },
}

enum Step {
    Command(RoomCommand),
    Closed,
    Signaling(SignalingEvent),
    Peer(PeerEvent),
    Internal(Internal),
    HealthTick,
}

pub struct RoomSession {
    room: Arc<RoomDescriptor>,
    me: ParticipantRecord,
    timings: RoomTimings,
    state: SessionState,

    signaling: SignalingChannel,
    peers: PeerConnectionManager,
    ice: IceNegotiationConfig,
    health: ConnectionHealthMonitor,
    last_health: Option<HealthReport>,
    recovery_epoch: u64,

    media: Arc<dyn MediaSource>,
    consent: Arc<dyn ConsentProvider>,
    recognizer: Option<Arc<dyn SpeechRecognizer>>,
    speech: SpeechController,
    recording_setup: Option<RecordingSetup>,
    recording: Option<RecordingController>,

    slots: SlotMap,
    local_slot: Option<SlotId>,
    local_stream: Option<Arc<MediaStream>>,
    /// Remote streams that arrived before their owner announced a slot.
    parked_streams: HashMap<PeerId, Arc<MediaStream>>,
    muted: bool,
    video_hidden: bool,

    notices: broadcast::Sender<RoomNotice>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
}

impl RoomSession {
    pub fn new(room: Arc<RoomDescriptor>, me: ParticipantRecord, deps: RoomDeps, timings: RoomTimings) -> Self {
        let (notices, _) = broadcast::channel(NOTICE_BUFFER);
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        Self {
            slots: SlotMap::new(room.slot_count),
            room,
            me,
            health: ConnectionHealthMonitor::new(timings.health_check_interval, timings.refresh.clone()),
            timings,
            state: SessionState::Idle,
            signaling: SignalingChannel::new(deps.transport),
            peers: PeerConnectionManager::new(deps.connector),
            ice: deps.ice,
            last_health: None,
            recovery_epoch: 0,
            media: deps.media,
            consent: deps.consent,
            recognizer: deps.speech,
            speech: SpeechController::new(),
            recording_setup: deps.recording,
            recording: None,
            local_slot: None,
            local_stream: None,
            parked_streams: HashMap::new(),
            muted: false,
            video_hidden: false,
            notices,
            internal_tx,
            internal_rx,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn peer_id(&self) -> Option<&str> {
        self.peers.peer_id()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoomNotice> {
        self.notices.subscribe()
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            room_id: self.room.room_id.clone(),
            state: self.state,
            peer_id: self.peers.peer_id().map(str::to_owned),
            local_slot: self.local_slot,
            muted: self.muted,
            video_hidden: self.video_hidden,
            signaling: self.signaling.state(),
            occupants: self.slots.occupants(),
            peers: self.peers.stats(),
            speech: self.speech.snapshot(),
            recording: self.recording.as_ref().map(RecordingController::stats),
            last_health: self.last_health.clone(),
        }
    }

    /// Move the session onto its own task.
    pub fn spawn(self) -> (RoomHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let handle = RoomHandle::new(tx, self.notices.clone());
        let task = tokio::spawn(self.run(rx));
        (handle, task)
    }

    pub async fn run(mut self, mut commands: mpsc::Receiver<RoomCommand>) {
        let period = self.timings.health_check_interval;
        let mut health_tick = tokio::time::interval_at(Instant::now() + period, period);
        health_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let step = tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => Step::Command(cmd),
                    None => Step::Closed,
                },
                Some(event) = self.signaling.next_event() => Step::Signaling(event),
                Some(event) = self.peers.next_event() => Step::Peer(event),
                Some(event) = self.internal_rx.recv() => Step::Internal(event),
                _ = health_tick.tick() => Step::HealthTick,
            };

            match step {
                Step::Command(cmd) => {
                    if !self.handle_command(cmd).await {
                        break;
                    }
                }
                Step::Closed => {
                    self.shutdown().await;
                    break;
                }
                Step::Signaling(event) => self.handle_signaling(event).await,
                Step::Peer(event) => self.handle_peer_event(event).await,
                Step::Internal(event) => self.handle_internal(event).await,
                Step::HealthTick => {
                    self.run_health_check().await;
                }
            }
        }

        tracing::info!(room = %self.room.room_id, "Room session stopped");
    }

    /// Returns `false` once the session should stop.
    async fn handle_command(&mut self, cmd: RoomCommand) -> bool {
        match cmd {
            RoomCommand::Join { slot_id, reply } => {
                let _ = reply.send(self.join(slot_id).await);
            }
            RoomCommand::Leave { reply } => {
                let _ = reply.send(self.leave().await);
            }
            RoomCommand::SetMuted { muted, reply } => {
                self.set_muted(muted).await;
                let _ = reply.send(());
            }
            RoomCommand::SetVideoHidden { hidden, reply } => {
                self.set_video_hidden(hidden);
                let _ = reply.send(());
            }
            RoomCommand::StartSpeech { reply } => {
                let _ = reply.send(self.start_speech().await);
            }
            RoomCommand::StopSpeech { reply } => {
                let _ = reply.send(self.stop_speech());
            }
            RoomCommand::RetryPeer { peer_id, reply } => {
                self.health.reset(&peer_id);
                let _ = reply.send(self.redial(&peer_id).await);
            }
            RoomCommand::CheckHealth { reply } => {
                let _ = reply.send(self.run_health_check().await);
            }
            RoomCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            RoomCommand::Shutdown { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
                return false;
            }
        }
        true
    }

    async fn handle_internal(&mut self, event: Internal) {
        let current = self.recovery_epoch;
        let joined = self.state == SessionState::Joined;
        match event {
            Internal::SpeechSettled { transition, ok } => self.on_speech_settled(transition, ok).await,
            Internal::Reannounce { epoch } if epoch == current && joined => self.announce_presence().await,
            Internal::Reconcile { epoch } if epoch == current && joined => self.reconcile_after_reconnect(epoch).await,
            Internal::RetryPeer { peer_id, epoch } if epoch == current && joined => {
                self.retry_after_reconnect(&peer_id).await
            }
            stale => tracing::debug!(?stale, "Dropping outdated recovery step"),
        }
    }

    fn set_state(&mut self, to: SessionState) {
        let from = std::mem::replace(&mut self.state, to);
        if from != to {
            tracing::debug!(room = %self.room.room_id, ?from, ?to, "Session state changed");
            self.notify(RoomNotice::StateChanged { from, to });
        }
    }

    fn notify(&self, notice: RoomNotice) {
        // No subscribers is fine.
        let _ = self.notices.send(notice);
    }

    fn schedule(&self, delay: Duration, event: Internal) {
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(event);
        });
    }
}
