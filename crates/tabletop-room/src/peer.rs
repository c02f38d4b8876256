//! Mesh of peer-to-peer media calls.
//!
//! The media plane itself is behind [`PeerConnector`]. The manager decides
//! who calls whom, keeps at most one call per remote peer, and turns the
//! connector's raw [`PeerEvent`]s into [`PeerNotice`]s for the session.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::PeerError;
use crate::ice::IceServer;
use crate::media::MediaStream;

pub type PeerId = String;

/// Of two peers, the one with the larger id places the call.
pub fn should_initiate(local: &str, remote: &str) -> bool {
    local > remote
}

/// Raw activity from the media plane.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    IncomingCall { peer_id: PeerId },
    RemoteStream { peer_id: PeerId, stream: Arc<MediaStream> },
    Closed { peer_id: PeerId },
    Error { peer_id: PeerId, reason: String },
}

/// Peer-to-peer media plane.
///
/// Calls are identified by the remote peer id. `dial` resolves once the call
/// has been placed; the connection counts as established when the remote
/// stream arrives as [`PeerEvent::RemoteStream`].
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Register under `peer_id`; events for this endpoint go to `events`.
    async fn register(
        &self,
        peer_id: &str,
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> anyhow::Result<()>;

    async fn dial(&self, remote: &str, stream: Arc<MediaStream>, ice: &[IceServer]) -> anyhow::Result<()>;

    /// Accept a pending incoming call.
    async fn answer(&self, remote: &str, stream: Arc<MediaStream>) -> anyhow::Result<()>;

    /// Refuse a pending incoming call.
    async fn decline(&self, remote: &str);

    /// Tear down our call with `remote`, established or still dialing.
    async fn hang_up(&self, remote: &str);

    async fn shutdown(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallState {
    Dialing,
    Answering,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Outgoing,
    Incoming,
}

#[derive(Debug)]
struct Call {
    state: CallState,
    direction: Direction,
    since: Instant,
}

/// What the session needs to hear about.
#[derive(Debug, Clone)]
pub enum PeerNotice {
    RemoteStream { peer_id: PeerId, stream: Arc<MediaStream> },
    Disconnected { peer_id: PeerId },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PeerStats {
    pub peer_id: Option<PeerId>,
    pub active_calls: usize,
    pub connected_peers: Vec<PeerId>,
    pub has_local_stream: bool,
}

pub struct PeerConnectionManager {
    connector: Arc<dyn PeerConnector>,
    peer_id: Option<PeerId>,
    local_stream: Option<Arc<MediaStream>>,
    calls: HashMap<PeerId, Call>,
    events: Option<mpsc::UnboundedReceiver<PeerEvent>>,
}

impl PeerConnectionManager {
    pub fn new(connector: Arc<dyn PeerConnector>) -> Self {
        Self {
            connector,
            peer_id: None,
            local_stream: None,
            calls: HashMap::new(),
            events: None,
        }
    }

    /// Generate this session's peer id and register it with the media plane.
    pub async fn initialize(&mut self) -> Result<PeerId, PeerError> {
        if let Some(id) = &self.peer_id {
            return Ok(id.clone());
        }
        let id = uuid::Uuid::new_v4().simple().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        self.connector.register(&id, tx).await?;
        tracing::info!(peer = %id, "Peer endpoint registered");
        self.events = Some(rx);
        self.peer_id = Some(id.clone());
        Ok(id)
    }

    pub fn peer_id(&self) -> Option<&str> {
        self.peer_id.as_deref()
    }

    pub fn connector(&self) -> Arc<dyn PeerConnector> {
        self.connector.clone()
    }

    pub fn set_local_stream(&mut self, stream: Option<Arc<MediaStream>>) {
        self.local_stream = stream;
    }

    /// Place a call unless one to `remote` already exists.
    ///
    /// Returns `Ok(true)` when a new call was dialed.
    pub async fn call_peer(&mut self, remote: &str, ice: &[IceServer]) -> Result<bool, PeerError> {
        let me = self.peer_id.as_deref().ok_or(PeerError::NotInitialized)?;
        if me == remote {
            return Ok(false);
        }
        if let Some(call) = self.calls.get(remote) {
            tracing::debug!(peer = %remote, state = ?call.state, "Call already in place");
            return Ok(false);
        }
        let stream = self.local_stream.clone().ok_or(PeerError::NoLocalStream)?;

        self.calls.insert(
            remote.to_owned(),
            Call { state: CallState::Dialing, direction: Direction::Outgoing, since: Instant::now() },
        );
        tracing::debug!(peer = %remote, "Dialing peer");
        match self.connector.dial(remote, stream, ice).await {
            Ok(()) => Ok(true),
            Err(source) => {
                self.calls.remove(remote);
                Err(PeerError::CallFailed { peer: remote.to_owned(), source })
            }
        }
    }

    pub async fn close_call(&mut self, remote: &str) -> bool {
        if self.calls.remove(remote).is_none() {
            return false;
        }
        self.connector.hang_up(remote).await;
        tracing::debug!(peer = %remote, "Call closed");
        true
    }

    /// Calls stay tracked until their hang-up returns, so an interrupted
    /// close leaves the rest for [`Self::detach_all`].
    pub async fn close_all(&mut self) {
        let remotes: Vec<PeerId> = self.calls.keys().cloned().collect();
        for remote in remotes {
            self.connector.hang_up(&remote).await;
            self.calls.remove(&remote);
        }
    }

    /// Forget every call without telling the media plane; returns who was
    /// forgotten so the caller can hang up elsewhere.
    pub fn detach_all(&mut self) -> Vec<PeerId> {
        self.calls.drain().map(|(peer, _)| peer).collect()
    }

    /// Hang up calls that have not produced a stream within `max_age`.
    pub async fn expire_stale_dials(&mut self, max_age: Duration) -> Vec<PeerId> {
        let now = Instant::now();
        let stale: Vec<PeerId> = self
            .calls
            .iter()
            .filter(|(_, c)| c.state != CallState::Connected && now.duration_since(c.since) >= max_age)
            .map(|(p, _)| p.clone())
            .collect();
        for peer in &stale {
            tracing::debug!(peer = %peer, "Dropping call that never connected");
            self.close_call(peer).await;
        }
        stale
    }

    pub fn has_call(&self, remote: &str) -> bool {
        self.calls.contains_key(remote)
    }

    pub fn is_connected_to(&self, remote: &str) -> bool {
        self.calls.get(remote).is_some_and(|c| c.state == CallState::Connected)
    }

    pub fn connected_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .calls
            .iter()
            .filter(|(_, c)| c.state == CallState::Connected)
            .map(|(p, _)| p.clone())
            .collect();
        peers.sort();
        peers
    }

    pub fn stats(&self) -> PeerStats {
        PeerStats {
            peer_id: self.peer_id.clone(),
            active_calls: self.calls.len(),
            connected_peers: self.connected_peers(),
            has_local_stream: self.local_stream.is_some(),
        }
    }

    /// Next raw event from the media plane. Cancel-safe.
    pub async fn next_event(&mut self) -> Option<PeerEvent> {
        self.events.as_mut()?.recv().await
    }

    pub async fn handle_event(&mut self, event: PeerEvent) -> Option<PeerNotice> {
        match event {
            PeerEvent::IncomingCall { peer_id } => {
                self.on_incoming(peer_id).await;
                None
            }
            PeerEvent::RemoteStream { peer_id, stream } => {
                let Some(call) = self.calls.get_mut(&peer_id) else {
                    // Late stream for a call we already closed.
                    tracing::debug!(peer = %peer_id, "Stream for unknown call, hanging up");
                    self.connector.hang_up(&peer_id).await;
                    return None;
                };
                if call.state != CallState::Connected {
                    call.state = CallState::Connected;
                    tracing::info!(peer = %peer_id, "Peer connected");
                }
                Some(PeerNotice::RemoteStream { peer_id, stream })
            }
            PeerEvent::Closed { peer_id } => self.on_closed(peer_id, None),
            PeerEvent::Error { peer_id, reason } => self.on_closed(peer_id, Some(reason)),
        }
    }

    async fn on_incoming(&mut self, remote: PeerId) {
        let Some(stream) = self.local_stream.clone() else {
            tracing::debug!(peer = %remote, "Declining call: not seated");
            self.connector.decline(&remote).await;
            return;
        };

        if let Some(call) = self.calls.get(&remote) {
            let we_win = self.peer_id.as_deref().is_some_and(|me| should_initiate(me, &remote));
            if call.direction == Direction::Incoming || we_win {
                tracing::debug!(peer = %remote, state = ?call.state, "Declining duplicate call");
                self.connector.decline(&remote).await;
                return;
            }
            // Both sides dialed and the remote wins the tie-break: drop ours.
            self.connector.hang_up(&remote).await;
            self.calls.remove(&remote);
        }

        self.calls.insert(
            remote.clone(),
            Call { state: CallState::Answering, direction: Direction::Incoming, since: Instant::now() },
        );
        if let Err(e) = self.connector.answer(&remote, stream).await {
            tracing::warn!(peer = %remote, error = %e, "Failed to answer call");
            self.calls.remove(&remote);
        }
    }

    fn on_closed(&mut self, peer_id: PeerId, reason: Option<String>) -> Option<PeerNotice> {
        self.calls.remove(&peer_id)?;
        match reason {
            Some(reason) => tracing::warn!(peer = %peer_id, %reason, "Peer call failed"),
            None => tracing::info!(peer = %peer_id, "Peer disconnected"),
        }
        Some(PeerNotice::Disconnected { peer_id })
    }
}
