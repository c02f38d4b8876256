//! Room signaling over a pub/sub channel.
//!
//! [`SignalingChannel`] sits on top of a [`PubSubTransport`] and turns raw
//! transport activity into [`SignalingEvent`]s: connection-state changes
//! (with reconnections reported distinctly) and inbound messages, minus our
//! own echoes and events nobody subscribed to.

pub mod memory;
pub mod messages;
pub mod ws;

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::SignalingError;

pub use memory::{MemoryHub, MemoryTransport};
pub use messages::{ParticipantData, ROOM_EVENTS, RoomSignal, SlotId};
pub use ws::{WsOptions, WsTransport};

/// One message on the room channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalFrame {
    pub event: String,
    /// Peer id of the publisher.
    pub sender: String,
    pub payload: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Initialized,
    Connecting,
    Connected,
    Disconnected,
    Suspended,
    Closed,
    Failed,
}

/// Raw activity reported by a transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    State {
        state: ConnectionState,
        reason: Option<String>,
    },
    Frame(SignalFrame),
}

impl TransportEvent {
    pub fn state(state: ConnectionState) -> Self {
        Self::State { state, reason: None }
    }
}

/// A pub/sub connection scoped to one channel.
///
/// `open` resolves once the first connection is established. After that the
/// transport reports state changes and inbound frames through `events`;
/// reconnecting is its own business.
#[async_trait]
pub trait PubSubTransport: Send + Sync {
    async fn open(
        &self,
        channel: &str,
        client_id: &str,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<(), SignalingError>;

    async fn send(&self, frame: SignalFrame) -> Result<(), SignalingError>;

    async fn close(&self);
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    StateChanged {
        previous: ConnectionState,
        current: ConnectionState,
    },
    Connected,
    /// Connected again after having been connected before.
    Reconnected,
    Disconnected,
    Suspended,
    Failed(String),
    Message(SignalFrame),
}

pub fn channel_name(room_id: &str) -> String {
    format!("room-{room_id}")
}

pub struct SignalingChannel {
    transport: Arc<dyn PubSubTransport>,
    peer_id: Option<String>,
    room_id: Option<String>,
    state: ConnectionState,
    has_connected: bool,
    subscriptions: HashSet<String>,
    inbound: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    pending: VecDeque<SignalingEvent>,
}

impl SignalingChannel {
    pub fn new(transport: Arc<dyn PubSubTransport>) -> Self {
        Self {
            transport,
            peer_id: None,
            room_id: None,
            state: ConnectionState::Initialized,
            has_connected: false,
            subscriptions: HashSet::new(),
            inbound: None,
            pending: VecDeque::new(),
        }
    }

    pub fn current_peer_id(&self) -> Option<&str> {
        self.peer_id.as_deref()
    }

    pub fn set_current_peer_id(&mut self, peer_id: impl Into<String>) {
        self.peer_id = Some(peer_id.into());
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn subscribe(&mut self, event: &str) {
        self.subscriptions.insert(event.to_owned());
    }

    /// Attach to the room channel. The peer id must already be set.
    pub async fn connect(&mut self, room_id: &str) -> Result<(), SignalingError> {
        let peer_id = self.peer_id.clone().ok_or(SignalingError::PeerIdNotSet)?;

        let (tx, rx) = mpsc::unbounded_channel();
        self.inbound = Some(rx);
        self.room_id = Some(room_id.to_owned());
        self.apply(TransportEvent::state(ConnectionState::Connecting));

        let channel = channel_name(room_id);
        match self.transport.open(&channel, &peer_id, tx).await {
            Ok(()) => {
                tracing::info!(channel = %channel, peer = %peer_id, "Signaling connected");
                self.apply(TransportEvent::state(ConnectionState::Connected));
                Ok(())
            }
            Err(e) => {
                tracing::error!(channel = %channel, error = %e, "Signaling connect failed");
                self.apply(TransportEvent::State {
                    state: ConnectionState::Failed,
                    reason: Some(e.to_string()),
                });
                Err(e)
            }
        }
    }

    pub async fn publish(&self, event: &str, payload: Value) -> Result<(), SignalingError> {
        let sender = self.peer_id.clone().ok_or(SignalingError::PeerIdNotSet)?;
        if !self.is_connected() {
            return Err(SignalingError::NotConnected);
        }
        self.transport
            .send(SignalFrame { event: event.to_owned(), sender, payload })
            .await
    }

    pub async fn send_signal(&self, signal: RoomSignal) -> Result<(), SignalingError> {
        let (event, payload) = signal.into_parts()?;
        self.publish(&event, payload).await
    }

    pub async fn disconnect(&mut self) {
        if self.inbound.is_none() {
            return;
        }
        self.transport.close().await;
        self.apply(TransportEvent::state(ConnectionState::Closed));
        self.inbound = None;
        tracing::info!(room = ?self.room_id, "Signaling closed");
    }

    /// Next event for the session loop. Cancel-safe; returns `None` when the
    /// channel was never connected or the transport went away.
    pub async fn next_event(&mut self) -> Option<SignalingEvent> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(event);
            }
            let raw = self.inbound.as_mut()?.recv().await?;
            self.apply(raw);
        }
    }

    fn apply(&mut self, raw: TransportEvent) {
        match raw {
            TransportEvent::Frame(frame) => {
                if self.peer_id.as_deref() == Some(frame.sender.as_str()) {
                    return;
                }
                if !self.subscriptions.contains(&frame.event) {
                    tracing::trace!(event = %frame.event, "Dropping unsubscribed signal");
                    return;
                }
                self.pending.push_back(SignalingEvent::Message(frame));
            }
            TransportEvent::State { state, reason } => {
                if state == self.state {
                    return;
                }
                let previous = std::mem::replace(&mut self.state, state);
                tracing::debug!(?previous, current = ?state, "Signaling state changed");
                self.pending.push_back(SignalingEvent::StateChanged { previous, current: state });

                let follow_up = match state {
                    ConnectionState::Connected if self.has_connected => Some(SignalingEvent::Reconnected),
                    ConnectionState::Connected => {
                        self.has_connected = true;
                        Some(SignalingEvent::Connected)
                    }
                    ConnectionState::Disconnected => Some(SignalingEvent::Disconnected),
                    ConnectionState::Suspended => Some(SignalingEvent::Suspended),
                    ConnectionState::Failed => Some(SignalingEvent::Failed(
                        reason.unwrap_or_else(|| "connection failed".into()),
                    )),
                    _ => None,
                };
                self.pending.extend(follow_up);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn drain(channel: &mut SignalingChannel) -> Vec<SignalingEvent> {
        let mut out = Vec::new();
        while let Ok(Some(ev)) =
            tokio::time::timeout(std::time::Duration::from_millis(50), channel.next_event()).await
        {
            out.push(ev);
        }
        out
    }

    #[tokio::test]
    async fn connect_without_peer_id_never_opens_transport() {
        let hub = MemoryHub::new();
        let transport = hub.transport();
        let mut channel = SignalingChannel::new(Arc::new(transport.clone()));

        let err = channel.connect("12").await.unwrap_err();
        assert!(matches!(err, SignalingError::PeerIdNotSet));
        assert!(!transport.is_open().await);
        assert_eq!(channel.state(), ConnectionState::Initialized);
    }

    #[tokio::test]
    async fn second_connection_is_reported_as_reconnected() {
        let hub = MemoryHub::new();
        let transport = hub.transport();
        let mut channel = SignalingChannel::new(Arc::new(transport.clone()));
        channel.set_current_peer_id("aaa");
        channel.connect("12").await.unwrap();

        let first = drain(&mut channel).await;
        assert!(first.contains(&SignalingEvent::Connected));
        assert!(!first.contains(&SignalingEvent::Reconnected));

        transport.simulate_disconnect().await;
        transport.simulate_reconnect().await;
        let events = drain(&mut channel).await;
        assert_eq!(
            events,
            vec![
                SignalingEvent::StateChanged {
                    previous: ConnectionState::Connected,
                    current: ConnectionState::Disconnected,
                },
                SignalingEvent::Disconnected,
                SignalingEvent::StateChanged {
                    previous: ConnectionState::Disconnected,
                    current: ConnectionState::Connected,
                },
                SignalingEvent::Reconnected,
            ]
        );
    }

    #[tokio::test]
    async fn drops_echoes_and_unsubscribed_events() {
        let hub = MemoryHub::new();
        let mut alice = SignalingChannel::new(Arc::new(hub.transport()));
        alice.set_current_peer_id("alice");
        alice.subscribe(messages::USER_JOINED);
        alice.connect("12").await.unwrap();

        let mut bob = SignalingChannel::new(Arc::new(hub.transport()));
        bob.set_current_peer_id("bob");
        bob.connect("12").await.unwrap();

        alice.publish(messages::USER_JOINED, serde_json::json!({ "own": true })).await.unwrap();
        bob.publish("dice-roll", serde_json::json!({ "d": 20 })).await.unwrap();
        bob.publish(messages::USER_JOINED, serde_json::json!({ "slot_id": 2 })).await.unwrap();

        let messages: Vec<_> = drain(&mut alice)
            .await
            .into_iter()
            .filter_map(|e| match e {
                SignalingEvent::Message(f) => Some(f),
                _ => None,
            })
            .collect();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].sender, "bob");
        assert_eq!(messages[0].payload["slot_id"], 2);
    }

    #[tokio::test]
    async fn publish_while_disconnected_is_rejected() {
        let hub = MemoryHub::new();
        let transport = hub.transport();
        let mut channel = SignalingChannel::new(Arc::new(transport.clone()));
        channel.set_current_peer_id("aaa");
        channel.connect("12").await.unwrap();

        transport.simulate_disconnect().await;
        let _ = drain(&mut channel).await;
        let err = channel.publish(messages::REQUEST_STATE, Value::Null).await.unwrap_err();
        assert!(matches!(err, SignalingError::NotConnected));
    }
}
