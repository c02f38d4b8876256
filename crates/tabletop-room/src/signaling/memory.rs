//! In-process pub/sub hub.
//!
//! Used for tests and local single-process rooms. Each transport can be
//! knocked offline and brought back to exercise reconnection handling;
//! frames published while a transport is offline never reach it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::task::JoinHandle;

use super::{ConnectionState, PubSubTransport, SignalFrame, TransportEvent};
use crate::error::SignalingError;

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone, Default)]
pub struct MemoryHub {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<SignalFrame>>>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            hub: self.clone(),
            online: Arc::new(AtomicBool::new(false)),
            link: Arc::new(Mutex::new(None)),
        }
    }

    async fn sender(&self, channel: &str) -> broadcast::Sender<SignalFrame> {
        self.channels
            .lock()
            .await
            .entry(channel.to_owned())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

struct Link {
    publisher: broadcast::Sender<SignalFrame>,
    events: mpsc::UnboundedSender<TransportEvent>,
    forwarder: JoinHandle<()>,
}

/// One client's attachment to a [`MemoryHub`]. Clones share the attachment.
#[derive(Clone)]
pub struct MemoryTransport {
    hub: MemoryHub,
    online: Arc<AtomicBool>,
    link: Arc<Mutex<Option<Link>>>,
}

impl MemoryTransport {
    pub async fn is_open(&self) -> bool {
        self.link.lock().await.is_some()
    }

    pub async fn simulate_disconnect(&self) {
        self.set_online(false, ConnectionState::Disconnected).await;
    }

    pub async fn simulate_reconnect(&self) {
        self.set_online(true, ConnectionState::Connected).await;
    }

    async fn set_online(&self, online: bool, state: ConnectionState) {
        let link = self.link.lock().await;
        let Some(link) = link.as_ref() else { return };
        if self.online.swap(online, Ordering::SeqCst) != online {
            let _ = link.events.send(TransportEvent::state(state));
        }
    }
}

#[async_trait]
impl PubSubTransport for MemoryTransport {
    async fn open(
        &self,
        channel: &str,
        client_id: &str,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<(), SignalingError> {
        let publisher = self.hub.sender(channel).await;
        let mut rx = publisher.subscribe();
        let online = self.online.clone();
        let forward_to = events.clone();
        let client = client_id.to_owned();

        let forwarder = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(frame) => {
                        if online.load(Ordering::SeqCst)
                            && forward_to.send(TransportEvent::Frame(frame)).is_err()
                        {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(client = %client, skipped = n, "Memory transport lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        self.online.store(true, Ordering::SeqCst);
        if let Some(old) = self.link.lock().await.replace(Link { publisher, events, forwarder }) {
            old.forwarder.abort();
        }
        Ok(())
    }

    async fn send(&self, frame: SignalFrame) -> Result<(), SignalingError> {
        let link = self.link.lock().await;
        let link = link.as_ref().ok_or(SignalingError::Closed)?;
        if !self.online.load(Ordering::SeqCst) {
            return Err(SignalingError::NotConnected);
        }
        // No receivers is not an error for a pub/sub channel.
        let _ = link.publisher.send(frame);
        Ok(())
    }

    async fn close(&self) {
        self.online.store(false, Ordering::SeqCst);
        if let Some(link) = self.link.lock().await.take() {
            link.forwarder.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frame(sender: &str) -> SignalFrame {
        SignalFrame { event: "user-joined".into(), sender: sender.into(), payload: json!({}) }
    }

    async fn next_frame(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Option<SignalFrame> {
        loop {
            match tokio::time::timeout(std::time::Duration::from_millis(50), rx.recv()).await {
                Ok(Some(TransportEvent::Frame(f))) => return Some(f),
                Ok(Some(TransportEvent::State { .. })) => continue,
                _ => return None,
            }
        }
    }

    #[tokio::test]
    async fn frames_fan_out_per_channel() {
        let hub = MemoryHub::new();
        let (a, b, other) = (hub.transport(), hub.transport(), hub.transport());
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        let (o_tx, mut o_rx) = mpsc::unbounded_channel();
        a.open("room-1", "a", a_tx).await.unwrap();
        b.open("room-1", "b", b_tx).await.unwrap();
        other.open("room-2", "o", o_tx).await.unwrap();

        a.send(frame("a")).await.unwrap();

        assert_eq!(next_frame(&mut b_rx).await.unwrap().sender, "a");
        // The publisher hears its own frame; filtering echoes is the channel's job.
        assert_eq!(next_frame(&mut a_rx).await.unwrap().sender, "a");
        assert!(next_frame(&mut o_rx).await.is_none());
    }

    #[tokio::test]
    async fn offline_transport_misses_frames_and_cannot_send() {
        let hub = MemoryHub::new();
        let (a, b) = (hub.transport(), hub.transport());
        let (a_tx, _a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        a.open("room-1", "a", a_tx).await.unwrap();
        b.open("room-1", "b", b_tx).await.unwrap();

        b.simulate_disconnect().await;
        assert!(matches!(b.send(frame("b")).await, Err(SignalingError::NotConnected)));
        a.send(frame("a")).await.unwrap();
        assert!(next_frame(&mut b_rx).await.is_none());

        b.simulate_reconnect().await;
        a.send(frame("a")).await.unwrap();
        assert_eq!(next_frame(&mut b_rx).await.unwrap().sender, "a");
    }
}
