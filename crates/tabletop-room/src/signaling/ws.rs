//! WebSocket pub/sub transport with automatic reconnection.
//!
//! Frames on the wire:
//! - client → server: `{"op":"attach","channel","client_id"}` after every
//!   (re)connect, `{"op":"publish","channel","name","data","client_id"}`,
//!   `{"op":"ping"}` as a heartbeat
//! - server → client: `{"op":"message","channel","name","data","client_id"}`

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{ConnectionState, PubSubTransport, SignalFrame, TransportEvent};
use crate::error::SignalingError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct WsOptions {
    pub heartbeat_interval: Duration,
    /// First reconnect delay; doubles per attempt.
    pub reconnect_base: Duration,
    pub max_backoff: Duration,
    /// Report `Suspended` after this many failed reconnects.
    pub suspend_after: u32,
    /// Report `Failed` and stop after this many failed reconnects.
    pub max_reconnect: u32,
}

impl Default for WsOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(25),
            reconnect_base: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            suspend_after: 3,
            max_reconnect: 10,
        }
    }
}

impl From<&tabletop_common::config::SignalingConfig> for WsOptions {
    fn from(cfg: &tabletop_common::config::SignalingConfig) -> Self {
        Self {
            suspend_after: cfg.suspend_after,
            max_reconnect: cfg.max_reconnect,
            ..Self::default()
        }
    }
}

impl WsOptions {
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.reconnect_base.saturating_mul(factor).min(self.max_backoff)
    }
}

pub struct WsTransport {
    url: String,
    options: WsOptions,
    outbound: Mutex<Option<mpsc::UnboundedSender<SignalFrame>>>,
    cancel: Mutex<CancellationToken>,
}

impl WsTransport {
    pub fn new(url: impl Into<String>, options: WsOptions) -> Self {
        Self {
            url: url.into(),
            options,
            outbound: Mutex::new(None),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }
}

#[async_trait]
impl PubSubTransport for WsTransport {
    async fn open(
        &self,
        channel: &str,
        client_id: &str,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<(), SignalingError> {
        let (ws, _) = connect_async(self.url.as_str()).await?;
        info!(url = %self.url, channel = %channel, "Signaling socket connected");

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let previous = std::mem::replace(&mut *self.cancel.lock().await, cancel.clone());
        previous.cancel();
        *self.outbound.lock().await = Some(tx);

        let link = Link {
            url: self.url.clone(),
            channel: channel.to_owned(),
            client_id: client_id.to_owned(),
            options: self.options.clone(),
            events,
            cancel,
        };
        tokio::spawn(link.run(ws, rx));
        Ok(())
    }

    async fn send(&self, frame: SignalFrame) -> Result<(), SignalingError> {
        let outbound = self.outbound.lock().await;
        let tx = outbound.as_ref().ok_or(SignalingError::Closed)?;
        tx.send(frame).map_err(|_| SignalingError::Closed)
    }

    async fn close(&self) {
        self.cancel.lock().await.cancel();
        self.outbound.lock().await.take();
    }
}

enum Closed {
    Local,
    Remote,
}

/// State owned by the background connection task.
struct Link {
    url: String,
    channel: String,
    client_id: String,
    options: WsOptions,
    events: mpsc::UnboundedSender<TransportEvent>,
    cancel: CancellationToken,
}

impl Link {
    async fn run(self, mut ws: WsStream, mut outbound: mpsc::UnboundedReceiver<SignalFrame>) {
        loop {
            let local_close = match self.session(ws, &mut outbound).await {
                Ok(Closed::Local) => true,
                Ok(Closed::Remote) => {
                    debug!(channel = %self.channel, "Signaling socket closed by server");
                    false
                }
                Err(e) => {
                    warn!(channel = %self.channel, error = %e, "Signaling socket error");
                    false
                }
            };
            if local_close || self.cancel.is_cancelled() {
                self.report(ConnectionState::Closed, None);
                return;
            }
            self.report(ConnectionState::Disconnected, None);

            ws = match self.reconnect().await {
                Some(ws) => ws,
                None => return,
            };
            info!(channel = %self.channel, "Signaling socket reconnected");
            self.report(ConnectionState::Connected, None);
        }
    }

    async fn reconnect(&self) -> Option<WsStream> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            if attempts > self.options.max_reconnect {
                error!(channel = %self.channel, "Signaling: max reconnect attempts reached");
                self.report(
                    ConnectionState::Failed,
                    Some(format!("gave up after {} reconnect attempts", self.options.max_reconnect)),
                );
                return None;
            }
            if attempts == self.options.suspend_after + 1 {
                self.report(ConnectionState::Suspended, None);
            }

            let delay = self.options.backoff(attempts);
            warn!(channel = %self.channel, attempt = attempts, ?delay, "Signaling: reconnecting");
            tokio::select! {
                _ = sleep(delay) => {}
                _ = self.cancel.cancelled() => return None,
            }

            match connect_async(self.url.as_str()).await {
                Ok((ws, _)) => return Some(ws),
                Err(e) => debug!(attempt = attempts, error = %e, "Signaling reconnect failed"),
            }
        }
    }

    async fn session(
        &self,
        ws: WsStream,
        outbound: &mut mpsc::UnboundedReceiver<SignalFrame>,
    ) -> Result<Closed, SignalingError> {
        let (mut sink, mut stream) = ws.split();
        let attach = json!({ "op": "attach", "channel": self.channel, "client_id": self.client_id });
        sink.send(Message::Text(attach.to_string().into())).await?;

        let mut heartbeat = tokio::time::interval(self.options.heartbeat_interval);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                msg = stream.next() => {
                    let Some(msg) = msg else { return Ok(Closed::Remote) };
                    match msg? {
                        Message::Text(text) => self.dispatch(text.as_str()),
                        Message::Close(_) => return Ok(Closed::Remote),
                        _ => {}
                    }
                }
                frame = outbound.recv() => {
                    let Some(frame) = frame else {
                        let _ = sink.send(Message::Close(None)).await;
                        return Ok(Closed::Local);
                    };
                    let publish = json!({
                        "op": "publish",
                        "channel": self.channel,
                        "name": frame.event,
                        "data": frame.payload,
                        "client_id": frame.sender,
                    });
                    sink.send(Message::Text(publish.to_string().into())).await?;
                }
                _ = heartbeat.tick() => {
                    sink.send(Message::Text(json!({ "op": "ping" }).to_string().into())).await?;
                }
                _ = self.cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok(Closed::Local);
                }
            }
        }
    }

    fn dispatch(&self, text: &str) {
        let payload: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "Signaling: unparseable frame");
                return;
            }
        };
        if payload["op"].as_str() != Some("message") {
            return;
        }
        if payload["channel"].as_str().is_some_and(|c| c != self.channel) {
            return;
        }
        let (Some(name), Some(sender)) = (payload["name"].as_str(), payload["client_id"].as_str())
        else {
            warn!("Signaling: message frame without name or client_id");
            return;
        };
        let frame = SignalFrame {
            event: name.to_owned(),
            sender: sender.to_owned(),
            payload: payload.get("data").cloned().unwrap_or(Value::Null),
        };
        let _ = self.events.send(TransportEvent::Frame(frame));
    }

    fn report(&self, state: ConnectionState, reason: Option<String>) {
        let _ = self.events.send(TransportEvent::State { state, reason });
    }
}
