//! Shared fixtures: an in-process peer network, fake capture devices and a
//! harness that spins up sessions on one signaling hub.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tabletop_common::models::{
    ParticipantRecord, RecordingMetadata, RoomDescriptor, RoomFeatures, UploadProviderKind, UploadReceipt,
};
use tabletop_room::consent::StaticConsent;
use tabletop_room::ice::{IceNegotiationConfig, IceServer};
use tabletop_room::media::{MediaSource, MediaStream, MediaTrack, TrackKind};
use tabletop_room::peer::{PeerConnector, PeerEvent, PeerId};
use tabletop_room::recording::{MediaRecorder, RecordingTuning};
use tabletop_room::signaling::{channel_name, MemoryHub, MemoryTransport, PubSubTransport, SignalFrame, TransportEvent};
use tabletop_room::speech::SpeechRecognizer;
use tabletop_room::{RecordingSetup, RoomDeps, RoomHandle, RoomNotice, RoomSession, RoomTimings};
use tabletop_upload::{UploadError, UploadProvider, UploadStats, UploadStatus};
use tokio::sync::{broadcast, mpsc};

/// Let every task run until the runtime is idle again.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[derive(Default)]
struct Net {
    endpoints: HashMap<PeerId, mpsc::UnboundedSender<PeerEvent>>,
    /// Placed but unanswered calls, keyed `(caller, callee)`.
    offers: HashMap<(PeerId, PeerId), Arc<MediaStream>>,
    links: HashSet<(PeerId, PeerId)>,
    dials: Vec<(PeerId, PeerId)>,
    unreachable: HashSet<PeerId>,
}

fn link(a: &str, b: &str) -> (PeerId, PeerId) {
    if a < b { (a.to_owned(), b.to_owned()) } else { (b.to_owned(), a.to_owned()) }
}

/// Media plane where every call is answered instantly in-process.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    net: Arc<Mutex<Net>>,
}

impl LoopbackNetwork {
    pub fn connector(&self) -> Arc<LoopbackConnector> {
        Arc::new(LoopbackConnector { net: self.net.clone(), me: Mutex::new(None) })
    }

    pub fn dials(&self) -> Vec<(PeerId, PeerId)> {
        self.net.lock().unwrap().dials.clone()
    }

    pub fn dial_count(&self, from: &str, to: &str) -> usize {
        self.net.lock().unwrap().dials.iter().filter(|(f, t)| f == from && t == to).count()
    }

    pub fn is_linked(&self, a: &str, b: &str) -> bool {
        self.net.lock().unwrap().links.contains(&link(a, b))
    }

    /// Calls to `peer` are placed but never ring.
    pub fn set_unreachable(&self, peer: &str, unreachable: bool) {
        let mut net = self.net.lock().unwrap();
        if unreachable {
            net.unreachable.insert(peer.to_owned());
        } else {
            net.unreachable.remove(peer);
        }
    }

    /// Tear down a link as if the network dropped it.
    pub fn cut(&self, a: &str, b: &str) {
        let mut net = self.net.lock().unwrap();
        if net.links.remove(&link(a, b)) {
            for (me, other) in [(a, b), (b, a)] {
                if let Some(tx) = net.endpoints.get(me) {
                    let _ = tx.send(PeerEvent::Closed { peer_id: other.to_owned() });
                }
            }
        }
    }
}

pub struct LoopbackConnector {
    net: Arc<Mutex<Net>>,
    me: Mutex<Option<PeerId>>,
}

impl LoopbackConnector {
    fn me(&self) -> anyhow::Result<PeerId> {
        self.me.lock().unwrap().clone().ok_or_else(|| anyhow::anyhow!("not registered"))
    }
}

#[async_trait]
impl PeerConnector for LoopbackConnector {
    async fn register(&self, peer_id: &str, events: mpsc::UnboundedSender<PeerEvent>) -> anyhow::Result<()> {
        *self.me.lock().unwrap() = Some(peer_id.to_owned());
        self.net.lock().unwrap().endpoints.insert(peer_id.to_owned(), events);
        Ok(())
    }

    async fn dial(&self, remote: &str, stream: Arc<MediaStream>, _: &[IceServer]) -> anyhow::Result<()> {
        let me = self.me()?;
        let mut net = self.net.lock().unwrap();
        net.dials.push((me.clone(), remote.to_owned()));
        if net.unreachable.contains(remote) {
            return Ok(());
        }
        let Some(tx) = net.endpoints.get(remote).cloned() else { return Ok(()) };
        net.offers.insert((me.clone(), remote.to_owned()), stream);
        let _ = tx.send(PeerEvent::IncomingCall { peer_id: me });
        Ok(())
    }

    async fn answer(&self, caller: &str, stream: Arc<MediaStream>) -> anyhow::Result<()> {
        let me = self.me()?;
        let mut net = self.net.lock().unwrap();
        let offer = net
            .offers
            .remove(&(caller.to_owned(), me.clone()))
            .ok_or_else(|| anyhow::anyhow!("no pending call from {caller}"))?;
        net.links.insert(link(&me, caller));
        if let Some(tx) = net.endpoints.get(&me) {
            let _ = tx.send(PeerEvent::RemoteStream { peer_id: caller.to_owned(), stream: offer });
        }
        if let Some(tx) = net.endpoints.get(caller) {
            let _ = tx.send(PeerEvent::RemoteStream { peer_id: me, stream });
        }
        Ok(())
    }

    async fn decline(&self, caller: &str) {
        let Ok(me) = self.me() else { return };
        let mut net = self.net.lock().unwrap();
        let pending = net.offers.remove(&(caller.to_owned(), me.clone())).is_some();
        // With crossing calls the caller resolves the tie itself.
        if pending && !net.offers.contains_key(&(me.clone(), caller.to_owned())) {
            if let Some(tx) = net.endpoints.get(caller) {
                let _ = tx.send(PeerEvent::Closed { peer_id: me });
            }
        }
    }

    async fn hang_up(&self, remote: &str) {
        let Ok(me) = self.me() else { return };
        let mut net = self.net.lock().unwrap();
        net.offers.remove(&(me.clone(), remote.to_owned()));
        if net.links.remove(&link(&me, remote)) {
            if let Some(tx) = net.endpoints.get(remote) {
                let _ = tx.send(PeerEvent::Closed { peer_id: me });
            }
        }
    }

    async fn shutdown(&self) {
        let Ok(me) = self.me() else { return };
        let mut net = self.net.lock().unwrap();
        net.endpoints.remove(&me);
        let mine: Vec<_> = net.links.iter().filter(|(a, b)| *a == me || *b == me).cloned().collect();
        for pair in mine {
            net.links.remove(&pair);
            let other = if pair.0 == me { &pair.1 } else { &pair.0 };
            if let Some(tx) = net.endpoints.get(other) {
                let _ = tx.send(PeerEvent::Closed { peer_id: me.clone() });
            }
        }
    }
}

pub struct FakeMedia {
    tracks: Vec<MediaTrack>,
    fail: bool,
    pub audio_enabled: AtomicBool,
    pub releases: AtomicUsize,
}

impl FakeMedia {
    pub fn camera_and_mic() -> Arc<Self> {
        Self::with(vec![MediaTrack::new("mic", TrackKind::Audio), MediaTrack::new("cam", TrackKind::Video)], false)
    }

    pub fn denied() -> Arc<Self> {
        Self::with(Vec::new(), true)
    }

    pub fn no_devices() -> Arc<Self> {
        Self::with(Vec::new(), false)
    }

    fn with(tracks: Vec<MediaTrack>, fail: bool) -> Arc<Self> {
        Arc::new(Self { tracks, fail, audio_enabled: AtomicBool::new(false), releases: AtomicUsize::new(0) })
    }
}

#[async_trait]
impl MediaSource for FakeMedia {
    async fn acquire(&self) -> anyhow::Result<Arc<MediaStream>> {
        if self.fail {
            anyhow::bail!("NotAllowedError: permission denied");
        }
        Ok(Arc::new(MediaStream::new(uuid::Uuid::new_v4().to_string(), self.tracks.clone())))
    }

    async fn release(&self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }

    fn set_audio_enabled(&self, enabled: bool) {
        self.audio_enabled.store(enabled, Ordering::SeqCst);
    }

    fn set_video_enabled(&self, _: bool) {}
}

/// Recognizer whose calls take `delay` to complete.
pub struct FakeSpeech {
    delay: Duration,
    pub running: AtomicBool,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    hang_on_stop: bool,
}

impl FakeSpeech {
    pub fn new(delay: Duration) -> Arc<Self> {
        Self::build(delay, false)
    }

    /// `stop` never returns.
    pub fn hanging() -> Arc<Self> {
        Self::build(Duration::ZERO, true)
    }

    fn build(delay: Duration, hang_on_stop: bool) -> Arc<Self> {
        Arc::new(Self {
            delay,
            running: AtomicBool::new(false),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            hang_on_stop,
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SpeechRecognizer for FakeSpeech {
    async fn start(&self, _: Arc<MediaStream>) -> anyhow::Result<()> {
        tokio::time::sleep(self.delay).await;
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        if self.hang_on_stop {
            std::future::pending::<()>().await;
        }
        tokio::time::sleep(self.delay).await;
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }
}

/// Emits `chunks` on start; `stop` closes the stream unless `hang` is set.
pub struct FakeRecorder {
    chunks: Vec<Bytes>,
    sender: Mutex<Option<mpsc::Sender<Bytes>>>,
    hang: bool,
}

impl FakeRecorder {
    pub fn new(chunks: &[&'static [u8]]) -> Arc<Self> {
        Arc::new(Self {
            chunks: chunks.iter().copied().map(Bytes::from_static).collect(),
            sender: Mutex::new(None),
            hang: false,
        })
    }

    pub fn hanging() -> Arc<Self> {
        Arc::new(Self { chunks: Vec::new(), sender: Mutex::new(None), hang: true })
    }
}

#[async_trait]
impl MediaRecorder for FakeRecorder {
    async fn start(&self, _: Arc<MediaStream>) -> anyhow::Result<mpsc::Receiver<Bytes>> {
        let (tx, rx) = mpsc::channel(self.chunks.len().max(1));
        for chunk in &self.chunks {
            tx.try_send(chunk.clone())?;
        }
        *self.sender.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn stop(&self) -> anyhow::Result<()> {
        if self.hang {
            std::future::pending::<()>().await;
        }
        self.sender.lock().unwrap().take();
        Ok(())
    }
}

/// Keeps uploaded chunks in memory.
#[derive(Default)]
pub struct MemoryUploads {
    pub chunks: Arc<Mutex<Vec<Bytes>>>,
    active: bool,
}

#[async_trait]
impl UploadProvider for MemoryUploads {
    fn kind(&self) -> UploadProviderKind {
        UploadProviderKind::Local
    }

    async fn initialize(&mut self, _: &RecordingMetadata, _: &Bytes) -> Result<(), UploadError> {
        self.active = true;
        Ok(())
    }

    async fn upload_chunk(&mut self, chunk: Bytes) -> Result<(), UploadError> {
        self.chunks.lock().unwrap().push(chunk);
        Ok(())
    }

    async fn finalize(&mut self) -> Result<UploadReceipt, UploadError> {
        self.active = false;
        let size_bytes = self.chunks.lock().unwrap().iter().map(|c| c.len() as u64).sum();
        Ok(UploadReceipt { recording_id: Some("rec-1".into()), size_bytes, ..UploadReceipt::default() })
    }

    async fn abort(&mut self) {
        self.active = false;
    }

    fn is_currently_uploading(&self) -> bool {
        self.active
    }

    fn upload_stats(&self) -> UploadStats {
        UploadStats {
            provider: UploadProviderKind::Local,
            status: if self.active { UploadStatus::Active } else { UploadStatus::Idle },
            bytes_received: 0,
            bytes_uploaded: 0,
            chunks: 0,
            started_at: None,
        }
    }
}

pub fn recording_setup(recorder: Arc<FakeRecorder>, uploaded: Arc<Mutex<Vec<Bytes>>>) -> RecordingSetup {
    RecordingSetup {
        recorder,
        uploads: Arc::new(move || {
            Box::new(MemoryUploads { chunks: uploaded.clone(), active: false }) as Box<dyn UploadProvider>
        }),
        tuning: RecordingTuning::default(),
    }
}

pub struct PeerOptions {
    pub media: Arc<FakeMedia>,
    pub speech: Option<Arc<FakeSpeech>>,
    pub recording: Option<RecordingSetup>,
    pub consent: StaticConsent,
    pub timings: RoomTimings,
}

impl Default for PeerOptions {
    fn default() -> Self {
        Self {
            media: FakeMedia::camera_and_mic(),
            speech: None,
            recording: None,
            consent: StaticConsent::all(),
            timings: RoomTimings::default(),
        }
    }
}

pub struct TestPeer {
    pub peer_id: PeerId,
    pub handle: RoomHandle,
    pub notices: broadcast::Receiver<RoomNotice>,
    pub transport: MemoryTransport,
}

impl TestPeer {
    /// Notices received so far, without waiting.
    pub fn drain(&mut self) -> Vec<RoomNotice> {
        let mut seen = Vec::new();
        while let Ok(notice) = self.notices.try_recv() {
            seen.push(notice);
        }
        seen
    }
}

/// Sessions sharing one signaling hub and one loopback network.
pub struct Harness {
    pub hub: MemoryHub,
    pub net: LoopbackNetwork,
    pub room: Arc<RoomDescriptor>,
}

impl Harness {
    pub fn new(slot_count: usize) -> Self {
        Self::with_features(slot_count, RoomFeatures::default())
    }

    pub fn with_features(slot_count: usize, features: RoomFeatures) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        let room = RoomDescriptor {
            room_id: "42".into(),
            participants: Vec::new(),
            features,
            invite_code: None,
            slot_count,
        };
        Self { hub: MemoryHub::new(), net: LoopbackNetwork::default(), room: Arc::new(room) }
    }

    pub async fn peer(&self, user: &str) -> TestPeer {
        self.peer_with(user, PeerOptions::default()).await
    }

    pub async fn peer_with(&self, user: &str, opts: PeerOptions) -> TestPeer {
        let transport = self.hub.transport();
        let deps = RoomDeps {
            transport: Arc::new(transport.clone()),
            connector: self.net.connector(),
            media: opts.media,
            consent: Arc::new(opts.consent),
            ice: IceNegotiationConfig::fixed(IceServer::defaults()),
            speech: opts.speech.map(|s| s as Arc<dyn SpeechRecognizer>),
            recording: opts.recording,
        };
        let me = ParticipantRecord {
            user_id: user.to_owned(),
            character_name: Some(format!("{user} the brave")),
            username: user.to_owned(),
        };
        let mut session = RoomSession::new(self.room.clone(), me, deps, opts.timings);
        let peer_id = session.initialize().await.expect("initialize");
        let notices = session.subscribe();
        let (handle, _task) = session.spawn();
        TestPeer { peer_id, handle, notices, transport }
    }

    /// A raw client on the room channel, for injecting and observing frames.
    pub async fn spy(&self) -> (MemoryTransport, mpsc::UnboundedReceiver<TransportEvent>) {
        let transport = self.hub.transport();
        let (tx, rx) = mpsc::unbounded_channel();
        transport.open(&channel_name(&self.room.room_id), "spy", tx).await.expect("spy open");
        (transport, rx)
    }
}

pub fn frames(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Vec<SignalFrame> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let TransportEvent::Frame(frame) = event {
            out.push(frame);
        }
    }
    out
}
