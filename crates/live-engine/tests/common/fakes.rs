#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use live_engine::compositor::{Presentation, Surface};
use live_engine::error::{SourceError, TransportError};
use live_engine::resolver::MetadataSource;
use live_engine::transport::{
    MediaTrack, PlayerEvent, PlayerRequest, SessionConfig, SharedTrack, StreamPlayer,
    StreamPlayerFactory, TransportClient, TransportClientFactory, TransportEvent, TransportStatus,
    TuningKnob,
};
use live_engine::{EngineBroadcast, EngineCore, EngineDeps, EngineEvent};
use live_proto::config::Config;
use live_proto::protocol::{PlaybackSignal, StreamMetadata, TransportHints};
use live_proto::state::StateManager;
use tokio::sync::{broadcast, mpsc, watch};

// ── metadata ──────────────────────────────────────────────────────────────────

/// Upstream whose snapshot the test replaces at will.  Every channel sees
/// the same snapshot, relabelled with the requested channel id.
pub struct FakeSource {
    tx: watch::Sender<StreamMetadata>,
}

impl FakeSource {
    pub fn new(initial: StreamMetadata) -> Arc<Self> {
        let (tx, _) = watch::channel(initial);
        Arc::new(Self { tx })
    }

    pub fn publish(&self, metadata: StreamMetadata) {
        self.tx.send_replace(metadata);
    }
}

#[async_trait]
impl MetadataSource for FakeSource {
    async fn fetch(&self, channel_id: &str) -> Result<StreamMetadata, SourceError> {
        let mut meta = self.tx.borrow().clone();
        meta.channel_id = channel_id.to_string();
        Ok(meta)
    }

    async fn changed(&self, _channel_id: &str) -> Result<(), SourceError> {
        let mut rx = self.tx.subscribe();
        rx.changed()
            .await
            .map_err(|_| SourceError::Unavailable("source dropped".into()))
    }
}

pub fn metadata(active: bool, low_latency: Option<&str>, segmented: Option<&str>) -> StreamMetadata {
    StreamMetadata {
        channel_id: "main".into(),
        is_active: active,
        hints: TransportHints {
            low_latency_base_url: low_latency.map(str::to_string),
            segmented_url: segmented.map(str::to_string),
        },
        viewer_count: Some(10),
        title: None,
    }
}

// ── tracks ────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct FakeTrack {
    id: String,
    stopped: AtomicBool,
}

impl FakeTrack {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            stopped: AtomicBool::new(false),
        })
    }
}

impl MediaTrack for FakeTrack {
    fn id(&self) -> &str {
        &self.id
    }
    fn duplicate(&self) -> Option<SharedTrack> {
        Some(FakeTrack::new(&format!("{}-bg", self.id)))
    }
    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

// ── segmented / legacy players ────────────────────────────────────────────────

pub struct OpenedPlayer {
    pub request: PlayerRequest,
    pub events: mpsc::Sender<PlayerEvent>,
    pub closed: Arc<AtomicBool>,
}

#[derive(Default)]
pub struct FakePlayers {
    pub opened: Mutex<Vec<OpenedPlayer>>,
}

impl FakePlayers {
    pub fn count(&self) -> usize {
        self.opened.lock().unwrap().len()
    }

    pub fn open_count(&self) -> usize {
        self.opened
            .lock()
            .unwrap()
            .iter()
            .filter(|p| !p.closed.load(Ordering::SeqCst))
            .count()
    }

    pub fn request(&self, idx: usize) -> PlayerRequest {
        self.opened.lock().unwrap()[idx].request.clone()
    }

    pub fn is_closed(&self, idx: usize) -> bool {
        self.opened.lock().unwrap()[idx].closed.load(Ordering::SeqCst)
    }

    pub fn events(&self, idx: usize) -> mpsc::Sender<PlayerEvent> {
        self.opened.lock().unwrap()[idx].events.clone()
    }
}

struct FakePlayer {
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl StreamPlayer for FakePlayer {
    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl StreamPlayerFactory for FakePlayers {
    async fn open(
        &self,
        request: PlayerRequest,
        events: mpsc::Sender<PlayerEvent>,
    ) -> Result<Arc<dyn StreamPlayer>, TransportError> {
        let closed = Arc::new(AtomicBool::new(false));
        self.opened.lock().unwrap().push(OpenedPlayer {
            request,
            events,
            closed: Arc::clone(&closed),
        });
        Ok(Arc::new(FakePlayer { closed }))
    }
}

// ── low-latency transport ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinBehavior {
    Succeed,
    /// `join` never resolves; the transport reports `status`.
    Hang(TransportStatus),
    Reject,
}

pub struct CreatedClient {
    pub config: SessionConfig,
    pub events: mpsc::Sender<TransportEvent>,
    pub closed: Arc<AtomicBool>,
}

pub struct FakeTransport {
    behavior: Mutex<JoinBehavior>,
    pub created: Mutex<Vec<CreatedClient>>,
}

impl FakeTransport {
    pub fn new(behavior: JoinBehavior) -> Arc<Self> {
        Arc::new(Self {
            behavior: Mutex::new(behavior),
            created: Mutex::new(Vec::new()),
        })
    }

    pub fn set_behavior(&self, behavior: JoinBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn open_count(&self) -> usize {
        self.created
            .lock()
            .unwrap()
            .iter()
            .filter(|c| !c.closed.load(Ordering::SeqCst))
            .count()
    }

    pub fn config(&self, idx: usize) -> SessionConfig {
        self.created.lock().unwrap()[idx].config.clone()
    }

    pub fn is_closed(&self, idx: usize) -> bool {
        self.created.lock().unwrap()[idx].closed.load(Ordering::SeqCst)
    }

    pub fn events(&self, idx: usize) -> mpsc::Sender<TransportEvent> {
        self.created.lock().unwrap()[idx].events.clone()
    }
}

struct FakeClient {
    behavior: JoinBehavior,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl TransportClient for FakeClient {
    async fn join(&self) -> Result<(), TransportError> {
        match self.behavior {
            JoinBehavior::Succeed => Ok(()),
            JoinBehavior::Hang(_) => std::future::pending().await,
            JoinBehavior::Reject => Err(TransportError::Rejected("forbidden".into())),
        }
    }

    async fn subscribe(&self, _track: &SharedTrack) -> Result<(), TransportError> {
        Ok(())
    }

    async fn tune(&self, knob: TuningKnob) -> Result<(), TransportError> {
        Err(TransportError::Unsupported(format!("{:?}", knob)))
    }

    fn status(&self) -> TransportStatus {
        match self.behavior {
            JoinBehavior::Hang(status) => status,
            _ if self.closed.load(Ordering::SeqCst) => TransportStatus::Closed,
            _ => TransportStatus::Connected,
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl TransportClientFactory for FakeTransport {
    async fn create(
        &self,
        config: SessionConfig,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Arc<dyn TransportClient>, TransportError> {
        let closed = Arc::new(AtomicBool::new(false));
        let behavior = *self.behavior.lock().unwrap();
        self.created.lock().unwrap().push(CreatedClient {
            config,
            events,
            closed: Arc::clone(&closed),
        });
        Ok(Arc::new(FakeClient { behavior, closed }))
    }
}

// ── surface ───────────────────────────────────────────────────────────────────

#[derive(Clone, Default)]
pub struct RecordingSurface {
    pub showing: Arc<Mutex<Option<String>>>,
    presentation: Arc<Mutex<Presentation>>,
    shown: Arc<AtomicUsize>,
    cleared: Arc<AtomicUsize>,
}

impl RecordingSurface {
    pub fn showing(&self) -> Option<String> {
        self.showing.lock().unwrap().clone()
    }

    /// Calls that put a track on the surface.
    pub fn shown(&self) -> usize {
        self.shown.load(Ordering::SeqCst)
    }

    /// Calls that emptied the surface.
    pub fn cleared(&self) -> usize {
        self.cleared.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Surface for RecordingSurface {
    async fn show(&mut self, track: Option<SharedTrack>) {
        let counter = if track.is_some() { &self.shown } else { &self.cleared };
        counter.fetch_add(1, Ordering::SeqCst);
        *self.showing.lock().unwrap() = track.map(|t| t.id().to_string());
    }
    async fn presentation(&mut self) -> Presentation {
        self.presentation.lock().unwrap().clone()
    }
    async fn apply(&mut self, presentation: &Presentation) {
        *self.presentation.lock().unwrap() = presentation.clone();
    }
}

// ── harness ───────────────────────────────────────────────────────────────────

pub struct Harness {
    pub tx: mpsc::Sender<EngineEvent>,
    pub broadcasts: broadcast::Receiver<EngineBroadcast>,
    pub state: Arc<StateManager>,
    pub source: Arc<FakeSource>,
    pub players: Arc<FakePlayers>,
    pub transport: Arc<FakeTransport>,
    pub foreground: RecordingSurface,
    pub background: RecordingSurface,
    pub engine: tokio::task::JoinHandle<anyhow::Result<()>>,
}

pub fn config(legacy_url_template: &str) -> Config {
    let mut config = Config::default();
    config.engine.channel_id = "main".into();
    config.transports.legacy_url_template = legacy_url_template.into();
    config
}

impl Harness {
    pub fn start(config: Config, initial: StreamMetadata, behavior: JoinBehavior) -> Self {
        let source = FakeSource::new(initial);
        let players = Arc::new(FakePlayers::default());
        let transport = FakeTransport::new(behavior);
        let foreground = RecordingSurface::default();
        let background = RecordingSurface::default();

        let deps = EngineDeps::standard(
            &config,
            source.clone(),
            transport.clone(),
            players.clone(),
            Box::new(foreground.clone()),
            Some(Box::new(background.clone())),
        );

        let (broadcast_tx, broadcasts) = broadcast::channel(1024);
        let (tx, rx) = mpsc::channel(256);
        let engine = EngineCore::new(&config, deps, broadcast_tx, tx.clone());
        let state = engine.state_manager();
        let engine = tokio::spawn(engine.run(rx));

        Self {
            tx,
            broadcasts,
            state,
            source,
            players,
            transport,
            foreground,
            background,
            engine,
        }
    }

    pub async fn send(&self, event: EngineEvent) {
        self.tx.send(event).await.unwrap();
    }

    /// Signals broadcast since the last call.
    pub fn signals(&mut self) -> Vec<PlaybackSignal> {
        let mut out = Vec::new();
        loop {
            match self.broadcasts.try_recv() {
                Ok(EngineBroadcast::Signal(signal)) => out.push(signal),
                Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => {}
                Err(_) => break,
            }
        }
        out
    }

    /// Tiers currently holding an open player or transport session.
    pub fn active_mounts(&self) -> usize {
        self.players.open_count() + self.transport.open_count()
    }

    pub async fn shutdown(self) {
        self.tx.send(EngineEvent::Shutdown).await.unwrap();
        self.engine.await.unwrap().unwrap();
        settle().await;
    }
}

/// Let every spawned task run to quiescence.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}
