//! mpv-backed implementations of the engine's transport capabilities.
//!
//! Every player (segmented, legacy) and every low-latency connect attempt
//! runs its own mpv instance.  The mpv event stream is folded into engine
//! events by small watch structs that are pure and unit-tested.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use live_engine::compositor::{Presentation, Surface, Treatment};
use live_engine::error::TransportError;
use live_engine::transport::{
    MediaTrack, PlayerEvent, PlayerRequest, SessionConfig, SharedTrack, StreamPlayer,
    StreamPlayerFactory, TransportClient, TransportClientFactory, TransportEvent, TransportStatus,
    TuningKnob,
};
use live_proto::config::MpvConfig;
use live_proto::protocol::FitMode;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::mpv::{MpvDriver, MpvEvent, MpvHandle, OBS_FRAME_NUMBER, OBS_PAUSED_FOR_CACHE, OBS_VIDEO_PARAMS};

// ── runtime ───────────────────────────────────────────────────────────────────

/// Track id → mpv instance rendering it.  Lets surfaces reach the runtime
/// behind a `SharedTrack`.
#[derive(Clone, Default)]
pub struct MpvRegistry {
    inner: Arc<Mutex<HashMap<String, MpvHandle>>>,
}

impl MpvRegistry {
    async fn register(&self, id: &str, handle: MpvHandle) {
        self.inner.lock().await.insert(id.to_string(), handle);
    }

    async fn remove(&self, id: &str) {
        self.inner.lock().await.remove(id);
    }

    async fn get(&self, id: &str) -> Option<MpvHandle> {
        self.inner.lock().await.get(id).cloned()
    }
}

pub struct MpvRuntime {
    registry: MpvRegistry,
    volume: f32,
    next_instance: AtomicU64,
}

impl MpvRuntime {
    pub fn new(config: &MpvConfig) -> Arc<Self> {
        Arc::new(Self {
            registry: MpvRegistry::default(),
            volume: config.default_volume,
            next_instance: AtomicU64::new(1),
        })
    }

    pub fn registry(&self) -> MpvRegistry {
        self.registry.clone()
    }

    fn instance_id(&self, kind: &str) -> String {
        let n = self.next_instance.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}-{}", kind, std::process::id(), n)
    }

    async fn launch(
        &self,
        instance: &str,
        muted: bool,
        extra: &[&str],
    ) -> Result<(MpvDriver, MpvHandle, mpsc::Receiver<MpvEvent>), TransportError> {
        if live_proto::platform::find_mpv_binary().is_none() {
            return Err(TransportError::Unsupported("mpv binary not found".into()));
        }
        let mut args = vec![
            format!(
                "--volume={}",
                (self.volume * 100.0).clamp(0.0, 100.0).round() as i64
            ),
            format!("--mute={}", if muted { "yes" } else { "no" }),
        ];
        args.extend(extra.iter().map(|a| a.to_string()));

        let (event_tx, event_rx) = mpsc::channel::<MpvEvent>(128);
        let mut driver = MpvDriver::new(instance, args);
        let handle = match driver.spawn_and_connect(event_tx).await {
            Ok(h) => h,
            Err(e) => {
                driver.kill().await;
                return Err(TransportError::Network(format!("mpv start failed: {e}")));
            }
        };
        handle.observe_all_properties().await;
        Ok((driver, handle, event_rx))
    }
}

#[derive(Debug)]
pub struct MpvTrack {
    id: String,
    stopped: AtomicBool,
}

impl MpvTrack {
    fn new(id: String) -> Arc<Self> {
        Arc::new(Self {
            id,
            stopped: AtomicBool::new(false),
        })
    }
}

impl MediaTrack for MpvTrack {
    fn id(&self) -> &str {
        &self.id
    }

    /// mpv renders in-process; a second decoder would double bandwidth.
    fn duplicate(&self) -> Option<SharedTrack> {
        None
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

fn is_loaded(data: &Value) -> bool {
    !data.is_null()
}

// ── segmented / legacy player ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum PlayerObserved {
    Playable,
    Stalled,
    Failed(TransportError),
    Ended,
}

#[derive(Debug, Default)]
struct PlayerWatch {
    playable: bool,
    buffering: bool,
}

impl PlayerWatch {
    fn observe(&mut self, evt: &MpvEvent) -> Option<PlayerObserved> {
        if let Some((id, data)) = evt.as_property_change() {
            return match id {
                OBS_VIDEO_PARAMS if is_loaded(data) && !self.playable => {
                    self.playable = true;
                    Some(PlayerObserved::Playable)
                }
                OBS_PAUSED_FOR_CACHE => match (data.as_bool(), self.buffering) {
                    (Some(true), false) if self.playable => {
                        self.buffering = true;
                        Some(PlayerObserved::Stalled)
                    }
                    (Some(false), true) => {
                        self.buffering = false;
                        Some(PlayerObserved::Playable)
                    }
                    _ => None,
                },
                _ => None,
            };
        }
        match evt.end_file()? {
            ("error", err) => Some(PlayerObserved::Failed(TransportError::Network(
                err.unwrap_or("playback error").to_string(),
            ))),
            ("eof" | "quit", _) => Some(PlayerObserved::Ended),
            _ => None,
        }
    }
}

pub struct MpvPlayerFactory {
    runtime: Arc<MpvRuntime>,
}

impl MpvPlayerFactory {
    pub fn new(runtime: Arc<MpvRuntime>) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl StreamPlayerFactory for MpvPlayerFactory {
    async fn open(
        &self,
        request: PlayerRequest,
        events: mpsc::Sender<PlayerEvent>,
    ) -> Result<Arc<dyn StreamPlayer>, TransportError> {
        let instance = self.runtime.instance_id(request.tier.label());
        let (mut driver, handle, mut mpv_rx) =
            self.runtime.launch(&instance, request.muted, &[]).await?;
        if let Err(e) = handle.load_stream(&request.url).await {
            driver.kill().await;
            return Err(TransportError::Rejected(e.to_string()));
        }
        info!("mpv[{}]: playing {}", instance, request.url);

        let track = MpvTrack::new(instance.clone());
        self.runtime.registry.register(&instance, handle.clone()).await;

        let watched: SharedTrack = track.clone();
        let watcher = tokio::spawn(async move {
            let mut watch = PlayerWatch::default();
            while let Some(evt) = mpv_rx.recv().await {
                let Some(observed) = watch.observe(&evt) else {
                    continue;
                };
                let (event, last) = match observed {
                    PlayerObserved::Playable => (PlayerEvent::Playable(Arc::clone(&watched)), false),
                    PlayerObserved::Stalled => (
                        PlayerEvent::Stalled {
                            reason: "buffering".into(),
                        },
                        false,
                    ),
                    PlayerObserved::Failed(e) => (PlayerEvent::Failed(e), true),
                    PlayerObserved::Ended => (PlayerEvent::Ended, true),
                };
                if events.send(event).await.is_err() || last {
                    return;
                }
            }
            let _ = events.send(PlayerEvent::Failed(TransportError::Closed)).await;
        });

        Ok(Arc::new(MpvPlayer {
            instance,
            registry: self.runtime.registry(),
            driver: Mutex::new(driver),
            handle,
            track,
            watcher: watcher.abort_handle(),
        }))
    }
}

struct MpvPlayer {
    instance: String,
    registry: MpvRegistry,
    driver: Mutex<MpvDriver>,
    handle: MpvHandle,
    track: Arc<MpvTrack>,
    watcher: AbortHandle,
}

#[async_trait]
impl StreamPlayer for MpvPlayer {
    async fn close(&self) {
        debug!("mpv[{}]: closing player", self.instance);
        self.watcher.abort();
        self.track.stop();
        self.registry.remove(&self.instance).await;
        let _ = self.handle.stop().await;
        self.driver.lock().await.kill().await;
    }
}

// ── low-latency client ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum SessionObserved {
    Joined,
    JoinFailed(TransportError),
    Track,
    Disconnected(String),
    DecodeFailure(String),
    FrameDecoded,
    Status(TransportStatus),
}

#[derive(Debug, Default)]
struct SessionWatch {
    joined: bool,
    published: bool,
    decode_trouble: bool,
}

impl SessionWatch {
    fn observe(&mut self, evt: &MpvEvent) -> Option<SessionObserved> {
        if let Some((id, data)) = evt.as_property_change() {
            return match id {
                OBS_VIDEO_PARAMS if is_loaded(data) && !self.published => {
                    self.published = true;
                    Some(SessionObserved::Track)
                }
                OBS_PAUSED_FOR_CACHE => data.as_bool().map(|stalled| {
                    SessionObserved::Status(if stalled {
                        TransportStatus::Stalled
                    } else {
                        TransportStatus::Connected
                    })
                }),
                OBS_FRAME_NUMBER if self.decode_trouble && is_loaded(data) => {
                    self.decode_trouble = false;
                    Some(SessionObserved::FrameDecoded)
                }
                _ => None,
            };
        }
        if evt.event_name() == Some("file-loaded") && !self.joined {
            self.joined = true;
            return Some(SessionObserved::Joined);
        }
        if let Some((prefix, text)) = evt.error_log() {
            if prefix.contains("video") || prefix.starts_with("vd") {
                self.decode_trouble = true;
                return Some(SessionObserved::DecodeFailure(format!("{prefix}: {text}")));
            }
            return None;
        }
        let (reason, err) = evt.end_file()?;
        let detail = err.unwrap_or(reason).to_string();
        if !self.joined {
            return Some(SessionObserved::JoinFailed(match reason {
                "error" => TransportError::Rejected(detail),
                _ => TransportError::Network(detail),
            }));
        }
        Some(SessionObserved::Disconnected(detail))
    }
}

fn status_code(status: TransportStatus) -> u8 {
    match status {
        TransportStatus::Idle => 0,
        TransportStatus::Connecting => 1,
        TransportStatus::Connected => 2,
        TransportStatus::Stalled => 3,
        TransportStatus::Closed => 4,
    }
}

fn status_from(code: u8) -> TransportStatus {
    match code {
        1 => TransportStatus::Connecting,
        2 => TransportStatus::Connected,
        3 => TransportStatus::Stalled,
        4 => TransportStatus::Closed,
        _ => TransportStatus::Idle,
    }
}

pub struct MpvLowLatencyFactory {
    runtime: Arc<MpvRuntime>,
}

impl MpvLowLatencyFactory {
    pub fn new(runtime: Arc<MpvRuntime>) -> Self {
        Self { runtime }
    }
}

#[async_trait]
impl TransportClientFactory for MpvLowLatencyFactory {
    async fn create(
        &self,
        config: SessionConfig,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Arc<dyn TransportClient>, TransportError> {
        Ok(Arc::new(MpvLowLatencyClient {
            runtime: Arc::clone(&self.runtime),
            config,
            events,
            status: Arc::new(AtomicU8::new(status_code(TransportStatus::Idle))),
            session: Mutex::new(None),
        }))
    }
}

struct LiveSession {
    instance: String,
    driver: MpvDriver,
    handle: MpvHandle,
    track: Arc<MpvTrack>,
    watcher: AbortHandle,
}

struct MpvLowLatencyClient {
    runtime: Arc<MpvRuntime>,
    config: SessionConfig,
    events: mpsc::Sender<TransportEvent>,
    status: Arc<AtomicU8>,
    session: Mutex<Option<LiveSession>>,
}

impl MpvLowLatencyClient {
    fn set_status(&self, status: TransportStatus) {
        self.status.store(status_code(status), Ordering::Release);
    }

    fn stream_url(&self) -> String {
        format!(
            "{}/{}?codec={}",
            self.config.base_url.trim_end_matches('/'),
            self.config.channel_id,
            self.config.codec_name
        )
    }

    async fn handle(&self) -> Result<MpvHandle, TransportError> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|s| s.handle.clone())
            .ok_or(TransportError::Closed)
    }
}

#[async_trait]
impl TransportClient for MpvLowLatencyClient {
    async fn join(&self) -> Result<(), TransportError> {
        self.set_status(TransportStatus::Connecting);
        let instance = self.runtime.instance_id("low-latency");
        let (mut driver, handle, mut mpv_rx) = self
            .runtime
            .launch(&instance, self.config.muted, &["--profile=low-latency"])
            .await?;

        let url = self.stream_url();
        if let Err(e) = handle.load_stream(&url).await {
            driver.kill().await;
            return Err(TransportError::Rejected(e.to_string()));
        }
        info!("mpv[{}]: joining {}", instance, url);

        let track = MpvTrack::new(instance.clone());
        self.runtime.registry.register(&instance, handle.clone()).await;

        let (joined_tx, joined_rx) = oneshot::channel();
        let events = self.events.clone();
        let status = Arc::clone(&self.status);
        let published: SharedTrack = track.clone();
        let watcher = tokio::spawn(async move {
            let mut watch = SessionWatch::default();
            let mut joined_tx = Some(joined_tx);
            while let Some(evt) = mpv_rx.recv().await {
                let Some(observed) = watch.observe(&evt) else {
                    continue;
                };
                let event = match observed {
                    SessionObserved::Joined => {
                        status.store(status_code(TransportStatus::Connected), Ordering::Release);
                        if let Some(tx) = joined_tx.take() {
                            let _ = tx.send(Ok(()));
                        }
                        continue;
                    }
                    SessionObserved::JoinFailed(e) => {
                        status.store(status_code(TransportStatus::Closed), Ordering::Release);
                        if let Some(tx) = joined_tx.take() {
                            let _ = tx.send(Err(e));
                        }
                        return;
                    }
                    SessionObserved::Status(s) => {
                        status.store(status_code(s), Ordering::Release);
                        continue;
                    }
                    SessionObserved::Track => TransportEvent::TrackPublished(Arc::clone(&published)),
                    SessionObserved::DecodeFailure(detail) => TransportEvent::DecodeFailure { detail },
                    SessionObserved::FrameDecoded => TransportEvent::FrameDecoded,
                    SessionObserved::Disconnected(reason) => {
                        status.store(status_code(TransportStatus::Closed), Ordering::Release);
                        let _ = events.send(TransportEvent::Disconnected { reason }).await;
                        return;
                    }
                };
                if events.send(event).await.is_err() {
                    return;
                }
            }
            status.store(status_code(TransportStatus::Closed), Ordering::Release);
            match joined_tx.take() {
                Some(tx) => {
                    let _ = tx.send(Err(TransportError::Closed));
                }
                None => {
                    let reason = "mpv exited".to_string();
                    let _ = events.send(TransportEvent::Disconnected { reason }).await;
                }
            }
        });

        *self.session.lock().await = Some(LiveSession {
            instance,
            driver,
            handle,
            track,
            watcher: watcher.abort_handle(),
        });

        joined_rx.await.unwrap_or(Err(TransportError::Closed))
    }

    async fn subscribe(&self, _track: &SharedTrack) -> Result<(), TransportError> {
        self.handle()
            .await?
            .set_property("vid", json!("auto"))
            .await
            .map_err(|e| TransportError::Network(e.to_string()))
    }

    async fn tune(&self, knob: TuningKnob) -> Result<(), TransportError> {
        let handle = self.handle().await?;
        let (name, value) = match knob {
            TuningKnob::PreferLowBitrate => ("hls-bitrate", json!("min")),
            TuningKnob::DisableBufferGrowth => ("demuxer-max-bytes", json!("4MiB")),
        };
        handle
            .set_property(name, value)
            .await
            .map_err(|e| TransportError::Unsupported(format!("{name}: {e}")))
    }

    fn status(&self) -> TransportStatus {
        status_from(self.status.load(Ordering::Acquire))
    }

    async fn close(&self) {
        self.set_status(TransportStatus::Closed);
        let Some(mut session) = self.session.lock().await.take() else {
            return;
        };
        debug!("mpv[{}]: closing session", session.instance);
        session.watcher.abort();
        session.track.stop();
        self.runtime.registry.remove(&session.instance).await;
        let _ = session.handle.stop().await;
        session.driver.kill().await;
    }
}

// ── surface ───────────────────────────────────────────────────────────────────

/// The mpv window of whichever instance renders the shown track.
pub struct MpvSurface {
    registry: MpvRegistry,
    handle: Option<MpvHandle>,
    treatment: Option<Treatment>,
}

impl MpvSurface {
    pub fn new(registry: MpvRegistry) -> Self {
        Self {
            registry,
            handle: None,
            treatment: None,
        }
    }
}

fn parse_geometry(geometry: &str) -> (Option<u32>, Option<u32>) {
    let size = geometry.split(['+', '-']).next().unwrap_or("");
    let mut parts = size.splitn(2, 'x');
    let width = parts.next().and_then(|w| w.trim_end_matches('%').parse().ok());
    let height = parts.next().and_then(|h| h.trim_end_matches('%').parse().ok());
    (width, height)
}

fn treatment_filter(treatment: &Treatment) -> Value {
    let graph = format!(
        "scale=iw*{scale:.2}:ih*{scale:.2},gblur=sigma={blur},eq=brightness={brightness:.2}",
        scale = treatment.scale,
        blur = treatment.blur_px,
        brightness = treatment.brightness - 1.0,
    );
    json!([{ "name": "lavfi", "label": "treatment", "params": { "graph": graph } }])
}

#[async_trait]
impl Surface for MpvSurface {
    async fn show(&mut self, track: Option<SharedTrack>) {
        self.handle = match track {
            Some(track) => self.registry.get(track.id()).await,
            None => None,
        };
        self.treatment = None;
    }

    async fn presentation(&mut self) -> Presentation {
        let Some(handle) = &self.handle else {
            return Presentation::default();
        };
        let panscan = handle
            .get_property("panscan")
            .await
            .ok()
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);
        let geometry = handle
            .get_property("geometry")
            .await
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        let (width, height) = parse_geometry(&geometry);
        Presentation {
            fit: if panscan >= 0.5 {
                FitMode::Cover
            } else {
                FitMode::Contain
            },
            width,
            height,
            treatment: self.treatment.clone(),
        }
    }

    async fn apply(&mut self, presentation: &Presentation) {
        let Some(handle) = &self.handle else {
            return;
        };
        let panscan = match presentation.fit {
            FitMode::Cover => 1.0,
            FitMode::Contain => 0.0,
        };
        if let Err(e) = handle.set_property("panscan", json!(panscan)).await {
            debug!("mpv surface: panscan not applied: {}", e);
        }
        if presentation.width.is_none() && presentation.height.is_none() {
            if let Err(e) = handle.set_property("geometry", json!("")).await {
                debug!("mpv surface: geometry not cleared: {}", e);
            }
        }
        if let Some(treatment) = &presentation.treatment {
            if let Err(e) = handle.set_property("vf", treatment_filter(treatment)).await {
                warn!("mpv surface: treatment filter rejected: {}", e);
            }
        }
        self.treatment = presentation.treatment.clone();
    }
}
