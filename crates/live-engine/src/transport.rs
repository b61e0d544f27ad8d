//! Capabilities injected into the engine.  Real media runtimes (mpv in
//! `livecastd`) and the fakes in tests implement the same traits, so no
//! component reaches for an ambient global handle.
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use live_proto::protocol::{CodecMode, TransportTier};
use tokio::sync::mpsc;

use crate::error::TransportError;

/// A decoded media track published by some transport.
pub trait MediaTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;

    /// Derive an independent duplicate (for the background layer).  `None`
    /// when the runtime cannot clone tracks.
    fn duplicate(&self) -> Option<SharedTrack>;

    /// Release the track.  Must be idempotent.
    fn stop(&self);

    fn is_stopped(&self) -> bool;
}

pub type SharedTrack = Arc<dyn MediaTrack>;

// ── low-latency transport ─────────────────────────────────────────────────────

/// What the transport itself thinks it is doing.  Read by the join-timeout
/// guard: a session that is still connecting is never aborted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    Idle,
    Connecting,
    Connected,
    Stalled,
    Closed,
}

impl TransportStatus {
    pub fn is_progressing(self) -> bool {
        matches!(self, TransportStatus::Connecting | TransportStatus::Connected)
    }
}

/// Unsolicited events pushed by a low-latency transport session.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    TrackPublished(SharedTrack),
    TrackUnpublished { track_id: String },
    Disconnected { reason: String },
    DecodeFailure { detail: String },
    /// A frame decoded cleanly; resets the consecutive decode-failure count.
    FrameDecoded,
}

/// Tuning hints applied once media is flowing.  Transports that lack a knob
/// answer `TransportError::Unsupported`, which callers ignore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TuningKnob {
    PreferLowBitrate,
    DisableBufferGrowth,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub channel_id: String,
    pub base_url: String,
    pub codec: CodecMode,
    /// Concrete codec name for `codec` (e.g. "h264" / "vp8").
    pub codec_name: String,
    pub muted: bool,
}

#[async_trait]
pub trait TransportClient: Send + Sync {
    /// Connect and authenticate.  Resolves once joined or rejected.
    async fn join(&self) -> Result<(), TransportError>;

    async fn subscribe(&self, track: &SharedTrack) -> Result<(), TransportError>;

    async fn tune(&self, knob: TuningKnob) -> Result<(), TransportError>;

    fn status(&self) -> TransportStatus;

    /// Best-effort close; never awaited by teardown.
    async fn close(&self);
}

#[async_trait]
pub trait TransportClientFactory: Send + Sync {
    async fn create(
        &self,
        config: SessionConfig,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Arc<dyn TransportClient>, TransportError>;
}

// ── segmented / legacy players ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum PlayerEvent {
    /// First playable segment decoded; carries the rendered track.
    Playable(SharedTrack),
    Stalled { reason: String },
    Failed(TransportError),
    Ended,
}

#[derive(Debug, Clone)]
pub struct PlayerRequest {
    pub tier: TransportTier,
    pub channel_id: String,
    pub url: String,
    pub muted: bool,
}

#[async_trait]
pub trait StreamPlayer: Send + Sync {
    async fn close(&self);
}

#[async_trait]
pub trait StreamPlayerFactory: Send + Sync {
    async fn open(
        &self,
        request: PlayerRequest,
        events: mpsc::Sender<PlayerEvent>,
    ) -> Result<Arc<dyn StreamPlayer>, TransportError>;
}
