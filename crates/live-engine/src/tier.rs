//! Tier players and the reporting channel back to the engine core.
use std::sync::Arc;

use async_trait::async_trait;
use live_proto::config::expand_channel;
use live_proto::protocol::{CodecMode, ConnectionState, StreamMetadata, TransportTier};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::core::EngineEvent;
use crate::error::TierFailure;
use crate::lifecycle::{Generation, LivenessToken, TeardownSet};
use crate::lowlatency::{LowLatencyTier, SessionSettings};
use crate::transport::{
    PlayerEvent, PlayerRequest, SharedTrack, StreamPlayer, StreamPlayerFactory,
    TransportClientFactory,
};
use crate::MountOptions;

#[derive(Debug, Clone)]
pub enum TierEventKind {
    Connecting,
    ConnectionState(ConnectionState),
    /// The tier now renders `track`; hand it to the compositor.
    Live(SharedTrack),
    TrackGone,
    /// Playback paused for buffering; track stays attached.
    Stalled { reason: String },
    CodecChanged(CodecMode),
    Failed(TierFailure),
}

#[derive(Debug, Clone)]
pub struct TierEvent {
    pub generation: Generation,
    pub tier: TransportTier,
    pub kind: TierEventKind,
}

/// Sends tier events upward, stamped with the mount generation.  Reports from
/// a superseded mount are dropped here, before they reach the core.
#[derive(Clone)]
pub struct TierReporter {
    token: LivenessToken,
    tier: TransportTier,
    tx: mpsc::Sender<EngineEvent>,
}

impl TierReporter {
    pub fn new(token: LivenessToken, tier: TransportTier, tx: mpsc::Sender<EngineEvent>) -> Self {
        Self { token, tier, tx }
    }

    pub fn is_live(&self) -> bool {
        self.token.is_live()
    }

    pub async fn report(&self, kind: TierEventKind) -> bool {
        if !self.token.is_live() {
            debug!(
                "{}: dropping {:?} from stale {}",
                self.tier,
                kind,
                self.token.generation()
            );
            return false;
        }
        let event = TierEvent {
            generation: self.token.generation(),
            tier: self.tier,
            kind,
        };
        self.tx.send(EngineEvent::Tier(event)).await.is_ok()
    }
}

pub struct MountContext {
    pub metadata: StreamMetadata,
    pub options: MountOptions,
    pub reporter: TierReporter,
}

#[async_trait]
pub trait TierPlayer: Send + Sync {
    fn tier(&self) -> TransportTier;

    /// Start playback.  Everything spawned must be registered in `teardown`.
    async fn mount(
        &mut self,
        ctx: MountContext,
        teardown: &mut TeardownSet,
    ) -> Result<(), TierFailure>;

    async fn unmount(&mut self);
}

pub trait TierFactory: Send + Sync {
    fn build(&self, tier: TransportTier) -> Box<dyn TierPlayer>;
}

// ── segmented / legacy ────────────────────────────────────────────────────────

/// Tiers 2 and 3: a plain stream player pointed at one URL.
pub struct StreamTier {
    tier: TransportTier,
    factory: Arc<dyn StreamPlayerFactory>,
    legacy_url_template: String,
    player: Option<Arc<dyn StreamPlayer>>,
}

impl StreamTier {
    pub fn new(
        tier: TransportTier,
        factory: Arc<dyn StreamPlayerFactory>,
        legacy_url_template: String,
    ) -> Self {
        Self {
            tier,
            factory,
            legacy_url_template,
            player: None,
        }
    }

    fn resolve_url(&self, metadata: &StreamMetadata) -> Result<String, TierFailure> {
        match self.tier {
            TransportTier::Legacy => {
                if self.legacy_url_template.trim().is_empty() {
                    return Err(TierFailure::Configuration(
                        "legacy transport not configured".into(),
                    ));
                }
                Ok(expand_channel(
                    &self.legacy_url_template,
                    &metadata.channel_id,
                ))
            }
            tier => metadata
                .hint_for(tier)
                .map(str::to_string)
                .ok_or_else(|| TierFailure::Configuration(format!("no {} url", tier))),
        }
    }
}

#[async_trait]
impl TierPlayer for StreamTier {
    fn tier(&self) -> TransportTier {
        self.tier
    }

    async fn mount(
        &mut self,
        ctx: MountContext,
        teardown: &mut TeardownSet,
    ) -> Result<(), TierFailure> {
        let url = self.resolve_url(&ctx.metadata)?;
        info!("{}: opening {}", self.tier, url);
        ctx.reporter.report(TierEventKind::Connecting).await;

        let (event_tx, mut event_rx) = mpsc::channel::<PlayerEvent>(32);
        let request = PlayerRequest {
            tier: self.tier,
            channel_id: ctx.metadata.channel_id.clone(),
            url,
            muted: ctx.options.muted,
        };
        let player = self
            .factory
            .open(request, event_tx)
            .await
            .map_err(|e| e.normalize())?;

        let closing = Arc::clone(&player);
        teardown.defer("stream player close", move || {
            if let Ok(rt) = tokio::runtime::Handle::try_current() {
                rt.spawn(async move { closing.close().await });
            }
        });
        self.player = Some(player);

        let reporter = ctx.reporter;
        let tier = self.tier;
        let task = tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                match event {
                    PlayerEvent::Playable(track) => {
                        reporter.report(TierEventKind::Live(track)).await;
                    }
                    PlayerEvent::Stalled { reason } => {
                        reporter.report(TierEventKind::Stalled { reason }).await;
                    }
                    PlayerEvent::Failed(err) => {
                        reporter.report(TierEventKind::Failed(err.normalize())).await;
                        break;
                    }
                    PlayerEvent::Ended => {
                        let failure = TierFailure::Transport(format!("{} stream ended", tier));
                        reporter.report(TierEventKind::Failed(failure)).await;
                        break;
                    }
                }
            }
        });
        teardown.track_task("stream player events", &task);
        Ok(())
    }

    async fn unmount(&mut self) {
        self.player = None;
    }
}

// ── standard wiring ───────────────────────────────────────────────────────────

/// Builds the three production tiers from injected transport capabilities.
pub struct StandardTiers {
    low_latency: Arc<dyn TransportClientFactory>,
    players: Arc<dyn StreamPlayerFactory>,
    settings: SessionSettings,
    legacy_url_template: String,
}

impl StandardTiers {
    pub fn new(
        low_latency: Arc<dyn TransportClientFactory>,
        players: Arc<dyn StreamPlayerFactory>,
        settings: SessionSettings,
        legacy_url_template: String,
    ) -> Self {
        Self {
            low_latency,
            players,
            settings,
            legacy_url_template,
        }
    }
}

impl TierFactory for StandardTiers {
    fn build(&self, tier: TransportTier) -> Box<dyn TierPlayer> {
        match tier {
            TransportTier::LowLatency => Box::new(LowLatencyTier::new(
                Arc::clone(&self.low_latency),
                self.settings.clone(),
            )),
            tier => Box::new(StreamTier::new(
                tier,
                Arc::clone(&self.players),
                self.legacy_url_template.clone(),
            )),
        }
    }
}
