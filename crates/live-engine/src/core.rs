//! EngineCore: single-owner event loop for all playback state.
//!
//! Every input (metadata snapshots, tier reports, control commands) arrives
//! as an `EngineEvent` on one mpsc channel.  EngineCore owns the tier
//! selector, the mounted tier and the compositor exclusively; no other task
//! touches them.
//!
//! After each event EngineCore broadcasts `EngineBroadcast::StateUpdated`.
//! Lifecycle transitions additionally go out as `EngineBroadcast::Signal`.
//!
//! Staleness is handled with two generation counters: one per channel
//! subscription (metadata from an old channel is dropped) and one per mount
//! (reports from a torn-down tier are dropped).
use std::collections::BTreeSet;
use std::sync::Arc;

use live_proto::config::Config;
use live_proto::protocol::{
    Command, ConnectionState, EngineStatus, PlaybackSignal, StreamMetadata, TransportTier,
};
use live_proto::state::StateManager;
use tokio::sync::{broadcast, mpsc};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

use crate::compositor::{Compositor, CompositorOptions, Surface};
use crate::error::{EngineError, TierFailure};
use crate::lifecycle::{Generation, GenerationCounter, LivenessToken, TeardownSet};
use crate::lowlatency::SessionSettings;
use crate::resolver::{MetadataResolver, MetadataSource};
use crate::tier::{
    MountContext, StandardTiers, TierEvent, TierEventKind, TierFactory, TierPlayer, TierReporter,
};
use crate::transport::{StreamPlayerFactory, TransportClientFactory};
use crate::MountOptions;

// ── EngineEvent ───────────────────────────────────────────────────────────────

/// All inputs into the EngineCore loop.
#[derive(Debug)]
pub enum EngineEvent {
    /// Snapshot from the resolver.  `token` identifies the channel subscription.
    Metadata {
        token: LivenessToken,
        metadata: StreamMetadata,
    },
    /// Report from a mounted tier.
    Tier(TierEvent),
    /// A command from the HTTP API or a socket client.
    Command(Command),
    Shutdown,
}

#[derive(Debug, Clone)]
pub enum EngineBroadcast {
    /// EngineState changed; receivers read it from the StateManager.
    StateUpdated,
    Signal(PlaybackSignal),
    /// A log line forwarded from tracing.
    Log(String),
}

// ── TierSelector ──────────────────────────────────────────────────────────────

/// Pure tier choice plus the one-way failure ratchet.
#[derive(Debug, Clone, Default)]
pub struct TierSelector {
    current: Option<TransportTier>,
    failed: BTreeSet<TransportTier>,
    /// Fallback tier already announced as degraded since the last reset.
    degraded: Option<TransportTier>,
}

impl TierSelector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<TransportTier> {
        self.current
    }

    pub fn set_current(&mut self, tier: Option<TransportTier>) {
        self.current = tier;
    }

    pub fn failed(&self) -> &BTreeSet<TransportTier> {
        &self.failed
    }

    /// Highest-priority tier that has not failed and has an endpoint.
    /// Inactive metadata selects nothing.
    pub fn select(&self, metadata: &StreamMetadata) -> Option<TransportTier> {
        if !metadata.is_active {
            return None;
        }
        TransportTier::ALL.into_iter().find(|tier| {
            !self.failed.contains(tier)
                && (!tier.needs_hint() || metadata.hint_for(*tier).is_some())
        })
    }

    /// Returns false if the tier was already marked.
    pub fn mark_failed(&mut self, tier: TransportTier) -> bool {
        if self.current == Some(tier) {
            self.current = None;
        }
        self.failed.insert(tier)
    }

    /// True the first time `tier` is mounted below a failed tier.  Remounting
    /// the same fallback (a rotated URL, say) is not a new degradation.
    pub fn note_degraded(&mut self, tier: TransportTier) -> bool {
        if self.degraded == Some(tier) || !self.failed.iter().any(|f| *f < tier) {
            return false;
        }
        self.degraded = Some(tier);
        true
    }

    pub fn reset(&mut self) {
        self.current = None;
        self.failed.clear();
        self.degraded = None;
    }
}

// ── MountSession ──────────────────────────────────────────────────────────────

/// Everything owned by the currently mounted tier.
struct MountSession {
    generation: Generation,
    tier: TransportTier,
    hint: Option<String>,
    player: Box<dyn TierPlayer>,
    teardown: TeardownSet,
}

/// Collaborators injected into the core.
pub struct EngineDeps {
    pub source: Arc<dyn MetadataSource>,
    pub tiers: Arc<dyn TierFactory>,
    pub foreground: Box<dyn Surface>,
    pub background: Option<Box<dyn Surface>>,
}

impl EngineDeps {
    /// Wire the three standard tiers from transport capabilities.
    pub fn standard(
        config: &Config,
        source: Arc<dyn MetadataSource>,
        low_latency: Arc<dyn TransportClientFactory>,
        players: Arc<dyn StreamPlayerFactory>,
        foreground: Box<dyn Surface>,
        background: Option<Box<dyn Surface>>,
    ) -> Self {
        let tiers = StandardTiers::new(
            low_latency,
            players,
            SessionSettings::from_config(config),
            config.transports.legacy_url_template.clone(),
        );
        Self {
            source,
            tiers: Arc::new(tiers),
            foreground,
            background,
        }
    }
}

// ── EngineCore ────────────────────────────────────────────────────────────────

pub struct EngineCore {
    channel_id: String,
    enabled: bool,
    options: MountOptions,
    state_manager: Arc<StateManager>,
    resolver: Arc<MetadataResolver>,
    tiers: Arc<dyn TierFactory>,
    compositor: Compositor,
    selector: TierSelector,
    mount: Option<MountSession>,
    mount_gen: GenerationCounter,
    channel_gen: GenerationCounter,
    /// Resolver forwarding task for the current channel.
    feed: Option<AbortHandle>,
    latest: Option<StreamMetadata>,
    last_failure: Option<TierFailure>,
    /// Last status published.  `None` until the first transition.
    status: Option<EngineStatus>,
    event_tx: mpsc::Sender<EngineEvent>,
    broadcast_tx: broadcast::Sender<EngineBroadcast>,
}

impl EngineCore {
    pub fn new(
        config: &Config,
        deps: EngineDeps,
        broadcast_tx: broadcast::Sender<EngineBroadcast>,
        event_tx: mpsc::Sender<EngineEvent>,
    ) -> Self {
        let channel_id = config.engine.channel_id.trim().to_string();
        let enabled = config.mount.enabled;
        let compositor = Compositor::new(
            deps.foreground,
            deps.background,
            CompositorOptions {
                fit: config.mount.fit,
                mobile: config.mount.mobile,
                reconcile_interval: config.engine.reconcile_interval(),
                ..CompositorOptions::default()
            },
        );

        Self {
            state_manager: Arc::new(StateManager::new(channel_id.clone(), enabled)),
            channel_id,
            enabled,
            options: config.mount.clone(),
            resolver: Arc::new(MetadataResolver::new(deps.source)),
            tiers: deps.tiers,
            compositor,
            selector: TierSelector::new(),
            mount: None,
            mount_gen: GenerationCounter::new(),
            channel_gen: GenerationCounter::new(),
            feed: None,
            latest: None,
            last_failure: None,
            status: None,
            event_tx,
            broadcast_tx,
        }
    }

    /// Borrow the state manager (for the HTTP server and socket clients).
    pub fn state_manager(&self) -> Arc<StateManager> {
        Arc::clone(&self.state_manager)
    }

    /// Run the core event loop.  Returns on `Shutdown` or when the event
    /// channel closes.
    pub async fn run(mut self, mut event_rx: mpsc::Receiver<EngineEvent>) -> anyhow::Result<()> {
        info!("EngineCore: starting event loop for '{}'", self.channel_id);

        if self.channel_id.is_empty() {
            self.fail_session(EngineError::Configuration("no channel id configured".into()))
                .await;
        } else if self.enabled {
            self.start_feed();
        } else {
            self.set_status(EngineStatus::Suspended).await;
        }
        self.notify_state();

        loop {
            let evt = event_rx.recv().await;
            match evt {
                None => {
                    info!("EngineCore: event channel closed, shutting down");
                    break;
                }

                Some(EngineEvent::Shutdown) => {
                    info!("EngineCore: shutdown requested");
                    break;
                }

                Some(EngineEvent::Metadata { token, metadata }) => {
                    self.handle_metadata(token, metadata).await;
                }

                Some(EngineEvent::Tier(event)) => {
                    self.handle_tier_event(event).await;
                }

                Some(EngineEvent::Command(cmd)) => {
                    info!("EngineCore: command {:?}", cmd);
                    self.handle_command(cmd).await;
                }
            }
            self.notify_state();
        }

        self.cleanup().await;
        Ok(())
    }

    // ── metadata ──────────────────────────────────────────────────────────────

    async fn handle_metadata(&mut self, token: LivenessToken, metadata: StreamMetadata) {
        if !token.is_live() || metadata.channel_id != self.channel_id {
            debug!(
                "EngineCore: dropping metadata for '{}' from stale subscription {}",
                metadata.channel_id,
                token.generation()
            );
            return;
        }
        debug!(
            "EngineCore: metadata active={} hints={:?}",
            metadata.is_active, metadata.hints
        );
        self.state_manager.set_metadata(&metadata).await;
        self.latest = Some(metadata.clone());

        if !metadata.is_active {
            self.unmount().await;
            self.selector.reset();
            self.last_failure = None;
            self.publish_tiers().await;
            self.set_status(EngineStatus::Offline).await;
            return;
        }
        self.apply_selection().await;
    }

    /// Mount the best eligible tier for the latest snapshot, promoting past
    /// tiers that fail to mount.  Leaves an already-correct mount alone.
    async fn apply_selection(&mut self) {
        let Some(metadata) = self.latest.clone() else {
            return;
        };
        if !self.enabled || !metadata.is_active {
            return;
        }

        loop {
            let Some(tier) = self.selector.select(&metadata) else {
                self.unmount().await;
                self.exhausted().await;
                return;
            };
            let hint = metadata.hint_for(tier).map(str::to_string);
            if let Some(mount) = &self.mount {
                if mount.tier == tier && mount.hint == hint {
                    return;
                }
            }
            match self.mount_tier(tier, hint, &metadata).await {
                Ok(()) => return,
                Err(failure) => {
                    warn!("EngineCore: {} failed to mount: {}", tier, failure);
                    self.selector.mark_failed(tier);
                    self.last_failure = Some(failure);
                    self.publish_tiers().await;
                }
            }
        }
    }

    async fn mount_tier(
        &mut self,
        tier: TransportTier,
        hint: Option<String>,
        metadata: &StreamMetadata,
    ) -> Result<(), TierFailure> {
        // Previous tier is fully released before the next one starts.
        self.unmount().await;

        let token = self.mount_gen.advance();
        let generation = token.generation();
        let reporter = TierReporter::new(token, tier, self.event_tx.clone());
        let mut player = self.tiers.build(tier);
        let mut teardown = TeardownSet::new();

        info!("EngineCore: mounting {} ({})", tier, generation);
        self.selector.set_current(Some(tier));
        self.publish_tiers().await;
        if self.selector.note_degraded(tier) {
            self.emit(PlaybackSignal::TransportDegraded { tier });
        }
        self.set_status(EngineStatus::Connecting).await;

        let ctx = MountContext {
            metadata: metadata.clone(),
            options: self.options.clone(),
            reporter,
        };
        if let Err(failure) = player.mount(ctx, &mut teardown).await {
            teardown.release_all();
            player.unmount().await;
            self.mount_gen.advance();
            self.selector.set_current(None);
            return Err(failure);
        }

        self.mount = Some(MountSession {
            generation,
            tier,
            hint,
            player,
            teardown,
        });
        Ok(())
    }

    async fn unmount(&mut self) {
        let Some(mut mount) = self.mount.take() else {
            return;
        };
        // Invalidate before releasing so nothing the old mount still has in
        // flight can land.
        self.mount_gen.advance();
        self.compositor.detach().await;
        let released = mount.teardown.release_all();
        mount.player.unmount().await;
        debug!(
            "EngineCore: unmounted {} ({}), released {} resources",
            mount.tier, mount.generation, released
        );
        self.selector.set_current(None);
        self.publish_tiers().await;
    }

    async fn exhausted(&mut self) {
        let error = match self.last_failure.clone() {
            Some(TierFailure::Configuration(reason)) => EngineError::Configuration(reason),
            Some(last) => EngineError::Exhausted { last },
            None => EngineError::Exhausted {
                last: TierFailure::Transport("no transport available".into()),
            },
        };
        self.fail_session(error).await;
    }

    // ── tier reports ──────────────────────────────────────────────────────────

    async fn handle_tier_event(&mut self, event: TierEvent) {
        let current = self.mount.as_ref().map(|m| m.generation);
        if current != Some(event.generation) {
            debug!(
                "EngineCore: dropping {} report from stale {}",
                event.tier, event.generation
            );
            return;
        }

        match event.kind {
            TierEventKind::Connecting => self.set_status(EngineStatus::Connecting).await,

            TierEventKind::ConnectionState(state) => {
                self.state_manager.set_connection_state(state).await;
                if state == ConnectionState::Reconnecting {
                    self.set_status(EngineStatus::Connecting).await;
                }
            }

            TierEventKind::Live(track) => {
                self.compositor.attach(track).await;
                self.set_status(EngineStatus::Live).await;
            }

            TierEventKind::TrackGone => {
                self.compositor.detach().await;
                if self.status == Some(EngineStatus::Live) {
                    self.set_status(EngineStatus::Connecting).await;
                }
            }

            TierEventKind::Stalled { reason } => {
                info!("EngineCore: {} stalled: {}", event.tier, reason);
                self.set_status(EngineStatus::Degraded).await;
            }

            TierEventKind::CodecChanged(codec) => {
                self.state_manager.set_codec_mode(codec).await;
            }

            TierEventKind::Failed(failure) => {
                warn!("EngineCore: {} failed: {}", event.tier, failure);
                self.unmount().await;
                self.selector.mark_failed(event.tier);
                self.last_failure = Some(failure);
                self.publish_tiers().await;
                self.apply_selection().await;
            }
        }
    }

    // ── commands ──────────────────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Retry => {
                info!("EngineCore: retry requested, restarting from the top tier");
                self.unmount().await;
                self.selector.reset();
                self.last_failure = None;
                if self.status == Some(EngineStatus::Fatal) {
                    self.status = None;
                }
                self.publish_tiers().await;
                if self.latest.as_ref().is_some_and(|m| !m.is_active) {
                    self.set_status(EngineStatus::Offline).await;
                }
                self.apply_selection().await;
            }

            Command::SetEnabled { enabled } => {
                if enabled == self.enabled {
                    return;
                }
                self.enabled = enabled;
                self.state_manager.set_enabled(enabled).await;
                if enabled {
                    info!("EngineCore: resumed");
                    self.status = None;
                    if self.channel_id.is_empty() {
                        self.fail_session(EngineError::Configuration(
                            "no channel id configured".into(),
                        ))
                        .await;
                    } else {
                        self.start_feed();
                    }
                } else {
                    info!("EngineCore: suspended");
                    self.stop_feed();
                    self.unmount().await;
                    self.selector.reset();
                    self.last_failure = None;
                    self.publish_tiers().await;
                    self.set_status(EngineStatus::Suspended).await;
                }
            }

            Command::SetChannel { channel_id } => {
                let channel_id = channel_id.trim().to_string();
                if channel_id == self.channel_id {
                    return;
                }
                info!(
                    "EngineCore: switching channel '{}' -> '{}'",
                    self.channel_id, channel_id
                );
                self.stop_feed();
                self.unmount().await;
                self.selector.reset();
                self.latest = None;
                self.last_failure = None;
                self.channel_id = channel_id.clone();
                self.state_manager.set_channel(channel_id).await;

                if self.channel_id.is_empty() {
                    self.fail_session(EngineError::Configuration(
                        "no channel id configured".into(),
                    ))
                    .await;
                } else if self.enabled {
                    self.status = None;
                    self.start_feed();
                }
            }

            // State is broadcast after every event anyway.
            Command::GetState => {}
        }
    }

    // ── resolver feed ─────────────────────────────────────────────────────────

    fn start_feed(&mut self) {
        self.stop_feed();
        let token = self.channel_gen.advance();
        let resolver = Arc::clone(&self.resolver);
        let channel = self.channel_id.clone();
        let tx = self.event_tx.clone();
        let task = tokio::spawn(async move {
            let mut subscription = resolver.subscribe(&channel).await;
            while let Some(metadata) = subscription.next().await {
                let event = EngineEvent::Metadata {
                    token: token.clone(),
                    metadata,
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });
        self.feed = Some(task.abort_handle());
    }

    fn stop_feed(&mut self) {
        self.channel_gen.advance();
        if let Some(feed) = self.feed.take() {
            feed.abort();
        }
    }

    // ── publishing ────────────────────────────────────────────────────────────

    async fn set_status(&mut self, status: EngineStatus) {
        if self.status == Some(status) {
            return;
        }
        self.status = Some(status);
        self.state_manager.set_status(status).await;
        let signal = match status {
            EngineStatus::Offline => Some(PlaybackSignal::Offline),
            EngineStatus::Connecting => Some(PlaybackSignal::Connecting),
            EngineStatus::Live => Some(PlaybackSignal::Live),
            EngineStatus::Degraded | EngineStatus::Suspended | EngineStatus::Fatal => None,
        };
        if let Some(signal) = signal {
            self.emit(signal);
        }
    }

    /// Surfaced once per session; `Retry` or an offline transition clears it.
    async fn fail_session(&mut self, error: EngineError) {
        if self.status == Some(EngineStatus::Fatal) {
            return;
        }
        let reason = error.to_string();
        error!("EngineCore: {}", reason);
        self.status = Some(EngineStatus::Fatal);
        self.state_manager.set_fatal(reason.clone()).await;
        self.emit(PlaybackSignal::Fatal { reason });
    }

    async fn publish_tiers(&self) {
        self.state_manager
            .set_tiers(self.selector.current(), self.selector.failed())
            .await;
    }

    fn emit(&self, signal: PlaybackSignal) {
        info!("EngineCore: signal {:?}", signal);
        let _ = self.broadcast_tx.send(EngineBroadcast::Signal(signal));
    }

    fn notify_state(&self) {
        let _ = self.broadcast_tx.send(EngineBroadcast::StateUpdated);
    }

    async fn cleanup(&mut self) {
        self.stop_feed();
        self.unmount().await;
        let stats = self.compositor.stats();
        info!(
            "EngineCore: stopped (attaches={}, detaches={})",
            stats.attaches, stats.detaches
        );
    }
}
