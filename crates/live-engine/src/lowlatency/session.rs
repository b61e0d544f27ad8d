//! Session driver: executes machine actions against a real transport.
//!
//! ```text
//!   LowLatencySession::run()
//!         │
//!         ├── join task        → Msg::JoinResult   (tagged with attempt)
//!         ├── event forwarder  → Msg::Transport    (tagged with attempt)
//!         ├── join timer       → Msg::JoinTimer    (tagged with timer seq)
//!         └── reconnect timer  → Msg::ReconnectTimer
//! ```
//!
//! Every connect attempt gets a new attempt number; messages from an older
//! attempt are dropped before they reach the machine.  Dropping the session
//! (teardown aborts the task) aborts all helpers and closes the client.
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use live_proto::config::Config;
use live_proto::protocol::{CodecMode, ConnectionState};
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use super::machine::{Action, Input, LowLatencyMachine, MachineConfig};
use crate::error::TransportError;
use crate::tier::{TierEventKind, TierReporter};
use crate::transport::{
    SessionConfig, TransportClient, TransportClientFactory, TransportEvent, TransportStatus,
    TuningKnob,
};

const QUALITY_HINTS: [TuningKnob; 2] = [TuningKnob::PreferLowBitrate, TuningKnob::DisableBufferGrowth];

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub machine: MachineConfig,
    pub primary_codec: String,
    pub fallback_codec: String,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            machine: MachineConfig::from(&config.engine),
            primary_codec: config.transports.primary_codec.clone(),
            fallback_codec: config.transports.fallback_codec.clone(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            machine: MachineConfig::default(),
            primary_codec: "h264".into(),
            fallback_codec: "vp8".into(),
        }
    }
}

enum Msg {
    Transport { attempt: u64, event: TransportEvent },
    JoinResult { attempt: u64, result: Result<(), TransportError> },
    JoinTimer { seq: u64 },
    ReconnectTimer { seq: u64 },
}

#[derive(Default)]
struct Timer {
    seq: u64,
    handle: Option<AbortHandle>,
}

impl Timer {
    fn cancel(&mut self) {
        self.seq += 1;
        if let Some(h) = self.handle.take() {
            h.abort();
        }
    }

    /// Accept a firing only if it belongs to the currently armed timer.
    fn fired(&mut self, seq: u64) -> bool {
        if seq == self.seq && self.handle.is_some() {
            self.handle = None;
            true
        } else {
            false
        }
    }
}

pub struct LowLatencySession {
    machine: LowLatencyMachine,
    settings: SessionSettings,
    factory: Arc<dyn TransportClientFactory>,
    channel_id: String,
    base_url: String,
    muted: bool,
    reporter: TierReporter,
    tx: mpsc::Sender<Msg>,
    rx: mpsc::Receiver<Msg>,
    attempt: u64,
    client: Option<Arc<dyn TransportClient>>,
    attempt_tasks: Vec<AbortHandle>,
    join_timer: Timer,
    reconnect_timer: Timer,
}

impl LowLatencySession {
    pub fn new(
        factory: Arc<dyn TransportClientFactory>,
        settings: SessionSettings,
        channel_id: String,
        base_url: String,
        muted: bool,
        reporter: TierReporter,
    ) -> Self {
        let (tx, rx) = mpsc::channel(64);
        Self {
            machine: LowLatencyMachine::new(settings.machine.clone()),
            settings,
            factory,
            channel_id,
            base_url,
            muted,
            reporter,
            tx,
            rx,
            attempt: 0,
            client: None,
            attempt_tasks: Vec::new(),
            join_timer: Timer::default(),
            reconnect_timer: Timer::default(),
        }
    }

    /// Drive the machine until it fails or the mount goes stale.
    pub async fn run(mut self) {
        let mut pending = VecDeque::from([Input::Mount]);
        loop {
            while let Some(input) = pending.pop_front() {
                if !self.reporter.is_live() {
                    debug!("low-latency: mount superseded, stopping session");
                    return;
                }
                for action in self.machine.step(input) {
                    self.execute(action, &mut pending).await;
                }
                if self.machine.state() == ConnectionState::Failed {
                    return;
                }
            }

            let Some(msg) = self.rx.recv().await else {
                return;
            };
            if let Some(input) = self.accept(msg) {
                pending.push_back(input);
            }
        }
    }

    fn accept(&mut self, msg: Msg) -> Option<Input> {
        match msg {
            Msg::Transport { attempt, event } => {
                if attempt != self.attempt {
                    debug!("low-latency: dropping event from attempt {}", attempt);
                    return None;
                }
                Some(match event {
                    TransportEvent::TrackPublished(track) => Input::TrackPublished(track),
                    TransportEvent::TrackUnpublished { track_id } => {
                        Input::TrackUnpublished { track_id }
                    }
                    TransportEvent::Disconnected { reason } => Input::Disconnected { reason },
                    TransportEvent::DecodeFailure { detail } => Input::DecodeFailure { detail },
                    TransportEvent::FrameDecoded => Input::FrameDecoded,
                })
            }
            Msg::JoinResult { attempt, result } => {
                if attempt != self.attempt {
                    debug!("low-latency: dropping join result from attempt {}", attempt);
                    return None;
                }
                Some(match result {
                    Ok(()) => Input::Joined,
                    Err(e) => Input::JoinFailed(e),
                })
            }
            Msg::JoinTimer { seq } => {
                if !self.join_timer.fired(seq) {
                    return None;
                }
                let transport = self
                    .client
                    .as_ref()
                    .map(|c| c.status())
                    .unwrap_or(TransportStatus::Idle);
                Some(Input::JoinTimeoutElapsed { transport })
            }
            Msg::ReconnectTimer { seq } => self
                .reconnect_timer
                .fired(seq)
                .then_some(Input::ReconnectDelayElapsed),
        }
    }

    async fn execute(&mut self, action: Action, pending: &mut VecDeque<Input>) {
        match action {
            Action::Enter(state) => {
                info!("low-latency: {:?} ({})", state, self.channel_id);
                self.reporter
                    .report(TierEventKind::ConnectionState(state))
                    .await;
            }
            Action::OpenSession(codec) => {
                if let Err(e) = self.open_session(codec).await {
                    warn!("low-latency: could not create session: {}", e);
                    pending.push_back(Input::JoinFailed(e));
                }
            }
            Action::CloseSession => self.close_session(),
            Action::ArmJoinTimeout(after) => {
                self.join_timer.cancel();
                let seq = self.join_timer.seq;
                self.join_timer.handle = Some(self.spawn_timer(after, Msg::JoinTimer { seq }));
            }
            Action::CancelJoinTimeout => self.join_timer.cancel(),
            Action::ScheduleReconnect(after) => {
                self.reconnect_timer.cancel();
                let seq = self.reconnect_timer.seq;
                info!("low-latency: reconnecting in {:?}", after);
                self.reconnect_timer.handle =
                    Some(self.spawn_timer(after, Msg::ReconnectTimer { seq }));
            }
            Action::Subscribe(track) => {
                let result = match self.client.as_ref() {
                    Some(client) => client.subscribe(&track).await,
                    None => Err(TransportError::Closed),
                };
                pending.push_back(match result {
                    Ok(()) => Input::TrackSubscribed(track),
                    Err(e) => Input::SubscribeFailed(e),
                });
            }
            Action::AttachTrack(track) => {
                self.reporter.report(TierEventKind::Live(track)).await;
            }
            Action::DetachTrack => {
                self.reporter.report(TierEventKind::TrackGone).await;
            }
            Action::ApplyQualityHints => self.apply_quality_hints().await,
            Action::CodecDowngraded(codec) => {
                warn!(
                    "low-latency: repeated decode failures, switching to {} codec",
                    self.codec_name(codec)
                );
                self.reporter.report(TierEventKind::CodecChanged(codec)).await;
            }
            Action::Fail(failure) => {
                warn!("low-latency: tier failed: {}", failure);
                self.reporter.report(TierEventKind::Failed(failure)).await;
            }
        }
    }

    async fn open_session(&mut self, codec: CodecMode) -> Result<(), TransportError> {
        self.close_session();
        self.attempt += 1;
        let attempt = self.attempt;

        let config = SessionConfig {
            channel_id: self.channel_id.clone(),
            base_url: self.base_url.clone(),
            codec,
            codec_name: self.codec_name(codec).to_string(),
            muted: self.muted,
        };
        debug!(
            "low-latency: attempt {} with codec {}",
            attempt, config.codec_name
        );

        let (event_tx, mut event_rx) = mpsc::channel::<TransportEvent>(64);
        let client = self.factory.create(config, event_tx).await?;

        let tx = self.tx.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = event_rx.recv().await {
                if tx.send(Msg::Transport { attempt, event }).await.is_err() {
                    break;
                }
            }
        });

        let tx = self.tx.clone();
        let joining = Arc::clone(&client);
        let join = tokio::spawn(async move {
            let result = joining.join().await;
            let _ = tx.send(Msg::JoinResult { attempt, result }).await;
        });

        self.attempt_tasks.push(forwarder.abort_handle());
        self.attempt_tasks.push(join.abort_handle());
        self.client = Some(client);
        Ok(())
    }

    /// Stop helpers synchronously; the network close runs in the background.
    fn close_session(&mut self) {
        for task in self.attempt_tasks.drain(..) {
            task.abort();
        }
        if let Some(client) = self.client.take() {
            if let Ok(rt) = tokio::runtime::Handle::try_current() {
                rt.spawn(async move { client.close().await });
            }
        }
    }

    async fn apply_quality_hints(&self) {
        let Some(client) = self.client.as_ref() else {
            return;
        };
        for knob in QUALITY_HINTS {
            match client.tune(knob).await {
                Ok(()) => debug!("low-latency: applied {:?}", knob),
                Err(TransportError::Unsupported(what)) => {
                    debug!("low-latency: {:?} unsupported ({}), skipping", knob, what)
                }
                Err(e) => debug!("low-latency: {:?} failed: {}", knob, e),
            }
        }
    }

    fn spawn_timer(&self, after: Duration, msg: Msg) -> AbortHandle {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(msg).await;
        })
        .abort_handle()
    }

    fn codec_name(&self, codec: CodecMode) -> &str {
        match codec {
            CodecMode::Primary => &self.settings.primary_codec,
            CodecMode::Fallback => &self.settings.fallback_codec,
        }
    }
}

impl Drop for LowLatencySession {
    fn drop(&mut self) {
        self.join_timer.cancel();
        self.reconnect_timer.cancel();
        self.close_session();
    }
}
