//! Pure transition table for the low-latency tier.
//!
//! `step` never performs I/O: it returns the actions the session driver must
//! execute.  That keeps reconnect, join-timeout and codec-downgrade behaviour
//! testable without a network.
use std::time::Duration;

use live_proto::config::EngineConfig;
use live_proto::protocol::{CodecMode, ConnectionState};
use tracing::debug;

use crate::error::{TierFailure, TransportError};
use crate::transport::{SharedTrack, TransportStatus};

#[derive(Debug, Clone)]
pub struct MachineConfig {
    pub retry_budget: u32,
    pub reconnect_delay: Duration,
    pub join_timeout: Duration,
    pub decode_failure_threshold: u32,
}

impl Default for MachineConfig {
    fn default() -> Self {
        (&EngineConfig::default()).into()
    }
}

impl From<&EngineConfig> for MachineConfig {
    fn from(cfg: &EngineConfig) -> Self {
        Self {
            retry_budget: cfg.retry_budget,
            reconnect_delay: cfg.reconnect_delay(),
            join_timeout: cfg.join_timeout(),
            decode_failure_threshold: cfg.decode_failure_threshold.max(1),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Input {
    Mount,
    Joined,
    JoinFailed(TransportError),
    TrackPublished(SharedTrack),
    TrackSubscribed(SharedTrack),
    SubscribeFailed(TransportError),
    TrackUnpublished { track_id: String },
    Disconnected { reason: String },
    ReconnectDelayElapsed,
    /// Join timer fired; `transport` is what the transport reported at that moment.
    JoinTimeoutElapsed { transport: TransportStatus },
    DecodeFailure { detail: String },
    FrameDecoded,
}

#[derive(Debug, Clone)]
pub enum Action {
    Enter(ConnectionState),
    OpenSession(CodecMode),
    CloseSession,
    ArmJoinTimeout(Duration),
    CancelJoinTimeout,
    ScheduleReconnect(Duration),
    Subscribe(SharedTrack),
    AttachTrack(SharedTrack),
    DetachTrack,
    ApplyQualityHints,
    CodecDowngraded(CodecMode),
    Fail(TierFailure),
}

#[derive(Debug)]
pub struct LowLatencyMachine {
    config: MachineConfig,
    state: ConnectionState,
    codec: CodecMode,
    failed_attempts: u32,
    decode_failures: u32,
    downgraded: bool,
    track: Option<SharedTrack>,
}

impl LowLatencyMachine {
    pub fn new(config: MachineConfig) -> Self {
        Self {
            config,
            state: ConnectionState::Idle,
            codec: CodecMode::Primary,
            failed_attempts: 0,
            decode_failures: 0,
            downgraded: false,
            track: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn codec(&self) -> CodecMode {
        self.codec
    }

    pub fn failed_attempts(&self) -> u32 {
        self.failed_attempts
    }

    pub fn step(&mut self, input: Input) -> Vec<Action> {
        use ConnectionState::*;

        let mut out = Vec::new();
        match (self.state, input) {
            (Failed, input) => debug!("low-latency: ignoring {:?} after failure", input),

            (Idle, Input::Mount) => self.open(&mut out),

            (Connecting, Input::Joined) => {
                self.enter(Connected, &mut out);
                self.enter(AwaitingMedia, &mut out);
            }

            (Connecting, Input::JoinFailed(err)) => {
                if err.is_retryable() {
                    self.lose(err.to_string(), &mut out);
                } else {
                    self.fail(err.normalize(), &mut out);
                }
            }

            (AwaitingMedia | Live, Input::TrackPublished(track)) => {
                out.push(Action::Subscribe(track));
            }

            (AwaitingMedia | Live, Input::TrackSubscribed(track)) => {
                let first = self.state == AwaitingMedia;
                self.failed_attempts = 0;
                self.track = Some(track.clone());
                if first {
                    out.push(Action::CancelJoinTimeout);
                }
                out.push(Action::AttachTrack(track));
                if first {
                    self.enter(Live, &mut out);
                    out.push(Action::ApplyQualityHints);
                }
            }

            (AwaitingMedia | Live, Input::SubscribeFailed(err)) => {
                self.lose(format!("subscribe failed: {err}"), &mut out);
            }

            (Live, Input::TrackUnpublished { track_id }) => {
                if self.track.as_ref().is_some_and(|t| t.id() == track_id) {
                    self.track = None;
                    out.push(Action::DetachTrack);
                    self.enter(AwaitingMedia, &mut out);
                    out.push(Action::ArmJoinTimeout(self.config.join_timeout));
                }
            }

            (Connecting | Connected | AwaitingMedia | Live, Input::Disconnected { reason }) => {
                self.lose(reason, &mut out);
            }

            (Reconnecting, Input::ReconnectDelayElapsed) => self.open(&mut out),

            (Connecting | Connected | AwaitingMedia, Input::JoinTimeoutElapsed { transport }) => {
                if transport.is_progressing() {
                    debug!(
                        "low-latency: no media yet but transport is {:?}, re-arming",
                        transport
                    );
                    out.push(Action::ArmJoinTimeout(self.config.join_timeout));
                } else {
                    let failure = TierFailure::Timeout(format!(
                        "no media within {}s, transport {:?}",
                        self.config.join_timeout.as_secs(),
                        transport
                    ));
                    self.fail(failure, &mut out);
                }
            }

            (AwaitingMedia | Live, Input::DecodeFailure { detail }) => {
                self.decode_failures += 1;
                debug!(
                    "low-latency: decode failure {}/{}: {}",
                    self.decode_failures, self.config.decode_failure_threshold, detail
                );
                if self.decode_failures >= self.config.decode_failure_threshold {
                    if self.codec == CodecMode::Primary && !self.downgraded {
                        self.downgrade(&mut out);
                    } else {
                        self.fail(
                            TierFailure::Decode(format!("persists on fallback codec: {detail}")),
                            &mut out,
                        );
                    }
                }
            }

            (AwaitingMedia | Live, Input::FrameDecoded) => self.decode_failures = 0,

            (state, input) => debug!("low-latency: {:?} ignores {:?}", state, input),
        }
        out
    }

    fn enter(&mut self, state: ConnectionState, out: &mut Vec<Action>) {
        if self.state != state {
            self.state = state;
            out.push(Action::Enter(state));
        }
    }

    fn open(&mut self, out: &mut Vec<Action>) {
        self.enter(ConnectionState::Connecting, out);
        out.push(Action::OpenSession(self.codec));
        out.push(Action::ArmJoinTimeout(self.config.join_timeout));
    }

    fn teardown_session(&mut self, out: &mut Vec<Action>) {
        out.push(Action::CancelJoinTimeout);
        if self.track.take().is_some() {
            out.push(Action::DetachTrack);
        }
        out.push(Action::CloseSession);
        self.decode_failures = 0;
    }

    /// Connection lost or connect attempt failed: retry after a fixed delay
    /// while the budget lasts.
    fn lose(&mut self, reason: String, out: &mut Vec<Action>) {
        self.failed_attempts += 1;
        if self.failed_attempts > self.config.retry_budget {
            let failure = TierFailure::Transport(format!(
                "retry budget of {} exhausted: {}",
                self.config.retry_budget, reason
            ));
            self.fail(failure, out);
            return;
        }
        self.teardown_session(out);
        self.enter(ConnectionState::Reconnecting, out);
        out.push(Action::ScheduleReconnect(self.config.reconnect_delay));
    }

    fn downgrade(&mut self, out: &mut Vec<Action>) {
        self.teardown_session(out);
        self.codec = CodecMode::Fallback;
        self.downgraded = true;
        out.push(Action::CodecDowngraded(self.codec));
        self.open(out);
    }

    fn fail(&mut self, failure: TierFailure, out: &mut Vec<Action>) {
        self.teardown_session(out);
        self.enter(ConnectionState::Failed, out);
        out.push(Action::Fail(failure));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MediaTrack;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    struct StubTrack {
        id: String,
        stopped: AtomicBool,
    }

    impl MediaTrack for StubTrack {
        fn id(&self) -> &str {
            &self.id
        }
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

    fn track(id: &str) -> SharedTrack {
        Arc::new(StubTrack {
            id: id.into(),
            stopped: AtomicBool::new(false),
        })
    }

    fn machine() -> LowLatencyMachine {
        LowLatencyMachine::new(MachineConfig::default())
    }

    fn live_machine() -> LowLatencyMachine {
        let mut m = machine();
        m.step(Input::Mount);
        m.step(Input::Joined);
        m.step(Input::TrackSubscribed(track("v1")));
        assert_eq!(m.state(), ConnectionState::Live);
        m
    }

    fn entered(actions: &[Action]) -> Vec<ConnectionState> {
        actions
            .iter()
            .filter_map(|a| match a {
                Action::Enter(s) => Some(*s),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_mount_opens_primary_session_with_join_timer() {
        let mut m = machine();
        let actions = m.step(Input::Mount);
        assert_eq!(m.state(), ConnectionState::Connecting);
        assert!(matches!(actions[1], Action::OpenSession(CodecMode::Primary)));
        assert!(matches!(actions[2], Action::ArmJoinTimeout(d) if d == Duration::from_secs(30)));
    }

    #[test]
    fn test_join_walks_through_connected_to_awaiting_media() {
        let mut m = machine();
        m.step(Input::Mount);
        let actions = m.step(Input::Joined);
        assert_eq!(
            entered(&actions),
            vec![ConnectionState::Connected, ConnectionState::AwaitingMedia]
        );
    }

    #[test]
    fn test_first_track_goes_live_and_applies_hints() {
        let mut m = machine();
        m.step(Input::Mount);
        m.step(Input::Joined);
        let actions = m.step(Input::TrackPublished(track("v1")));
        assert!(matches!(actions.as_slice(), [Action::Subscribe(_)]));

        let actions = m.step(Input::TrackSubscribed(track("v1")));
        assert!(matches!(actions[0], Action::CancelJoinTimeout));
        assert!(matches!(actions[1], Action::AttachTrack(_)));
        assert_eq!(entered(&actions), vec![ConnectionState::Live]);
        assert!(matches!(actions.last(), Some(Action::ApplyQualityHints)));
    }

    #[test]
    fn test_disconnect_schedules_fixed_delay_reconnect() {
        let mut m = live_machine();
        let actions = m.step(Input::Disconnected {
            reason: "ice failed".into(),
        });
        assert_eq!(m.state(), ConnectionState::Reconnecting);
        assert!(actions.iter().any(|a| matches!(a, Action::DetachTrack)));
        assert!(actions.iter().any(|a| matches!(a, Action::CloseSession)));
        assert!(matches!(
            actions.last(),
            Some(Action::ScheduleReconnect(d)) if *d == Duration::from_secs(3)
        ));

        m.step(Input::ReconnectDelayElapsed);
        assert_eq!(m.state(), ConnectionState::Connecting);
    }

    #[test]
    fn test_retry_budget_exhaustion_fails_tier() {
        let mut m = LowLatencyMachine::new(MachineConfig {
            retry_budget: 2,
            ..MachineConfig::default()
        });
        m.step(Input::Mount);
        for _ in 0..2 {
            m.step(Input::JoinFailed(TransportError::Network("reset".into())));
            assert_eq!(m.state(), ConnectionState::Reconnecting);
            m.step(Input::ReconnectDelayElapsed);
        }
        let actions = m.step(Input::JoinFailed(TransportError::Network("reset".into())));
        assert_eq!(m.state(), ConnectionState::Failed);
        assert!(matches!(
            actions.last(),
            Some(Action::Fail(TierFailure::Transport(_)))
        ));
    }

    #[test]
    fn test_reaching_live_refills_retry_budget() {
        let mut m = machine();
        m.step(Input::Mount);
        m.step(Input::JoinFailed(TransportError::Network("reset".into())));
        m.step(Input::ReconnectDelayElapsed);
        assert_eq!(m.failed_attempts(), 1);
        m.step(Input::Joined);
        m.step(Input::TrackSubscribed(track("v1")));
        assert_eq!(m.failed_attempts(), 0);
    }

    #[test]
    fn test_rejected_join_fails_without_retry() {
        let mut m = machine();
        m.step(Input::Mount);
        let actions = m.step(Input::JoinFailed(TransportError::Unauthorized("expired".into())));
        assert_eq!(m.state(), ConnectionState::Failed);
        assert!(!actions
            .iter()
            .any(|a| matches!(a, Action::ScheduleReconnect(_))));
    }

    #[test]
    fn test_join_timeout_rearms_while_transport_is_connecting() {
        let mut m = machine();
        m.step(Input::Mount);
        let actions = m.step(Input::JoinTimeoutElapsed {
            transport: TransportStatus::Connecting,
        });
        assert_eq!(m.state(), ConnectionState::Connecting);
        assert!(matches!(actions.as_slice(), [Action::ArmJoinTimeout(_)]));
    }

    #[test]
    fn test_join_timeout_fails_when_transport_stalled() {
        let mut m = machine();
        m.step(Input::Mount);
        let actions = m.step(Input::JoinTimeoutElapsed {
            transport: TransportStatus::Stalled,
        });
        assert_eq!(m.state(), ConnectionState::Failed);
        assert!(matches!(
            actions.last(),
            Some(Action::Fail(TierFailure::Timeout(_)))
        ));
    }

    #[test]
    fn test_decode_failures_downgrade_codec_exactly_once() {
        let mut m = live_machine();
        m.step(Input::DecodeFailure { detail: "a".into() });
        m.step(Input::DecodeFailure { detail: "b".into() });
        let actions = m.step(Input::DecodeFailure { detail: "c".into() });

        assert_eq!(m.codec(), CodecMode::Fallback);
        assert_eq!(m.state(), ConnectionState::Connecting);
        let downgrades = actions
            .iter()
            .filter(|a| matches!(a, Action::CodecDowngraded(_)))
            .count();
        assert_eq!(downgrades, 1);
        assert!(actions
            .iter()
            .any(|a| matches!(a, Action::OpenSession(CodecMode::Fallback))));

        // Late decode failures while reconnecting must not trigger another downgrade.
        for _ in 0..5 {
            let actions = m.step(Input::DecodeFailure { detail: "late".into() });
            assert!(actions.is_empty());
        }
        assert_eq!(m.codec(), CodecMode::Fallback);
    }

    #[test]
    fn test_decode_failures_after_downgrade_escalate() {
        let mut m = live_machine();
        for _ in 0..3 {
            m.step(Input::DecodeFailure { detail: "x".into() });
        }
        m.step(Input::Joined);
        m.step(Input::TrackSubscribed(track("v2")));
        let mut last = Vec::new();
        for _ in 0..3 {
            last = m.step(Input::DecodeFailure { detail: "y".into() });
        }
        assert_eq!(m.state(), ConnectionState::Failed);
        assert!(matches!(last.last(), Some(Action::Fail(TierFailure::Decode(_)))));
    }

    #[test]
    fn test_clean_frame_resets_consecutive_decode_failures() {
        let mut m = live_machine();
        m.step(Input::DecodeFailure { detail: "a".into() });
        m.step(Input::DecodeFailure { detail: "b".into() });
        m.step(Input::FrameDecoded);
        m.step(Input::DecodeFailure { detail: "c".into() });
        m.step(Input::DecodeFailure { detail: "d".into() });
        assert_eq!(m.codec(), CodecMode::Primary);
        assert_eq!(m.state(), ConnectionState::Live);
    }

    #[test]
    fn test_unpublished_track_returns_to_awaiting_media() {
        let mut m = live_machine();
        let actions = m.step(Input::TrackUnpublished {
            track_id: "other".into(),
        });
        assert!(actions.is_empty());
        let actions = m.step(Input::TrackUnpublished {
            track_id: "v1".into(),
        });
        assert_eq!(m.state(), ConnectionState::AwaitingMedia);
        assert!(matches!(actions[0], Action::DetachTrack));
    }

    #[test]
    fn test_failed_is_terminal() {
        let mut m = machine();
        m.step(Input::Mount);
        m.step(Input::JoinTimeoutElapsed {
            transport: TransportStatus::Closed,
        });
        assert!(m.step(Input::Joined).is_empty());
        assert!(m.step(Input::ReconnectDelayElapsed).is_empty());
        assert_eq!(m.state(), ConnectionState::Failed);
    }
}
