use crate::protocol::{
    CodecMode, ConnectionState, EngineState, EngineStatus, StreamMetadata, TransportTier,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Shared, read-mostly view of the engine.  Only the engine core writes to it;
/// HTTP handlers and socket clients read snapshots.  Nothing here is persisted.
pub struct StateManager {
    state: Arc<RwLock<EngineState>>,
}

impl StateManager {
    pub fn new(channel_id: String, enabled: bool) -> Self {
        let state = EngineState {
            rev: 1,
            channel_id,
            enabled,
            status: if enabled {
                EngineStatus::Offline
            } else {
                EngineStatus::Suspended
            },
            ..EngineState::default()
        };

        Self {
            state: Arc::new(RwLock::new(state)),
        }
    }

    pub async fn get_state(&self) -> EngineState {
        self.state.read().await.clone()
    }

    pub async fn set_channel(&self, channel_id: String) {
        let mut state = self.state.write().await;
        state.channel_id = channel_id;
        state.active = false;
        state.viewer_count = None;
        state.current_tier = None;
        state.failed_tiers.clear();
        state.connection_state = ConnectionState::Idle;
        state.codec_mode = CodecMode::Primary;
        state.fatal_reason = None;
        state.rev += 1;
    }

    pub async fn set_enabled(&self, enabled: bool) {
        let mut state = self.state.write().await;
        state.enabled = enabled;
        state.rev += 1;
    }

    pub async fn set_metadata(&self, meta: &StreamMetadata) {
        let mut state = self.state.write().await;
        state.active = meta.is_active;
        state.viewer_count = meta.viewer_count;
        state.rev += 1;
    }

    pub async fn set_status(&self, status: EngineStatus) {
        let mut state = self.state.write().await;
        if status != EngineStatus::Fatal {
            state.fatal_reason = None;
        }
        state.status = status;
        state.rev += 1;
    }

    pub async fn set_fatal(&self, reason: String) {
        let mut state = self.state.write().await;
        state.status = EngineStatus::Fatal;
        state.fatal_reason = Some(reason);
        state.rev += 1;
    }

    pub async fn set_tiers(&self, current: Option<TransportTier>, failed: &BTreeSet<TransportTier>) {
        let mut state = self.state.write().await;
        state.current_tier = current;
        state.failed_tiers = failed.iter().copied().collect();
        if current != Some(TransportTier::LowLatency) {
            state.connection_state = ConnectionState::Idle;
            state.codec_mode = CodecMode::Primary;
        }
        state.rev += 1;
    }

    pub async fn set_connection_state(&self, connection_state: ConnectionState) {
        let mut state = self.state.write().await;
        state.connection_state = connection_state;
        state.rev += 1;
    }

    pub async fn set_codec_mode(&self, codec_mode: CodecMode) {
        let mut state = self.state.write().await;
        state.codec_mode = codec_mode;
        state.rev += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rev_increments_on_every_change() {
        let sm = StateManager::new("main".into(), true);
        let before = sm.get_state().await.rev;
        sm.set_status(EngineStatus::Connecting).await;
        sm.set_connection_state(ConnectionState::Connecting).await;
        let after = sm.get_state().await;
        assert_eq!(after.rev, before + 2);
        assert_eq!(after.status, EngineStatus::Connecting);
    }

    #[tokio::test]
    async fn test_fatal_reason_cleared_on_recovery() {
        let sm = StateManager::new("main".into(), true);
        sm.set_fatal("all transports failed".into()).await;
        assert_eq!(
            sm.get_state().await.fatal_reason.as_deref(),
            Some("all transports failed")
        );
        sm.set_status(EngineStatus::Connecting).await;
        assert_eq!(sm.get_state().await.fatal_reason, None);
    }

    #[tokio::test]
    async fn test_disabled_starts_suspended() {
        let sm = StateManager::new("main".into(), false);
        assert_eq!(sm.get_state().await.status, EngineStatus::Suspended);
    }
}
