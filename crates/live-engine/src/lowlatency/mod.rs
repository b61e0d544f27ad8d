pub mod machine;
pub mod session;

use std::sync::Arc;

use async_trait::async_trait;
use live_proto::protocol::TransportTier;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::TierFailure;
use crate::lifecycle::TeardownSet;
use crate::tier::{MountContext, TierPlayer};
use crate::transport::TransportClientFactory;

pub use machine::{Action, Input, LowLatencyMachine, MachineConfig};
pub use session::{LowLatencySession, SessionSettings};

/// Tier 1: signaling transport driven by [`LowLatencySession`].
pub struct LowLatencyTier {
    factory: Arc<dyn TransportClientFactory>,
    settings: SessionSettings,
}

impl LowLatencyTier {
    pub fn new(factory: Arc<dyn TransportClientFactory>, settings: SessionSettings) -> Self {
        Self { factory, settings }
    }
}

#[async_trait]
impl TierPlayer for LowLatencyTier {
    fn tier(&self) -> TransportTier {
        TransportTier::LowLatency
    }

    async fn mount(
        &mut self,
        ctx: MountContext,
        teardown: &mut TeardownSet,
    ) -> Result<(), TierFailure> {
        let base_url = ctx
            .metadata
            .hint_for(TransportTier::LowLatency)
            .ok_or_else(|| TierFailure::Configuration("no low-latency base url".into()))?
            .to_string();

        let session = LowLatencySession::new(
            Arc::clone(&self.factory),
            self.settings.clone(),
            ctx.metadata.channel_id.clone(),
            base_url,
            ctx.options.muted,
            ctx.reporter,
        );
        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = stop.cancelled() => debug!("low-latency: session cancelled"),
                _ = session.run() => {}
            }
        });
        // Released in reverse order: cancel, then abort.
        teardown.track_task("low-latency session task", &task);
        teardown.track_cancel("low-latency session", cancel);
        Ok(())
    }

    async fn unmount(&mut self) {}
}
