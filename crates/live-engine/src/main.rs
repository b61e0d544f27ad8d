//! `livecastd`: the playback engine daemon.
//!
//! Renders through mpv and runs foreground-only.  mpv cannot duplicate a
//! decoded track (`MpvTrack::duplicate` is always `None`), so the blurred
//! desktop background layer the compositor supports never appears here.
//! Embedders with a duplicating media runtime pass a background surface to
//! `EngineDeps::standard` to get it.
mod http;
mod mpv;
mod mpv_transport;
mod socket;

use std::sync::Arc;

use live_engine::compositor::Surface;
use live_engine::resolver::HttpMetadataSource;
use live_engine::{EngineBroadcast, EngineCore, EngineDeps, EngineEvent};
use live_proto::config::Config;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::mpv_transport::{MpvLowLatencyFactory, MpvPlayerFactory, MpvRuntime, MpvSurface};

/// Forwards WARN and ERROR events to socket clients as `EngineBroadcast::Log`.
struct BroadcastLayer {
    sender: broadcast::Sender<EngineBroadcast>,
}

impl BroadcastLayer {
    fn new(sender: broadcast::Sender<EngineBroadcast>) -> Self {
        Self { sender }
    }
}

impl<S> tracing_subscriber::Layer<S> for BroadcastLayer
where
    S: tracing::Subscriber,
{
    fn on_event(
        &self,
        event: &tracing::Event<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let level = event.metadata().level();
        if !matches!(*level, tracing::Level::WARN | tracing::Level::ERROR) {
            return;
        }

        let mut message = format!("{} [{}] ", chrono::Local::now().format("%H:%M:%S"), level);
        let mut visitor = MessageVisitor(&mut message);
        event.record(&mut visitor);

        // No receivers is fine.
        let _ = self.sender.send(EngineBroadcast::Log(message));
    }
}

struct MessageVisitor<'a>(&'a mut String);

impl<'a> tracing::field::Visit for MessageVisitor<'a> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0.push_str(&format!("{:?}", value));
        } else {
            self.0.push_str(&format!(" {}={:?}", field.name(), value));
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (broadcast_tx, _) = broadcast::channel::<EngineBroadcast>(100);

    let data_dir = live_proto::platform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    let log_path = data_dir.join("daemon.log");
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(log_file)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(BroadcastLayer::new(broadcast_tx.clone()))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,live_engine=debug")),
        )
        .init();

    info!("Log file: {:?}", log_path);

    let config = Config::load()?;
    info!("Config loaded from: {:?}", Config::config_path());

    let runtime = MpvRuntime::new(&config.mpv);
    let foreground: Box<dyn Surface> = Box::new(MpvSurface::new(runtime.registry()));
    let deps = EngineDeps::standard(
        &config,
        Arc::new(HttpMetadataSource::new(&config.metadata)),
        Arc::new(MpvLowLatencyFactory::new(Arc::clone(&runtime))),
        Arc::new(MpvPlayerFactory::new(Arc::clone(&runtime))),
        foreground,
        // mpv cannot clone a decoded track, so there is no background layer.
        None,
    );

    // All external inputs funnel into EngineCore.
    let (event_tx, event_rx) = tokio::sync::mpsc::channel::<EngineEvent>(256);
    let engine = EngineCore::new(&config, deps, broadcast_tx.clone(), event_tx.clone());
    let state_manager = engine.state_manager();

    let _socket_handle = socket::start_server(
        config.http.bind_address.clone(),
        live_proto::platform::ENGINE_TCP_PORT,
        Arc::clone(&state_manager),
        event_tx.clone(),
        broadcast_tx.clone(),
    );

    if config.http.enabled {
        let _http_handle = http::start_server(
            config.http.bind_address.clone(),
            config.http.port,
            Arc::clone(&state_manager),
            event_tx.clone(),
        );
    }

    let shutdown_tx = event_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(EngineEvent::Shutdown).await;
        }
    });

    info!("livecastd initialised, running event loop");
    engine.run(event_rx).await?;

    Ok(())
}
