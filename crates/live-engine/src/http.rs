use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use live_engine::EngineEvent;
use live_proto::protocol::{Command, EngineState};
use live_proto::state::StateManager;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

#[derive(Clone)]
struct HttpState {
    state_manager: Arc<StateManager>,
    event_tx: mpsc::Sender<EngineEvent>,
}

pub fn start_server(
    bind_address: String,
    port: u16,
    state_manager: Arc<StateManager>,
    event_tx: mpsc::Sender<EngineEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(HttpState {
            state_manager,
            event_tx,
        });

        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("HTTP API server listening on http://{}", addr);

        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    })
}

fn router(app_state: HttpState) -> Router {
    Router::new()
        .route("/api/state", get(get_state))
        .route("/api/retry", post(retry))
        .route("/api/enabled/:flag", post(set_enabled))
        .route("/api/channel/:id", post(set_channel))
        .layer(CorsLayer::permissive())
        .with_state(app_state)
}

async fn get_state(State(state): State<HttpState>) -> Json<EngineState> {
    Json(state.state_manager.get_state().await)
}

async fn retry(State(state): State<HttpState>) -> StatusCode {
    info!("HTTP API: Retry");
    send(&state, Command::Retry).await
}

async fn set_enabled(State(state): State<HttpState>, Path(flag): Path<String>) -> StatusCode {
    let enabled = match flag.as_str() {
        "true" | "1" | "on" => true,
        "false" | "0" | "off" => false,
        _ => return StatusCode::BAD_REQUEST,
    };
    info!("HTTP API: Set enabled {}", enabled);
    send(&state, Command::SetEnabled { enabled }).await
}

async fn set_channel(State(state): State<HttpState>, Path(id): Path<String>) -> StatusCode {
    if id.trim().is_empty() {
        return StatusCode::BAD_REQUEST;
    }
    info!("HTTP API: Switch channel to {}", id);
    send(&state, Command::SetChannel { channel_id: id }).await
}

async fn send(state: &HttpState, cmd: Command) -> StatusCode {
    if state.event_tx.send(EngineEvent::Command(cmd)).await.is_err() {
        error!("Failed to forward command, engine is gone");
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    StatusCode::ACCEPTED
}
