mod auth;
mod executor;
mod metadata;
mod session;
mod terminal;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::ServerConfig;
use auth::Authenticator;

/// Channel of encoded wire frames feeding a connection's writer task.
pub(crate) type FrameTx = mpsc::UnboundedSender<Vec<u8>>;

/// Dependencies shared by every session of one server.
pub(crate) struct ServerState {
    pub cfg: ServerConfig,
    pub auth: Authenticator,
}

/// Bind and serve until the process is stopped.
pub async fn run(cfg: ServerConfig) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", cfg.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("caas server listening on {addr}");
    serve(listener, cfg).await
}

/// Serve on an already-bound listener. Split out from [`run`] so tests
/// can bind an ephemeral port first.
pub async fn serve(listener: TcpListener, cfg: ServerConfig) -> anyhow::Result<()> {
    let app = router(cfg);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("server error")
}

fn router(cfg: ServerConfig) -> Router {
    let path = cfg.path.clone();
    let terminal = cfg.terminal.clone();
    let state = Arc::new(ServerState {
        auth: Authenticator::from_config(&cfg),
        cfg,
    });

    let mut router = Router::new().route(&path, get(ws_handler));
    if terminal.enabled {
        info!("terminal endpoint enabled at {}", terminal.path);
        router = router.route(&terminal.path, get(terminal::ws_handler));
    }
    router
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
) -> Response {
    ws.on_upgrade(move |socket| session::handle_socket(socket, state))
}
