//! Gateway route definitions

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
    Router,
};
use tower_http::services::ServeFile;

use super::server::{run_session, GatewayState};
use crate::network::ChatTopic;

/// `/` serves the chat page, `/ws` upgrades to a chat session
pub fn create_router<T: ChatTopic>(state: Arc<GatewayState<T>>, static_page: &Path) -> Router {
    Router::new()
        .route_service("/", ServeFile::new(static_page))
        .route("/ws", get(ws_handler::<T>))
        .with_state(state)
}

async fn ws_handler<T: ChatTopic>(
    ws: WebSocketUpgrade,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(state): State<Arc<GatewayState<T>>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| run_session(socket, remote, state))
}
