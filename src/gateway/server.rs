//! Web gateway
//!
//! Serves the chat page and a WebSocket endpoint. Each socket becomes a
//! session with its own bounded queue, drained by a dedicated writer task,
//! so one stalled browser only ever loses its own messages.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::ws::{Message, WebSocket};
use axum::Router;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use super::bridge::TopicBridge;
use super::registry::ClientRegistry;
use super::routes::create_router;
use crate::config::GatewayConfig;
use crate::network::ChatTopic;

/// How long a writer may keep flushing after its session is torn down
const WRITER_GRACE: Duration = Duration::from_secs(2);

/// Shared by every request handler and session
pub struct GatewayState<T: ChatTopic> {
    pub bridge: TopicBridge<T>,
    pub registry: Arc<ClientRegistry>,
    /// Sender name for every locally published line
    pub nick: String,
    pub queue_capacity: usize,
    pub local_echo: bool,
    pub shutdown: broadcast::Sender<()>,
}

impl<T: ChatTopic> GatewayState<T> {
    /// One inbound client frame is one chat line
    async fn handle_line(&self, text: &str) {
        if let Ok(msg) = self.bridge.publish_line(&self.nick, text).await {
            if self.local_echo {
                self.registry.broadcast(&msg);
            }
        }
    }
}

/// HTTP/WebSocket front end for local clients
pub struct FanoutGateway<T: ChatTopic> {
    state: Arc<GatewayState<T>>,
    static_page: PathBuf,
    shutdown_rx: broadcast::Receiver<()>,
}

impl<T: ChatTopic> FanoutGateway<T> {
    pub fn new(
        topic: Arc<T>,
        registry: Arc<ClientRegistry>,
        config: &GatewayConfig,
        nick: String,
        shutdown: broadcast::Sender<()>,
    ) -> Self {
        let shutdown_rx = shutdown.subscribe();
        let state = GatewayState {
            bridge: TopicBridge::new(topic),
            registry,
            nick,
            queue_capacity: config.queue_capacity,
            local_echo: config.local_echo,
            shutdown,
        };
        Self {
            state: Arc::new(state),
            static_page: config.static_page.clone(),
            shutdown_rx,
        }
    }

    pub fn router(&self) -> Router {
        create_router(self.state.clone(), &self.static_page)
    }

    /// Serve on an already bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr().context("Gateway listener has no address")?;
        let app = self.router().layer(TraceLayer::new_for_http());
        let mut shutdown = self.shutdown_rx;

        info!("Web UI available at http://{}", addr);

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            info!("Gateway shutting down");
        })
        .await
        .context("Gateway server error")?;

        Ok(())
    }
}

/// Drive one upgraded socket until the client leaves, the writer fails or
/// shutdown is signalled
pub(super) async fn run_session<T: ChatTopic>(
    socket: WebSocket,
    remote: SocketAddr,
    state: Arc<GatewayState<T>>,
) {
    let (id, mut queue) = state.registry.register(state.queue_capacity, Some(remote));
    info!("Web client {} connected ({} online)", remote, state.registry.len());

    let (mut sink, mut stream) = socket.split();

    let mut writer_shutdown = state.shutdown.subscribe();
    let mut writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                frame = queue.recv() => match frame {
                    Some(frame) => {
                        if let Err(e) = sink.send(Message::Text(frame)).await {
                            debug!("Session {} write failed: {}", id, e);
                            return;
                        }
                    }
                    None => break,
                },
                _ = writer_shutdown.recv() => break,
            }
        }
        let _ = sink.send(Message::Close(None)).await;
    });

    let mut shutdown = state.shutdown.subscribe();
    let mut writer_done = false;
    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => state.handle_line(&text).await,
                Some(Ok(Message::Binary(bytes))) => {
                    state.handle_line(&String::from_utf8_lossy(&bytes)).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Session {} read failed: {}", id, e);
                    break;
                }
            },
            _ = &mut writer => {
                writer_done = true;
                break;
            }
            _ = shutdown.recv() => break,
        }
    }

    // Dropping the registry entry closes the queue, which ends the writer
    state.registry.remove(id);
    if !writer_done && tokio::time::timeout(WRITER_GRACE, &mut writer).await.is_err() {
        debug!("Session {} writer stalled, aborting", id);
        writer.abort();
    }

    info!("Web client {} disconnected ({} online)", remote, state.registry.len());
}
