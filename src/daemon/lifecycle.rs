//! Process lifecycle
//!
//! Startup does everything that may fail fatally (identity, swarm, listeners,
//! peers file) before any task is spawned. Shutdown is one broadcast followed
//! by a bounded join of every task.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use libp2p::PeerId;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::discovery::{ConnectivityOrchestrator, OrchestratorSettings, PeerRecordStore};
use crate::gateway::{run_inbound, ClientRegistry, FanoutGateway, InboundExit};
use crate::network::{load_or_generate_keypair, NetworkNode, RelayServer};
use crate::util::default_nick;

/// Per-task deadline once shutdown has been signalled
const TASK_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// A running chat node
pub struct ChatDaemon {
    local_peer_id: PeerId,
    web_addr: SocketAddr,
    nick: String,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl ChatDaemon {
    /// Build the node and spawn its tasks
    pub async fn start(config: Config) -> Result<Self> {
        info!("Starting meshchat node in room '{}'", config.node.room);

        let keypair = load_or_generate_keypair(&config.node.key_path())
            .context("Failed to load node identity")?;

        let (node, handle, events, subscription) =
            NetworkNode::new(&config.node, keypair).context("Failed to start network node")?;
        let local_peer_id = node.local_peer_id;

        let listener = TcpListener::bind(&config.gateway.listen_addr)
            .await
            .with_context(|| format!("Failed to bind web gateway on {}", config.gateway.listen_addr))?;
        let web_addr = listener.local_addr()?;

        let store = Arc::new(
            PeerRecordStore::load(config.node.peers_path()).context("Failed to load peers file")?,
        );

        let (shutdown_tx, _) = broadcast::channel(16);
        let handle = Arc::new(handle);
        let registry = Arc::new(ClientRegistry::new());
        let nick = config
            .gateway
            .nick
            .clone()
            .unwrap_or_else(|| default_nick(&local_peer_id));

        let mut tasks = Vec::new();

        let node_shutdown = shutdown_tx.subscribe();
        tasks.push((
            "network node",
            tokio::spawn(async move {
                if let Err(e) = node.run(node_shutdown).await {
                    error!("Network node failed: {}", e);
                }
            }),
        ));

        let orchestrator = Arc::new(ConnectivityOrchestrator::new(
            handle.clone(),
            store,
            OrchestratorSettings::from_config(&config.node),
        ));
        tasks.push((
            "orchestrator",
            tokio::spawn(orchestrator.run(events, shutdown_tx.subscribe())),
        ));

        let inbound_registry = registry.clone();
        let inbound_shutdown = shutdown_tx.subscribe();
        tasks.push((
            "topic bridge",
            tokio::spawn(async move {
                if let InboundExit::SubscriptionFailed(e) =
                    run_inbound(subscription, inbound_registry, inbound_shutdown).await
                {
                    error!("Topic inbound loop stopped: {}", e);
                }
            }),
        ));

        let gateway = FanoutGateway::new(
            handle,
            registry,
            &config.gateway,
            nick.clone(),
            shutdown_tx.clone(),
        );
        tasks.push((
            "gateway",
            tokio::spawn(async move {
                if let Err(e) = gateway.serve(listener).await {
                    error!("Gateway failed: {}", e);
                }
            }),
        ));

        info!("Node {} ready, posting as '{}'", local_peer_id, nick);

        Ok(Self {
            local_peer_id,
            web_addr,
            nick,
            shutdown_tx,
            tasks,
        })
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    /// Address the web gateway actually bound
    pub fn web_addr(&self) -> SocketAddr {
        self.web_addr
    }

    pub fn nick(&self) -> &str {
        &self.nick
    }

    /// Run until Ctrl+C or SIGTERM, then shut down
    pub async fn run(self) -> Result<()> {
        wait_for_signal().await;
        self.shutdown().await
    }

    /// Signal every task and wait for each, aborting stragglers
    pub async fn shutdown(self) -> Result<()> {
        info!("Shutting down");
        let _ = self.shutdown_tx.send(());
        join_tasks(self.tasks).await;
        info!("Shutdown complete");
        Ok(())
    }
}

/// Run a standalone circuit relay until interrupted
pub async fn run_relay(config: Config) -> Result<()> {
    let keypair = load_or_generate_keypair(&config.relay_key_path())
        .context("Failed to load relay identity")?;
    let relay = RelayServer::new(keypair, &config.relay).context("Failed to start relay")?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let task = tokio::spawn(async move {
        if let Err(e) = relay.run(shutdown_rx).await {
            error!("Relay failed: {}", e);
        }
    });

    wait_for_signal().await;
    let _ = shutdown_tx.send(());
    join_tasks(vec![("relay", task)]).await;
    Ok(())
}

async fn join_tasks(tasks: Vec<(&'static str, JoinHandle<()>)>) {
    for (name, task) in tasks {
        let abort = task.abort_handle();
        match tokio::time::timeout(TASK_SHUTDOWN_TIMEOUT, task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_panic() => error!("{} task panicked: {}", name, e),
            Ok(Err(_)) => {}
            Err(_) => {
                warn!(
                    "{} did not shut down within {:?}, aborting",
                    name, TASK_SHUTDOWN_TIMEOUT
                );
                abort.abort();
            }
        }
    }
}

async fn wait_for_signal() {
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = wait_for_sigterm() => {
            info!("Received SIGTERM, shutting down");
        }
    }
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("Failed to register SIGTERM handler: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await
}
