//! Standalone circuit relay server.
//!
//! Nodes behind NAT reserve a slot here and become reachable through
//! `/p2p/<relay>/p2p-circuit/p2p/<node>` addresses.

use anyhow::Result;
use futures::StreamExt;
use libp2p::{
    identify, identity::Keypair, noise, ping, relay, swarm::NetworkBehaviour, swarm::SwarmEvent,
    tcp, yamux, Multiaddr, PeerId, Swarm,
};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::behaviour::PROTOCOL_VERSION;
use crate::config::RelayConfig;

/// Behaviour of the relay node
#[derive(NetworkBehaviour)]
pub struct RelayServerBehaviour {
    pub relay: relay::Behaviour,
    pub identify: identify::Behaviour,
    pub ping: ping::Behaviour,
}

impl RelayServerBehaviour {
    pub fn new(keypair: &Keypair, config: &RelayConfig) -> Self {
        let local_peer_id = PeerId::from(keypair.public());
        let relay_config = relay::Config {
            max_reservations: config.max_reservations,
            max_circuits: config.max_circuits,
            ..Default::default()
        };
        Self {
            relay: relay::Behaviour::new(local_peer_id, relay_config),
            identify: identify::Behaviour::new(identify::Config::new(
                PROTOCOL_VERSION.to_string(),
                keypair.public(),
            )),
            ping: ping::Behaviour::new(ping::Config::new()),
        }
    }
}

/// Relay server node
pub struct RelayServer {
    pub local_peer_id: PeerId,
    swarm: Swarm<RelayServerBehaviour>,
}

impl RelayServer {
    /// Build the relay swarm and start listening. Bind errors are fatal.
    pub fn new(keypair: Keypair, config: &RelayConfig) -> Result<Self> {
        let local_peer_id = PeerId::from(keypair.public());
        let relay_config = config.clone();

        let mut swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_tcp(tcp::Config::default(), noise::Config::new, yamux::Config::default)?
            .with_quic()
            .with_behaviour(|key| RelayServerBehaviour::new(key, &relay_config))?
            .with_swarm_config(|c| c.with_idle_connection_timeout(Duration::from_secs(120)))
            .build();

        let listen: Multiaddr = config
            .listen_addr
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid relay listen address '{}': {}", config.listen_addr, e))?;
        swarm.listen_on(listen)?;

        info!("Relay peer ID: {}", local_peer_id);
        Ok(Self { local_peer_id, swarm })
    }

    /// Serve reservations and circuits until shutdown
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => self.handle_event(event),
                _ = shutdown.recv() => {
                    info!("Relay shutting down");
                    break;
                }
            }
        }
        Ok(())
    }

    fn handle_event(&mut self, event: SwarmEvent<RelayServerBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!("Relay listening on: {}/p2p/{}", address, self.local_peer_id);
            }
            SwarmEvent::Behaviour(RelayServerBehaviourEvent::Relay(event)) => match event {
                relay::Event::ReservationReqAccepted { src_peer_id, renewed } => {
                    info!("Reservation accepted for {} (renewed: {})", src_peer_id, renewed);
                }
                relay::Event::ReservationTimedOut { src_peer_id } => {
                    debug!("Reservation expired for {}", src_peer_id);
                }
                relay::Event::CircuitReqAccepted { src_peer_id, dst_peer_id } => {
                    debug!("Circuit opened {} -> {}", src_peer_id, dst_peer_id);
                }
                relay::Event::CircuitClosed { src_peer_id, dst_peer_id, error } => {
                    if let Some(e) = error {
                        debug!("Circuit {} -> {} closed: {}", src_peer_id, dst_peer_id, e);
                    }
                }
                other => debug!("Relay event: {:?}", other),
            },
            SwarmEvent::Behaviour(RelayServerBehaviourEvent::Identify(identify::Event::Received {
                peer_id,
                info,
                ..
            })) => {
                // Reservations hand out our external address, so learn it from peers
                self.swarm.add_external_address(info.observed_addr);
                debug!("Identified {} ({})", peer_id, info.agent_version);
            }
            SwarmEvent::ListenerError { error, .. } => {
                warn!("Relay listener error: {}", error);
            }
            _ => {}
        }
    }
}
