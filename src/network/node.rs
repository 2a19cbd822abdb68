//! P2P network node implementation
//!
//! One task owns the swarm. Everything else talks to it through a
//! `NetworkHandle` (commands with oneshot replies) and listens to the
//! `NetworkEvent` channel plus the room-topic payload channel.

use super::behaviour::{ChatBehaviour, ChatBehaviourEvent};
use super::host::{ChatTopic, HostError, NetworkHost};
use crate::config::NodeConfig;
use crate::types::{peer_id_of, DiscoverySource, PeerCandidate};

use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use libp2p::{
    autonat,
    core::transport::ListenerId,
    dcutr,
    gossipsub::{self, IdentTopic},
    identify,
    identity::Keypair,
    kad, mdns,
    multiaddr::Protocol,
    noise, relay,
    swarm::{dial_opts::DialOpts, ConnectionId, DialError, SwarmEvent},
    tcp, upnp, yamux, Multiaddr, PeerId, Swarm,
};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

/// Chat payloads above this size are dropped on arrival
const MAX_CHAT_MESSAGE_SIZE: usize = 64 * 1024;
/// Buffered commands from handles
const COMMAND_CHANNEL_CAPACITY: usize = 256;
/// Buffered events for the orchestrator
const EVENT_CHANNEL_CAPACITY: usize = 256;
/// Buffered topic payloads for the inbound bridge
const TOPIC_CHANNEL_CAPACITY: usize = 1024;

type Reply<T> = oneshot::Sender<Result<T, HostError>>;

/// Commands to send to the network node
#[derive(Debug)]
pub enum NetworkCommand {
    /// Dial a candidate; replies once connected or failed
    Dial {
        candidate: PeerCandidate,
        reply: Reply<PeerId>,
    },
    /// Remember an address for a peer
    AddAddress { peer_id: PeerId, addr: Multiaddr },
    /// Listen through a relay, which requests a reservation
    ReserveRelay { addr: Multiaddr, reply: Reply<()> },
    /// Close every circuit listener through this relay, pending or accepted
    CancelReservation { addr: Multiaddr },
    /// Count DHT routing table entries
    RoutingTableSize(oneshot::Sender<usize>),
    /// Start providing a rendezvous key
    Advertise { key: String, reply: Reply<()> },
    /// Look up providers of a rendezvous key
    FindProviders {
        key: String,
        reply: Reply<Vec<PeerId>>,
    },
    /// Publish on the room topic
    Publish { data: Vec<u8>, reply: Reply<()> },
}

/// Events from the network node
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    /// A connection came up
    ConnectionEstablished {
        peer_id: PeerId,
        address: Multiaddr,
        /// We dialled (as opposed to accepted)
        outbound: bool,
    },
    /// Last connection to a peer went away
    ConnectionClosed(PeerId),
    /// A peer was announced on the local network
    PeerDiscovered(PeerCandidate),
}

/// Handle for interacting with the network node
#[derive(Clone)]
pub struct NetworkHandle {
    command_tx: mpsc::Sender<NetworkCommand>,
    pub local_peer_id: PeerId,
}

impl NetworkHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> NetworkCommand,
    ) -> Result<T, HostError> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(make(tx))
            .await
            .map_err(|_| HostError::NodeShutDown)?;
        rx.await.map_err(|_| HostError::NodeShutDown)
    }
}

#[async_trait]
impl NetworkHost for NetworkHandle {
    fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    async fn add_address(&self, peer_id: PeerId, addr: Multiaddr) -> Result<(), HostError> {
        self.command_tx
            .send(NetworkCommand::AddAddress { peer_id, addr })
            .await
            .map_err(|_| HostError::NodeShutDown)
    }

    async fn connect(&self, candidate: &PeerCandidate) -> Result<PeerId, HostError> {
        let candidate = candidate.clone();
        self.request(|reply| NetworkCommand::Dial { candidate, reply })
            .await
            .and_then(|r| r)
    }

    async fn reserve_relay(&self, addr: Multiaddr) -> Result<(), HostError> {
        self.request(|reply| NetworkCommand::ReserveRelay { addr, reply })
            .await
            .and_then(|r| r)
    }

    async fn cancel_reservation(&self, addr: Multiaddr) -> Result<(), HostError> {
        self.command_tx
            .send(NetworkCommand::CancelReservation { addr })
            .await
            .map_err(|_| HostError::NodeShutDown)
    }

    async fn routing_table_size(&self) -> Result<usize, HostError> {
        self.request(NetworkCommand::RoutingTableSize).await
    }

    async fn advertise(&self, key: &str) -> Result<(), HostError> {
        let key = key.to_string();
        self.request(|reply| NetworkCommand::Advertise { key, reply })
            .await
            .and_then(|r| r)
    }

    async fn find_peers(&self, key: &str) -> Result<Vec<PeerId>, HostError> {
        let key = key.to_string();
        self.request(|reply| NetworkCommand::FindProviders { key, reply })
            .await
            .and_then(|r| r)
    }
}

#[async_trait]
impl ChatTopic for NetworkHandle {
    async fn publish(&self, data: Vec<u8>) -> Result<(), HostError> {
        self.request(|reply| NetworkCommand::Publish { data, reply })
            .await
            .and_then(|r| r)
    }
}

/// Provider lookup in progress
struct PendingLookup {
    providers: HashSet<PeerId>,
    error: Option<String>,
    reply: Reply<Vec<PeerId>>,
}

/// Network node for P2P communication
pub struct NetworkNode {
    /// Local peer ID
    pub local_peer_id: PeerId,
    /// Swarm instance
    swarm: Swarm<ChatBehaviour>,
    /// Room topic
    topic: IdentTopic,
    /// Dials awaiting a connection outcome
    pending_dials: HashMap<ConnectionId, Reply<PeerId>>,
    /// Circuit listeners, keyed to the relay they go through
    relay_listeners: HashMap<ListenerId, PeerId>,
    /// Circuit listeners still waiting for the relay to accept
    pending_reservations: HashMap<ListenerId, Reply<()>>,
    /// start_providing queries
    pending_advertise: HashMap<kad::QueryId, Reply<()>>,
    /// get_providers queries
    pending_lookups: HashMap<kad::QueryId, PendingLookup>,
    /// Command receiver
    command_rx: mpsc::Receiver<NetworkCommand>,
    /// Event sender
    event_tx: mpsc::Sender<NetworkEvent>,
    /// Room topic payloads
    topic_tx: mpsc::Sender<Vec<u8>>,
}

impl NetworkNode {
    /// Build the swarm, bind listeners and join the room topic.
    ///
    /// Returns the node (to be driven by [`NetworkNode::run`]), a handle,
    /// the event stream and the room-topic subscription.
    #[allow(clippy::type_complexity)]
    pub fn new(
        config: &NodeConfig,
        keypair: Keypair,
    ) -> Result<(
        Self,
        NetworkHandle,
        mpsc::Receiver<NetworkEvent>,
        mpsc::Receiver<Vec<u8>>,
    )> {
        let local_peer_id = PeerId::from(keypair.public());
        info!("Local peer ID: {}", local_peer_id);

        let behaviour_config = config.clone();
        let mut swarm = libp2p::SwarmBuilder::with_existing_identity(keypair)
            .with_tokio()
            .with_tcp(tcp::Config::default(), noise::Config::new, yamux::Config::default)?
            .with_quic()
            .with_relay_client(noise::Config::new, yamux::Config::default)?
            .with_behaviour(|key, relay_behaviour| {
                ChatBehaviour::new(key, relay_behaviour, &behaviour_config)
                    .map_err(|e| -> Box<dyn std::error::Error + Send + Sync> { e.into() })
            })?
            .with_swarm_config(|c| c.with_idle_connection_timeout(Duration::from_secs(60)))
            .build();

        for addr in config.listen_addrs() {
            let addr: Multiaddr = addr
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid listen address '{}': {}", addr, e))?;
            swarm.listen_on(addr)?;
        }

        for addr in &config.announce_addrs {
            let addr: Multiaddr = addr
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid announce address '{}': {}", addr, e))?;
            info!("Announcing external address {}", addr);
            swarm.add_external_address(addr);
        }

        let topic = IdentTopic::new(config.topic_name());
        swarm.behaviour_mut().gossipsub.subscribe(&topic)?;
        info!("Joined topic {}", topic);

        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (topic_tx, topic_rx) = mpsc::channel(TOPIC_CHANNEL_CAPACITY);

        let handle = NetworkHandle {
            command_tx,
            local_peer_id,
        };

        let node = Self {
            local_peer_id,
            swarm,
            topic,
            pending_dials: HashMap::new(),
            relay_listeners: HashMap::new(),
            pending_reservations: HashMap::new(),
            pending_advertise: HashMap::new(),
            pending_lookups: HashMap::new(),
            command_rx,
            event_tx,
            topic_tx,
        };

        Ok((node, handle, event_rx, topic_rx))
    }

    /// Process swarm events and commands until shutdown
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        loop {
            tokio::select! {
                event = self.swarm.select_next_some() => {
                    self.handle_swarm_event(event);
                }
                cmd = self.command_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        info!("Network node shutting down");
                        break;
                    }
                },
                _ = shutdown.recv() => {
                    info!("Network node shutting down");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Hand an event to the application without stalling the swarm
    fn emit(&self, event: NetworkEvent) {
        if let Err(TrySendError::Full(event)) = self.event_tx.try_send(event) {
            warn!("Network event channel full, dropping {:?}", event);
        }
    }

    fn handle_swarm_event(&mut self, event: SwarmEvent<ChatBehaviourEvent>) {
        match event {
            SwarmEvent::Behaviour(behaviour_event) => {
                self.handle_behaviour_event(behaviour_event);
            }
            SwarmEvent::NewListenAddr { address, .. } => {
                info!("Listening on: {}/p2p/{}", address, self.local_peer_id);
            }
            SwarmEvent::ExternalAddrConfirmed { address } => {
                info!("External address confirmed: {}", address);
            }
            SwarmEvent::ConnectionEstablished {
                peer_id,
                connection_id,
                endpoint,
                ..
            } => {
                let address = endpoint.get_remote_address().clone();
                let outbound = endpoint.is_dialer();
                info!("Connected to peer: {} via {}", peer_id, address);

                // Accepted connections come from ephemeral ports; only dialled
                // addresses are worth putting in the routing table
                if outbound {
                    self.swarm
                        .behaviour_mut()
                        .kademlia
                        .add_address(&peer_id, address.clone());
                }

                if let Some(reply) = self.pending_dials.remove(&connection_id) {
                    let _ = reply.send(Ok(peer_id));
                }

                self.emit(NetworkEvent::ConnectionEstablished {
                    peer_id,
                    address,
                    outbound,
                });
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established,
                ..
            } => {
                if num_established == 0 {
                    info!("Disconnected from peer: {}", peer_id);
                    self.emit(NetworkEvent::ConnectionClosed(peer_id));
                }
            }
            SwarmEvent::OutgoingConnectionError {
                connection_id,
                peer_id,
                error,
            } => {
                debug!("Failed to connect to {:?}: {}", peer_id, error);
                if let Some(reply) = self.pending_dials.remove(&connection_id) {
                    let _ = reply.send(Err(HostError::Dial(error.to_string())));
                }
            }
            SwarmEvent::ListenerClosed {
                listener_id,
                reason,
                ..
            } => {
                let relay = self.relay_listeners.remove(&listener_id);
                if let Some(reply) = self.pending_reservations.remove(&listener_id) {
                    let reason = match reason {
                        Ok(()) => "listener closed".to_string(),
                        Err(e) => e.to_string(),
                    };
                    debug!("Relay listener via {:?} closed: {}", relay, reason);
                    let _ = reply.send(Err(HostError::Reservation(reason)));
                }
            }
            SwarmEvent::ListenerError { listener_id, error } => {
                warn!("Listener error: {}", error);
                if let Some(reply) = self.pending_reservations.remove(&listener_id) {
                    let _ = reply.send(Err(HostError::Reservation(error.to_string())));
                }
            }
            _ => {}
        }
    }

    fn handle_behaviour_event(&mut self, event: ChatBehaviourEvent) {
        match event {
            ChatBehaviourEvent::Gossipsub(gossipsub::Event::Message {
                propagation_source,
                message,
                ..
            }) => {
                if message.topic != self.topic.hash() {
                    return;
                }
                if message.data.len() > MAX_CHAT_MESSAGE_SIZE {
                    warn!(
                        "Dropping oversized chat message from {}: {} bytes exceeds {} byte limit",
                        propagation_source,
                        message.data.len(),
                        MAX_CHAT_MESSAGE_SIZE,
                    );
                    return;
                }
                if let Err(TrySendError::Full(_)) = self.topic_tx.try_send(message.data) {
                    warn!("Topic consumer lagging, dropped message from {}", propagation_source);
                }
            }
            ChatBehaviourEvent::Gossipsub(gossipsub::Event::Subscribed { peer_id, topic }) => {
                debug!("{} joined {}", peer_id, topic);
            }
            ChatBehaviourEvent::Mdns(mdns::Event::Discovered(peers)) => {
                let mut by_peer: HashMap<PeerId, Vec<Multiaddr>> = HashMap::new();
                for (peer_id, addr) in peers {
                    self.swarm
                        .behaviour_mut()
                        .kademlia
                        .add_address(&peer_id, addr.clone());
                    by_peer.entry(peer_id).or_default().push(addr);
                }
                for (peer_id, addrs) in by_peer {
                    debug!("Discovered peer via mDNS: {} ({} addresses)", peer_id, addrs.len());
                    self.emit(NetworkEvent::PeerDiscovered(PeerCandidate::from_peer(
                        peer_id,
                        addrs,
                        DiscoverySource::LocalNetwork,
                    )));
                }
            }
            ChatBehaviourEvent::Mdns(mdns::Event::Expired(peers)) => {
                for (peer_id, _) in peers {
                    debug!("mDNS peer expired: {}", peer_id);
                }
            }
            ChatBehaviourEvent::Kademlia(kad::Event::OutboundQueryProgressed {
                id, result, step, ..
            }) => self.handle_kad_progress(id, result, step.last),
            ChatBehaviourEvent::Identify(identify::Event::Received { peer_id, info, .. }) => {
                debug!("Identified peer {}: {}", peer_id, info.protocol_version);
                for addr in info.listen_addrs {
                    self.swarm
                        .behaviour_mut()
                        .kademlia
                        .add_address(&peer_id, addr);
                }
            }
            ChatBehaviourEvent::Autonat(autonat::Event::StatusChanged { old, new }) => {
                info!("NAT status changed: {:?} -> {:?}", old, new);
            }
            ChatBehaviourEvent::RelayClient(relay::client::Event::ReservationReqAccepted {
                relay_peer_id,
                renewal,
                ..
            }) => {
                if renewal {
                    debug!("Relay reservation renewed by {}", relay_peer_id);
                    return;
                }
                let listeners = self.listeners_via(&relay_peer_id);
                if listeners.is_empty() {
                    // Listener already removed by a cancel; nothing holds the slot
                    debug!("Ignoring late reservation from {}", relay_peer_id);
                    return;
                }
                info!("Relay reservation accepted by {}", relay_peer_id);
                for id in listeners {
                    if let Some(reply) = self.pending_reservations.remove(&id) {
                        let _ = reply.send(Ok(()));
                    }
                }
            }
            ChatBehaviourEvent::Dcutr(dcutr::Event {
                remote_peer_id,
                result,
            }) => match result {
                Ok(_) => info!("Hole punch to {} succeeded", remote_peer_id),
                Err(e) => debug!("Hole punch to {} failed: {}", remote_peer_id, e),
            },
            ChatBehaviourEvent::Upnp(upnp::Event::NewExternalAddr(addr)) => {
                info!("UPnP mapped external address {}", addr);
            }
            ChatBehaviourEvent::Upnp(upnp::Event::GatewayNotFound) => {
                debug!("No UPnP gateway found");
            }
            _ => {}
        }
    }

    fn handle_kad_progress(&mut self, id: kad::QueryId, result: kad::QueryResult, last_step: bool) {
        match result {
            kad::QueryResult::StartProviding(result) => {
                if let Some(reply) = self.pending_advertise.remove(&id) {
                    let _ = reply.send(
                        result
                            .map(|_| ())
                            .map_err(|e| HostError::Discovery(e.to_string())),
                    );
                }
            }
            kad::QueryResult::GetProviders(result) => {
                if let Some(lookup) = self.pending_lookups.get_mut(&id) {
                    match result {
                        Ok(kad::GetProvidersOk::FoundProviders { providers, .. }) => {
                            lookup.providers.extend(providers);
                        }
                        Ok(kad::GetProvidersOk::FinishedWithNoAdditionalRecord { .. }) => {}
                        Err(e) => lookup.error = Some(e.to_string()),
                    }
                }
                if last_step {
                    if let Some(lookup) = self.pending_lookups.remove(&id) {
                        let outcome = match lookup.error {
                            Some(e) if lookup.providers.is_empty() => Err(HostError::Discovery(e)),
                            _ => Ok(lookup.providers.into_iter().collect()),
                        };
                        let _ = lookup.reply.send(outcome);
                    }
                }
            }
            other => debug!("Kademlia query {:?} progressed: {:?}", id, other),
        }
    }

    fn handle_command(&mut self, cmd: NetworkCommand) {
        match cmd {
            NetworkCommand::Dial { candidate, reply } => self.dial(candidate, reply),
            NetworkCommand::AddAddress { peer_id, addr } => {
                self.swarm.add_peer_address(peer_id, addr.clone());
                self.swarm.behaviour_mut().kademlia.add_address(&peer_id, addr);
            }
            NetworkCommand::ReserveRelay { addr, reply } => self.reserve_relay(addr, reply),
            NetworkCommand::CancelReservation { addr } => self.cancel_reservation(&addr),
            NetworkCommand::RoutingTableSize(reply) => {
                let size = self
                    .swarm
                    .behaviour_mut()
                    .kademlia
                    .kbuckets()
                    .map(|bucket| bucket.num_entries())
                    .sum();
                let _ = reply.send(size);
            }
            NetworkCommand::Advertise { key, reply } => {
                let key = kad::RecordKey::new(&key);
                match self.swarm.behaviour_mut().kademlia.start_providing(key) {
                    Ok(query_id) => {
                        self.pending_advertise.insert(query_id, reply);
                    }
                    Err(e) => {
                        let _ = reply.send(Err(HostError::Discovery(e.to_string())));
                    }
                }
            }
            NetworkCommand::FindProviders { key, reply } => {
                let query_id = self
                    .swarm
                    .behaviour_mut()
                    .kademlia
                    .get_providers(kad::RecordKey::new(&key));
                self.pending_lookups.insert(
                    query_id,
                    PendingLookup {
                        providers: HashSet::new(),
                        error: None,
                        reply,
                    },
                );
            }
            NetworkCommand::Publish { data, reply } => {
                let result = self
                    .swarm
                    .behaviour_mut()
                    .gossipsub
                    .publish(self.topic.clone(), data)
                    .map(|_| ())
                    .map_err(|e| HostError::Publish(e.to_string()));
                let _ = reply.send(result);
            }
        }
    }

    fn dial(&mut self, candidate: PeerCandidate, reply: Reply<PeerId>) {
        let opts = match (candidate.peer_id, candidate.addrs.as_slice()) {
            (Some(peer_id), []) => DialOpts::peer_id(peer_id).build(),
            (Some(peer_id), addrs) => DialOpts::peer_id(peer_id).addresses(addrs.to_vec()).build(),
            (None, [addr, ..]) => DialOpts::unknown_peer_id().address(addr.clone()).build(),
            (None, []) => {
                let _ = reply.send(Err(HostError::Dial(
                    "candidate has neither identity nor address".to_string(),
                )));
                return;
            }
        };
        let connection_id = opts.connection_id();

        match self.swarm.dial(opts) {
            Ok(()) => {
                self.pending_dials.insert(connection_id, reply);
            }
            Err(DialError::DialPeerConditionFalse(_)) => {
                // Only reachable with a known identity: already connected or mid-dial
                let outcome = match candidate.peer_id {
                    Some(peer_id) if self.swarm.is_connected(&peer_id) => Ok(peer_id),
                    _ => Err(HostError::Dial("dial already in progress".to_string())),
                };
                let _ = reply.send(outcome);
            }
            Err(e) => {
                let _ = reply.send(Err(HostError::Dial(e.to_string())));
            }
        }
    }

    fn reserve_relay(&mut self, addr: Multiaddr, reply: Reply<()>) {
        let Some(relay_peer) = peer_id_of(&addr) else {
            let _ = reply.send(Err(HostError::Reservation(format!(
                "relay address {} has no /p2p/ identity",
                addr
            ))));
            return;
        };

        match self.swarm.listen_on(addr.with(Protocol::P2pCircuit)) {
            Ok(listener_id) => {
                self.relay_listeners.insert(listener_id, relay_peer);
                self.pending_reservations.insert(listener_id, reply);
            }
            Err(e) => {
                let _ = reply.send(Err(HostError::Reservation(e.to_string())));
            }
        }
    }

    fn listeners_via(&self, relay: &PeerId) -> Vec<ListenerId> {
        self.relay_listeners
            .iter()
            .filter(|(_, peer)| *peer == relay)
            .map(|(id, _)| *id)
            .collect()
    }

    fn cancel_reservation(&mut self, addr: &Multiaddr) {
        let Some(relay) = peer_id_of(addr) else {
            return;
        };
        for id in self.listeners_via(&relay) {
            debug!("Closing circuit listener via {}", relay);
            self.relay_listeners.remove(&id);
            self.pending_reservations.remove(&id);
            self.swarm.remove_listener(id);
        }
    }
}
