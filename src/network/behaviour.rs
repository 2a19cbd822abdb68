//! libp2p behaviour composition

use libp2p::{
    autonat, dcutr, gossipsub, identify,
    identity::Keypair,
    kad, mdns, ping, relay,
    swarm::{behaviour::toggle::Toggle, NetworkBehaviour},
    upnp, PeerId, StreamProtocol,
};
use std::time::Duration;

use crate::config::NodeConfig;

/// Identify protocol version string
pub const PROTOCOL_VERSION: &str = "/meshchat/1.0.0";

/// Combined network behaviour for a chat node
#[derive(NetworkBehaviour)]
pub struct ChatBehaviour {
    /// GossipSub carrying the room topic
    pub gossipsub: gossipsub::Behaviour,
    /// Kademlia DHT for global rendezvous
    pub kademlia: kad::Behaviour<kad::store::MemoryStore>,
    /// mDNS for local peer discovery
    pub mdns: Toggle<mdns::tokio::Behaviour>,
    /// Identify protocol for peer identification
    pub identify: identify::Behaviour,
    /// Ping for connection keepalive
    pub ping: ping::Behaviour,
    /// AutoNAT for reachability detection
    pub autonat: autonat::Behaviour,
    /// Circuit relay client (reservations through public relays)
    pub relay_client: Toggle<relay::client::Behaviour>,
    /// Direct connection upgrade through relay (hole punching)
    pub dcutr: Toggle<dcutr::Behaviour>,
    /// UPnP port mapping
    pub upnp: Toggle<upnp::tokio::Behaviour>,
}

impl ChatBehaviour {
    /// Create a new chat behaviour
    pub fn new(
        keypair: &Keypair,
        relay_behaviour: relay::client::Behaviour,
        config: &NodeConfig,
    ) -> anyhow::Result<Self> {
        let local_peer_id = PeerId::from(keypair.public());

        // GossipSub configuration
        let gossipsub_config = gossipsub::ConfigBuilder::default()
            .heartbeat_interval(Duration::from_secs(1))
            .validation_mode(gossipsub::ValidationMode::Strict)
            .message_id_fn(|msg| {
                // Source is part of the id so two nodes sending the same text
                // at the same second are not deduplicated into one
                use sha2::{Digest, Sha256};
                let mut hasher = Sha256::new();
                if let Some(source) = &msg.source {
                    hasher.update(source.to_bytes());
                }
                if let Some(seqno) = msg.sequence_number {
                    hasher.update(seqno.to_be_bytes());
                }
                hasher.update(&msg.data);
                gossipsub::MessageId::from(hex::encode(hasher.finalize()))
            })
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build gossipsub config: {}", e))?;

        let gossipsub = gossipsub::Behaviour::new(
            gossipsub::MessageAuthenticity::Signed(keypair.clone()),
            gossipsub_config,
        )
        .map_err(|e| anyhow::anyhow!("Failed to create gossipsub: {}", e))?;

        // Kademlia configuration
        let mut kad_config = kad::Config::new(StreamProtocol::new("/ipfs/kad/1.0.0"));
        kad_config
            .set_query_timeout(Duration::from_secs(30))
            .set_provider_record_ttl(Some(Duration::from_secs(60 * 60)))
            .set_provider_publication_interval(Some(Duration::from_secs(10 * 60)));

        let mut kademlia = kad::Behaviour::with_config(
            local_peer_id,
            kad::store::MemoryStore::new(local_peer_id),
            kad_config,
        );
        kademlia.set_mode(Some(kad::Mode::Server));

        // mDNS for local discovery
        let mdns = if config.enable_mdns {
            Some(mdns::tokio::Behaviour::new(mdns::Config::default(), local_peer_id)?)
        } else {
            None
        };

        let identify = identify::Behaviour::new(identify::Config::new(
            PROTOCOL_VERSION.to_string(),
            keypair.public(),
        ));

        let ping = ping::Behaviour::new(ping::Config::new().with_interval(Duration::from_secs(30)));

        let autonat = autonat::Behaviour::new(local_peer_id, autonat::Config::default());

        let relay_client = config.enable_relay_client.then_some(relay_behaviour);
        let dcutr = config
            .enable_holepunch
            .then(|| dcutr::Behaviour::new(local_peer_id));
        let upnp = config.enable_upnp.then(upnp::tokio::Behaviour::default);

        Ok(Self {
            gossipsub,
            kademlia,
            mdns: Toggle::from(mdns),
            identify,
            ping,
            autonat,
            relay_client: Toggle::from(relay_client),
            dcutr: Toggle::from(dcutr),
            upnp: Toggle::from(upnp),
        })
    }
}
