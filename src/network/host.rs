//! Capability traits the rest of the node programs against.
//!
//! `NetworkHandle` implements these over a live libp2p swarm; tests swap in
//! in-memory fakes.

use async_trait::async_trait;
use libp2p::{Multiaddr, PeerId};
use thiserror::Error;

use crate::types::PeerCandidate;

/// Errors surfaced by the network host and topic capabilities
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HostError {
    #[error("network node shut down")]
    NodeShutDown,

    #[error("dial failed: {0}")]
    Dial(String),

    #[error("relay reservation failed: {0}")]
    Reservation(String),

    #[error("discovery failed: {0}")]
    Discovery(String),

    #[error("publish failed: {0}")]
    Publish(String),

    #[error("topic subscription closed")]
    SubscriptionClosed,

    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Connection-level operations of the local P2P host
#[async_trait]
pub trait NetworkHost: Send + Sync + 'static {
    /// Identity of this node
    fn local_peer_id(&self) -> PeerId;

    /// Remember an address for `peer` without dialling it
    async fn add_address(&self, peer: PeerId, addr: Multiaddr) -> Result<(), HostError>;

    /// Dial a candidate and wait until a connection is established
    async fn connect(&self, candidate: &PeerCandidate) -> Result<PeerId, HostError>;

    /// Ask an already connected relay for a reservation
    async fn reserve_relay(&self, relay: Multiaddr) -> Result<(), HostError>;

    /// Drop any reservation, pending or held, at `relay`
    async fn cancel_reservation(&self, relay: Multiaddr) -> Result<(), HostError>;

    /// Number of peers in the DHT routing table
    async fn routing_table_size(&self) -> Result<usize, HostError>;

    /// Announce this node under `key`
    async fn advertise(&self, key: &str) -> Result<(), HostError>;

    /// Peers announced under `key`
    async fn find_peers(&self, key: &str) -> Result<Vec<PeerId>, HostError>;
}

/// Publishing side of the room topic
#[async_trait]
pub trait ChatTopic: Send + Sync + 'static {
    async fn publish(&self, data: Vec<u8>) -> Result<(), HostError>;
}

/// Receiving side of the room topic.
///
/// An error means the subscription is gone for good.
#[async_trait]
pub trait TopicSubscription: Send + 'static {
    async fn next_message(&mut self) -> Result<Vec<u8>, HostError>;
}

#[async_trait]
impl TopicSubscription for tokio::sync::mpsc::Receiver<Vec<u8>> {
    async fn next_message(&mut self) -> Result<Vec<u8>, HostError> {
        self.recv().await.ok_or(HostError::SubscriptionClosed)
    }
}
