//! P2P networking layer using libp2p
//!
//! Features:
//! - GossipSub carrying the room topic
//! - Kademlia DHT for rendezvous-based discovery
//! - mDNS for local discovery
//! - TCP and QUIC transports, circuit relay, hole punching and UPnP for NAT traversal

mod behaviour;
mod host;
mod identity;
mod node;
mod relay;

pub use behaviour::*;
pub use host::*;
pub use identity::*;
pub use node::*;
pub use relay::*;
