//! meshchat: peer-to-peer chat rooms bridged to local web clients
//!
//! - P2P networking via libp2p (GossipSub room topic, Kademlia rendezvous, mDNS)
//! - NAT traversal through circuit relays, hole punching and UPnP
//! - Connectivity orchestration over relay, bootstrap, persisted and discovered peers
//! - WebSocket gateway with per-client bounded queues and non-blocking fan-out

pub mod config;
pub mod daemon;
pub mod discovery;
pub mod gateway;
pub mod network;
pub mod types;
pub mod util;

pub use config::Config;
pub use types::*;
