//! Core types for the meshchat node

use chrono::Utc;
use libp2p::{multiaddr::Protocol, Multiaddr, PeerId};
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Chat Messages
// ============================================================================

/// One chat line, as gossiped on the room topic and pushed to web clients.
///
/// Wire form is `{"from": string, "text": string, "ts": integer}`. The
/// sender is self-reported by whichever node published the line and is not
/// checked against the transport identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Display name of the publishing node
    #[serde(rename = "from")]
    pub sender: String,
    /// Message body
    pub text: String,
    /// Unix timestamp in seconds
    #[serde(rename = "ts")]
    pub timestamp: i64,
}

impl ChatMessage {
    /// Create a message stamped with the current time
    pub fn new(sender: impl Into<String>, text: impl Into<String>) -> Self {
        Self::with_timestamp(sender, text, Utc::now().timestamp())
    }

    pub fn with_timestamp(sender: impl Into<String>, text: impl Into<String>, timestamp: i64) -> Self {
        Self {
            sender: sender.into(),
            text: text.into(),
            timestamp,
        }
    }

    /// Encode to the JSON wire form
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Decode a topic payload
    pub fn from_slice(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }
}

// ============================================================================
// Peer Addresses
// ============================================================================

/// Canonical `<multiaddr>/p2p/<peer-id>` string for a known peer.
///
/// The string form is the identity: two addresses are the same record
/// exactly when their strings are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerAddress(String);

impl PeerAddress {
    /// Combine a transport address with the identity reached through it.
    ///
    /// A trailing `/p2p/..` component already present on `addr` is replaced,
    /// so the result carries the identity exactly once.
    pub fn new(addr: &Multiaddr, peer_id: &PeerId) -> Self {
        let mut addr = addr.clone();
        if matches!(addr.iter().last(), Some(Protocol::P2p(_))) {
            addr.pop();
        }
        Self(addr.with(Protocol::P2p(*peer_id)).to_string())
    }

    /// Parse and normalise an address string
    pub fn parse(s: &str) -> Result<Self, libp2p::multiaddr::Error> {
        let addr: Multiaddr = s.trim().parse()?;
        Ok(Self(addr.to_string()))
    }

    /// Build a record from one line of the peers file.
    ///
    /// Lines that parse are normalised; anything else is kept verbatim and
    /// will simply fail when dialled.
    pub fn from_line(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        Some(Self::parse(line).unwrap_or_else(|_| Self(line.to_string())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_multiaddr(&self) -> Result<Multiaddr, libp2p::multiaddr::Error> {
        self.0.parse()
    }

    /// Identity embedded in the address, if any
    pub fn peer_id(&self) -> Option<PeerId> {
        self.to_multiaddr().ok().and_then(|addr| peer_id_of(&addr))
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Last `/p2p/` component of an address.
///
/// For relayed addresses (`../p2p/<relay>/p2p-circuit/p2p/<target>`) this is
/// the target, not the relay.
pub fn peer_id_of(addr: &Multiaddr) -> Option<PeerId> {
    addr.iter()
        .filter_map(|p| match p {
            Protocol::P2p(peer_id) => Some(peer_id),
            _ => None,
        })
        .last()
}

// ============================================================================
// Discovery Candidates
// ============================================================================

/// Where a connection candidate came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DiscoverySource {
    /// Configured relay list
    StaticRelay,
    /// Explicitly configured bootstrap list
    StaticBootstrap,
    /// Peers file from previous runs
    PersistedBootstrap,
    /// mDNS announcement on the local segment
    LocalNetwork,
    /// Provider lookup under the room rendezvous key
    DhtRendezvous,
}

impl DiscoverySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StaticRelay => "static-relay",
            Self::StaticBootstrap => "static-bootstrap",
            Self::PersistedBootstrap => "persisted-bootstrap",
            Self::LocalNetwork => "local-network",
            Self::DhtRendezvous => "dht-rendezvous",
        }
    }
}

impl fmt::Display for DiscoverySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A peer worth dialling, with whatever we know about how to reach it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCandidate {
    pub peer_id: Option<PeerId>,
    pub addrs: Vec<Multiaddr>,
    pub source: DiscoverySource,
}

impl PeerCandidate {
    /// Candidate from a single address; the identity is taken from its `/p2p/` suffix
    pub fn from_addr(addr: Multiaddr, source: DiscoverySource) -> Self {
        Self {
            peer_id: peer_id_of(&addr),
            addrs: vec![addr],
            source,
        }
    }

    /// Candidate known by identity, optionally with addresses
    pub fn from_peer(peer_id: PeerId, addrs: Vec<Multiaddr>, source: DiscoverySource) -> Self {
        Self {
            peer_id: Some(peer_id),
            addrs,
            source,
        }
    }

    pub fn is_self(&self, local_peer_id: &PeerId) -> bool {
        self.peer_id.as_ref() == Some(local_peer_id)
    }
}

impl fmt::Display for PeerCandidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.addrs.first(), self.peer_id) {
            (Some(addr), _) => write!(f, "{} ({})", addr, self.source),
            (None, Some(peer_id)) => write!(f, "{} ({})", peer_id, self.source),
            (None, None) => write!(f, "<empty> ({})", self.source),
        }
    }
}
