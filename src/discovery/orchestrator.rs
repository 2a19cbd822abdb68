//! Connection-establishment policy.
//!
//! Runs once per process, in order:
//! 1. relay connection and reservation (first success wins)
//! 2. bootstrap connection (explicit list, or the persisted peers)
//! 3. fallback to persisted peers when an explicit list failed entirely
//! 4. periodic DHT rendezvous (advertise + lookup)
//!
//! Local-network discoveries are handled as they arrive, independent of the
//! stages. Every candidate from every source goes through [`attempt`], and
//! the peers file is only written from the connection-established hook.
//!
//! [`attempt`]: ConnectivityOrchestrator::attempt

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use libp2p::{Multiaddr, PeerId};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::store::PeerRecordStore;
use crate::config::NodeConfig;
use crate::network::{HostError, NetworkEvent, NetworkHost};
use crate::types::{peer_id_of, DiscoverySource, PeerCandidate};

/// Buffered DHT discoveries waiting to be dialled
const FOUND_CHANNEL_CAPACITY: usize = 64;

// ============================================================================
// Outcomes
// ============================================================================

/// Why a candidate was not dialled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The candidate is this node
    OwnAddress,
    /// The address does not parse or carries nothing to dial
    InvalidAddress,
    /// Already tried in this pass
    AlreadyAttempted,
}

/// Result of one connection attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectOutcome {
    Connected(PeerId),
    Skipped(SkipReason),
    Failed(String),
}

impl ConnectOutcome {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected(_))
    }
}

impl fmt::Display for ConnectOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connected(peer) => write!(f, "connected to {}", peer),
            Self::Skipped(reason) => write!(f, "skipped ({:?})", reason),
            Self::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Result of the relay stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// No relay addresses configured
    NotConfigured,
    /// Connected and holding a reservation at this relay
    Reserved(Multiaddr),
    /// Connected; reservations are disabled
    Connected(Multiaddr),
    /// Every configured relay failed
    Exhausted,
}

/// Result of the bootstrap and fallback stages
#[derive(Debug, Clone, Default)]
pub struct BootstrapReport {
    /// The primary list came from configuration rather than the peers file
    pub explicit: bool,
    pub attempts: Vec<(String, ConnectOutcome)>,
    /// Present only when the fallback ran
    pub fallback: Option<Vec<(String, ConnectOutcome)>>,
}

impl BootstrapReport {
    /// Connections made across both passes
    pub fn connected(&self) -> usize {
        self.attempts
            .iter()
            .chain(self.fallback.iter().flatten())
            .filter(|(_, outcome)| outcome.is_connected())
            .count()
    }
}

/// Result of one DHT rendezvous round
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryRound {
    /// Nothing in the routing table yet; nothing was sent
    SkippedEmptyRoutingTable,
    /// Advertise and lookup ran; `found` excludes this node
    Completed { advertised: bool, found: Vec<PeerId> },
    /// The host could not be queried
    Failed(String),
}

/// Whether stage 3 runs.
///
/// Only when an explicit bootstrap list was given and none of it connected;
/// when the peers file was already the primary source, retrying it is
/// pointless.
pub fn should_fallback(explicit: bool, any_connected: bool) -> bool {
    explicit && !any_connected
}

// ============================================================================
// Settings
// ============================================================================

/// Orchestrator inputs, taken from the node configuration
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Tried in order until one reservation succeeds
    pub relay_addrs: Vec<String>,
    pub bootstrap_peers: Vec<String>,
    /// Ask relays for a reservation (relay client mode)
    pub reserve_relay: bool,
    pub rendezvous_key: String,
    pub discovery_interval: Duration,
    pub dial_timeout: Duration,
    pub local_dial_timeout: Duration,
    pub reservation_timeout: Duration,
}

impl OrchestratorSettings {
    pub fn from_config(config: &NodeConfig) -> Self {
        Self {
            relay_addrs: config.relay_addrs.clone(),
            bootstrap_peers: config.bootstrap_peers.clone(),
            reserve_relay: config.enable_relay_client,
            rendezvous_key: config.rendezvous_key(),
            discovery_interval: config.discovery_interval(),
            dial_timeout: config.dial_timeout(),
            local_dial_timeout: config.local_dial_timeout(),
            reservation_timeout: config.reservation_timeout(),
        }
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Drives every discovery source into connections on `host`
pub struct ConnectivityOrchestrator<H: NetworkHost> {
    host: Arc<H>,
    store: Arc<PeerRecordStore>,
    settings: OrchestratorSettings,
}

impl<H: NetworkHost> ConnectivityOrchestrator<H> {
    pub fn new(host: Arc<H>, store: Arc<PeerRecordStore>, settings: OrchestratorSettings) -> Self {
        Self {
            host,
            store,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<PeerRecordStore> {
        &self.store
    }

    /// Dial one candidate with a deadline, never dialling ourselves
    pub async fn attempt(&self, candidate: PeerCandidate, timeout: Duration) -> ConnectOutcome {
        if candidate.is_self(&self.host.local_peer_id()) {
            debug!("Skipping own address {}", candidate);
            return ConnectOutcome::Skipped(SkipReason::OwnAddress);
        }
        if candidate.peer_id.is_none() && candidate.addrs.is_empty() {
            return ConnectOutcome::Skipped(SkipReason::InvalidAddress);
        }

        match tokio::time::timeout(timeout, self.host.connect(&candidate)).await {
            Ok(Ok(peer_id)) => {
                debug!("Connected to {} ({})", peer_id, candidate.source);
                ConnectOutcome::Connected(peer_id)
            }
            Ok(Err(e)) => {
                debug!("Connect to {} failed: {}", candidate, e);
                ConnectOutcome::Failed(e.to_string())
            }
            Err(_) => {
                debug!("Connect to {} timed out", candidate);
                ConnectOutcome::Failed(HostError::Timeout(timeout).to_string())
            }
        }
    }

    /// Stage 1: connect to the first reachable relay and reserve a slot
    pub async fn connect_relays(&self) -> RelayOutcome {
        if self.settings.relay_addrs.is_empty() {
            return RelayOutcome::NotConfigured;
        }
        let local = self.host.local_peer_id();

        for raw in &self.settings.relay_addrs {
            let addr: Multiaddr = match raw.trim().parse() {
                Ok(addr) => addr,
                Err(e) => {
                    warn!("Invalid relay address '{}': {}", raw, e);
                    continue;
                }
            };
            let Some(relay_peer) = peer_id_of(&addr) else {
                warn!("Relay address {} has no /p2p/ identity", addr);
                continue;
            };
            if relay_peer == local {
                debug!("Relay address {} is this node, skipping", addr);
                continue;
            }

            if let Err(e) = self.host.add_address(relay_peer, addr.clone()).await {
                warn!("Could not register relay {}: {}", addr, e);
                continue;
            }

            let candidate = PeerCandidate::from_addr(addr.clone(), DiscoverySource::StaticRelay);
            let outcome = self.attempt(candidate, self.settings.dial_timeout).await;
            if !outcome.is_connected() {
                warn!("Relay {} unreachable: {}", addr, outcome);
                continue;
            }

            if !self.settings.reserve_relay {
                info!("Connected to relay {} (reservations disabled)", addr);
                return RelayOutcome::Connected(addr);
            }

            match tokio::time::timeout(
                self.settings.reservation_timeout,
                self.host.reserve_relay(addr.clone()),
            )
            .await
            {
                Ok(Ok(())) => {
                    info!("Relay reservation held at {}", addr);
                    return RelayOutcome::Reserved(addr);
                }
                Ok(Err(e)) => warn!("Relay {} refused reservation: {}", addr, e),
                Err(_) => warn!(
                    "Relay {} reservation timed out after {:?}",
                    addr, self.settings.reservation_timeout
                ),
            }
            // A late acceptance must not leave a second reservation behind
            if let Err(e) = self.host.cancel_reservation(addr.clone()).await {
                debug!("Could not cancel reservation at {}: {}", addr, e);
            }
        }

        warn!(
            "All {} relay addresses failed, continuing without a relay",
            self.settings.relay_addrs.len()
        );
        RelayOutcome::Exhausted
    }

    /// Stages 2 and 3: bootstrap, then fall back to the peers file if an
    /// explicit list produced nothing
    pub async fn connect_bootstrap(&self) -> BootstrapReport {
        let explicit = !self.settings.bootstrap_peers.is_empty();
        let persisted: Vec<String> = self
            .store
            .list()
            .into_iter()
            .map(|record| record.to_string())
            .collect();

        let mut seen = HashSet::new();
        let attempts = if explicit {
            self.attempt_all(&self.settings.bootstrap_peers, DiscoverySource::StaticBootstrap, &mut seen)
                .await
        } else {
            self.attempt_all(&persisted, DiscoverySource::PersistedBootstrap, &mut seen)
                .await
        };

        let any_connected = attempts.iter().any(|(_, outcome)| outcome.is_connected());
        let fallback = if should_fallback(explicit, any_connected) {
            warn!(
                "No bootstrap peer reachable, falling back to {} persisted peers",
                persisted.len()
            );
            Some(
                self.attempt_all(&persisted, DiscoverySource::PersistedBootstrap, &mut seen)
                    .await,
            )
        } else {
            None
        };

        let report = BootstrapReport {
            explicit,
            attempts,
            fallback,
        };
        info!(
            "Bootstrap finished: {} connected ({} source)",
            report.connected(),
            if explicit { "explicit" } else { "persisted" }
        );
        report
    }

    /// Dial every address concurrently. `seen` spans the bootstrap and
    /// fallback passes.
    async fn attempt_all(
        &self,
        addrs: &[String],
        source: DiscoverySource,
        seen: &mut HashSet<String>,
    ) -> Vec<(String, ConnectOutcome)> {
        let mut skipped = Vec::new();
        let mut pending = Vec::new();

        for raw in addrs {
            let raw = raw.trim().to_string();
            if !seen.insert(raw.clone()) {
                skipped.push((raw, ConnectOutcome::Skipped(SkipReason::AlreadyAttempted)));
                continue;
            }
            match raw.parse::<Multiaddr>() {
                Ok(addr) => pending.push((raw, PeerCandidate::from_addr(addr, source))),
                Err(e) => {
                    warn!("Invalid {} address '{}': {}", source, raw, e);
                    skipped.push((raw, ConnectOutcome::Skipped(SkipReason::InvalidAddress)));
                }
            }
        }

        let timeout = self.settings.dial_timeout;
        let dialled = join_all(pending.into_iter().map(|(raw, candidate)| async move {
            let outcome = self.attempt(candidate, timeout).await;
            if let ConnectOutcome::Failed(reason) = &outcome {
                warn!("Bootstrap peer {} unreachable: {}", raw, reason);
            }
            (raw, outcome)
        }))
        .await;

        skipped.extend(dialled);
        skipped
    }

    /// Stage 4, one round: advertise and look up the rendezvous key
    pub async fn discover_once(&self) -> DiscoveryRound {
        let size = match self.host.routing_table_size().await {
            Ok(size) => size,
            Err(e) => return DiscoveryRound::Failed(e.to_string()),
        };
        if size == 0 {
            debug!("Routing table empty, skipping rendezvous round");
            return DiscoveryRound::SkippedEmptyRoutingTable;
        }

        let key = &self.settings.rendezvous_key;
        let advertised = match self.host.advertise(key).await {
            Ok(()) => true,
            Err(e) => {
                debug!("Advertising under {} failed: {}", key, e);
                false
            }
        };

        let local = self.host.local_peer_id();
        let found = match self.host.find_peers(key).await {
            Ok(peers) => peers.into_iter().filter(|peer| *peer != local).collect(),
            Err(e) => {
                debug!("Rendezvous lookup under {} failed: {}", key, e);
                Vec::new()
            }
        };

        DiscoveryRound::Completed { advertised, found }
    }

    /// Connection-established hook; the only writer of the peers file.
    ///
    /// Accepted connections are ignored: their remote address is an
    /// ephemeral port that cannot be dialled back. The file append runs on
    /// the blocking pool, so this must be called inside a tokio runtime.
    pub fn record_connection(&self, peer_id: PeerId, address: Multiaddr, outbound: bool) {
        if !outbound {
            return;
        }
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || match store.add(&address, &peer_id) {
            Ok(true) => info!("Saved peer {} at {}", peer_id, address),
            Ok(false) => {}
            Err(e) => warn!("Failed to persist peer {}: {}", peer_id, e),
        });
    }

    /// Stages 1 to 4 in order; the rendezvous loop never returns
    async fn staged(self: Arc<Self>, found_tx: mpsc::Sender<PeerCandidate>) {
        self.connect_relays().await;
        self.connect_bootstrap().await;

        let interval = self.settings.discovery_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.discover_once().await {
                DiscoveryRound::Completed { found, .. } => {
                    for peer_id in found {
                        let candidate =
                            PeerCandidate::from_peer(peer_id, Vec::new(), DiscoverySource::DhtRendezvous);
                        if found_tx.send(candidate).await.is_err() {
                            return;
                        }
                    }
                }
                DiscoveryRound::Failed(reason) => debug!("Rendezvous round failed: {}", reason),
                DiscoveryRound::SkippedEmptyRoutingTable => {}
            }
        }
    }

    fn spawn_attempt(
        self: &Arc<Self>,
        attempts: &mut JoinSet<ConnectOutcome>,
        candidate: PeerCandidate,
        timeout: Duration,
    ) {
        let this = self.clone();
        attempts.spawn(async move { this.attempt(candidate, timeout).await });
    }

    /// Run all stages plus the reactive handlers until shutdown.
    ///
    /// Local-network and DHT candidates are dialled in background attempts;
    /// attempts still pending at shutdown are aborted.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::Receiver<NetworkEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let (found_tx, mut found_rx) = mpsc::channel(FOUND_CHANNEL_CAPACITY);
        let staged = self.clone().staged(found_tx);
        tokio::pin!(staged);
        let mut staged_done = false;

        let mut attempts: JoinSet<ConnectOutcome> = JoinSet::new();

        loop {
            tokio::select! {
                _ = &mut staged, if !staged_done => {
                    staged_done = true;
                }
                Some(candidate) = found_rx.recv() => {
                    self.spawn_attempt(&mut attempts, candidate, self.settings.dial_timeout);
                }
                event = events.recv() => match event {
                    Some(NetworkEvent::PeerDiscovered(candidate)) => {
                        debug!("Local peer discovered: {}", candidate);
                        self.spawn_attempt(&mut attempts, candidate, self.settings.local_dial_timeout);
                    }
                    Some(NetworkEvent::ConnectionEstablished { peer_id, address, outbound }) => {
                        self.record_connection(peer_id, address, outbound);
                    }
                    Some(NetworkEvent::ConnectionClosed(_)) => {}
                    None => {
                        debug!("Network event stream closed, orchestrator stopping");
                        break;
                    }
                },
                Some(joined) = attempts.join_next(), if !attempts.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            warn!("Connection attempt panicked: {}", e);
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("Connectivity orchestrator shutting down");
                    break;
                }
            }
        }

        attempts.shutdown().await;
    }
}
