//! The replication engine: local writes, replicated updates and the causal
//! gate that decides whether an update applies now or waits.
//!
//! # Gate
//!
//! Replicated updates are re-stamped with this node's receipt time (keeping
//! the sender's origin id) and compared against the latest version applied
//! anywhere on this node. An update at or after that version applies;
//! anything older is parked in the [`PendingQueue`]. The update must also be
//! at or after the version already stored for its key, so re-delivery never
//! rolls a key back.
//!
//! # Reconciliation
//!
//! Parked updates are retried by [`ReplicationEngine::run_reconciler`]
//! whenever the latest version advances and on a periodic sweep. Each retry
//! re-stamps the update; an update whose key was written after it was parked
//! is discarded as superseded.
//!
//! # Locking
//!
//! Store, queue and latest version share one mutex; the peer registry and
//! client fan-out each have their own. The state lock is always taken first.
//! Sends to links never wait, so fan-out happens inside the critical section
//! and carries exactly the version that was stored.

use std::time::Duration;

use serde::Serialize;
use tokio::{
    select,
    sync::{Mutex, Notify},
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, info};

use crate::{
    error::ReplicaError,
    fanout::ClientFanout,
    link::{Link, LinkId},
    message::ServerLine,
    peers::{PeerAddr, PeerRegistry},
    pending::{PendingQueue, PendingUpdate},
    store::{Entry, Store},
    version::{OriginId, Version, VersionClock},
};

/// What the gate did with a replicated update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateOutcome {
    Applied(Version),
    Delayed(Version),
}

/// Counts from one pass over the pending queue.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    pub applied: usize,
    pub superseded: usize,
    pub still_pending: usize,
}

/// Point-in-time summary of a node, rendered as JSON for `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStatus {
    pub node_id: OriginId,
    pub addr: String,
    pub keys: usize,
    pub pending: usize,
    pub latest: Option<Version>,
    pub peers: Vec<String>,
    pub clients: usize,
}

#[derive(Debug, Default)]
struct ReplicaState {
    store: Store,
    pending: PendingQueue,
    latest: Option<Version>,
}

impl ReplicaState {
    fn admits(&self, key: &str, effective: Version) -> bool {
        let after_latest = self.latest.map_or(true, |latest| effective >= latest);
        let after_key = self
            .store
            .last_version(key)
            .map_or(true, |current| effective >= current);
        after_latest && after_key
    }

    fn advance_latest(&mut self, version: Version) {
        self.latest = Some(self.latest.map_or(version, |latest| latest.max(version)));
    }
}

pub struct ReplicationEngine {
    origin: OriginId,
    self_addr: PeerAddr,
    clock: VersionClock,
    transit_delay: Duration,
    state: Mutex<ReplicaState>,
    peers: Mutex<PeerRegistry>,
    clients: Mutex<ClientFanout>,
    advanced: Notify,
}

impl ReplicationEngine {
    /// Engine for node `origin`, reachable by peers at `self_addr`. Uses the
    /// system clock and no simulated transit delay.
    pub fn new(origin: OriginId, self_addr: PeerAddr) -> Self {
        Self {
            origin,
            self_addr,
            clock: VersionClock::system(),
            transit_delay: Duration::ZERO,
            state: Mutex::new(ReplicaState::default()),
            peers: Mutex::new(PeerRegistry::new()),
            clients: Mutex::new(ClientFanout::new()),
            advanced: Notify::new(),
        }
    }

    pub fn with_clock(mut self, clock: VersionClock) -> Self {
        self.clock = clock;
        self
    }

    /// Delay applied to every replicated update before it is stamped.
    pub fn with_transit_delay(mut self, delay: Duration) -> Self {
        self.transit_delay = delay;
        self
    }

    pub fn origin(&self) -> OriginId {
        self.origin
    }

    pub fn self_addr(&self) -> &PeerAddr {
        &self.self_addr
    }

    /// Stamps, stores and propagates a write from a local client.
    pub async fn accept_local_write(&self, key: String, value: String) -> Version {
        let mut state = self.state.lock().await;
        let version = self.clock.next_local_version(self.origin);
        state.store.put(key.clone(), value.clone(), version);
        state.advance_latest(version);

        let line = ServerLine::Replicate {
            key: key.clone(),
            value: value.clone(),
            version,
        }
        .to_string();
        let peers = self.peers.lock().await.broadcast(&line);
        self.clients.lock().await.notify_all(&key, &value, version);
        drop(state);

        info!(%key, %version, peers, "applied local write");
        self.advanced.notify_one();
        version
    }

    pub async fn handle_read(&self, key: &str) -> Result<Entry, ReplicaError> {
        self.state.lock().await.store.get(key).cloned()
    }

    /// Reply line for a client `read`.
    pub async fn read_reply(&self, key: &str) -> ServerLine {
        match self.handle_read(key).await {
            Ok(Entry { value, version }) => ServerLine::Value {
                key: key.to_string(),
                value,
                version,
            },
            Err(_) => ServerLine::KeyNotFound {
                key: key.to_string(),
            },
        }
    }

    /// Handles a `replicate` line from a peer that arrived just now.
    ///
    /// Waits out the simulated transit delay without holding any lock, then
    /// re-stamps the update with the local receipt time and runs the gate.
    pub async fn accept_remote_update(
        &self,
        key: String,
        value: String,
        remote: Version,
    ) -> GateOutcome {
        self.accept_remote_update_from(key, value, remote, Instant::now())
            .await
    }

    /// Like [`accept_remote_update`](Self::accept_remote_update) for an
    /// update that arrived at `arrived`. The transit delay runs from that
    /// instant, so updates queued behind one another wait concurrently.
    pub async fn accept_remote_update_from(
        &self,
        key: String,
        value: String,
        remote: Version,
        arrived: Instant,
    ) -> GateOutcome {
        if !self.transit_delay.is_zero() {
            time::sleep_until(arrived + self.transit_delay).await;
        }
        let effective = self.clock.receipt_version(remote.origin);
        debug!(%key, %remote, %effective, "received replicated update");
        self.gate(key, value, effective).await
    }

    /// Applies an update stamped `effective` if the gate admits it, otherwise
    /// parks it.
    pub async fn gate(&self, key: String, value: String, effective: Version) -> GateOutcome {
        let mut state = self.state.lock().await;
        if !state.admits(&key, effective) {
            info!(%key, %effective, latest = ?state.latest, "delaying update");
            state.pending.push(PendingUpdate {
                key,
                value,
                version: effective,
            });
            return GateOutcome::Delayed(effective);
        }

        self.apply(&mut state, key, value, effective).await;
        drop(state);
        self.advanced.notify_one();
        GateOutcome::Applied(effective)
    }

    async fn apply(&self, state: &mut ReplicaState, key: String, value: String, version: Version) {
        self.clients.lock().await.notify_all(&key, &value, version);
        info!(%key, %version, "applied replicated update");
        state.store.put(key, value, version);
        state.advance_latest(version);
    }

    /// Retries every parked update once, oldest first.
    pub async fn reconcile_pending(&self) -> ReconcileReport {
        let mut state = self.state.lock().await;
        let mut report = ReconcileReport::default();

        for update in state.pending.take_all() {
            let superseded = state
                .store
                .last_version(&update.key)
                .is_some_and(|current| current > update.version);
            if superseded {
                debug!(key = %update.key, version = %update.version, "discarding superseded update");
                report.superseded += 1;
                continue;
            }

            let effective = self.clock.receipt_version(update.version.origin);
            if state.admits(&update.key, effective) {
                self.apply(&mut state, update.key, update.value, effective)
                    .await;
                report.applied += 1;
            } else {
                state.pending.push(PendingUpdate {
                    version: effective,
                    ..update
                });
                report.still_pending += 1;
            }
        }

        report
    }

    /// Drains the pending queue whenever the latest version advances and
    /// every `sweep`. Runs until the task is dropped.
    pub async fn run_reconciler(&self, sweep: Duration) {
        let mut ticker = time::interval(sweep);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                _ = self.advanced.notified() => {}
                _ = ticker.tick() => {}
            }

            if self.pending_len().await == 0 {
                continue;
            }

            let report = self.reconcile_pending().await;
            if report.applied > 0 || report.superseded > 0 {
                info!(
                    applied = report.applied,
                    superseded = report.superseded,
                    pending = report.still_pending,
                    "reconciled pending updates"
                );
            }
        }
    }

    /// Registers a peer that greeted us or that we dialed.
    ///
    /// A newly added peer is announced to the other peers and told about
    /// every peer already known. Returns `false` if it was already known.
    pub async fn on_peer_hello(&self, addr: PeerAddr, link: Link) -> bool {
        let mut peers = self.peers.lock().await;
        let known = peers.addrs();
        if !peers.register(addr.clone(), link.clone()) {
            debug!(peer = %addr, "peer already registered");
            return false;
        }

        let announce = ServerLine::Register { addr: addr.clone() }.to_string();
        peers.broadcast_except(&announce, &addr);
        for other in known.into_iter().filter(|other| other != &addr) {
            link.send(ServerLine::Register { addr: other }.to_string());
        }

        info!(peer = %addr, peers = peers.len(), "registered peer");
        true
    }

    /// Whether a forwarded `register` names a peer this node should dial.
    pub async fn on_register(&self, addr: &PeerAddr) -> bool {
        addr != &self.self_addr && !self.peers.lock().await.contains(addr)
    }

    pub async fn remove_peer(&self, addr: &PeerAddr, link_id: LinkId) -> bool {
        let removed = self.peers.lock().await.remove(addr, link_id);
        if removed {
            info!(peer = %addr, "peer disconnected");
        }
        removed
    }

    pub async fn attach_client(&self, link: Link) {
        self.clients.lock().await.attach(link);
    }

    pub async fn detach_client(&self, id: LinkId) -> bool {
        self.clients.lock().await.detach(id)
    }

    pub async fn latest_version(&self) -> Option<Version> {
        self.state.lock().await.latest
    }

    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn pending(&self) -> Vec<PendingUpdate> {
        self.state.lock().await.pending.iter().cloned().collect()
    }

    pub async fn peer_addrs(&self) -> Vec<PeerAddr> {
        self.peers.lock().await.addrs()
    }

    pub async fn status(&self) -> NodeStatus {
        let state = self.state.lock().await;
        let peers = self
            .peers
            .lock()
            .await
            .addrs()
            .iter()
            .map(ToString::to_string)
            .collect();
        let clients = self.clients.lock().await.len();

        NodeStatus {
            node_id: self.origin,
            addr: self.self_addr.to_string(),
            keys: state.store.len(),
            pending: state.pending.len(),
            latest: state.latest,
            peers,
            clients,
        }
    }
}
