//! Peer membership and outbound dialing.

use std::{collections::HashMap, fmt, time::Duration};

use tokio::{net::TcpStream, time::sleep};
use tracing::{debug, warn};

use crate::{
    error::ReplicaError,
    link::{Delivery, Link, LinkId},
};

/// Identity of a peer: the host it was reached on and the port it listens on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerAddr {
    pub host: String,
    pub port: u16,
}

impl PeerAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for PeerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Known peers and the links used to reach them. At most one link per
/// `(host, port)`.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<PeerAddr, Link>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `addr` unless it is already registered. Returns `true` when the
    /// peer is new.
    ///
    /// A registered link whose session has already ended is replaced.
    pub fn register(&mut self, addr: PeerAddr, link: Link) -> bool {
        match self.peers.get(&addr) {
            Some(existing) if !existing.is_closed() => false,
            _ => {
                self.peers.insert(addr, link);
                true
            }
        }
    }

    pub fn contains(&self, addr: &PeerAddr) -> bool {
        self.peers.contains_key(addr)
    }

    /// Removes `addr` if it is still registered through `link_id`.
    pub fn remove(&mut self, addr: &PeerAddr, link_id: LinkId) -> bool {
        match self.peers.get(addr) {
            Some(link) if link.id() == link_id => {
                self.peers.remove(addr);
                true
            }
            _ => false,
        }
    }

    /// Sends `line` to every peer. Returns how many links accepted it.
    pub fn broadcast(&mut self, line: &str) -> usize {
        self.broadcast_filtered(line, |_| true)
    }

    /// Sends `line` to every peer other than `skip`.
    pub fn broadcast_except(&mut self, line: &str, skip: &PeerAddr) -> usize {
        self.broadcast_filtered(line, |addr| addr != skip)
    }

    fn broadcast_filtered<F>(&mut self, line: &str, include: F) -> usize
    where
        F: Fn(&PeerAddr) -> bool,
    {
        let mut sent = 0;
        let mut closed = Vec::new();

        for (addr, link) in &self.peers {
            if !include(addr) {
                continue;
            }
            match link.send(line) {
                Delivery::Sent => sent += 1,
                Delivery::Dropped => warn!(peer = %addr, "dropped message for slow peer"),
                Delivery::Closed => closed.push(addr.clone()),
            }
        }

        for addr in closed {
            debug!(peer = %addr, "removing peer with closed link");
            self.peers.remove(&addr);
        }

        sent
    }

    /// Sorted addresses of every registered peer.
    pub fn addrs(&self) -> Vec<PeerAddr> {
        let mut addrs: Vec<_> = self.peers.keys().cloned().collect();
        addrs.sort();
        addrs
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// How persistently to dial a peer before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// A single attempt with no waiting.
    pub fn once() -> Self {
        Self {
            attempts: 1,
            ..Self::default()
        }
    }
}

/// Dials `addr`, retrying with exponential backoff.
pub async fn connect_to(addr: &PeerAddr, policy: RetryPolicy) -> Result<TcpStream, ReplicaError> {
    let attempts = policy.attempts.max(1);
    let mut backoff = policy.initial_backoff;
    let mut attempt = 1;

    loop {
        match TcpStream::connect((addr.host.as_str(), addr.port)).await {
            Ok(stream) => return Ok(stream),
            Err(source) if attempt >= attempts => {
                return Err(ReplicaError::ConnectFailure {
                    addr: addr.clone(),
                    source,
                });
            }
            Err(error) => {
                debug!(peer = %addr, attempt, ?error, "dial failed; retrying");
                sleep(backoff).await;
                backoff = (backoff * 2).min(policy.max_backoff);
                attempt += 1;
            }
        }
    }
}
