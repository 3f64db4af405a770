use std::time::Duration;

use crate::{cli::ServeArgs, peers::RetryPolicy, version::OriginId};

/// Runtime settings for one node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub id: OriginId,
    /// Host announced to peers; derived from the listener when `None`.
    pub advertise_host: Option<String>,
    /// Peer ports dialed on startup.
    pub peers: Vec<u16>,
    pub transit_delay: Duration,
    /// Sweep interval for parked updates. `None` leaves them parked.
    pub reconcile_interval: Option<Duration>,
    pub dial: RetryPolicy,
    pub link_buffer: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: 1,
            advertise_host: None,
            peers: Vec::new(),
            transit_delay: Duration::ZERO,
            reconcile_interval: Some(Duration::from_secs(1)),
            dial: RetryPolicy::default(),
            link_buffer: 256,
        }
    }
}

impl NodeConfig {
    pub fn with_id(id: OriginId) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }
}

impl From<&ServeArgs> for NodeConfig {
    fn from(args: &ServeArgs) -> Self {
        Self {
            id: args.id,
            advertise_host: args.advertise_host.clone(),
            peers: args.peer.clone(),
            transit_delay: Duration::from_millis(args.transit_delay_ms),
            reconcile_interval: (!args.no_reconcile)
                .then(|| Duration::from_millis(args.reconcile_interval_ms.max(1))),
            dial: RetryPolicy {
                attempts: args.dial_attempts.max(1),
                ..RetryPolicy::default()
            },
            link_buffer: args.link_buffer,
        }
    }
}
