//! Outbound handles for connected peers and clients.
//!
//! Every session owns the receiving half of a bounded channel and writes
//! whatever arrives to its socket. The sending half is a [`Link`], which the
//! engine keeps in the peer registry or the client fan-out. Sends never wait:
//! delivery is at-most-once with no acknowledgement.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;

pub type LinkId = u64;

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
pub struct Link {
    id: LinkId,
    tx: mpsc::Sender<String>,
}

/// Result of handing one line to a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Sent,
    /// The link's buffer was full and the line was dropped.
    Dropped,
    /// The session behind the link has ended.
    Closed,
}

impl Link {
    /// Creates a link and the receiver its session drains.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let id = NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed);
        (Self { id, tx }, rx)
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn send(&self, line: impl Into<String>) -> Delivery {
        match self.tx.try_send(line.into()) {
            Ok(()) => Delivery::Sent,
            Err(TrySendError::Full(line)) => {
                warn!(link = self.id, %line, "link buffer full; dropping line");
                Delivery::Dropped
            }
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }
}
