//! Version stamps and the clock that produces them.
//!
//! A [`Version`] is a `(timestamp, origin)` pair ordered lexicographically:
//! timestamps compare first and the origin id breaks ties. Every version a
//! node stores is stamped from that node's own [`Clock`], either at write
//! time ([`VersionClock::next_local_version`]) or at receipt time for
//! replicated updates ([`VersionClock::receipt_version`]).

use std::{
    fmt,
    str::FromStr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// Identifier of the node that originated a write.
pub type OriginId = u64;

/// Ordered `(timestamp, origin)` stamp attached to every stored value.
///
/// Field order matters: the derived `Ord` compares `timestamp` first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version {
    pub timestamp: u64,
    pub origin: OriginId,
}

impl Version {
    pub const fn new(timestamp: u64, origin: OriginId) -> Self {
        Self { timestamp, origin }
    }
}

impl fmt::Display for Version {
    // Rendered without spaces so the version stays a single protocol token.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.timestamp, self.origin)
    }
}

impl FromStr for Version {
    type Err = ProtocolError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let inner = text
            .trim()
            .strip_prefix('(')
            .and_then(|rest| rest.strip_suffix(')'))
            .ok_or_else(|| ProtocolError::BadVersion(text.to_string()))?;

        let (timestamp, origin) = inner
            .split_once(',')
            .ok_or_else(|| ProtocolError::BadVersion(text.to_string()))?;

        let timestamp = timestamp
            .trim()
            .parse()
            .map_err(|_| ProtocolError::BadVersion(text.to_string()))?;
        let origin = origin
            .trim()
            .parse()
            .map_err(|_| ProtocolError::BadVersion(text.to_string()))?;

        Ok(Self { timestamp, origin })
    }
}

/// Source of wall-clock seconds.
pub trait Clock: Send + Sync {
    fn now_secs(&self) -> u64;
}

/// Reads seconds since the UNIX epoch.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> u64 {
        // A clock set before 1970 reads as zero rather than failing the write.
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0)
    }
}

/// Clock that only moves when told to. Used by tests and simulations.
#[derive(Debug, Default)]
pub struct ManualClock {
    secs: AtomicU64,
}

impl ManualClock {
    pub fn new(secs: u64) -> Self {
        Self {
            secs: AtomicU64::new(secs),
        }
    }

    pub fn set(&self, secs: u64) {
        self.secs.store(secs, Ordering::SeqCst);
    }

    pub fn advance(&self, secs: u64) {
        self.secs.fetch_add(secs, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_secs(&self) -> u64 {
        self.secs.load(Ordering::SeqCst)
    }
}

/// Stamps versions for one node.
#[derive(Clone)]
pub struct VersionClock {
    clock: Arc<dyn Clock>,
}

impl VersionClock {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    pub fn system() -> Self {
        Self::new(Arc::new(SystemClock))
    }

    /// Version for a write accepted on this node.
    ///
    /// Two writes within the same second get equal versions; versions only
    /// order writes per key, not globally.
    pub fn next_local_version(&self, origin: OriginId) -> Version {
        Version::new(self.clock.now_secs(), origin)
    }

    /// Re-stamps a replicated update with this node's receipt time, keeping
    /// the sender's origin id.
    pub fn receipt_version(&self, origin: OriginId) -> Version {
        Version::new(self.clock.now_secs(), origin)
    }
}

impl fmt::Debug for VersionClock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VersionClock")
            .field("now_secs", &self.clock.now_secs())
            .finish()
    }
}
