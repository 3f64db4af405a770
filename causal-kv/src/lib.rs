//! Multi-node key-value store that replicates writes across a mesh of peers
//! and applies remote updates through a causal gate.
//!
//! Each module focuses on one responsibility:
//!
//! - [`version`] defines `(timestamp, origin)` versions and the clock that
//!   stamps them.
//! - [`store`] keeps the key → entry map and per-key last-applied versions.
//! - [`pending`] parks replicated updates that failed the gate.
//! - [`link`], [`peers`] and [`fanout`] hold the outbound handles for peers
//!   and clients, plus supervised peer dialing.
//! - [`replica`] is the replication engine: local writes, the remote gate
//!   and reconciliation of parked updates.
//! - [`message`] is the line protocol plus async read/write helpers.
//! - [`node`] accepts TCP connections, classifies them as peer or client and
//!   runs one session task per connection.
//! - [`cli`], [`config`] and [`client`] cover the binary: argument parsing,
//!   node settings and the interactive client.

pub mod cli;
pub mod client;
pub mod config;
pub mod error;
pub mod fanout;
pub mod link;
pub mod message;
pub mod node;
pub mod peers;
pub mod pending;
pub mod replica;
pub mod store;
pub mod version;

pub use error::{ProtocolError, ReplicaError};
pub use node::{Node, NodeHandle};
pub use replica::{GateOutcome, ReplicationEngine};
pub use version::{Version, VersionClock};
