use std::io;

use thiserror::Error;

use crate::peers::PeerAddr;

/// Failures the replication core reports to its callers.
///
/// None of these are fatal to the node; each is contained to the
/// connection that observed it.
#[derive(Debug, Error)]
pub enum ReplicaError {
    #[error("Failed to connect to {addr}")]
    ConnectFailure {
        addr: PeerAddr,
        #[source]
        source: io::Error,
    },

    #[error("Key {key} not found")]
    KeyNotFound { key: String },

    #[error("malformed message {line:?}: {reason}")]
    MalformedMessage {
        line: String,
        #[source]
        reason: ProtocolError,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Why a protocol line could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("empty line")]
    Empty,

    #[error("unknown command {0:?}")]
    UnknownCommand(String),

    #[error("{command} expects {expected}")]
    WrongArity {
        command: &'static str,
        expected: &'static str,
    },

    #[error("invalid version {0:?}")]
    BadVersion(String),

    #[error("invalid port {0:?}")]
    BadPort(String),
}

impl ProtocolError {
    pub(crate) fn into_malformed(self, line: &str) -> ReplicaError {
        ReplicaError::MalformedMessage {
            line: line.to_string(),
            reason: self,
        }
    }
}
