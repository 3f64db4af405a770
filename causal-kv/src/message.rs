//! Line protocol spoken between nodes and their clients.
//!
//! Every message is one line of space-separated tokens. The first line on a
//! connection decides what the connection is: `server <port>` marks a peer
//! announcing its listen port, anything else is a client's first command.

use std::{fmt, io};

use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt, Lines};

use crate::{error::ProtocolError, peers::PeerAddr, replica::NodeStatus, version::Version};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// How an inbound connection identified itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Greeting {
    Peer { port: u16 },
    Client,
}

impl Greeting {
    pub fn classify(line: &str) -> Result<Self, ProtocolError> {
        let mut tokens = line.split_whitespace();
        if tokens.next() != Some("server") {
            return Ok(Greeting::Client);
        }
        match (tokens.next(), tokens.next()) {
            (Some(port), None) => Ok(Greeting::Peer {
                port: parse_port(port)?,
            }),
            _ => Err(ProtocolError::WrongArity {
                command: "server",
                expected: "<listen-port>",
            }),
        }
    }
}

/// Commands a client may send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientCommand {
    Write { key: String, value: String },
    Read { key: String },
    Connect { ports: Vec<u16> },
    Status,
}

impl ClientCommand {
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(command) = tokens.first() else {
            return Err(ProtocolError::Empty);
        };

        match (command.to_lowercase().as_str(), &tokens[1..]) {
            ("write", [key, value]) => Ok(ClientCommand::Write {
                key: key.to_string(),
                value: value.to_string(),
            }),
            ("write", _) => Err(ProtocolError::WrongArity {
                command: "write",
                expected: "<key> <value>",
            }),
            ("read", [key]) => Ok(ClientCommand::Read {
                key: key.to_string(),
            }),
            ("read", _) => Err(ProtocolError::WrongArity {
                command: "read",
                expected: "<key>",
            }),
            ("connect", rest) => {
                let ports = rest
                    .iter()
                    .flat_map(|token| token.split(','))
                    .filter(|port| !port.is_empty())
                    .map(parse_port)
                    .collect::<Result<Vec<_>, _>>()?;
                if ports.is_empty() {
                    return Err(ProtocolError::WrongArity {
                        command: "connect",
                        expected: "<port1,port2,...>",
                    });
                }
                Ok(ClientCommand::Connect { ports })
            }
            ("status", []) => Ok(ClientCommand::Status),
            ("status", _) => Err(ProtocolError::WrongArity {
                command: "status",
                expected: "no arguments",
            }),
            _ => Err(ProtocolError::UnknownCommand(command.to_string())),
        }
    }
}

/// Messages a peer may send after its greeting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    Replicate {
        key: String,
        value: String,
        version: Version,
    },
    Register {
        addr: PeerAddr,
    },
}

impl PeerMessage {
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(command) = tokens.first() else {
            return Err(ProtocolError::Empty);
        };

        match *command {
            "replicate" => {
                if tokens.len() < 4 {
                    return Err(ProtocolError::WrongArity {
                        command: "replicate",
                        expected: "<key> <value> <(ts,origin)>",
                    });
                }
                // A version written as "(ts, origin)" spans two tokens.
                let version = tokens[3..].concat().parse()?;
                Ok(PeerMessage::Replicate {
                    key: tokens[1].to_string(),
                    value: tokens[2].to_string(),
                    version,
                })
            }
            "register" => match &tokens[1..] {
                [host, port] => Ok(PeerMessage::Register {
                    addr: PeerAddr::new(*host, parse_port(port)?),
                }),
                _ => Err(ProtocolError::WrongArity {
                    command: "register",
                    expected: "<host> <port>",
                }),
            },
            other => Err(ProtocolError::UnknownCommand(other.to_string())),
        }
    }
}

/// Every line a node writes, to clients and to peers.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerLine {
    Hello {
        port: u16,
    },
    Replicate {
        key: String,
        value: String,
        version: Version,
    },
    Value {
        key: String,
        value: String,
        version: Version,
    },
    KeyNotFound {
        key: String,
    },
    Register {
        addr: PeerAddr,
    },
    Connected {
        addr: PeerAddr,
    },
    Status(NodeStatus),
    Error {
        message: String,
    },
}

impl fmt::Display for ServerLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerLine::Hello { port } => write!(f, "server {port}"),
            ServerLine::Replicate {
                key,
                value,
                version,
            } => write!(f, "replicate {key} {value} {version}"),
            ServerLine::Value {
                key,
                value,
                version,
            } => write!(f, "value {key} {value} {version}"),
            ServerLine::KeyNotFound { key } => write!(f, "error Key {key} not found"),
            ServerLine::Register { addr } => write!(f, "register {} {}", addr.host, addr.port),
            ServerLine::Connected { addr } => write!(f, "connected {addr}"),
            ServerLine::Status(status) => {
                let json = serde_json::to_string(status).map_err(|_| fmt::Error)?;
                write!(f, "status {json}")
            }
            ServerLine::Error { message } => write!(f, "error {message}"),
        }
    }
}

fn parse_port(text: &str) -> Result<u16, ProtocolError> {
    text.trim()
        .parse()
        .map_err(|_| ProtocolError::BadPort(text.to_string()))
}

/// Reads the next non-blank line, or `None` once the stream ends.
///
/// Built on [`Lines::next_line`], so it is safe to race in `select!`.
pub async fn read_line<R>(lines: &mut Lines<R>) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    while let Some(line) = lines.next_line().await? {
        let trimmed = line.trim_end_matches(LINE_ENDINGS);
        if trimmed.trim().is_empty() {
            continue;
        }
        return Ok(Some(trimmed.to_string()));
    }
    Ok(None)
}

pub async fn write_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}
