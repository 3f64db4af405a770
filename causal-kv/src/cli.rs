use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a replica node, accepting peers and clients over TCP.
    Serve(ServeArgs),
    /// Connect to a node and send commands typed on stdin.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address the node should bind to. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:8001")]
    pub listen: SocketAddr,

    /// Numeric id stamped into every version this node originates.
    #[arg(long)]
    pub id: u64,

    /// Host peers should use to reach this node. Defaults to the listen IP,
    /// or 127.0.0.1 when listening on an unspecified address.
    #[arg(long)]
    pub advertise_host: Option<String>,

    /// Ports of peers to dial on startup, e.g. 8002,8003.
    #[arg(long, value_delimiter = ',')]
    pub peer: Vec<u16>,

    /// Simulated network delay applied to every replicated update, in milliseconds.
    #[arg(long, default_value_t = 2000)]
    pub transit_delay_ms: u64,

    /// How often parked updates are retried, in milliseconds.
    #[arg(long, default_value_t = 1000)]
    pub reconcile_interval_ms: u64,

    /// Leave delayed updates parked instead of retrying them.
    #[arg(long)]
    pub no_reconcile: bool,

    /// Dial attempts per peer before reporting a connect failure.
    #[arg(long, default_value_t = 5)]
    pub dial_attempts: u32,

    /// Lines buffered per peer or client link before new lines are dropped.
    #[arg(long, default_value_t = 256)]
    pub link_buffer: usize,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the node to connect to.
    #[arg(long, default_value = "127.0.0.1:8001")]
    pub server: SocketAddr,
}
