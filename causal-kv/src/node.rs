//! TCP front end of a replica: the accept loop, connection classification
//! and the per-connection session tasks.

use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::Result;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, BufReader, Lines},
    net::{TcpListener, TcpStream},
    select,
    sync::mpsc,
    time::Instant,
};
use tracing::{debug, info, warn};

use crate::{
    config::NodeConfig,
    error::ReplicaError,
    link::{Link, LinkId},
    message::{ClientCommand, Greeting, PeerMessage, ServerLine, read_line, write_line},
    peers::{PeerAddr, connect_to},
    replica::ReplicationEngine,
    version::Version,
};

pub struct Node {
    listener: TcpListener,
    context: Arc<NodeContext>,
}

struct NodeContext {
    engine: ReplicationEngine,
    config: NodeConfig,
}

impl Node {
    pub fn new(listener: TcpListener, config: NodeConfig) -> std::io::Result<Self> {
        let local = listener.local_addr()?;
        let engine = ReplicationEngine::new(config.id, advertised_addr(&config, local))
            .with_transit_delay(config.transit_delay);
        Ok(Self::with_engine(listener, config, engine))
    }

    /// Uses a prepared engine, e.g. one driven by a manual clock.
    pub fn with_engine(listener: TcpListener, config: NodeConfig, engine: ReplicationEngine) -> Self {
        Self {
            listener,
            context: Arc::new(NodeContext { engine, config }),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn handle(&self) -> NodeHandle {
        NodeHandle {
            context: Arc::clone(&self.context),
        }
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Node { listener, context } = self;
        tokio::pin!(shutdown);

        let reconciler = context.config.reconcile_interval.map(|sweep| {
            let context = Arc::clone(&context);
            tokio::spawn(async move { context.engine.run_reconciler(sweep).await })
        });

        for &port in &context.config.peers {
            let addr = PeerAddr::new(context.engine.self_addr().host.clone(), port);
            spawn_dial(&context, addr);
        }

        loop {
            select! {
                _ = &mut shutdown => {
                    info!(node = context.engine.origin(), "node shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &context);
                }
            }
        }

        if let Some(task) = reconciler {
            task.abort();
        }
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

/// Cloneable access to a running node.
#[derive(Clone)]
pub struct NodeHandle {
    context: Arc<NodeContext>,
}

impl NodeHandle {
    pub fn engine(&self) -> &ReplicationEngine {
        &self.context.engine
    }

    /// Dials the peer listening on `port` of this node's advertised host.
    pub async fn connect_peer(&self, port: u16) -> Result<PeerAddr, ReplicaError> {
        let addr = PeerAddr::new(self.context.engine.self_addr().host.clone(), port);
        connect_peer(&self.context, addr).await
    }

    pub async fn connect_peers(&self, ports: &[u16]) -> Vec<Result<PeerAddr, ReplicaError>> {
        let mut results = Vec::with_capacity(ports.len());
        for &port in ports {
            results.push(self.connect_peer(port).await);
        }
        results
    }
}

fn advertised_addr(config: &NodeConfig, local: SocketAddr) -> PeerAddr {
    let host = match &config.advertise_host {
        Some(host) => host.clone(),
        None if local.ip().is_unspecified() => "127.0.0.1".to_string(),
        None => local.ip().to_string(),
    };
    PeerAddr::new(host, local.port())
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    context: &Arc<NodeContext>,
) {
    match result {
        Ok((stream, peer)) => spawn_connection_handler(stream, peer, context),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection_handler(stream: TcpStream, peer: SocketAddr, context: &Arc<NodeContext>) {
    let context = Arc::clone(context);
    tokio::spawn(async move {
        if let Err(err) = handle_connection(stream, peer, context).await {
            warn!(peer = %peer, error = ?err, "connection closed with error");
        }
    });
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    context: Arc<NodeContext>,
) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    let Some(first) = read_line(&mut lines).await? else {
        debug!(%peer, "connection closed before first line");
        return Ok(());
    };

    match Greeting::classify(&first) {
        Ok(Greeting::Peer { port }) => {
            let addr = PeerAddr::new(peer.ip().to_string(), port);
            let (link_id, outbox) = register_peer(&context, &addr).await;
            run_peer_session(&context, &addr, link_id, &mut lines, &mut writer, outbox).await
        }
        Ok(Greeting::Client) => {
            info!(%peer, "client connected");
            run_client_session(&context, &first, &mut lines, &mut writer).await
        }
        Err(reason) => {
            write_line(
                &mut writer,
                &ServerLine::Error {
                    message: reason.to_string(),
                }
                .to_string(),
            )
            .await?;
            Err(reason.into_malformed(&first).into())
        }
    }
}

async fn register_peer(
    context: &NodeContext,
    addr: &PeerAddr,
) -> (LinkId, mpsc::Receiver<String>) {
    let (link, outbox) = Link::channel(context.config.link_buffer);
    let link_id = link.id();
    if !context.engine.on_peer_hello(addr.clone(), link).await {
        debug!(peer = %addr, link = link_id, "peer already linked; session runs unregistered");
    }
    (link_id, outbox)
}

/// A `replicate` line as it came off a peer link.
struct InboundUpdate {
    key: String,
    value: String,
    version: Version,
    arrived: Instant,
}

/// Serves one peer link until either side closes it, then forgets the peer.
///
/// Replicated updates are handed to a separate task so the session keeps
/// reading and draining its outbox while they sit out the transit delay.
async fn run_peer_session<R, W>(
    context: &Arc<NodeContext>,
    addr: &PeerAddr,
    link_id: LinkId,
    lines: &mut Lines<R>,
    writer: &mut W,
    mut outbox: mpsc::Receiver<String>,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (updates, inbox) = mpsc::channel(context.config.link_buffer.max(1));
    tokio::spawn(apply_inbound_updates(Arc::clone(context), addr.clone(), inbox));

    let result = async {
        loop {
            select! {
                line = read_line(lines) => match line? {
                    Some(line) => handle_peer_line(context, addr, &updates, &line).await,
                    None => break,
                },
                Some(line) = outbox.recv() => write_line(writer, &line).await?,
            }
        }
        Ok::<(), anyhow::Error>(())
    }
    .await;

    context.engine.remove_peer(addr, link_id).await;
    result
}

/// Feeds one peer's updates to the engine in arrival order. Each update's
/// transit delay runs from its own arrival, so a burst lands after roughly
/// one delay. Drains what is queued after the link closes.
async fn apply_inbound_updates(
    context: Arc<NodeContext>,
    addr: PeerAddr,
    mut inbox: mpsc::Receiver<InboundUpdate>,
) {
    while let Some(update) = inbox.recv().await {
        context
            .engine
            .accept_remote_update_from(update.key, update.value, update.version, update.arrived)
            .await;
    }
    debug!(peer = %addr, "inbound update queue closed");
}

async fn handle_peer_line(
    context: &Arc<NodeContext>,
    addr: &PeerAddr,
    updates: &mpsc::Sender<InboundUpdate>,
    line: &str,
) {
    match PeerMessage::parse(line) {
        Ok(PeerMessage::Replicate {
            key,
            value,
            version,
        }) => {
            let update = InboundUpdate {
                key,
                value,
                version,
                arrived: Instant::now(),
            };
            if updates.send(update).await.is_err() {
                warn!(peer = %addr, "inbound update queue gone; dropping update");
            }
        }
        Ok(PeerMessage::Register { addr: announced }) => {
            if context.engine.on_register(&announced).await {
                debug!(from = %addr, peer = %announced, "dialing forwarded peer");
                spawn_dial(context, announced);
            }
        }
        Err(reason) => {
            let error = reason.into_malformed(line);
            warn!(peer = %addr, %error, "dropping malformed peer message");
        }
    }
}

/// Serves one client: replies to its commands and forwards `replicate`
/// notifications until it disconnects.
async fn run_client_session<R, W>(
    context: &Arc<NodeContext>,
    first: &str,
    lines: &mut Lines<R>,
    writer: &mut W,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (link, mut outbox) = Link::channel(context.config.link_buffer);
    let client_id = link.id();
    context.engine.attach_client(link).await;

    let result = async {
        handle_client_line(context, first, writer).await?;
        loop {
            select! {
                line = read_line(lines) => match line? {
                    Some(line) => handle_client_line(context, &line, writer).await?,
                    None => break,
                },
                Some(line) = outbox.recv() => write_line(writer, &line).await?,
            }
        }
        Ok::<(), anyhow::Error>(())
    }
    .await;

    context.engine.detach_client(client_id).await;
    info!(client = client_id, "client disconnected");
    result
}

async fn handle_client_line<W>(context: &Arc<NodeContext>, line: &str, writer: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let reply = match ClientCommand::parse(line) {
        Ok(ClientCommand::Write { key, value }) => {
            // The writer hears back through its own replicate notification.
            context.engine.accept_local_write(key, value).await;
            return Ok(());
        }
        Ok(ClientCommand::Read { key }) => context.engine.read_reply(&key).await,
        Ok(ClientCommand::Connect { ports }) => {
            for port in ports {
                let addr = PeerAddr::new(context.engine.self_addr().host.clone(), port);
                let reply = match connect_peer(context, addr).await {
                    Ok(addr) => ServerLine::Connected { addr },
                    Err(error) => {
                        warn!(%error, "connect command failed");
                        ServerLine::Error {
                            message: error.to_string(),
                        }
                    }
                };
                write_line(writer, &reply.to_string()).await?;
            }
            return Ok(());
        }
        Ok(ClientCommand::Status) => ServerLine::Status(context.engine.status().await),
        Err(reason) => {
            let message = reason.to_string();
            let error = reason.into_malformed(line);
            debug!(%error, "rejecting client command");
            ServerLine::Error { message }
        }
    };

    write_line(writer, &reply.to_string()).await?;
    Ok(())
}

fn spawn_dial(context: &Arc<NodeContext>, addr: PeerAddr) {
    let context = Arc::clone(context);
    tokio::spawn(async move {
        if let Err(error) = connect_peer(&context, addr).await {
            warn!(%error, "peer dial failed");
        }
    });
}

/// Dials `addr`, announces this node and starts the peer session.
///
/// Dialing this node itself or an already registered peer is a no-op.
async fn connect_peer(context: &Arc<NodeContext>, addr: PeerAddr) -> Result<PeerAddr, ReplicaError> {
    let engine = &context.engine;
    if !engine.on_register(&addr).await {
        debug!(peer = %addr, "peer already reachable; skipping dial");
        return Ok(addr);
    }

    let stream = connect_to(&addr, context.config.dial).await?;
    let (reader, mut writer) = stream.into_split();
    let hello = ServerLine::Hello {
        port: engine.self_addr().port,
    };
    write_line(&mut writer, &hello.to_string()).await?;

    let (link_id, outbox) = register_peer(context, &addr).await;
    info!(peer = %addr, "connected to peer");

    let session_context = Arc::clone(context);
    let session_addr = addr.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        if let Err(err) = run_peer_session(
            &session_context,
            &session_addr,
            link_id,
            &mut lines,
            &mut writer,
            outbox,
        )
        .await
        {
            warn!(peer = %session_addr, error = ?err, "peer link closed with error");
        }
    });

    Ok(addr)
}
