use std::{net::SocketAddr, time::Duration};

use anyhow::{Result, anyhow};
use causal_kv::{
    Node, NodeHandle,
    config::NodeConfig,
    message::{read_line, write_line},
    peers::{PeerAddr, RetryPolicy},
};
use tokio::{
    io::{AsyncBufReadExt, BufReader, Lines},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::oneshot,
    task::JoinHandle,
    time::{Instant, sleep, timeout},
};

const READ_TIMEOUT: Duration = Duration::from_secs(2);

struct RunningNode {
    addr: SocketAddr,
    handle: NodeHandle,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl RunningNode {
    async fn start(id: u64) -> Result<Self> {
        Self::start_with_delay(id, Duration::ZERO).await
    }

    async fn start_with_delay(id: u64, transit_delay: Duration) -> Result<Self> {
        let config = NodeConfig {
            transit_delay,
            reconcile_interval: Some(Duration::from_millis(50)),
            dial: RetryPolicy::once(),
            ..NodeConfig::with_id(id)
        };
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let node = Node::new(listener, config)?;
        let addr = node.local_addr()?;
        let handle = node.handle();

        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.await;
            };
            let _ = node.run_until(shutdown).await;
        });

        Ok(Self {
            addr,
            handle,
            shutdown,
            task,
        })
    }

    async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.task.await;
    }
}

struct TestClient {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            lines: BufReader::new(reader).lines(),
            writer,
        })
    }

    /// Connects and waits for a `status` reply, which guarantees the client
    /// is attached for notifications.
    async fn attach(addr: SocketAddr) -> Result<Self> {
        let mut client = Self::connect(addr).await?;
        client.send("status").await?;
        let status = client.expect_line().await?;
        assert!(status.starts_with("status {"), "unexpected reply: {status}");
        Ok(client)
    }

    async fn send(&mut self, line: &str) -> Result<()> {
        write_line(&mut self.writer, line).await?;
        Ok(())
    }

    async fn expect_line(&mut self) -> Result<String> {
        timeout(READ_TIMEOUT, read_line(&mut self.lines))
            .await??
            .ok_or_else(|| anyhow!("connection closed"))
    }
}

async fn wait_until<F, Fut>(description: &str, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + READ_TIMEOUT;
    while Instant::now() < deadline {
        if check().await {
            return Ok(());
        }
        sleep(Duration::from_millis(20)).await;
    }
    Err(anyhow!("timed out waiting for {description}"))
}

#[tokio::test]
async fn write_on_one_node_reaches_clients_of_another() -> Result<()> {
    let node_a = RunningNode::start(1).await?;
    let node_b = RunningNode::start(2).await?;

    let connected = node_a.handle.connect_peer(node_b.addr.port()).await?;
    assert_eq!(connected, PeerAddr::new("127.0.0.1", node_b.addr.port()));

    let mut watcher = TestClient::attach(node_b.addr).await?;
    let mut writer = TestClient::connect(node_a.addr).await?;
    writer.send("write y found").await?;

    let echo = writer.expect_line().await?;
    assert!(echo.starts_with("replicate y found ("), "unexpected echo: {echo}");
    assert!(echo.ends_with(",1)"), "version should carry origin 1: {echo}");

    let replicated = watcher.expect_line().await?;
    assert!(
        replicated.starts_with("replicate y found (") && replicated.ends_with(",1)"),
        "unexpected notification: {replicated}"
    );

    watcher.send("read y").await?;
    let value = watcher.expect_line().await?;
    assert!(value.starts_with("value y found ("), "unexpected read reply: {value}");

    node_a.stop().await;
    node_b.stop().await;
    Ok(())
}

#[tokio::test]
async fn client_commands_reply_on_the_same_connection() -> Result<()> {
    let node = RunningNode::start(1).await?;
    let mut client = TestClient::connect(node.addr).await?;

    client.send("write x lost").await?;
    let echo = client.expect_line().await?;
    assert!(echo.starts_with("replicate x lost ("));

    client.send("read x").await?;
    let value = client.expect_line().await?;
    assert!(value.starts_with("value x lost ("));

    client.send("read z").await?;
    assert_eq!(client.expect_line().await?, "error Key z not found");

    client.send("write onlykey").await?;
    let error = client.expect_line().await?;
    assert!(error.starts_with("error "), "unexpected reply: {error}");

    // The session survives the malformed command.
    client.send("read x").await?;
    assert!(client.expect_line().await?.starts_with("value x lost ("));

    node.stop().await;
    Ok(())
}

#[tokio::test]
async fn connect_command_reports_each_port() -> Result<()> {
    let node_a = RunningNode::start(1).await?;
    let node_b = RunningNode::start(2).await?;

    let closed = TcpListener::bind("127.0.0.1:0").await?;
    let dead_port = closed.local_addr()?.port();
    drop(closed);

    let mut client = TestClient::connect(node_a.addr).await?;
    client
        .send(&format!("connect {},{}", node_b.addr.port(), dead_port))
        .await?;

    assert_eq!(
        client.expect_line().await?,
        format!("connected 127.0.0.1:{}", node_b.addr.port())
    );
    assert_eq!(
        client.expect_line().await?,
        format!("error Failed to connect to 127.0.0.1:{dead_port}")
    );

    let b_port = node_b.addr.port();
    let engine_b = node_b.handle.clone();
    wait_until("node b to register node a", || {
        let engine_b = engine_b.clone();
        async move { engine_b.engine().peer_addrs().await.len() == 1 }
    })
    .await?;
    assert_eq!(
        node_a.handle.engine().peer_addrs().await,
        vec![PeerAddr::new("127.0.0.1", b_port)]
    );

    node_a.stop().await;
    node_b.stop().await;
    Ok(())
}

#[tokio::test]
async fn membership_spreads_through_register_forwarding() -> Result<()> {
    let node_a = RunningNode::start(1).await?;
    let node_b = RunningNode::start(2).await?;
    let node_c = RunningNode::start(3).await?;

    node_a.handle.connect_peer(node_b.addr.port()).await?;
    wait_until("node b to register node a", || {
        let handle = node_b.handle.clone();
        async move { handle.engine().peer_addrs().await.len() == 1 }
    })
    .await?;

    let results = node_c.handle.connect_peers(&[node_b.addr.port()]).await;
    assert_eq!(results.len(), 1);
    assert!(results[0].is_ok(), "dial failed: {:?}", results[0]);

    for running in [&node_a, &node_b, &node_c] {
        let handle = running.handle.clone();
        wait_until("full mesh", || {
            let handle = handle.clone();
            async move { handle.engine().peer_addrs().await.len() == 2 }
        })
        .await?;
    }

    node_a.stop().await;
    node_b.stop().await;
    node_c.stop().await;
    Ok(())
}

#[tokio::test]
async fn peer_link_survives_bad_lines_and_is_dropped_on_close() -> Result<()> {
    let node = RunningNode::start(1).await?;
    let mut watcher = TestClient::attach(node.addr).await?;

    let mut fake_peer = TestClient::connect(node.addr).await?;
    fake_peer.send("server 9999").await?;
    wait_until("fake peer registration", || {
        let handle = node.handle.clone();
        async move { handle.engine().peer_addrs().await.len() == 1 }
    })
    .await?;

    fake_peer.send("replicate k").await?;
    fake_peer.send("replicate k v (1,5)").await?;

    let replicated = watcher.expect_line().await?;
    assert!(
        replicated.starts_with("replicate k v (") && replicated.ends_with(",5)"),
        "unexpected notification: {replicated}"
    );

    drop(fake_peer);
    wait_until("fake peer removal", || {
        let handle = node.handle.clone();
        async move { handle.engine().peer_addrs().await.is_empty() }
    })
    .await?;

    node.stop().await;
    Ok(())
}

#[tokio::test]
async fn burst_from_one_peer_lands_after_a_single_transit_delay() -> Result<()> {
    const DELAY: Duration = Duration::from_millis(500);
    const BURST: usize = 4;

    let node_a = RunningNode::start(1).await?;
    let node_b = RunningNode::start_with_delay(2, DELAY).await?;
    node_a.handle.connect_peer(node_b.addr.port()).await?;

    let mut watcher = TestClient::attach(node_b.addr).await?;
    let mut reader = TestClient::connect(node_b.addr).await?;
    let mut writer = TestClient::connect(node_a.addr).await?;

    let started = Instant::now();
    for i in 0..BURST {
        writer.send(&format!("write k{i} v{i}")).await?;
    }

    // Node B keeps serving other connections while the burst is in transit.
    reader.send("read k0").await?;
    assert_eq!(reader.expect_line().await?, "error Key k0 not found");
    assert!(
        started.elapsed() < DELAY,
        "read answered only after {:?}",
        started.elapsed()
    );

    for i in 0..BURST {
        let replicated = watcher.expect_line().await?;
        assert!(
            replicated.starts_with(&format!("replicate k{i} v{i} (")),
            "unexpected notification: {replicated}"
        );
    }
    let elapsed = started.elapsed();
    assert!(elapsed >= DELAY, "burst skipped the transit delay: {elapsed:?}");
    assert!(
        elapsed < DELAY * 2,
        "burst waited one delay per update: {elapsed:?}"
    );

    node_a.stop().await;
    node_b.stop().await;
    Ok(())
}

#[tokio::test]
async fn duplicate_peer_link_is_served_without_displacing_the_first() -> Result<()> {
    let node = RunningNode::start(1).await?;
    let mut watcher = TestClient::attach(node.addr).await?;

    let mut first = TestClient::connect(node.addr).await?;
    first.send("server 9999").await?;
    wait_until("first link registration", || {
        let handle = node.handle.clone();
        async move { handle.engine().peer_addrs().await.len() == 1 }
    })
    .await?;

    let mut second = TestClient::connect(node.addr).await?;
    second.send("server 9999").await?;
    second.send("replicate d v (1,5)").await?;
    let replicated = watcher.expect_line().await?;
    assert!(replicated.starts_with("replicate d v ("), "unexpected notification: {replicated}");

    // Closing the unregistered link leaves the registered one in place.
    drop(second);
    sleep(Duration::from_millis(100)).await;
    assert_eq!(
        node.handle.engine().peer_addrs().await,
        vec![PeerAddr::new("127.0.0.1", 9999)]
    );

    first.send("replicate e v (1,5)").await?;
    assert!(watcher.expect_line().await?.starts_with("replicate e v ("));

    node.stop().await;
    Ok(())
}
