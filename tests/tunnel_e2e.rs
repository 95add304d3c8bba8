//! Client and server over real sockets, driven through SOCKS5.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use pipetun::client::{Client, Pool};
use pipetun::config::Config;
use pipetun::server::{Server, ServerMetrics};

const WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .with_test_writer()
        .try_init();
}

struct TcpEchoServer {
    addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl TcpEchoServer {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        Self { addr, handle }
    }
}

impl Drop for TcpEchoServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

struct Pair {
    socks_addr: SocketAddr,
    pool: Arc<Pool>,
    metrics: Arc<ServerMetrics>,
    tasks: Vec<JoinHandle<()>>,
}

impl Pair {
    async fn start(connections: usize, client_password: &str) -> Self {
        let server_config = Config {
            server_port: 0,
            ..Config::default()
        };
        let server = Server::bind(Arc::new(server_config)).await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let metrics = server.metrics();

        let client_config = Config {
            client_port: 0,
            client_connection: connections,
            server_port: server_addr.port(),
            password: client_password.to_string(),
            ..Config::default()
        };
        let client = Client::bind(Arc::new(client_config)).await.unwrap();
        let socks_addr = client.local_addr().unwrap();
        let pool = client.pool();

        let tasks = vec![
            tokio::spawn(async move {
                let _ = server.run().await;
            }),
            tokio::spawn(async move {
                let _ = client.run().await;
            }),
        ];

        Self {
            socks_addr,
            pool,
            metrics,
            tasks,
        }
    }

    async fn wait_for_pool(&self, live: usize) {
        let deadline = tokio::time::Instant::now() + WAIT;
        while self.pool.live() < live {
            if tokio::time::Instant::now() >= deadline {
                panic!("tunnel pool never reached {live} connections");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}

impl Drop for Pair {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Negotiate SOCKS5 CONNECT to `target` and return the reply code.
async fn socks5_connect(socks: SocketAddr, target: SocketAddr) -> (TcpStream, u8) {
    let mut stream = TcpStream::connect(socks).await.unwrap();
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await.unwrap();
    assert_eq!(choice, [0x05, 0x00]);

    let SocketAddr::V4(v4) = target else {
        panic!("echo server must be IPv4");
    };
    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    request.extend_from_slice(&v4.ip().octets());
    request.extend_from_slice(&v4.port().to_be_bytes());
    stream.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[0], 0x05);
    (stream, reply[1])
}

async fn echo_round_trip(stream: &mut TcpStream, payload: &[u8]) {
    stream.write_all(payload).await.unwrap();
    let mut echoed = vec![0u8; payload.len()];
    tokio::time::timeout(WAIT, stream.read_exact(&mut echoed))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(echoed, payload);
}

#[tokio::test]
async fn test_relays_bytes_to_echo_destination() {
    init_tracing();
    let echo = TcpEchoServer::start().await;
    let pair = Pair::start(1, "default-password").await;
    pair.wait_for_pool(1).await;

    let (mut stream, reply) = socks5_connect(pair.socks_addr, echo.addr).await;
    assert_eq!(reply, 0x00);

    echo_round_trip(&mut stream, b"hello through the tunnel").await;

    // Larger than one socket read on either side.
    let big: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    echo_round_trip(&mut stream, &big).await;

    assert_eq!(pair.metrics.snapshot().streams_opened, 1);
}

#[tokio::test]
async fn test_two_destinations_do_not_cross() {
    init_tracing();
    let first = TcpEchoServer::start().await;
    let second = TcpEchoServer::start().await;
    let pair = Pair::start(1, "default-password").await;
    pair.wait_for_pool(1).await;

    let (mut a, reply_a) = socks5_connect(pair.socks_addr, first.addr).await;
    let (mut b, reply_b) = socks5_connect(pair.socks_addr, second.addr).await;
    assert_eq!((reply_a, reply_b), (0x00, 0x00));

    echo_round_trip(&mut a, b"alpha").await;
    echo_round_trip(&mut b, b"bravo").await;

    // Closing one leaves the other usable.
    drop(a);
    echo_round_trip(&mut b, b"still here").await;
}

#[tokio::test]
async fn test_half_close_propagates_to_destination() {
    init_tracing();
    let echo = TcpEchoServer::start().await;
    let pair = Pair::start(1, "default-password").await;
    pair.wait_for_pool(1).await;

    let (mut stream, reply) = socks5_connect(pair.socks_addr, echo.addr).await;
    assert_eq!(reply, 0x00);

    stream.write_all(b"last words").await.unwrap();
    stream.shutdown().await.unwrap();

    // The echo server sees EOF, closes, and the close travels back.
    let mut rest = Vec::new();
    tokio::time::timeout(WAIT, stream.read_to_end(&mut rest))
        .await
        .expect("close never arrived")
        .unwrap();
    assert_eq!(rest, b"last words");
}

#[tokio::test]
async fn test_same_destination_needs_another_connection() {
    init_tracing();
    let echo = TcpEchoServer::start().await;
    let pair = Pair::start(1, "default-password").await;
    pair.wait_for_pool(1).await;

    let (mut held, reply) = socks5_connect(pair.socks_addr, echo.addr).await;
    assert_eq!(reply, 0x00);

    // One physical connection can carry a destination key only once.
    let (_refused, reply) = socks5_connect(pair.socks_addr, echo.addr).await;
    assert_eq!(reply, 0x01);

    echo_round_trip(&mut held, b"unaffected").await;
}

#[tokio::test]
async fn test_pool_spreads_same_destination() {
    init_tracing();
    let echo = TcpEchoServer::start().await;
    let pair = Pair::start(2, "default-password").await;
    pair.wait_for_pool(2).await;

    let (mut a, reply_a) = socks5_connect(pair.socks_addr, echo.addr).await;
    let (mut b, reply_b) = socks5_connect(pair.socks_addr, echo.addr).await;
    assert_eq!((reply_a, reply_b), (0x00, 0x00));

    echo_round_trip(&mut a, b"one").await;
    echo_round_trip(&mut b, b"two").await;
}

#[tokio::test]
async fn test_wrong_password_is_a_protocol_failure() {
    init_tracing();
    let pair = Pair::start(1, "not-the-password").await;

    let deadline = tokio::time::Instant::now() + WAIT;
    while pair.metrics.snapshot().protocol_failures == 0 {
        if tokio::time::Instant::now() >= deadline {
            panic!("server never rejected the handshake");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(pair.metrics.snapshot().streams_opened, 0);
}
