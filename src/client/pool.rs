//! The client's physical connections to the server.
//!
//! Each slot is kept filled by its own task, which dials, runs the
//! connection to completion and dials again with exponential back-off.
//! Logical connections lease their key on a physical connection, so two
//! requests for the same destination never share one.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::crypto::{random_delay_ms, Credentials};
use crate::error::{Error, Result};
use crate::layer::{ClientHandshake, FramingStage, SocketStage, StreamKey, TunnelStage};
use crate::pipeline::{ConnectionState, EnvBlock, Stage};
use crate::session::{log_finished, Connection, ConnectionHandle};

/// First reconnect delay.
pub const MIN_BACKOFF: Duration = Duration::from_secs(1);
/// Reconnect delays stop doubling here.
pub const MAX_BACKOFF: Duration = Duration::from_secs(30);
/// How long dialing the server may take.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

type Leases = Arc<Mutex<HashSet<StreamKey>>>;

#[derive(Clone)]
struct TunnelLink {
    handle: ConnectionHandle,
    leases: Leases,
}

/// A key held open on one physical connection. Dropping it frees the key.
pub struct Lease {
    key: StreamKey,
    leases: Leases,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.leases.lock().remove(&self.key);
    }
}

/// Fixed-size set of physical connections.
pub struct Pool {
    slots: Vec<Mutex<Option<TunnelLink>>>,
    next: AtomicUsize,
}

impl Pool {
    /// Create a pool with `size` empty slots.
    pub fn new(size: usize) -> Arc<Self> {
        Arc::new(Self {
            slots: (0..size).map(|_| Mutex::new(None)).collect(),
            next: AtomicUsize::new(0),
        })
    }

    /// Start one maintenance task per slot.
    pub fn start(
        self: &Arc<Self>,
        config: Arc<Config>,
        credentials: Arc<Credentials>,
    ) -> Vec<JoinHandle<()>> {
        (0..self.slots.len())
            .map(|index| {
                tokio::spawn(maintain(
                    Arc::clone(self),
                    index,
                    Arc::clone(&config),
                    Arc::clone(&credentials),
                ))
            })
            .collect()
    }

    /// Pick a live physical connection that does not carry `key` yet.
    ///
    /// Slots are tried round-robin.
    pub fn lease(&self, key: StreamKey) -> Option<(ConnectionHandle, Lease)> {
        let size = self.slots.len();
        let start = self.next.fetch_add(1, Ordering::Relaxed);
        for offset in 0..size {
            let Some(link) = self.slots[(start + offset) % size].lock().clone() else {
                continue;
            };
            if link.handle.is_closed() || !link.leases.lock().insert(key) {
                continue;
            }
            let lease = Lease {
                key,
                leases: link.leases,
            };
            return Some((link.handle, lease));
        }
        None
    }

    /// Number of slots holding a running connection.
    pub fn live(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| slot.lock().as_ref().is_some_and(|link| !link.handle.is_closed()))
            .count()
    }

    fn install(&self, index: usize, handle: ConnectionHandle) {
        *self.slots[index].lock() = Some(TunnelLink {
            handle,
            leases: Leases::default(),
        });
    }

    fn vacate(&self, index: usize) {
        self.slots[index].lock().take();
    }
}

async fn maintain(pool: Arc<Pool>, index: usize, config: Arc<Config>, credentials: Arc<Credentials>) {
    let mut backoff = MIN_BACKOFF;
    loop {
        match dial(&config, &credentials).await {
            Ok((connection, handle)) => {
                tracing::info!(slot = index, server = %config.server_addr(), "tunnel connected");
                pool.install(index, handle);
                let env = connection.run().await;
                pool.vacate(index);
                log_finished("client", &env);
                if env.state != ConnectionState::Error {
                    backoff = MIN_BACKOFF;
                }
            }
            Err(e) => {
                tracing::warn!(slot = index, server = %config.server_addr(), error = %e, "tunnel connect failed");
            }
        }

        let delay = backoff + Duration::from_millis(random_delay_ms(0, 250));
        tracing::debug!(slot = index, delay_ms = delay.as_millis() as u64, "reconnecting");
        tokio::time::sleep(delay).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

async fn dial(config: &Arc<Config>, credentials: &Arc<Credentials>) -> Result<(Connection, ConnectionHandle)> {
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(config.server_addr()))
        .await
        .map_err(|_| Error::tunnel("connect timed out"))??;
    stream.set_nodelay(true)?;
    let peer = stream.peer_addr()?;

    let stages: Vec<Box<dyn Stage>> = vec![
        Box::new(SocketStage::new(stream, None)),
        Box::new(FramingStage::new(config.max_frame_len)),
        Box::new(ClientHandshake::new(Arc::clone(credentials))),
        Box::new(TunnelStage::initiator()),
    ];
    Connection::new(EnvBlock::new(Arc::clone(config)).with_dst(peer), stages)
}
