//! Tunnel client.
//!
//! Accepts SOCKS5 connections locally and opens a logical connection for
//! each on one of the pooled physical connections:
//!
//! ```text
//! Low ─ Socket ─ Framing ─ ClientHandshake→(Cipher) ─ Tunnel(initiator) ─ High
//!                                                        │
//!                         Low ─ Index ─ local ─ High   one per SOCKS5 client
//! ```

mod local;
mod pool;

pub use local::LocalStage;
pub use pool::{Lease, Pool, CONNECT_TIMEOUT, MAX_BACKOFF, MIN_BACKOFF};

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::crypto::Credentials;
use crate::error::{Error, Result};
use crate::layer::{listen, StreamKey};
use crate::pipeline::EnvBlock;
use crate::proxy::socks5;

/// Main client instance.
pub struct Client {
    config: Arc<Config>,
    listener: TcpListener,
    pool: Arc<Pool>,
    maintainers: Vec<JoinHandle<()>>,
}

impl Client {
    /// Bind the SOCKS5 listener and start filling the connection pool.
    pub async fn bind(config: Arc<Config>) -> Result<Self> {
        let listener = listen(&config.client_addr(), config.backlog).await?;
        tracing::info!(addr = %listener.local_addr()?, backlog = config.backlog, "socks5 listening");

        let credentials = Arc::new(Credentials::new(&config.username, &config.password));
        let pool = Pool::new(config.client_connection);
        let maintainers = pool.start(Arc::clone(&config), credentials);

        Ok(Self {
            config,
            listener,
            pool,
            maintainers,
        })
    }

    /// Address the SOCKS5 listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// The pool of physical connections.
    pub fn pool(&self) -> Arc<Pool> {
        Arc::clone(&self.pool)
    }

    /// Accept local connections until the task is dropped.
    pub async fn run(&self) -> Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let config = Arc::clone(&self.config);
                    let pool = Arc::clone(&self.pool);
                    tokio::spawn(async move {
                        if let Err(e) = handle_local(config, pool, stream, peer).await {
                            tracing::debug!(%peer, error = %e, "local connection refused");
                        }
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                }
            }
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        for task in &self.maintainers {
            task.abort();
        }
    }
}

async fn handle_local(
    config: Arc<Config>,
    pool: Arc<Pool>,
    mut stream: TcpStream,
    peer: SocketAddr,
) -> Result<()> {
    let _ = stream.set_nodelay(true);
    let target = tokio::time::timeout(config.timeout, socks5::accept(&mut stream))
        .await
        .map_err(|_| Error::socks5("negotiation timed out"))??;

    let dst = match socks5::resolve_ipv4(&target).await {
        Ok(dst) => dst,
        Err(e) => {
            let _ = socks5::send_reply(&mut stream, socks5::REPLY_HOST_UNREACHABLE).await;
            return Err(e);
        }
    };
    let key = StreamKey::from_socket_addr(dst)?;

    let Some((handle, lease)) = pool.lease(key) else {
        let _ = socks5::send_reply(&mut stream, socks5::REPLY_GENERAL_FAILURE).await;
        return Err(Error::tunnel(format!("no tunnel connection free for {}", key)));
    };

    socks5::send_reply(&mut stream, socks5::REPLY_SUCCEEDED).await?;
    tracing::debug!(%peer, %target, %dst, "opening stream");

    let env = EnvBlock::new(Arc::clone(&config)).with_src(peer).with_dst(dst);
    let stage = LocalStage::new(stream, Some(config.timeout), lease);
    handle.open(env, Box::new(stage))
}
