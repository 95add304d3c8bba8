//! Tunnel server.
//!
//! Every accepted connection gets its own task and chain:
//!
//! ```text
//! Low ─ Socket ─ Framing ─ ServerHandshake→(Cipher) ─ Tunnel(acceptor) ─ High
//!                                                        │
//!                        Low ─ Index ─ relay ─ High    one per stream
//! ```
//!
//! The relay stage dials the destination named by the stream's key.

mod metrics;

pub use metrics::{MetricsSnapshot, ServerMetrics};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};

use crate::config::Config;
use crate::crypto::Credentials;
use crate::error::Result;
use crate::layer::{
    listen, Endpoint, EndpointStage, FramingStage, ServerHandshake, SocketStage, StageFactory,
    TunnelStage,
};
use crate::pipeline::{ConnectionState, EnvBlock, Stage};
use crate::session::{log_finished, Connection};

/// How long a relay waits for its destination to accept.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Main server instance.
pub struct Server {
    config: Arc<Config>,
    credentials: Arc<Credentials>,
    listener: TcpListener,
    metrics: Arc<ServerMetrics>,
}

impl Server {
    /// Bind the tunnel listener.
    pub async fn bind(config: Arc<Config>) -> Result<Self> {
        let listener = listen(&config.server_addr(), config.backlog).await?;
        tracing::info!(addr = %listener.local_addr()?, backlog = config.backlog, "tunnel server listening");

        Ok(Self {
            credentials: Arc::new(Credentials::new(&config.username, &config.password)),
            listener,
            metrics: Arc::new(ServerMetrics::new()),
            config,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Get server metrics.
    pub fn metrics(&self) -> Arc<ServerMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Accept connections until the task is dropped.
    pub async fn run(&self) -> Result<()> {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    tokio::spawn(serve(
                        Arc::clone(&self.config),
                        Arc::clone(&self.credentials),
                        Arc::clone(&self.metrics),
                        stream,
                        peer,
                    ));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                }
            }
        }
    }
}

async fn serve(
    config: Arc<Config>,
    credentials: Arc<Credentials>,
    metrics: Arc<ServerMetrics>,
    stream: TcpStream,
    peer: SocketAddr,
) {
    metrics.increment_connections();
    tracing::debug!(%peer, "connection accepted");
    let _ = stream.set_nodelay(true);

    let stages: Vec<Box<dyn Stage>> = vec![
        Box::new(SocketStage::new(stream, Some(config.timeout))),
        Box::new(FramingStage::new(config.max_frame_len)),
        Box::new(ServerHandshake::new(credentials)),
        Box::new(TunnelStage::acceptor(relay_factory(&config, &metrics))),
    ];
    let env = EnvBlock::new(Arc::clone(&config)).with_src(peer);

    match Connection::new(env, stages) {
        Ok((connection, _handle)) => {
            let env = connection.run().await;
            if env.state == ConnectionState::Error {
                metrics.increment_protocol_failures();
            }
            metrics.add_traffic(env.flow.read, env.flow.written);
            log_finished("server", &env);
        }
        Err(e) => tracing::error!(%peer, error = %e, "cannot build connection"),
    }

    metrics.decrement_connections();
}

fn relay_factory(config: &Config, metrics: &Arc<ServerMetrics>) -> StageFactory {
    let idle = Some(config.timeout);
    let metrics = Arc::clone(metrics);
    Arc::new(move || {
        metrics.increment_streams();
        Box::new(EndpointStage::new("relay", Endpoint::Dial(CONNECT_TIMEOUT), idle))
    })
}
