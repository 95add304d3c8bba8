//! Per-chain session environment.

use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::Config;

/// Lifecycle state of the connection a chain serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Built, not yet able to move bytes
    Connecting,
    /// Bytes are flowing
    Connected,
    /// Ended cleanly
    Closed,
    /// Ended because of an error
    Error,
    /// Torn down
    Destroyed,
}

impl ConnectionState {
    /// Whether the connection has ended one way or another.
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            ConnectionState::Closed | ConnectionState::Error | ConnectionState::Destroyed
        )
    }
}

/// Cumulative byte counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Flow {
    /// Bytes received from the socket this chain owns
    pub read: u64,
    /// Bytes handed to the socket this chain owns
    pub written: u64,
}

/// Start and end of the connection.
#[derive(Debug, Clone, Copy)]
pub struct Timing {
    /// When the chain was created
    pub start: DateTime<Utc>,
    /// When the connection ended
    pub end: Option<DateTime<Utc>>,
}

impl Timing {
    fn now() -> Self {
        Self {
            start: Utc::now(),
            end: None,
        }
    }

    /// Milliseconds between start and end (or now, if still open).
    pub fn elapsed_ms(&self) -> i64 {
        let end = self.end.unwrap_or_else(Utc::now);
        (end - self.start).num_milliseconds()
    }
}

/// Mutable record shared by every stage of one chain.
///
/// Stages reach it through [`Context::env`](super::Context::env) and
/// [`Context::env_mut`](super::Context::env_mut). Each multiplexed
/// logical connection gets its own block.
#[derive(Debug, Clone)]
pub struct EnvBlock {
    /// Immutable process configuration
    pub config: Arc<Config>,
    /// Byte counters
    pub flow: Flow,
    /// Owning process id
    pub pid: u32,
    /// Peer that opened this connection
    pub src: Option<SocketAddr>,
    /// Where the traffic is going
    pub dst: Option<SocketAddr>,
    /// Start/end timestamps
    pub time: Timing,
    /// Lifecycle state
    pub state: ConnectionState,
}

impl EnvBlock {
    /// Create a fresh block for a new connection.
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            flow: Flow::default(),
            pid: std::process::id(),
            src: None,
            dst: None,
            time: Timing::now(),
            state: ConnectionState::Connecting,
        }
    }

    /// Builder-style source endpoint.
    pub fn with_src(mut self, src: SocketAddr) -> Self {
        self.src = Some(src);
        self
    }

    /// Builder-style destination endpoint.
    pub fn with_dst(mut self, dst: SocketAddr) -> Self {
        self.dst = Some(dst);
        self
    }

    /// A block for a logical connection carried by this one.
    ///
    /// Shares configuration, process id and source, and starts with fresh
    /// counters, timing and state.
    pub fn fork(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            flow: Flow::default(),
            pid: self.pid,
            src: self.src,
            dst: None,
            time: Timing::now(),
            state: ConnectionState::Connecting,
        }
    }

    /// Record the end of the connection. The first final state wins.
    pub fn finish(&mut self, state: ConnectionState) {
        if self.state.is_finished() {
            return;
        }
        self.state = state;
        self.time.end = Some(Utc::now());
    }
}
