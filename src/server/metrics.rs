//! Server metrics collection.
//!
//! Aggregate counters only; nothing here identifies a client or a
//! destination.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Server metrics collector.
pub struct ServerMetrics {
    /// Server start time
    start_time: Instant,
    /// Total physical connections accepted
    total_connections: AtomicU64,
    /// Physical connections currently open
    active_connections: AtomicU64,
    /// Physical connections that ended with a protocol error
    protocol_failures: AtomicU64,
    /// Logical connections opened by clients
    streams_opened: AtomicU64,
    /// Bytes read from clients
    bytes_received: AtomicU64,
    /// Bytes written to clients
    bytes_sent: AtomicU64,
}

impl ServerMetrics {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            total_connections: AtomicU64::new(0),
            active_connections: AtomicU64::new(0),
            protocol_failures: AtomicU64::new(0),
            streams_opened: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
        }
    }

    /// Increment total and active connections.
    pub fn increment_connections(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement active connections.
    pub fn decrement_connections(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    /// Count a connection that ended with a protocol error.
    pub fn increment_protocol_failures(&self) {
        self.protocol_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a logical connection.
    pub fn increment_streams(&self) {
        self.streams_opened.fetch_add(1, Ordering::Relaxed);
    }

    /// Add the traffic of a finished connection.
    pub fn add_traffic(&self, received: u64, sent: u64) {
        self.bytes_received.fetch_add(received, Ordering::Relaxed);
        self.bytes_sent.fetch_add(sent, Ordering::Relaxed);
    }

    /// Get uptime in seconds.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Get total connections.
    pub fn total_connections(&self) -> u64 {
        self.total_connections.load(Ordering::Relaxed)
    }

    /// Get active connections.
    pub fn active_connections(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            total_connections: self.total_connections(),
            active_connections: self.active_connections(),
            protocol_failures: self.protocol_failures.load(Ordering::Relaxed),
            streams_opened: self.streams_opened.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
        }
    }

    /// Format metrics as a simple text report.
    pub fn format_report(&self) -> String {
        let snapshot = self.snapshot();

        format!(
            r#"pipetun server metrics
======================
Uptime: {} seconds

Connections:
  Total:             {}
  Active:            {}
  Protocol failures: {}
  Streams opened:    {}

Traffic:
  Received: {} bytes
  Sent:     {} bytes
"#,
            snapshot.uptime_secs,
            snapshot.total_connections,
            snapshot.active_connections,
            snapshot.protocol_failures,
            snapshot.streams_opened,
            snapshot.bytes_received,
            snapshot.bytes_sent,
        )
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of all metrics at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub total_connections: u64,
    pub active_connections: u64,
    pub protocol_failures: u64,
    pub streams_opened: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

impl MetricsSnapshot {
    /// Share of connections that ended with a protocol error.
    pub fn failure_rate(&self) -> f64 {
        if self.total_connections == 0 {
            0.0
        } else {
            self.protocol_failures as f64 / self.total_connections as f64
        }
    }

    /// Calculate throughput in bytes per second.
    pub fn throughput_bps(&self) -> f64 {
        if self.uptime_secs == 0 {
            0.0
        } else {
            (self.bytes_sent + self.bytes_received) as f64 / self.uptime_secs as f64
        }
    }
}
