//! Keep-alive policy and connection reuse tracking.
//!
//! The send loop issues one call at a time, so the client keeps at most one
//! idle connection. Reuse is observed directly (a checked-out connection is
//! either the pooled one or a freshly dialed one), not inferred from
//! latency.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use hyper::client::conn::SendRequest;
use hyper::Body;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tokio::time::{Duration, Instant};
use tracing::debug;

use crate::clock::fmt_duration;
use crate::metrics::CONNECTIONS_TOTAL;
use crate::trace::WireTap;

/// Connection reuse configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Keep connections open between calls.
    pub keep_alive: bool,

    /// How long an idle connection may wait for the next call.
    pub idle_timeout: Duration,

    /// TCP keepalive probe interval on dialed sockets.
    pub tcp_keepalive: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            keep_alive: true,
            idle_timeout: Duration::from_secs(90),
            tcp_keepalive: Some(Duration::from_secs(30)),
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Enables keepalive probing on a freshly dialed socket.
    pub fn apply_to_socket(&self, stream: &TcpStream) -> std::io::Result<()> {
        if let Some(interval) = self.tcp_keepalive {
            let keepalive = TcpKeepalive::new().with_time(interval);
            SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
        }
        Ok(())
    }
}

/// An established HTTP/1 connection ready to carry a request.
pub(crate) struct PooledConn {
    pub sender: SendRequest<Body>,
    pub remote_addr: SocketAddr,
    pub local_addr: SocketAddr,
    pub tap: Arc<WireTap>,
}

struct IdleConn {
    conn: PooledConn,
    idle_since: Instant,
}

/// Holds the single idle connection between calls.
pub(crate) struct IdleSlot {
    config: PoolConfig,
    slot: Mutex<Option<IdleConn>>,
}

impl IdleSlot {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            slot: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Takes the idle connection, if there is one young enough to use.
    /// Returns it with the time it spent idle.
    pub fn checkout(&self) -> Option<(PooledConn, Duration)> {
        let idle = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()?;
        let idle_for = idle.idle_since.elapsed();
        if idle_for >= self.config.idle_timeout {
            debug!(
                remote = %idle.conn.remote_addr,
                idle = %fmt_duration(idle_for),
                "Discarding expired idle connection"
            );
            return None;
        }
        Some((idle.conn, idle_for))
    }

    /// Parks a connection for the next call. Without keep-alive the
    /// connection is dropped, which closes it.
    pub fn checkin(&self, conn: PooledConn) {
        if !self.config.keep_alive {
            return;
        }
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(IdleConn {
            conn,
            idle_since: Instant::now(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

/// Counts of connections handed to calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub total: u64,
    pub new_connections: u64,
    pub reused_connections: u64,
}

impl ConnectionStats {
    pub fn reuse_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.reused_connections as f64 / self.total as f64) * 100.0
    }

    pub fn new_connection_rate(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.new_connections as f64 / self.total as f64) * 100.0
    }

    pub fn format(&self) -> String {
        format!(
            "Total: {}, Reused: {} ({:.1}%), New: {} ({:.1}%)",
            self.total,
            self.reused_connections,
            self.reuse_rate(),
            self.new_connections,
            self.new_connection_rate()
        )
    }
}

/// Shared reuse counter for one client.
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    stats: Arc<Mutex<ConnectionStats>>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, reused: bool) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        stats.total += 1;
        if reused {
            stats.reused_connections += 1;
            CONNECTIONS_TOTAL.with_label_values(&["reused"]).inc();
        } else {
            stats.new_connections += 1;
            CONNECTIONS_TOTAL.with_label_values(&["new"]).inc();
        }
    }

    pub fn stats(&self) -> ConnectionStats {
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
