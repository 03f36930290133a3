//! Connection Registry: the single source of truth for in-flight connections.
//!
//! All mutators and the snapshot reader serialize through one `Mutex`
//! guarding the whole state, so a snapshot always observes a consistent
//! view even while other connections are admitting, accounting, or
//! releasing concurrently.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Mutex;

use crate::broadcast::{BroadcastFabric, SnapshotSource};

/// A record is considered idle once this long has passed since its last
/// accounted byte; idle records report zero rates in a snapshot.
const IDLE_THRESHOLD: Duration = Duration::from_secs(2);

/// Opaque unique identifier for a connection, stable for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnId(u64);

impl ConnId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ConnId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Http,
    Socks5,
}

#[derive(Debug, Clone, Copy, Default)]
pub enum Direction {
    #[default]
    In,
    Out,
}

/// One live (or just-finished) connection's accounting state.
///
/// `bytes_in`/`bytes_out` are monotonic non-decreasing for the life of the
/// record. The rate window fields implement the rolling-window algorithm in
/// `ConnectionRegistry::account`.
#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    pub id: ConnId,
    pub client_endpoint: String,
    pub protocol: Protocol,
    pub destination: String,
    pub domain: String,
    pub start_time: Instant,
    pub bytes_in: u64,
    pub bytes_out: u64,
    window_start: Instant,
    window_bytes_in: u64,
    window_bytes_out: u64,
    last_update: Instant,
    pub rate_in: f64,
    pub rate_out: f64,
}

impl ConnectionRecord {
    fn new(id: ConnId, client_endpoint: String, protocol: Protocol, destination: String) -> Self {
        let now = Instant::now();
        let domain = destination
            .rsplit_once(':')
            .map_or_else(|| destination.clone(), |(host, _)| host.to_owned());
        ConnectionRecord {
            id,
            client_endpoint,
            protocol,
            destination,
            domain,
            start_time: now,
            bytes_in: 0,
            bytes_out: 0,
            window_start: now,
            window_bytes_in: 0,
            window_bytes_out: 0,
            last_update: now,
            rate_in: 0.0,
            rate_out: 0.0,
        }
    }

    fn account(&mut self, direction: Direction, n: u64) {
        let now = Instant::now();
        let first_in_window = self.last_update == self.start_time && self.bytes_in == 0 && self.bytes_out == 0;
        if first_in_window {
            self.window_start = now;
            self.window_bytes_in = 0;
            self.window_bytes_out = 0;
        }
        match direction {
            Direction::In => {
                self.bytes_in += n;
                self.window_bytes_in += n;
            }
            Direction::Out => {
                self.bytes_out += n;
                self.window_bytes_out += n;
            }
        }
        self.last_update = now;

        let elapsed = now.duration_since(self.window_start).as_secs_f64();
        if elapsed > 0.0 {
            self.rate_in = self.window_bytes_in as f64 / elapsed;
            self.rate_out = self.window_bytes_out as f64 / elapsed;
        }
        if elapsed >= 1.0 {
            self.window_start = now;
            self.window_bytes_in = 0;
            self.window_bytes_out = 0;
        }
    }

    fn is_idle(&self, now: Instant) -> bool {
        now.duration_since(self.last_update) > IDLE_THRESHOLD
    }
}

/// An immutable, point-in-time view produced by `ConnectionRegistry::snapshot`.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub active: Vec<ActiveView>,
    pub total_connections: u64,
    pub total_bytes_in: u64,
    pub total_bytes_out: u64,
    pub current_bandwidth_in: f64,
    pub current_bandwidth_out: f64,
}

/// A record's view inside a `Snapshot`: idle-adjusted and with a derived
/// duration, decoupled from the live `ConnectionRecord` so mutation of one
/// can never retroactively change an already-produced snapshot.
#[derive(Debug, Clone)]
pub struct ActiveView {
    pub id: ConnId,
    pub client_endpoint: String,
    pub protocol: Protocol,
    pub destination: String,
    pub domain: String,
    pub start_time: Instant,
    pub duration: Duration,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub rate_in: f64,
    pub rate_out: f64,
}

struct RegistryState {
    active: HashMap<ConnId, ConnectionRecord>,
    total_connections: u64,
    total_bytes_in: u64,
    total_bytes_out: u64,
}

impl RegistryState {
    fn new() -> Self {
        RegistryState {
            active: HashMap::new(),
            total_connections: 0,
            total_bytes_in: 0,
            total_bytes_out: 0,
        }
    }
}

/// The Connection Registry (CR): the proxy's single source of truth for
/// in-flight connections.
pub struct ConnectionRegistry {
    state: Mutex<RegistryState>,
    broadcast: Arc<BroadcastFabric>,
}

impl ConnectionRegistry {
    pub fn new(broadcast: Arc<BroadcastFabric>) -> Arc<Self> {
        let registry = Arc::new(ConnectionRegistry {
            state: Mutex::new(RegistryState::new()),
            broadcast: Arc::clone(&broadcast),
        });
        let source: Arc<dyn SnapshotSource> = Arc::clone(&registry);
        broadcast.bind_source(&source);
        registry
    }

    /// Admit a fresh connection. Reverse DNS resolution of the destination
    /// host, if it is an address literal, is kicked off on a separate task
    /// and patches the record in place once it completes (or times out) —
    /// admission itself never waits on the network.
    pub async fn admit(
        self: &Arc<Self>,
        client_endpoint: String,
        protocol: Protocol,
        destination: String,
    ) -> ConnId {
        let id = ConnId::next();
        let record = ConnectionRecord::new(id, client_endpoint, protocol, destination.clone());
        {
            let mut state = self.state.lock().await;
            state.active.insert(id, record);
            state.total_connections += 1;
        }
        self.broadcast.signal();

        if let Ok(host) = destination
            .rsplit_once(':')
            .map(|(h, _)| h.to_owned())
            .ok_or(())
        {
            if let Ok(addr) = host.parse::<IpAddr>() {
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    if let Some(name) = crate::dns::reverse_lookup(addr).await {
                        let mut state = this.state.lock().await;
                        if let Some(rec) = state.active.get_mut(&id) {
                            rec.domain = name;
                        }
                        drop(state);
                        this.broadcast.signal();
                    }
                });
            }
        }

        id
    }

    /// Remove a record. A release for an unknown id is a silent no-op.
    pub async fn release(&self, id: ConnId) {
        let removed = {
            let mut state = self.state.lock().await;
            state.active.remove(&id).is_some()
        };
        if removed {
            self.broadcast.signal();
        }
    }

    /// Add `n` bytes to the per-direction counters, window, and global
    /// aggregate for `id`. Accounting for a missing id is silently dropped
    /// in its entirety — the global aggregate only moves for bytes tied to
    /// a live connection.
    pub async fn account(&self, id: ConnId, direction: Direction, n: u64) {
        let found = {
            let mut state = self.state.lock().await;
            match state.active.get_mut(&id) {
                Some(rec) => {
                    rec.account(direction, n);
                    match direction {
                        Direction::In => state.total_bytes_in += n,
                        Direction::Out => state.total_bytes_out += n,
                    }
                    true
                }
                None => false,
            }
        };
        if found {
            self.broadcast.signal();
        }
    }

    /// Produce a consistent, idle-adjusted point-in-time view.
    pub async fn snapshot(&self) -> Snapshot {
        let state = self.state.lock().await;
        let now = Instant::now();
        let mut active = Vec::with_capacity(state.active.len());
        let mut current_bandwidth_in = 0.0;
        let mut current_bandwidth_out = 0.0;

        for rec in state.active.values() {
            let idle = rec.is_idle(now);
            let (rate_in, rate_out) = if idle { (0.0, 0.0) } else { (rec.rate_in, rec.rate_out) };
            current_bandwidth_in += rate_in;
            current_bandwidth_out += rate_out;
            active.push(ActiveView {
                id: rec.id,
                client_endpoint: rec.client_endpoint.clone(),
                protocol: rec.protocol,
                destination: rec.destination.clone(),
                domain: rec.domain.clone(),
                start_time: rec.start_time,
                duration: now.duration_since(rec.start_time),
                bytes_in: rec.bytes_in,
                bytes_out: rec.bytes_out,
                rate_in,
                rate_out,
            });
        }

        Snapshot {
            active,
            total_connections: state.total_connections,
            total_bytes_in: state.total_bytes_in,
            total_bytes_out: state.total_bytes_out,
            current_bandwidth_in,
            current_bandwidth_out,
        }
    }
}

#[async_trait::async_trait]
impl SnapshotSource for ConnectionRegistry {
    async fn snapshot(&self) -> Snapshot {
        ConnectionRegistry::snapshot(self).await
    }
}
