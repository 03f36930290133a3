//! Broadcast Fabric: coalesces an arbitrary rate of registry mutations down
//! to at most one snapshot push per subscriber per second, without ever
//! letting a slow subscriber block a mutator.
//!
//! A single dedicated task owns the wake channel and a 1-second ticker. Any
//! number of producers call `signal()`, which is non-blocking: if the wake
//! channel is full the signal is simply dropped, because the next signal
//! that does land still carries the (by-then more current) registry state.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::time::interval;

use crate::registry::Snapshot;

/// Capacity of the wake channel. On the order of 100 per the design notes;
/// a burst larger than this just coalesces harder, it never blocks.
const WAKE_CHANNEL_CAPACITY: usize = 128;

const BROADCAST_INTERVAL: Duration = Duration::from_secs(1);

/// Something that can receive one serialized snapshot at a time. A write
/// failure (return `Err`) causes the subscriber to be dropped.
#[async_trait]
pub trait Sink: Send + Sync {
    async fn send(&self, snapshot: &Snapshot) -> Result<(), ()>;
}

type SharedRegistry = std::sync::Weak<dyn SnapshotSource>;

/// Abstracts "a thing that can produce a registry snapshot" so the
/// broadcaster doesn't need to depend on `ConnectionRegistry` directly.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn snapshot(&self) -> Snapshot;
}

struct Subscriber {
    id: u64,
    sink: Arc<dyn Sink>,
}

/// Handle returned by `subscribe`; dropping it removes the subscriber.
pub struct Subscription {
    id: u64,
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let subscribers = Arc::clone(&self.subscribers);
        let id = self.id;
        tokio::spawn(async move {
            let mut subs = subscribers.lock().await;
            subs.retain(|s| s.id != id);
        });
    }
}

pub struct BroadcastFabric {
    wake_tx: mpsc::Sender<()>,
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    source: std::sync::Mutex<Option<SharedRegistry>>,
}

impl BroadcastFabric {
    /// Spawn the broadcaster task and return a handle. `bind_source` must be
    /// called once the registry exists (the two are mutually dependent), or
    /// `signal()` calls before binding are simply coalesced and published
    /// against an empty snapshot once bound.
    pub fn spawn() -> Arc<Self> {
        let (wake_tx, wake_rx) = mpsc::channel(WAKE_CHANNEL_CAPACITY);
        let fabric = Arc::new(BroadcastFabric {
            wake_tx,
            subscribers: Arc::new(Mutex::new(Vec::new())),
            source: std::sync::Mutex::new(None),
        });

        let task_fabric = Arc::clone(&fabric);
        tokio::spawn(async move {
            task_fabric.run(wake_rx).await;
        });

        fabric
    }

    /// Bind the registry this fabric publishes snapshots from. Takes a weak
    /// reference so the registry and the fabric (which each hold a strong
    /// reference to the other) don't keep each other alive forever.
    pub fn bind_source(&self, source: &Arc<dyn SnapshotSource>) {
        *self.source.lock().expect("broadcast source lock poisoned") = Some(Arc::downgrade(source));
    }

    /// Non-blocking wake signal. Dropped silently if the channel is full.
    pub fn signal(&self) {
        let _ = self.wake_tx.try_send(());
    }

    /// Register a new subscriber, returning a handle whose `Drop`
    /// unsubscribes it.
    pub async fn subscribe(&self, sink: Arc<dyn Sink>) -> Subscription
    where
        Self: Sized,
    {
        static NEXT_ID: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(1);
        let id = NEXT_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.subscribers.lock().await.push(Subscriber { id, sink });
        Subscription {
            id,
            subscribers: Arc::clone(&self.subscribers),
        }
    }

    /// Synchronously deliver one snapshot to `sink`, bypassing the
    /// coalescing loop. Used to seed an observer right after it subscribes.
    pub async fn publish_now_to(&self, sink: &dyn Sink, snapshot: &Snapshot) {
        let _ = sink.send(snapshot).await;
    }

    async fn current_snapshot(&self) -> Option<Snapshot> {
        let upgraded = {
            let source = self.source.lock().expect("broadcast source lock poisoned");
            source.as_ref().and_then(std::sync::Weak::upgrade)
        };
        match upgraded {
            Some(src) => Some(src.snapshot().await),
            None => None,
        }
    }

    async fn publish(&self) {
        let Some(snapshot) = self.current_snapshot().await else {
            return;
        };
        let mut subs = self.subscribers.lock().await;
        let mut dead = Vec::new();
        for sub in subs.iter() {
            if sub.sink.send(&snapshot).await.is_err() {
                dead.push(sub.id);
            }
        }
        if !dead.is_empty() {
            subs.retain(|s| !dead.contains(&s.id));
        }
    }

    async fn run(self: Arc<Self>, mut wake_rx: mpsc::Receiver<()>) {
        let mut pending_update = false;
        let mut last_broadcast = Instant::now() - BROADCAST_INTERVAL;
        let mut ticker = interval(BROADCAST_INTERVAL);
        // The first tick fires immediately; we don't want a spurious publish
        // with no pending updates, so consume it up front.
        ticker.tick().await;

        loop {
            tokio::select! {
                woken = wake_rx.recv() => {
                    match woken {
                        Some(()) => {
                            pending_update = true;
                            if last_broadcast.elapsed() >= BROADCAST_INTERVAL {
                                self.publish().await;
                                pending_update = false;
                                last_broadcast = Instant::now();
                            }
                        }
                        None => break,
                    }
                }
                _ = ticker.tick() => {
                    if pending_update {
                        self.publish().await;
                        pending_update = false;
                        last_broadcast = Instant::now();
                    }
                }
            }
        }
    }
}
