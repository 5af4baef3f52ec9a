//! Live telemetry relay
//!
//! Fans the output of one deployment out to any number of observers. Each
//! observer owns a bounded buffer; when it is full the chunk is dropped for
//! that observer only, so a stalled observer never slows the producer or its
//! peers. The complete log is persisted by the task queue, not here.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, trace};

use crate::models::TaskId;

/// Default per-observer buffer, in chunks
pub const DEFAULT_OBSERVER_BUFFER: usize = 100;

/// How many closed trace ids are remembered so late subscribers end at once
const CLOSED_MEMORY: usize = 4096;

/// What an observer receives
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// One chunk of output, in production order
    Chunk(String),

    /// The producer finished; no more chunks will follow
    End,
}

struct Observer {
    id: u64,
    tx: mpsc::Sender<String>,
    dropped: Arc<AtomicU64>,
}

#[derive(Default)]
struct Registry {
    channels: HashMap<TaskId, Vec<Observer>>,
    closed: HashSet<TaskId>,
    closed_order: VecDeque<TaskId>,
    next_id: u64,
}

impl Registry {
    fn remove(&mut self, trace_id: &TaskId, observer_id: u64) -> bool {
        let Some(observers) = self.channels.get_mut(trace_id) else {
            return false;
        };
        let before = observers.len();
        observers.retain(|o| o.id != observer_id);
        let removed = observers.len() != before;
        if observers.is_empty() {
            self.channels.remove(trace_id);
        }
        removed
    }

    fn mark_closed(&mut self, trace_id: TaskId) {
        if self.closed.insert(trace_id) {
            self.closed_order.push_back(trace_id);
            while self.closed_order.len() > CLOSED_MEMORY {
                if let Some(oldest) = self.closed_order.pop_front() {
                    self.closed.remove(&oldest);
                }
            }
        }
    }
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    // A panic while holding the lock cannot leave the map half-updated in a
    // way that matters to observers, so recover the guard.
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// In-memory pub/sub hub keyed by trace id
pub struct TelemetryRelay {
    registry: Arc<Mutex<Registry>>,
    buffer: usize,
}

impl TelemetryRelay {
    /// Create a relay with the given per-observer buffer (minimum 1)
    pub fn new(buffer: usize) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            buffer: buffer.max(1),
        }
    }

    /// Register a new observer for `trace_id`
    pub fn subscribe(&self, trace_id: TaskId) -> Subscription {
        let (tx, rx) = mpsc::channel(self.buffer);
        let dropped = Arc::new(AtomicU64::new(0));

        let mut registry = lock(&self.registry);
        registry.next_id += 1;
        let id = registry.next_id;

        // Already finished: hand back a channel that ends immediately
        if !registry.closed.contains(&trace_id) {
            registry.channels.entry(trace_id).or_default().push(Observer {
                id,
                tx,
                dropped: dropped.clone(),
            });
        }
        drop(registry);

        debug!("Observer {} subscribed to {}", id, trace_id);
        Subscription {
            trace_id,
            id,
            rx,
            dropped,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Remove and close one observer
    pub fn unsubscribe(&self, trace_id: TaskId, subscription: &Subscription) {
        if lock(&self.registry).remove(&trace_id, subscription.id) {
            debug!("Observer {} unsubscribed from {}", subscription.id, trace_id);
        }
    }

    /// Deliver `chunk` to every current observer of `trace_id`, never blocking
    pub fn broadcast(&self, trace_id: TaskId, chunk: &str) {
        let targets: Vec<(u64, mpsc::Sender<String>, Arc<AtomicU64>)> = {
            let registry = lock(&self.registry);
            match registry.channels.get(&trace_id) {
                Some(observers) => observers
                    .iter()
                    .map(|o| (o.id, o.tx.clone(), o.dropped.clone()))
                    .collect(),
                None => return,
            }
        };

        let mut gone = Vec::new();
        for (id, tx, dropped) in targets {
            match tx.try_send(chunk.to_string()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    dropped.fetch_add(1, Ordering::Relaxed);
                    trace!("Observer {} of {} is full, chunk dropped", id, trace_id);
                }
                Err(TrySendError::Closed(_)) => gone.push(id),
            }
        }

        if !gone.is_empty() {
            let mut registry = lock(&self.registry);
            for id in gone {
                registry.remove(&trace_id, id);
            }
        }
    }

    /// The producer is done: end every current and future subscription
    pub fn close(&self, trace_id: TaskId) {
        let observers = {
            let mut registry = lock(&self.registry);
            registry.mark_closed(trace_id);
            registry.channels.remove(&trace_id)
        };
        let count = observers.map(|o| o.len()).unwrap_or(0);
        debug!("Closed relay channel {} ({} observers)", trace_id, count);
    }

    /// Number of observers currently attached to `trace_id`
    pub fn observer_count(&self, trace_id: TaskId) -> usize {
        lock(&self.registry)
            .channels
            .get(&trace_id)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

impl Default for TelemetryRelay {
    fn default() -> Self {
        Self::new(DEFAULT_OBSERVER_BUFFER)
    }
}

/// One observer's end of a relay channel
///
/// Dropping it unsubscribes.
pub struct Subscription {
    trace_id: TaskId,
    id: u64,
    rx: mpsc::Receiver<String>,
    dropped: Arc<AtomicU64>,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    pub fn trace_id(&self) -> TaskId {
        self.trace_id
    }

    /// Wait for the next event. `End` is only returned once the producer has
    /// closed the channel (or this observer was unsubscribed) and every
    /// buffered chunk has been drained.
    pub async fn recv(&mut self) -> RelayEvent {
        match self.rx.recv().await {
            Some(chunk) => RelayEvent::Chunk(chunk),
            None => RelayEvent::End,
        }
    }

    /// Non-blocking variant of `recv`; `None` when nothing is buffered yet
    pub fn try_recv(&mut self) -> Option<RelayEvent> {
        match self.rx.try_recv() {
            Ok(chunk) => Some(RelayEvent::Chunk(chunk)),
            Err(mpsc::error::TryRecvError::Empty) => None,
            Err(mpsc::error::TryRecvError::Disconnected) => Some(RelayEvent::End),
        }
    }

    /// Chunks dropped because this observer's buffer was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            lock(&registry).remove(&self.trace_id, self.id);
        }
    }
}
