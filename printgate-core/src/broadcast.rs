//! Per-connection printer-state broadcast
//!
//! Every observer connection gets its own poll loop:
//! - `attach` starts a loop that fetches state every interval and pushes a
//!   snapshot (or an error notice) into the connection's channel
//! - `detach` stops it; a fetch already running finishes but its result is
//!   dropped
//!
//! Loops share the upstream session through the [`StateSource`] but nothing
//! else. A failed or hung poll on one connection does not touch the others.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::GatewayError;
use crate::protocol::FeedMessage;

/// Where poll loops get printer state from
#[async_trait]
pub trait StateSource: Send + Sync {
    async fn fetch_state(&self) -> Result<Value, GatewayError>;
}

/// Outbound side of an observer connection. Cleared on detach.
type Sink = Arc<Mutex<Option<mpsc::Sender<FeedMessage>>>>;

/// A registered observer and its poll loop
struct Observer {
    generation: u64,
    cancel: CancellationToken,
    sink: Sink,
    handle: JoinHandle<()>,
}

impl Observer {
    /// Close the sink first so nothing is delivered once this returns.
    async fn stop(&self) {
        self.sink.lock().await.take();
        self.cancel.cancel();
    }
}

struct Inner {
    source: Arc<dyn StateSource>,
    interval: Duration,
    observers: Mutex<HashMap<String, Observer>>,
    next_generation: AtomicU64,
}

/// Registry of active observer poll loops.
/// Clone is cheap; clones share the registry.
#[derive(Clone)]
pub struct BroadcastScheduler {
    inner: Arc<Inner>,
}

impl BroadcastScheduler {
    pub fn new(source: Arc<dyn StateSource>, interval: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                interval,
                observers: Mutex::new(HashMap::new()),
                next_generation: AtomicU64::new(0),
            }),
        }
    }

    /// Start polling for `id`, pushing results into `sink`.
    ///
    /// The first poll happens one interval after attaching. Attaching an id
    /// that is already active stops its previous loop first.
    pub async fn attach(&self, id: impl Into<String>, sink: mpsc::Sender<FeedMessage>) {
        let id = id.into();
        let mut observers = self.inner.observers.lock().await;

        if let Some(previous) = observers.remove(&id) {
            tracing::warn!(connection = %id, "Observer re-attached, replacing its poll loop");
            previous.stop().await;
        }

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let sink: Sink = Arc::new(Mutex::new(Some(sink)));

        let handle = tokio::spawn(poll_loop(PollLoop {
            id: id.clone(),
            generation,
            source: Arc::clone(&self.inner.source),
            interval: self.inner.interval,
            cancel: cancel.clone(),
            sink: Arc::clone(&sink),
            registry: Arc::downgrade(&self.inner),
        }));

        observers.insert(
            id.clone(),
            Observer {
                generation,
                cancel,
                sink,
                handle,
            },
        );

        tracing::info!(
            connection = %id,
            active = observers.len(),
            "Observer attached"
        );
    }

    /// Stop polling for `id`. Returns `false` if it was not active.
    pub async fn detach(&self, id: &str) -> bool {
        let removed = self.inner.observers.lock().await.remove(id);

        match removed {
            Some(observer) => {
                observer.stop().await;
                tracing::info!(connection = %id, "Observer detached");
                true
            }
            None => false,
        }
    }

    pub async fn is_active(&self, id: &str) -> bool {
        self.inner.observers.lock().await.contains_key(id)
    }

    /// Number of running poll loops
    pub async fn active_count(&self) -> usize {
        self.inner.observers.lock().await.len()
    }

    /// Detach every observer and wait for their loops to exit.
    pub async fn shutdown(&self) {
        let observers: Vec<(String, Observer)> =
            self.inner.observers.lock().await.drain().collect();

        for (_, observer) in &observers {
            observer.stop().await;
        }

        for (id, observer) in observers {
            if let Err(e) = observer.handle.await {
                tracing::warn!(connection = %id, error = %e, "Poll loop ended abnormally");
            }
        }

        tracing::info!("Broadcast scheduler shut down");
    }
}

impl Inner {
    /// Drop the registry entry for `id` unless it has been replaced since.
    async fn remove_if_current(&self, id: &str, generation: u64) {
        let mut observers = self.observers.lock().await;
        if observers.get(id).is_some_and(|o| o.generation == generation) {
            if let Some(observer) = observers.remove(id) {
                observer.stop().await;
            }
        }
    }
}

struct PollLoop {
    id: String,
    generation: u64,
    source: Arc<dyn StateSource>,
    interval: Duration,
    cancel: CancellationToken,
    sink: Sink,
    registry: Weak<Inner>,
}

/// Outcome of pushing one message to an observer
enum Delivery {
    Sent,
    Dropped,
    Detached,
    Closed,
}

async fn poll_loop(state: PollLoop) {
    let mut ticker = tokio::time::interval_at(Instant::now() + state.interval, state.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = state.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        tracing::debug!(connection = %state.id, "Poll tick");

        // Runs to completion even if the observer detaches meanwhile
        let message = match state.source.fetch_state().await {
            Ok(snapshot) => FeedMessage::snapshot(snapshot),
            Err(e) => {
                tracing::warn!(connection = %state.id, error = %e, "Printer state poll failed");
                FeedMessage::error(e.to_string())
            }
        };

        match deliver(&state.sink, message).await {
            Delivery::Sent => {}
            Delivery::Dropped => {
                tracing::debug!(connection = %state.id, "Observer channel full, tick dropped");
            }
            Delivery::Detached => break,
            Delivery::Closed => {
                tracing::info!(connection = %state.id, "Observer channel closed, detaching");
                if let Some(registry) = state.registry.upgrade() {
                    registry.remove_if_current(&state.id, state.generation).await;
                }
                break;
            }
        }
    }

    tracing::debug!(connection = %state.id, "Poll loop stopped");
}

async fn deliver(sink: &Mutex<Option<mpsc::Sender<FeedMessage>>>, message: FeedMessage) -> Delivery {
    let guard = sink.lock().await;
    let Some(tx) = guard.as_ref() else {
        return Delivery::Detached;
    };

    match tx.try_send(message) {
        Ok(()) => Delivery::Sent,
        Err(TrySendError::Full(_)) => Delivery::Dropped,
        Err(TrySendError::Closed(_)) => Delivery::Closed,
    }
}
