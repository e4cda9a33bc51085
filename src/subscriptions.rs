/// Subscription broadcaster for "namespace N advanced to version V".
///
/// This is the engine's only shared structure that is not durable. It maps
/// each namespace to the set of subscribers currently waiting on it: one per
/// suspended long-poll and one per open event stream.
///
/// - Each subscriber owns a small bounded inbox of version numbers.
/// - [`Broadcaster::notify`] never blocks. A full inbox drops the
///   notification for that subscriber only; the consumer reconciles from its
///   durable cursor on its next read, so a drop delays a wake-up but never
///   loses data.
/// - A [`Subscription`] deregisters itself when dropped, so a request future
///   that is cancelled (client disconnect, timeout) cannot leak an entry.
///
/// # Example
///
/// ```ignore
/// use scorecard_sync::subscriptions::Broadcaster;
/// use std::sync::Arc;
///
/// let broadcaster = Arc::new(Broadcaster::new());
/// let mut sub = broadcaster.subscribe("t1");
///
/// broadcaster.notify("t1", 42);
/// assert_eq!(sub.recv().await, Some(42));
/// ```
use crate::config::DEFAULT_INBOX_CAPACITY;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

/// Unique identifier for a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriberId(pub u64);

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

type Registry = HashMap<String, HashMap<SubscriberId, mpsc::Sender<i64>>>;

/// In-memory registry of namespace subscribers.
///
/// One mutex covers subscribe, unsubscribe and notify. All three are short
/// and never await while holding it.
pub struct Broadcaster {
    registry: Mutex<Registry>,
    next_id: AtomicU64,
    inbox_capacity: usize,
}

impl Broadcaster {
    /// Create a broadcaster with the default inbox size.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_INBOX_CAPACITY)
    }

    /// Create a broadcaster whose subscribers hold up to `capacity` pending
    /// notifications.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            registry: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            inbox_capacity: capacity.max(1),
        }
    }

    // Critical sections cannot leave the map half-updated, so a panic in
    // another holder does not invalidate it.
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a new subscriber on `namespace`.
    pub fn subscribe(self: &Arc<Self>, namespace: impl Into<String>) -> Subscription {
        let namespace = namespace.into();
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (sender, inbox) = mpsc::channel(self.inbox_capacity);

        self.registry()
            .entry(namespace.clone())
            .or_default()
            .insert(id, sender);
        tracing::trace!("{} subscribed to namespace {}", id, namespace);

        Subscription {
            id,
            namespace,
            inbox,
            broadcaster: Arc::clone(self),
        }
    }

    /// Deregister a subscriber.
    ///
    /// Idempotent: returns `false` if it was already gone. The subscriber's
    /// inbox is closed once its sender is dropped here.
    pub fn unsubscribe(&self, namespace: &str, id: SubscriberId) -> bool {
        let mut registry = self.registry();
        let Some(subscribers) = registry.get_mut(namespace) else {
            return false;
        };
        let removed = subscribers.remove(&id).is_some();
        if subscribers.is_empty() {
            registry.remove(namespace);
        }
        if removed {
            tracing::trace!("{} unsubscribed from namespace {}", id, namespace);
        }
        removed
    }

    /// Deliver `version` to every subscriber of `namespace`.
    ///
    /// Returns the number of inboxes that accepted it. Subscribers of other
    /// namespaces are never touched.
    pub fn notify(&self, namespace: &str, version: i64) -> usize {
        let registry = self.registry();
        let Some(subscribers) = registry.get(namespace) else {
            return 0;
        };

        let mut delivered = 0;
        for (id, sender) in subscribers {
            match sender.try_send(version) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::trace!("{} inbox full, dropping version {}", id, version);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::trace!("{} inbox closed", id);
                }
            }
        }
        delivered
    }

    /// Number of subscribers currently registered on `namespace`.
    pub fn subscriber_count(&self, namespace: &str) -> usize {
        self.registry().get(namespace).map_or(0, HashMap::len)
    }

    /// Number of namespaces with at least one subscriber.
    pub fn namespace_count(&self) -> usize {
        self.registry().len()
    }

    /// Total subscribers across all namespaces.
    pub fn total_subscribers(&self) -> usize {
        self.registry().values().map(HashMap::len).sum()
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcaster")
            .field("namespaces", &self.namespace_count())
            .field("inbox_capacity", &self.inbox_capacity)
            .finish()
    }
}

/// Handle for one registered subscriber.
///
/// Dropping it deregisters the subscriber.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    namespace: String,
    inbox: mpsc::Receiver<i64>,
    broadcaster: Arc<Broadcaster>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Wait for the next version notification.
    ///
    /// Returns `None` once the subscriber has been deregistered and its
    /// inbox drained.
    pub async fn recv(&mut self) -> Option<i64> {
        self.inbox.recv().await
    }

    /// Take a pending notification without waiting.
    pub fn try_recv(&mut self) -> Option<i64> {
        self.inbox.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.broadcaster.unsubscribe(&self.namespace, self.id);
    }
}
