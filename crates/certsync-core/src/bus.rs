// # Change Event Bus
//
// Synchronous, typed publish/subscribe fan-out.
//
// ## Delivery Rules
//
// - `publish` runs every listener on the caller's task, in registration order
// - A panicking listener is logged and skipped; later listeners still run
// - `Subscription::dispose` removes a listener; it is idempotent and may be
//   called from inside a listener (takes effect from the next publish)
//
// Listeners run on the polling task, so long blocking work in a listener
// delays the next poll. Async consumers should use `subscribe_stream`.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::task::{Context, Poll};

use tokio::sync::mpsc;
use tokio_stream::Stream;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::error;

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Registry<E> {
    listeners: RwLock<Vec<(u64, Listener<E>)>>,
    next_id: AtomicU64,
}

impl<E> Registry<E> {
    fn remove(&self, id: u64) {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        listeners.retain(|(listener_id, _)| *listener_id != id);
    }
}

/// Typed listener registry
pub struct ChangeEventBus<E> {
    registry: Arc<Registry<E>>,
}

impl<E> Clone for ChangeEventBus<E> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
        }
    }
}

impl<E> Default for ChangeEventBus<E> {
    fn default() -> Self {
        Self {
            registry: Arc::new(Registry {
                listeners: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }
}

impl<E: 'static> ChangeEventBus<E> {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener
    ///
    /// The listener stays registered until the returned handle is disposed.
    /// Dropping the handle without disposing keeps the listener.
    pub fn register<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.registry.next_id.fetch_add(1, Ordering::SeqCst);
        self.registry
            .listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(listener)));

        let registry: Weak<Registry<E>> = Arc::downgrade(&self.registry);
        Subscription {
            remove: Mutex::new(Some(Box::new(move || {
                if let Some(registry) = registry.upgrade() {
                    registry.remove(id);
                }
            }))),
        }
    }

    /// Deliver `event` to every listener registered at call time
    ///
    /// # Returns
    ///
    /// Number of listeners that completed without panicking
    pub fn publish(&self, event: &E) -> usize {
        let snapshot: Vec<(u64, Listener<E>)> = self
            .registry
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let mut delivered = 0;
        for (id, listener) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(()) => delivered += 1,
                Err(panic) => {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    error!("Change listener {} panicked: {}", id, message);
                }
            }
        }
        delivered
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.registry
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl<E: Clone + Send + 'static> ChangeEventBus<E> {
    /// Receive events as an async stream
    ///
    /// The listener is removed when the stream is dropped.
    pub fn subscribe_stream(&self) -> EventStream<E> {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.register(move |event: &E| {
            // Receiver gone: the stream's drop removes this listener
            let _ = tx.send(event.clone());
        });
        EventStream {
            inner: UnboundedReceiverStream::new(rx),
            subscription,
        }
    }
}

impl<E> std::fmt::Debug for ChangeEventBus<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self
            .registry
            .listeners
            .read()
            .map(|l| l.len())
            .unwrap_or_default();
        f.debug_struct("ChangeEventBus")
            .field("listeners", &count)
            .finish()
    }
}

/// Handle that removes its listener on `dispose`
pub struct Subscription {
    remove: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Subscription {
    /// Remove the listener; later calls do nothing
    pub fn dispose(&self) {
        let remove = self
            .remove
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(remove) = remove {
            remove();
        }
    }

    /// Whether `dispose` has been called
    pub fn is_disposed(&self) -> bool {
        self.remove
            .lock()
            .map(|r| r.is_none())
            .unwrap_or(true)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Stream of published events; unsubscribes on drop
pub struct EventStream<E> {
    inner: UnboundedReceiverStream<E>,
    subscription: Subscription,
}

impl<E> Stream for EventStream<E> {
    type Item = E;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<E>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl<E> Drop for EventStream<E> {
    fn drop(&mut self) {
        self.subscription.dispose();
    }
}
