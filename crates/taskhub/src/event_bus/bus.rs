use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};

use super::types::{Channel, Envelope, Filter, ListenerControl, ListenerToken};

type Listener = Arc<dyn Fn(&Envelope) -> ListenerControl + Send + Sync>;

struct Registration {
    filter: Filter,
    listener: Listener,
}

/// Listener ids are monotonic, so each channel's map iterates in registration order.
type Registry = HashMap<Channel, BTreeMap<u64, Arc<Registration>>>;

struct Shared {
    registry: Mutex<Registry>,
    next_listener: AtomicU64,
    next_cursor: AtomicU64,
}

enum Command {
    Dispatch { channel: Channel, envelope: Envelope },
    Flush(oneshot::Sender<()>),
}

/// In-memory publish-subscribe bus.
///
/// Cloning is cheap; every clone shares the same registry and dispatcher.
/// Envelopes are delivered on a bus-owned Tokio task, one envelope at a time,
/// so fan-out for a single envelope never interleaves with another.
#[derive(Clone)]
pub struct EventBus {
    shared: Arc<Shared>,
    commands: mpsc::UnboundedSender<Command>,
}

impl EventBus {
    /// Create a bus and spawn its dispatcher. Must be called inside a Tokio runtime.
    pub fn new() -> Self {
        let shared = Arc::new(Shared {
            registry: Mutex::new(HashMap::new()),
            next_listener: AtomicU64::new(1),
            next_cursor: AtomicU64::new(1),
        });
        let (commands, rx) = mpsc::unbounded_channel();

        tokio::spawn(run_dispatcher(shared.clone(), rx));

        Self { shared, commands }
    }

    /// Register a listener for every later envelope on `channel` matching `filter`.
    pub fn listen<F>(&self, channel: impl Into<Channel>, filter: Filter, listener: F) -> ListenerToken
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        self.listen_until(channel, filter, move |envelope| {
            listener(envelope);
            ListenerControl::Keep
        })
    }

    /// Like [`listen`](Self::listen), but the listener removes itself by
    /// returning [`ListenerControl::Remove`]. Removal happens before the next
    /// envelope is delivered.
    pub fn listen_until<F>(&self, channel: impl Into<Channel>, filter: Filter, listener: F) -> ListenerToken
    where
        F: Fn(&Envelope) -> ListenerControl + Send + Sync + 'static,
    {
        let channel = channel.into();
        let id = self.shared.next_listener.fetch_add(1, Ordering::Relaxed);
        let registration = Arc::new(Registration {
            filter,
            listener: Arc::new(listener),
        });

        if let Ok(mut registry) = self.shared.registry.lock() {
            registry
                .entry(channel.clone())
                .or_default()
                .insert(id, registration);
        }
        tracing::trace!(channel = %channel, listener = id, "listener registered");

        ListenerToken { channel, id }
    }

    /// Remove a listener. Unknown or already-removed tokens are ignored.
    pub fn remove_listener(&self, token: &ListenerToken) -> bool {
        self.shared.remove(&token.channel, token.id)
    }

    pub fn listener_count(&self, channel: impl Into<Channel>) -> usize {
        let channel = channel.into();
        self.shared
            .registry
            .lock()
            .map(|registry| registry.get(&channel).map_or(0, BTreeMap::len))
            .unwrap_or(0)
    }

    /// Queue an envelope for delivery to the channel's matching listeners.
    ///
    /// Envelopes are delivered in the order they were dispatched; the cursor
    /// is assigned at delivery.
    pub fn dispatch(&self, channel: impl Into<Channel>, envelope: Envelope) {
        let channel = channel.into();
        if self
            .commands
            .send(Command::Dispatch { channel, envelope })
            .is_err()
        {
            tracing::warn!("event bus dispatcher stopped, envelope dropped");
        }
    }

    /// Wait until every envelope dispatched before this call has been delivered.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

impl Shared {
    fn remove(&self, channel: &Channel, id: u64) -> bool {
        let Ok(mut registry) = self.registry.lock() else {
            return false;
        };
        let Some(listeners) = registry.get_mut(channel) else {
            return false;
        };
        let removed = listeners.remove(&id).is_some();
        if listeners.is_empty() {
            registry.remove(channel);
        }
        if removed {
            tracing::trace!(channel = %channel, listener = id, "listener removed");
        }
        removed
    }

    fn is_registered(&self, channel: &Channel, id: u64) -> bool {
        self.registry
            .lock()
            .map(|registry| registry.get(channel).is_some_and(|l| l.contains_key(&id)))
            .unwrap_or(false)
    }

    fn deliver(&self, channel: &Channel, envelope: &Envelope) {
        // Snapshot so listeners may register or remove listeners without deadlocking.
        let snapshot: Vec<(u64, Arc<Registration>)> = match self.registry.lock() {
            Ok(registry) => registry
                .get(channel)
                .map(|listeners| listeners.iter().map(|(id, r)| (*id, r.clone())).collect())
                .unwrap_or_default(),
            Err(_) => return,
        };

        for (id, registration) in snapshot {
            // An earlier listener in this fan-out may have removed this one.
            if !self.is_registered(channel, id) {
                continue;
            }

            // Filters are user code too and run under the same isolation.
            let delivered = catch_unwind(AssertUnwindSafe(|| {
                registration
                    .filter
                    .matches(envelope)
                    .then(|| (registration.listener)(envelope))
            }));
            match delivered {
                Ok(None) | Ok(Some(ListenerControl::Keep)) => {}
                Ok(Some(ListenerControl::Remove)) => {
                    self.remove(channel, id);
                }
                Err(_) => {
                    tracing::error!(
                        channel = %channel,
                        listener = id,
                        cursor = envelope.cursor,
                        event_name = %envelope.event_name,
                        "listener panicked, continuing delivery"
                    );
                }
            }
        }
    }
}

async fn run_dispatcher(shared: Arc<Shared>, mut rx: mpsc::UnboundedReceiver<Command>) {
    tracing::debug!("event bus dispatcher started");

    while let Some(command) = rx.recv().await {
        match command {
            Command::Dispatch { channel, mut envelope } => {
                envelope.cursor = shared.next_cursor.fetch_add(1, Ordering::Relaxed);
                shared.deliver(&channel, &envelope);
            }
            Command::Flush(done) => {
                let _ = done.send(());
            }
        }
    }

    tracing::debug!("event bus dispatcher stopped");
}
