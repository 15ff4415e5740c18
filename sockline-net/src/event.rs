//! Event registration and dispatch.
//!
//! Each [`EventRegistry`] is served by one background task that exclusively owns the listener list.
//! Attaching, detaching and emitting are messages to that task, so listeners run in attach order
//! and never race a concurrent (un)subscription.

use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

type Listener<T> = Box<dyn FnMut(&T) + Send>;

/// Operations sent to the dispatch task.
enum Command<T> {
    Attach { id: u64, listener: Listener<T> },
    Detach { id: u64 },
    Emit(T),
}

/// An ordered set of listeners for events of type `T`.
///
/// The dispatch task is spawned on the first subscription, which must happen inside a Tokio
/// runtime. Events emitted before anyone subscribed are dropped.
pub struct EventRegistry<T> {
    command_tx: OnceLock<mpsc::UnboundedSender<Command<T>>>,
    next_id: AtomicU64,
}

impl<T> std::fmt::Debug for EventRegistry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRegistry")
            .field("active", &self.command_tx.get().is_some())
            .finish()
    }
}

impl<T> Default for EventRegistry<T> {
    fn default() -> Self {
        Self {
            command_tx: OnceLock::new(),
            next_id: AtomicU64::new(0),
        }
    }
}

impl<T: Send + 'static> EventRegistry<T> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self) -> &mpsc::UnboundedSender<Command<T>> {
        self.command_tx.get_or_init(|| {
            let (command_tx, command_rx) = mpsc::unbounded_channel();
            tokio::spawn(Dispatcher::new(command_rx).run());
            command_tx
        })
    }

    /// Attaches `listener`, returning the token that detaches it again.
    pub fn subscribe(&self, listener: impl FnMut(&T) + Send + 'static) -> Subscription<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let command_tx = self.sender().clone();
        // The dispatcher only exits once every sender is gone, we hold one.
        let _ = command_tx.send(Command::Attach {
            id,
            listener: Box::new(listener),
        });
        Subscription { id, command_tx }
    }

    /// Delivers `event` to every attached listener, in attach order.
    pub fn emit(&self, event: T) {
        let Some(command_tx) = self.command_tx.get() else {
            return;
        };
        let _ = command_tx.send(Command::Emit(event));
    }
}

/// Token for one attached listener.
///
/// Dropping the token leaves the listener attached, use [`Subscription::detach`] to remove it.
pub struct Subscription<T> {
    id: u64,
    command_tx: mpsc::UnboundedSender<Command<T>>,
}

impl<T> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

impl<T> Subscription<T> {
    /// Identifier of the listener within its registry.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Detaches the listener; events emitted afterwards are not delivered to it.
    ///
    /// Returns `false` if the dispatch task has already stopped.
    pub fn detach(self) -> bool {
        self.command_tx
            .send(Command::Detach { id: self.id })
            .is_ok()
    }
}

/// The dispatch task state, owning the listeners.
struct Dispatcher<T> {
    command_rx: mpsc::UnboundedReceiver<Command<T>>,
    listeners: BTreeMap<u64, Listener<T>>,
}

impl<T> Dispatcher<T> {
    fn new(command_rx: mpsc::UnboundedReceiver<Command<T>>) -> Self {
        Self {
            command_rx,
            listeners: BTreeMap::new(),
        }
    }

    async fn run(mut self) {
        while let Some(command) = self.command_rx.recv().await {
            match command {
                Command::Attach { id, listener } => {
                    self.listeners.insert(id, listener);
                }
                Command::Detach { id } => {
                    self.listeners.remove(&id);
                }
                Command::Emit(event) => {
                    for listener in self.listeners.values_mut() {
                        listener(&event);
                    }
                }
            }
        }
    }
}
