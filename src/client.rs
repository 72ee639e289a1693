//! The public API: `Replicator::open`/`close`, the listener registration
//! surface, and `register_command_parser`. Composes session + retrier +
//! event bus behind one handle a caller can hold across reconnects.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::command::{CommandParser, CommandRegistry};
use crate::config::Configuration;
use crate::event::{EventListener, EventBus, ExceptionListener, RawByteListener, SharedEventBus, TracingExceptionListener};
use crate::session::ReplicationSession;

/// A running (or not-yet-started) replication client. Listener
/// registration is safe to call both before `open` and while connected —
/// the event bus is shared with whatever task is currently driving the
/// socket.
pub struct Replicator {
    config: Configuration,
    events: SharedEventBus,
    registry: Arc<std::sync::Mutex<CommandRegistry>>,
    manual_close: Arc<AtomicBool>,
    task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Replicator {
    pub fn new(config: Configuration) -> Self {
        let events = EventBus::shared();
        if config.use_default_exception_listener {
            events
                .lock()
                .unwrap()
                .add_exception_listener(Arc::new(TracingExceptionListener));
        }

        Self {
            config,
            events,
            registry: Arc::new(std::sync::Mutex::new(CommandRegistry::new())),
            manual_close: Arc::new(AtomicBool::new(false)),
            task: std::sync::Mutex::new(None),
        }
    }

    pub fn add_event_listener(&self, listener: Arc<dyn EventListener>) {
        self.events.lock().unwrap().add_event_listener(listener);
    }

    pub fn remove_event_listener(&self, listener: &Arc<dyn EventListener>) {
        self.events.lock().unwrap().remove_event_listener(listener);
    }

    pub fn add_exception_listener(&self, listener: Arc<dyn ExceptionListener>) {
        self.events.lock().unwrap().add_exception_listener(listener);
    }

    pub fn add_raw_byte_listener(&self, listener: Arc<dyn RawByteListener>) {
        self.events.lock().unwrap().add_raw_byte_listener(listener);
    }

    pub fn remove_raw_byte_listener(&self, listener: &Arc<dyn RawByteListener>) {
        self.events.lock().unwrap().remove_raw_byte_listener(listener);
    }

    pub fn register_command_parser(&self, parser: Arc<dyn CommandParser>) {
        self.registry.lock().unwrap().register(parser);
    }

    pub fn is_manual_closed(&self) -> bool {
        self.manual_close.load(Ordering::SeqCst)
    }

    /// Starts (or restarts) the retry-driven connection loop as a
    /// background task. Returns immediately; replication progress is
    /// observed through registered listeners.
    pub fn open(&self) {
        self.manual_close.store(false, Ordering::SeqCst);

        let config = self.config.clone();
        let events = self.events.clone();
        let manual_close = self.manual_close.clone();
        let registry_snapshot = clone_registry_handle(&self.registry);

        let mut session = ReplicationSession::new(&config);

        let handle = tokio::spawn(async move {
            crate::retrier::run(config, &mut session, events, registry_snapshot, manual_close).await;
        });

        let previous = self.task.lock().unwrap().replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Requests a clean shutdown. The retrier observes the flag at the next
    /// safe point (before reconnecting, or inside the command loop) and
    /// stops without reporting a `Cancelled` error to exception listeners.
    pub async fn close(&self) {
        self.manual_close.store(true, Ordering::SeqCst);
        let handle = self.task.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// The retry loop only needs a read-only snapshot of whatever parsers were
/// registered before `open()`, since registering new parsers mid-flight
/// isn't part of the documented contract.
fn clone_registry_handle(registry: &Arc<std::sync::Mutex<CommandRegistry>>) -> CommandRegistry {
    registry.lock().unwrap().clone()
}
