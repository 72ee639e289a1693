//! The downstream contract: typed events, and the fan-out bus that delivers
//! them (plus raw bytes and exceptions) to registered listeners in wire
//! order, synchronously on the reader task.

use std::fmt;
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::error::ReplicationError;

/// One decoded RDB value. Only the plain string type is decoded by this
/// crate's built-in opcode table (see [`crate::rdb`]); anything else is
/// surfaced as [`Event::RdbUnsupportedValue`] so a snapshot with, say, a
/// hash or a stream in it still drains cleanly instead of aborting sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RdbKeyEvent {
    pub db: u32,
    pub key: Bytes,
    pub value: Bytes,
    /// Milliseconds since the epoch, if the key carries an expiry.
    pub expiry_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandEvent {
    pub name: String,
    pub args: Vec<Bytes>,
    pub offset_range: (i64, i64),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    RdbKey(RdbKeyEvent),
    RdbUnsupportedValue { db: u32, key: Bytes, type_code: u8 },
    PreCommandSync,
    Command(CommandEvent),
    PostCommandSync,
}

pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &Event);
}

pub trait ExceptionListener: Send + Sync {
    fn on_exception(&self, error: &ReplicationError);
}

pub trait RawByteListener: Send + Sync {
    fn on_bytes(&self, bytes: &[u8]);
}

/// A logger-backed exception listener, auto-registered when
/// `Configuration.use_default_exception_listener` is set.
pub struct TracingExceptionListener;

impl ExceptionListener for TracingExceptionListener {
    fn on_exception(&self, error: &ReplicationError) {
        tracing::error!(error = %error, "replication session raised an exception");
    }
}

impl fmt::Debug for dyn EventListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("EventListener")
    }
}

/// Ordered fan-out to listeners registered via
/// [`crate::client::Replicator::add_event_listener`] and friends. FIFO
/// registration, synchronous dispatch from the reader task only.
#[derive(Default)]
pub struct EventBus {
    event_listeners: Vec<Arc<dyn EventListener>>,
    exception_listeners: Vec<Arc<dyn ExceptionListener>>,
    raw_byte_listeners: Vec<Arc<dyn RawByteListener>>,
}

/// Shared handle used by [`crate::wire::WireIo`] to dispatch raw bytes and
/// by the reader/sync loop to dispatch events, while
/// [`crate::client::Replicator`]'s public add/remove methods mutate the same
/// bus from whatever task calls them. Locked only across synchronous
/// dispatch, never across an `.await`.
pub type SharedEventBus = Arc<Mutex<EventBus>>;

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedEventBus {
        Arc::new(Mutex::new(Self::default()))
    }

    pub fn add_event_listener(&mut self, listener: Arc<dyn EventListener>) {
        self.event_listeners.push(listener);
    }

    pub fn remove_event_listener(&mut self, listener: &Arc<dyn EventListener>) {
        self.event_listeners
            .retain(|existing| !Arc::ptr_eq(existing, listener));
    }

    pub fn add_exception_listener(&mut self, listener: Arc<dyn ExceptionListener>) {
        self.exception_listeners.push(listener);
    }

    pub fn add_raw_byte_listener(&mut self, listener: Arc<dyn RawByteListener>) {
        self.raw_byte_listeners.push(listener);
    }

    pub fn remove_raw_byte_listener(&mut self, listener: &Arc<dyn RawByteListener>) {
        self.raw_byte_listeners
            .retain(|existing| !Arc::ptr_eq(existing, listener));
    }

    pub fn clear_raw_byte_listeners(&mut self) {
        self.raw_byte_listeners.clear();
    }

    pub fn dispatch(&self, event: Event) {
        for listener in &self.event_listeners {
            listener.on_event(&event);
        }
    }

    pub fn dispatch_exception(&self, error: &ReplicationError) {
        for listener in &self.exception_listeners {
            listener.on_exception(error);
        }
    }

    pub fn dispatch_raw_bytes(&self, bytes: &[u8]) {
        if self.raw_byte_listeners.is_empty() {
            return;
        }

        for listener in &self.raw_byte_listeners {
            listener.on_bytes(bytes);
        }
    }
}
