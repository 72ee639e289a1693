//! A Redis replication client: speaks the replica side of the handshake
//! and `PSYNC`, decodes the RDB snapshot and the streamed command feed,
//! and surfaces both as typed events to registered listeners.
//!
//! ```no_run
//! use redis_replica_stream::{Configuration, Replicator};
//!
//! # async fn run() {
//! let config = Configuration::builder("127.0.0.1", 6379).build().unwrap();
//! let replicator = Replicator::new(config);
//! replicator.open();
//! # }
//! ```

pub mod client;
pub mod command;
pub mod config;
pub mod error;
pub mod event;
pub mod handshake;
pub mod heartbeat;
pub mod rate_limiter;
pub mod rdb;
pub mod resp;
pub mod retrier;
pub mod session;
pub mod sync;
pub mod wire;

pub use client::Replicator;
pub use config::{ConfigBuilder, Configuration, ReplFilter};
pub use error::{ReplicationError, Result};
pub use event::{CommandEvent, Event, EventListener, ExceptionListener, RawByteListener, RdbKeyEvent};
pub use session::{ReplicationSession, SessionStatus};
