//! `SyncFsm`: sends `PSYNC`, interprets the reply, drives [`crate::rdb`]
//! when a snapshot is due, then runs the command-stream loop that tracks
//! `replOffset` and fans parsed commands out through the event bus.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::command::CommandRegistry;
use crate::config::Configuration;
use crate::error::{ReplicationError, Result};
use crate::event::{CommandEvent, Event, SharedEventBus};
use crate::heartbeat::{self, HeartbeatHandle};
use crate::rdb;
use crate::resp::{encode, RespValue};
use crate::session::ReplicationSession;
use crate::wire::WireIo;

/// What the retrier should do once [`run`] returns successfully. The only
/// other outcome is an `Err`, where `ReplicationError::Recoverable` carries
/// the `NOMASTERLINK`/`LOADING` soft-retry case: skip the RDB phase, retry,
/// never treated as a fault.
pub enum SyncOutcome {
    /// The command loop ran to completion without an error. In practice
    /// this is only reachable on a manual close; a graceful exit of the
    /// loop while still connected is not something a primary triggers.
    Closed,
}

/// How this attempt entered the command stream. The heartbeat and the
/// `REPLCONF GETACK` auto-ack only apply to a `PSYNC` session
/// (`FULLRESYNC`/`CONTINUE`); a primary old enough to fall back to legacy
/// `SYNC` never sends `GETACK` and has no use for unsolicited `ACK`s.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncMode {
    Psync,
    LegacySync,
}

async fn send_psync(wire: &mut WireIo, session: &ReplicationSession) -> Result<String> {
    let offset = if session.repl_offset < 0 {
        -1
    } else {
        session.repl_offset + 1
    };

    wire.write_frame(encode::psync(&session.repl_id, offset))
        .await
        .map_err(ReplicationError::transport)?;

    match wire.read_value().await.map_err(ReplicationError::transport)? {
        RespValue::SimpleString(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        other => Err(ReplicationError::protocol(anyhow::anyhow!(
            "expected a simple-string PSYNC reply, got {other:?}"
        ))),
    }
}

async fn send_sync(wire: &mut WireIo) -> Result<()> {
    wire.write_frame(encode::sync()).await.map_err(ReplicationError::transport)
}

/// Runs one full sync + command-loop attempt. Returns only when the
/// connection ends: a manual close, a transport/protocol error, or
/// `Err(ReplicationError::Recoverable)` for `NOMASTERLINK`/`LOADING`,
/// which the retrier treats as a soft retry rather than a fault.
pub async fn run(
    wire: &mut WireIo,
    session: &mut ReplicationSession,
    config: &Configuration,
    events: &SharedEventBus,
    registry: &CommandRegistry,
    manual_close: &Arc<std::sync::atomic::AtomicBool>,
) -> Result<SyncOutcome> {
    let reply = send_psync(wire, session).await?;
    let mode;

    if let Some(rest) = reply.strip_prefix("FULLRESYNC ") {
        let mut parts = rest.split_ascii_whitespace();
        let id = parts
            .next()
            .ok_or_else(|| ReplicationError::protocol(anyhow::anyhow!("FULLRESYNC missing replId")))?
            .to_string();
        let off: i64 = parts
            .next()
            .ok_or_else(|| ReplicationError::protocol(anyhow::anyhow!("FULLRESYNC missing offset")))?
            .parse()
            .map_err(|err| ReplicationError::protocol(anyhow::anyhow!("FULLRESYNC offset: {err}")))?;

        tracing::info!(repl_id = %id, repl_offset = off, "sync:fullresync");
        session.current_db = -1;
        session.adopt_full_resync(id, off);
        drive_rdb(wire, session, config, events).await?;
        mode = SyncMode::Psync;
    } else if reply.eq_ignore_ascii_case("CONTINUE") || reply.to_ascii_uppercase().starts_with("CONTINUE ") {
        let new_id = reply
            .split_ascii_whitespace()
            .nth(1)
            .map(ToString::to_string);
        tracing::info!(repl_id = ?new_id, "sync:continue");
        session.adopt_continue(new_id);
        mode = SyncMode::Psync;
    } else if reply.eq_ignore_ascii_case("NOMASTERLINK") || reply.eq_ignore_ascii_case("LOADING") {
        tracing::debug!(reply = %reply, "sync:retry-later");
        return Err(ReplicationError::Recoverable(reply));
    } else {
        tracing::warn!(reply = %reply, "unrecognized PSYNC reply, falling back to legacy SYNC");
        send_sync(wire).await?;
        session.current_db = -1;
        drive_rdb(wire, session, config, events).await?;
        mode = SyncMode::LegacySync;
    }

    run_command_loop(wire, session, config, events, registry, manual_close, mode).await
}

async fn drive_rdb(wire: &mut WireIo, _session: &ReplicationSession, config: &Configuration, events: &SharedEventBus) -> Result<()> {
    let bulk_len = wire.read_bulk_header().await.map_err(ReplicationError::transport)?;
    tracing::debug!(bulk_len, "sync:rdb-header");
    rdb::stream(wire, events, bulk_len, config.discard_rdb).await
}

async fn run_command_loop(
    wire: &mut WireIo,
    session: &mut ReplicationSession,
    config: &Configuration,
    events: &SharedEventBus,
    registry: &CommandRegistry,
    manual_close: &Arc<std::sync::atomic::AtomicBool>,
    mode: SyncMode,
) -> Result<SyncOutcome> {
    session.status = crate::session::SessionStatus::Connected;
    events.lock().unwrap().dispatch(Event::PreCommandSync);

    if session.current_db != -1 {
        let select = encode::command(&[b"SELECT", session.current_db.to_string().as_bytes()]);
        emit_synthetic_select(events, session.current_db, select.len());
    }

    let offset_cell = Arc::new(AtomicI64::new(session.repl_offset));
    let heartbeat: Option<HeartbeatHandle> = if mode == SyncMode::Psync {
        Some(heartbeat::start(wire.writer(), offset_cell.clone(), config.heartbeat_period))
    } else {
        None
    };

    let result = command_loop_body(wire, session, config, events, registry, &offset_cell, manual_close, mode).await;

    if let Some(heartbeat) = heartbeat {
        heartbeat.stop();
    }
    session.repl_offset = offset_cell.load(Ordering::SeqCst);

    match result {
        Ok(()) => {
            events.lock().unwrap().dispatch(Event::PostCommandSync);
            Ok(SyncOutcome::Closed)
        }
        Err(err) => Err(err),
    }
}

fn emit_synthetic_select(events: &SharedEventBus, db: i64, _frame_len: usize) {
    events.lock().unwrap().dispatch(Event::Command(CommandEvent {
        name: "SELECT".to_string(),
        args: vec![Bytes::from(db.to_string().into_bytes())],
        offset_range: (0, 0),
    }));
}

async fn command_loop_body(
    wire: &mut WireIo,
    session: &mut ReplicationSession,
    config: &Configuration,
    events: &SharedEventBus,
    registry: &CommandRegistry,
    offset_cell: &Arc<AtomicI64>,
    manual_close: &Arc<std::sync::atomic::AtomicBool>,
    mode: SyncMode,
) -> Result<()> {
    loop {
        if manual_close.load(Ordering::SeqCst) {
            session.manual_close = true;
            session.status = crate::session::SessionStatus::Disconnecting;
            return Err(ReplicationError::Cancelled);
        }

        let (value, frame_len) = wire.read_value_counted().await.map_err(ReplicationError::transport)?;
        let start = offset_cell.load(Ordering::SeqCst);
        let end = start + frame_len as i64;

        let array = value.into_array().ok_or_else(|| {
            ReplicationError::protocol(anyhow::anyhow!("command stream frame was not an array"))
        })?;

        let args: Vec<Bytes> = array
            .into_iter()
            .map(|v| v.into_bulk_string().unwrap_or_default())
            .collect();

        match registry.parse(&args) {
            Ok(parsed) if parsed.name == "REPLCONF" && parsed.args.first().map(|a| a.eq_ignore_ascii_case(b"GETACK")).unwrap_or(false) => {
                if mode == SyncMode::Psync {
                    wire.write_frame(encode::replconf_ack(start)).await.map_err(ReplicationError::transport)?;
                    if config.verbose {
                        tracing::debug!(offset = start, "command:getack");
                    }
                }
            }
            Ok(parsed) if parsed.name == "SELECT" => {
                if let Some(db_arg) = parsed.args.first() {
                    if let Ok(db) = std::str::from_utf8(db_arg).unwrap_or_default().parse::<i64>() {
                        session.current_db = db;
                    }
                }

                events.lock().unwrap().dispatch(Event::Command(CommandEvent {
                    name: parsed.name,
                    args: parsed.args,
                    offset_range: (start, end),
                }));
            }
            Ok(parsed) => {
                if config.verbose {
                    tracing::debug!(command = %parsed.name, start, end, "command:apply");
                }
                events.lock().unwrap().dispatch(Event::Command(CommandEvent {
                    name: parsed.name,
                    args: parsed.args,
                    offset_range: (start, end),
                }));
            }
            Err(err) => {
                tracing::warn!(error = %err, "unrecognized command in replication stream, skipping");
            }
        }

        offset_cell.store(end, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingListener(AtomicUsize);

    impl crate::event::EventListener for CountingListener {
        fn on_event(&self, event: &Event) {
            if let Event::Command(cmd) = event {
                assert_eq!(cmd.name, "SELECT");
            } else {
                panic!("expected a SELECT command event, got {event:?}");
            }
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn synthetic_select_dispatches_a_select_command_event() {
        let bus = crate::event::EventBus::shared();
        let listener = std::sync::Arc::new(CountingListener(AtomicUsize::new(0)));
        bus.lock().unwrap().add_event_listener(listener.clone());

        emit_synthetic_select(&bus, 3, 0);

        assert_eq!(listener.0.load(Ordering::SeqCst), 1);
    }
}
