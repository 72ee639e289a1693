//! The reconnect loop: tells manual close apart from transport failure,
//! backs off with jitter between attempts, and preserves `(replId,
//! replOffset)` across them so `PSYNC` can ask for a partial resync.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::net::TcpStream;

use crate::command::CommandRegistry;
use crate::config::Configuration;
use crate::error::{ReplicationError, Result};
use crate::event::SharedEventBus;
use crate::session::{ReplicationSession, SessionStatus};
use crate::sync::SyncOutcome;
use crate::wire::WireIo;

const BASE_BACKOFF: Duration = Duration::from_millis(500);

fn backoff_with_jitter() -> Duration {
    let jitter_frac: f64 = rand::thread_rng().gen_range(0.0..1.0);
    BASE_BACKOFF + BASE_BACKOFF.mul_f64(jitter_frac)
}

/// Runs the retry loop until the session is manually closed or a
/// non-retryable error is hit.
pub async fn run(
    config: Configuration,
    session: &mut ReplicationSession,
    events: SharedEventBus,
    registry: CommandRegistry,
    manual_close: Arc<AtomicBool>,
) {
    let mut attempt: u32 = 0;

    loop {
        if manual_close.load(Ordering::SeqCst) {
            session.status = SessionStatus::Disconnected;
            return;
        }

        attempt += 1;
        session.status = SessionStatus::Connecting;
        tracing::info!(host = %config.host, port = config.port, attempt, "retry:connecting");

        match connect_and_sync(&config, session, &events, &registry, &manual_close).await {
            Ok(SyncOutcome::Closed) => {
                session.status = SessionStatus::Disconnected;
                return;
            }
            Err(err) if err.is_recoverable() => {
                tracing::debug!(attempt, reply = %err, "retry:sync-later");
            }
            Err(err) if err.is_cancelled() => {
                session.status = SessionStatus::Disconnected;
                return;
            }
            Err(err) if matches!(err, ReplicationError::AuthFailure(_)) => {
                tracing::error!(error = %err, "retry:fatal-auth-failure");
                events.lock().unwrap().dispatch_exception(&err);
                session.status = SessionStatus::Disconnected;
                return;
            }
            Err(err) => {
                tracing::error!(error = %err, attempt, "retry:transport-error");
                events.lock().unwrap().dispatch_exception(&err);
            }
        }

        session.status = SessionStatus::Disconnected;

        if manual_close.load(Ordering::SeqCst) {
            return;
        }

        let delay = backoff_with_jitter();
        tracing::debug!(?delay, attempt, "retry:backoff");
        tokio::time::sleep(delay).await;
    }
}

async fn connect_and_sync(
    config: &Configuration,
    session: &mut ReplicationSession,
    events: &SharedEventBus,
    registry: &CommandRegistry,
    manual_close: &Arc<AtomicBool>,
) -> Result<SyncOutcome> {
    let addr = (config.host.as_str(), config.port);
    let stream = tokio::time::timeout(config.connection_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| ReplicationError::transport(anyhow::anyhow!("connection timed out")))?
        .map_err(ReplicationError::transport)?;

    let local_addr = stream.local_addr().map_err(ReplicationError::transport)?;
    let local_port = local_addr.port();
    let local_ip = local_addr.ip().to_string();
    let (read_half, write_half) = stream.into_split();
    let (mut wire, _writer) = WireIo::new(read_half, write_half, config, events.clone());

    crate::handshake::run(&mut wire, config, local_port, &local_ip).await?;

    crate::sync::run(&mut wire, session, config, events, registry, manual_close).await
}
