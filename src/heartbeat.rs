//! The periodic ACK scheduler: a fixed-delay timer that reports this
//! replica's acknowledged offset to the primary, independent of whatever
//! the reader is doing.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::sleep;

use crate::resp::encode;
use crate::wire::WriteHandle;

/// Handle the reader holds to stop the heartbeat before it tears the
/// socket down.
pub struct HeartbeatHandle {
    stop: watch::Sender<bool>,
}

impl HeartbeatHandle {
    pub fn stop(&self) {
        let _ = self.stop.send(true);
    }
}

/// Spawns the heartbeat task. `offset` is shared with the reader, which is
/// the only other writer of replication offset; the heartbeat only reads
/// it.
pub fn start(writer: WriteHandle, offset: Arc<AtomicI64>, period: std::time::Duration) -> HeartbeatHandle {
    let (stop_tx, mut stop_rx) = watch::channel(false);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sleep(period) => {}
                _ = stop_rx.changed() => break,
            }

            if *stop_rx.borrow() {
                break;
            }

            let current = offset.load(Ordering::SeqCst);
            tracing::debug!(offset = current, "heartbeat:tick");
            // Best-effort: a write failure here is swallowed, the reader
            // will observe the same broken socket on its next read.
            let _ = writer.write_frame(encode::replconf_ack(current)).await;
        }
    });

    HeartbeatHandle { stop: stop_tx }
}
