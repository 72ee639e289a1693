use thiserror::Error;

/// Public error type surfaced to exception listeners and to callers of
/// [`crate::client::Replicator::open`]. Internal plumbing (the wire reader,
/// the RESP parser, the RDB decoder) works in `anyhow::Result` and is
/// converted into one of these variants at the point the reader either
/// retries or gives up, matching the split the original handshake code drew
/// between "decoding detail" and "what the retrier needs to know".
#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("transport error: {0}")]
    Transport(#[source] anyhow::Error),

    #[error("protocol error: {0}")]
    Protocol(#[source] anyhow::Error),

    #[error("RDB sync failed, primary reported: {0}")]
    SyncFailure(String),

    #[error("primary reported a recoverable condition: {0}")]
    Recoverable(String),

    #[error("authentication failed: {0}")]
    AuthFailure(String),

    #[error("replication session was closed manually")]
    Cancelled,
}

impl ReplicationError {
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Recoverable(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn transport(err: impl Into<anyhow::Error>) -> Self {
        Self::Transport(err.into())
    }

    pub fn protocol(err: impl Into<anyhow::Error>) -> Self {
        Self::Protocol(err.into())
    }
}

pub type Result<T> = std::result::Result<T, ReplicationError>;
