//! Tunables for a [`crate::client::Replicator`] session, built through
//! [`ConfigBuilder`] so defaults stay centralized and invalid combinations
//! are rejected once, at `build()`, rather than scattered across call sites.

use std::time::Duration;

use crate::error::{ReplicationError, Result};

/// A `PSYNC`-style replication filter: `REPLCONF rdb-filter-only <arg>`
/// (database filters) or a module/key filter, sent right before `PSYNC`.
/// Unrecognised by most primaries, which is fine — the handshake treats a
/// non-OK `REPLCONF` reply as a warning, not a fatal error.
#[derive(Debug, Clone)]
pub struct ReplFilter {
    pub keyword: &'static str,
    pub argument: String,
}

impl ReplFilter {
    pub fn rdb_filter_only(db_indexes: impl IntoIterator<Item = u32>) -> Self {
        let argument = db_indexes
            .into_iter()
            .map(|db| db.to_string())
            .collect::<Vec<_>>()
            .join(",");
        Self {
            keyword: "rdb-filter-only",
            argument,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Configuration {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub connection_timeout: Duration,
    pub heartbeat_period: Duration,
    /// Port advertised to the primary via `REPLCONF listening-port`; `0`
    /// means "use whatever local ephemeral port the outbound socket got".
    /// Distinct from `port`, which is the primary's own port.
    pub listening_port: u16,
    pub buffer_size: usize,
    /// Bytes of read-ahead to prefetch on a background task; `0` disables
    /// prefetching and reads happen inline on the reader task.
    pub async_cached_bytes: usize,
    /// Bytes/sec cap on how fast the wire layer hands data to the parser;
    /// `0` disables the limiter.
    pub rate_limit: u64,
    pub use_default_exception_listener: bool,
    pub discard_rdb: bool,
    pub verbose: bool,
    pub filters: Vec<ReplFilter>,
    /// `PSYNC` seed carried over from a prior run (e.g. a previous process's
    /// last observed replId), letting the first attempt in a fresh process
    /// ask for a partial resync instead of a full one. `"?"` means "no
    /// prior state".
    pub repl_id: String,
    /// `PSYNC` offset seed paired with `repl_id`; `-1` means "no prior
    /// state".
    pub repl_offset: i64,
}

impl Configuration {
    pub fn builder(host: impl Into<String>, port: u16) -> ConfigBuilder {
        ConfigBuilder::new(host, port)
    }
}

pub struct ConfigBuilder {
    host: String,
    port: u16,
    user: Option<String>,
    password: Option<String>,
    connection_timeout: Duration,
    heartbeat_period: Duration,
    listening_port: u16,
    buffer_size: usize,
    async_cached_bytes: usize,
    rate_limit: u64,
    use_default_exception_listener: bool,
    discard_rdb: bool,
    verbose: bool,
    filters: Vec<ReplFilter>,
    repl_id: String,
    repl_offset: i64,
}

impl ConfigBuilder {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            user: None,
            password: None,
            connection_timeout: Duration::from_secs(10),
            heartbeat_period: Duration::from_secs(1),
            listening_port: 0,
            buffer_size: 64 * 1024,
            async_cached_bytes: 0,
            rate_limit: 0,
            use_default_exception_listener: true,
            discard_rdb: false,
            verbose: false,
            filters: Vec::new(),
            repl_id: "?".to_string(),
            repl_offset: -1,
        }
    }

    pub fn auth(mut self, user: Option<impl Into<String>>, password: impl Into<String>) -> Self {
        self.user = user.map(Into::into);
        self.password = Some(password.into());
        self
    }

    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn heartbeat_period(mut self, period: Duration) -> Self {
        self.heartbeat_period = period;
        self
    }

    pub fn listening_port(mut self, port: u16) -> Self {
        self.listening_port = port;
        self
    }

    pub fn buffer_size(mut self, bytes: usize) -> Self {
        self.buffer_size = bytes;
        self
    }

    pub fn async_cached_bytes(mut self, bytes: usize) -> Self {
        self.async_cached_bytes = bytes;
        self
    }

    pub fn rate_limit(mut self, bytes_per_sec: u64) -> Self {
        self.rate_limit = bytes_per_sec;
        self
    }

    pub fn use_default_exception_listener(mut self, enabled: bool) -> Self {
        self.use_default_exception_listener = enabled;
        self
    }

    pub fn discard_rdb(mut self, discard: bool) -> Self {
        self.discard_rdb = discard;
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn filter(mut self, filter: ReplFilter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Seeds `PSYNC` with a replId/offset pair recovered from a previous
    /// run, so the first connection attempt can ask for a partial resync.
    pub fn resume_from(mut self, repl_id: impl Into<String>, repl_offset: i64) -> Self {
        self.repl_id = repl_id.into();
        self.repl_offset = repl_offset;
        self
    }

    pub fn build(self) -> Result<Configuration> {
        if self.host.trim().is_empty() {
            return Err(ReplicationError::protocol(anyhow::anyhow!(
                "host must not be empty"
            )));
        }

        if self.buffer_size == 0 {
            return Err(ReplicationError::protocol(anyhow::anyhow!(
                "buffer_size must be greater than zero"
            )));
        }

        if self.heartbeat_period.is_zero() {
            return Err(ReplicationError::protocol(anyhow::anyhow!(
                "heartbeat_period must be greater than zero"
            )));
        }

        Ok(Configuration {
            host: self.host,
            port: self.port,
            user: self.user,
            password: self.password,
            connection_timeout: self.connection_timeout,
            heartbeat_period: self.heartbeat_period,
            listening_port: self.listening_port,
            buffer_size: self.buffer_size,
            async_cached_bytes: self.async_cached_bytes,
            rate_limit: self.rate_limit,
            use_default_exception_listener: self.use_default_exception_listener,
            discard_rdb: self.discard_rdb,
            verbose: self.verbose,
            filters: self.filters,
            repl_id: self.repl_id,
            repl_offset: self.repl_offset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_host() {
        let result = Configuration::builder("  ", 6379).build();
        assert!(result.is_err());
    }

    #[test]
    fn builder_applies_documented_defaults() {
        let config = Configuration::builder("127.0.0.1", 6379).build().unwrap();
        assert_eq!(config.connection_timeout, Duration::from_secs(10));
        assert_eq!(config.heartbeat_period, Duration::from_secs(1));
        assert_eq!(config.buffer_size, 64 * 1024);
        assert_eq!(config.rate_limit, 0);
        assert!(config.use_default_exception_listener);
        assert_eq!(config.repl_id, "?");
        assert_eq!(config.repl_offset, -1);
    }

    #[test]
    fn resume_from_seeds_repl_id_and_offset() {
        let config = Configuration::builder("127.0.0.1", 6379)
            .resume_from("abc123", 500)
            .build()
            .unwrap();
        assert_eq!(config.repl_id, "abc123");
        assert_eq!(config.repl_offset, 500);
    }
}
