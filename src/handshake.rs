//! `AUTH → PING → REPLCONF (listening-port, ip-address, capa eof, capa
//! psync2, filters) → ready-for-PSYNC`, with tolerant-reply rules for
//! primaries that don't recognize every step.

use crate::config::Configuration;
use crate::error::{ReplicationError, Result};
use crate::resp::{encode, RespValue};
use crate::wire::WireIo;

fn is_fatal_reply(text: &str) -> bool {
    text.contains("NOAUTH") || text.contains("NOPERM") || text.contains("operation not permitted")
}

async fn read_simple_reply(wire: &mut WireIo) -> Result<String> {
    match wire.read_value().await.map_err(ReplicationError::transport)? {
        RespValue::SimpleString(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        RespValue::Error(bytes) => Ok(format!("-{}", String::from_utf8_lossy(&bytes))),
        other => Err(ReplicationError::protocol(anyhow::anyhow!(
            "expected a simple reply, got {other:?}"
        ))),
    }
}

async fn auth(wire: &mut WireIo, config: &Configuration) -> Result<()> {
    let Some(password) = config.password.as_deref() else {
        return Ok(());
    };

    tracing::debug!(host = %config.host, port = config.port, "handshake:auth");
    wire.write_frame(encode::auth(config.user.as_deref(), password))
        .await
        .map_err(ReplicationError::transport)?;

    let reply = read_simple_reply(wire).await?;
    if reply.eq_ignore_ascii_case("OK") {
        return Ok(());
    }

    if is_fatal_reply(&reply) {
        return Err(ReplicationError::AuthFailure(reply));
    }

    if reply.to_ascii_lowercase().contains("no password") {
        tracing::warn!(reply = %reply, "primary has no password configured, proceeding unauthenticated");
        return Ok(());
    }

    Err(ReplicationError::AuthFailure(reply))
}

async fn ping(wire: &mut WireIo, config: &Configuration) -> Result<()> {
    tracing::debug!(host = %config.host, port = config.port, "handshake:ping");
    wire.write_frame(encode::ping()).await.map_err(ReplicationError::transport)?;

    let reply = read_simple_reply(wire).await?;
    if reply.eq_ignore_ascii_case("PONG") {
        return Ok(());
    }

    if is_fatal_reply(&reply) {
        return Err(ReplicationError::AuthFailure(reply));
    }

    tracing::warn!(reply = %reply, "primary replied to PING with something other than PONG, proceeding");
    Ok(())
}

async fn replconf(wire: &mut WireIo, frame: bytes::Bytes, label: &str) -> Result<()> {
    wire.write_frame(frame).await.map_err(ReplicationError::transport)?;
    let reply = read_simple_reply(wire).await?;
    if !reply.eq_ignore_ascii_case("OK") {
        tracing::warn!(reply = %reply, step = label, "REPLCONF step was not acknowledged with OK, proceeding");
    }
    Ok(())
}

/// Runs the full handshake over an already-connected [`WireIo`]. Returns
/// once the connection is ready for `PSYNC`/`SYNC`.
pub async fn run(wire: &mut WireIo, config: &Configuration, local_port: u16, local_ip: &str) -> Result<()> {
    auth(wire, config).await?;
    ping(wire, config).await?;

    let advertised_port = if config.listening_port == 0 { local_port } else { config.listening_port };
    replconf(wire, encode::replconf_listening_port(advertised_port), "listening-port").await?;
    replconf(wire, encode::replconf_ip_address(local_ip), "ip-address").await?;
    replconf(wire, encode::replconf_capa("eof"), "capa eof").await?;
    replconf(wire, encode::replconf_capa("psync2"), "capa psync2").await?;

    for filter in &config.filters {
        let frame = encode::filter(&[filter.keyword.as_bytes(), filter.argument.as_bytes()]);
        wire.write_frame(frame).await.map_err(ReplicationError::transport)?;
        let reply = read_simple_reply(wire).await?;
        if reply.eq_ignore_ascii_case("OK") {
            tracing::debug!(filter = filter.keyword, "replication filter accepted");
        } else {
            tracing::warn!(filter = filter.keyword, reply = %reply, "replication filter was not accepted");
        }
    }

    Ok(())
}
