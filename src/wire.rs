//! WireIO: the buffered, optionally rate-limited, optionally prefetched
//! socket boundary. Everything the RESP/RDB layers read passes through here
//! first, which is also where the raw-byte tap fires.

use std::sync::{Arc, Mutex};

use anyhow::Context;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;

use crate::config::Configuration;
use crate::event::SharedEventBus;
use crate::rate_limiter::TokenBucket;

const PREFETCH_CHUNK: usize = 8 * 1024;

/// Where the next chunk of bytes comes from, underneath the RESP parser.
enum ReadSource {
    Direct(OwnedReadHalf),
    RateLimited {
        inner: OwnedReadHalf,
        bucket: TokenBucket,
    },
    Prefetch(mpsc::Receiver<std::io::Result<Bytes>>),
}

impl ReadSource {
    async fn pull(&mut self) -> anyhow::Result<Option<Bytes>> {
        match self {
            ReadSource::Direct(read_half) => {
                let mut buf = BytesMut::with_capacity(PREFETCH_CHUNK);
                let n = read_half.read_buf(&mut buf).await?;
                if n == 0 {
                    return Ok(None);
                }

                Ok(Some(buf.freeze()))
            }
            ReadSource::RateLimited { inner, bucket } => {
                let mut buf = BytesMut::with_capacity(PREFETCH_CHUNK);
                let n = inner.read_buf(&mut buf).await?;
                if n == 0 {
                    return Ok(None);
                }

                bucket.acquire(n).await;
                Ok(Some(buf.freeze()))
            }
            ReadSource::Prefetch(rx) => match rx.recv().await {
                Some(Ok(bytes)) => Ok(Some(bytes)),
                Some(Err(err)) => Err(err.into()),
                None => Ok(None),
            },
        }
    }
}

/// Shared, write-serialized handle to the socket's output half. Cloned
/// between the reader (handshake + GETACK replies) and the heartbeat
/// worker so no caller ever interleaves a partial frame with another.
#[derive(Clone)]
pub struct WriteHandle {
    inner: Arc<Mutex<Option<OwnedWriteHalf>>>,
}

impl WriteHandle {
    fn new(write_half: OwnedWriteHalf) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(write_half))),
        }
    }

    pub async fn write_frame(&self, bytes: Bytes) -> anyhow::Result<()> {
        // `std::sync::Mutex` guards a plain socket handle; the lock is only
        // ever held across the synchronous "take the handle out" step, the
        // await below happens after it's released.
        let mut half = {
            let mut guard = self.inner.lock().unwrap();
            guard.take()
        };

        let result = async {
            match half.as_mut() {
                Some(half) => {
                    half.write_all(&bytes).await?;
                    half.flush().await?;
                    Ok(())
                }
                None => Err(anyhow::anyhow!("write half already closed")),
            }
        }
        .await;

        *self.inner.lock().unwrap() = half;
        result
    }

    pub fn close(&self) {
        self.inner.lock().unwrap().take();
    }
}

pub struct WireIo {
    source: ReadSource,
    writer: WriteHandle,
    events: SharedEventBus,
    buf: BytesMut,
    cursor: usize,
    closed: bool,
}

macro_rules! need_more {
    ($e:expr) => {
        match $e {
            Some(value) => value,
            None => return Ok(false),
        }
    };
}

impl WireIo {
    pub fn new(read_half: OwnedReadHalf, write_half: OwnedWriteHalf, config: &Configuration, events: SharedEventBus) -> (Self, WriteHandle) {
        let source = if config.async_cached_bytes > 0 {
            Self::spawn_prefetch(read_half, config)
        } else if config.rate_limit > 0 {
            ReadSource::RateLimited {
                inner: read_half,
                bucket: TokenBucket::new(config.rate_limit),
            }
        } else {
            ReadSource::Direct(read_half)
        };

        let writer = WriteHandle::new(write_half);
        let wire = Self {
            source,
            writer: writer.clone(),
            events,
            buf: BytesMut::with_capacity(config.buffer_size),
            cursor: 0,
            closed: false,
        };

        (wire, writer)
    }

    /// Spawns the background prefetch worker: it reads ahead from the
    /// socket (honoring the rate limiter, if one is configured) and hands
    /// filled chunks across a bounded channel sized to
    /// `async_cached_bytes`, so the reader rarely blocks on a live socket
    /// read.
    fn spawn_prefetch(mut read_half: OwnedReadHalf, config: &Configuration) -> ReadSource {
        let channel_capacity = (config.async_cached_bytes / PREFETCH_CHUNK).max(1);
        let (tx, rx) = mpsc::channel(channel_capacity);
        let rate_limit = config.rate_limit;
        tokio::spawn(async move {
            let mut bucket = (rate_limit > 0).then(|| TokenBucket::new(rate_limit));
            loop {
                let mut buf = BytesMut::with_capacity(PREFETCH_CHUNK);
                let result = read_half.read_buf(&mut buf).await;
                let chunk = match result {
                    Ok(0) => break,
                    Ok(n) => {
                        if let Some(bucket) = bucket.as_mut() {
                            bucket.acquire(n).await;
                        }
                        Ok(buf.freeze())
                    }
                    Err(err) => Err(err),
                };

                let is_err = chunk.is_err();
                if tx.send(chunk).await.is_err() || is_err {
                    break;
                }
            }
        });

        ReadSource::Prefetch(rx)
    }

    pub fn writer(&self) -> WriteHandle {
        self.writer.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub async fn write_frame(&self, bytes: Bytes) -> anyhow::Result<()> {
        self.writer.write_frame(bytes).await
    }

    async fn fill_more(&mut self) -> anyhow::Result<()> {
        match self.source.pull().await? {
            Some(chunk) => {
                self.events.lock().unwrap().dispatch_raw_bytes(&chunk);
                self.buf.extend_from_slice(&chunk);
                Ok(())
            }
            None => {
                self.closed = true;
                Err(anyhow::anyhow!("connection closed by primary"))
            }
        }
    }

    fn check_advance(&mut self) -> Option<u8> {
        self.cursor += 1;
        self.buf.get(self.cursor - 1).copied()
    }

    /// Reads exactly `n` bytes and returns them. Counting them toward
    /// replication offset, if appropriate, is the caller's job — this layer
    /// just hands back bytes.
    pub async fn read_exact(&mut self, n: usize) -> anyhow::Result<Bytes> {
        while self.buf.len() < n {
            self.fill_more().await.context("read_exact")?;
        }

        let bytes = self.buf.split_to(n).freeze();
        // Any in-progress `check_*` scan is scanning from byte 0, so
        // splitting the front of the buffer invalidates it; callers only
        // mix `read_exact`/`skip` with the check/take path via
        // `next_frame_len`, which always restarts its scan at `cursor = 0`.
        self.cursor = 0;
        Ok(bytes)
    }

    pub async fn read_byte(&mut self) -> anyhow::Result<u8> {
        Ok(self.read_exact(1).await?[0])
    }

    /// Skips exactly `n` bytes without returning them. This is the "skip
    /// without counting" primitive the disk-less RDB trailer needs — callers
    /// that must count the skipped bytes toward `replOffset` should track
    /// that themselves from `n`.
    pub async fn skip(&mut self, n: usize) -> anyhow::Result<()> {
        let mut remaining = n;
        while remaining > 0 {
            if self.buf.is_empty() {
                self.fill_more().await.context("skip")?;
            }

            let take = remaining.min(self.buf.len());
            self.buf.advance_split(take);
            self.cursor = 0;
            remaining -= take;
        }

        Ok(())
    }

    /// Peeks whether `self.buf[cursor_start..]` currently holds a complete
    /// top-level RESP value starting at byte 0 of the unconsumed buffer,
    /// filling from the source as needed. Returns the byte length of that
    /// value once found.
    pub(crate) async fn next_frame_len(&mut self) -> anyhow::Result<usize> {
        loop {
            self.cursor = 0;
            if !self.buf.is_empty() {
                if self.check_value()? {
                    return Ok(self.cursor);
                }
            }

            self.fill_more().await.context("next_frame_len")?;
        }
    }

    fn check_value(&mut self) -> anyhow::Result<bool> {
        let tag = need_more!(self.check_advance());
        match tag {
            b'+' | b'-' => self.check_line(),
            b':' => self.check_integer(),
            b'$' => self.check_bulk_string(),
            b'*' => self.check_array(),
            other => Err(anyhow::anyhow!(
                "unexpected RESP tag '{}'",
                other.escape_ascii()
            )),
        }
    }

    fn check_line(&mut self) -> anyhow::Result<bool> {
        loop {
            let byte = need_more!(self.check_advance());
            if byte == b'\r' {
                let lf = need_more!(self.check_advance());
                if lf != b'\n' {
                    return Err(anyhow::anyhow!("expected LF after CR"));
                }

                return Ok(true);
            }
        }
    }

    fn check_integer(&mut self) -> anyhow::Result<bool> {
        self.check_line()
    }

    fn read_signed_prefix(&mut self) -> anyhow::Result<Option<i64>> {
        let start = self.cursor;
        loop {
            let byte = need_more!(self.check_advance());
            if byte == b'\r' {
                self.cursor -= 1;
                break;
            }
        }

        let digits = &self.buf[start..self.cursor];
        let text = std::str::from_utf8(digits).context("non-utf8 length")?;
        let value = text.parse::<i64>().context("invalid length")?;
        let lf_ok = need_more!(self.check_advance()) == b'\r' && need_more!(self.check_advance()) == b'\n';
        if !lf_ok {
            return Err(anyhow::anyhow!("expected CRLF after length"));
        }

        Ok(Some(value))
    }

    fn check_bulk_string(&mut self) -> anyhow::Result<bool> {
        let length = match self.read_signed_prefix()? {
            Some(value) => value,
            None => return Ok(false),
        };

        if length < -1 {
            return Err(anyhow::anyhow!("negative bulk length {length}"));
        }

        if length == -1 {
            return Ok(true);
        }

        let needed = self.cursor + length as usize + 2;
        if self.buf.len() < needed {
            return Ok(false);
        }

        self.cursor = needed;
        Ok(true)
    }

    fn check_array(&mut self) -> anyhow::Result<bool> {
        let length = match self.read_signed_prefix()? {
            Some(value) => value,
            None => return Ok(false),
        };

        if length < -1 {
            return Err(anyhow::anyhow!("negative array length {length}"));
        }

        if length == -1 {
            return Ok(true);
        }

        for _ in 0..length {
            if !self.check_value()? {
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// Reads the header of a bulk reply (`$<len>\r\n`) without consuming the
    /// payload, handing control back to the caller — this is how
    /// [`crate::rdb::RdbDriver`] gets at the RDB payload without the RESP
    /// layer ever materializing it as one `RespValue`.
    pub async fn read_bulk_header(&mut self) -> anyhow::Result<i64> {
        let tag = self.read_byte().await?;
        if tag != b'$' {
            return Err(anyhow::anyhow!("expected bulk string tag '$', got '{}'", tag.escape_ascii()));
        }

        let mut digits = Vec::new();
        loop {
            let byte = self.read_byte().await?;
            if byte == b'\r' {
                let lf = self.read_byte().await?;
                if lf != b'\n' {
                    return Err(anyhow::anyhow!("expected LF after bulk length CR"));
                }
                break;
            }

            digits.push(byte);
        }

        let text = std::str::from_utf8(&digits).context("non-utf8 bulk length")?;
        text.parse::<i64>().context("invalid bulk length")
    }

    /// Consumes the next full top-level RESP value already confirmed
    /// present by [`Self::next_frame_len`], at byte 0 of the buffer.
    fn take_value(&mut self) -> crate::resp::RespValue {
        use crate::resp::RespValue;

        let tag = self.buf[0];
        self.buf.advance_split(1);
        match tag {
            b'+' => RespValue::SimpleString(self.take_line()),
            b'-' => RespValue::Error(self.take_line()),
            b':' => RespValue::Integer(self.take_integer()),
            b'$' => self.take_bulk_string(),
            b'*' => self.take_array(),
            _ => unreachable!("checked by check_value"),
        }
    }

    fn take_line(&mut self) -> Bytes {
        let end = self
            .buf
            .iter()
            .position(|&b| b == b'\r')
            .expect("checked by check_line");
        let bytes = self.buf.split_to(end).freeze();
        self.buf.advance_split(2);
        bytes
    }

    fn take_integer(&mut self) -> i64 {
        let bytes = self.take_line();
        std::str::from_utf8(&bytes)
            .expect("validated in check_integer")
            .parse()
            .expect("validated in check_integer")
    }

    fn take_length_prefix(&mut self) -> i64 {
        let end = self
            .buf
            .iter()
            .position(|&b| b == b'\r')
            .expect("checked by read_signed_prefix");
        let digits = self.buf.split_to(end).freeze();
        self.buf.advance_split(2);
        std::str::from_utf8(&digits).unwrap().parse().unwrap()
    }

    fn take_bulk_string(&mut self) -> crate::resp::RespValue {
        use crate::resp::RespValue;

        let length = self.take_length_prefix();
        if length == -1 {
            return RespValue::NullBulkString;
        }

        let bytes = self.buf.split_to(length as usize).freeze();
        self.buf.advance_split(2);
        RespValue::BulkString(bytes)
    }

    fn take_array(&mut self) -> crate::resp::RespValue {
        use crate::resp::RespValue;

        let length = self.take_length_prefix();
        if length == -1 {
            return RespValue::NullArray;
        }

        let mut values = Vec::with_capacity(length as usize);
        for _ in 0..length {
            values.push(self.take_value());
        }

        RespValue::Array(values)
    }

    /// Reads one top-level RESP value, returning it alongside the exact
    /// number of wire bytes it occupied.
    pub async fn read_value_counted(&mut self) -> anyhow::Result<(crate::resp::RespValue, usize)> {
        let len = self.next_frame_len().await?;
        let value = self.take_value();
        Ok((value, len))
    }

    pub async fn read_value(&mut self) -> anyhow::Result<crate::resp::RespValue> {
        Ok(self.read_value_counted().await?.0)
    }
}

/// `BytesMut::advance` without the `Buf` trait import noise at call sites.
trait AdvanceSplit {
    fn advance_split(&mut self, n: usize);
}

impl AdvanceSplit for BytesMut {
    fn advance_split(&mut self, n: usize) {
        let _ = self.split_to(n);
    }
}
