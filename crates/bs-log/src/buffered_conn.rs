// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Write-buffered stream connection.
//!
//! [`BufferedConn`] batches small writes into a fixed size buffer, flushes it
//! when full, on close, and from a background task every `max_latency` so a
//! quiet connection does not hold lines back. Writes that trigger a flush run
//! under the timeout armed with [`BufferedConn::set_write_deadline`].

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const DEFAULT_BUFFER_SIZE: usize = 4096;

struct Inner<W> {
    writer: W,
    buf: Vec<u8>,
    size: usize,
    write_timeout: Option<Duration>,
    closed: bool,
}

impl<W: AsyncWrite + Unpin> Inner<W> {
    fn available(&self) -> usize {
        self.size - self.buf.len()
    }

    async fn flush_buffer(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        self.writer.write_all(&self.buf).await?;
        self.buf.clear();
        self.writer.flush().await
    }

    async fn flush_with_timeout(&mut self) -> io::Result<()> {
        match self.write_timeout {
            Some(limit) => with_timeout(limit, self.flush_buffer()).await,
            None => self.flush_buffer().await,
        }
    }

    async fn write_buffered(&mut self, mut data: &[u8]) -> io::Result<usize> {
        let mut written = 0;
        while data.len() > self.available() {
            let n = if self.buf.is_empty() {
                // Large write into an empty buffer: skip the copy.
                self.writer.write_all(data).await?;
                data.len()
            } else {
                let n = self.available();
                self.buf.extend_from_slice(&data[..n]);
                self.flush_buffer().await?;
                n
            };
            written += n;
            data = &data[n..];
        }
        self.buf.extend_from_slice(data);
        Ok(written + data.len())
    }
}

async fn with_timeout<T>(
    limit: Duration,
    fut: impl std::future::Future<Output = io::Result<T>>,
) -> io::Result<T> {
    tokio::time::timeout(limit, fut).await.map_err(|_| {
        io::Error::new(
            io::ErrorKind::TimedOut,
            format!("write timed out after {limit:?}"),
        )
    })?
}

/// A buffered writer over a stream connection, safe to share between tasks.
pub struct BufferedConn<W> {
    inner: Arc<Mutex<Inner<W>>>,
    done: CancellationToken,
    flusher: Option<JoinHandle<()>>,
}

impl<W> BufferedConn<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Wraps `writer` with a buffer of `size` bytes. When `max_latency` is
    /// non-zero a background task flushes the buffer at that period.
    pub fn new(writer: W, size: usize, max_latency: Duration) -> Self {
        let size = size.max(1);
        let inner = Arc::new(Mutex::new(Inner {
            writer,
            buf: Vec::with_capacity(size),
            size,
            write_timeout: None,
            closed: false,
        }));
        let done = CancellationToken::new();
        let flusher = (!max_latency.is_zero()).then(|| {
            tokio::spawn(periodic_flush(
                Arc::clone(&inner),
                done.clone(),
                max_latency,
            ))
        });
        BufferedConn {
            inner,
            done,
            flusher,
        }
    }

    /// Buffers `data`, flushing first when it does not fit. Returns the
    /// number of bytes accepted.
    pub async fn write(&self, data: &[u8]) -> io::Result<usize> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection is closed",
            ));
        }
        match inner.write_timeout {
            Some(limit) if inner.available() < data.len() => {
                with_timeout(limit, inner.write_buffered(data)).await
            }
            _ => inner.write_buffered(data).await,
        }
    }

    /// Sets the deadline for flushes triggered from now on. `None` clears it.
    pub async fn set_write_deadline(&self, deadline: Option<Instant>) {
        let mut inner = self.inner.lock().await;
        inner.write_timeout = deadline.map(|d| d.saturating_duration_since(Instant::now()));
    }

    /// Writes out whatever is buffered.
    pub async fn flush(&self) -> io::Result<()> {
        let mut inner = self.inner.lock().await;
        inner.flush_with_timeout().await
    }

    /// Number of bytes waiting in the buffer.
    pub async fn buffered(&self) -> usize {
        self.inner.lock().await.buf.len()
    }

    /// Flushes the buffer, stops the background flusher and shuts the
    /// connection down. Both the flush and the shutdown are attempted; when
    /// both fail the error carries the two messages.
    pub async fn close(&mut self) -> io::Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Ok(());
        }
        let flush_result = inner.flush_with_timeout().await;
        self.done.cancel();
        inner.closed = true;
        let close_result = inner.writer.shutdown().await;
        drop(inner);
        if let Some(flusher) = self.flusher.take() {
            let _ = flusher.await;
        }
        match (flush_result, close_result) {
            (Ok(()), Ok(())) => Ok(()),
            (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
            (Err(flush), Err(close)) => Err(io::Error::other(format!(
                "flush error: {flush}, close error: {close}"
            ))),
        }
    }
}

impl<W> Drop for BufferedConn<W> {
    fn drop(&mut self) {
        self.done.cancel();
    }
}

async fn periodic_flush<W>(inner: Arc<Mutex<Inner<W>>>, done: CancellationToken, period: Duration)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            () = done.cancelled() => return,
            _ = ticker.tick() => {
                let mut inner = inner.lock().await;
                if inner.closed {
                    return;
                }
                if let Err(e) = inner.flush_with_timeout().await {
                    debug!("background flush failed: {e}");
                }
            }
        }
    }
}
