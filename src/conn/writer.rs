//! Write side of a connection: optional pooled output buffer plus an
//! inactivity timer that flushes it while a handler is slow between rows.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::ConnError;
use crate::pool::BufferPool;
use crate::protocol::Framer;

pub(crate) type BoxedWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// The socket write half and the buffer of the current buffered-write
/// session. Always accessed under the connection's write mutex.
struct WriterInner {
    stream: BoxedWrite,
    buf: Option<Vec<u8>>,
    written: usize,
}

impl WriterInner {
    fn poll_flush_buf(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let Some(buf) = self.buf.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        while self.written < buf.len() {
            match ready!(Pin::new(&mut self.stream).poll_write(cx, &buf[self.written..])) {
                Ok(0) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "failed to write the buffered data",
                    )))
                }
                Ok(n) => self.written += n,
                Err(e) => return Poll::Ready(Err(e)),
            }
        }
        buf.clear();
        self.written = 0;
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for WriterInner {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let Some(capacity) = this.buf.as_ref().map(|b| b.capacity()) else {
            return Pin::new(&mut this.stream).poll_write(cx, data);
        };

        let pending = this.buf.as_ref().map_or(0, |b| b.len());
        if pending + data.len() > capacity {
            ready!(this.poll_flush_buf(cx))?;
        }

        match this.buf.as_mut() {
            Some(buf) if data.len() < capacity => {
                buf.extend_from_slice(data);
                Poll::Ready(Ok(data.len()))
            }
            _ => Pin::new(&mut this.stream).poll_write(cx, data),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_flush_buf(cx))?;
        Pin::new(&mut this.stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_flush_buf(cx))?;
        Pin::new(&mut this.stream).poll_shutdown(cx)
    }
}

/// Buffered writer for one connection.
///
/// Outside a buffered-write session every packet goes straight to the
/// socket. Inside one, packets accumulate in a buffer borrowed from the
/// pool and a timer flushes them after `flush_delay` without writes. The
/// timer task takes the same mutex as explicit flushes, so the two never
/// interleave on the socket. Once `closed` fires, no flush waits on the
/// socket any more and buffered bytes are dropped.
pub(crate) struct ConnWriter {
    conn_id: u32,
    closed: CancellationToken,
    inner: Arc<Mutex<WriterInner>>,
    pool: Arc<BufferPool>,
    buffer_size: usize,
    flush_delay: Duration,
    timer: Option<watch::Sender<Option<Instant>>>,
}

impl ConnWriter {
    pub(crate) fn new(
        conn_id: u32,
        closed: CancellationToken,
        stream: BoxedWrite,
        pool: Arc<BufferPool>,
        buffer_size: usize,
        flush_delay: Duration,
    ) -> Self {
        Self {
            conn_id,
            closed,
            inner: Arc::new(Mutex::new(WriterInner {
                stream,
                buf: None,
                written: 0,
            })),
            pool,
            buffer_size,
            flush_delay,
            timer: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn is_buffering(&self) -> bool {
        self.timer.is_some()
    }

    /// Begin a buffered-write session
    pub(crate) async fn start_buffering(&mut self) {
        if self.timer.is_some() || self.buffer_size == 0 {
            return;
        }

        {
            let mut inner = self.inner.lock().await;
            let mut buf = self.pool.get(self.buffer_size);
            buf.clear();
            inner.buf = Some(buf);
            inner.written = 0;
        }

        let (tx, rx) = watch::channel(None);
        tokio::spawn(flush_timer(self.conn_id, self.inner.clone(), self.closed.clone(), rx));
        self.timer = Some(tx);
    }

    /// Write one logical packet through `framer`
    pub(crate) async fn write_packet(&mut self, framer: &mut Framer, data: &mut [u8]) -> Result<(), ConnError> {
        let mut inner = self.inner.lock().await;
        framer.write_packet(&mut *inner, data).await?;
        match &self.timer {
            Some(timer) => {
                timer.send_replace(Some(Instant::now() + self.flush_delay));
            }
            // Unbuffered packets still have to leave wrapped (TLS) streams
            None => inner.flush().await.map_err(|e| ConnError::io("flush", e))?,
        }
        Ok(())
    }

    /// Push buffered bytes to the socket
    pub(crate) async fn flush(&mut self) -> Result<(), ConnError> {
        if let Some(timer) = &self.timer {
            timer.send_replace(None);
        }
        let mut inner = self.inner.lock().await;
        inner.flush().await.map_err(|e| ConnError::io("flush", e))
    }

    /// End the buffered-write session: stop the timer, flush, and give the
    /// buffer back to the pool. The buffer is released even if the flush
    /// fails or the connection was closed, in which case pending bytes are
    /// discarded.
    pub(crate) async fn end_buffering(&mut self) -> Result<(), ConnError> {
        // Dropping the sender stops the timer task
        if self.timer.take().is_none() {
            return Ok(());
        }

        let mut inner = self.inner.lock().await;
        let result = if self.closed.is_cancelled() {
            Err(ConnError::Closed)
        } else {
            tokio::select! {
                biased;
                _ = self.closed.cancelled() => Err(ConnError::Closed),
                flushed = inner.flush() => flushed.map_err(|e| ConnError::io("flush", e)),
            }
        };
        if let Some(buf) = inner.buf.take() {
            self.pool.put(buf);
        }
        inner.written = 0;
        result
    }

    pub(crate) async fn shutdown(&mut self) {
        let mut inner = self.inner.lock().await;
        let _ = inner.shutdown().await;
    }
}

async fn flush_timer(
    conn_id: u32,
    inner: Arc<Mutex<WriterInner>>,
    closed: CancellationToken,
    mut deadline: watch::Receiver<Option<Instant>>,
) {
    loop {
        let armed = *deadline.borrow_and_update();
        match armed {
            Some(at) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(at) => {
                        let mut guard = inner.lock().await;
                        // A write after the timer fired re-arms it
                        if *deadline.borrow() != Some(at) {
                            continue;
                        }
                        tokio::select! {
                            biased;
                            _ = closed.cancelled() => return,
                            flushed = guard.flush() => {
                                if let Err(e) = flushed {
                                    warn!(conn_id = conn_id, error = %e, "Deferred flush failed");
                                }
                            }
                        }
                        drop(guard);
                        if deadline.wait_for(|d| *d != Some(at)).await.is_err() {
                            return;
                        }
                    }
                    _ = closed.cancelled() => return,
                    changed = deadline.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
            None => {
                tokio::select! {
                    _ = closed.cancelled() => return,
                    changed = deadline.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}
