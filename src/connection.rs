use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

/// Read chunk used while filling the peek buffer
const PEEK_CHUNK: usize = 512;

/// Client connection as it travels from the dispatcher to the HTTP server
pub type ClientStream = PeekableStream<TcpStream>;

/// Duplex stream with look-ahead.
///
/// Bytes pulled in by [`PeekableStream::peek`] stay buffered and are handed
/// out again by the `AsyncRead` impl before anything new is read from the
/// underlying stream, so peeking never loses or reorders client bytes.
#[derive(Debug)]
pub struct PeekableStream<S> {
    inner: S,
    buffered: BytesMut,
}

impl<S> PeekableStream<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            buffered: BytesMut::new(),
        }
    }

    /// Number of bytes read from the socket but not yet consumed
    pub fn buffered_len(&self) -> usize {
        self.buffered.len()
    }
}

impl<S: AsyncRead + Unpin> PeekableStream<S> {
    /// Look at the next `n` bytes without consuming them.
    ///
    /// Fails with `UnexpectedEof` if the peer closes before `n` bytes arrive.
    pub async fn peek(&mut self, n: usize) -> io::Result<&[u8]> {
        while self.buffered.len() < n {
            self.buffered.reserve(PEEK_CHUNK.max(n - self.buffered.len()));
            let read = self.inner.read_buf(&mut self.buffered).await?;
            if read == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before peek completed",
                ));
            }
        }
        Ok(&self.buffered[..n])
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PeekableStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.buffered.is_empty() {
            let n = this.buffered.len().min(buf.remaining());
            buf.put_slice(&this.buffered[..n]);
            this.buffered.advance(n);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PeekableStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}

/// Shared counter of HTTP connections currently being served
#[derive(Debug, Clone, Default)]
pub struct ConnectionGauge {
    active: Arc<AtomicUsize>,
}

impl ConnectionGauge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection; the slot is released when the guard drops
    pub fn enter(&self) -> ConnectionGuard {
        self.active.fetch_add(1, Ordering::AcqRel);
        ConnectionGuard {
            active: Arc::clone(&self.active),
            decremented: false,
        }
    }

    /// Get the current active connection count
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }
}

/// RAII guard to ensure the connection count is properly decremented
#[derive(Debug)]
pub struct ConnectionGuard {
    active: Arc<AtomicUsize>,
    decremented: bool,
}

impl ConnectionGuard {
    /// Manually decrement the connection counter
    pub fn decrement(&mut self) {
        if !self.decremented {
            self.active.fetch_sub(1, Ordering::AcqRel);
            self.decremented = true;
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.decrement();
    }
}
