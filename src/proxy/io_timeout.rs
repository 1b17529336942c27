//! I/O deadlines for the outer HTTP layer.
//!
//! Every accepted transport is wrapped so writes must make progress within
//! the write timeout and reads must see bytes (or intervening writes)
//! within the idle timeout. Both deadlines go inert the moment the
//! transport is hijacked for a CONNECT tunnel, where body transfers must
//! not be cut off.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Sleep;

/// Stream wrapper enforcing write and idle deadlines.
///
/// A deadline is armed when the inner stream returns pending and cleared on
/// progress. `hijacked` disables enforcement entirely.
pub struct TimedStream<S> {
    inner: S,
    write_timeout: Duration,
    idle_timeout: Duration,
    hijacked: Arc<AtomicBool>,
    write_deadline: Option<Pin<Box<Sleep>>>,
    idle_deadline: Option<Pin<Box<Sleep>>>,
}

impl<S> TimedStream<S> {
    pub fn new(
        inner: S,
        write_timeout: Duration,
        idle_timeout: Duration,
        hijacked: Arc<AtomicBool>,
    ) -> Self {
        Self {
            inner,
            write_timeout,
            idle_timeout,
            hijacked,
            write_deadline: None,
            idle_deadline: None,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for TimedStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(result) => {
                this.idle_deadline = None;
                Poll::Ready(result)
            }
            Poll::Pending => {
                if this.hijacked.load(Ordering::Relaxed) {
                    this.idle_deadline = None;
                    return Poll::Pending;
                }
                let timeout = this.idle_timeout;
                let deadline = this
                    .idle_deadline
                    .get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));
                match deadline.as_mut().poll(cx) {
                    Poll::Ready(()) => Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "connection idle timeout",
                    ))),
                    Poll::Pending => Poll::Pending,
                }
            }
        }
    }
}

impl<S: AsyncWrite + Unpin> TimedStream<S> {
    fn poll_write_deadline(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.hijacked.load(Ordering::Relaxed) {
            self.write_deadline = None;
            return Poll::Pending;
        }
        let timeout = self.write_timeout;
        let deadline = self
            .write_deadline
            .get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));
        match deadline.as_mut().poll(cx) {
            Poll::Ready(()) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "write timeout",
            ))),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for TimedStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_write(cx, buf) {
            Poll::Ready(result) => {
                this.write_deadline = None;
                // A write counts as activity for the idle bound too, so a
                // long streamed response is not reaped mid-flight.
                this.idle_deadline = None;
                Poll::Ready(result)
            }
            Poll::Pending => match this.poll_write_deadline(cx) {
                Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
                _ => Poll::Pending,
            },
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_flush(cx) {
            Poll::Ready(result) => {
                this.write_deadline = None;
                Poll::Ready(result)
            }
            Poll::Pending => match this.poll_write_deadline(cx) {
                Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
                _ => Poll::Pending,
            },
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
