//! Multiplexed stream over an in-memory connection.

use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::watch;

type CloseSignal = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Resolves once the connection's closed flag is set. Never resolves if the
/// connection goes away without being closed.
fn close_signal(mut closed: watch::Receiver<bool>) -> CloseSignal {
    Box::pin(async move {
        loop {
            let is_closed = *closed.borrow_and_update();
            if is_closed {
                return;
            }
            if closed.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    })
}

/// One end of a stream. Fails with `ConnectionReset` once its connection
/// has been closed, including reads and writes already waiting for the
/// other end.
pub struct MemoryStream {
    inner: DuplexStream,
    closed: CloseSignal,
    reset: bool,
    descriptor: String,
}

impl MemoryStream {
    pub(crate) fn pair(
        window: usize,
        conn_closed: &watch::Sender<bool>,
        descriptor: String,
    ) -> (Self, Self) {
        let (a, b) = tokio::io::duplex(window);
        (
            Self::new(a, conn_closed.subscribe(), descriptor.clone()),
            Self::new(b, conn_closed.subscribe(), descriptor),
        )
    }

    fn new(inner: DuplexStream, closed: watch::Receiver<bool>, descriptor: String) -> Self {
        Self {
            inner,
            closed: close_signal(closed),
            reset: false,
            descriptor,
        }
    }

    /// Fails once the connection is closed. Registers the task for wakeup
    /// on close otherwise.
    fn poll_open(&mut self, cx: &mut Context<'_>) -> io::Result<()> {
        if !self.reset && self.closed.as_mut().poll(cx).is_ready() {
            self.reset = true;
        }
        if self.reset {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                format!("connection {} closed", self.descriptor),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for MemoryStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryStream")
            .field("descriptor", &self.descriptor)
            .field("reset", &self.reset)
            .finish()
    }
}

impl AsyncRead for MemoryStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        this.poll_open(cx)?;
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for MemoryStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.poll_open(cx)?;
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
