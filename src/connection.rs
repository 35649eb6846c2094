//! One accepted peer: a write side shared with every broadcaster and a read
//! side owned by the peer's worker task.

use crate::error::{RelayError, Result};
use crate::protocol::{read_frame, write_frame, Frame};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex};
use tokio::time::timeout;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Stable identity of a connection for its whole lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Write side of a peer.
///
/// `send` never returns an error: any transport failure is reported as
/// `false` and the caller decides whether to tear the peer down.
pub struct Connection {
    id: ConnectionId,
    remote_addr: SocketAddr,
    writer: Mutex<Option<BoxedWriter>>,
    write_timeout: Duration,
    closed: watch::Sender<bool>,
}

impl Connection {
    /// Wrap the two halves of a stream. The returned reader belongs to the
    /// worker that drives this peer's protocol.
    pub fn split<R, W>(
        remote_addr: SocketAddr,
        reader: R,
        writer: W,
        write_timeout: Duration,
        max_frame_size: u32,
    ) -> (Arc<Self>, ConnectionReader<R>)
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (closed, closed_rx) = watch::channel(false);
        let connection = Arc::new(Self {
            id: ConnectionId::next(),
            remote_addr,
            writer: Mutex::new(Some(Box::new(writer))),
            write_timeout,
            closed,
        });
        let reader = ConnectionReader {
            inner: reader,
            max_frame_size,
            closed: closed_rx,
        };
        (connection, reader)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub async fn send(&self, frame: &Frame) -> bool {
        let mut guard = self.writer.lock().await;
        let Some(writer) = guard.as_mut() else {
            return false;
        };

        match timeout(self.write_timeout, write_frame(writer, frame)).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::debug!("Send to {} ({}) failed: {}", self.id, self.remote_addr, e);
                false
            }
            Err(_) => {
                tracing::warn!(
                    "Send to {} ({}) timed out after {:?}",
                    self.id,
                    self.remote_addr,
                    self.write_timeout
                );
                false
            }
        }
    }

    pub async fn send_line(&self, text: impl Into<String>) -> bool {
        self.send(&Frame::line(text)).await
    }

    /// Shut the write side down, then release it. Both steps are best-effort
    /// and calling this more than once is harmless.
    pub async fn close(&self) {
        // Stop the worker's reader first so it does not race the teardown
        self.closed.send_replace(true);

        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Ok(Err(e)) = timeout(self.write_timeout, writer.shutdown()).await {
                tracing::debug!("Shutdown of {} failed: {}", self.id, e);
            }
            drop(writer);
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Read side of a peer.
pub struct ConnectionReader<R> {
    inner: R,
    max_frame_size: u32,
    closed: watch::Receiver<bool>,
}

impl<R: AsyncRead + Unpin> ConnectionReader<R> {
    /// Wait for the next frame.
    ///
    /// `Ok(None)` means the stream is finished: either the peer closed it on
    /// a frame boundary or the connection was torn down locally.
    pub async fn receive(&mut self, deadline: Option<Duration>) -> Result<Option<Frame>> {
        if *self.closed.borrow() {
            return Ok(None);
        }

        let read = read_frame(&mut self.inner, self.max_frame_size);
        let read = async move {
            match deadline {
                Some(limit) => match timeout(limit, read).await {
                    Ok(result) => result,
                    Err(_) => Err(RelayError::Timeout(format!("no data for {:?}", limit))),
                },
                None => read.await,
            }
        };

        tokio::select! {
            result = read => result,
            _ = wait_closed(&mut self.closed) => Ok(None),
        }
    }
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    loop {
        if *closed.borrow_and_update() {
            return;
        }
        if closed.changed().await.is_err() {
            return;
        }
    }
}
