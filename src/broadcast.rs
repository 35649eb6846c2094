//! Fan-out of timestamped lines to every registered peer.

use crate::connection::{Connection, ConnectionId};
use crate::protocol::{Frame, MAX_FRAME_SIZE};
use crate::registry::SessionRegistry;
use chrono::Local;
use std::sync::Arc;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// `[<timestamp>] <text>` using local time.
pub fn timestamped(text: &str) -> String {
    format!("[{}] {}", Local::now().format(TIMESTAMP_FORMAT), text)
}

pub struct Broadcaster {
    registry: Arc<SessionRegistry>,
    /// Longest line peers will accept in one frame
    max_line_len: usize,
}

impl Broadcaster {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self {
            registry,
            max_line_len: MAX_FRAME_SIZE as usize,
        }
    }

    /// Cap outgoing lines at the peers' frame limit.
    pub fn with_max_line_len(mut self, max_frame_size: u32) -> Self {
        self.max_line_len = max_frame_size as usize;
        self
    }

    /// Whether `line` fits in one frame a peer will read.
    pub fn fits(&self, line: &str) -> bool {
        line.len() <= self.max_line_len
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Timestamp `text`, log it, and deliver it to everyone except
    /// `excluding`. Peers whose send fails are removed; one failure never
    /// stops delivery to the rest.
    ///
    /// Returns `false` without sending anything if the timestamped line
    /// would not fit in a frame.
    pub async fn broadcast(&self, text: &str, excluding: Option<ConnectionId>) -> bool {
        let line = timestamped(text);
        if !self.fits(&line) {
            tracing::warn!(
                "Dropping {}-byte broadcast, frame limit is {}",
                line.len(),
                self.max_line_len
            );
            return false;
        }
        tracing::info!("{}", line);

        let failed = self.fan_out(&Frame::line(line), excluding).await;
        self.disconnect_all(failed).await;
        true
    }

    /// Send one frame to one peer, removing it if the send fails.
    pub async fn send_to(&self, connection: &Connection, frame: &Frame) -> bool {
        if connection.send(frame).await {
            return true;
        }
        self.disconnect(connection.id()).await;
        false
    }

    /// Remove a peer and tell everyone else it left.
    ///
    /// Safe to call repeatedly: only the call that actually removes the
    /// peer announces it. Peers that fail while receiving the announcement
    /// are queued and handled here rather than by recursing.
    pub async fn disconnect(&self, id: ConnectionId) {
        let mut pending = vec![id];

        while let Some(id) = pending.pop() {
            let Some(nickname) = self.registry.remove(id).await else {
                continue;
            };
            tracing::info!("Removed client {} ({})", nickname, id);

            let line = timestamped(&format!("{} left the room", nickname));
            if !self.fits(&line) {
                tracing::warn!("Not announcing departure of {}: line too long", id);
                continue;
            }
            tracing::info!("{}", line);
            pending.extend(self.fan_out(&Frame::line(line), None).await);
        }
    }

    pub async fn disconnect_all(&self, ids: Vec<ConnectionId>) {
        for id in ids {
            self.disconnect(id).await;
        }
    }

    /// Deliver `frame` to a snapshot of the registry and return the peers
    /// whose send failed. Removal is left to the caller.
    pub(crate) async fn fan_out(
        &self,
        frame: &Frame,
        excluding: Option<ConnectionId>,
    ) -> Vec<ConnectionId> {
        let mut failed = Vec::new();
        for connection in self.registry.snapshot() {
            if Some(connection.id()) == excluding {
                continue;
            }
            if !connection.send(frame).await {
                failed.push(connection.id());
            }
        }
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionReader;
    use crate::protocol::{read_frame, MAX_FRAME_SIZE};
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::{duplex, split, AsyncWrite, DuplexStream, ReadHalf};

    struct Peer {
        conn: Arc<Connection>,
        _reader: ConnectionReader<ReadHalf<DuplexStream>>,
        far: DuplexStream,
    }

    impl Peer {
        async fn next_line(&mut self) -> String {
            match read_frame(&mut self.far, MAX_FRAME_SIZE).await.unwrap() {
                Some(Frame::Line(line)) => line,
                other => panic!("Expected a line, got {:?}", other),
            }
        }
    }

    fn peer(registry: &SessionRegistry, nickname: &str) -> Peer {
        let (near, far) = duplex(64 * 1024);
        let (read, write) = split(near);
        let (conn, reader) = Connection::split(
            "127.0.0.1:40000".parse().unwrap(),
            read,
            write,
            Duration::from_secs(1),
            MAX_FRAME_SIZE,
        );
        registry.register(Arc::clone(&conn));
        registry.set_nickname(conn.id(), nickname);
        Peer {
            conn,
            _reader: reader,
            far,
        }
    }

    struct BrokenWriter;

    impl AsyncWrite for BrokenWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            Poll::Ready(Err(std::io::ErrorKind::ConnectionReset.into()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Err(std::io::ErrorKind::NotConnected.into()))
        }
    }

    fn broken_peer(registry: &SessionRegistry, nickname: &str) -> (Arc<Connection>, DuplexStream) {
        let (read, keep) = duplex(64);
        let (conn, _reader) = Connection::split(
            "127.0.0.1:40001".parse().unwrap(),
            read,
            BrokenWriter,
            Duration::from_secs(1),
            MAX_FRAME_SIZE,
        );
        registry.register(Arc::clone(&conn));
        registry.set_nickname(conn.id(), nickname);
        (conn, keep)
    }

    #[test]
    fn test_timestamp_format() {
        let line = timestamped("Alice: hello");
        // [YYYY-MM-DD HH:MM:SS] is 21 characters
        assert_eq!(&line[..1], "[");
        assert_eq!(&line[20..22], "] ");
        assert!(line.ends_with("Alice: hello"));
        assert!(chrono::NaiveDateTime::parse_from_str(&line[1..20], TIMESTAMP_FORMAT).is_ok());
    }

    #[tokio::test]
    async fn test_broadcast_skips_sender() {
        let registry = Arc::new(SessionRegistry::new());
        let broadcaster = Broadcaster::new(Arc::clone(&registry));
        let mut alice = peer(&registry, "Alice");
        let mut bob = peer(&registry, "Bob");

        broadcaster
            .broadcast("Alice: hello", Some(alice.conn.id()))
            .await;
        broadcaster.broadcast("server notice", None).await;

        assert!(bob.next_line().await.ends_with("] Alice: hello"));
        assert!(bob.next_line().await.ends_with("] server notice"));
        // Alice only sees the unexcluded notice
        assert!(alice.next_line().await.ends_with("] server notice"));
    }

    #[tokio::test]
    async fn test_failed_peer_removed_and_rest_still_delivered() {
        let registry = Arc::new(SessionRegistry::new());
        let broadcaster = Broadcaster::new(Arc::clone(&registry));
        let mut alice = peer(&registry, "Alice");
        let (dead, _keep) = broken_peer(&registry, "Mallory");
        let mut carol = peer(&registry, "Carol");

        broadcaster.broadcast("Alice: hi all", Some(alice.conn.id())).await;

        assert!(carol.next_line().await.ends_with("] Alice: hi all"));
        assert!(carol.next_line().await.ends_with("] Mallory left the room"));
        assert!(alice.next_line().await.ends_with("] Mallory left the room"));

        assert!(!registry.contains(dead.id()));
        assert!(registry.snapshot().iter().all(|c| c.id() != dead.id()));
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_disconnect_twice_announces_once() {
        let registry = Arc::new(SessionRegistry::new());
        let broadcaster = Broadcaster::new(Arc::clone(&registry));
        let mut alice = peer(&registry, "Alice");
        let bob = peer(&registry, "Bob");

        broadcaster.disconnect(bob.conn.id()).await;
        broadcaster.disconnect(bob.conn.id()).await;
        broadcaster.broadcast("marker", None).await;

        assert!(alice.next_line().await.ends_with("] Bob left the room"));
        // The next line is the marker, not a second "left"
        assert!(alice.next_line().await.ends_with("] marker"));
    }

    #[tokio::test]
    async fn test_cascading_failures_during_leave_notice() {
        let registry = Arc::new(SessionRegistry::new());
        let broadcaster = Broadcaster::new(Arc::clone(&registry));
        let mut alice = peer(&registry, "Alice");
        let bob = peer(&registry, "Bob");
        let (m1, _k1) = broken_peer(&registry, "Mallory");
        let (m2, _k2) = broken_peer(&registry, "Trent");

        broadcaster.disconnect(bob.conn.id()).await;

        assert_eq!(registry.len(), 1);
        assert!(!registry.contains(m1.id()));
        assert!(!registry.contains(m2.id()));

        let mut lines = Vec::new();
        for _ in 0..3 {
            lines.push(alice.next_line().await);
        }
        assert!(lines[0].ends_with("Bob left the room"));
        assert_eq!(
            lines.iter().filter(|l| l.ends_with("Mallory left the room")).count(),
            1
        );
        assert_eq!(
            lines.iter().filter(|l| l.ends_with("Trent left the room")).count(),
            1
        );
    }

    #[tokio::test]
    async fn test_send_to_failure_disconnects() {
        let registry = Arc::new(SessionRegistry::new());
        let broadcaster = Broadcaster::new(Arc::clone(&registry));
        let mut alice = peer(&registry, "Alice");
        let (dead, _keep) = broken_peer(&registry, "Mallory");

        assert!(!broadcaster.send_to(&dead, &Frame::line("FILE_TRANSFER_READY")).await);
        assert!(!registry.contains(dead.id()));
        assert!(alice.next_line().await.ends_with("] Mallory left the room"));
    }

    #[tokio::test]
    async fn test_oversized_broadcast_dropped() {
        let registry = Arc::new(SessionRegistry::new());
        let broadcaster = Broadcaster::new(Arc::clone(&registry)).with_max_line_len(64);
        let mut alice = peer(&registry, "Alice");

        // 22 bytes of timestamp prefix push this over the limit
        let long = "x".repeat(50);
        assert!(!broadcaster.broadcast(&long, None).await);
        assert!(broadcaster.broadcast("short", None).await);

        assert!(alice.next_line().await.ends_with("] short"));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_stalled_peer_removed_after_write_timeout() {
        let registry = Arc::new(SessionRegistry::new());
        let broadcaster = Broadcaster::new(Arc::clone(&registry));
        let mut alice = peer(&registry, "Alice");

        // Tiny pipe that nobody drains
        let (near, _stalled_far) = duplex(16);
        let (read, write) = split(near);
        let (stalled, _reader) = Connection::split(
            "127.0.0.1:40002".parse().unwrap(),
            read,
            write,
            Duration::from_millis(200),
            MAX_FRAME_SIZE,
        );
        registry.register(Arc::clone(&stalled));
        registry.set_nickname(stalled.id(), "Sleepy");
        let mut carol = peer(&registry, "Carol");

        broadcaster
            .broadcast("Alice: anyone awake?", Some(alice.conn.id()))
            .await;

        assert!(carol.next_line().await.ends_with("] Alice: anyone awake?"));
        assert!(carol.next_line().await.ends_with("] Sleepy left the room"));
        assert!(alice.next_line().await.ends_with("] Sleepy left the room"));
        assert!(!registry.contains(stalled.id()));
    }
}
