//! File relay: uploads are buffered per connection, stored server-side, then
//! offered to every other peer. Accepting peers get the stored bytes back as
//! `Data` frames.

use crate::broadcast::Broadcaster;
use crate::connection::{Connection, ConnectionId};
use crate::error::{RelayError, Result};
use crate::protocol::{FileOffer, Frame, Message, DATA_CHUNK_SIZE};
use bytes::{Bytes, BytesMut};
use std::ffi::OsStr;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

/// Upper bound on the buffer reserved up front for an upload
const INITIAL_BUFFER_LIMIT: u64 = 1024 * 1024;

// =============================================================================
// TransferState
// =============================================================================

/// An upload in progress on one connection.
///
/// Invariant: `received <= offer.size`; the transfer is complete exactly when
/// they are equal.
#[derive(Debug)]
pub struct TransferState {
    offer: FileOffer,
    received: u64,
    buffer: BytesMut,
}

impl TransferState {
    pub fn new(offer: FileOffer) -> Self {
        let capacity = offer.size.min(INITIAL_BUFFER_LIMIT) as usize;
        Self {
            offer,
            received: 0,
            buffer: BytesMut::with_capacity(capacity),
        }
    }

    pub fn offer(&self) -> &FileOffer {
        &self.offer
    }

    pub fn received(&self) -> u64 {
        self.received
    }

    pub fn remaining(&self) -> u64 {
        self.offer.size - self.received
    }

    pub fn is_complete(&self) -> bool {
        self.received == self.offer.size
    }

    /// Append a chunk. A chunk that would overrun the declared size is
    /// rejected whole and leaves the state untouched.
    pub fn push(&mut self, chunk: &[u8]) -> Result<()> {
        if chunk.len() as u64 > self.remaining() {
            return Err(RelayError::Transfer(format!(
                "{} overran declared size {} ({} + {} bytes)",
                self.offer.filename,
                self.offer.size,
                self.received,
                chunk.len()
            )));
        }
        self.buffer.extend_from_slice(chunk);
        self.received += chunk.len() as u64;
        Ok(())
    }

    /// Hand over the payload. Fails unless every declared byte arrived.
    pub fn into_payload(self) -> Result<(FileOffer, Bytes)> {
        if !self.is_complete() {
            return Err(RelayError::Transfer(format!(
                "{} incomplete: {} of {} bytes",
                self.offer.filename, self.received, self.offer.size
            )));
        }
        Ok((self.offer, self.buffer.freeze()))
    }
}

// =============================================================================
// FileStore
// =============================================================================

/// Check that a declared filename is a single plain path component, so a
/// peer cannot name anything outside the storage directory. Returns the
/// component to store under.
pub fn validate_filename(filename: &str) -> Result<&OsStr> {
    let mut components = Path::new(filename).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(name)), None) => Ok(name),
        _ => Err(RelayError::InvalidFileName(filename.to_string())),
    }
}

/// Server-side storage for relayed files, one file per declared name.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a declared filename to its path in the store.
    pub fn resolve(&self, filename: &str) -> Result<PathBuf> {
        Ok(self.root.join(validate_filename(filename)?))
    }

    /// Write the payload via a temp file and rename it over the target.
    /// An existing file with the same name is replaced.
    pub async fn persist(&self, filename: &str, payload: Bytes) -> Result<PathBuf> {
        let target = self.resolve(filename)?;
        let root = self.root.clone();
        let dest = target.clone();

        tokio::task::spawn_blocking(move || -> Result<()> {
            std::fs::create_dir_all(&root)?;
            let mut tmp = tempfile::NamedTempFile::new_in(&root)?;
            tmp.write_all(&payload)?;
            tmp.as_file().sync_all()?;
            tmp.persist(&dest).map_err(|e| RelayError::Io(e.error))?;
            Ok(())
        })
        .await
        .map_err(|e| RelayError::Transfer(format!("storage task failed: {}", e)))??;

        Ok(target)
    }

    /// Open a stored file, checking it still matches the size it was
    /// offered with.
    pub async fn open(&self, offer: &FileOffer) -> Result<File> {
        let path = self.resolve(&offer.filename)?;
        let file = File::open(&path).await?;
        let len = file.metadata().await?.len();
        if len != offer.size {
            return Err(RelayError::Transfer(format!(
                "{} is {} bytes on disk but was offered as {}",
                path.display(),
                len,
                offer.size
            )));
        }
        Ok(file)
    }
}

// =============================================================================
// FileRelay
// =============================================================================

pub struct FileRelay {
    store: FileStore,
    broadcaster: Arc<Broadcaster>,
}

impl FileRelay {
    pub fn new(store: FileStore, broadcaster: Arc<Broadcaster>) -> Self {
        Self { store, broadcaster }
    }

    pub fn store(&self) -> &FileStore {
        &self.store
    }

    /// Finish an upload: store it, tell the room, and offer it to every
    /// other peer. An incomplete transfer is rejected before anything is
    /// written or announced.
    pub async fn complete(
        &self,
        from: ConnectionId,
        transfer: TransferState,
    ) -> Result<FileOffer> {
        let (declared, payload) = transfer.into_payload()?;
        let sender = self.broadcaster.registry().nickname(from);

        let path = self.store.persist(&declared.filename, payload).await?;
        tracing::info!(
            "Stored {} ({} bytes) from {} at {}",
            declared.filename,
            declared.size,
            sender,
            path.display()
        );

        self.broadcaster
            .broadcast(
                &format!("{} sent file: {}", sender, declared.filename),
                Some(from),
            )
            .await;

        let offer = FileOffer::new(declared.filename, declared.size, sender);
        self.offer_to_others(from, &offer).await;
        Ok(offer)
    }

    /// Send `FILE_INCOMING` to everyone but `from`, recording the offer for
    /// each peer before it can possibly answer.
    pub async fn offer_to_others(&self, from: ConnectionId, offer: &FileOffer) {
        let registry = self.broadcaster.registry();
        let line = Message::FileIncoming(offer.clone()).to_string();
        if !self.broadcaster.fits(&line) {
            tracing::warn!("Not offering {}: offer line too long", offer.filename);
            return;
        }
        let frame = Frame::line(line);

        let mut failed = Vec::new();
        for connection in registry.snapshot() {
            if connection.id() == from {
                continue;
            }
            registry.set_offer(connection.id(), offer.clone());
            if !connection.send(&frame).await {
                failed.push(connection.id());
            }
        }
        self.broadcaster.disconnect_all(failed).await;
    }

    /// Stream an opened stored file to `to` as exactly `offer.size` bytes of
    /// `Data` frames.
    pub async fn deliver(&self, to: &Connection, mut file: File, offer: &FileOffer) -> Result<u64> {
        let mut buf = vec![0u8; DATA_CHUNK_SIZE];
        let mut sent = 0u64;

        while sent < offer.size {
            let want = (offer.size - sent).min(DATA_CHUNK_SIZE as u64) as usize;
            let n = file.read(&mut buf[..want]).await?;
            if n == 0 {
                return Err(RelayError::Transfer(format!(
                    "{} shrank while being sent ({} of {} bytes)",
                    offer.filename, sent, offer.size
                )));
            }
            if !to.send(&Frame::Data(Bytes::copy_from_slice(&buf[..n]))).await {
                return Err(RelayError::Closed);
            }
            sent += n as u64;
        }

        tracing::info!(
            "Delivered {} ({} bytes) to {}",
            offer.filename,
            sent,
            to.id()
        );
        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{read_frame, MAX_FRAME_SIZE};
    use crate::registry::SessionRegistry;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::io::{duplex, split};

    #[test]
    fn test_transfer_state_progress() {
        let mut state = TransferState::new(FileOffer::new("a.bin", 5, "Alice"));
        assert!(!state.is_complete());
        state.push(b"abc").unwrap();
        assert_eq!(state.received(), 3);
        assert_eq!(state.remaining(), 2);
        state.push(b"de").unwrap();
        assert!(state.is_complete());

        let (offer, payload) = state.into_payload().unwrap();
        assert_eq!(offer.filename, "a.bin");
        assert_eq!(payload.as_ref(), b"abcde");
    }

    #[test]
    fn test_transfer_state_rejects_overrun() {
        let mut state = TransferState::new(FileOffer::new("a.bin", 2, "Alice"));
        assert!(matches!(state.push(b"abc"), Err(RelayError::Transfer(_))));
        assert_eq!(state.received(), 0);
    }

    #[test]
    fn test_zero_size_transfer_complete_immediately() {
        let state = TransferState::new(FileOffer::new("empty.txt", 0, "Alice"));
        assert!(state.is_complete());
        let (_, payload) = state.into_payload().unwrap();
        assert!(payload.is_empty());
    }

    #[test]
    fn test_interrupted_transfer_not_complete() {
        let mut state = TransferState::new(FileOffer::new("big.bin", 10, "Alice"));
        state.push(&[0u8; 4]).unwrap();
        assert!(!state.is_complete());
        assert!(matches!(state.into_payload(), Err(RelayError::Transfer(_))));
    }

    #[test]
    fn test_resolve_rejects_escapes() {
        let store = FileStore::new("/srv/files");
        assert_eq!(
            store.resolve("report.pdf").unwrap(),
            PathBuf::from("/srv/files/report.pdf")
        );
        for bad in ["", "..", "../etc/passwd", "/etc/passwd", "a/b.txt", "./a"] {
            assert!(
                matches!(store.resolve(bad), Err(RelayError::InvalidFileName(_))),
                "{:?} should be rejected",
                bad
            );
        }
    }

    #[tokio::test]
    async fn test_persist_creates_dir_and_overwrites() {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::new(tmp.path().join("server_files"));

        let path = store
            .persist("note.txt", Bytes::from_static(b"first"))
            .await
            .unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"first");

        store
            .persist("note.txt", Bytes::from_static(b"second!"))
            .await
            .unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"second!");

        // No temp files left behind
        let entries = std::fs::read_dir(store.root()).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[tokio::test]
    async fn test_open_checks_size() {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::new(tmp.path());
        store
            .persist("a.txt", Bytes::from_static(b"abc"))
            .await
            .unwrap();

        assert!(store.open(&FileOffer::new("a.txt", 3, "Alice")).await.is_ok());
        assert!(matches!(
            store.open(&FileOffer::new("a.txt", 4, "Alice")).await,
            Err(RelayError::Transfer(_))
        ));
        assert!(matches!(
            store.open(&FileOffer::new("missing.txt", 1, "Alice")).await,
            Err(RelayError::Io(_))
        ));
    }

    #[tokio::test]
    async fn test_deliver_streams_exact_size() {
        let tmp = TempDir::new().unwrap();
        let store = FileStore::new(tmp.path());
        let payload: Vec<u8> = (0..(DATA_CHUNK_SIZE * 2 + 17)).map(|i| i as u8).collect();
        store
            .persist("blob.bin", Bytes::from(payload.clone()))
            .await
            .unwrap();

        let registry = Arc::new(SessionRegistry::new());
        let relay = FileRelay::new(store, Arc::new(Broadcaster::new(registry)));

        let (near, mut far) = duplex(1024 * 1024);
        let (read, write) = split(near);
        let (conn, _reader) = Connection::split(
            "127.0.0.1:40000".parse().unwrap(),
            read,
            write,
            Duration::from_secs(5),
            MAX_FRAME_SIZE,
        );

        let offer = FileOffer::new("blob.bin", payload.len() as u64, "Alice");
        let file = relay.store().open(&offer).await.unwrap();
        let sent = relay.deliver(&conn, file, &offer).await.unwrap();
        assert_eq!(sent, payload.len() as u64);

        let mut received = Vec::new();
        while received.len() < payload.len() {
            match read_frame(&mut far, MAX_FRAME_SIZE).await.unwrap() {
                Some(Frame::Data(chunk)) => {
                    assert!(chunk.len() <= DATA_CHUNK_SIZE);
                    received.extend_from_slice(&chunk);
                }
                other => panic!("Expected data, got {:?}", other),
            }
        }
        assert_eq!(received, payload);
    }
}
