//! Client side of the relay protocol.
//!
//! Owns no UI: callers decide what to do with each [`ClientEvent`], including
//! whether to accept an incoming file.
//!
//! Waits on the server (`FILE_TRANSFER_READY`, download data) are bounded by
//! the reply timeout. After a `RelayError::Timeout` the stream position is
//! unknown and the client should be dropped.

use crate::error::{RelayError, Result};
use crate::protocol::{
    read_frame, write_frame, FileOffer, Frame, Message, DATA_CHUNK_SIZE, MAX_FRAME_SIZE,
};
use crate::relay::validate_filename;
use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::time::{timeout, timeout_at, Instant};

/// How long to wait for the server to answer a request
pub const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Chat line or server notice, already timestamped by the server
    Line(String),
    /// Another peer's upload is on offer; answer with `accept` or `decline`
    FileIncoming(FileOffer),
    /// Server is ready for the upload requested last
    Ready,
}

pub struct RelayClient {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    nickname: String,
    max_frame_size: u32,
    /// Uploads above this are refused locally instead of left unanswered
    max_file_size: Option<u64>,
    reply_timeout: Duration,
    /// Events that arrived while waiting for something else
    pending: VecDeque<ClientEvent>,
}

impl RelayClient {
    /// Connect and announce `nickname` straight away.
    pub async fn connect(addr: impl ToSocketAddrs, nickname: impl Into<String>) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();

        let mut client = Self {
            reader,
            writer,
            nickname: nickname.into(),
            max_frame_size: MAX_FRAME_SIZE,
            max_file_size: None,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
            pending: VecDeque::new(),
        };
        client
            .send_message(&Message::Nickname(client.nickname.clone()))
            .await?;
        Ok(client)
    }

    /// Largest frame accepted from the server; match the server's
    /// `max_frame_size`.
    pub fn with_max_frame_size(mut self, max_frame_size: u32) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Refuse uploads the server would reject; match its `max_file_size`.
    pub fn with_max_file_size(mut self, max_file_size: u64) -> Self {
        self.max_file_size = Some(max_file_size);
        self
    }

    pub fn with_reply_timeout(mut self, reply_timeout: Duration) -> Self {
        self.reply_timeout = reply_timeout;
        self
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    pub async fn send_chat(&mut self, text: &str) -> Result<()> {
        self.send_message(&Message::Chat(text.to_string())).await
    }

    /// Upload a file: request, wait for the server to be ready, then stream
    /// the bytes. Lines received while waiting stay queued for
    /// [`next_event`](Self::next_event).
    ///
    /// Names the server would refuse are rejected before anything is sent.
    /// The server ignores requests it refuses, so a missing
    /// `FILE_TRANSFER_READY` ends in `RelayError::Timeout`.
    pub async fn send_file(&mut self, filename: &str, data: &[u8]) -> Result<()> {
        validate_filename(filename)?;
        let size = data.len() as u64;
        if let Some(limit) = self.max_file_size {
            if size > limit {
                return Err(RelayError::Transfer(format!(
                    "{} is {} bytes, server limit is {}",
                    filename, size, limit
                )));
            }
        }

        let offer = FileOffer::new(filename, size, self.nickname.clone());
        self.send_message(&Message::TransferRequest(offer)).await?;

        let reply_timeout = self.reply_timeout;
        let deadline = Instant::now() + reply_timeout;
        loop {
            let event = match timeout_at(deadline, self.read_event()).await {
                Ok(event) => event?,
                Err(_) => {
                    return Err(RelayError::Timeout(format!(
                        "server did not accept upload of {} within {:?}",
                        filename, reply_timeout
                    )))
                }
            };
            match event {
                Some(ClientEvent::Ready) => break,
                Some(event) => self.pending.push_back(event),
                None => return Err(RelayError::Closed),
            }
        }

        self.send_message(&Message::TransferStart).await?;
        for chunk in data.chunks(DATA_CHUNK_SIZE) {
            write_frame(&mut self.writer, &Frame::Data(Bytes::copy_from_slice(chunk))).await?;
        }
        Ok(())
    }

    /// Accept an offer and read exactly `offer.size` bytes back.
    ///
    /// The server sends nothing if the stored file is gone or has changed
    /// size, so a gap longer than the reply timeout ends in
    /// `RelayError::Timeout`.
    pub async fn accept(&mut self, offer: &FileOffer) -> Result<Bytes> {
        self.send_message(&Message::TransferAccept).await?;

        let capacity = offer.size.min(DATA_CHUNK_SIZE as u64 * 16) as usize;
        let mut payload = BytesMut::with_capacity(capacity);
        while (payload.len() as u64) < offer.size {
            let frame = match timeout(
                self.reply_timeout,
                read_frame(&mut self.reader, self.max_frame_size),
            )
            .await
            {
                Ok(frame) => frame?,
                Err(_) => {
                    return Err(RelayError::Timeout(format!(
                        "{} stalled after {} of {} bytes",
                        offer.filename,
                        payload.len(),
                        offer.size
                    )))
                }
            };
            match frame {
                Some(Frame::Data(chunk)) => {
                    if payload.len() as u64 + chunk.len() as u64 > offer.size {
                        return Err(RelayError::Transfer(format!(
                            "server sent more than {} bytes for {}",
                            offer.size, offer.filename
                        )));
                    }
                    payload.extend_from_slice(&chunk);
                }
                // Other peers keep talking during a download
                Some(Frame::Line(line)) => {
                    if let Some(event) = self.classify(line).await? {
                        self.pending.push_back(event);
                    }
                }
                None => return Err(RelayError::Closed),
            }
        }
        Ok(payload.freeze())
    }

    pub async fn decline(&mut self) -> Result<()> {
        self.send_message(&Message::TransferDecline).await
    }

    /// Next event from the server. `Ok(None)` once the server closes.
    pub async fn next_event(&mut self) -> Result<Option<ClientEvent>> {
        if let Some(event) = self.pending.pop_front() {
            return Ok(Some(event));
        }
        self.read_event().await
    }

    async fn read_event(&mut self) -> Result<Option<ClientEvent>> {
        loop {
            match read_frame(&mut self.reader, self.max_frame_size).await? {
                Some(Frame::Line(line)) => {
                    if let Some(event) = self.classify(line).await? {
                        return Ok(Some(event));
                    }
                }
                Some(Frame::Data(data)) => {
                    return Err(RelayError::Transfer(format!(
                        "{} unexpected data bytes outside a download",
                        data.len()
                    )));
                }
                None => return Ok(None),
            }
        }
    }

    /// Turn a line into an event, answering nickname probes on the way.
    async fn classify(&mut self, line: String) -> Result<Option<ClientEvent>> {
        match Message::parse(&line) {
            Ok(Message::NickProbe) => {
                self.send_message(&Message::Nickname(self.nickname.clone()))
                    .await?;
                Ok(None)
            }
            Ok(Message::TransferReady) => Ok(Some(ClientEvent::Ready)),
            Ok(Message::FileIncoming(offer)) => Ok(Some(ClientEvent::FileIncoming(offer))),
            _ => Ok(Some(ClientEvent::Line(line))),
        }
    }

    async fn send_message(&mut self, message: &Message) -> Result<()> {
        write_frame(&mut self.writer, &Frame::line(message.to_string())).await
    }

    pub async fn close(mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
