//! Per-connection protocol state machine.
//!
//! Each accepted peer gets one task running [`Session::run`]. The session
//! owns the read side of the stream and any upload in progress; everything
//! shared goes through the registry, broadcaster and relay.

use crate::broadcast::Broadcaster;
use crate::connection::{Connection, ConnectionReader};
use crate::error::{RelayError, Result};
use crate::protocol::{FileOffer, Frame, Message};
use crate::registry::SessionRegistry;
use crate::relay::{FileRelay, TransferState};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;

/// Everything a session needs that is shared across connections
#[derive(Clone)]
pub struct SessionContext {
    pub broadcaster: Arc<Broadcaster>,
    pub relay: Arc<FileRelay>,
    pub idle_timeout: Option<Duration>,
    pub transfer_timeout: Duration,
    pub max_file_size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// `NICK` has been sent, no nickname announced yet
    AwaitNickname,
    Idle,
    /// Worker is done; the connection has been removed
    Terminal,
}

pub struct Session<R> {
    connection: Arc<Connection>,
    reader: ConnectionReader<R>,
    ctx: SessionContext,
    state: SessionState,
    /// Set by `FILE_TRANSFER_REQUEST`, consumed by `FILE_TRANSFER_START`
    transfer: Option<TransferState>,
}

impl<R: AsyncRead + Unpin> Session<R> {
    pub fn new(
        connection: Arc<Connection>,
        reader: ConnectionReader<R>,
        ctx: SessionContext,
    ) -> Self {
        Self {
            connection,
            reader,
            ctx,
            state: SessionState::AwaitNickname,
            transfer: None,
        }
    }

    /// Drive the connection until it closes or fails, then remove it.
    pub async fn run(mut self) {
        let id = self.connection.id();
        let addr = self.connection.remote_addr();

        while self.state != SessionState::Terminal {
            match self.reader.receive(self.ctx.idle_timeout).await {
                Ok(Some(frame)) => {
                    if let Err(e) = self.handle_frame(frame).await {
                        if e.is_disconnect() {
                            tracing::info!("Client {} ({}) disconnected: {}", id, addr, e);
                        } else {
                            tracing::warn!("Dropping client {} ({}): {}", id, addr, e);
                        }
                        self.state = SessionState::Terminal;
                    }
                }
                Ok(None) => {
                    tracing::info!("Client {} ({}) closed the connection", id, addr);
                    self.state = SessionState::Terminal;
                }
                Err(e) => {
                    if e.is_disconnect() {
                        tracing::info!("Client {} ({}) disconnected: {}", id, addr, e);
                    } else {
                        tracing::warn!("Dropping client {} ({}): {}", id, addr, e);
                    }
                    self.state = SessionState::Terminal;
                }
            }
        }

        self.transfer = None;
        self.ctx.broadcaster.disconnect(id).await;
    }

    /// Act on one inbound frame. An `Err` means the connection must go.
    pub async fn handle_frame(&mut self, frame: Frame) -> Result<()> {
        let line = match frame {
            Frame::Line(line) => line,
            Frame::Data(data) => {
                tracing::debug!(
                    "Ignoring {} stray data bytes from {}",
                    data.len(),
                    self.connection.id()
                );
                return Ok(());
            }
        };

        let message = match Message::parse(&line) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!("Ignoring message from {}: {}", self.connection.id(), e);
                return Ok(());
            }
        };

        match message {
            Message::Nickname(name) => self.on_nickname(name).await,
            Message::TransferRequest(offer) => self.on_transfer_request(offer).await,
            Message::TransferStart => self.on_transfer_start().await,
            Message::TransferAccept => self.on_accept().await,
            Message::TransferDecline => {
                if let Some(offer) = self.registry().take_offer(self.connection.id()) {
                    tracing::info!("{} declined {}", self.connection.id(), offer.filename);
                }
                Ok(())
            }
            // Server-to-client verbs have no meaning here and go out as chat
            Message::NickProbe
            | Message::TransferReady
            | Message::FileIncoming(_)
            | Message::Chat(_) => {
                let nickname = self.registry().nickname(self.connection.id());
                self.ctx
                    .broadcaster
                    .broadcast(&format!("{}: {}", nickname, line), Some(self.connection.id()))
                    .await;
                Ok(())
            }
        }
    }

    fn registry(&self) -> &SessionRegistry {
        self.ctx.broadcaster.registry()
    }

    async fn on_nickname(&mut self, name: String) -> Result<()> {
        let id = self.connection.id();
        if !self.registry().set_nickname(id, name.clone()) {
            return Err(RelayError::Closed);
        }

        if self.state == SessionState::AwaitNickname {
            self.state = SessionState::Idle;
            tracing::info!("Client {} is now known as {}", id, name);
            self.ctx
                .broadcaster
                .broadcast(&format!("{} joined the room", name), Some(id))
                .await;
        } else {
            tracing::debug!("Client {} re-announced nickname {}", id, name);
        }
        Ok(())
    }

    async fn on_transfer_request(&mut self, offer: FileOffer) -> Result<()> {
        let id = self.connection.id();

        if let Err(e) = self.ctx.relay.store().resolve(&offer.filename) {
            tracing::warn!("Rejecting transfer request from {}: {}", id, e);
            return Ok(());
        }
        if offer.size > self.ctx.max_file_size {
            tracing::warn!(
                "Rejecting transfer request from {}: {} is {} bytes, limit is {}",
                id,
                offer.filename,
                offer.size,
                self.ctx.max_file_size
            );
            return Ok(());
        }

        if let Some(previous) = self.transfer.replace(TransferState::new(offer.clone())) {
            tracing::debug!(
                "Transfer request from {} replaces pending {}",
                id,
                previous.offer().filename
            );
        }

        self.ctx
            .broadcaster
            .broadcast(
                &format!(
                    "{} is sending file {} ({} bytes)",
                    offer.sender, offer.filename, offer.size
                ),
                None,
            )
            .await;

        if !self
            .connection
            .send(&Frame::line(Message::TransferReady.to_string()))
            .await
        {
            return Err(RelayError::Closed);
        }
        Ok(())
    }

    async fn on_transfer_start(&mut self) -> Result<()> {
        let Some(mut transfer) = self.transfer.take() else {
            tracing::debug!(
                "Ignoring FILE_TRANSFER_START from {} with no pending request",
                self.connection.id()
            );
            return Ok(());
        };

        while !transfer.is_complete() {
            match self.reader.receive(Some(self.ctx.transfer_timeout)).await {
                Ok(Some(Frame::Data(chunk))) => transfer.push(&chunk)?,
                Ok(Some(Frame::Line(_))) => {
                    return Err(RelayError::Transfer(format!(
                        "control line inside upload of {} after {} of {} bytes",
                        transfer.offer().filename,
                        transfer.received(),
                        transfer.offer().size
                    )));
                }
                Ok(None) => {
                    tracing::warn!(
                        "Upload of {} from {} interrupted after {} of {} bytes, discarding",
                        transfer.offer().filename,
                        self.connection.id(),
                        transfer.received(),
                        transfer.offer().size
                    );
                    return Err(RelayError::Closed);
                }
                Err(e) => return Err(e),
            }
        }

        if let Err(e) = self.ctx.relay.complete(self.connection.id(), transfer).await {
            tracing::error!("Failed to store upload from {}: {}", self.connection.id(), e);
        }
        Ok(())
    }

    async fn on_accept(&mut self) -> Result<()> {
        let id = self.connection.id();
        let Some(offer) = self.registry().take_offer(id) else {
            tracing::debug!("Ignoring FILE_TRANSFER_ACCEPT from {} with no offer", id);
            return Ok(());
        };

        let file = match self.ctx.relay.store().open(&offer).await {
            Ok(file) => file,
            Err(e) => {
                tracing::warn!("Cannot send {} to {}: {}", offer.filename, id, e);
                return Ok(());
            }
        };

        self.ctx.relay.deliver(&self.connection, file, &offer).await?;
        Ok(())
    }
}
