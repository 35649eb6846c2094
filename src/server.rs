//! Listener and accept loop.
//!
//! One long-lived task accepts sockets; every accepted peer gets its own
//! task running a [`Session`].

use crate::broadcast::Broadcaster;
use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::error::Result;
use crate::protocol::Message;
use crate::registry::SessionRegistry;
use crate::relay::{FileRelay, FileStore};
use crate::session::{Session, SessionContext};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;

/// Asks a running [`Server`] to stop accepting and drop every peer.
#[derive(Clone)]
pub struct ShutdownHandle(Arc<Notify>);

impl ShutdownHandle {
    pub fn trigger(&self) {
        self.0.notify_one();
    }
}

pub struct Server {
    config: ServerConfig,
    listener: TcpListener,
    ctx: SessionContext,
    shutdown: Arc<Notify>,
}

impl Server {
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        config.validate()?;
        let listener = TcpListener::bind(config.bind_addr).await?;
        Ok(Self::from_listener(listener, config))
    }

    /// Serve on an already-bound listener; `config.bind_addr` is ignored.
    pub fn from_listener(listener: TcpListener, config: ServerConfig) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        let broadcaster =
            Arc::new(Broadcaster::new(registry).with_max_line_len(config.max_frame_size));
        let relay = Arc::new(FileRelay::new(
            FileStore::new(config.storage_dir.clone()),
            Arc::clone(&broadcaster),
        ));
        let ctx = SessionContext {
            broadcaster,
            relay,
            idle_timeout: config.idle_timeout(),
            transfer_timeout: config.transfer_timeout(),
            max_file_size: config.max_file_size,
        };

        Self {
            config,
            listener,
            ctx,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(self.ctx.broadcaster.registry())
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(Arc::clone(&self.shutdown))
    }

    /// Accept until shutdown is requested. An accept error is fatal and is
    /// returned to the caller.
    pub async fn run(&self) -> Result<()> {
        tracing::info!(
            "Relay listening on {} (storage: {})",
            self.local_addr()?,
            self.config.storage_dir.display()
        );

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, addr) = accepted?;
                    self.admit(stream, addr).await;
                }
                _ = self.shutdown.notified() => {
                    tracing::info!("Relay shutting down");
                    self.disconnect_everyone().await;
                    return Ok(());
                }
            }
        }
    }

    async fn admit(&self, stream: TcpStream, addr: SocketAddr) {
        tracing::info!("New connection from {}", addr);
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Could not set TCP_NODELAY for {}: {}", addr, e);
        }

        let (read, write) = stream.into_split();
        self.admit_split(addr, read, write).await;
    }

    /// Probe for a nickname, then register the peer and start its session.
    /// A peer whose probe cannot be sent is closed and never registered.
    async fn admit_split<R, W>(&self, addr: SocketAddr, read: R, write: W)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (connection, reader) = Connection::split(
            addr,
            read,
            write,
            self.config.write_timeout(),
            self.config.max_frame_size,
        );

        if !connection.send_line(Message::NickProbe.to_string()).await {
            tracing::warn!("Could not send nickname probe to {}, dropping", addr);
            connection.close().await;
            return;
        }

        self.ctx.broadcaster.registry().register(Arc::clone(&connection));
        tokio::spawn(Session::new(connection, reader, self.ctx.clone()).run());
    }

    async fn disconnect_everyone(&self) {
        let registry = self.ctx.broadcaster.registry();
        for connection in registry.snapshot() {
            self.ctx.broadcaster.disconnect(connection.id()).await;
        }
    }
}
