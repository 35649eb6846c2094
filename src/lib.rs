//! LAN chat relay.
//!
//! A central server accepts TCP peers, gives each a nickname, fans chat lines
//! out to everyone else, and relays file uploads through server-side storage.
//!
//! # Architecture
//!
//! ```text
//! accept loop --> Connection --> Session (one task per peer)
//!                                   |
//!                    +--------------+--------------+
//!                    v              v              v
//!              SessionRegistry  Broadcaster    FileRelay
//!              (who is here)    (fan-out)      (store + offer)
//! ```
//!
//! Every unit on the wire is a length-prefixed frame; see [`protocol`].

pub mod broadcast;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod relay;
pub mod server;
pub mod session;

pub use broadcast::Broadcaster;
pub use client::{ClientEvent, RelayClient};
pub use config::ServerConfig;
pub use connection::{Connection, ConnectionId};
pub use error::{RelayError, Result};
pub use protocol::{FileOffer, Frame, Message};
pub use registry::SessionRegistry;
pub use relay::{FileRelay, FileStore, TransferState};
pub use server::{Server, ShutdownHandle};
pub use session::{Session, SessionContext, SessionState};
