//! Text vocabulary carried inside `Line` frames.
//!
//! Verbs are colon-delimited. Anything that is not a recognised verb is chat.

use crate::error::{RelayError, Result};
use std::fmt;

pub const NICK_PROBE: &str = "NICK";
pub const NICKNAME_PREFIX: &str = "NICKNAME:";
pub const TRANSFER_REQUEST_PREFIX: &str = "FILE_TRANSFER_REQUEST:";
pub const TRANSFER_READY: &str = "FILE_TRANSFER_READY";
pub const TRANSFER_START: &str = "FILE_TRANSFER_START";
pub const FILE_INCOMING_PREFIX: &str = "FILE_INCOMING:";
pub const TRANSFER_ACCEPT: &str = "FILE_TRANSFER_ACCEPT";
pub const TRANSFER_DECLINE: &str = "FILE_TRANSFER_DECLINE";

/// Nickname used for a connection that has not announced itself yet
pub const UNKNOWN_NICKNAME: &str = "unknown";

/// A file announced by its sender: used both for the upload request and
/// for the `FILE_INCOMING` offer relayed to everyone else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileOffer {
    pub filename: String,
    pub size: u64,
    pub sender: String,
}

impl FileOffer {
    pub fn new(filename: impl Into<String>, size: u64, sender: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            size,
            sender: sender.into(),
        }
    }

    /// Parse `<filename>:<size>:<sender>`, splitting from the right so the
    /// filename may itself contain colons.
    fn parse_fields(fields: &str) -> Result<Self> {
        let mut parts = fields.rsplitn(3, ':');
        let sender = parts.next();
        let size = parts.next();
        let filename = parts.next();

        let (filename, size, sender) = match (filename, size, sender) {
            (Some(f), Some(s), Some(n)) => (f, s, n),
            _ => {
                return Err(RelayError::Malformed(format!(
                    "expected <filename>:<size>:<sender>, got {:?}",
                    fields
                )))
            }
        };

        if filename.is_empty() {
            return Err(RelayError::Malformed("empty filename".to_string()));
        }

        let size = size
            .parse::<u64>()
            .map_err(|_| RelayError::Malformed(format!("invalid file size {:?}", size)))?;

        Ok(Self::new(filename, size, sender))
    }
}

impl fmt::Display for FileOffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.filename, self.size, self.sender)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// server -> client: please announce your nickname
    NickProbe,
    /// client -> server
    Nickname(String),
    /// client -> server: wants to upload a file
    TransferRequest(FileOffer),
    /// server -> client: upload may start
    TransferReady,
    /// client -> server: Data frames follow
    TransferStart,
    /// server -> client: a stored file is on offer
    FileIncoming(FileOffer),
    /// client -> server
    TransferAccept,
    /// client -> server
    TransferDecline,
    /// Anything else
    Chat(String),
}

impl Message {
    /// Classify one line.
    ///
    /// Lines that carry a known verb prefix but the wrong fields are
    /// `RelayError::Malformed`; they are never downgraded to chat.
    pub fn parse(line: &str) -> Result<Self> {
        match line {
            NICK_PROBE => return Ok(Message::NickProbe),
            TRANSFER_READY => return Ok(Message::TransferReady),
            TRANSFER_START => return Ok(Message::TransferStart),
            TRANSFER_ACCEPT => return Ok(Message::TransferAccept),
            TRANSFER_DECLINE => return Ok(Message::TransferDecline),
            _ => {}
        }

        if let Some(rest) = line.strip_prefix(NICKNAME_PREFIX) {
            let name = rest.split(':').next().unwrap_or_default();
            if name.is_empty() {
                return Err(RelayError::Malformed("empty nickname".to_string()));
            }
            return Ok(Message::Nickname(name.to_string()));
        }

        if let Some(rest) = line.strip_prefix(TRANSFER_REQUEST_PREFIX) {
            return FileOffer::parse_fields(rest).map(Message::TransferRequest);
        }

        if let Some(rest) = line.strip_prefix(FILE_INCOMING_PREFIX) {
            return FileOffer::parse_fields(rest).map(Message::FileIncoming);
        }

        Ok(Message::Chat(line.to_string()))
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::NickProbe => f.write_str(NICK_PROBE),
            Message::Nickname(name) => write!(f, "{}{}", NICKNAME_PREFIX, name),
            Message::TransferRequest(offer) => write!(f, "{}{}", TRANSFER_REQUEST_PREFIX, offer),
            Message::TransferReady => f.write_str(TRANSFER_READY),
            Message::TransferStart => f.write_str(TRANSFER_START),
            Message::FileIncoming(offer) => write!(f, "{}{}", FILE_INCOMING_PREFIX, offer),
            Message::TransferAccept => f.write_str(TRANSFER_ACCEPT),
            Message::TransferDecline => f.write_str(TRANSFER_DECLINE),
            Message::Chat(text) => f.write_str(text),
        }
    }
}
