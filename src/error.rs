use std::io;
use std::string::FromUtf8Error;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Frame size {size} exceeds maximum allowed size {limit}")]
    FrameTooLarge { size: u32, limit: u32 },

    #[error("Unknown frame kind: {0:#04x}")]
    UnknownFrameKind(u8),

    #[error("Invalid UTF-8 in line frame: {0}")]
    InvalidUtf8(#[from] FromUtf8Error),

    #[error("Stream closed in the middle of a frame")]
    TruncatedFrame,

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Invalid file name: {0}")]
    InvalidFileName(String),

    #[error("Transfer error: {0}")]
    Transfer(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Connection closed by peer")]
    Closed,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl RelayError {
    /// Whether the error means the peer went away rather than misbehaved.
    pub fn is_disconnect(&self) -> bool {
        match self {
            RelayError::Closed | RelayError::TruncatedFrame => true,
            RelayError::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;
