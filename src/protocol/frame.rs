//! Length-prefixed framing for the relay stream.
//!
//! Chat lines, control verbs and raw file bytes share one TCP stream, so
//! every unit is framed explicitly and parsing never depends on how the
//! kernel splits reads.

use crate::error::{RelayError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Wire format: all multi-byte integers are big-endian
/// Frame format: len:u32 | kind:u8 | payload
/// `len` counts payload bytes only.
pub const HEADER_LEN: usize = 5;

/// Default maximum frame payload (16MB)
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Chunk size for Data frames the relay emits
pub const DATA_CHUNK_SIZE: usize = 64 * 1024;

// =============================================================================
// Frame kinds
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Line = 0x01,
    Data = 0x02,
}

impl FrameKind {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Line),
            0x02 => Some(Self::Data),
            _ => None,
        }
    }
}

// =============================================================================
// Frame
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 text: chat, notices and control verbs
    Line(String),
    /// Raw file bytes
    Data(Bytes),
}

impl Frame {
    pub fn line(text: impl Into<String>) -> Self {
        Frame::Line(text.into())
    }

    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Line(_) => FrameKind::Line,
            Frame::Data(_) => FrameKind::Data,
        }
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            Frame::Line(text) => text.as_bytes(),
            Frame::Data(data) => data,
        }
    }

    pub fn encode(&self) -> Bytes {
        let payload = self.payload();
        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        buf.put_u32(payload.len() as u32);
        buf.put_u8(self.kind() as u8);
        buf.put_slice(payload);
        buf.freeze()
    }
}

// =============================================================================
// Frame reading/writing
// =============================================================================

/// Read a single frame from the stream.
///
/// Returns `Ok(None)` when the peer closed the stream on a frame boundary.
/// A close anywhere inside a frame is `RelayError::TruncatedFrame`.
pub async fn read_frame<R: AsyncRead + Unpin>(
    r: &mut R,
    max_size: u32,
) -> Result<Option<Frame>> {
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = r.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(RelayError::TruncatedFrame);
        }
        filled += n;
    }

    let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);

    // Validate frame size before allocation
    if len > max_size {
        return Err(RelayError::FrameTooLarge {
            size: len,
            limit: max_size,
        });
    }

    let kind = FrameKind::from_u8(header[4]).ok_or(RelayError::UnknownFrameKind(header[4]))?;

    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            RelayError::TruncatedFrame
        } else {
            RelayError::Io(e)
        }
    })?;

    let frame = match kind {
        FrameKind::Line => Frame::Line(String::from_utf8(payload)?),
        FrameKind::Data => Frame::Data(Bytes::from(payload)),
    };
    Ok(Some(frame))
}

/// Write one frame and flush it.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &Frame) -> Result<()> {
    w.write_all(&frame.encode()).await?;
    w.flush().await?;
    Ok(())
}
