//! Relay wire protocol.
//!
//! Every unit on the stream is a length-prefixed frame. `Line` frames carry
//! chat and the colon-delimited control vocabulary; `Data` frames carry file
//! bytes.
//!
//! ```text
//! client                                server
//!   |  <------------- NICK  ---------------|
//!   |  NICKNAME:Alice  -------------------> |
//!   |  FILE_TRANSFER_REQUEST:f:3:Alice ---> |
//!   |  <------- FILE_TRANSFER_READY  ------ |
//!   |  FILE_TRANSFER_START  --------------> |
//!   |  Data[3]  --------------------------> |   FILE_INCOMING:f:3:Alice -> others
//! ```

pub mod frame;
pub mod message;

pub use frame::{read_frame, write_frame, Frame, FrameKind, DATA_CHUNK_SIZE, MAX_FRAME_SIZE};
pub use message::{FileOffer, Message, UNKNOWN_NICKNAME};
