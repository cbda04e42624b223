//! Connection-multiplexing frame codec.
//!
//! Every chunk of a logical connection travels over the carrier as one frame:
//! - A 4-byte little-endian connection id
//! - A 2-byte little-endian payload length
//! - The payload
//!
//! A zero-length frame closes the logical connection. Each carrier also starts
//! with a one-time target preamble (see [`preamble`]).

#[cfg(feature = "async")]
pub mod async_codec;
pub mod codec;
pub mod error;
pub mod preamble;
pub mod reader;
pub mod writer;

#[cfg(feature = "async")]
pub use async_codec::MuxCodec;
pub use codec::{
    decode_frame, encode_frame, ConnectionId, Frame, MAX_FRAME_PAYLOAD, PREAMBLE_SIZE,
};
pub use error::{FrameError, Result};
pub use preamble::{
    read_target_preamble, write_target_preamble, ConnectionTarget, MAX_PREAMBLE_LEN,
};
pub use reader::FrameReader;
pub use writer::{FrameWriter, SharedFrameWriter};
