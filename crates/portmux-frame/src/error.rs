/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The payload does not fit in a single frame.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The carrier ended inside a frame.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The target preamble is malformed or not recognised.
    #[error("invalid target preamble: {0}")]
    InvalidPreamble(String),

    /// The stream accepted no more bytes.
    #[error("connection closed")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, FrameError>;
