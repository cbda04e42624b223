use portmux_frame::ConnectionId;

/// Errors that can occur in tunnel operations.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] portmux_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] portmux_frame::FrameError),

    /// I/O error on a carrier or endpoint.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An allow list, firewall rule or target could not be parsed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The target or source was refused by admission control.
    #[error("not permitted: {0}")]
    NotPermitted(String),

    /// No logical connection with this id.
    #[error("unknown connection {0}")]
    UnknownConnection(ConnectionId),

    /// The session has been closed.
    #[error("session closed")]
    SessionClosed,

    /// The forwarder has been closed.
    #[error("forwarder closed")]
    ForwarderClosed,
}

pub type Result<T> = std::result::Result<T, TunnelError>;
