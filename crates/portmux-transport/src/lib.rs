//! Carrier and endpoint stream abstraction.
//!
//! Provides one duplex stream contract over the byte streams portmux moves
//! traffic between:
//! - TCP sockets (carriers and forwarded ports)
//! - Local pipes (Unix domain sockets standing in for named pipes)
//!
//! This is the lowest layer of portmux. Everything else builds on top of
//! the [`Duplex`] trait and the [`EndpointStream`] type provided here.

pub mod error;
pub mod listener;
pub mod tcp;
pub mod traits;

#[cfg(unix)]
pub mod pipe;

pub use error::{Result, TransportError};
pub use listener::EndpointListener;
pub use tcp::TcpEndpoint;
pub use traits::{Duplex, EndpointStream};

#[cfg(unix)]
pub use pipe::{default_pipe_dir, pipe_path, PipeListener};
