//! Handoff queue and the byte streams built on it.
//!
//! - [`HandoffQueue`]: unbounded FIFO that hands items straight to the oldest
//!   waiting reader, with per-item dequeued callbacks
//! - [`Throttle`]: counting semaphore used to bound outstanding chunks
//! - [`QueueStream`]: `Read + Write` adapter over a queue of byte chunks,
//!   optionally throttled and with read coalescing (nagling)

pub mod error;
pub mod queue;
pub mod stream;
pub mod throttle;

pub use error::{QueueError, Rejected, Result};
pub use queue::{HandoffQueue, QueueState};
pub use stream::{QueueStream, StreamConfig};
pub use throttle::Throttle;
