use std::fmt;

/// Errors returned by blocking queue and throttle operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    /// No item (or permit) became available before the timeout.
    #[error("timed out waiting on queue")]
    Timeout,

    /// The queue or throttle has been closed.
    #[error("queue closed")]
    Closed,
}

impl From<QueueError> for std::io::Error {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::Timeout => std::io::Error::new(std::io::ErrorKind::TimedOut, err),
            QueueError::Closed => std::io::Error::new(std::io::ErrorKind::BrokenPipe, err),
        }
    }
}

/// An item refused by a queue that is draining or closed.
///
/// The item is handed back to the caller.
pub struct Rejected<T>(pub T);

impl<T> Rejected<T> {
    /// Recover the rejected item.
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for Rejected<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Rejected(..)")
    }
}

impl<T> fmt::Display for Rejected<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("queue no longer accepts items")
    }
}

impl<T> std::error::Error for Rejected<T> {}

pub type Result<T> = std::result::Result<T, QueueError>;
