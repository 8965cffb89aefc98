use std::fmt;
use std::io;

/// Why a connection has to be torn down.
#[derive(Debug, thiserror::Error)]
pub enum ConnError {
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("request does not fit in the read buffer")]
    RequestTooLarge,
    #[error("response does not fit in the write buffer")]
    ResponseTooLarge,
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to set up listener: {0}")]
    Bind(#[source] io::Error),
    #[error("poll failed: {0}")]
    Poll(#[source] io::Error),
    #[error("failed to register with poller: {0}")]
    Register(#[source] io::Error),
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),
}

/// The worker queue had no room. The rejected task is handed back.
#[derive(thiserror::Error)]
#[error("task queue is full (capacity {capacity})")]
pub struct QueueFull<T> {
    pub task: T,
    pub capacity: usize,
}

impl<T> fmt::Debug for QueueFull<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueFull").field("capacity", &self.capacity).finish_non_exhaustive()
    }
}

/// Formatting ran past the end of the write buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("write buffer exhausted")]
pub struct Exhausted;
