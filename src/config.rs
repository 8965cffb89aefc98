use mio::Token;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

pub const LISTENER_TOKEN: Token = Token(usize::MAX);
pub const WAKER_TOKEN: Token = Token(usize::MAX - 1);

pub const DEFAULT_PORT: u16 = 8080;
pub const DOC_ROOT: &str = "var/www/html";
pub const READ_BUF_SIZE: usize = 2048;
pub const WRITE_BUF_SIZE: usize = 1024;
pub const WORKERS: usize = 8;
pub const QUEUE_CAPACITY: usize = 10_000;
pub const MAX_CONNS: usize = 65536;
pub const MAX_EVENTS: usize = 10_000;
pub const MAX_RECYCLED_BUFS: usize = 256;
pub const LISTEN_BACKLOG: i32 = 1024;
pub const BUSY_MESSAGE: &[u8] = b"Internal server busy";
/// Longest a closed-for-writing connection waits for the peer's FIN.
pub const LINGER_TIMEOUT: Duration = Duration::from_secs(2);

/// Runtime settings for a [`Server`](crate::reactor::Server).
#[derive(Debug, Clone)]
pub struct Config {
    pub addr: SocketAddr,
    pub doc_root: PathBuf,
    pub workers: usize,
    pub queue_capacity: usize,
    pub max_conns: usize,
    pub events_capacity: usize,
    pub backlog: i32,
    /// Idle connections are evicted after this long. `None` disables eviction.
    pub idle_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            doc_root: PathBuf::from(DOC_ROOT),
            workers: WORKERS,
            queue_capacity: QUEUE_CAPACITY,
            max_conns: MAX_CONNS,
            events_capacity: MAX_EVENTS,
            backlog: LISTEN_BACKLOG,
            idle_timeout: None,
        }
    }
}
