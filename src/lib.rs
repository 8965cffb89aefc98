//! Static file server built on an edge-triggered mio reactor and a fixed
//! worker pool.
//!
//! The reactor thread accepts connections, drains reads and flushes blocked
//! writes. Parsing and response assembly run on the workers. A connection is
//! only ever held by one of them at a time.

pub mod config;
pub mod conn;
pub mod error;
pub mod file;
pub mod parser;
pub mod pool;
pub mod reactor;
pub mod response;
pub mod slab;
pub mod sync;
pub mod timer;
pub mod worker;

pub use config::Config;
pub use error::{ConnError, ServerError};
pub use reactor::Server;
pub use timer::{IdleTracker, TimerWheel};
