use anyhow::{Context, Result};
use clap::Parser;
use staticd::config::{DEFAULT_PORT, DOC_ROOT, LISTEN_BACKLOG, MAX_CONNS, QUEUE_CAPACITY, WORKERS};
use staticd::{Config, Server};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "staticd", about = "Serve files from a document root over HTTP/1.1")]
struct Opt {
    /// Address to listen on.
    #[arg(default_value = "0.0.0.0")]
    ip: IpAddr,

    #[arg(default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Directory requested paths are resolved against.
    #[arg(long, default_value = DOC_ROOT)]
    root: PathBuf,

    #[arg(long, default_value_t = WORKERS)]
    workers: usize,

    /// Maximum number of requests waiting for a worker.
    #[arg(long, default_value_t = QUEUE_CAPACITY)]
    queue: usize,

    #[arg(long, default_value_t = MAX_CONNS)]
    max_conns: usize,

    /// Close connections idle for this many seconds. 0 disables.
    #[arg(long, default_value_t = 0)]
    idle_timeout: u64,

    #[arg(long, default_value_t = LISTEN_BACKLOG)]
    backlog: i32,
}

fn main() -> Result<()> {
    let opt = Opt::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("staticd=info")))
        .with_writer(std::io::stderr)
        .init();

    let config = Config {
        addr: SocketAddr::new(opt.ip, opt.port),
        doc_root: opt.root,
        workers: opt.workers,
        queue_capacity: opt.queue,
        max_conns: opt.max_conns,
        idle_timeout: (opt.idle_timeout > 0).then(|| Duration::from_secs(opt.idle_timeout)),
        backlog: opt.backlog,
        ..Config::default()
    };

    let mut server = Server::bind(&config).with_context(|| format!("failed to start on {}", config.addr))?;
    info!(
        addr = %server.local_addr(),
        root = %config.doc_root.display(),
        workers = config.workers,
        "staticd listening"
    );
    server.run().context("reactor stopped")
}
