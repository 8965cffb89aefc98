use crate::config::{Config, BUSY_MESSAGE, LINGER_TIMEOUT, LISTENER_TOKEN, MAX_RECYCLED_BUFS, WAKER_TOKEN};
use crate::conn::{Conn, Flush, Rearm};
use crate::error::{QueueFull, ServerError};
use crate::pool::BufPool;
use crate::slab::{ConnId, Removed, Slab};
use crate::timer::{IdleTracker, TimerWheel};
use crate::worker::WorkerPool;
use crossbeam_queue::SegQueue;
use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Waker};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{self, Write};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A connection on its way to a worker.
struct Task {
    id: ConnId,
    conn: Box<Conn>,
}

/// A connection on its way back from a worker, with the interest to re-arm.
struct Handoff {
    id: ConnId,
    conn: Box<Conn>,
    next: Rearm,
}

/// The reactor: owns the listener, the poller and every parked connection.
///
/// A connection is held by exactly one of the reactor or a single worker.
/// While a worker has it the slab slot is in flight and readiness for it is
/// not dispatched; re-registering on return picks up anything that arrived.
pub struct Server {
    poll: Poll,
    listener: TcpListener,
    conns: Slab<Box<Conn>>,
    bufs: BufPool,
    pool: WorkerPool<Task>,
    done: Arc<SegQueue<Handoff>>,
    idle: Option<(Box<dyn IdleTracker>, Duration)>,
    /// Connections draining the peer's last bytes after a final response.
    linger: TimerWheel,
    events_capacity: usize,
    local_addr: SocketAddr,
    expired: Vec<ConnId>,
}

fn bind_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let sock = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    sock.set_reuse_address(true)?;
    sock.set_nonblocking(true)?;
    sock.bind(&addr.into())?;
    sock.listen(backlog)?;
    Ok(TcpListener::from_std(sock.into()))
}

#[inline]
fn is_hangup(event: &Event) -> bool {
    event.is_error() || event.is_read_closed() || event.is_write_closed()
}

fn send_busy(stream: &mut TcpStream, peer: SocketAddr) {
    if let Err(e) = stream.write(BUSY_MESSAGE) {
        debug!(%peer, error = %e, "busy message not sent");
    }
}

impl Server {
    pub fn bind(config: &Config) -> Result<Self, ServerError> {
        Self::bind_with_pipeline(config, |conn: &mut Conn, doc_root: &Path| conn.run(doc_root))
    }

    /// Like [`bind`](Self::bind), with `pipeline` run on the workers in place
    /// of [`Conn::run`].
    pub fn bind_with_pipeline<F>(config: &Config, pipeline: F) -> Result<Self, ServerError>
    where
        F: Fn(&mut Conn, &Path) -> Rearm + Send + Sync + 'static,
    {
        let mut listener = bind_listener(config.addr, config.backlog).map_err(ServerError::Bind)?;
        let local_addr = listener.local_addr().map_err(ServerError::Bind)?;

        let poll = Poll::new().map_err(ServerError::Poll)?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)
            .map_err(ServerError::Register)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN).map_err(ServerError::Register)?);

        let done = Arc::new(SegQueue::new());
        let pool = {
            let doc_root = config.doc_root.clone();
            let done = Arc::clone(&done);
            WorkerPool::new(config.workers, config.queue_capacity, move |Task { id, mut conn }: Task| {
                let next = pipeline(&mut *conn, doc_root.as_path());
                done.push(Handoff { id, conn, next });
                if let Err(e) = waker.wake() {
                    warn!(error = %e, "failed to wake reactor");
                }
            })
            .map_err(ServerError::Spawn)?
        };

        let idle = config
            .idle_timeout
            .map(|timeout| (Box::new(TimerWheel::new()) as Box<dyn IdleTracker>, timeout));

        Ok(Self {
            poll,
            listener,
            conns: Slab::new(config.max_conns),
            bufs: BufPool::new(MAX_RECYCLED_BUFS),
            pool,
            done,
            idle,
            linger: TimerWheel::new(),
            events_capacity: config.events_capacity,
            local_addr,
            expired: Vec::new(),
        })
    }

    /// Replace the idle-eviction collaborator.
    pub fn with_idle_tracker(mut self, tracker: Box<dyn IdleTracker>, timeout: Duration) -> Self {
        self.idle = Some((tracker, timeout));
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn live_connections(&self) -> usize {
        self.conns.len()
    }

    /// Serve until the poller fails.
    pub fn run(&mut self) -> Result<(), ServerError> {
        let mut events = Events::with_capacity(self.events_capacity);
        info!(addr = %self.local_addr, workers = self.pool.workers(), "reactor running");

        loop {
            match self.poll.poll(&mut events, self.poll_timeout()) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ServerError::Poll(e)),
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_connections(),
                    WAKER_TOKEN => {}
                    token => self.handle_event(ConnId::from_token(token), event),
                }
            }

            self.complete_handoffs();
            self.evict_expired();
        }
    }

    fn poll_timeout(&self) -> Option<Duration> {
        let idle = self.idle.as_ref().map(|(tracker, _)| tracker.tick());
        let linger = (!self.linger.is_empty()).then(|| self.linger.tick());
        match (idle, linger) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(%peer, error = %e, "set_nodelay failed");
                    }
                    let buf = self.bufs.take();
                    let id = match self.conns.insert(Box::new(Conn::new(stream, peer, buf))) {
                        Ok(id) => id,
                        Err(conn) => {
                            warn!(%peer, "server busy, rejecting connection");
                            let (mut stream, buf) = (*conn).into_parts();
                            self.bufs.give_back(buf);
                            send_busy(&mut stream, peer);
                            continue;
                        }
                    };

                    let registered = match self.conns.get_mut(id) {
                        Some(conn) => self.poll.registry().register(&mut conn.stream, id.token(), Interest::READABLE),
                        None => continue,
                    };
                    if let Err(e) = registered {
                        warn!(%peer, error = %e, "register failed");
                        self.teardown(id);
                        continue;
                    }

                    if let Some((tracker, timeout)) = self.idle.as_mut() {
                        tracker.register(id, *timeout);
                    }
                    debug!(%peer, live = self.conns.len(), "accepted connection");
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "accept error");
                    break;
                }
            }
        }
    }

    fn handle_event(&mut self, id: ConnId, event: &Event) {
        if self.conns.is_in_flight(id) {
            if is_hangup(event) {
                self.teardown(id);
            }
            return;
        }
        let Some(conn) = self.conns.get_mut(id) else { return };

        if conn.is_lingering() {
            match conn.drain() {
                Ok(false) if !event.is_error() => {}
                Ok(_) => self.teardown(id),
                Err(e) => {
                    debug!(peer = %conn.peer, error = %e, "drain failed");
                    self.teardown(id);
                }
            }
        } else if is_hangup(event) {
            self.teardown(id);
        } else if event.is_readable() {
            match conn.read() {
                Ok(()) => {
                    if let Some((tracker, _)) = self.idle.as_mut() {
                        tracker.refresh(id);
                    }
                    self.submit(id);
                }
                Err(e) => {
                    debug!(peer = %conn.peer, error = %e, "read failed");
                    self.teardown(id);
                }
            }
        } else if event.is_writable() {
            match conn.write() {
                Ok(Flush::Blocked) => self.rearm(id, Interest::WRITABLE),
                Ok(Flush::KeepAlive) => self.rearm(id, Interest::READABLE),
                Ok(Flush::Lingering) => self.start_linger(id),
                Err(e) => {
                    debug!(peer = %conn.peer, error = %e, "write failed");
                    self.teardown(id);
                }
            }
        }
    }

    fn submit(&mut self, id: ConnId) {
        let Some(conn) = self.conns.check_out(id) else { return };
        if let Err(QueueFull { task, capacity }) = self.pool.submit(Task { id, conn }) {
            let Task { id, mut conn } = task;
            warn!(peer = %conn.peer, capacity, "worker queue full");
            send_busy(&mut conn.stream, conn.peer);
            match self.conns.check_in(id, conn) {
                Ok(_) => self.teardown(id),
                Err(conn) => self.close(id, conn),
            }
        }
    }

    fn complete_handoffs(&mut self) {
        while let Some(Handoff { id, conn, next }) = self.done.pop() {
            match self.conns.check_in(id, conn) {
                Ok(true) => self.teardown(id),
                Ok(false) => match next {
                    Rearm::Read => self.rearm(id, Interest::READABLE),
                    Rearm::Write => self.rearm(id, Interest::WRITABLE),
                    Rearm::Linger => self.start_linger(id),
                    Rearm::Close => self.teardown(id),
                },
                Err(conn) => {
                    warn!(peer = %conn.peer, "handoff for unknown connection");
                    self.close(id, conn);
                }
            }
        }
    }

    fn rearm(&mut self, id: ConnId, interest: Interest) {
        let Some(conn) = self.conns.get_mut(id) else { return };
        if let Err(e) = self.poll.registry().reregister(&mut conn.stream, id.token(), interest) {
            warn!(peer = %conn.peer, error = %e, "re-arm failed");
            self.teardown(id);
        }
    }

    /// The write side is already shut down. Closing with unread input would
    /// reset the connection, so wait for the peer's FIN or the linger timeout.
    fn start_linger(&mut self, id: ConnId) {
        self.linger.register(id, LINGER_TIMEOUT);
        self.rearm(id, Interest::READABLE);
    }

    fn evict_expired(&mut self) {
        let now = Instant::now();
        let mut expired = std::mem::take(&mut self.expired);
        self.linger.expired(now, &mut expired);
        if let Some((tracker, _)) = self.idle.as_mut() {
            tracker.expired(now, &mut expired);
        }
        for id in expired.drain(..) {
            debug!(?id, "timed out");
            self.teardown(id);
        }
        self.expired = expired;
    }

    /// Idempotent. A connection a worker still holds is only flagged here and
    /// closed when it comes back.
    fn teardown(&mut self, id: ConnId) {
        match self.conns.remove(id) {
            Removed::Parked(conn) => self.close(id, conn),
            Removed::Deferred => debug!(?id, "teardown deferred until worker returns"),
            Removed::Missing => {}
        }
    }

    fn close(&mut self, id: ConnId, mut conn: Box<Conn>) {
        let _ = self.poll.registry().deregister(&mut conn.stream);
        if let Some((tracker, _)) = self.idle.as_mut() {
            tracker.remove(id);
        }
        self.linger.remove(id);
        let peer = conn.peer;
        let (_, buf) = (*conn).into_parts();
        self.bufs.give_back(buf);
        debug!(%peer, live = self.conns.len(), "connection closed");
    }
}
