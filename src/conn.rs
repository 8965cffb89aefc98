use crate::config::WRITE_BUF_SIZE;
use crate::error::ConnError;
use crate::file::{self, MappedFile};
use crate::parser::{Parse, Parser, State};
use crate::pool::ReadBuf;
use crate::response::{self, Outcome, SendPlan, WriteBuf};
use mio::net::TcpStream;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::path::Path;
use tracing::{debug, warn};

/// Where a drain-write left the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flush {
    /// The socket would block; wait for write readiness.
    Blocked,
    /// Response sent and the connection reset for the next request.
    KeepAlive,
    /// Response sent and the write side shut down. The peer's trailing bytes
    /// must be drained before closing, or the kernel resets the connection
    /// and drops whatever of the response is still unsent.
    Lingering,
}

/// Interest the owner must re-arm once it hands the connection back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rearm {
    Read,
    Write,
    /// Arm for read and drain until the peer closes.
    Linger,
    Close,
}

pub struct Conn {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    read_buf: ReadBuf,
    read_idx: usize,
    parser: Parser,
    write_buf: WriteBuf,
    plan: SendPlan,
    file: Option<MappedFile>,
    lingering: bool,
}

impl Conn {
    pub fn new(stream: TcpStream, peer: SocketAddr, read_buf: ReadBuf) -> Self {
        Self {
            stream,
            peer,
            read_buf,
            read_idx: 0,
            parser: Parser::new(),
            write_buf: WriteBuf::new(WRITE_BUF_SIZE),
            plan: SendPlan::new(),
            file: None,
            lingering: false,
        }
    }

    /// Split off the socket and the read buffer. Dropping the rest releases
    /// any mapping.
    pub fn into_parts(self) -> (TcpStream, ReadBuf) {
        (self.stream, self.read_buf)
    }

    #[inline]
    pub fn state(&self) -> State {
        self.parser.state()
    }

    #[inline]
    pub fn keep_alive(&self) -> bool {
        self.parser.request().keep_alive
    }

    #[inline]
    pub fn is_lingering(&self) -> bool {
        self.lingering
    }

    #[inline]
    pub fn buffered(&self) -> usize {
        self.read_idx
    }

    /// Drain the socket into the read buffer until it would block.
    pub fn read(&mut self) -> Result<(), ConnError> {
        loop {
            if self.read_idx >= self.read_buf.len() {
                return Err(ConnError::RequestTooLarge);
            }
            match self.stream.read(&mut self.read_buf[self.read_idx..]) {
                Ok(0) => return Err(ConnError::PeerClosed),
                Ok(n) => self.read_idx += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Read and discard until the socket would block. `Ok(true)` once the
    /// peer has closed its side.
    pub fn drain(&mut self) -> Result<bool, ConnError> {
        loop {
            match self.stream.read(&mut self.read_buf[..]) {
                Ok(0) => return Ok(true),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Run the parser over what has been read so far. `None` means the
    /// request is still incomplete.
    pub fn process(&mut self, doc_root: &Path) -> Option<Outcome> {
        match self.parser.parse(&mut self.read_buf[..], self.read_idx) {
            Parse::Incomplete => None,
            Parse::Malformed => Some(Outcome::BadRequest),
            Parse::Complete => {
                let target = &self.parser.request().target;
                Some(match file::open(doc_root, target) {
                    Ok(file) => {
                        self.file = Some(file);
                        Outcome::FileOk
                    }
                    Err(e) => {
                        debug!(peer = %self.peer, path = %target, error = %e, "request refused");
                        e.into()
                    }
                })
            }
        }
    }

    /// Lay out the response for `outcome`. Falls back to a 500 if the head
    /// does not fit, and fails if even that does not fit.
    pub fn respond(&mut self, outcome: Outcome) -> Result<(), ConnError> {
        let keep_alive = self.keep_alive();
        let file_len = self.file.as_ref().map_or(0, MappedFile::len);
        if response::build(&mut self.write_buf, &mut self.plan, outcome, keep_alive, file_len).is_ok() {
            return Ok(());
        }
        warn!(peer = %self.peer, ?outcome, "response does not fit, sending 500");
        self.unmap();
        response::build(&mut self.write_buf, &mut self.plan, Outcome::InternalError, keep_alive, 0)
            .map_err(|_| ConnError::ResponseTooLarge)
    }

    /// Write as much of the pending response as the socket takes.
    pub fn write(&mut self) -> Result<Flush, ConnError> {
        while !self.plan.is_done() {
            let res = {
                let file = self.file.as_ref().map_or(&[][..], MappedFile::as_bytes);
                let (slices, n) = self.plan.io_slices(self.write_buf.as_bytes(), file);
                self.stream.write_vectored(&slices[..n])
            };
            match res {
                Ok(0) => {
                    self.unmap();
                    return Err(io::Error::from(io::ErrorKind::WriteZero).into());
                }
                Ok(n) => self.plan.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Flush::Blocked),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.unmap();
                    return Err(e.into());
                }
            }
        }

        self.unmap();
        if self.keep_alive() {
            self.reset();
            return Ok(Flush::KeepAlive);
        }
        self.stream.shutdown(Shutdown::Write)?;
        self.lingering = true;
        Ok(Flush::Lingering)
    }

    /// Parse, respond and make the first write attempt.
    pub fn run(&mut self, doc_root: &Path) -> Rearm {
        let Some(outcome) = self.process(doc_root) else { return Rearm::Read };
        if let Err(e) = self.respond(outcome) {
            warn!(peer = %self.peer, error = %e, "failed to build response");
            return Rearm::Close;
        }
        match self.write() {
            Ok(Flush::Blocked) => Rearm::Write,
            Ok(Flush::KeepAlive) => Rearm::Read,
            Ok(Flush::Lingering) => Rearm::Linger,
            Err(e) => {
                debug!(peer = %self.peer, error = %e, "write failed");
                Rearm::Close
            }
        }
    }

    fn unmap(&mut self) {
        self.file = None;
    }

    fn reset(&mut self) {
        self.read_buf[..self.read_idx].fill(0);
        self.read_idx = 0;
        self.parser.reset();
        self.write_buf.clear();
        self.plan.clear();
        self.file = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::READ_BUF_SIZE;
    use std::fs::{self, Permissions};
    use std::net::{TcpListener, TcpStream as StdStream};
    use std::os::unix::fs::PermissionsExt;
    use std::thread;
    use std::time::Duration;

    fn pair() -> (Conn, StdStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = StdStream::connect(listener.local_addr().unwrap()).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        let conn = Conn::new(TcpStream::from_std(server), peer, Box::new([0u8; READ_BUF_SIZE]));
        (conn, client)
    }

    /// Non-blocking reads can race the client's write; poll until `want`
    /// bytes are buffered.
    fn read_until(conn: &mut Conn, want: usize) {
        for _ in 0..200 {
            conn.read().unwrap();
            if conn.buffered() >= want {
                return;
            }
            thread::sleep(Duration::from_millis(5));
        }
        panic!("only {} of {want} bytes arrived", conn.buffered());
    }

    fn read_response(client: &mut StdStream) -> String {
        let mut data = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(end) = data.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&data[..end]).to_string();
                let len: usize = head
                    .lines()
                    .find_map(|l| l.strip_prefix("Content-Length: "))
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap();
                if data.len() >= end + 4 + len {
                    return String::from_utf8(data).unwrap();
                }
            }
            let n = client.read(&mut chunk).unwrap();
            assert!(n > 0, "connection closed mid-response");
            data.extend_from_slice(&chunk[..n]);
        }
    }

    fn doc_root() -> tempfile::TempDir {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("index.html");
        fs::write(&path, b"<p>index</p>").unwrap();
        fs::set_permissions(&path, Permissions::from_mode(0o644)).unwrap();
        root
    }

    #[test]
    fn serves_file_and_closes_without_keep_alive() {
        let root = doc_root();
        let (mut conn, mut client) = pair();
        let req = b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n";
        client.write_all(req).unwrap();
        read_until(&mut conn, req.len());

        assert_eq!(conn.run(root.path()), Rearm::Linger);
        assert!(conn.is_lingering());
        let resp = read_response(&mut client);
        assert!(resp.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(resp.contains("Connection: close\r\n"));
        assert!(resp.ends_with("\r\n\r\n<p>index</p>"));
        assert_eq!(client.read(&mut [0u8; 16]).unwrap(), 0, "write side not shut down");

        client.write_all(b"late bytes").unwrap();
        drop(client);
        let mut closed = false;
        for _ in 0..200 {
            closed = conn.drain().unwrap();
            if closed {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(closed);
    }

    #[test]
    fn keep_alive_resets_for_second_request() {
        let root = doc_root();
        let (mut conn, mut client) = pair();
        let req = b"GET /index.html HTTP/1.1\r\nConnection: keep-alive\r\n\r\n";

        for _ in 0..2 {
            client.write_all(req).unwrap();
            read_until(&mut conn, req.len());
            assert_eq!(conn.run(root.path()), Rearm::Read);
            assert_eq!(conn.state(), State::RequestLine);
            assert_eq!(conn.buffered(), 0);
            let resp = read_response(&mut client);
            assert!(resp.contains("Connection: keep-alive\r\n"));
            assert!(resp.ends_with("<p>index</p>"));
        }
    }

    #[test]
    fn partial_request_asks_for_more_data() {
        let root = doc_root();
        let (mut conn, mut client) = pair();
        let head = b"GET /index.html HTTP/1.1\r\nContent-Length: 5\r\n\r\nabc";
        client.write_all(head).unwrap();
        read_until(&mut conn, head.len());
        assert_eq!(conn.run(root.path()), Rearm::Read);
        assert_eq!(conn.state(), State::Body);

        client.write_all(b"de").unwrap();
        read_until(&mut conn, head.len() + 2);
        assert_eq!(conn.run(root.path()), Rearm::Linger);
        assert!(read_response(&mut client).starts_with("HTTP/1.1 200 OK\r\n"));
    }

    #[test]
    fn post_gets_bad_request() {
        let root = doc_root();
        let (mut conn, mut client) = pair();
        let req = b"POST /index.html HTTP/1.1\r\n\r\n";
        client.write_all(req).unwrap();
        read_until(&mut conn, req.len());
        assert_eq!(conn.process(root.path()), Some(Outcome::BadRequest));
        conn.respond(Outcome::BadRequest).unwrap();
        assert_eq!(conn.write().unwrap(), Flush::Lingering);
        assert!(read_response(&mut client).starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[test]
    fn missing_and_forbidden_files() {
        let root = doc_root();
        let secret = root.path().join("secret.txt");
        fs::write(&secret, b"s").unwrap();
        fs::set_permissions(&secret, Permissions::from_mode(0o600)).unwrap();

        for (target, outcome) in [("/missing.html", Outcome::NotFound), ("/secret.txt", Outcome::Forbidden)] {
            let (mut conn, mut client) = pair();
            let req = format!("GET {target} HTTP/1.1\r\n\r\n");
            client.write_all(req.as_bytes()).unwrap();
            read_until(&mut conn, req.len());
            assert_eq!(conn.process(root.path()), Some(outcome));
        }
    }

    #[test]
    fn peer_close_is_an_error() {
        let (mut conn, client) = pair();
        drop(client);
        let mut result = Ok(());
        for _ in 0..200 {
            result = conn.read();
            if result.is_err() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(matches!(result, Err(ConnError::PeerClosed)));
    }

    #[test]
    fn oversized_request_is_rejected() {
        let (mut conn, mut client) = pair();
        client.write_all(&[b'a'; READ_BUF_SIZE + 10]).unwrap();
        let mut result = Ok(());
        for _ in 0..200 {
            result = conn.read();
            if result.is_err() {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(matches!(result, Err(ConnError::RequestTooLarge)));
    }
}
