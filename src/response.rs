use crate::error::Exhausted;
use std::fmt;
use std::io::{self, IoSlice, Write};

const EMPTY_PAGE: &str = "<html><body></body></html>";

/// Terminal result of processing a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    BadRequest,
    NotFound,
    Forbidden,
    InternalError,
    FileOk,
}

impl Outcome {
    pub fn status(self) -> u16 {
        match self {
            Outcome::FileOk => 200,
            Outcome::BadRequest => 400,
            Outcome::Forbidden => 403,
            Outcome::NotFound => 404,
            Outcome::InternalError => 500,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            Outcome::FileOk => "OK",
            Outcome::BadRequest => "Bad Request",
            Outcome::Forbidden => "Forbidden",
            Outcome::NotFound => "Not Found",
            Outcome::InternalError => "Internal Error",
        }
    }

    fn body(self) -> &'static str {
        match self {
            Outcome::FileOk => EMPTY_PAGE,
            Outcome::BadRequest => "Your request has bad syntax or is inherently impossible to satisfy.\n",
            Outcome::Forbidden => "You do not have permission to get file from this server.\n",
            Outcome::NotFound => "The requested file was not found on this server.\n",
            Outcome::InternalError => "There was an unusual problem serving the requested file.\n",
        }
    }
}

/// Fixed-capacity buffer the response head (and small bodies) is formatted into.
pub struct WriteBuf {
    buf: Box<[u8]>,
    len: usize,
}

impl WriteBuf {
    pub fn new(capacity: usize) -> Self {
        Self { buf: vec![0u8; capacity].into_boxed_slice(), len: 0 }
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    pub fn push_fmt(&mut self, args: fmt::Arguments<'_>) -> Result<(), Exhausted> {
        let mut cursor = io::Cursor::new(&mut self.buf[self.len..]);
        if cursor.write_fmt(args).is_err() {
            return Err(Exhausted);
        }
        self.len += cursor.position() as usize;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Bytes owned by the connection's write buffer.
    Head,
    /// Bytes borrowed from the mapped file.
    Mapped,
}

/// Unsent range `start..end` of one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub source: Source,
    pub start: usize,
    pub end: usize,
}

impl Segment {
    #[inline]
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

/// Ordered segments for one response, consumed front to back.
#[derive(Debug, Default)]
pub struct SendPlan {
    segments: Vec<Segment>,
}

impl SendPlan {
    pub fn new() -> Self {
        Self { segments: Vec::with_capacity(2) }
    }

    pub fn clear(&mut self) {
        self.segments.clear();
    }

    pub fn push(&mut self, source: Source, len: usize) {
        if len > 0 {
            self.segments.push(Segment { source, start: 0, end: len });
        }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn remaining(&self) -> usize {
        self.segments.iter().map(Segment::len).sum()
    }

    pub fn is_done(&self) -> bool {
        self.segments.is_empty()
    }

    /// Mark `n` bytes as written.
    pub fn advance(&mut self, mut n: usize) {
        while n > 0 {
            let Some(front) = self.segments.first_mut() else { break };
            let step = n.min(front.len());
            front.start += step;
            n -= step;
            if front.is_empty() {
                self.segments.remove(0);
            }
        }
    }

    /// Borrow the unsent bytes as I/O slices. Returns the slices and how many
    /// of them are in use.
    pub fn io_slices<'a>(&self, head: &'a [u8], file: &'a [u8]) -> ([IoSlice<'a>; 2], usize) {
        let mut out = [IoSlice::new(&[]), IoSlice::new(&[])];
        let mut n = 0;
        for seg in self.segments.iter().take(out.len()) {
            let bytes = match seg.source {
                Source::Head => &head[seg.start..seg.end],
                Source::Mapped => &file[seg.start..seg.end],
            };
            out[n] = IoSlice::new(bytes);
            n += 1;
        }
        (out, n)
    }
}

fn headers(out: &mut WriteBuf, content_len: usize, keep_alive: bool) -> Result<(), Exhausted> {
    out.push_fmt(format_args!("Content-Length: {content_len}\r\n"))?;
    let conn = if keep_alive { "keep-alive" } else { "close" };
    out.push_fmt(format_args!("Connection: {conn}\r\n"))?;
    out.push_fmt(format_args!("\r\n"))
}

/// Format the response for `outcome` into `out` and lay out `plan`.
///
/// A non-empty file is not copied: the plan gets a second segment covering
/// `file_len` bytes of the mapping.
pub fn build(
    out: &mut WriteBuf,
    plan: &mut SendPlan,
    outcome: Outcome,
    keep_alive: bool,
    file_len: usize,
) -> Result<(), Exhausted> {
    out.clear();
    plan.clear();
    out.push_fmt(format_args!("HTTP/1.1 {} {}\r\n", outcome.status(), outcome.reason()))?;

    if outcome == Outcome::FileOk && file_len > 0 {
        headers(out, file_len, keep_alive)?;
        plan.push(Source::Head, out.len());
        plan.push(Source::Mapped, file_len);
        return Ok(());
    }

    let body = outcome.body();
    headers(out, body.len(), keep_alive)?;
    out.push_fmt(format_args!("{body}"))?;
    plan.push(Source::Head, out.len());
    Ok(())
}
