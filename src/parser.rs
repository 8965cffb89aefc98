//! Incremental HTTP/1.1 request parser.
//!
//! The parser never owns the bytes. Each call scans whatever the connection
//! has buffered since the last call, so a request may arrive in any number of
//! reads. Line terminators are overwritten with NUL in place once consumed.

use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Method {
    #[default]
    Get,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum State {
    #[default]
    RequestLine,
    Headers,
    Body,
}

/// Result of scanning for one line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Line {
    Complete,
    Incomplete,
    Malformed,
}

/// Result of driving the state machine over the buffered bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parse {
    /// Wait for more bytes; the state is kept for the next call.
    Incomplete,
    Complete,
    Malformed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    pub method: Method,
    pub target: String,
    pub version: String,
    pub host: Option<String>,
    pub content_length: usize,
    pub keep_alive: bool,
}

enum Step {
    Continue,
    Done,
    Bad,
}

#[derive(Debug, Default)]
pub struct Parser {
    state: State,
    checked_idx: usize,
    start_line: usize,
    request: Request,
}

#[inline]
fn is_blank(c: char) -> bool {
    c == ' ' || c == '\t'
}

fn strip_prefix_ignore_case<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        Some(text[prefix.len()..].trim_start_matches(is_blank))
    } else {
        None
    }
}

fn leading_number(value: &str) -> usize {
    value
        .bytes()
        .take_while(u8::is_ascii_digit)
        .fold(0usize, |n, d| n.saturating_mul(10).saturating_add((d - b'0') as usize))
}

impl Parser {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn state(&self) -> State {
        self.state
    }

    #[inline]
    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Offset of the first byte not yet consumed by the parser.
    #[inline]
    pub fn checked_idx(&self) -> usize {
        self.checked_idx
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Advance over `buf[..read_idx]`. `buf` must be the same buffer, with the
    /// same prefix, on every call until `reset`.
    pub fn parse(&mut self, buf: &mut [u8], read_idx: usize) -> Parse {
        let read_idx = read_idx.min(buf.len());
        loop {
            if self.state == State::Body {
                return if read_idx - self.checked_idx >= self.request.content_length {
                    Parse::Complete
                } else {
                    Parse::Incomplete
                };
            }

            match self.scan_line(buf, read_idx) {
                Line::Complete => {}
                Line::Incomplete => return Parse::Incomplete,
                Line::Malformed => return Parse::Malformed,
            }

            let start = std::mem::replace(&mut self.start_line, self.checked_idx);
            let Ok(text) = std::str::from_utf8(&buf[start..self.checked_idx - 2]) else {
                return Parse::Malformed;
            };
            trace!(line = text, "got request line");

            let step = match self.state {
                State::RequestLine => self.request_line(text),
                State::Headers => self.header(text),
                State::Body => Step::Continue,
            };
            match step {
                Step::Continue => {}
                Step::Done => return Parse::Complete,
                Step::Bad => return Parse::Malformed,
            }
        }
    }

    /// Look for the end of the current line in `buf[checked_idx..read_idx]`.
    pub fn scan_line(&mut self, buf: &mut [u8], read_idx: usize) -> Line {
        while self.checked_idx < read_idx {
            let i = self.checked_idx;
            match buf[i] {
                b'\r' => {
                    if i + 1 == read_idx {
                        return Line::Incomplete;
                    }
                    if buf[i + 1] != b'\n' {
                        return Line::Malformed;
                    }
                    buf[i] = 0;
                    buf[i + 1] = 0;
                    self.checked_idx = i + 2;
                    return Line::Complete;
                }
                b'\n' => {
                    if i > self.start_line && buf[i - 1] == b'\r' {
                        buf[i - 1] = 0;
                        buf[i] = 0;
                        self.checked_idx = i + 1;
                        return Line::Complete;
                    }
                    return Line::Malformed;
                }
                0 => return Line::Malformed,
                _ => self.checked_idx += 1,
            }
        }
        Line::Incomplete
    }

    fn request_line(&mut self, text: &str) -> Step {
        let Some((method, rest)) = text.split_once(is_blank) else { return Step::Bad };
        if !method.eq_ignore_ascii_case("GET") {
            return Step::Bad;
        }
        let rest = rest.trim_start_matches(is_blank);
        let Some((target, version)) = rest.split_once(is_blank) else { return Step::Bad };
        let version = version.trim_start_matches(is_blank);
        if !version.eq_ignore_ascii_case("HTTP/1.1") {
            return Step::Bad;
        }

        let target = match target.get(..7) {
            Some(scheme) if scheme.eq_ignore_ascii_case("http://") => {
                match target[7..].find('/') {
                    Some(i) => &target[7 + i..],
                    None => return Step::Bad,
                }
            }
            _ => target,
        };
        if !target.starts_with('/') {
            return Step::Bad;
        }

        self.request.method = Method::Get;
        self.request.target = target.to_owned();
        self.request.version = version.to_owned();
        self.state = State::Headers;
        Step::Continue
    }

    fn header(&mut self, text: &str) -> Step {
        if text.is_empty() {
            if self.request.content_length > 0 {
                self.state = State::Body;
                return Step::Continue;
            }
            return Step::Done;
        }

        if let Some(value) = strip_prefix_ignore_case(text, "Connection:") {
            if value.eq_ignore_ascii_case("keep-alive") {
                self.request.keep_alive = true;
            }
        } else if let Some(value) = strip_prefix_ignore_case(text, "Content-Length:") {
            self.request.content_length = leading_number(value);
        } else if let Some(value) = strip_prefix_ignore_case(text, "Host:") {
            self.request.host = Some(value.to_owned());
        } else {
            trace!(header = text, "ignoring unknown header");
        }
        Step::Continue
    }
}
