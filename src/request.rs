//! Resumable HTTP/1.1 request parser.
//!
//! The parser is driven once per read: it consumes as many complete lines as
//! the buffer holds, and an unterminated trailing line leaves both the parse
//! state and the buffer's consumed cursor untouched. Delivering a request one
//! byte per read therefore yields exactly the result of delivering it whole.

use std::ops::Range;

use tracing::{debug, info};

use crate::buffer::ReadBuffer;
use crate::constants::DEFAULT_PAGE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Method {
    #[default]
    Get,
    Post,
}

impl Method {
    fn parse(token: &str) -> Option<Self> {
        if token.eq_ignore_ascii_case("GET") {
            Some(Method::Get)
        } else if token.eq_ignore_ascii_case("POST") {
            Some(Method::Post)
        } else {
            None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseState {
    #[default]
    RequestLine,
    Headers,
    Body,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseOutcome {
    /// More bytes are needed; nothing already parsed is lost.
    Incomplete,
    /// A full request is available through the accessors.
    Complete,
    /// Malformed request line, header or target.
    BadRequest,
}

#[derive(Debug, Default)]
pub struct RequestParser {
    state: ParseState,
    /// Absolute offset up to which pending bytes hold no line terminator.
    scanned: usize,
    method: Method,
    target: String,
    host: Option<String>,
    content_length: usize,
    keep_alive: bool,
    body: Option<Range<usize>>,
}

enum Line {
    Complete { start: usize, end: usize, next: usize },
    Open,
}

impl RequestParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    pub fn method(&self) -> Method {
        self.method
    }

    /// Request target, with scheme/host stripped and `/` rewritten.
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn content_length(&self) -> usize {
        self.content_length
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Request body, verbatim. Empty unless the request carried one.
    pub fn body<'a>(&self, buf: &'a ReadBuffer) -> &'a [u8] {
        match &self.body {
            Some(range) => buf.slice(range.start, range.end),
            None => &[],
        }
    }

    /// Advance the state machine over whatever `buf` holds.
    pub fn parse(&mut self, buf: &mut ReadBuffer) -> ParseOutcome {
        loop {
            match self.state {
                ParseState::Done => return ParseOutcome::Complete,
                ParseState::Body => return self.parse_body(buf),
                ParseState::RequestLine | ParseState::Headers => {}
            }

            let (start, end, next) = match self.next_line(buf) {
                Ok(Line::Complete { start, end, next }) => (start, end, next),
                Ok(Line::Open) => return ParseOutcome::Incomplete,
                Err(()) => return ParseOutcome::BadRequest,
            };

            let Ok(text) = std::str::from_utf8(buf.slice(start, end)) else {
                return ParseOutcome::BadRequest;
            };
            debug!(line = text, "parsed line");

            let step = match self.state {
                ParseState::RequestLine => self.parse_request_line(text),
                _ => self.parse_header(text, buf.capacity().saturating_sub(next)),
            };
            buf.consume(next - start);
            self.scanned = buf.consumed();

            if let Err(()) = step {
                return ParseOutcome::BadRequest;
            }
        }
    }

    /// Locate the next LF-terminated line in the pending region.
    ///
    /// A CR is only legal immediately before the LF.
    fn next_line(&mut self, buf: &ReadBuffer) -> Result<Line, ()> {
        let start = buf.consumed();
        let from = self.scanned.max(start);
        let pending = buf.slice(from, buf.filled());

        let Some(offset) = pending.iter().position(|&b| b == b'\n') else {
            // A trailing CR may still be followed by LF on the next read.
            let settled = match pending.last() {
                Some(b'\r') => pending.len() - 1,
                _ => pending.len(),
            };
            if pending[..settled].contains(&b'\r') {
                return Err(());
            }
            self.scanned = from + settled;
            return Ok(Line::Open);
        };

        let lf = from + offset;
        let line = buf.slice(start, lf);
        let end = match line.last() {
            Some(b'\r') => lf - 1,
            _ => lf,
        };
        if buf.slice(start, end).contains(&b'\r') {
            return Err(());
        }
        Ok(Line::Complete {
            start,
            end,
            next: lf + 1,
        })
    }

    fn parse_request_line(&mut self, text: &str) -> Result<(), ()> {
        let mut parts = text.split_ascii_whitespace();
        let (Some(method), Some(target), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(());
        };

        self.method = Method::parse(method).ok_or(())?;
        if !version.eq_ignore_ascii_case("HTTP/1.1") {
            return Err(());
        }

        let target = strip_scheme(target).ok_or(())?;
        if !target.starts_with('/') {
            return Err(());
        }
        self.target = if target == "/" {
            DEFAULT_PAGE.to_owned()
        } else {
            target.to_owned()
        };

        self.state = ParseState::Headers;
        Ok(())
    }

    /// `room` is the buffer space left after this line.
    fn parse_header(&mut self, text: &str, room: usize) -> Result<(), ()> {
        if text.is_empty() {
            if self.content_length == 0 {
                self.state = ParseState::Done;
                return Ok(());
            }
            // The whole body has to fit in what is left of the buffer.
            if self.content_length > room {
                return Err(());
            }
            self.state = ParseState::Body;
            return Ok(());
        }

        let (name, value) = text.split_once(':').ok_or(())?;
        let value = value.trim();
        if name.eq_ignore_ascii_case("Connection") {
            if value.eq_ignore_ascii_case("keep-alive") {
                self.keep_alive = true;
            }
        } else if name.eq_ignore_ascii_case("Content-Length") {
            self.content_length = value.parse().map_err(|_| ())?;
        } else if name.eq_ignore_ascii_case("Host") {
            self.host = Some(value.to_owned());
        } else {
            info!(header = text, "unknown header");
        }
        Ok(())
    }

    fn parse_body(&mut self, buf: &mut ReadBuffer) -> ParseOutcome {
        if buf.pending().len() < self.content_length {
            return ParseOutcome::Incomplete;
        }
        let start = buf.consumed();
        buf.consume(self.content_length);
        self.body = Some(start..start + self.content_length);
        self.scanned = buf.consumed();
        self.state = ParseState::Done;
        ParseOutcome::Complete
    }
}

/// Drop a leading `http://host` or `https://host`, keeping the path.
fn strip_scheme(target: &str) -> Option<&str> {
    for scheme in ["http://", "https://"] {
        if target.len() >= scheme.len() && target[..scheme.len()].eq_ignore_ascii_case(scheme) {
            let rest = &target[scheme.len()..];
            return rest.find('/').map(|slash| &rest[slash..]);
        }
    }
    Some(target)
}
