//! Response assembly: status head in a bounded buffer, file body as a second
//! scatter/gather segment over the mapped pages.

use std::io::{self, IoSlice, Write};

use crate::config::WRITE_BUF_SIZE;
use crate::constants::{
    EMPTY_FILE_BODY, ERROR_400_FORM, ERROR_400_TITLE, ERROR_403_FORM, ERROR_403_TITLE,
    ERROR_404_FORM, ERROR_404_TITLE, ERROR_500_FORM, ERROR_500_TITLE, OK_200_TITLE,
};
use crate::resource::MappedFile;

/// Outcome of a complete request, one per response kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpCode {
    BadRequest,
    NoResource,
    ForbiddenRequest,
    FileRequest,
    /// The target exists but could not be served.
    InternalError,
}

impl HttpCode {
    /// Status code, reason phrase and canned body. `FileRequest` carries its
    /// body separately.
    fn status(self) -> (u16, &'static str, &'static str) {
        match self {
            HttpCode::FileRequest => (200, OK_200_TITLE, ""),
            HttpCode::BadRequest => (400, ERROR_400_TITLE, ERROR_400_FORM),
            HttpCode::ForbiddenRequest => (403, ERROR_403_TITLE, ERROR_403_FORM),
            HttpCode::NoResource => (404, ERROR_404_TITLE, ERROR_404_FORM),
            HttpCode::InternalError => (500, ERROR_500_TITLE, ERROR_500_FORM),
        }
    }
}

/// Status line and headers did not fit the write buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeadOverflow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Flushed,
    WouldBlock,
}

/// Pending response bytes and how many have been sent.
#[derive(Debug, Default)]
pub struct Output {
    head: Vec<u8>,
    file: Option<MappedFile>,
    sent: usize,
    status: u16,
}

impl Output {
    pub fn new() -> Self {
        Self {
            head: Vec::with_capacity(WRITE_BUF_SIZE),
            ..Self::default()
        }
    }

    /// Serialise the response for `code`. A `file` is only used with
    /// `FileRequest`; an empty one is replaced by a minimal page.
    pub fn build(
        &mut self,
        code: HttpCode,
        keep_alive: bool,
        file: Option<MappedFile>,
    ) -> Result<(), HeadOverflow> {
        self.clear();
        let (status, title, mut body) = code.status();

        let file = file.filter(|f| code == HttpCode::FileRequest && !f.is_empty());
        if code == HttpCode::FileRequest && file.is_none() {
            body = EMPTY_FILE_BODY;
        }
        let content_length = file.as_ref().map_or(body.len(), MappedFile::len);
        let connection = if keep_alive { "keep-alive" } else { "close" };

        let head = &mut self.head;
        write!(head, "HTTP/1.1 {status} {title}\r\n")
            .and_then(|_| write!(head, "Content-Length:{content_length}\r\n"))
            .and_then(|_| write!(head, "Connection:{connection}\r\n\r\n"))
            .map_err(|_| HeadOverflow)?;
        head.extend_from_slice(body.as_bytes());
        if head.len() > WRITE_BUF_SIZE {
            self.clear();
            return Err(HeadOverflow);
        }

        self.file = file;
        self.status = status;
        Ok(())
    }

    pub fn head(&self) -> &[u8] {
        &self.head
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn total(&self) -> usize {
        self.head.len() + self.file.as_ref().map_or(0, MappedFile::len)
    }

    pub fn sent(&self) -> usize {
        self.sent
    }

    pub fn remaining(&self) -> usize {
        self.total() - self.sent
    }

    /// Unsent parts of both segments.
    pub fn slices(&self) -> Vec<IoSlice<'_>> {
        let mut slices = Vec::with_capacity(2);
        let head_len = self.head.len();
        if self.sent < head_len {
            slices.push(IoSlice::new(&self.head[self.sent..]));
        }
        if let Some(file) = &self.file {
            let from = self.sent.saturating_sub(head_len);
            let body = &file.as_slice()[from..];
            if !body.is_empty() {
                slices.push(IoSlice::new(body));
            }
        }
        slices
    }

    pub fn advance(&mut self, n: usize) {
        assert!(n <= self.remaining(), "advance past end of response");
        self.sent += n;
    }

    /// Unmap the file and drop the head.
    pub fn clear(&mut self) {
        self.head.clear();
        self.file = None;
        self.sent = 0;
        self.status = 0;
    }

    /// Write until everything is sent or the writer would block.
    pub fn flush<W: Write>(&mut self, writer: &mut W) -> io::Result<WriteStatus> {
        while self.remaining() > 0 {
            let result = writer.write_vectored(&self.slices());
            match result {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(WriteStatus::WouldBlock);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(WriteStatus::Flushed)
    }
}
