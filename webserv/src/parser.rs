// src/parser.rs
//! Incremental HTTP/1.1 request parser.
//!
//! Bytes are appended as they arrive; each stage advances only once its
//! delimiter is in the buffer. Anything past the end of a complete request
//! stays buffered as pipelined input.

use crate::http::{self, HeaderMap, HttpRequest, Method, RECOGNIZED_FIELDS, Uri};
use percent_encoding::percent_decode;
use thiserror::Error;

pub const MAX_REQUEST_LINE: usize = 8 * 1024;
pub const MAX_HEADER_SECTION: usize = 64 * 1024;
const MAX_CHUNK_LINE: usize = 1024;
const HTTP_VERSION: &[u8] = b"HTTP/1.1";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("malformed request method")]
    InvalidMethod,
    #[error("request method not implemented")]
    UnsupportedMethod,
    #[error("malformed request target")]
    InvalidUri,
    #[error("unsupported HTTP version")]
    InvalidVersion,
    #[error("malformed header field")]
    InvalidHeader,
    #[error("invalid Content-Length")]
    InvalidContentLength,
    #[error("malformed chunked body")]
    InvalidChunk,
    #[error("request line too long")]
    UriTooLong,
    #[error("header section too large")]
    HeaderTooLarge,
}

impl ParseError {
    /// Status code the client receives for this error.
    pub fn status(&self) -> u16 {
        match self {
            ParseError::UnsupportedMethod => 501,
            ParseError::InvalidVersion => 505,
            ParseError::UriTooLong => 414,
            ParseError::HeaderTooLarge => 431,
            ParseError::InvalidMethod
            | ParseError::InvalidUri
            | ParseError::InvalidHeader
            | ParseError::InvalidContentLength
            | ParseError::InvalidChunk => 400,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    RequestLine,
    Headers,
    Body,
    Completed,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    NeedMore,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyMode {
    Length(usize),
    ChunkSize,
    ChunkData(usize),
    ChunkDataEnd,
    Trailers,
}

#[derive(Debug, Default)]
struct Head {
    method: Option<Method>,
    uri: Uri,
    headers: HeaderMap,
    content_length: Option<usize>,
    chunked: bool,
}

#[derive(Debug)]
pub struct RequestParser {
    buf: Vec<u8>,
    pos: usize,
    state: ParseState,
    error: Option<ParseError>,
    head: Head,
    header_bytes: usize,
    mode: BodyMode,
    body: Vec<u8>,
    request: Option<HttpRequest>,
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestParser {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            pos: 0,
            state: ParseState::RequestLine,
            error: None,
            head: Head::default(),
            header_bytes: 0,
            mode: BodyMode::Length(0),
            body: Vec::new(),
            request: None,
        }
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    pub fn error(&self) -> Option<&ParseError> {
        self.error.as_ref()
    }

    pub fn headers_complete(&self) -> bool {
        matches!(self.state, ParseState::Body | ParseState::Completed)
    }

    /// Declared Content-Length, known once headers are complete.
    pub fn content_length(&self) -> Option<usize> {
        match &self.request {
            Some(req) => req.content_length,
            None => self.head.content_length,
        }
    }

    /// Body bytes decoded so far.
    pub fn body_len(&self) -> usize {
        match &self.request {
            Some(req) => req.body.len(),
            None => self.body.len(),
        }
    }

    /// Request target path, once the request line has been accepted.
    pub fn path(&self) -> Option<&str> {
        match &self.request {
            Some(req) => Some(&req.uri.path),
            None => self.head.method.map(|_| self.head.uri.path.as_str()),
        }
    }

    /// Host name without port, once headers are complete.
    pub fn host(&self) -> Option<&str> {
        let raw = match &self.request {
            Some(req) => req.headers.get("Host"),
            None if self.state == ParseState::Body => self.head.headers.get("Host"),
            None => None,
        };
        raw.and_then(http::host_name)
    }

    pub fn request(&self) -> Option<&HttpRequest> {
        self.request.as_ref()
    }

    pub fn take_request(&mut self) -> Option<HttpRequest> {
        self.request.take()
    }

    /// Bytes received past the end of the completed request.
    pub fn take_remaining(&mut self) -> Vec<u8> {
        let rest = self.buf.split_off(self.pos);
        self.buf.clear();
        self.pos = 0;
        rest
    }

    /// Append `data` and advance as far as the buffer allows.
    pub fn feed(&mut self, data: &[u8]) -> Result<Progress, ParseError> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }
        self.buf.extend_from_slice(data);
        let progress = self.advance();
        self.compact();
        progress
    }

    /// The peer will send nothing more. A body without a declared length
    /// ends here.
    pub fn finish(&mut self) -> Result<Progress, ParseError> {
        match self.state {
            ParseState::Completed => Ok(Progress::Complete),
            ParseState::Error => Err(self.error.clone().unwrap_or(ParseError::InvalidHeader)),
            ParseState::Body if self.head.content_length.is_none() => Ok(self.complete()),
            _ => Ok(Progress::NeedMore),
        }
    }

    fn fail(&mut self, err: ParseError) -> Result<Progress, ParseError> {
        self.state = ParseState::Error;
        self.error = Some(err.clone());
        Err(err)
    }

    fn advance(&mut self) -> Result<Progress, ParseError> {
        loop {
            match self.state {
                ParseState::RequestLine => {
                    let Some((len, next)) = find_line(&self.buf[self.pos..]) else {
                        if self.buf.len() - self.pos > MAX_REQUEST_LINE {
                            return self.fail(ParseError::UriTooLong);
                        }
                        return Ok(Progress::NeedMore);
                    };
                    if len > MAX_REQUEST_LINE {
                        return self.fail(ParseError::UriTooLong);
                    }
                    let line = self.buf[self.pos..self.pos + len].to_vec();
                    self.pos += next;
                    // Stray CRLFs between pipelined requests are skipped.
                    if line.is_empty() {
                        continue;
                    }
                    if let Err(e) = self.parse_request_line(&line) {
                        return self.fail(e);
                    }
                    self.state = ParseState::Headers;
                }
                ParseState::Headers => {
                    let Some((len, next)) = find_line(&self.buf[self.pos..]) else {
                        if self.header_bytes + (self.buf.len() - self.pos) > MAX_HEADER_SECTION {
                            return self.fail(ParseError::HeaderTooLarge);
                        }
                        return Ok(Progress::NeedMore);
                    };
                    self.header_bytes += next;
                    if self.header_bytes > MAX_HEADER_SECTION {
                        return self.fail(ParseError::HeaderTooLarge);
                    }
                    let line = self.buf[self.pos..self.pos + len].to_vec();
                    self.pos += next;
                    let res = if line.is_empty() {
                        self.end_of_headers()
                    } else {
                        self.parse_header_line(&line)
                    };
                    if let Err(e) = res {
                        return self.fail(e);
                    }
                }
                ParseState::Body => match self.advance_body() {
                    Ok(Some(p)) => return Ok(p),
                    Ok(None) => {}
                    Err(e) => return self.fail(e),
                },
                ParseState::Completed => return Ok(Progress::Complete),
                ParseState::Error => {
                    return Err(self.error.clone().unwrap_or(ParseError::InvalidHeader));
                }
            }
        }
    }

    fn parse_request_line(&mut self, line: &[u8]) -> Result<(), ParseError> {
        let parts: Vec<&[u8]> = line.split(|&b| b == b' ').collect();

        let method = parts[0];
        if method.is_empty() || !method.iter().all(|b| b.is_ascii_uppercase()) {
            return Err(ParseError::InvalidMethod);
        }
        let method = Method::from_bytes(method).ok_or(ParseError::UnsupportedMethod)?;

        match parts.len() {
            3 => {}
            2 => return Err(ParseError::InvalidVersion),
            _ => return Err(ParseError::InvalidUri),
        }

        let uri = parse_target(parts[1])?;
        if parts[2] != HTTP_VERSION {
            return Err(ParseError::InvalidVersion);
        }

        self.head.method = Some(method);
        self.head.uri = uri;
        Ok(())
    }

    fn parse_header_line(&mut self, line: &[u8]) -> Result<(), ParseError> {
        // Obsolete line folding.
        if line[0] == b' ' || line[0] == b'\t' {
            return Err(ParseError::InvalidHeader);
        }
        let colon = line
            .iter()
            .position(|&b| b == b':')
            .ok_or(ParseError::InvalidHeader)?;
        let name = &line[..colon];
        if name.is_empty() || !name.iter().all(|&b| is_token_byte(b)) {
            return Err(ParseError::InvalidHeader);
        }
        let value = trim_ows(&line[colon + 1..]);
        if value.iter().any(|&b| b != b'\t' && (b < 0x20 || b == 0x7f)) {
            return Err(ParseError::InvalidHeader);
        }

        // Token bytes are ASCII, so this cannot fail.
        let name = std::str::from_utf8(name).map_err(|_| ParseError::InvalidHeader)?;
        let value = String::from_utf8_lossy(value).into_owned();

        if name.eq_ignore_ascii_case("Content-Length") {
            let len = parse_content_length(&value)?;
            if self.head.content_length.is_some_and(|prev| prev != len) {
                return Err(ParseError::InvalidContentLength);
            }
            self.head.content_length = Some(len);
        } else if name.eq_ignore_ascii_case("Transfer-Encoding") {
            self.head.chunked = value
                .rsplit(',')
                .next()
                .is_some_and(|last| last.trim().eq_ignore_ascii_case("chunked"));
        }

        let canonical = RECOGNIZED_FIELDS
            .iter()
            .find(|f| f.eq_ignore_ascii_case(name))
            .map(|f| f.to_string())
            .unwrap_or_else(|| name.to_string());
        self.head.headers.append(canonical, value);
        Ok(())
    }

    fn end_of_headers(&mut self) -> Result<(), ParseError> {
        if !self.head.headers.contains("Host") {
            return Err(ParseError::InvalidHeader);
        }

        match self.head.content_length {
            Some(0) => {
                self.head.chunked = false;
                self.complete();
            }
            Some(n) => {
                self.head.chunked = false;
                self.mode = BodyMode::Length(n);
                self.state = ParseState::Body;
            }
            None if self.head.chunked => {
                self.mode = BodyMode::ChunkSize;
                self.state = ParseState::Body;
            }
            None => {
                self.complete();
            }
        }
        Ok(())
    }

    /// `Ok(None)` means the body stage moved on and the loop should continue.
    fn advance_body(&mut self) -> Result<Option<Progress>, ParseError> {
        match self.mode {
            BodyMode::Length(total) => {
                let want = total - self.body.len();
                let take = want.min(self.buf.len() - self.pos);
                self.body.extend_from_slice(&self.buf[self.pos..self.pos + take]);
                self.pos += take;
                if self.body.len() == total {
                    return Ok(Some(self.complete()));
                }
                Ok(Some(Progress::NeedMore))
            }
            BodyMode::ChunkSize => {
                let Some((len, next)) = find_line(&self.buf[self.pos..]) else {
                    if self.buf.len() - self.pos > MAX_CHUNK_LINE {
                        return Err(ParseError::InvalidChunk);
                    }
                    return Ok(Some(Progress::NeedMore));
                };
                let size = parse_chunk_size(&self.buf[self.pos..self.pos + len])?;
                self.pos += next;
                self.mode = if size == 0 {
                    BodyMode::Trailers
                } else {
                    BodyMode::ChunkData(size)
                };
                Ok(None)
            }
            BodyMode::ChunkData(remaining) => {
                let take = remaining.min(self.buf.len() - self.pos);
                self.body.extend_from_slice(&self.buf[self.pos..self.pos + take]);
                self.pos += take;
                if take == remaining {
                    self.mode = BodyMode::ChunkDataEnd;
                    return Ok(None);
                }
                self.mode = BodyMode::ChunkData(remaining - take);
                Ok(Some(Progress::NeedMore))
            }
            BodyMode::ChunkDataEnd => {
                let Some((len, next)) = find_line(&self.buf[self.pos..]) else {
                    if self.buf.len() - self.pos >= 2 {
                        return Err(ParseError::InvalidChunk);
                    }
                    return Ok(Some(Progress::NeedMore));
                };
                if len != 0 {
                    return Err(ParseError::InvalidChunk);
                }
                self.pos += next;
                self.mode = BodyMode::ChunkSize;
                Ok(None)
            }
            BodyMode::Trailers => {
                let Some((len, next)) = find_line(&self.buf[self.pos..]) else {
                    if self.header_bytes + (self.buf.len() - self.pos) > MAX_HEADER_SECTION {
                        return Err(ParseError::HeaderTooLarge);
                    }
                    return Ok(Some(Progress::NeedMore));
                };
                self.pos += next;
                self.header_bytes += next;
                if len == 0 {
                    return Ok(Some(self.complete()));
                }
                Ok(None)
            }
        }
    }

    fn complete(&mut self) -> Progress {
        let head = std::mem::take(&mut self.head);
        self.request = Some(HttpRequest {
            method: head.method.unwrap_or(Method::Get),
            uri: head.uri,
            version: String::from_utf8_lossy(HTTP_VERSION).into_owned(),
            headers: head.headers,
            body: std::mem::take(&mut self.body),
            content_length: head.content_length,
            chunked: head.chunked,
            status: 200,
        });
        self.state = ParseState::Completed;
        Progress::Complete
    }

    /// Drop consumed bytes while still inside the request.
    fn compact(&mut self) {
        if self.state == ParseState::Completed || self.pos == 0 {
            return;
        }
        if self.pos == self.buf.len() || self.pos >= MAX_REQUEST_LINE {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
    }
}

/// Locate the next line. Returns (content length without the terminator,
/// bytes consumed including it). Bare LF is accepted.
fn find_line(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = buf.iter().position(|&b| b == b'\n')?;
    let len = if lf > 0 && buf[lf - 1] == b'\r' { lf - 1 } else { lf };
    Some((len, lf + 1))
}

fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

fn trim_ows(mut v: &[u8]) -> &[u8] {
    while let [b' ' | b'\t', rest @ ..] = v {
        v = rest;
    }
    while let [rest @ .., b' ' | b'\t'] = v {
        v = rest;
    }
    v
}

fn parse_content_length(value: &str) -> Result<usize, ParseError> {
    let mut result = None;
    for part in value.split(',') {
        let part = part.trim();
        if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ParseError::InvalidContentLength);
        }
        let n: usize = part.parse().map_err(|_| ParseError::InvalidContentLength)?;
        if result.is_some_and(|prev| prev != n) {
            return Err(ParseError::InvalidContentLength);
        }
        result = Some(n);
    }
    result.ok_or(ParseError::InvalidContentLength)
}

fn parse_chunk_size(line: &[u8]) -> Result<usize, ParseError> {
    // Chunk extensions after ';' are ignored.
    let size = line.split(|&b| b == b';').next().unwrap_or(line);
    let size = trim_ows(size);
    if size.is_empty() || !size.iter().all(|b| b.is_ascii_hexdigit()) {
        return Err(ParseError::InvalidChunk);
    }
    let text = std::str::from_utf8(size).map_err(|_| ParseError::InvalidChunk)?;
    usize::from_str_radix(text, 16).map_err(|_| ParseError::InvalidChunk)
}

/// Split the request target, decode the path and refuse anything that
/// climbs above the root.
pub(crate) fn parse_target(target: &[u8]) -> Result<Uri, ParseError> {
    if target.first() != Some(&b'/') {
        return Err(ParseError::InvalidUri);
    }
    if target.iter().any(|&b| b < 0x20 || b == 0x7f) {
        return Err(ParseError::InvalidUri);
    }

    let target = match target.iter().position(|&b| b == b'#') {
        Some(i) => &target[..i],
        None => target,
    };
    let (raw_path, query) = match target.iter().position(|&b| b == b'?') {
        Some(i) => (&target[..i], Some(&target[i + 1..])),
        None => (target, None),
    };

    let decoded = percent_decode(raw_path)
        .decode_utf8()
        .map_err(|_| ParseError::InvalidUri)?;
    if decoded.contains('\0') {
        return Err(ParseError::InvalidUri);
    }
    let path = normalize_path(&decoded)?;

    let query = query
        .map(|q| String::from_utf8(q.to_vec()).map_err(|_| ParseError::InvalidUri))
        .transpose()?;

    Ok(Uri { path, query })
}

/// Resolve `.` and `..` segments; a `..` that would leave the root is an
/// error.
fn normalize_path(path: &str) -> Result<String, ParseError> {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                if segments.pop().is_none() {
                    return Err(ParseError::InvalidUri);
                }
            }
            s => segments.push(s),
        }
    }

    let mut normalized = String::with_capacity(path.len());
    for s in &segments {
        normalized.push('/');
        normalized.push_str(s);
    }
    let trailing = path.ends_with('/') || path.ends_with("/.") || path.ends_with("/..");
    if normalized.is_empty() || trailing {
        normalized.push('/');
    }
    Ok(normalized)
}
