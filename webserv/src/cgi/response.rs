// src/cgi/response.rs
//! Parser for the header/body stream a CGI script writes to stdout.

use crate::http::HeaderMap;

/// Fields a script may send at most once.
const UNIQUE_FIELDS: &[&str] = &["Content-Length", "Transfer-Encoding", "Content-Type", "Location"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgiKind {
    Document,
    LocalRedirect,
    ClientRedirect,
    ClientRedirectDocument,
    Invalid,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CgiResponse {
    /// Value of the `Status` field; `None` when the script sent none.
    pub status: Option<u16>,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    /// A field line or the header section itself was unusable.
    pub malformed: bool,
}

impl CgiResponse {
    pub fn classify(&self) -> CgiKind {
        if self.malformed {
            return CgiKind::Invalid;
        }

        let has_content_type = self.headers.contains("Content-Type");
        let Some(location) = self.headers.get("Location") else {
            return if has_content_type {
                CgiKind::Document
            } else {
                CgiKind::Invalid
            };
        };

        let only_location = self.headers.len() == 1;
        if is_local_uri(location)
            && only_location
            && self.body.is_empty()
            && self.status.is_none()
        {
            return CgiKind::LocalRedirect;
        }
        if !is_absolute_uri(location) {
            return CgiKind::Invalid;
        }
        if only_location && self.status.is_none() {
            return CgiKind::ClientRedirect;
        }
        if has_content_type
            && !self.body.is_empty()
            && self.status.is_some_and(is_redirect_status)
        {
            return CgiKind::ClientRedirectDocument;
        }
        CgiKind::Invalid
    }

    /// Status the client sees for a response of `kind`.
    pub fn effective_status(&self, kind: CgiKind) -> u16 {
        match kind {
            CgiKind::Document => self.status.unwrap_or(200),
            CgiKind::ClientRedirect => 302,
            CgiKind::ClientRedirectDocument => self.status.unwrap_or(302),
            CgiKind::LocalRedirect => 200,
            CgiKind::Invalid => 502,
        }
    }
}

fn is_local_uri(location: &str) -> bool {
    location.len() >= 2 && location.starts_with('/') && !location.starts_with("//")
}

fn is_absolute_uri(location: &str) -> bool {
    location.contains("://")
}

fn is_redirect_status(status: u16) -> bool {
    matches!(status, 301 | 302 | 303 | 307 | 308)
}

/// Incremental: header lines end in CRLF or bare LF; the first empty line
/// starts the body.
#[derive(Debug, Default)]
pub struct CgiResponseParser {
    buf: Vec<u8>,
    in_body: bool,
    response: CgiResponse,
}

impl CgiResponseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, data: &[u8]) {
        if self.in_body {
            self.response.body.extend_from_slice(data);
            return;
        }

        self.buf.extend_from_slice(data);
        let mut start = 0;
        while let Some(lf) = self.buf[start..].iter().position(|&b| b == b'\n') {
            let mut end = start + lf;
            if end > start && self.buf[end - 1] == b'\r' {
                end -= 1;
            }
            let line = self.buf[start..end].to_vec();
            start += lf + 1;

            if line.is_empty() {
                self.in_body = true;
                self.response.body.extend_from_slice(&self.buf[start..]);
                self.buf.clear();
                return;
            }
            self.field_line(&line);
        }
        self.buf.drain(..start);
    }

    /// EOF. Output that never finished its header section is malformed.
    pub fn finish(mut self) -> CgiResponse {
        if !self.in_body {
            self.response.malformed = true;
        }
        self.response
    }

    fn field_line(&mut self, line: &[u8]) {
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            self.response.malformed = true;
            return;
        };
        let name = String::from_utf8_lossy(&line[..colon]).into_owned();
        let bad_byte = |b: u8| b.is_ascii_whitespace() || b.is_ascii_control();
        if name.is_empty() || name.bytes().any(bad_byte) {
            self.response.malformed = true;
            return;
        }
        let value = String::from_utf8_lossy(&line[colon + 1..]).trim().to_string();
        if value.is_empty() {
            return;
        }

        if name.eq_ignore_ascii_case("Status") {
            if self.response.status.is_none() {
                self.parse_status(&value);
            }
            return;
        }

        let unique = UNIQUE_FIELDS.iter().any(|f| f.eq_ignore_ascii_case(&name));
        if unique && self.response.headers.contains(&name) {
            self.response.malformed = true;
            return;
        }
        self.response.headers.append(name, value);
    }

    fn parse_status(&mut self, value: &str) {
        let code = value.split_whitespace().next().unwrap_or("");
        match code.parse::<u16>() {
            Ok(status) if (100..=599).contains(&status) && code.len() == 3 => {
                self.response.status = Some(status);
            }
            _ => {
                self.response.status = Some(500);
                self.response.malformed = true;
            }
        }
    }
}
