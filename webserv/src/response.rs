// src/response.rs
//! HTTP response model and resumable emitter.

use crate::conn::IO_BUFFER_SIZE;
use crate::error::ServeResult;
use crate::http::reason_phrase;
use crate::syscalls;
use std::io;
use std::os::fd::RawFd;
use std::time::SystemTime;

pub const SERVER_SOFTWARE: &str = concat!("webserv/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emit {
    Pending,
    Complete,
}

/// Replacement status taken from an `error_pages` entry such as `=200`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorPageOverride {
    pub status: u16,
    pub overwrite: bool,
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    status: u16,
    /// name → (enabled, value), in emission order.
    headers: Vec<(String, (bool, String))>,
    body: Vec<u8>,
    head_only: bool,
    error_page: Option<ErrorPageOverride>,
    wire: Option<Vec<u8>>,
    cursor: usize,
    done: bool,
}

impl HttpResponse {
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: vec![
                ("Server".to_string(), (true, SERVER_SOFTWARE.to_string())),
                ("Date".to_string(), (true, String::new())),
            ],
            body: Vec::new(),
            head_only: false,
            error_page: None,
            wire: None,
            cursor: 0,
            done: false,
        }
    }

    /// Default HTML error document for `status`.
    pub fn error(status: u16) -> Self {
        let title = format!("{} {}", status, reason_phrase(status));
        let page = format!(
            "<!DOCTYPE html>\n<html><head><title>{title}</title></head>\n\
             <body><h1>{title}</h1><hr><p>{SERVER_SOFTWARE}</p></body></html>\n"
        );
        let mut resp = Self::new(status);
        resp.set_body(page.into_bytes(), "text/html; charset=utf-8");
        resp
    }

    pub fn redirect(status: u16, location: &str) -> Self {
        let mut resp = Self::error(status);
        resp.set_header("Location", location);
        resp
    }

    /// Status as it will appear on the wire.
    pub fn status(&self) -> u16 {
        match self.error_page {
            Some(ov) if ov.overwrite => ov.status,
            _ => self.status,
        }
    }

    pub fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    /// Replace (or add) an enabled header.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self
            .headers
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            Some((_, slot)) => *slot = (true, value),
            None => self.headers.push((name.to_string(), (true, value))),
        }
    }

    /// Add another field with the same name (Set-Cookie).
    pub fn append_header(&mut self, name: &str, value: impl Into<String>) {
        self.headers.push((name.to_string(), (true, value.into())));
    }

    pub fn disable_header(&mut self, name: &str) {
        for (n, (enabled, _)) in self.headers.iter_mut() {
            if n.eq_ignore_ascii_case(name) {
                *enabled = false;
            }
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, (enabled, _))| *enabled && n.eq_ignore_ascii_case(name))
            .map(|(_, (_, v))| v.as_str())
    }

    pub fn set_body(&mut self, body: Vec<u8>, content_type: &str) {
        self.body = body;
        self.set_header("Content-Type", content_type);
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn set_head_only(&mut self, head_only: bool) {
        self.head_only = head_only;
    }

    /// Swap the body for a configured error page.
    pub fn apply_error_page(&mut self, body: Vec<u8>, content_type: &str, ov: ErrorPageOverride) {
        self.set_body(body, content_type);
        self.error_page = Some(ov);
    }

    fn omits_content_length(&self) -> bool {
        let status = self.status();
        let chunked = self
            .header("Transfer-Encoding")
            .is_some_and(|te| te.to_ascii_lowercase().contains("chunked"));
        (100..200).contains(&status) || status == 204 || status == 304 || chunked
    }

    pub fn serialize(&self) -> Vec<u8> {
        let status = self.status();
        let mut out = Vec::with_capacity(256 + self.body.len());
        let status_line = format!("HTTP/1.1 {} {}\r\n", status, reason_phrase(status));
        out.extend_from_slice(status_line.as_bytes());

        for (name, (enabled, value)) in &self.headers {
            if !enabled || name.eq_ignore_ascii_case("Content-Length") {
                continue;
            }
            let value = if name.eq_ignore_ascii_case("Date") && value.is_empty() {
                httpdate::fmt_http_date(SystemTime::now())
            } else {
                value.clone()
            };
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }

        if !self.omits_content_length() {
            out.extend_from_slice(format!("Content-Length: {}\r\n", self.body.len()).as_bytes());
        }
        out.extend_from_slice(b"\r\n");

        if !self.head_only {
            out.extend_from_slice(&self.body);
        }
        out
    }

    pub fn is_complete(&self) -> bool {
        self.done
    }

    /// Write the next chunk to a non-blocking socket.
    pub fn emit(&mut self, fd: RawFd) -> ServeResult<Emit> {
        self.emit_to(|chunk| syscalls::send_nonblocking(fd, chunk))
    }

    /// Write at most one I/O chunk through `sink`. The wire image is built on
    /// the first call and dropped once fully written.
    pub fn emit_to(
        &mut self,
        mut sink: impl FnMut(&[u8]) -> io::Result<usize>,
    ) -> ServeResult<Emit> {
        if self.done {
            return Ok(Emit::Complete);
        }
        if self.wire.is_none() {
            self.wire = Some(self.serialize());
            self.cursor = 0;
        }
        let Some(wire) = self.wire.as_ref() else {
            return Ok(Emit::Pending);
        };

        if self.cursor < wire.len() {
            let end = (self.cursor + IO_BUFFER_SIZE).min(wire.len());
            match sink(&wire[self.cursor..end]) {
                Ok(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Ok(n) => self.cursor += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Emit::Pending),
                Err(e) => return Err(e.into()),
            }
        }

        if self.cursor >= wire.len() {
            self.wire = None;
            self.done = true;
            return Ok(Emit::Complete);
        }
        Ok(Emit::Pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(resp: &HttpResponse) -> String {
        String::from_utf8(resp.serialize()).unwrap()
    }

    #[test]
    fn serialize_includes_defaults_and_length() {
        let mut resp = HttpResponse::new(200);
        resp.set_body(b"hello".to_vec(), "text/plain");
        let out = text(&resp);

        assert!(out.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(out.contains(&format!("Server: {SERVER_SOFTWARE}\r\n")));
        assert!(out.contains("\r\nDate: "));
        assert!(out.contains("Content-Length: 5\r\n"));
        assert!(out.ends_with("\r\n\r\nhello"));
    }

    #[test]
    fn no_content_length_for_204_or_chunked() {
        let resp = HttpResponse::new(204);
        assert!(!text(&resp).contains("Content-Length"));

        let mut resp = HttpResponse::new(200);
        resp.set_header("Transfer-Encoding", "chunked");
        assert!(!text(&resp).contains("Content-Length"));
    }

    #[test]
    fn disabled_headers_and_head_requests() {
        let mut resp = HttpResponse::new(200);
        resp.disable_header("Date");
        resp.set_body(b"body".to_vec(), "text/plain");
        resp.set_head_only(true);
        let out = text(&resp);

        assert!(!out.contains("Date:"));
        assert!(out.contains("Content-Length: 4\r\n"));
        assert!(out.ends_with("\r\n\r\n"));
    }

    #[test]
    fn error_page_override_changes_status() {
        let mut resp = HttpResponse::error(404);
        assert!(String::from_utf8_lossy(resp.body()).contains("404 Not Found"));

        resp.apply_error_page(
            b"<p>gone</p>".to_vec(),
            "text/html",
            ErrorPageOverride {
                status: 200,
                overwrite: true,
            },
        );
        assert_eq!(resp.status(), 200);
        assert!(text(&resp).starts_with("HTTP/1.1 200 OK\r\n"));
    }

    #[test]
    fn emit_resumes_after_partial_writes_and_would_block() {
        let mut resp = HttpResponse::new(200);
        resp.disable_header("Date");
        resp.set_body(vec![b'x'; 40_000], "application/octet-stream");
        let expected = resp.serialize();

        let mut written = Vec::new();
        let mut calls = 0usize;
        let mut largest = 0usize;
        loop {
            calls += 1;
            let step = resp
                .emit_to(|chunk| {
                    largest = largest.max(chunk.len());
                    if calls % 3 == 0 {
                        return Err(io::Error::from(io::ErrorKind::WouldBlock));
                    }
                    let n = chunk.len().min(7000);
                    written.extend_from_slice(&chunk[..n]);
                    Ok(n)
                })
                .unwrap();
            if step == Emit::Complete {
                break;
            }
        }

        assert_eq!(written, expected);
        assert!(largest <= IO_BUFFER_SIZE);
        assert!(resp.is_complete());
        assert_eq!(resp.emit_to(|_| Ok(0)).unwrap(), Emit::Complete);
    }

    #[test]
    fn emit_surfaces_hard_errors() {
        let mut resp = HttpResponse::new(200);
        let err = resp
            .emit_to(|_| Err(io::Error::from(io::ErrorKind::BrokenPipe)))
            .unwrap_err();
        assert!(!err.is_would_block());
    }
}
