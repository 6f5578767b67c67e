// src/conn.rs
use crate::cgi::CgiGateway;
use crate::http::HttpRequest;
use crate::parser::RequestParser;
use crate::response::HttpResponse;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

/// Chunk size for every socket and pipe transfer.
pub const IO_BUFFER_SIZE: usize = 16 * 1024;

/// Hard cap on requests served over one keep-alive connection.
pub const MAX_REQUESTS_PER_CONN: u32 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnState {
    #[default]
    ReadingRequest,
    Dispatching,
    StaticIo,
    CgiIo,
    WritingResponse,
    Closed,
}

impl ConnState {
    /// Allowed session transitions. Apart from closing, the only ways back
    /// are keep-alive re-arming and a CGI local redirect re-dispatching.
    pub fn can_advance_to(self, next: ConnState) -> bool {
        use ConnState::*;
        matches!(
            (self, next),
            (ReadingRequest, Dispatching)
                | (ReadingRequest, WritingResponse)
                | (Dispatching, StaticIo)
                | (Dispatching, CgiIo)
                | (StaticIo, WritingResponse)
                | (CgiIo, WritingResponse)
                | (CgiIo, Dispatching)
                | (WritingResponse, ReadingRequest)
        ) || (next == Closed && self != Closed)
    }
}

/// Descriptors of the running gateway currently known to the reactor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CgiFds {
    pub input: Option<RawFd>,
    pub output: Option<RawFd>,
}

pub struct Conn {
    fd: OwnedFd,
    pub peer: SocketAddr,
    /// Index of the listener the connection arrived on.
    pub listener: usize,
    state: ConnState,
    pub parser: RequestParser,
    pub request: Option<HttpRequest>,
    pub response: Option<HttpResponse>,
    pub cgi: Option<CgiGateway>,
    pub cgi_fds: CgiFds,
    /// (virtual server, location) chosen for the current request.
    pub route: (usize, usize),
    pub last_active: Instant,
    pub requests_served: u32,
    pub keep_alive: bool,
    pub redirects: u8,
}

impl Conn {
    pub fn new(fd: OwnedFd, peer: SocketAddr, listener: usize, now: Instant) -> Self {
        Self {
            fd,
            peer,
            listener,
            state: ConnState::ReadingRequest,
            parser: RequestParser::new(),
            request: None,
            response: None,
            cgi: None,
            cgi_fds: CgiFds::default(),
            route: (0, 0),
            last_active: now,
            requests_served: 0,
            keep_alive: true,
            redirects: 0,
        }
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Move to `next` if the state machine allows it.
    pub fn transition(&mut self, next: ConnState) -> bool {
        if !self.state.can_advance_to(next) {
            return false;
        }
        self.state = next;
        true
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_active = now;
    }

    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.duration_since(self.last_active) > timeout
    }

    /// Prepare for the next request on a kept-alive connection. Returns the
    /// pipelined bytes that arrived after the previous request.
    pub fn reset_for_next_request(&mut self) -> Vec<u8> {
        let leftover = self.parser.take_remaining();
        self.parser = RequestParser::new();
        self.request = None;
        self.response = None;
        self.redirects = 0;
        self.state = ConnState::ReadingRequest;
        leftover
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::syscalls::create_pipe;

    #[test]
    fn forward_path_through_a_request() {
        use ConnState::*;
        let path = [ReadingRequest, Dispatching, CgiIo, WritingResponse, ReadingRequest];
        for pair in path.windows(2) {
            assert!(pair[0].can_advance_to(pair[1]), "{:?} -> {:?}", pair[0], pair[1]);
        }
        assert!(!ReadingRequest.can_advance_to(CgiIo));
        assert!(!WritingResponse.can_advance_to(Dispatching));
        assert!(!StaticIo.can_advance_to(CgiIo));
        assert!(CgiIo.can_advance_to(Closed));
        assert!(!Closed.can_advance_to(ReadingRequest));
    }

    #[test]
    fn reset_keeps_pipelined_bytes() {
        let (fd, _other) = create_pipe().unwrap();
        let mut conn = Conn::new(fd, "127.0.0.1:9".parse().unwrap(), 0, Instant::now());

        conn.parser
            .feed(b"GET /a HTTP/1.1\r\nHost: x\r\n\r\nGET /b")
            .unwrap();
        assert!(conn.transition(ConnState::Dispatching));
        assert!(conn.transition(ConnState::StaticIo));
        assert!(conn.transition(ConnState::WritingResponse));
        assert!(!conn.transition(ConnState::CgiIo));

        let leftover = conn.reset_for_next_request();
        assert_eq!(leftover, b"GET /b");
        assert_eq!(conn.state(), ConnState::ReadingRequest);
        assert!(conn.parser.request().is_none());
    }

    #[test]
    fn idle_detection() {
        let (fd, _other) = create_pipe().unwrap();
        let start = Instant::now();
        let conn = Conn::new(fd, "127.0.0.1:9".parse().unwrap(), 0, start);
        assert!(!conn.is_idle(start, Duration::from_secs(60)));
        assert!(conn.is_idle(start + Duration::from_secs(61), Duration::from_secs(60)));
    }
}
