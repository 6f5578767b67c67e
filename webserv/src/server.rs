// src/server.rs
//! The event loop: listeners, client sessions and CGI gateways all driven by
//! one reactor on one thread.

use crate::cgi::{CgiContext, CgiGateway, CgiInvocation, CgiKind, ExecuteResult, build_environment};
use crate::config::{Config, Location, VirtualServer};
use crate::conn::{CgiFds, Conn, ConnState, IO_BUFFER_SIZE, MAX_REQUESTS_PER_CONN};
use crate::error::{ServeError, ServeResult};
use crate::http::{HttpRequest, Method};
use crate::parser::{self, Progress};
use crate::reactor::{Interest, Owner, Reactor, Readiness};
use crate::response::{Emit, ErrorPageOverride, HttpResponse};
use crate::slab::Slab;
use crate::static_files;
use crate::syscalls;
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Timeout sweep period, also the idle poll timeout.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);
/// Poll timeout while a finished child still has to be reaped.
const REAP_POLL: Duration = Duration::from_millis(10);
const MAX_LOCAL_REDIRECTS: u8 = 5;

/// CGI response fields the server computes itself.
const CGI_HOP_HEADERS: &[&str] = &["Status", "Content-Length", "Transfer-Encoding", "Connection"];

struct Listener {
    fd: OwnedFd,
    /// Address as configured; port 0 stays 0.
    configured: SocketAddr,
    /// Address actually bound.
    addr: SocketAddr,
    /// Virtual servers on this address; the first is the default.
    servers: Vec<usize>,
}

/// A script found under a CGI location.
struct CgiTarget {
    script: PathBuf,
    /// URI prefix naming the script.
    script_uri: String,
}

enum Decision {
    Respond(HttpResponse),
    Cgi(CgiTarget),
}

pub struct Server {
    servers: Vec<VirtualServer>,
    listeners: Vec<Listener>,
    reactor: Reactor,
    conns: Slab<Conn>,
    shutdown: Arc<AtomicBool>,
    client_timeout: Duration,
    cgi_timeout: Duration,
    last_sweep: Instant,
}

impl Server {
    /// Bind every configured address and register the listeners.
    pub fn bind(config: &Config) -> ServeResult<Self> {
        let servers = config.resolve()?;
        syscalls::ignore_sigpipe();

        let mut reactor = Reactor::new()?;
        let mut listeners: Vec<Listener> = Vec::new();

        for (idx, server) in servers.iter().enumerate() {
            if let Some(existing) = listeners.iter_mut().find(|l| l.configured == server.listen) {
                existing.servers.push(idx);
                continue;
            }
            let fd = syscalls::create_listen_socket(&server.listen)?;
            let addr = syscalls::local_addr(fd.as_raw_fd())?;
            reactor.register(fd.as_raw_fd(), Owner::Listener(listeners.len()), Interest::READABLE)?;
            info!(%addr, names = ?server.server_names, "listening");
            listeners.push(Listener {
                fd,
                configured: server.listen,
                addr,
                servers: vec![idx],
            });
        }

        Ok(Self {
            servers,
            listeners,
            reactor,
            conns: Slab::new(config.max_connections),
            shutdown: Arc::new(AtomicBool::new(false)),
            client_timeout: config.client_timeout(),
            cgi_timeout: config.cgi_timeout(),
            last_sweep: Instant::now(),
        })
    }

    /// Bound addresses, in listener order.
    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners.iter().map(|l| l.addr).collect()
    }

    /// Setting the flag stops `run` after the current iteration.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// SIGINT/SIGTERM request a graceful shutdown.
    pub fn install_signal_handler(&self) -> ServeResult<()> {
        let flag = self.shutdown.clone();
        ctrlc::set_handler(move || {
            flag.store(true, Ordering::SeqCst);
        })
        .map_err(|e| ServeError::Io(io::Error::other(e)))
    }

    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    pub fn run(&mut self) -> ServeResult<()> {
        info!(listeners = self.listeners.len(), "server started");
        while !self.shutdown.load(Ordering::Acquire) {
            self.run_once()?;
        }
        self.close_all();
        info!("server shut down");
        Ok(())
    }

    /// One poll, the resulting dispatches, and the periodic maintenance.
    pub fn run_once(&mut self) -> ServeResult<()> {
        let timeout = if self.any_reaping() { REAP_POLL } else { SWEEP_INTERVAL };
        let events = self.reactor.poll(Some(timeout))?;

        for event in events {
            // Deregistered earlier in this batch.
            if self.reactor.owner_of(event.fd) != Some(event.owner) {
                continue;
            }
            match event.owner {
                Owner::Listener(idx) => self.accept_all(idx),
                Owner::Client(key) => self.on_client(key, event.readiness),
                Owner::CgiInput(key) | Owner::CgiOutput(key) => self.on_cgi(key),
            }
        }

        self.reap_finished();

        let now = Instant::now();
        if now.duration_since(self.last_sweep) >= SWEEP_INTERVAL {
            self.sweep(now);
            self.last_sweep = now;
        }
        Ok(())
    }

    // ---- Accept ----

    fn accept_all(&mut self, idx: usize) {
        if self.shutdown.load(Ordering::Acquire) {
            return;
        }
        let fd = self.listeners[idx].fd.as_raw_fd();
        loop {
            match syscalls::accept_connection(fd) {
                Ok(Some((stream, peer))) => self.admit(idx, stream, peer),
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn admit(&mut self, listener: usize, stream: OwnedFd, peer: SocketAddr) {
        let raw = stream.as_raw_fd();
        let key = match self.conns.allocate(Conn::new(stream, peer, listener, Instant::now())) {
            Ok(key) => key,
            Err(_rejected) => {
                warn!(%peer, error = %ServeError::SlabFull, "dropping connection");
                return;
            }
        };
        if let Err(e) = self.reactor.register(raw, Owner::Client(key), Interest::READABLE) {
            error!(%peer, error = %e, "client registration failed");
            self.conns.free(key);
            return;
        }
        debug!(key, %peer, "accepted");
    }

    // ---- Client events ----

    fn on_client(&mut self, key: usize, readiness: Readiness) {
        let Some(conn) = self.conns.get(key) else {
            return;
        };
        match conn.state() {
            ConnState::ReadingRequest => self.read_request(key),
            ConnState::WritingResponse if readiness.writable => self.write_response(key),
            ConnState::WritingResponse | ConnState::CgiIo
                if readiness.hangup || readiness.error =>
            {
                debug!(key, state = ?conn.state(), "peer went away");
                self.close(key);
            }
            _ => {}
        }
    }

    fn read_request(&mut self, key: usize) {
        let mut buf = [0u8; IO_BUFFER_SIZE];
        let Some(conn) = self.conns.get_mut(key) else {
            return;
        };
        match syscalls::recv_nonblocking(conn.raw_fd(), &mut buf) {
            Ok(0) => {
                debug!(key, "peer closed");
                self.close(key);
            }
            Ok(n) => {
                conn.touch(Instant::now());
                self.ingest(key, &buf[..n]);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            Err(e) => {
                debug!(key, error = %e, "recv failed");
                self.close(key);
            }
        }
    }

    fn ingest(&mut self, key: usize, data: &[u8]) {
        let Some(conn) = self.conns.get_mut(key) else {
            return;
        };
        match conn.parser.feed(data) {
            Ok(Progress::NeedMore) => {
                self.enforce_body_limit(key);
            }
            Ok(Progress::Complete) => {
                if self.enforce_body_limit(key) {
                    self.dispatch(key);
                }
            }
            Err(e) => {
                debug!(key, error = %e, "bad request");
                self.reject(key, e.status());
            }
        }
    }

    /// Answers 413 once the declared or received body outgrows the matched
    /// location's limit. Returns false when it did.
    fn enforce_body_limit(&mut self, key: usize) -> bool {
        let Some(conn) = self.conns.get(key) else {
            return false;
        };
        if !conn.parser.headers_complete() {
            return true;
        }
        let size = conn
            .parser
            .content_length()
            .unwrap_or(0)
            .max(conn.parser.body_len());
        let path = conn.parser.path().unwrap_or("/");
        let (s, l) = self.route(conn.listener, conn.parser.host(), path);
        let limit = self.servers[s].locations[l].client_max_body_size;
        if size <= limit {
            return true;
        }
        debug!(key, size, limit, "request body too large");
        self.reject(key, 413);
        false
    }

    /// Answer straight from ReadingRequest and close afterwards.
    fn reject(&mut self, key: usize, status: u16) {
        let Some(conn) = self.conns.get(key) else {
            return;
        };
        let path = conn.parser.path().unwrap_or("/");
        let route = self.route(conn.listener, conn.parser.host(), path);
        if let Some(conn) = self.conns.get_mut(key) {
            conn.route = route;
            conn.keep_alive = false;
        }
        self.finish_response(key, HttpResponse::error(status));
    }

    // ---- Dispatch ----

    /// Virtual server by Host, then location by longest prefix.
    fn route(&self, listener: usize, host: Option<&str>, path: &str) -> (usize, usize) {
        let candidates = &self.listeners[listener].servers;
        let server = host
            .and_then(|h| candidates.iter().copied().find(|&s| self.servers[s].answers_to(h)))
            .unwrap_or(candidates[0]);
        (server, self.servers[server].location_for(path))
    }

    fn dispatch(&mut self, key: usize) {
        let shutting_down = self.shutdown.load(Ordering::Acquire);
        let Some(conn) = self.conns.get_mut(key) else {
            return;
        };
        let Some(request) = conn.parser.take_request() else {
            return;
        };
        if !conn.transition(ConnState::Dispatching) {
            warn!(key, state = ?conn.state(), "dispatch from unexpected state");
            self.close(key);
            return;
        }
        conn.requests_served += 1;
        conn.keep_alive = request.keep_alive()
            && conn.requests_served < MAX_REQUESTS_PER_CONN
            && !shutting_down;
        conn.request = Some(request);
        self.route_request(key);
    }

    fn route_request(&mut self, key: usize) {
        let Some(conn) = self.conns.get(key) else {
            return;
        };
        let Some(request) = conn.request.as_ref() else {
            return;
        };
        let route = self.route(conn.listener, request.host(), &request.uri.path);
        let location = &self.servers[route.0].locations[route.1];
        let decision = decide(location, request);

        let Some(conn) = self.conns.get_mut(key) else {
            return;
        };
        conn.route = route;
        match decision {
            Decision::Respond(response) => {
                conn.transition(ConnState::StaticIo);
                self.finish_response(key, response);
            }
            Decision::Cgi(target) => self.start_cgi(key, target),
        }
    }

    /// Decorate the response and start writing it.
    fn finish_response(&mut self, key: usize, mut response: HttpResponse) {
        let Some(conn) = self.conns.get(key) else {
            return;
        };
        let head_only = conn
            .request
            .as_ref()
            .is_some_and(|r| r.method == Method::Head);
        let connection = if conn.keep_alive { "keep-alive" } else { "close" };
        self.apply_error_page(conn.route, &mut response);
        response.set_header("Connection", connection);
        response.set_head_only(head_only);

        let Some(conn) = self.conns.get_mut(key) else {
            return;
        };
        let fd = conn.raw_fd();
        conn.response = Some(response);
        if !conn.transition(ConnState::WritingResponse) {
            warn!(key, state = ?conn.state(), "cannot start writing");
            self.close(key);
            return;
        }
        if let Err(e) = self.reactor.reregister(fd, Interest::WRITABLE) {
            error!(key, error = %e, "client reregistration failed");
            self.close(key);
            return;
        }
        self.write_response(key);
    }

    fn apply_error_page(&self, (s, l): (usize, usize), response: &mut HttpResponse) {
        let server = &self.servers[s];
        let Some(page) = server.locations[l].error_pages.get(&response.status()) else {
            return;
        };
        let holder = &server.locations[server.location_for(&page.path)];
        let file = static_files::resolve(&holder.root, &page.path);
        match std::fs::read(&file) {
            Ok(body) => {
                let mime = mime_guess::from_path(&file).first_or_octet_stream();
                response.apply_error_page(
                    body,
                    mime.essence_str(),
                    ErrorPageOverride {
                        status: page.status.unwrap_or(response.status()),
                        overwrite: page.status.is_some(),
                    },
                );
            }
            Err(e) => warn!(page = %file.display(), error = %e, "error page unreadable"),
        }
    }

    // ---- Writing ----

    fn write_response(&mut self, key: usize) {
        let Some(conn) = self.conns.get_mut(key) else {
            return;
        };
        let fd = conn.raw_fd();
        let Some(response) = conn.response.as_mut() else {
            self.close(key);
            return;
        };
        match response.emit(fd) {
            Ok(Emit::Pending) => conn.touch(Instant::now()),
            Ok(Emit::Complete) => self.response_sent(key),
            Err(e) => {
                debug!(key, error = %e, "send failed");
                self.close(key);
            }
        }
    }

    fn response_sent(&mut self, key: usize) {
        let Some(conn) = self.conns.get_mut(key) else {
            return;
        };
        let status = conn.response.as_ref().map_or(0, |r| r.status());
        match &conn.request {
            Some(req) => info!(
                peer = %conn.peer,
                method = %req.method,
                path = %req.uri.path,
                status,
                "served"
            ),
            None => info!(peer = %conn.peer, status, "rejected"),
        }

        if !conn.keep_alive {
            self.close(key);
            return;
        }
        let fd = conn.raw_fd();
        let leftover = conn.reset_for_next_request();
        conn.touch(Instant::now());
        if let Err(e) = self.reactor.reregister(fd, Interest::READABLE) {
            error!(key, error = %e, "client reregistration failed");
            self.close(key);
            return;
        }
        if !leftover.is_empty() {
            self.ingest(key, &leftover);
        }
    }

    // ---- CGI ----

    fn start_cgi(&mut self, key: usize, target: CgiTarget) {
        let Some(conn) = self.conns.get(key) else {
            return;
        };
        let Some(request) = conn.request.as_ref() else {
            return;
        };
        let server = &self.servers[conn.route.0];
        let location = &server.locations[conn.route.1];
        let server_name = request
            .host()
            .map(str::to_string)
            .unwrap_or_else(|| server.primary_name());
        let environment = build_environment(
            request,
            &CgiContext {
                script_path: &target.script,
                script_uri: &target.script_uri,
                document_root: &location.root,
                server_name: &server_name,
                server_port: self.listeners[conn.listener].addr.port(),
                remote: conn.peer,
                upload_dir: location.upload_store.as_deref(),
            },
        );
        let invocation = CgiInvocation {
            script: target.script,
            interpreter: location.cgi_pass.clone(),
            environment,
            body: request.body.clone(),
        };

        // A previous invocation's pipes are closed by execute; forget them first.
        self.detach_cgi(key);
        let timeout = self.cgi_timeout;
        let Some(conn) = self.conns.get_mut(key) else {
            return;
        };
        if !conn.transition(ConnState::CgiIo) {
            warn!(key, state = ?conn.state(), "cannot start cgi");
            self.close(key);
            return;
        }
        // Only a hang-up matters while the script runs.
        if let Err(e) = self.reactor.reregister(conn.raw_fd(), Interest::PEER_CLOSED) {
            error!(key, error = %e, "client reregistration failed");
            self.close(key);
            return;
        }
        let result = conn
            .cgi
            .get_or_insert_with(|| CgiGateway::new(timeout))
            .execute(invocation);
        self.after_cgi_step(key, result);
    }

    fn on_cgi(&mut self, key: usize) {
        let Some(conn) = self.conns.get_mut(key) else {
            return;
        };
        if conn.state() != ConnState::CgiIo {
            return;
        }
        let Some(gateway) = conn.cgi.as_mut() else {
            return;
        };
        let result = gateway.resume();
        self.after_cgi_step(key, result);
    }

    fn after_cgi_step(&mut self, key: usize, result: ExecuteResult) {
        if result.is_pending() {
            if let Err(e) = self.sync_cgi_fds(key) {
                error!(key, error = %e, "cgi pipe registration failed");
                self.detach_cgi(key);
                if let Some(gateway) = self.conns.get_mut(key).and_then(|c| c.cgi.as_mut()) {
                    gateway.reset();
                }
                self.finish_response(key, HttpResponse::error(502));
            }
            return;
        }

        self.detach_cgi(key);
        if result != ExecuteResult::Success {
            debug!(key, ?result, "cgi failed");
            self.finish_response(key, HttpResponse::error(result.status()));
            return;
        }

        let Some(cgi) = self
            .conns
            .get_mut(key)
            .and_then(|c| c.cgi.as_mut())
            .and_then(|g| g.take_response())
        else {
            self.finish_response(key, HttpResponse::error(502));
            return;
        };

        let kind = cgi.classify();
        match kind {
            CgiKind::LocalRedirect => {
                let location = cgi.headers.get("Location").unwrap_or("/").to_string();
                self.local_redirect(key, &location);
            }
            CgiKind::Invalid => {
                warn!(key, "cgi produced an unusable response");
                self.finish_response(key, HttpResponse::error(502));
            }
            CgiKind::Document | CgiKind::ClientRedirect | CgiKind::ClientRedirectDocument => {
                let mut response = HttpResponse::new(cgi.effective_status(kind));
                let mut seen: Vec<String> = Vec::new();
                for (name, value) in cgi.headers.iter() {
                    if CGI_HOP_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(name)) {
                        continue;
                    }
                    let lower = name.to_ascii_lowercase();
                    if seen.contains(&lower) {
                        response.append_header(name, value);
                    } else {
                        response.set_header(name, value);
                        seen.push(lower);
                    }
                }
                if !cgi.body.is_empty() {
                    let content_type = cgi
                        .headers
                        .get("Content-Type")
                        .unwrap_or("application/octet-stream")
                        .to_string();
                    response.set_body(cgi.body, &content_type);
                }
                self.finish_response(key, response);
            }
        }
    }

    /// Re-dispatch a `Location: /path` answer as a GET.
    fn local_redirect(&mut self, key: usize, location: &str) {
        let Some(conn) = self.conns.get_mut(key) else {
            return;
        };
        conn.redirects += 1;
        if conn.redirects > MAX_LOCAL_REDIRECTS {
            warn!(key, location, "too many local redirects");
            self.finish_response(key, HttpResponse::error(500));
            return;
        }
        let uri = match parser::parse_target(location.as_bytes()) {
            Ok(uri) => uri,
            Err(e) => {
                warn!(key, location, error = %e, "bad local redirect target");
                self.finish_response(key, HttpResponse::error(502));
                return;
            }
        };
        debug!(key, location, "local redirect");

        if let Some(request) = conn.request.as_mut() {
            rewrite_as_get(request, uri);
        }
        conn.transition(ConnState::Dispatching);
        self.route_request(key);
    }

    /// Bring the reactor in line with the gateway's open pipes.
    fn sync_cgi_fds(&mut self, key: usize) -> ServeResult<()> {
        let Some(conn) = self.conns.get_mut(key) else {
            return Ok(());
        };
        let current = conn.cgi.as_ref().map_or(CgiFds::default(), |g| CgiFds {
            input: g.stdin_fd(),
            output: g.stdout_fd(),
        });
        let previous = std::mem::replace(&mut conn.cgi_fds, current);
        if previous == current {
            return Ok(());
        }

        for (old, new) in [(previous.input, current.input), (previous.output, current.output)] {
            if let Some(fd) = old
                && old != new
            {
                self.reactor.deregister(fd);
            }
        }
        if let Some(fd) = current.input
            && previous.input != current.input
        {
            self.reactor.register(fd, Owner::CgiInput(key), Interest::WRITABLE)?;
        }
        if let Some(fd) = current.output
            && previous.output != current.output
        {
            self.reactor.register(fd, Owner::CgiOutput(key), Interest::READABLE)?;
        }
        Ok(())
    }

    fn detach_cgi(&mut self, key: usize) {
        let Some(conn) = self.conns.get_mut(key) else {
            return;
        };
        let fds = std::mem::take(&mut conn.cgi_fds);
        for fd in [fds.input, fds.output].into_iter().flatten() {
            self.reactor.deregister(fd);
        }
    }

    // ---- Maintenance ----

    fn any_reaping(&self) -> bool {
        self.conns
            .iter()
            .any(|(_, c)| c.cgi.as_ref().is_some_and(CgiGateway::is_reaping))
    }

    /// Children whose pipes are done produce no more readiness; poll them.
    fn reap_finished(&mut self) {
        for key in self.conns.occupied() {
            let Some(conn) = self.conns.get_mut(key) else {
                continue;
            };
            if conn.state() != ConnState::CgiIo {
                continue;
            }
            let Some(gateway) = conn.cgi.as_mut().filter(|g| g.is_reaping()) else {
                continue;
            };
            let result = gateway.resume();
            self.after_cgi_step(key, result);
        }
    }

    fn sweep(&mut self, now: Instant) {
        let client_timeout = self.client_timeout;
        for key in self.conns.occupied() {
            let Some(conn) = self.conns.get_mut(key) else {
                continue;
            };
            if conn.state() == ConnState::CgiIo {
                if let Some(gateway) = conn.cgi.as_mut() {
                    let result = gateway.tick();
                    self.after_cgi_step(key, result);
                }
            } else if conn.is_idle(now, client_timeout) {
                debug!(key, peer = %conn.peer, "idle timeout");
                self.close(key);
            }
        }
    }

    /// Kill any child, then release every descriptor of the session.
    fn close(&mut self, key: usize) {
        let Some(mut conn) = self.conns.free(key) else {
            return;
        };
        if let Some(gateway) = conn.cgi.as_mut() {
            gateway.reset();
        }
        for fd in [conn.cgi_fds.input, conn.cgi_fds.output].into_iter().flatten() {
            self.reactor.deregister(fd);
        }
        self.reactor.deregister(conn.raw_fd());
        conn.transition(ConnState::Closed);
        debug!(key, peer = %conn.peer, served = conn.requests_served, "closed");
    }

    fn close_all(&mut self) {
        for key in self.conns.occupied() {
            self.close(key);
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.close_all();
    }
}

/// Redirect, method check, CGI script, or the static handler, in that order.
fn decide(location: &Location, request: &HttpRequest) -> Decision {
    if let Some(redirect) = &location.redirect {
        return Decision::Respond(HttpResponse::redirect(redirect.code, &redirect.url));
    }
    if !location.allows(request.method) {
        let mut response = HttpResponse::error(405);
        response.set_header("Allow", location.allow_header());
        return Decision::Respond(response);
    }
    if let Some(target) = find_cgi_script(location, &request.uri.path) {
        return Decision::Cgi(target);
    }
    Decision::Respond(static_files::serve(location, request))
}

/// Walk the path down from the root until it names a file; that file is the
/// script if its extension is configured for CGI.
fn find_cgi_script(location: &Location, path: &str) -> Option<CgiTarget> {
    if location.cgi_extensions.is_empty() {
        return None;
    }
    let mut uri = String::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        uri.push('/');
        uri.push_str(segment);
        let candidate = static_files::resolve(&location.root, &uri);
        let meta = std::fs::metadata(&candidate).ok()?;
        if meta.is_dir() {
            continue;
        }
        let is_script = meta.is_file()
            && location
                .cgi_extensions
                .iter()
                .any(|ext| segment.len() > ext.len() && segment.ends_with(ext.as_str()));
        return is_script.then_some(CgiTarget {
            script: candidate,
            script_uri: uri,
        });
    }
    None
}

fn rewrite_as_get(request: &mut HttpRequest, uri: crate::http::Uri) {
    request.method = Method::Get;
    request.uri = uri;
    request.body.clear();
    request.content_length = None;
    request.chunked = false;
}
