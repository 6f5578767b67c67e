// Shared harness: a live server on an ephemeral port plus a raw HTTP client.
#![allow(dead_code)]

use std::fs;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use webserv::{Config, Server};

pub struct TestServer {
    pub addr: SocketAddr,
    pub dir: tempfile::TempDir,
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TestServer {
    /// Document tree under a temp dir: `html/` for static files, `cgi-bin/`
    /// for shell scripts run through /bin/sh.
    pub fn start() -> Self {
        Self::start_with(|_| {})
    }

    pub fn start_with(customize: impl FnOnce(&mut serde_json::Value)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("html/errors")).unwrap();
        fs::create_dir_all(root.join("cgi-bin")).unwrap();
        fs::write(root.join("html/index.html"), "<h1>welcome</h1>\n").unwrap();
        fs::write(root.join("html/errors/404.html"), "<p>custom missing page</p>\n").unwrap();

        let mut config = serde_json::json!({
            "client_timeout_secs": 5,
            "cgi_timeout_secs": 2,
            "servers": [{
                "listen": "127.0.0.1:0",
                "server_name": "localhost",
                "root": root.join("html"),
                "client_max_body_size": 4096,
                "error_pages": { "404": "/errors/404.html" },
                "locations": [{
                    "path": "/cgi-bin",
                    "root": root,
                    "allowed_methods": ["GET", "POST"],
                    "cgi_extensions": [".sh"],
                    "cgi_pass": "/bin/sh"
                }, {
                    "path": "/uploads",
                    "allowed_methods": ["POST", "DELETE", "GET"],
                    "upload_store": "uploads"
                }, {
                    "path": "/old",
                    "return": { "code": 301, "url": "/index.html" }
                }]
            }]
        });
        customize(&mut config);

        let config = Config::from_json(&config.to_string()).unwrap();
        let mut server = Server::bind(&config).unwrap();
        let addr = server.local_addrs()[0];
        let shutdown = server.shutdown_handle();
        let handle = std::thread::spawn(move || {
            server.run().unwrap();
        });

        Self {
            addr,
            dir,
            shutdown,
            handle: Some(handle),
        }
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    /// Install an executable script under `cgi-bin/`.
    pub fn script(&self, name: &str, body: &str) -> PathBuf {
        let path = self.path("cgi-bin").join(name);
        fs::write(&path, body).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    pub fn connect(&self) -> Client {
        Client::connect(self.addr)
    }

    /// One request on a fresh connection.
    pub fn send(&self, raw: &str) -> Reply {
        self.connect().send(raw.as_bytes())
    }

    pub fn get(&self, path: &str) -> Reply {
        self.send(&format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n"))
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[derive(Debug)]
pub struct Reply {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Reply {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

pub struct Client {
    stream: TcpStream,
    pending: Vec<u8>,
}

impl Client {
    pub fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        Self {
            stream,
            pending: Vec::new(),
        }
    }

    pub fn write(&mut self, raw: &[u8]) {
        self.stream.write_all(raw).unwrap();
    }

    pub fn send(&mut self, raw: &[u8]) -> Reply {
        self.write(raw);
        self.read_reply(false)
    }

    pub fn send_head(&mut self, raw: &[u8]) -> Reply {
        self.write(raw);
        self.read_reply(true)
    }

    fn fill(&mut self) -> bool {
        let mut chunk = [0u8; 8192];
        match self.stream.read(&mut chunk) {
            Ok(0) => false,
            Ok(n) => {
                self.pending.extend_from_slice(&chunk[..n]);
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => false,
            Err(e) => panic!("read failed: {e}"),
        }
    }

    pub fn read_reply(&mut self, head_only: bool) -> Reply {
        let header_end = loop {
            if let Some(pos) = find(&self.pending, b"\r\n\r\n") {
                break pos;
            }
            assert!(self.fill(), "connection closed before a full response");
        };

        let head = String::from_utf8(self.pending[..header_end].to_vec()).unwrap();
        self.pending.drain(..header_end + 4);
        let mut lines = head.split("\r\n");
        let status_line = lines.next().unwrap();
        let status = status_line.split(' ').nth(1).unwrap().parse().unwrap();
        let headers: Vec<(String, String)> = lines
            .filter_map(|l| l.split_once(':'))
            .map(|(n, v)| (n.trim().to_string(), v.trim().to_string()))
            .collect();

        let length = headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case("Content-Length"))
            .map(|(_, v)| v.parse::<usize>().unwrap())
            .unwrap_or(0);
        let length = if head_only { 0 } else { length };
        while self.pending.len() < length {
            assert!(self.fill(), "connection closed mid-body");
        }
        let body = self.pending.drain(..length).collect();

        Reply {
            status,
            headers,
            body,
        }
    }

    /// True once the server has closed its side.
    pub fn is_closed_by_peer(&mut self) -> bool {
        self.pending.is_empty() && !self.fill()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
