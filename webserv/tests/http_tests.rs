mod common;

use common::TestServer;
use std::fs;

// ═══ Static files ═══

#[test]
fn test_get_index() {
    let server = TestServer::start();
    let res = server.get("/");
    assert_eq!(res.status, 200);
    assert_eq!(res.text(), "<h1>welcome</h1>\n");
    assert_eq!(res.header("Content-Type"), Some("text/html"));
    assert!(res.header("Date").is_some());
    assert!(res.header("Server").unwrap().starts_with("webserv/"));
}

#[test]
fn test_head_has_length_but_no_body() {
    let server = TestServer::start();
    let mut client = server.connect();
    let res = client.send_head(b"HEAD /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n");
    assert_eq!(res.status, 200);
    assert_eq!(res.header("Content-Length"), Some("17"));

    // The connection is still usable, so no body bytes were sent.
    let res = client.send(b"GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n");
    assert_eq!(res.text(), "<h1>welcome</h1>\n");
}

#[test]
fn test_missing_file_uses_configured_error_page() {
    let server = TestServer::start();
    let res = server.get("/nope.html");
    assert_eq!(res.status, 404);
    assert_eq!(res.text(), "<p>custom missing page</p>\n");
}

#[test]
fn test_configured_redirect() {
    let server = TestServer::start();
    let res = server.get("/old/anything");
    assert_eq!(res.status, 301);
    assert_eq!(res.header("Location"), Some("/index.html"));
}

#[test]
fn test_method_not_allowed_lists_allowed() {
    let server = TestServer::start();
    let res = server.send("DELETE /cgi-bin/x.sh HTTP/1.1\r\nHost: localhost\r\n\r\n");
    assert_eq!(res.status, 405);
    assert_eq!(res.header("Allow"), Some("GET, POST"));
}

// ═══ Protocol errors ═══

#[test]
fn test_malformed_request_gets_400_and_close() {
    let server = TestServer::start();
    let mut client = server.connect();
    let res = client.send(b"GET index.html HTTP/1.1\r\nHost: localhost\r\n\r\n");
    assert_eq!(res.status, 400);
    assert_eq!(res.header("Connection"), Some("close"));
    assert!(client.is_closed_by_peer());
}

#[test]
fn test_protocol_error_statuses() {
    let server = TestServer::start();
    assert_eq!(server.send("BREW / HTTP/1.1\r\nHost: x\r\n\r\n").status, 501);
    assert_eq!(server.send("GET / HTTP/1.0\r\nHost: x\r\n\r\n").status, 505);
    assert_eq!(server.send("GET / HTTP/1.1\r\n\r\n").status, 400);
    assert_eq!(server.send("GET /../etc/passwd HTTP/1.1\r\nHost: x\r\n\r\n").status, 400);
}

#[test]
fn test_body_over_limit_is_413() {
    let server = TestServer::start();
    let res = server.send(
        "POST /uploads HTTP/1.1\r\nHost: localhost\r\nContent-Length: 100000\r\n\r\n",
    );
    assert_eq!(res.status, 413);
}

// ═══ Keep-alive ═══

#[test]
fn test_keep_alive_serves_sequential_requests() {
    let server = TestServer::start();
    let mut client = server.connect();
    for _ in 0..3 {
        let res = client.send(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n");
        assert_eq!(res.status, 200);
        assert_eq!(res.header("Connection"), Some("keep-alive"));
    }

    let res = client.send(b"GET / HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    assert_eq!(res.header("Connection"), Some("close"));
    assert!(client.is_closed_by_peer());
}

#[test]
fn test_pipelined_requests_answered_in_order() {
    let server = TestServer::start();
    let mut client = server.connect();
    client.write(
        b"GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n\
          GET /missing HTTP/1.1\r\nHost: localhost\r\n\r\n",
    );
    assert_eq!(client.read_reply(false).status, 200);
    assert_eq!(client.read_reply(false).status, 404);
}

#[test]
fn test_chunked_upload() {
    let server = TestServer::start();
    let res = server.send(
        "POST /uploads HTTP/1.1\r\nHost: localhost\r\nContent-Type: text/plain\r\n\
         Transfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
    );
    assert_eq!(res.status, 201);
    let location = res.header("Location").unwrap().to_string();
    let stored = server.path("html").join(location.trim_start_matches('/'));
    assert_eq!(fs::read(&stored).unwrap(), b"hello world");

    // Uploaded files can be fetched and deleted again.
    assert_eq!(server.get(&location).text(), "hello world");
    let res = server.send(&format!("DELETE {location} HTTP/1.1\r\nHost: localhost\r\n\r\n"));
    assert_eq!(res.status, 204);
    assert!(!stored.exists());
}

#[test]
fn test_virtual_hosts_share_a_port() {
    let server = TestServer::start_with(|config| {
        let other = server_root(config).join("other");
        fs::create_dir_all(&other).unwrap();
        fs::write(other.join("index.html"), "other site").unwrap();
        let listen = config["servers"][0]["listen"].clone();
        config["servers"]
            .as_array_mut()
            .unwrap()
            .push(serde_json::json!({
                "listen": listen,
                "server_name": "other.test",
                "root": other,
            }));
    });

    let res = server.send("GET / HTTP/1.1\r\nHost: other.test:8080\r\n\r\n");
    assert_eq!(res.text(), "other site");
    let res = server.send("GET / HTTP/1.1\r\nHost: unknown.test\r\n\r\n");
    assert_eq!(res.text(), "<h1>welcome</h1>\n");
}

#[test]
fn test_body_limit_follows_virtual_host_with_port() {
    let server = TestServer::start_with(|config| {
        let listen = config["servers"][0]["listen"].clone();
        let root = config["servers"][0]["root"].clone();
        config["servers"]
            .as_array_mut()
            .unwrap()
            .push(serde_json::json!({
                "listen": listen,
                "server_name": "tiny.test",
                "root": root,
                "client_max_body_size": 10,
            }));
    });

    let body = "b".repeat(100);
    let post = |host: &str| {
        server.send(&format!(
            "POST / HTTP/1.1\r\nHost: {host}\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        ))
    };
    assert_eq!(post("tiny.test").status, 413);
    assert_eq!(post("tiny.test:8080").status, 413);
    assert_ne!(post("localhost:8080").status, 413);
}

// ═══ Timeouts ═══

#[test]
fn test_idle_client_is_closed() {
    let server = TestServer::start_with(|config| {
        config["client_timeout_secs"] = serde_json::json!(1);
    });
    let mut client = server.connect();
    client.write(b"GET / HT");

    let started = std::time::Instant::now();
    assert!(client.is_closed_by_peer());
    let waited = started.elapsed();
    assert!(waited >= std::time::Duration::from_millis(500), "closed after {waited:?}");
    assert!(waited < std::time::Duration::from_secs(5), "closed after {waited:?}");
}

fn server_root(config: &serde_json::Value) -> std::path::PathBuf {
    let html = config["servers"][0]["root"].as_str().unwrap();
    std::path::Path::new(html).parent().unwrap().to_path_buf()
}
