// src/static_files.rs
//! Filesystem-backed handling for locations without CGI.

use crate::config::Location;
use crate::http::{HttpRequest, Method};
use crate::response::HttpResponse;
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

/// Characters escaped inside autoindex hrefs.
const HREF: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?');

static UPLOAD_SEQ: AtomicU64 = AtomicU64::new(0);

/// Filesystem path for a request path under `root`.
pub fn resolve(root: &Path, request_path: &str) -> PathBuf {
    root.join(request_path.trim_start_matches('/'))
}

pub fn serve(location: &Location, request: &HttpRequest) -> HttpResponse {
    match request.method {
        Method::Get | Method::Head => get(location, &request.uri.path),
        Method::Delete => delete(location, &request.uri.path),
        Method::Post => upload(location, request),
    }
}

fn status_for(err: &io::Error) -> u16 {
    match err.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::NotADirectory => 404,
        io::ErrorKind::PermissionDenied => 403,
        _ => 500,
    }
}

fn get(location: &Location, uri_path: &str) -> HttpResponse {
    let path = resolve(&location.root, uri_path);
    let meta = match fs::metadata(&path) {
        Ok(meta) => meta,
        Err(e) => {
            debug!(path = %path.display(), error = %e, "static lookup failed");
            return HttpResponse::error(status_for(&e));
        }
    };

    if meta.is_dir() {
        if !uri_path.ends_with('/') {
            return HttpResponse::redirect(301, &format!("{uri_path}/"));
        }
        for index in &location.index {
            let candidate = path.join(index);
            if candidate.is_file() {
                return file(&candidate);
            }
        }
        if location.autoindex {
            return listing(&path, uri_path);
        }
        return HttpResponse::error(403);
    }

    file(&path)
}

fn file(path: &Path) -> HttpResponse {
    match fs::read(path) {
        Ok(body) => {
            let mime = mime_guess::from_path(path).first_or_octet_stream();
            let mut resp = HttpResponse::new(200);
            resp.set_body(body, mime.essence_str());
            resp
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "static read failed");
            HttpResponse::error(status_for(&e))
        }
    }
}

fn listing(dir: &Path, uri_path: &str) -> HttpResponse {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => return HttpResponse::error(status_for(&e)),
    };

    let mut names: Vec<String> = entries
        .filter_map(Result::ok)
        .map(|entry| {
            let mut name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().is_ok_and(|t| t.is_dir()) {
                name.push('/');
            }
            name
        })
        .collect();
    names.sort();

    let title = format!("Index of {}", escape_html(uri_path));
    let mut page = format!("<!DOCTYPE html>\n<html><head><title>{title}</title></head>\n<body><h1>{title}</h1><hr><ul>\n");
    if uri_path != "/" {
        page.push_str("<li><a href=\"../\">../</a></li>\n");
    }
    for name in &names {
        page.push_str(&format!(
            "<li><a href=\"{}\">{}</a></li>\n",
            utf8_percent_encode(name, HREF),
            escape_html(name)
        ));
    }
    page.push_str("</ul><hr></body></html>\n");

    let mut resp = HttpResponse::new(200);
    resp.set_body(page.into_bytes(), "text/html; charset=utf-8");
    resp
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

fn delete(location: &Location, uri_path: &str) -> HttpResponse {
    let path = resolve(&location.root, uri_path);
    match fs::symlink_metadata(&path) {
        Ok(meta) if meta.is_dir() => HttpResponse::error(403),
        Ok(_) => match fs::remove_file(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "deleted");
                HttpResponse::new(204)
            }
            Err(e) => HttpResponse::error(status_for(&e)),
        },
        Err(e) => HttpResponse::error(status_for(&e)),
    }
}

fn upload(location: &Location, request: &HttpRequest) -> HttpResponse {
    let Some(store) = location.upload_store.as_deref() else {
        return HttpResponse::error(403);
    };
    if let Err(e) = fs::create_dir_all(store) {
        warn!(dir = %store.display(), error = %e, "upload store unavailable");
        return HttpResponse::error(500);
    }

    let extension = request
        .headers
        .get("Content-Type")
        .and_then(|ct| ct.split(';').next())
        .and_then(|essence| mime_guess::get_mime_extensions_str(essence.trim()))
        .and_then(|exts| exts.first())
        .map(|ext| format!(".{ext}"))
        .unwrap_or_default();

    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let seq = UPLOAD_SEQ.fetch_add(1, Ordering::Relaxed);
    let name = format!("upload-{stamp}-{seq}{extension}");
    let target = store.join(&name);

    let written = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&target)
        .and_then(|mut f| io::Write::write_all(&mut f, &request.body));
    if let Err(e) = written {
        warn!(path = %target.display(), error = %e, "upload failed");
        return HttpResponse::error(status_for(&e));
    }

    let uri = format!("{}/{}", request.uri.path.trim_end_matches('/'), name);
    let mut resp = HttpResponse::new(201);
    resp.set_header("Location", uri.clone());
    resp.set_body(format!("{uri}\n").into_bytes(), "text/plain");
    resp
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{HeaderMap, Uri};
    use std::collections::HashMap;

    fn location(root: &Path) -> Location {
        Location {
            path: "/".to_string(),
            root: root.to_path_buf(),
            allowed_methods: vec![Method::Get, Method::Head, Method::Post, Method::Delete],
            cgi_extensions: Vec::new(),
            cgi_pass: None,
            upload_store: None,
            index: vec!["index.html".to_string()],
            autoindex: false,
            client_max_body_size: 1024,
            error_pages: HashMap::new(),
            redirect: None,
        }
    }

    fn request(method: Method, path: &str, body: &[u8]) -> HttpRequest {
        let mut headers = HeaderMap::new();
        headers.append("Host", "localhost");
        HttpRequest {
            method,
            uri: Uri {
                path: path.to_string(),
                query: None,
            },
            version: "HTTP/1.1".to_string(),
            headers,
            body: body.to_vec(),
            content_length: Some(body.len()),
            chunked: false,
            status: 200,
        }
    }

    #[test]
    fn get_files_indexes_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("index.html"), "<h1>home</h1>").unwrap();
        fs::write(dir.path().join("app.css"), "body{}").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        let loc = location(dir.path());

        let resp = serve(&loc, &request(Method::Get, "/", b""));
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.body(), b"<h1>home</h1>");
        assert_eq!(resp.header("Content-Type"), Some("text/html"));

        let resp = serve(&loc, &request(Method::Get, "/app.css", b""));
        assert_eq!(resp.header("Content-Type"), Some("text/css"));

        let resp = serve(&loc, &request(Method::Get, "/sub", b""));
        assert_eq!(resp.status(), 301);
        assert_eq!(resp.header("Location"), Some("/sub/"));

        assert_eq!(serve(&loc, &request(Method::Get, "/sub/", b"")).status(), 403);
        assert_eq!(serve(&loc, &request(Method::Get, "/nope", b"")).status(), 404);
    }

    #[test]
    fn autoindex_lists_escaped_names() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a <b>.txt"), "x").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        let mut loc = location(dir.path());
        loc.autoindex = true;

        let resp = serve(&loc, &request(Method::Get, "/", b""));
        let page = String::from_utf8_lossy(resp.body()).into_owned();
        assert_eq!(resp.status(), 200);
        assert!(page.contains("a &lt;b&gt;.txt"));
        assert!(page.contains("href=\"a%20%3Cb%3E.txt\""));
        assert!(page.contains("nested/"));
    }

    #[test]
    fn delete_semantics() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("gone.txt"), "x").unwrap();
        fs::create_dir(dir.path().join("keep")).unwrap();
        let loc = location(dir.path());

        assert_eq!(serve(&loc, &request(Method::Delete, "/gone.txt", b"")).status(), 204);
        assert!(!dir.path().join("gone.txt").exists());
        assert_eq!(serve(&loc, &request(Method::Delete, "/gone.txt", b"")).status(), 404);
        assert_eq!(serve(&loc, &request(Method::Delete, "/keep", b"")).status(), 403);
    }

    #[test]
    fn uploads_land_in_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut loc = location(dir.path());
        assert_eq!(serve(&loc, &request(Method::Post, "/up", b"data")).status(), 403);

        loc.upload_store = Some(dir.path().join("uploads"));
        let mut req = request(Method::Post, "/up", b"payload");
        req.headers.append("Content-Type", "text/plain; charset=utf-8");
        let resp = serve(&loc, &req);
        assert_eq!(resp.status(), 201);

        let location = resp.header("Location").unwrap().to_string();
        assert!(location.starts_with("/up/upload-"));
        let name = location.rsplit('/').next().unwrap();
        let stored = fs::read(dir.path().join("uploads").join(name)).unwrap();
        assert_eq!(stored, b"payload");
    }
}
