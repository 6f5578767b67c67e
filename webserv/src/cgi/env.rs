// src/cgi/env.rs
//! CGI/1.1 meta-variables for one request.

use crate::http::HttpRequest;
use crate::response::SERVER_SOFTWARE;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;

pub const GATEWAY_INTERFACE: &str = "CGI/1.1";
const DEFAULT_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Headers that travel as dedicated meta-variables or must not leak.
const EXCLUDED_HEADERS: &[&str] = &["Content-Type", "Content-Length", "Authorization"];

/// Server-side facts about the request being handed to a script.
#[derive(Debug, Clone)]
pub struct CgiContext<'a> {
    /// Script location on disk.
    pub script_path: &'a Path,
    /// URI prefix that names the script (`SCRIPT_NAME`).
    pub script_uri: &'a str,
    pub document_root: &'a Path,
    pub server_name: &'a str,
    pub server_port: u16,
    pub remote: SocketAddr,
    pub upload_dir: Option<&'a Path>,
}

pub fn build_environment(request: &HttpRequest, ctx: &CgiContext<'_>) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    let mut set = |k: &str, v: String| {
        env.insert(k.to_string(), v);
    };

    let auth_type = request
        .headers
        .get("Authorization")
        .and_then(|v| v.split_whitespace().next())
        .unwrap_or("");
    set("AUTH_TYPE", auth_type.to_string());

    if !request.body.is_empty() {
        set("CONTENT_LENGTH", request.body.len().to_string());
        set(
            "CONTENT_TYPE",
            request.headers.get("Content-Type").unwrap_or("").to_string(),
        );
    }

    set("GATEWAY_INTERFACE", GATEWAY_INTERFACE.to_string());

    let path_info = path_info(&request.uri.path, ctx.script_uri);
    if !path_info.is_empty() {
        let root = ctx.document_root.to_string_lossy();
        set(
            "PATH_TRANSLATED",
            format!("{}{}", root.trim_end_matches('/'), path_info),
        );
    }
    set("PATH_INFO", path_info.to_string());

    set("QUERY_STRING", request.uri.query.clone().unwrap_or_default());
    set("REMOTE_ADDR", ctx.remote.ip().to_string());
    set("REMOTE_HOST", ctx.remote.ip().to_string());
    set("REMOTE_IDENT", String::new());
    set("REMOTE_USER", String::new());
    set("REQUEST_METHOD", request.method.as_str().to_string());
    set("SCRIPT_NAME", ctx.script_uri.to_string());
    set("SCRIPT_FILENAME", ctx.script_path.to_string_lossy().into_owned());
    set("SERVER_NAME", ctx.server_name.to_string());
    set("SERVER_PORT", ctx.server_port.to_string());
    set("SERVER_PROTOCOL", request.version.clone());
    set("SERVER_SOFTWARE", SERVER_SOFTWARE.to_string());
    set("PATH", DEFAULT_PATH.to_string());
    if let Some(dir) = ctx.upload_dir {
        set("UPLOAD_DIR", dir.to_string_lossy().into_owned());
    }

    for (name, _) in request.headers.iter() {
        if EXCLUDED_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(name)) {
            continue;
        }
        let key = format!("HTTP_{}", name.to_ascii_uppercase().replace('-', "_"));
        if env.contains_key(&key) {
            continue;
        }
        let joined = request.headers.get_all(name).collect::<Vec<_>>().join(", ");
        env.insert(key, joined);
    }

    env
}

/// Remainder of the request path after the script name.
pub fn path_info<'a>(request_path: &'a str, script_uri: &str) -> &'a str {
    request_path
        .strip_prefix(script_uri.trim_end_matches('/'))
        .filter(|rest| rest.is_empty() || rest.starts_with('/'))
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{HeaderMap, Method, Uri};
    use std::path::PathBuf;

    fn request(method: Method, path: &str, body: &[u8], headers: &[(&str, &str)]) -> HttpRequest {
        let mut map = HeaderMap::new();
        for (n, v) in headers {
            map.append(*n, *v);
        }
        HttpRequest {
            method,
            uri: Uri {
                path: path.to_string(),
                query: Some("a=1&b=2".to_string()),
            },
            version: "HTTP/1.1".to_string(),
            headers: map,
            body: body.to_vec(),
            content_length: (!body.is_empty()).then_some(body.len()),
            chunked: false,
            status: 200,
        }
    }

    fn context<'a>(script: &'a Path, root: &'a Path) -> CgiContext<'a> {
        CgiContext {
            script_path: script,
            script_uri: "/cgi-bin/env.py",
            document_root: root,
            server_name: "localhost",
            server_port: 8080,
            remote: "10.0.0.7:51000".parse().unwrap(),
            upload_dir: None,
        }
    }

    #[test]
    fn standard_meta_variables() {
        let script = PathBuf::from("/srv/docs/cgi-bin/env.py");
        let root = PathBuf::from("/srv/docs/");
        let req = request(
            Method::Post,
            "/cgi-bin/env.py/extra/path",
            b"name=x",
            &[
                ("Host", "localhost"),
                ("Content-Type", "application/x-www-form-urlencoded"),
                ("User-Agent", "test"),
                ("Authorization", "Basic abc"),
            ],
        );
        let env = build_environment(&req, &context(&script, &root));

        assert_eq!(env["GATEWAY_INTERFACE"], "CGI/1.1");
        assert_eq!(env["REQUEST_METHOD"], "POST");
        assert_eq!(env["QUERY_STRING"], "a=1&b=2");
        assert_eq!(env["CONTENT_LENGTH"], "6");
        assert_eq!(env["CONTENT_TYPE"], "application/x-www-form-urlencoded");
        assert_eq!(env["SCRIPT_NAME"], "/cgi-bin/env.py");
        assert_eq!(env["PATH_INFO"], "/extra/path");
        assert_eq!(env["PATH_TRANSLATED"], "/srv/docs/extra/path");
        assert_eq!(env["REMOTE_ADDR"], "10.0.0.7");
        assert_eq!(env["SERVER_PORT"], "8080");
        assert_eq!(env["AUTH_TYPE"], "Basic");
        assert_eq!(env["HTTP_USER_AGENT"], "test");
        assert!(!env.contains_key("HTTP_AUTHORIZATION"));
        assert!(!env.contains_key("HTTP_CONTENT_TYPE"));
    }

    #[test]
    fn no_body_means_no_content_variables() {
        let script = PathBuf::from("/srv/cgi-bin/env.py");
        let root = PathBuf::from("/srv");
        let req = request(
            Method::Get,
            "/cgi-bin/env.py",
            b"",
            &[("Host", "h"), ("Content-Type", "text/plain"), ("X-A", "1"), ("x-a", "2")],
        );
        let env = build_environment(&req, &context(&script, &root));

        assert!(!env.contains_key("CONTENT_TYPE"));
        assert!(!env.contains_key("CONTENT_LENGTH"));
        assert_eq!(env["PATH_INFO"], "");
        assert!(!env.contains_key("PATH_TRANSLATED"));
        assert_eq!(env["HTTP_X_A"], "1, 2");
    }

    #[test]
    fn path_info_requires_segment_boundary() {
        assert_eq!(path_info("/cgi/a.py/x", "/cgi/a.py"), "/x");
        assert_eq!(path_info("/cgi/a.pyc", "/cgi/a.py"), "");
        assert_eq!(path_info("/cgi/a.py", "/cgi/a.py"), "");
    }
}
