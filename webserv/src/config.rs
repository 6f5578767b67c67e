// src/config.rs
//! JSON configuration, resolved into virtual servers with their locations.

use crate::http::Method;
use crate::router::LocationRouter;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_CONFIG_PATH: &str = "webserv.json";
const MAX_CONNECTIONS_DEFAULT: usize = 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid JSON in {}: {source}", path.display())]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

fn invalid(msg: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(msg.into())
}

/// Top-level configuration file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Idle timeout for client connections (default: 60).
    #[serde(default = "default_client_timeout")]
    pub client_timeout_secs: u64,

    /// Wall-clock limit for one CGI invocation (default: 30).
    #[serde(default = "default_cgi_timeout")]
    pub cgi_timeout_secs: u64,

    /// Connection slab capacity (default: 1024).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    pub servers: Vec<ServerConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    pub listen: SocketAddr,
    #[serde(default, deserialize_with = "one_or_many")]
    pub server_name: Vec<String>,
    #[serde(default = "default_root")]
    pub root: PathBuf,
    #[serde(default = "default_index")]
    pub index: Vec<String>,
    #[serde(default = "default_body_limit")]
    pub client_max_body_size: usize,
    /// Status code → page path, optionally prefixed by `=code ` to replace
    /// the status.
    #[serde(default)]
    pub error_pages: BTreeMap<String, String>,
    #[serde(default)]
    pub autoindex: bool,
    #[serde(default)]
    pub locations: Vec<LocationConfig>,
}

/// A location block. Absent fields inherit from the server.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocationConfig {
    pub path: String,
    pub root: Option<PathBuf>,
    pub allowed_methods: Option<Vec<Method>>,
    #[serde(default)]
    pub cgi_extensions: Vec<String>,
    pub cgi_pass: Option<PathBuf>,
    pub upload_store: Option<PathBuf>,
    pub index: Option<Vec<String>>,
    pub autoindex: Option<bool>,
    pub client_max_body_size: Option<usize>,
    #[serde(default)]
    pub error_pages: BTreeMap<String, String>,
    #[serde(rename = "return")]
    pub redirect: Option<Redirect>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Redirect {
    pub code: u16,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorPage {
    /// URI path of the page, resolved through the server's locations.
    pub path: String,
    /// Status sent instead of the one that triggered the page.
    pub status: Option<u16>,
}

/// A location with every inherited value filled in.
#[derive(Debug, Clone)]
pub struct Location {
    pub path: String,
    pub root: PathBuf,
    pub allowed_methods: Vec<Method>,
    pub cgi_extensions: Vec<String>,
    pub cgi_pass: Option<PathBuf>,
    pub upload_store: Option<PathBuf>,
    pub index: Vec<String>,
    pub autoindex: bool,
    pub client_max_body_size: usize,
    pub error_pages: HashMap<u16, ErrorPage>,
    pub redirect: Option<Redirect>,
}

impl Location {
    pub fn allows(&self, method: Method) -> bool {
        self.allowed_methods.contains(&method)
    }

    pub fn allow_header(&self) -> String {
        self.allowed_methods
            .iter()
            .map(|m| m.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

#[derive(Debug, Clone)]
pub struct VirtualServer {
    pub listen: SocketAddr,
    pub server_names: Vec<String>,
    pub locations: Vec<Location>,
    router: LocationRouter,
}

impl VirtualServer {
    pub fn location_for(&self, path: &str) -> usize {
        // The resolver always registers "/", so this only falls back for
        // paths that somehow escape it.
        self.router.match_location(path).unwrap_or(0)
    }

    pub fn answers_to(&self, host: &str) -> bool {
        self.server_names.iter().any(|n| n.eq_ignore_ascii_case(host))
    }

    /// Human-readable name for `SERVER_NAME`.
    pub fn primary_name(&self) -> String {
        self.server_names
            .first()
            .cloned()
            .unwrap_or_else(|| self.listen.ip().to_string())
    }
}

fn default_client_timeout() -> u64 {
    60
}

fn default_cgi_timeout() -> u64 {
    30
}

fn default_max_connections() -> usize {
    MAX_CONNECTIONS_DEFAULT
}

fn default_root() -> PathBuf {
    PathBuf::from("html")
}

fn default_index() -> Vec<String> {
    vec!["index.html".to_string()]
}

fn default_body_limit() -> usize {
    1024 * 1024
}

fn all_methods() -> Vec<Method> {
    vec![Method::Get, Method::Head, Method::Post, Method::Delete]
}

fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(s) => vec![s],
        OneOrMany::Many(v) => v,
    })
}

impl Config {
    /// Load from the first CLI argument, `WEBSERV_CONFIG`, or
    /// `webserv.json`, after reading `.env`.
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if missing)
        let _ = dotenvy::dotenv();

        let path = std::env::args()
            .nth(1)
            .or_else(|| std::env::var("WEBSERV_CONFIG").ok())
            .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
        Self::from_file(path)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config: Config =
            serde_json::from_str(&text).map_err(|source| ConfigError::Json {
                path: path.to_path_buf(),
                source,
            })?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.resolve()?;
        Ok(config)
    }

    /// Parse and validate without consulting the environment.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(text).map_err(|source| ConfigError::Json {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        config.resolve()?;
        Ok(config)
    }

    /// `WEBSERV_CLIENT_TIMEOUT` / `WEBSERV_CGI_TIMEOUT` in seconds.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let parse = |key: &str, value: String| {
            value
                .trim()
                .parse::<u64>()
                .map_err(|_| invalid(format!("{key} must be a number of seconds, got {value:?}")))
        };
        if let Some(v) = lookup("WEBSERV_CLIENT_TIMEOUT") {
            self.client_timeout_secs = parse("WEBSERV_CLIENT_TIMEOUT", v)?;
        }
        if let Some(v) = lookup("WEBSERV_CGI_TIMEOUT") {
            self.cgi_timeout_secs = parse("WEBSERV_CGI_TIMEOUT", v)?;
        }
        Ok(())
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_secs(self.client_timeout_secs)
    }

    pub fn cgi_timeout(&self) -> Duration {
        Duration::from_secs(self.cgi_timeout_secs)
    }

    /// Validate and fill in inherited values.
    pub fn resolve(&self) -> Result<Vec<VirtualServer>, ConfigError> {
        if self.servers.is_empty() {
            return Err(invalid("at least one server is required"));
        }
        if self.client_timeout_secs == 0 || self.cgi_timeout_secs == 0 {
            return Err(invalid("timeouts must be at least one second"));
        }
        if self.max_connections == 0 {
            return Err(invalid("max_connections must be positive"));
        }

        let mut seen: Vec<(SocketAddr, String)> = Vec::new();
        let mut resolved = Vec::with_capacity(self.servers.len());
        for server in &self.servers {
            for name in server.server_name.iter().map(|n| n.to_ascii_lowercase()) {
                if seen.contains(&(server.listen, name.clone())) {
                    return Err(invalid(format!(
                        "duplicate server_name {name:?} on {}",
                        server.listen
                    )));
                }
                seen.push((server.listen, name));
            }
            resolved.push(resolve_server(server)?);
        }
        Ok(resolved)
    }
}

fn parse_error_pages(
    pages: &BTreeMap<String, String>,
    into: &mut HashMap<u16, ErrorPage>,
) -> Result<(), ConfigError> {
    for (code, target) in pages {
        let code: u16 = code
            .trim()
            .parse()
            .map_err(|_| invalid(format!("error page code {code:?} is not a number")))?;
        if !(300..=599).contains(&code) {
            return Err(invalid(format!("error page code {code} out of range")));
        }

        let target = target.trim();
        let (status, path) = match target.strip_prefix('=') {
            Some(rest) => {
                let (status, path) = rest
                    .split_once(char::is_whitespace)
                    .ok_or_else(|| invalid(format!("error page {target:?} lacks a path")))?;
                let status: u16 = status
                    .parse()
                    .map_err(|_| invalid(format!("bad override status in {target:?}")))?;
                (Some(status), path.trim())
            }
            None => (None, target),
        };
        if !path.starts_with('/') {
            return Err(invalid(format!("error page path {path:?} must start with '/'")));
        }
        into.insert(
            code,
            ErrorPage {
                path: path.to_string(),
                status,
            },
        );
    }
    Ok(())
}

fn resolve_server(server: &ServerConfig) -> Result<VirtualServer, ConfigError> {
    let mut server_pages = HashMap::new();
    parse_error_pages(&server.error_pages, &mut server_pages)?;

    let implicit_root = LocationConfig {
        path: "/".to_string(),
        root: None,
        allowed_methods: None,
        cgi_extensions: Vec::new(),
        cgi_pass: None,
        upload_store: None,
        index: None,
        autoindex: None,
        client_max_body_size: None,
        error_pages: BTreeMap::new(),
        redirect: None,
    };
    let has_root = server.locations.iter().any(|l| l.path.trim_end_matches('/').is_empty());

    let mut router = LocationRouter::new();
    let mut locations = Vec::new();
    let blocks = (!has_root)
        .then_some(&implicit_root)
        .into_iter()
        .chain(server.locations.iter());

    for block in blocks {
        if !block.path.starts_with('/') {
            return Err(invalid(format!("location path {:?} must start with '/'", block.path)));
        }
        if !router.add(&block.path, locations.len()) {
            return Err(invalid(format!("duplicate location {:?}", block.path)));
        }
        locations.push(resolve_location(server, block, &server_pages)?);
    }

    Ok(VirtualServer {
        listen: server.listen,
        server_names: server.server_name.clone(),
        locations,
        router,
    })
}

fn resolve_location(
    server: &ServerConfig,
    block: &LocationConfig,
    server_pages: &HashMap<u16, ErrorPage>,
) -> Result<Location, ConfigError> {
    for ext in &block.cgi_extensions {
        if !ext.starts_with('.') || ext.len() < 2 {
            return Err(invalid(format!("cgi extension {ext:?} must look like \".py\"")));
        }
    }
    if let Some(redirect) = &block.redirect
        && !(300..=399).contains(&redirect.code)
    {
        return Err(invalid(format!("return code {} is not a redirect", redirect.code)));
    }

    let mut methods = block.allowed_methods.clone().unwrap_or_else(all_methods);
    let mut unique = Vec::with_capacity(methods.len());
    for m in methods.drain(..) {
        if !unique.contains(&m) {
            unique.push(m);
        }
    }

    let root = block.root.clone().unwrap_or_else(|| server.root.clone());
    let upload_store = block.upload_store.as_ref().map(|dir| root.join(dir));

    let mut error_pages = server_pages.clone();
    parse_error_pages(&block.error_pages, &mut error_pages)?;

    Ok(Location {
        path: block.path.clone(),
        root,
        allowed_methods: unique,
        cgi_extensions: block.cgi_extensions.clone(),
        cgi_pass: block.cgi_pass.clone(),
        upload_store,
        index: block.index.clone().unwrap_or_else(|| server.index.clone()),
        autoindex: block.autoindex.unwrap_or(server.autoindex),
        client_max_body_size: block
            .client_max_body_size
            .unwrap_or(server.client_max_body_size),
        error_pages,
        redirect: block.redirect.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "client_timeout_secs": 60,
        "cgi_timeout_secs": 30,
        "servers": [{
            "listen": "0.0.0.0:8080",
            "server_name": "localhost",
            "root": "./docs/html",
            "client_max_body_size": 1048576,
            "error_pages": { "404": "/errors/404.html", "500": "=200 /errors/500.html" },
            "locations": [{
                "path": "/cgi-bin",
                "root": "./docs",
                "allowed_methods": ["GET", "POST", "GET"],
                "cgi_extensions": [".py"],
                "cgi_pass": "/usr/bin/python3",
                "upload_store": "uploads"
            }, {
                "path": "/old",
                "return": { "code": 301, "url": "/new" }
            }]
        }]
    }"#;

    #[test]
    fn sample_resolves_with_inheritance() {
        let config = Config::from_json(SAMPLE).unwrap();
        assert_eq!(config.max_connections, 1024);
        let servers = config.resolve().unwrap();
        let server = &servers[0];

        let root = &server.locations[server.location_for("/index.html")];
        assert_eq!(root.path, "/");
        assert_eq!(root.root, PathBuf::from("./docs/html"));
        assert_eq!(root.index, vec!["index.html".to_string()]);
        assert_eq!(root.allowed_methods.len(), 4);

        let cgi = &server.locations[server.location_for("/cgi-bin/env.py")];
        assert_eq!(cgi.allowed_methods, vec![Method::Get, Method::Post]);
        assert_eq!(cgi.upload_store, Some(PathBuf::from("./docs/uploads")));
        assert_eq!(cgi.client_max_body_size, 1048576);
        assert_eq!(cgi.error_pages[&404].path, "/errors/404.html");
        assert_eq!(cgi.error_pages[&500].status, Some(200));

        let old = &server.locations[server.location_for("/old/page")];
        assert_eq!(old.redirect.as_ref().unwrap().url, "/new");
        assert!(server.answers_to("LOCALHOST"));
    }

    #[test]
    fn ipv6_listen_and_name_lists() {
        let config = Config::from_json(
            r#"{ "servers": [{ "listen": "[::1]:8081", "server_name": ["a", "b"] }] }"#,
        )
        .unwrap();
        let servers = config.resolve().unwrap();
        assert!(servers[0].listen.is_ipv6());
        assert_eq!(servers[0].server_names, vec!["a", "b"]);
        assert_eq!(servers[0].primary_name(), "a");
    }

    #[test]
    fn validation_failures() {
        let cases = [
            r#"{ "servers": [] }"#,
            r#"{ "servers": [{ "listen": "127.0.0.1:1", "locations": [{ "path": "x" }] }] }"#,
            r#"{ "servers": [{ "listen": "127.0.0.1:1", "locations": [{ "path": "/a" }, { "path": "/a/" }] }] }"#,
            r#"{ "servers": [{ "listen": "127.0.0.1:1", "error_pages": { "200": "/x" } }] }"#,
            r#"{ "servers": [{ "listen": "127.0.0.1:1", "locations": [{ "path": "/", "cgi_extensions": ["py"] }] }] }"#,
            r#"{ "servers": [{ "listen": "127.0.0.1:1", "locations": [{ "path": "/", "return": { "code": 200, "url": "/" } }] }] }"#,
            r#"{ "servers": [{ "listen": "127.0.0.1:1", "server_name": "a" }, { "listen": "127.0.0.1:1", "server_name": "A" }] }"#,
            r#"{ "cgi_timeout_secs": 0, "servers": [{ "listen": "127.0.0.1:1" }] }"#,
        ];
        for case in cases {
            assert!(
                matches!(Config::from_json(case), Err(ConfigError::Invalid(_))),
                "accepted: {case}"
            );
        }

        assert!(matches!(
            Config::from_json(r#"{ "servers": [{ "listen": "nope" }] }"#),
            Err(ConfigError::Json { .. })
        ));
    }

    #[test]
    fn environment_overrides() {
        let mut config = Config::from_json(SAMPLE).unwrap();
        config
            .apply_overrides(|key| (key == "WEBSERV_CGI_TIMEOUT").then(|| "5".to_string()))
            .unwrap();
        assert_eq!(config.cgi_timeout(), Duration::from_secs(5));
        assert_eq!(config.client_timeout(), Duration::from_secs(60));

        let err = config.apply_overrides(|_| Some("soon".to_string()));
        assert!(matches!(err, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn shipped_config_is_valid() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../webserv.json");
        let config = Config::from_file(path).unwrap();
        let servers = config.resolve().unwrap();
        assert_eq!(servers.len(), 2);
        let cgi = &servers[0].locations[servers[0].location_for("/cgi-bin/env.py")];
        assert_eq!(cgi.cgi_pass, None);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = Config::from_file("/nonexistent/webserv.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
