// src/lib.rs
pub mod cgi;
pub mod config;
pub mod conn;
pub mod error;
pub mod http;
pub mod logging;
pub mod parser;
pub mod reactor;
pub mod response;
pub mod router;
pub mod server;
pub mod slab;
pub mod static_files;
pub mod syscalls;

// Re-exports for users
pub use config::{Config, ConfigError};
pub use error::{ServeError, ServeResult};
pub use http::{HttpRequest, Method};
pub use response::HttpResponse;
pub use server::Server;
