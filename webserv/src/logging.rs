// src/logging.rs
//! Tracing subscriber setup.
//!
//! The level comes from `RUST_LOG` when set:
//!
//! ```bash
//! RUST_LOG=debug webserv webserv.json
//! RUST_LOG=webserv::cgi=debug,info webserv
//! ```

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber at `info` unless `RUST_LOG` says otherwise.
///
/// Returns false if a subscriber was already installed.
pub fn init_logging() -> bool {
    init_logging_with_level("info")
}

/// Like [`init_logging`] with a different fallback level.
pub fn init_logging_with_level(level: &str) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()
        .is_ok()
}
