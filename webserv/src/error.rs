use crate::config::ConfigError;
use crate::parser::ParseError;
use std::io;
use std::os::fd::RawFd;
use thiserror::Error;

/// Central error type for the webserv engine.
#[derive(Debug, Error)]
pub enum ServeError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// `epoll_ctl` refused a descriptor, or it was already registered.
    #[error("failed to register fd {fd}: {source}")]
    Registration {
        fd: RawFd,
        #[source]
        source: io::Error,
    },

    /// The configuration could not be loaded or is inconsistent.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Error during HTTP request parsing.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// Connection slab reached its maximum capacity.
    #[error("connection slab is full")]
    SlabFull,
}

impl ServeError {
    /// True when the error is the non-blocking "try again later" signal.
    pub fn is_would_block(&self) -> bool {
        matches!(self, ServeError::Io(e) if e.kind() == io::ErrorKind::WouldBlock)
    }
}

pub type ServeResult<T> = Result<T, ServeError>;
