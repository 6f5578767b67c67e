// src/reactor.rs
//! Readiness multiplexer: one epoll instance plus the fd → owner registry.

use crate::error::{ServeError, ServeResult};
use crate::syscalls::{Epoll, epoll_event};
use std::collections::HashMap;
use std::io;
use std::ops::BitOr;
use std::os::fd::RawFd;
use std::time::Duration;
use tracing::warn;

const MAX_EVENTS: usize = 1024;

/// Who a registered descriptor belongs to. The index is a listener index or
/// a connection slab key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Owner {
    Listener(usize),
    Client(usize),
    /// Write end of the CGI child's stdin pipe.
    CgiInput(usize),
    /// Read end of the CGI child's stdout pipe.
    CgiOutput(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u32);

impl Interest {
    pub const READABLE: Interest = Interest(libc::EPOLLIN as u32);
    pub const WRITABLE: Interest = Interest(libc::EPOLLOUT as u32);
    pub const PEER_CLOSED: Interest = Interest(libc::EPOLLRDHUP as u32);

    pub fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub hangup: bool,
    pub error: bool,
}

impl Readiness {
    fn from_bits(bits: u32) -> Self {
        Self {
            readable: bits & (libc::EPOLLIN | libc::EPOLLPRI) as u32 != 0,
            writable: bits & libc::EPOLLOUT as u32 != 0,
            hangup: bits & (libc::EPOLLHUP | libc::EPOLLRDHUP) as u32 != 0,
            error: bits & libc::EPOLLERR as u32 != 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub fd: RawFd,
    pub owner: Owner,
    pub readiness: Readiness,
}

pub struct Reactor {
    epoll: Epoll,
    registry: HashMap<RawFd, Owner>,
    events: Vec<epoll_event>,
}

impl Reactor {
    pub fn new() -> ServeResult<Self> {
        Ok(Self {
            epoll: Epoll::new()?,
            registry: HashMap::new(),
            events: vec![epoll_event { events: 0, u64: 0 }; MAX_EVENTS],
        })
    }

    /// Add `fd`. On failure the registry is left untouched.
    pub fn register(&mut self, fd: RawFd, owner: Owner, interest: Interest) -> ServeResult<()> {
        if self.registry.contains_key(&fd) {
            return Err(ServeError::Registration {
                fd,
                source: io::Error::from_raw_os_error(libc::EEXIST),
            });
        }
        self.epoll
            .add(fd, fd as u64, interest.0)
            .map_err(|source| ServeError::Registration { fd, source })?;
        self.registry.insert(fd, owner);
        Ok(())
    }

    pub fn reregister(&mut self, fd: RawFd, interest: Interest) -> ServeResult<()> {
        if !self.registry.contains_key(&fd) {
            return Err(ServeError::Registration {
                fd,
                source: io::Error::from_raw_os_error(libc::ENOENT),
            });
        }
        self.epoll
            .modify(fd, fd as u64, interest.0)
            .map_err(|source| ServeError::Registration { fd, source })
    }

    /// Remove `fd`; must run before the descriptor is closed. Returns the
    /// owner the first time only.
    pub fn deregister(&mut self, fd: RawFd) -> Option<Owner> {
        let owner = self.registry.remove(&fd)?;
        if let Err(e) = self.epoll.delete(fd) {
            warn!(fd, error = %e, "epoll delete failed");
        }
        Some(owner)
    }

    pub fn owner_of(&self, fd: RawFd) -> Option<Owner> {
        self.registry.get(&fd).copied()
    }

    pub fn len(&self) -> usize {
        self.registry.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// Block until something is ready or `timeout` passes (`None` waits
    /// forever). An interrupted wait yields an empty batch.
    pub fn poll(&mut self, timeout: Option<Duration>) -> ServeResult<Vec<Event>> {
        let timeout_ms = match timeout {
            Some(d) => d.as_millis().min(i32::MAX as u128) as i32,
            None => -1,
        };

        let n = self.epoll.wait(&mut self.events, timeout_ms)?;
        let mut ready = Vec::with_capacity(n);
        for ev in &self.events[..n] {
            let bits = ev.events;
            let fd = ev.u64 as RawFd;
            // A stale fd means it was deregistered since the kernel queued it.
            if let Some(&owner) = self.registry.get(&fd) {
                ready.push(Event {
                    fd,
                    owner,
                    readiness: Readiness::from_bits(bits),
                });
            }
        }
        Ok(ready)
    }
}
