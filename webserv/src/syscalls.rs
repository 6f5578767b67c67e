// src/syscalls.rs
//! Thin wrappers over the libc calls the reactor needs.
//!
//! Every descriptor created here is non-blocking where the parent touches it
//! and close-on-exec, so CGI children only ever see the pipe ends that were
//! explicitly `dup2`'d onto their stdin/stdout.

use crate::error::ServeResult;
use libc::{c_char, c_int, c_void, socklen_t};
use std::ffi::{CStr, CString};
use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;

// ---- Socket Operations ----

/// Create a non-blocking TCP listener bound to `addr`.
///
/// IPv6 listeners are `IPV6_V6ONLY` so an IPv4 and an IPv6 server block can
/// share a port number.
pub fn create_listen_socket(addr: &SocketAddr) -> ServeResult<OwnedFd> {
    let domain = if addr.is_ipv6() {
        libc::AF_INET6
    } else {
        libc::AF_INET
    };

    let raw = unsafe {
        libc::socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    };
    if raw < 0 {
        return Err(io::Error::last_os_error().into());
    }
    // Owned from here on so every early return closes it.
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    set_flag(fd.as_raw_fd(), libc::SOL_SOCKET, libc::SO_REUSEADDR)?;
    if addr.is_ipv6() {
        set_flag(fd.as_raw_fd(), libc::IPPROTO_IPV6, libc::IPV6_V6ONLY)?;
    }

    bind_addr(fd.as_raw_fd(), addr)?;

    if unsafe { libc::listen(fd.as_raw_fd(), libc::SOMAXCONN) } < 0 {
        return Err(io::Error::last_os_error().into());
    }

    Ok(fd)
}

fn set_flag(fd: c_int, level: c_int, name: c_int) -> io::Result<()> {
    let one: c_int = 1;
    let res = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        )
    };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn bind_addr(fd: c_int, addr: &SocketAddr) -> io::Result<()> {
    let (storage, len) = socket_addr_to_raw(addr);
    let res = unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn socket_addr_to_raw(addr: &SocketAddr) -> (libc::sockaddr_storage, socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(a) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: a.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(a.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe { ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin) };
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(a) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: a.port().to_be(),
                sin6_flowinfo: a.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: a.ip().octets(),
                },
                sin6_scope_id: a.scope_id(),
            };
            unsafe { ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6) };
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as socklen_t)
}

fn socket_addr_from_raw(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            Some(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

/// Address a bound socket actually listens on (resolves port 0).
pub fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
    let res = unsafe {
        libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len)
    };
    if res < 0 {
        return Err(io::Error::last_os_error());
    }
    socket_addr_from_raw(&storage)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unknown address family"))
}

/// Accept a non-blocking connection. `Ok(None)` means the backlog is drained.
pub fn accept_connection(listen_fd: RawFd) -> ServeResult<Option<(OwnedFd, SocketAddr)>> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;

    let fd = unsafe {
        libc::accept4(
            listen_fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    };

    if fd < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            return Ok(None);
        }
        return Err(err.into());
    }

    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    let peer = socket_addr_from_raw(&storage)
        .unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));
    Ok(Some((fd, peer)))
}

// ---- Epoll Operations ----

pub use libc::epoll_event;

/// A level-triggered epoll instance.
pub struct Epoll {
    fd: OwnedFd,
}

impl Epoll {
    pub fn new() -> ServeResult<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    pub fn add(&self, fd: RawFd, token: u64, interests: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, interests)
    }

    pub fn modify(&self, fd: RawFd, token: u64, interests: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, interests)
    }

    /// Remove `fd`. Descriptors that are already gone (closed, or never
    /// added) are not an error.
    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        let epfd = self.fd.as_raw_fd();
        let res = unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) };
        if res < 0 {
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::ENOENT) | Some(libc::EBADF) => {}
                _ => return Err(err),
            }
        }
        Ok(())
    }

    fn ctl(&self, op: c_int, fd: RawFd, token: u64, interests: u32) -> io::Result<()> {
        let mut event = epoll_event {
            events: interests,
            u64: token,
        };
        if unsafe { libc::epoll_ctl(self.fd.as_raw_fd(), op, fd, &mut event) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Wait for readiness. An interrupted wait reports zero events.
    pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> io::Result<usize> {
        let res = unsafe {
            libc::epoll_wait(
                self.fd.as_raw_fd(),
                events.as_mut_ptr(),
                events.len() as c_int,
                timeout_ms,
            )
        };

        if res < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(0);
            }
            return Err(err);
        }

        Ok(res as usize)
    }
}

// ---- Byte I/O ----
//
// All of these surface EAGAIN as `io::ErrorKind::WouldBlock` and retry EINTR.

fn retry_eintr(mut op: impl FnMut() -> isize) -> io::Result<usize> {
    loop {
        let res = op();
        if res >= 0 {
            return Ok(res as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

pub fn recv_nonblocking(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    retry_eintr(|| unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), 0) })
}

/// Send on a socket without raising SIGPIPE when the peer is gone.
pub fn send_nonblocking(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    retry_eintr(|| unsafe {
        libc::send(fd, buf.as_ptr() as *const c_void, buf.len(), libc::MSG_NOSIGNAL)
    })
}

pub fn read_nonblocking(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    retry_eintr(|| unsafe { libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len()) })
}

pub fn write_nonblocking(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    retry_eintr(|| unsafe { libc::write(fd, buf.as_ptr() as *const c_void, buf.len()) })
}

// ---- Pipes ----

/// Create a close-on-exec pipe. Returns (read_fd, write_fd); both blocking.
pub fn create_pipe() -> ServeResult<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as c_int; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } < 0 {
        return Err(io::Error::last_os_error().into());
    }
    let read = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    let write = unsafe { OwnedFd::from_raw_fd(fds[1]) };
    Ok((read, write))
}

pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Writing to a pipe whose reader exited must surface as EPIPE, not kill the
/// whole server.
pub fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

// ---- Processes ----

/// How a reaped child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStatus {
    Exited(i32),
    Signaled(i32),
}

impl ChildStatus {
    fn from_raw(status: c_int) -> Self {
        if libc::WIFSIGNALED(status) {
            ChildStatus::Signaled(libc::WTERMSIG(status))
        } else {
            ChildStatus::Exited(libc::WEXITSTATUS(status))
        }
    }
}

/// Everything the child needs, prepared before `fork` so the child never
/// allocates.
pub struct SpawnSpec<'a> {
    pub program: &'a CStr,
    pub argv: &'a [CString],
    pub envp: &'a [CString],
    pub workdir: &'a CStr,
    /// Read end for the child's stdin; `None` means `/dev/null`.
    pub stdin: Option<RawFd>,
    pub stdout: RawFd,
}

/// Fork and exec. A failed exec is only visible later as exit status 127.
pub fn spawn_child(spec: &SpawnSpec<'_>) -> io::Result<libc::pid_t> {
    let argv: Vec<*const c_char> = spec
        .argv
        .iter()
        .map(|a| a.as_ptr())
        .chain(std::iter::once(ptr::null()))
        .collect();
    let envp: Vec<*const c_char> = spec
        .envp
        .iter()
        .map(|e| e.as_ptr())
        .chain(std::iter::once(ptr::null()))
        .collect();
    let dev_null = c"/dev/null";

    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(io::Error::last_os_error());
    }

    if pid == 0 {
        // Child: async-signal-safe calls only from here to execve.
        unsafe {
            libc::signal(libc::SIGPIPE, libc::SIG_DFL);
            if libc::chdir(spec.workdir.as_ptr()) < 0 {
                libc::_exit(127);
            }
            let stdin = match spec.stdin {
                Some(fd) => fd,
                None => libc::open(dev_null.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC),
            };
            if stdin < 0 || libc::dup2(stdin, libc::STDIN_FILENO) < 0 {
                libc::_exit(127);
            }
            if libc::dup2(spec.stdout, libc::STDOUT_FILENO) < 0 {
                libc::_exit(127);
            }
            libc::execve(spec.program.as_ptr(), argv.as_ptr(), envp.as_ptr());
            libc::_exit(127);
        }
    }

    Ok(pid)
}

/// Non-blocking reap. `Ok(None)` while the child is still running.
pub fn try_wait(pid: libc::pid_t) -> io::Result<Option<ChildStatus>> {
    let mut status: c_int = 0;
    let res = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
    if res < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(None);
        }
        return Err(err);
    }
    if res == 0 {
        return Ok(None);
    }
    Ok(Some(ChildStatus::from_raw(status)))
}

/// Blocking reap, used only right after SIGKILL.
pub fn wait_blocking(pid: libc::pid_t) -> io::Result<ChildStatus> {
    let mut status: c_int = 0;
    loop {
        let res = unsafe { libc::waitpid(pid, &mut status, 0) };
        if res >= 0 {
            return Ok(ChildStatus::from_raw(status));
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Deliver `signal` to `pid`. A child that already exited is not an error.
pub fn send_signal(pid: libc::pid_t, signal: c_int) -> io::Result<()> {
    if unsafe { libc::kill(pid, signal) } < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            return Err(err);
        }
    }
    Ok(())
}
