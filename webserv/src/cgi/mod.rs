// src/cgi/mod.rs
//! Non-blocking CGI/1.1 gateway.
//!
//! A gateway owns one child process and the parent ends of its pipes. It is
//! advanced from the reactor: `resume` on pipe readiness, `tick` from the
//! periodic sweep. The body writer and the output reader progress
//! independently; the child is reaped once both are terminal.

pub mod env;
pub mod response;

pub use env::{CgiContext, build_environment};
pub use response::{CgiKind, CgiResponse, CgiResponseParser};

use crate::conn::IO_BUFFER_SIZE;
use crate::syscalls::{self, ChildStatus, SpawnSpec};
use std::collections::BTreeMap;
use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

pub const DEFAULT_CGI_TIMEOUT: Duration = Duration::from_secs(30);
/// Sweep-driven retries after would-block wait at least this long.
const RETRY_INTERVAL: Duration = Duration::from_secs(1);
const EXEC_FAILURE: i32 = 127;
/// Script output beyond this ends the invocation.
pub const DEFAULT_MAX_OUTPUT: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecuteResult {
    Success,
    PathError,
    ForkError,
    IoError,
    Timeout,
    ExecError,
    WritePending,
    ReadPending,
}

impl ExecuteResult {
    pub fn is_pending(self) -> bool {
        matches!(self, ExecuteResult::WritePending | ExecuteResult::ReadPending)
    }

    /// HTTP status for a failed invocation.
    pub fn status(self) -> u16 {
        match self {
            ExecuteResult::Success
            | ExecuteResult::WritePending
            | ExecuteResult::ReadPending => 200,
            ExecuteResult::PathError => 403,
            ExecuteResult::Timeout => 504,
            ExecuteResult::ForkError | ExecuteResult::IoError | ExecuteResult::ExecError => 502,
        }
    }
}

/// Progress of the body writer or the output reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
    Idle,
    InProgress,
    Completed,
    Error,
}

/// What to run and with which input.
#[derive(Debug, Clone)]
pub struct CgiInvocation {
    pub script: PathBuf,
    /// Program that runs the script (`cgi_pass`); `None` executes the
    /// script itself.
    pub interpreter: Option<PathBuf>,
    pub environment: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

#[derive(Debug)]
pub struct CgiGateway {
    timeout: Duration,
    max_output: usize,
    script: PathBuf,
    pid: Option<libc::pid_t>,
    /// Parent's write end of the child's stdin.
    stdin: Option<OwnedFd>,
    /// Parent's read end of the child's stdout.
    stdout: Option<OwnedFd>,
    started: Option<Instant>,
    body: Vec<u8>,
    bytes_written: usize,
    total_bytes: usize,
    write_state: StageState,
    read_state: StageState,
    next_write: Option<Instant>,
    next_read: Option<Instant>,
    parser: CgiResponseParser,
    response: Option<CgiResponse>,
    outcome: Option<ExecuteResult>,
}

impl CgiGateway {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            max_output: DEFAULT_MAX_OUTPUT,
            script: PathBuf::new(),
            pid: None,
            stdin: None,
            stdout: None,
            started: None,
            body: Vec::new(),
            bytes_written: 0,
            total_bytes: 0,
            write_state: StageState::Idle,
            read_state: StageState::Idle,
            next_write: None,
            next_read: None,
            parser: CgiResponseParser::new(),
            response: None,
            outcome: None,
        }
    }

    pub fn with_output_limit(mut self, max_output: usize) -> Self {
        self.max_output = max_output;
        self
    }

    /// Validate, spawn and make the first round of progress.
    pub fn execute(&mut self, invocation: CgiInvocation) -> ExecuteResult {
        self.reset();
        self.script = invocation.script.clone();

        let script = match validate_paths(&invocation.script, invocation.interpreter.as_deref()) {
            Ok(script) => script,
            Err(reason) => {
                warn!(script = %invocation.script.display(), reason, "cgi path rejected");
                return self.conclude(ExecuteResult::PathError);
            }
        };

        match self.spawn(&script, &invocation) {
            Ok(()) => {}
            Err(result) => return self.conclude(result),
        }

        self.started = Some(Instant::now());
        self.read_state = StageState::InProgress;
        if invocation.body.is_empty() {
            self.write_state = StageState::Completed;
        } else {
            self.body = invocation.body;
            self.write_state = StageState::InProgress;
        }
        debug!(pid = ?self.pid, script = %script.display(), "cgi started");

        self.advance(false)
    }

    /// Advance after pipe readiness.
    pub fn resume(&mut self) -> ExecuteResult {
        self.advance(false)
    }

    /// Advance from the periodic sweep. Stages that last hit would-block are
    /// retried at most once per second.
    pub fn tick(&mut self) -> ExecuteResult {
        self.advance(true)
    }

    /// Back to the pristine state: kill and reap a live child and close every
    /// pipe end. Calling it again does nothing.
    pub fn reset(&mut self) {
        self.kill_and_reap();
        self.stdin = None;
        self.stdout = None;
        self.script = PathBuf::new();
        self.started = None;
        self.body = Vec::new();
        self.bytes_written = 0;
        self.total_bytes = 0;
        self.write_state = StageState::Idle;
        self.read_state = StageState::Idle;
        self.next_write = None;
        self.next_read = None;
        self.parser = CgiResponseParser::new();
        self.response = None;
        self.outcome = None;
    }

    pub fn stdin_fd(&self) -> Option<RawFd> {
        self.stdin.as_ref().map(|fd| fd.as_raw_fd())
    }

    pub fn stdout_fd(&self) -> Option<RawFd> {
        self.stdout.as_ref().map(|fd| fd.as_raw_fd())
    }

    pub fn child_pid(&self) -> Option<libc::pid_t> {
        self.pid
    }

    /// Both stages are done and only the exit status is outstanding.
    pub fn is_reaping(&self) -> bool {
        self.pid.is_some() && self.outcome.is_none() && self.stages_terminal()
    }

    pub fn outcome(&self) -> Option<ExecuteResult> {
        self.outcome
    }

    pub fn write_state(&self) -> StageState {
        self.write_state
    }

    pub fn read_state(&self) -> StageState {
        self.read_state
    }

    pub fn bytes_written(&self) -> usize {
        self.bytes_written
    }

    pub fn total_bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn response(&self) -> Option<&CgiResponse> {
        self.response.as_ref()
    }

    pub fn take_response(&mut self) -> Option<CgiResponse> {
        self.response.take()
    }

    fn stages_terminal(&self) -> bool {
        !matches!(self.write_state, StageState::InProgress)
            && !matches!(self.read_state, StageState::InProgress)
    }

    fn spawn(&mut self, script: &Path, invocation: &CgiInvocation) -> Result<(), ExecuteResult> {
        let program = invocation.interpreter.as_deref().unwrap_or(script);
        let workdir = script.parent().unwrap_or(Path::new("/"));

        let c_program = path_cstring(program).ok_or(ExecuteResult::IoError)?;
        let mut argv = vec![c_program.clone()];
        if invocation.interpreter.is_some() {
            argv.push(path_cstring(script).ok_or(ExecuteResult::IoError)?);
        }
        let envp = invocation
            .environment
            .iter()
            .map(|(k, v)| CString::new(format!("{k}={v}")))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| ExecuteResult::IoError)?;
        let c_workdir = path_cstring(workdir).ok_or(ExecuteResult::IoError)?;

        let (out_read, out_write) = syscalls::create_pipe().map_err(|e| {
            error!(error = %e, "cgi stdout pipe");
            ExecuteResult::IoError
        })?;
        let input = if invocation.body.is_empty() {
            None
        } else {
            Some(syscalls::create_pipe().map_err(|e| {
                error!(error = %e, "cgi stdin pipe");
                ExecuteResult::IoError
            })?)
        };

        let nonblocking =
            syscalls::set_nonblocking(out_read.as_raw_fd()).and_then(|()| match &input {
                Some((_, in_write)) => syscalls::set_nonblocking(in_write.as_raw_fd()),
                None => Ok(()),
            });
        if let Err(e) = nonblocking {
            error!(error = %e, "cgi pipe flags");
            return Err(ExecuteResult::IoError);
        }

        let pid = syscalls::spawn_child(&SpawnSpec {
            program: &c_program,
            argv: &argv,
            envp: &envp,
            workdir: &c_workdir,
            stdin: input.as_ref().map(|(in_read, _)| in_read.as_raw_fd()),
            stdout: out_write.as_raw_fd(),
        })
        .map_err(|e| {
            error!(error = %e, script = %script.display(), "cgi fork failed");
            ExecuteResult::ForkError
        })?;

        // The child's ends close here; only ours stay open.
        drop(out_write);
        self.stdin = input.map(|(_in_read, in_write)| in_write);
        self.stdout = Some(out_read);
        self.pid = Some(pid);
        Ok(())
    }

    fn advance(&mut self, gated: bool) -> ExecuteResult {
        if let Some(outcome) = self.outcome {
            return outcome;
        }
        let (Some(pid), Some(started)) = (self.pid, self.started) else {
            warn!("cgi gateway advanced without a running invocation");
            return ExecuteResult::IoError;
        };

        let now = Instant::now();
        if now.duration_since(started) > self.timeout {
            warn!(pid, script = %self.script.display(), timeout = ?self.timeout, "cgi timed out");
            for stage in [&mut self.write_state, &mut self.read_state] {
                if *stage == StageState::InProgress {
                    *stage = StageState::Error;
                }
            }
            self.kill_and_reap();
            return self.conclude(ExecuteResult::Timeout);
        }

        if self.write_state == StageState::InProgress && due(self.next_write, now, gated) {
            self.write_step(now);
        }
        if self.read_state == StageState::InProgress && due(self.next_read, now, gated) {
            self.read_step(now);
        }
        if self.total_bytes > self.max_output {
            warn!(pid, limit = self.max_output, "cgi output too large");
            self.kill_and_reap();
            return self.conclude(ExecuteResult::IoError);
        }

        if self.write_state == StageState::InProgress {
            return ExecuteResult::WritePending;
        }
        if self.read_state == StageState::InProgress {
            return ExecuteResult::ReadPending;
        }

        match syscalls::try_wait(pid) {
            Ok(None) => ExecuteResult::ReadPending,
            Ok(Some(status)) => {
                self.pid = None;
                let result = self.exit_result(status);
                self.conclude(result)
            }
            Err(e) => {
                error!(pid, error = %e, "cgi waitpid failed");
                self.pid = None;
                self.conclude(ExecuteResult::IoError)
            }
        }
    }

    fn write_step(&mut self, now: Instant) {
        let Some(fd) = self.stdin.as_ref() else {
            self.write_state = StageState::Error;
            return;
        };
        let end = (self.bytes_written + IO_BUFFER_SIZE).min(self.body.len());
        match syscalls::write_nonblocking(fd.as_raw_fd(), &self.body[self.bytes_written..end]) {
            Ok(0) => {
                self.write_state = StageState::Error;
                self.stdin = None;
            }
            Ok(n) => {
                self.bytes_written += n;
                self.next_write = None;
                if self.bytes_written == self.body.len() {
                    self.write_state = StageState::Completed;
                    // EOF on the child's stdin.
                    self.stdin = None;
                    self.body = Vec::new();
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.next_write = Some(now + RETRY_INTERVAL);
            }
            Err(e) => {
                debug!(error = %e, written = self.bytes_written, "cgi stdin closed early");
                self.write_state = StageState::Error;
                self.stdin = None;
            }
        }
    }

    fn read_step(&mut self, now: Instant) {
        let Some(fd) = self.stdout.as_ref() else {
            self.read_state = StageState::Error;
            return;
        };
        let mut chunk = [0u8; IO_BUFFER_SIZE];
        match syscalls::read_nonblocking(fd.as_raw_fd(), &mut chunk) {
            Ok(0) => {
                self.read_state = StageState::Completed;
                self.stdout = None;
                let parser = std::mem::take(&mut self.parser);
                self.response = Some(parser.finish());
            }
            Ok(n) => {
                self.total_bytes += n;
                self.next_read = None;
                self.parser.feed(&chunk[..n]);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.next_read = Some(now + RETRY_INTERVAL);
            }
            Err(e) => {
                error!(error = %e, "cgi stdout read failed");
                self.read_state = StageState::Error;
                self.stdout = None;
            }
        }
    }

    fn exit_result(&self, status: ChildStatus) -> ExecuteResult {
        match status {
            ChildStatus::Exited(EXEC_FAILURE) => {
                warn!(script = %self.script.display(), "cgi exec failed");
                return ExecuteResult::ExecError;
            }
            ChildStatus::Exited(0) => {}
            ChildStatus::Exited(code) => {
                warn!(script = %self.script.display(), code, "cgi exited with non-zero status");
            }
            ChildStatus::Signaled(signal) => {
                warn!(script = %self.script.display(), signal, "cgi terminated by signal");
            }
        }
        if self.read_state == StageState::Completed {
            ExecuteResult::Success
        } else {
            ExecuteResult::IoError
        }
    }

    /// Record a terminal outcome and release the pipes.
    fn conclude(&mut self, result: ExecuteResult) -> ExecuteResult {
        self.stdin = None;
        self.stdout = None;
        self.body = Vec::new();
        self.outcome = Some(result);
        result
    }

    fn kill_and_reap(&mut self) {
        let Some(pid) = self.pid.take() else {
            return;
        };
        if let Err(e) = syscalls::send_signal(pid, libc::SIGTERM) {
            warn!(pid, error = %e, "SIGTERM failed");
        }
        match syscalls::try_wait(pid) {
            Ok(Some(_)) => return,
            Ok(None) => {}
            Err(e) => {
                warn!(pid, error = %e, "waitpid failed");
                return;
            }
        }
        if let Err(e) = syscalls::send_signal(pid, libc::SIGKILL) {
            warn!(pid, error = %e, "SIGKILL failed");
        }
        if let Err(e) = syscalls::wait_blocking(pid) {
            warn!(pid, error = %e, "waitpid failed");
        }
        debug!(pid, "cgi child killed");
    }
}

impl Default for CgiGateway {
    fn default() -> Self {
        Self::new(DEFAULT_CGI_TIMEOUT)
    }
}

impl Drop for CgiGateway {
    fn drop(&mut self) {
        self.reset();
    }
}

fn due(next: Option<Instant>, now: Instant, gated: bool) -> bool {
    !gated || next.is_none_or(|at| now >= at)
}

fn path_cstring(path: &Path) -> Option<CString> {
    CString::new(path.as_os_str().as_bytes()).ok()
}

fn is_executable(path: &Path, mask: u32) -> bool {
    std::fs::metadata(path).is_ok_and(|m| m.is_file() && m.permissions().mode() & mask != 0)
}

/// Returns the canonical script path.
fn validate_paths(script: &Path, interpreter: Option<&Path>) -> Result<PathBuf, &'static str> {
    if script.components().any(|c| c == Component::ParentDir) {
        return Err("parent directory reference");
    }
    let script = std::fs::canonicalize(script).map_err(|_| "script not found")?;
    if !is_executable(&script, 0o100) {
        return Err("script is not an executable regular file");
    }
    if let Some(interpreter) = interpreter
        && !is_executable(interpreter, 0o111)
    {
        return Err("interpreter is not executable");
    }
    Ok(script)
}
