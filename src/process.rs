//! Child process supervision.
//!
//! The pipeline runs three external collaborators: an ffmpeg decoder, the
//! upscaler, and an ffmpeg encoder. [`ProcessSupervisor`] starts them with
//! the requested stdio wiring and records every live PID in a small
//! [`ProcessTable`]. The table is lock-free so the interrupt handler can
//! read it and forward a termination signal to every child without touching
//! anything else.

use std::ffi::{OsStr, OsString};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::UpscalerError;

/// Capacity of the process table.
pub const MAX_TRACKED_PROCESSES: usize = 8;

/// Which collaborator a child process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessRole {
    /// Extracts frames from the source video.
    Decoder,
    /// Upscales one batch of frame files.
    Upscaler,
    /// Muxes upscaled frames with the source audio.
    Encoder,
    /// Anything else started through the supervisor.
    Other,
}

impl Display for ProcessRole {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        let name = match self {
            ProcessRole::Decoder => "decoder",
            ProcessRole::Upscaler => "upscaler",
            ProcessRole::Encoder => "encoder",
            ProcessRole::Other => "child",
        };
        f.write_str(name)
    }
}

/// Fixed-capacity table of live child PIDs.
///
/// An entry of `0` means "not running".
#[derive(Debug, Default)]
pub struct ProcessTable {
    pids: [AtomicU32; MAX_TRACKED_PROCESSES],
}

impl ProcessTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `pid` in a free entry and return the entry index.
    ///
    /// # Errors
    ///
    /// Returns [`UpscalerError::ProcessTableFull`] when every entry is taken.
    pub fn register(&self, pid: u32) -> Result<usize, UpscalerError> {
        for (index, entry) in self.pids.iter().enumerate() {
            if entry
                .compare_exchange(0, pid, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(index);
            }
        }
        Err(UpscalerError::ProcessTableFull {
            limit: MAX_TRACKED_PROCESSES,
        })
    }

    /// Clear entry `index`.
    pub fn unregister(&self, index: usize) {
        if let Some(entry) = self.pids.get(index) {
            entry.store(0, Ordering::Release);
        }
    }

    /// Snapshot of every live PID.
    pub fn live_pids(&self) -> Vec<u32> {
        self.pids
            .iter()
            .map(|entry| entry.load(Ordering::Acquire))
            .filter(|&pid| pid != 0)
            .collect()
    }

    /// Send an interrupt to every live PID and return how many were signalled.
    ///
    /// Only performs atomic loads and `kill(2)`, so it is safe to call from
    /// the interrupt handler.
    pub fn interrupt_all(&self) -> usize {
        let mut signalled = 0;
        for entry in &self.pids {
            let pid = entry.load(Ordering::Acquire);
            if pid != 0 && send_interrupt(pid) {
                signalled += 1;
            }
        }
        signalled
    }
}

#[cfg(unix)]
fn send_interrupt(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: kill(2) has no memory-safety preconditions.
    unsafe { libc::kill(pid, libc::SIGINT) == 0 }
}

#[cfg(not(unix))]
fn send_interrupt(_pid: u32) -> bool {
    false
}

/// Block until `pid` has exited, leaving it unreaped.
///
/// The zombie keeps the PID reserved, so the table entry can be cleared
/// before the PID becomes reusable. Returns `false` if the wait failed.
#[cfg(unix)]
fn wait_until_exited(pid: u32) -> bool {
    // SAFETY: siginfo_t is plain data; all-zero is a valid value.
    let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
    loop {
        // SAFETY: `info` is a valid, writable siginfo_t.
        let result = unsafe {
            libc::waitid(
                libc::P_PID,
                pid as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOWAIT,
            )
        };
        if result == 0 {
            return true;
        }
        if std::io::Error::last_os_error().kind() != std::io::ErrorKind::Interrupted {
            return false;
        }
    }
}

#[cfg(not(unix))]
fn wait_until_exited(_pid: u32) -> bool {
    false
}

/// Where a child's standard stream is connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Redirect {
    /// Share the parent's stream.
    #[default]
    Inherit,
    /// Connect to the null device.
    Null,
    /// Create a pipe; the parent keeps the other end.
    Piped,
}

impl Redirect {
    fn to_stdio(self) -> Stdio {
        match self {
            Redirect::Inherit => Stdio::inherit(),
            Redirect::Null => Stdio::null(),
            Redirect::Piped => Stdio::piped(),
        }
    }
}

/// Everything needed to start one child process.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    role: ProcessRole,
    program: OsString,
    args: Vec<OsString>,
    working_directory: Option<PathBuf>,
    stdin: Redirect,
    stdout: Redirect,
    stderr: Redirect,
}

impl CommandSpec {
    /// Start describing a command. All streams default to [`Redirect::Inherit`].
    pub fn new<S: AsRef<OsStr>>(role: ProcessRole, program: S) -> Self {
        Self {
            role,
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            working_directory: None,
            stdin: Redirect::Inherit,
            stdout: Redirect::Inherit,
            stderr: Redirect::Inherit,
        }
    }

    /// Append one argument.
    #[must_use]
    pub fn arg<S: AsRef<OsStr>>(mut self, arg: S) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    /// Append several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|arg| arg.as_ref().to_os_string()));
        self
    }

    /// Run the child in `directory`.
    #[must_use]
    pub fn working_directory<P: AsRef<Path>>(mut self, directory: P) -> Self {
        self.working_directory = Some(directory.as_ref().to_path_buf());
        self
    }

    /// Wire the child's stdin.
    #[must_use]
    pub fn stdin(mut self, redirect: Redirect) -> Self {
        self.stdin = redirect;
        self
    }

    /// Wire the child's stdout.
    #[must_use]
    pub fn stdout(mut self, redirect: Redirect) -> Self {
        self.stdout = redirect;
        self
    }

    /// Wire the child's stderr.
    #[must_use]
    pub fn stderr(mut self, redirect: Redirect) -> Self {
        self.stderr = redirect;
        self
    }

    /// The collaborator role.
    pub fn role(&self) -> ProcessRole {
        self.role
    }

    /// The program name.
    pub fn program(&self) -> &OsStr {
        &self.program
    }

    /// The arguments, without the program name.
    pub fn arguments(&self) -> &[OsString] {
        &self.args
    }

    fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(self.stdin.to_stdio())
            .stdout(self.stdout.to_stdio())
            .stderr(self.stderr.to_stdio());
        if let Some(directory) = &self.working_directory {
            command.current_dir(directory);
        }
        command
    }
}

/// Starts child processes and tracks them for coordinated termination.
///
/// Cloning is cheap; every clone shares the same [`ProcessTable`].
#[derive(Debug, Clone, Default)]
pub struct ProcessSupervisor {
    table: Arc<ProcessTable>,
}

impl ProcessSupervisor {
    /// Create a supervisor with an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// The shared PID table.
    pub fn table(&self) -> &Arc<ProcessTable> {
        &self.table
    }

    /// Start `spec` and register the child.
    ///
    /// Pipe ends handed to the child are not kept in the parent, and the
    /// parent's ends are opened close-on-exec, so a reader never waits on a
    /// write end that only it holds.
    ///
    /// # Errors
    ///
    /// Returns [`UpscalerError::ProcessSpawn`] if the program cannot be
    /// executed and [`UpscalerError::ProcessTableFull`] if there is no room
    /// to track it (the child is killed in that case).
    pub fn spawn(&self, spec: &CommandSpec) -> Result<SupervisedChild, UpscalerError> {
        let program = spec.program.to_string_lossy().into_owned();
        log::debug!(
            "Starting {} process: {} {}",
            spec.role,
            program,
            spec.args
                .iter()
                .map(|arg| arg.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ")
        );

        let mut child = spec
            .to_command()
            .spawn()
            .map_err(|source| UpscalerError::ProcessSpawn { program, source })?;

        let pid = child.id();
        let entry = match self.table.register(pid) {
            Ok(entry) => entry,
            Err(error) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(error);
            }
        };

        Ok(SupervisedChild {
            role: spec.role,
            pid,
            stdin: child.stdin.take(),
            stdout: child.stdout.take(),
            stderr: child.stderr.take(),
            child,
            table: Arc::clone(&self.table),
            entry: Some(entry),
        })
    }

    /// Interrupt every tracked child. Returns how many were signalled.
    pub fn broadcast_terminate(&self) -> usize {
        let signalled = self.table.interrupt_all();
        log::debug!("Sent interrupt to {signalled} child process(es)");
        signalled
    }
}

/// A running child registered with a [`ProcessSupervisor`].
///
/// Dropping a child that was never waited for kills it, reaps it and clears
/// its table entry.
#[derive(Debug)]
pub struct SupervisedChild {
    role: ProcessRole,
    pid: u32,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    table: Arc<ProcessTable>,
    entry: Option<usize>,
}

impl SupervisedChild {
    /// The collaborator role.
    pub fn role(&self) -> ProcessRole {
        self.role
    }

    /// OS process id.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Take the write end of the child's stdin pipe.
    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    /// Take the read end of the child's stdout pipe.
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Take the read end of the child's stderr pipe.
    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.stderr.take()
    }

    /// Close our end of the child's stdin, signalling end of input.
    pub fn close_stdin(&mut self) {
        self.stdin = None;
    }

    /// Send an interrupt to this child only.
    pub fn interrupt(&self) -> bool {
        self.entry.is_some() && send_interrupt(self.pid)
    }

    /// Block until the child exits and clear its table entry.
    ///
    /// Our remaining pipe ends are closed first so the child cannot block on
    /// them. On unix the entry is cleared after the child exits but before
    /// it is reaped, so a concurrent broadcast never signals a recycled PID.
    ///
    /// # Errors
    ///
    /// Returns [`UpscalerError::Io`] if waiting fails.
    pub fn wait(&mut self) -> Result<ExitStatus, UpscalerError> {
        self.stdin = None;
        self.stdout = None;
        self.stderr = None;

        if wait_until_exited(self.pid) {
            self.release_entry();
        }
        let status = self.child.wait()?;
        self.release_entry();
        log::debug!("The {} process ({}) exited with {status}", self.role, self.pid);
        Ok(status)
    }

    fn release_entry(&mut self) {
        if let Some(entry) = self.entry.take() {
            self.table.unregister(entry);
        }
    }
}

impl Drop for SupervisedChild {
    fn drop(&mut self) {
        if self.entry.is_none() {
            return;
        }
        let _ = self.child.kill();
        let _ = self.wait();
    }
}
