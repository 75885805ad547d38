//! PTY process handle
//!
//! Spawns a process attached to a pseudo-terminal and exposes the pieces a
//! terminal session needs:
//! - a blocking reader for the output direction
//! - a writer for the input direction (taken once)
//! - resize and kill for lifecycle control

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

/// Placeholder replaced by the session target in configured command lines
pub const TARGET_PLACEHOLDER: &str = "{target}";

/// Errors that can occur during PTY operations
#[derive(Error, Debug)]
pub enum PtyError {
    #[error("Failed to open PTY: {0}")]
    OpenFailed(String),

    #[error("Failed to spawn process: {0}")]
    SpawnFailed(String),

    #[error("Failed to resize PTY: {0}")]
    ResizeFailed(String),

    #[error("Failed to terminate process: {0}")]
    KillFailed(String),

    #[error("PTY stream already taken: {0}")]
    StreamTaken(&'static str),

    #[error("PTY system error: {0}")]
    SystemError(String),
}

/// Result type for PTY operations
pub type PtyResult<T> = Result<T, PtyError>;

/// Terminal size configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

impl TerminalSize {
    /// Create a new terminal size
    pub fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }

    fn to_pty_size(self) -> PtySize {
        PtySize {
            rows: self.rows,
            cols: self.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

/// Fully resolved command line for one process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: HashMap<String, String>,
}

impl CommandSpec {
    /// Create a command with no arguments
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: HashMap::new(),
        }
    }

    /// Append arguments
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Substitute every `{target}` placeholder in the program and arguments
    pub fn for_target(&self, target: &str) -> Self {
        Self {
            program: self.program.replace(TARGET_PLACEHOLDER, target),
            args: self
                .args
                .iter()
                .map(|arg| arg.replace(TARGET_PLACEHOLDER, target))
                .collect(),
            cwd: self.cwd.clone(),
            env: self.env.clone(),
        }
    }

    fn to_builder(&self) -> CommandBuilder {
        let mut cmd = CommandBuilder::new(&self.program);
        cmd.args(&self.args);
        if let Some(cwd) = &self.cwd {
            cmd.cwd(cwd);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd
    }
}

/// A process running on the slave side of a PTY
///
/// The master side is the duplex stream: the reader yields the combined
/// stdout/stderr of the process and the writer feeds its stdin.
pub struct ProcessHandle {
    pid: Option<u32>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
    reader: Mutex<Option<Box<dyn Read + Send>>>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
}

impl ProcessHandle {
    /// Spawn `spec` on a fresh PTY of the given size
    pub fn spawn(spec: &CommandSpec, size: TerminalSize) -> PtyResult<Self> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(size.to_pty_size())
            .map_err(|e| PtyError::OpenFailed(e.to_string()))?;

        let child = pair
            .slave
            .spawn_command(spec.to_builder())
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;

        // Only the child keeps the slave open, so the reader sees EOF when it exits
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PtyError::SystemError(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::SystemError(e.to_string()))?;

        let pid = child.process_id();
        debug!("Spawned {} (pid {:?}) on {}x{} pty", spec.program, pid, size.cols, size.rows);

        Ok(Self {
            pid,
            master: Mutex::new(pair.master),
            child: Mutex::new(child),
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
        })
    }

    /// OS process id, when the platform reports one
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Take the output side of the stream. Only one reader exists.
    pub fn take_reader(&self) -> PtyResult<Box<dyn Read + Send>> {
        lock(&self.reader)
            .take()
            .ok_or(PtyError::StreamTaken("reader"))
    }

    /// Take the input side of the stream. Only one writer exists.
    pub fn take_writer(&self) -> PtyResult<Box<dyn Write + Send>> {
        lock(&self.writer)
            .take()
            .ok_or(PtyError::StreamTaken("writer"))
    }

    /// Resize the terminal
    pub fn resize(&self, size: TerminalSize) -> PtyResult<()> {
        lock(&self.master)
            .resize(size.to_pty_size())
            .map_err(|e| PtyError::ResizeFailed(e.to_string()))
    }

    /// Exit code if the process has already exited
    pub fn try_wait(&self) -> Option<u32> {
        match lock(&self.child).try_wait() {
            Ok(Some(status)) => Some(status.exit_code()),
            _ => None,
        }
    }

    /// Terminate the process and reap it
    ///
    /// May block briefly while the process handles the hangup, so async
    /// callers should run it on the blocking pool. A process that already
    /// exited is not an error.
    pub fn kill(&self) -> PtyResult<u32> {
        if let Some(code) = self.try_wait() {
            return Ok(code);
        }

        let mut child = lock(&self.child);
        child
            .kill()
            .map_err(|e| PtyError::KillFailed(e.to_string()))?;

        let status = child
            .wait()
            .map_err(|e| PtyError::KillFailed(e.to_string()))?;

        Ok(status.exit_code())
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle").field("pid", &self.pid).finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn read_until(reader: &mut Box<dyn Read + Send>, needle: &str) -> String {
        let mut collected = String::new();
        let mut buf = [0u8; 1024];
        let deadline = Instant::now() + Duration::from_secs(3);
        while Instant::now() < deadline {
            match reader.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    collected.push_str(&String::from_utf8_lossy(&buf[..n]));
                    if collected.contains(needle) {
                        break;
                    }
                }
            }
        }
        collected
    }

    #[test]
    fn test_terminal_size_default() {
        let size = TerminalSize::default();
        assert_eq!(size.cols, 80);
        assert_eq!(size.rows, 24);
    }

    #[test]
    fn test_command_for_target() {
        let spec = CommandSpec::new("docker").with_args(["exec", "-it", "{target}", "/bin/sh"]);
        let resolved = spec.for_target("web-1");
        assert_eq!(resolved.program, "docker");
        assert_eq!(resolved.args, vec!["exec", "-it", "web-1", "/bin/sh"]);
    }

    #[test]
    fn test_command_target_as_program() {
        let spec = CommandSpec::new("{target}");
        assert_eq!(spec.for_target("cat").program, "cat");
    }

    #[test]
    fn test_spawn_and_read_output() {
        let spec = CommandSpec::new("echo").with_args(["hello"]);
        let process = ProcessHandle::spawn(&spec, TerminalSize::default()).unwrap();
        assert!(process.pid().is_some());

        let mut reader = process.take_reader().unwrap();
        let output = read_until(&mut reader, "hello");
        assert!(output.contains("hello"));
    }

    #[test]
    fn test_streams_taken_once() {
        let process = ProcessHandle::spawn(&CommandSpec::new("cat"), TerminalSize::default()).unwrap();

        assert!(process.take_reader().is_ok());
        assert!(matches!(process.take_reader(), Err(PtyError::StreamTaken("reader"))));
        assert!(process.take_writer().is_ok());
        assert!(matches!(process.take_writer(), Err(PtyError::StreamTaken("writer"))));

        process.kill().unwrap();
    }

    #[test]
    fn test_write_is_echoed() {
        let process = ProcessHandle::spawn(&CommandSpec::new("cat"), TerminalSize::default()).unwrap();
        let mut reader = process.take_reader().unwrap();
        let mut writer = process.take_writer().unwrap();

        writer.write_all(b"ping\n").unwrap();
        writer.flush().unwrap();

        let output = read_until(&mut reader, "ping");
        assert!(output.contains("ping"));

        process.kill().unwrap();
    }

    #[test]
    fn test_resize() {
        let process = ProcessHandle::spawn(&CommandSpec::new("cat"), TerminalSize::default()).unwrap();
        assert!(process.resize(TerminalSize::new(120, 40)).is_ok());
        process.kill().unwrap();
    }

    #[test]
    fn test_kill_running_process() {
        let process = ProcessHandle::spawn(&CommandSpec::new("cat"), TerminalSize::default()).unwrap();
        assert!(process.try_wait().is_none());

        process.kill().unwrap();
        assert!(process.try_wait().is_some());

        // Killing an exited process is not an error
        assert!(process.kill().is_ok());
    }

    #[test]
    fn test_spawn_missing_binary() {
        let spec = CommandSpec::new("/nonexistent/binary/that/does/not/exist");
        let result = ProcessHandle::spawn(&spec, TerminalSize::default());
        assert!(matches!(result, Err(PtyError::SpawnFailed(_))));
    }

    #[test]
    fn test_spawn_with_env() {
        let mut spec = CommandSpec::new("sh").with_args(["-c", "echo $GOBOX_TEST_VAR"]);
        spec.env.insert("GOBOX_TEST_VAR".to_string(), "test_value".to_string());

        let process = ProcessHandle::spawn(&spec, TerminalSize::default()).unwrap();
        let mut reader = process.take_reader().unwrap();
        assert!(read_until(&mut reader, "test_value").contains("test_value"));
    }
}
