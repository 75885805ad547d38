//! Single terminal session
//!
//! A session is one process attached to a PTY, the lock that serializes its
//! input, and the gate that decides whether its output may still be
//! published.

use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::pty::{CommandSpec, ProcessHandle, PtyError, TerminalSize};

/// Errors that can occur during terminal session operations
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("A terminal session is already active")]
    AlreadyActive,

    #[error("No active terminal session")]
    NoActiveSession,

    #[error("Failed to spawn terminal process: {0}")]
    SpawnFailed(String),

    #[error("Failed to write to terminal: {0}")]
    WriteFailed(String),

    #[error("Failed to resize terminal: {0}")]
    ResizeFailed(String),

    #[error("Failed to terminate terminal process: {0}")]
    TerminateFailed(String),
}

/// Result type for session operations
pub type SessionResult<T> = Result<T, SessionError>;

/// Lifecycle state of the session slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Starting,
    Active,
    Stopping,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Starting => "starting",
            SessionState::Active => "active",
            SessionState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Identity of a started session
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub target: String,
    pub pid: Option<u32>,
    pub cols: u16,
    pub rows: u16,
}

/// Snapshot returned by status queries
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionInfo>,
}

/// Input side of the duplex stream
///
/// Writers queue on a FIFO mutex and each payload is written and flushed in
/// full before the lock is released, so payloads from concurrent callers
/// never interleave.
pub struct SessionInput {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl SessionInput {
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Write a whole payload under the input lock
    pub async fn write(&self, data: &[u8]) -> SessionResult<()> {
        let mut writer = self.writer.lock().await;
        writer
            .write_all(data)
            .map_err(|e| SessionError::WriteFailed(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| SessionError::WriteFailed(e.to_string()))?;
        Ok(())
    }
}

/// Guards publication of a session's output
///
/// Publishing and closing take the same lock, and publishing only happens
/// while the scope is not cancelled. Once `close` returns no further event
/// can be published.
pub struct PublishGate {
    lock: StdMutex<()>,
    scope: CancellationToken,
}

impl PublishGate {
    pub fn new(scope: CancellationToken) -> Self {
        Self {
            lock: StdMutex::new(()),
            scope,
        }
    }

    /// Run `publish` unless the gate is closed. Returns whether it ran.
    pub fn publish<F: FnOnce()>(&self, publish: F) -> bool {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        if self.scope.is_cancelled() {
            return false;
        }
        publish();
        true
    }

    /// Close the gate and cancel the session scope
    pub fn close(&self) {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.scope.cancel();
    }

    pub fn scope(&self) -> &CancellationToken {
        &self.scope
    }
}

/// A live process attachment
pub struct Session {
    id: Uuid,
    target: String,
    process: ProcessHandle,
    input: SessionInput,
    gate: PublishGate,
    active: AtomicBool,
    size: StdMutex<TerminalSize>,
}

impl Session {
    /// Spawn the process for `target` and build the session around it
    ///
    /// Returns the session together with the output reader, which belongs to
    /// the output pump.
    pub fn spawn(
        target: &str,
        spec: &CommandSpec,
        size: TerminalSize,
        scope: CancellationToken,
    ) -> SessionResult<(Self, Box<dyn Read + Send>)> {
        let process = ProcessHandle::spawn(spec, size).map_err(spawn_error)?;
        let reader = process.take_reader().map_err(spawn_error)?;
        let writer = process.take_writer().map_err(spawn_error)?;

        let session = Self {
            id: Uuid::new_v4(),
            target: target.to_string(),
            process,
            input: SessionInput::new(writer),
            gate: PublishGate::new(scope),
            active: AtomicBool::new(true),
            size: StdMutex::new(size),
        };

        Ok((session, reader))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    pub fn size(&self) -> TerminalSize {
        *self.size.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn info(&self) -> SessionInfo {
        let size = self.size();
        SessionInfo {
            session_id: self.id,
            target: self.target.clone(),
            pid: self.pid(),
            cols: size.cols,
            rows: size.rows,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn gate(&self) -> &PublishGate {
        &self.gate
    }

    pub fn process(&self) -> &ProcessHandle {
        &self.process
    }

    /// Write input bytes to the process
    pub async fn write(&self, data: &[u8]) -> SessionResult<()> {
        if !self.is_active() {
            return Err(SessionError::NoActiveSession);
        }
        self.input.write(data).await
    }

    /// Resize the terminal
    pub fn resize(&self, size: TerminalSize) -> SessionResult<()> {
        if !self.is_active() {
            return Err(SessionError::NoActiveSession);
        }
        self.process
            .resize(size)
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))?;
        *self.size.lock().unwrap_or_else(|e| e.into_inner()) = size;
        Ok(())
    }

    /// Mark the session inactive and stop publication of its output
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::SeqCst);
        self.gate.close();
    }
}

fn spawn_error(err: PtyError) -> SessionError {
    SessionError::SpawnFailed(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Writer that accepts one byte per call and yields in between, so any
    /// missing exclusion shows up as interleaved bytes.
    struct TrickleWriter {
        sink: Arc<StdMutex<Vec<u8>>>,
    }

    impl Write for TrickleWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            if buf.is_empty() {
                return Ok(0);
            }
            self.sink.lock().unwrap().push(buf[0]);
            std::thread::yield_now();
            Ok(1)
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct BrokenWriter;

    impl Write for BrokenWriter {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed"))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writes_do_not_interleave() {
        let received = Arc::new(StdMutex::new(Vec::new()));
        let input = Arc::new(SessionInput::new(Box::new(TrickleWriter {
            sink: Arc::clone(&received),
        })));

        let mut handles = Vec::new();
        for letter in b'a'..b'i' {
            let input = Arc::clone(&input);
            handles.push(tokio::spawn(async move {
                input.write(&[letter; 64]).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let received = received.lock().unwrap();
        assert_eq!(received.len(), 8 * 64);
        for run in received.chunks(64) {
            assert!(run.iter().all(|b| *b == run[0]), "payload was interleaved");
        }
    }

    #[tokio::test]
    async fn test_write_failure_is_reported() {
        let input = SessionInput::new(Box::new(BrokenWriter));
        let result = input.write(b"data").await;
        assert!(matches!(result, Err(SessionError::WriteFailed(_))));
    }

    #[test]
    fn test_gate_blocks_after_close() {
        let gate = PublishGate::new(CancellationToken::new());
        assert!(gate.publish(|| {}));

        gate.close();
        assert!(gate.scope().is_cancelled());

        let mut ran = false;
        assert!(!gate.publish(|| ran = true));
        assert!(!ran);
    }

    #[test]
    fn test_gate_follows_parent_scope() {
        let parent = CancellationToken::new();
        let gate = PublishGate::new(parent.child_token());
        parent.cancel();
        assert!(!gate.publish(|| {}));
    }

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::Idle.to_string(), "idle");
        assert_eq!(SessionState::Stopping.to_string(), "stopping");
        assert_eq!(
            serde_json::to_string(&SessionState::Active).unwrap(),
            "\"active\""
        );
    }

    #[tokio::test]
    async fn test_session_spawn_and_deactivate() {
        let spec = CommandSpec::new("cat");
        let (session, _reader) =
            Session::spawn("cat", &spec, TerminalSize::default(), CancellationToken::new()).unwrap();

        assert!(session.is_active());
        assert_eq!(session.info().target, "cat");
        assert!(session.pid().is_some());
        assert!(session.write(b"hello\n").await.is_ok());

        session.resize(TerminalSize::new(100, 30)).unwrap();
        assert_eq!(session.info().cols, 100);

        session.deactivate();
        assert!(matches!(
            session.write(b"x").await,
            Err(SessionError::NoActiveSession)
        ));
        session.process().kill().unwrap();
    }

    #[test]
    fn test_session_spawn_failure() {
        let spec = CommandSpec::new("/nonexistent/terminal/binary");
        let result = Session::spawn("x", &spec, TerminalSize::default(), CancellationToken::new());
        assert!(matches!(result, Err(SessionError::SpawnFailed(_))));
    }
}
