//! Terminal session manager
//!
//! Owns the single session slot. Starting, stopping and the pump observing
//! the end of a session all transition the slot under one mutex, and every
//! path that empties it checks the session id first, so a session is torn
//! down exactly once no matter which path gets there first.

use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{OutputPump, PumpExit, Session, SessionError, SessionInfo, SessionResult, SessionState, SessionStatus};
use crate::events::EventSink;
use crate::pty::{CommandSpec, TerminalSize};

/// State shared between the manager and the pump tasks it spawns
struct Shared {
    slot: Mutex<Option<Arc<Session>>>,
    state_tx: watch::Sender<SessionState>,
}

impl Shared {
    fn set_state(&self, state: SessionState) {
        self.state_tx.send_replace(state);
    }

    /// Called by the pump task once it has finished
    async fn finish(&self, session_id: Uuid, exit: &PumpExit) {
        let mut slot = self.slot.lock().await;

        // Stopped explicitly, or already replaced
        if !slot.as_ref().is_some_and(|current| current.id() == session_id) {
            return;
        }
        let Some(session) = slot.take() else {
            return;
        };

        match exit {
            PumpExit::StreamClosed => info!("Session {} ended: process closed the terminal", session_id),
            PumpExit::ReadFailed(e) => warn!("Session {} ended: read failed: {}", session_id, e),
            PumpExit::Cancelled => info!("Session {} ended: scope cancelled", session_id),
        }

        self.set_state(SessionState::Stopping);
        if let Err(e) = terminate(session).await {
            warn!("Cleanup of session {} failed: {}", session_id, e);
        }
        self.set_state(SessionState::Idle);
    }
}

/// Close the session and kill (or reap) its process on the blocking pool
async fn terminate(session: Arc<Session>) -> SessionResult<u32> {
    session.deactivate();
    let session_id = session.id();

    let exit_code = tokio::task::spawn_blocking(move || session.process().kill())
        .await
        .map_err(|e| SessionError::TerminateFailed(e.to_string()))?
        .map_err(|e| SessionError::TerminateFailed(e.to_string()))?;

    debug!("Session {} process exited with code {}", session_id, exit_code);
    Ok(exit_code)
}

/// Manages the single interactive terminal session
///
/// Constructed once and shared by handle. At most one session is active at
/// a time; its output is published to the event sink by an output pump.
pub struct SessionManager {
    shared: Arc<Shared>,
    /// Handle of the most recently started pump
    pump: StdMutex<Option<JoinHandle<PumpExit>>>,
    command: CommandSpec,
    size: TerminalSize,
    sink: Arc<dyn EventSink>,
}

impl SessionManager {
    /// Create a manager that runs `command` (with `{target}` substituted)
    /// on PTYs of `size` and publishes output to `sink`
    pub fn new(command: CommandSpec, size: TerminalSize, sink: Arc<dyn EventSink>) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        Self {
            shared: Arc::new(Shared {
                slot: Mutex::new(None),
                state_tx,
            }),
            pump: StdMutex::new(None),
            command,
            size,
            sink,
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> SessionState {
        *self.shared.state_tx.borrow()
    }

    /// Subscribe to lifecycle state changes
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state_tx.subscribe()
    }

    /// Whether a session currently occupies the slot
    pub async fn is_active(&self) -> bool {
        self.shared.slot.lock().await.is_some()
    }

    /// Status snapshot
    pub async fn status(&self) -> SessionStatus {
        let slot = self.shared.slot.lock().await;
        SessionStatus {
            state: self.state(),
            session: slot.as_ref().map(|session| session.info()),
        }
    }

    /// Start a session attached to `target`
    ///
    /// The session lives until `stop`, until its process exits, or until
    /// `scope` is cancelled. Fails with `AlreadyActive`, leaving the running
    /// session untouched, when the slot is occupied.
    pub async fn start(&self, target: &str, scope: CancellationToken) -> SessionResult<SessionInfo> {
        let mut slot = self.shared.slot.lock().await;
        if slot.is_some() {
            return Err(SessionError::AlreadyActive);
        }

        self.shared.set_state(SessionState::Starting);
        let spec = self.command.for_target(target);

        let (session, reader) = match Session::spawn(target, &spec, self.size, scope.child_token()) {
            Ok(spawned) => spawned,
            Err(e) => {
                self.shared.set_state(SessionState::Idle);
                warn!("Failed to start session for {}: {}", target, e);
                return Err(e);
            }
        };

        let session = Arc::new(session);
        let info = session.info();
        let session_id = session.id();

        let pump = OutputPump::new(Arc::clone(&session), reader, Arc::clone(&self.sink));
        let shared = Arc::clone(&self.shared);
        let handle = tokio::spawn(async move {
            let exit = pump.run().await;
            shared.finish(session_id, &exit).await;
            exit
        });

        *slot = Some(session);
        *self.pump.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        self.shared.set_state(SessionState::Active);

        info!(
            "Started session {} for {} (pid {:?})",
            session_id, target, info.pid
        );
        Ok(info)
    }

    /// Write bytes to the active session's input
    pub async fn write(&self, data: &[u8]) -> SessionResult<()> {
        let session = self.current().await.ok_or(SessionError::NoActiveSession)?;
        session.write(data).await?;
        debug!("Sent {} bytes to session {}", data.len(), session.id());
        Ok(())
    }

    /// Resize the active session's terminal
    pub async fn resize(&self, cols: u16, rows: u16) -> SessionResult<()> {
        let session = self.current().await.ok_or(SessionError::NoActiveSession)?;
        session.resize(TerminalSize::new(cols, rows))?;
        debug!("Session {} resized to {}x{}", session.id(), cols, rows);
        Ok(())
    }

    /// Stop the active session
    ///
    /// No output is published for the session once this returns. Stopping
    /// with no active session succeeds without doing anything. Use
    /// `wait_pump` to also wait for the pump task to finish.
    pub async fn stop(&self) -> SessionResult<()> {
        let mut slot = self.shared.slot.lock().await;
        let Some(session) = slot.take() else {
            debug!("Stop requested with no active session");
            return Ok(());
        };

        let session_id = session.id();
        info!("Stopping session {}", session_id);

        self.shared.set_state(SessionState::Stopping);
        let result = terminate(session).await;
        self.shared.set_state(SessionState::Idle);

        result.map(|_| ())
    }

    /// Wait for the most recently started pump to finish
    ///
    /// Returns `None` when no pump was started since the last wait.
    pub async fn wait_pump(&self) -> Option<PumpExit> {
        let handle = self.pump.lock().unwrap_or_else(|e| e.into_inner()).take()?;
        match handle.await {
            Ok(exit) => Some(exit),
            Err(e) => {
                warn!("Output pump task failed: {}", e);
                None
            }
        }
    }

    async fn current(&self) -> Option<Arc<Session>> {
        self.shared.slot.lock().await.as_ref().map(Arc::clone)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventBus, OutputEvent, Subscription, TERMINAL_DATA};
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    /// Targets are shell snippets: `sh -c <target>`
    fn shell_manager(bus: &EventBus) -> SessionManager {
        let command = CommandSpec::new("sh").with_args(["-c", "{target}"]);
        SessionManager::new(command, TerminalSize::default(), Arc::new(bus.clone()))
    }

    /// Targets are programs run directly
    fn program_manager(bus: &EventBus) -> SessionManager {
        SessionManager::new(
            CommandSpec::new("{target}"),
            TerminalSize::default(),
            Arc::new(bus.clone()),
        )
    }

    async fn collect_until(data: &mut Subscription, needle: &str) -> String {
        let mut collected = Vec::new();
        let _ = timeout(Duration::from_secs(5), async {
            while let Some(event) = data.recv().await {
                collected.extend_from_slice(&event.payload);
                if String::from_utf8_lossy(&collected).contains(needle) {
                    break;
                }
            }
        })
        .await;
        String::from_utf8_lossy(&collected).to_string()
    }

    #[tokio::test]
    async fn test_manager_starts_idle() {
        let manager = program_manager(&EventBus::default());
        assert_eq!(manager.state(), SessionState::Idle);
        assert!(!manager.is_active().await);
        assert!(manager.status().await.session.is_none());
        assert!(manager.wait_pump().await.is_none());
    }

    #[tokio::test]
    async fn test_idle_operations() {
        let manager = program_manager(&EventBus::default());

        assert!(matches!(
            manager.write(b"ls\n").await,
            Err(SessionError::NoActiveSession)
        ));
        assert!(matches!(
            manager.resize(100, 30).await,
            Err(SessionError::NoActiveSession)
        ));
        // Stop is idempotent
        assert!(manager.stop().await.is_ok());
        assert!(manager.stop().await.is_ok());
    }

    #[tokio::test]
    async fn test_start_write_stop_scenario() {
        let bus = EventBus::default();
        let mut data = bus.subscribe(TERMINAL_DATA);
        let manager = shell_manager(&bus);

        let info = manager
            .start("read line; echo file.txt", CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(manager.state(), SessionState::Active);
        assert_eq!(manager.status().await.session, Some(info.clone()));

        manager.write(b"ls\n").await.unwrap();
        let output = collect_until(&mut data, "file.txt").await;
        assert!(output.contains("file.txt"), "output was {:?}", output);

        manager.stop().await.unwrap();
        assert_eq!(manager.state(), SessionState::Idle);
        assert!(matches!(
            manager.write(b"ls\n").await,
            Err(SessionError::NoActiveSession)
        ));
    }

    #[tokio::test]
    async fn test_output_events_tagged_with_session() {
        let bus = EventBus::default();
        let mut data = bus.subscribe(TERMINAL_DATA);
        let manager = shell_manager(&bus);

        let info = manager.start("echo tagged", CancellationToken::new()).await.unwrap();
        let event = timeout(Duration::from_secs(5), data.recv()).await.unwrap().unwrap();
        assert_eq!(event.session_id, Some(info.session_id));
    }

    #[tokio::test]
    async fn test_second_start_is_rejected() {
        let manager = program_manager(&EventBus::default());

        let first = manager.start("cat", CancellationToken::new()).await.unwrap();
        let second = manager.start("cat", CancellationToken::new()).await;
        assert!(matches!(second, Err(SessionError::AlreadyActive)));

        // The running session is untouched
        let status = manager.status().await;
        assert_eq!(status.state, SessionState::Active);
        assert_eq!(status.session.unwrap().session_id, first.session_id);
        assert!(manager.write(b"still here\n").await.is_ok());

        manager.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_starts_only_one_wins() {
        let manager = Arc::new(program_manager(&EventBus::default()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = Arc::clone(&manager);
            handles.push(tokio::spawn(async move {
                manager.start("cat", CancellationToken::new()).await
            }));
        }

        let mut started = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => started += 1,
                Err(SessionError::AlreadyActive) => {}
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(started, 1);

        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_natural_exit_frees_slot() {
        let manager = shell_manager(&EventBus::default());

        manager.start("echo done", CancellationToken::new()).await.unwrap();
        let exit = timeout(Duration::from_secs(5), manager.wait_pump())
            .await
            .unwrap();
        assert_eq!(exit, Some(PumpExit::StreamClosed));

        assert_eq!(manager.state(), SessionState::Idle);
        assert!(!manager.is_active().await);
        assert!(matches!(
            manager.write(b"ls\n").await,
            Err(SessionError::NoActiveSession)
        ));

        // The slot is reusable right away
        manager.start("cat", CancellationToken::new()).await.unwrap();
        manager.stop().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stop_racing_natural_exit_releases_slot_once() {
        let manager = shell_manager(&EventBus::default());

        for _ in 0..50 {
            manager.start("true", CancellationToken::new()).await.unwrap();
            manager.stop().await.unwrap();
            timeout(Duration::from_secs(5), manager.wait_pump())
                .await
                .unwrap();

            assert_eq!(manager.state(), SessionState::Idle);
            assert!(!manager.is_active().await);
            assert!(manager.status().await.session.is_none());
        }

        manager.start("cat", CancellationToken::new()).await.unwrap();
        assert_eq!(manager.state(), SessionState::Active);
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_spawn_failure_leaves_idle() {
        let manager = program_manager(&EventBus::default());

        let result = manager
            .start("/nonexistent/container/shell", CancellationToken::new())
            .await;
        assert!(matches!(result, Err(SessionError::SpawnFailed(_))));
        assert_eq!(manager.state(), SessionState::Idle);
        assert!(!manager.is_active().await);

        manager.start("cat", CancellationToken::new()).await.unwrap();
        assert_eq!(manager.state(), SessionState::Active);
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_scope_cancellation_ends_session() {
        let manager = program_manager(&EventBus::default());
        let scope = CancellationToken::new();

        manager.start("cat", scope.clone()).await.unwrap();
        scope.cancel();

        let exit = timeout(Duration::from_secs(5), manager.wait_pump())
            .await
            .unwrap();
        assert_eq!(exit, Some(PumpExit::Cancelled));
        assert_eq!(manager.state(), SessionState::Idle);
        assert!(matches!(
            manager.write(b"x").await,
            Err(SessionError::NoActiveSession)
        ));
    }

    #[tokio::test]
    async fn test_stop_does_not_cancel_caller_scope() {
        let manager = program_manager(&EventBus::default());
        let scope = CancellationToken::new();

        manager.start("cat", scope.clone()).await.unwrap();
        manager.stop().await.unwrap();

        assert!(!scope.is_cancelled());
        assert_eq!(
            timeout(Duration::from_secs(5), manager.wait_pump()).await.unwrap(),
            Some(PumpExit::Cancelled)
        );
    }

    #[tokio::test]
    async fn test_no_output_after_stop() {
        #[derive(Default)]
        struct CountingSink {
            count: StdMutex<usize>,
        }

        impl EventSink for CountingSink {
            fn publish(&self, _topic: &str, _event: OutputEvent) {
                *self.count.lock().unwrap() += 1;
            }
        }

        let sink = Arc::new(CountingSink::default());
        let manager = SessionManager::new(
            CommandSpec::new("yes"),
            TerminalSize::default(),
            sink.clone(),
        );

        manager.start("ignored", CancellationToken::new()).await.unwrap();
        timeout(Duration::from_secs(5), async {
            while *sink.count.lock().unwrap() == 0 {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        manager.stop().await.unwrap();
        let published = *sink.count.lock().unwrap();

        sleep(Duration::from_millis(200)).await;
        assert_eq!(*sink.count.lock().unwrap(), published);
    }

    #[tokio::test]
    async fn test_state_transitions_are_observable() {
        let manager = program_manager(&EventBus::default());
        let mut states = manager.subscribe_state();

        manager.start("cat", CancellationToken::new()).await.unwrap();
        states.changed().await.unwrap();
        assert_eq!(*states.borrow_and_update(), SessionState::Active);

        manager.stop().await.unwrap();
        states.changed().await.unwrap();
        assert_eq!(*states.borrow_and_update(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_resize_active_session() {
        let manager = program_manager(&EventBus::default());
        manager.start("cat", CancellationToken::new()).await.unwrap();

        manager.resize(132, 43).await.unwrap();
        let session = manager.status().await.session.unwrap();
        assert_eq!((session.cols, session.rows), (132, 43));

        manager.stop().await.unwrap();
    }
}
