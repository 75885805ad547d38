//! Routes `terminal:input` bus events into the session manager

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{SessionError, SessionManager};
use crate::events::{EventBus, TERMINAL_INPUT};

/// Spawn the task forwarding bus input to the active session
///
/// Nobody waits on a bus event, so failed writes are logged and dropped. The
/// task ends when `shutdown` is cancelled or the bus goes away.
pub fn spawn_input_router(
    bus: &EventBus,
    manager: Arc<SessionManager>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let mut input = bus.subscribe(TERMINAL_INPUT);

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = input.recv() => {
                    let Some(event) = event else {
                        break;
                    };
                    match manager.write(&event.payload).await {
                        Ok(()) => {}
                        Err(SessionError::NoActiveSession) => {
                            debug!("Dropped {} input bytes: no active session", event.payload.len());
                        }
                        Err(e) => warn!("Failed to route terminal input: {}", e),
                    }
                }
            }
        }
        debug!("Input router stopped");
    })
}
