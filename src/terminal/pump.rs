//! Output pump
//!
//! Relays everything a session's process writes to the PTY onto the event
//! sink. The PTY reader is blocking, so a dedicated thread reads it and hands
//! chunks to the async side over a bounded channel; the async side selects
//! between the next chunk and the session scope, which keeps it responsive to
//! cancellation even while the process is silent.

use std::io::{ErrorKind, Read};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::Session;
use crate::events::{EventSink, OutputEvent, TERMINAL_DATA};

/// Largest chunk read from the PTY at once
const READ_BUFFER_SIZE: usize = 4096;

/// Chunks buffered between the reader thread and the pump
const CHUNK_CHANNEL_CAPACITY: usize = 256;

/// How a pump finished
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpExit {
    /// The process closed its side of the PTY
    StreamClosed,
    /// Reading failed; the stream is not resumed
    ReadFailed(String),
    /// The session scope was cancelled
    Cancelled,
}

/// Background relay for one session's output
pub struct OutputPump {
    session: Arc<Session>,
    sink: Arc<dyn EventSink>,
    chunks: mpsc::Receiver<std::io::Result<Vec<u8>>>,
}

impl OutputPump {
    /// Start the reader thread for `reader` and build the pump around it
    pub fn new(session: Arc<Session>, reader: Box<dyn Read + Send>, sink: Arc<dyn EventSink>) -> Self {
        let (chunk_tx, chunks) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        let session_id = session.id();

        // Without a reader thread the sender is dropped and the pump ends as closed
        if let Err(e) = std::thread::Builder::new()
            .name(format!("pty-reader-{}", session_id))
            .spawn(move || reader_loop(reader, chunk_tx))
        {
            warn!("Failed to start reader thread for session {}: {}", session_id, e);
        }

        Self {
            session,
            sink,
            chunks,
        }
    }

    /// Publish output until the stream ends or the session scope is cancelled
    pub async fn run(mut self) -> PumpExit {
        let session_id = self.session.id();
        let scope = self.session.gate().scope().clone();

        let exit = loop {
            tokio::select! {
                biased;
                _ = scope.cancelled() => break PumpExit::Cancelled,
                chunk = self.chunks.recv() => match chunk {
                    Some(Ok(data)) => {
                        let event = OutputEvent { session_id, data };
                        let sink = &self.sink;
                        if !self.session.gate().publish(|| sink.publish(TERMINAL_DATA, event)) {
                            break PumpExit::Cancelled;
                        }
                    }
                    Some(Err(e)) => break PumpExit::ReadFailed(e.to_string()),
                    None => break PumpExit::StreamClosed,
                }
            }
        };

        debug!("Output pump for session {} finished: {:?}", session_id, exit);
        exit
    }
}

/// Blocking read loop. Ends on EOF, hangup, read error, or when the pump is gone.
fn reader_loop(mut reader: Box<dyn Read + Send>, chunk_tx: mpsc::Sender<std::io::Result<Vec<u8>>>) {
    let mut buffer = [0u8; READ_BUFFER_SIZE];

    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                if chunk_tx.blocking_send(Ok(buffer[..n].to_vec())).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if is_hangup(&e) => break,
            Err(e) => {
                let _ = chunk_tx.blocking_send(Err(e));
                break;
            }
        }
    }
}

/// Linux reports EIO on the master once every slave descriptor is closed
fn is_hangup(err: &std::io::Error) -> bool {
    const EIO: i32 = 5;
    cfg!(unix) && err.raw_os_error() == Some(EIO)
}
