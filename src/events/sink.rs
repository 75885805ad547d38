//! Publish side of the event bus

use uuid::Uuid;

/// Topic carrying terminal output bytes
pub const TERMINAL_DATA: &str = "terminal:data";

/// Topic carrying bytes destined for the terminal's input
pub const TERMINAL_INPUT: &str = "terminal:input";

/// A chunk of terminal output
///
/// Chunks are byte-granular and exactly what one read of the PTY returned,
/// so partial escape sequences and UTF-8 characters may span two events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputEvent {
    /// Session the bytes came from
    pub session_id: Uuid,
    /// Raw output bytes
    pub data: Vec<u8>,
}

/// Destination for published events
///
/// `publish` is called from the output pump task while the host is doing
/// unrelated work, so implementations must not block and must tolerate
/// concurrent callers.
pub trait EventSink: Send + Sync {
    fn publish(&self, topic: &str, event: OutputEvent);
}
