//! Protocol message definitions
//!
//! JSON control messages exchanged between UI clients and the bridge.
//! Terminal output travels separately as binary WebSocket frames; terminal
//! input may arrive either as binary frames or as `input` messages.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::terminal::{SessionError, SessionInfo, SessionState, SessionStatus};

/// Current protocol version
/// Increment when making breaking changes to message format
pub const PROTOCOL_VERSION: u32 = 1;

/// Terminal dimension limits
pub const MAX_TERMINAL_COLS: u16 = 500;
pub const MAX_TERMINAL_ROWS: u16 = 200;

/// Maximum input length (1MB)
pub const MAX_INPUT_LENGTH: usize = 1024 * 1024;

/// Maximum target length
pub const MAX_TARGET_LENGTH: usize = 1024;

/// Protocol-related errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("JSON serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;

// ============================================================================
// Client Messages
// ============================================================================

/// Messages sent from a UI client to the bridge
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Connection keepalive ping
    Ping {
        /// Sequence number for tracking round-trip time
        seq: u64,
    },

    /// Start the terminal session
    StartSession {
        /// Container or host the process attaches to
        target: String,
    },

    /// Text input for the terminal
    Input { data: String },

    /// Stop the terminal session
    StopSession,

    /// Resize the terminal
    Resize { cols: u16, rows: u16 },

    /// Request the session status
    GetStatus,
}

impl ClientMessage {
    /// Parse and validate a client message from JSON
    pub fn from_json(json: &str) -> ProtocolResult<Self> {
        let message: Self = serde_json::from_str(json)?;
        message.validate()?;
        Ok(message)
    }

    /// Validate message contents
    pub fn validate(&self) -> ProtocolResult<()> {
        match self {
            ClientMessage::StartSession { target } => {
                if target.trim().is_empty() {
                    return Err(ProtocolError::ValidationError(
                        "target cannot be empty".into(),
                    ));
                }
                if target.len() > MAX_TARGET_LENGTH {
                    return Err(ProtocolError::ValidationError(format!(
                        "target exceeds maximum length of {} bytes",
                        MAX_TARGET_LENGTH
                    )));
                }
            }
            ClientMessage::Input { data } => {
                validate_input_length(data.len())?;
            }
            ClientMessage::Resize { cols, rows } => {
                validate_size(*cols, *rows)?;
            }
            ClientMessage::Ping { .. } | ClientMessage::StopSession | ClientMessage::GetStatus => {}
        }
        Ok(())
    }
}

/// Check the size of a terminal input payload, text or binary
pub fn validate_input_length(len: usize) -> ProtocolResult<()> {
    if len > MAX_INPUT_LENGTH {
        return Err(ProtocolError::ValidationError(format!(
            "input exceeds maximum length of {} bytes",
            MAX_INPUT_LENGTH
        )));
    }
    Ok(())
}

fn validate_size(cols: u16, rows: u16) -> ProtocolResult<()> {
    if cols == 0 || cols > MAX_TERMINAL_COLS {
        return Err(ProtocolError::ValidationError(format!(
            "cols must be between 1 and {}",
            MAX_TERMINAL_COLS
        )));
    }
    if rows == 0 || rows > MAX_TERMINAL_ROWS {
        return Err(ProtocolError::ValidationError(format!(
            "rows must be between 1 and {}",
            MAX_TERMINAL_ROWS
        )));
    }
    Ok(())
}

// ============================================================================
// Server Messages
// ============================================================================

/// Error codes carried by `error` messages
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidMessage,
    AlreadyActive,
    NoActiveSession,
    SpawnFailed,
    WriteFailed,
    InternalError,
}

/// Messages sent from the bridge to a UI client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Sent once on connect
    Welcome {
        server_version: String,
        protocol_version: u32,
        state: SessionState,
    },

    /// Response to ping
    Pong { seq: u64 },

    /// The session was started
    SessionStarted {
        session_id: Uuid,
        target: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
        cols: u16,
        rows: u16,
    },

    /// The session was stopped on request
    SessionStopped,

    /// The session state changed
    SessionState { state: SessionState },

    /// Response to get_status
    Status {
        state: SessionState,
        #[serde(skip_serializing_if = "Option::is_none")]
        session_id: Option<Uuid>,
        #[serde(skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
    },

    /// The terminal was resized
    Resized { cols: u16, rows: u16 },

    /// Input was written to the terminal
    Ack,

    /// A request failed
    Error { message: String, code: ErrorCode },
}

impl ServerMessage {
    pub fn welcome(state: SessionState) -> Self {
        ServerMessage::Welcome {
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            protocol_version: PROTOCOL_VERSION,
            state,
        }
    }

    pub fn session_started(info: SessionInfo) -> Self {
        ServerMessage::SessionStarted {
            session_id: info.session_id,
            target: info.target,
            pid: info.pid,
            cols: info.cols,
            rows: info.rows,
        }
    }

    pub fn status(status: SessionStatus) -> Self {
        let session = status.session;
        ServerMessage::Status {
            state: status.state,
            session_id: session.as_ref().map(|s| s.session_id),
            target: session.as_ref().map(|s| s.target.clone()),
            pid: session.and_then(|s| s.pid),
        }
    }

    pub fn error_with_code(message: impl Into<String>, code: ErrorCode) -> Self {
        ServerMessage::Error {
            message: message.into(),
            code,
        }
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> ProtocolResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

impl From<ProtocolError> for ServerMessage {
    fn from(err: ProtocolError) -> Self {
        ServerMessage::error_with_code(err.to_string(), ErrorCode::InvalidMessage)
    }
}

impl From<SessionError> for ServerMessage {
    fn from(err: SessionError) -> Self {
        let code = match err {
            SessionError::AlreadyActive => ErrorCode::AlreadyActive,
            SessionError::NoActiveSession => ErrorCode::NoActiveSession,
            SessionError::SpawnFailed(_) => ErrorCode::SpawnFailed,
            SessionError::WriteFailed(_) => ErrorCode::WriteFailed,
            SessionError::ResizeFailed(_) | SessionError::TerminateFailed(_) => {
                ErrorCode::InternalError
            }
        };
        ServerMessage::error_with_code(err.to_string(), code)
    }
}
