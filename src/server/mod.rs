//! WebSocket server module
//!
//! Handles WebSocket connections from UI clients and routes their messages
//! to the terminal session manager.

mod protocol;
mod websocket;

pub use protocol::*;
pub use websocket::*;
