//! Interactive terminal session module
//!
//! One PTY-backed process at a time, its output relayed to the event bus and
//! its input fed from callers or from `terminal:input` bus events.

mod input;
mod manager;
mod pump;
mod session;

pub use input::*;
pub use manager::*;
pub use pump::*;
pub use session::*;
