//! Event bus module
//!
//! The terminal core only needs the publish side (`EventSink`). The
//! broadcast-backed `EventBus` is the host's publish/subscribe channel that
//! carries output to connected UIs and routes their input back.

mod bus;
mod sink;

pub use bus::*;
pub use sink::*;
