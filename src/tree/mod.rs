//! Directory tree module
//!
//! Serializes a directory hierarchy into a JSON tree of names.

mod node;

pub use node::*;
