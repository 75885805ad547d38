//! PTY management module
//!
//! Provides the process handle backing a terminal session: a child process on
//! the slave side of a pseudo-terminal, driven through the master side.
//! Uses portable-pty for cross-platform compatibility.

mod process;

pub use process::*;
