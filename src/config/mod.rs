//! Configuration module
//!
//! Loads the bridge configuration from .gobox/config.toml

mod settings;

pub use settings::*;
