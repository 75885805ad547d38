//! Repository fetcher module
//!
//! Downloads selected top-level folders of a GitHub repository through the
//! contents API, reporting progress as it goes.

mod github;

pub use github::*;
