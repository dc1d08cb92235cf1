//! Core types and utilities for noisy-label training experiments.
//!
//! This crate provides the error type, run configuration, shared domain
//! types and diagnostics records used across the workspace.

pub mod cli;
pub mod config;
pub mod error;
pub mod json;
pub mod metrics;
pub mod types;

pub use cli::*;
pub use config::*;
pub use error::{Error, Result};
pub use json::{read_json, write_json_atomic};
pub use metrics::*;
pub use types::*;

pub mod prelude {
    pub use crate::config::*;
    pub use crate::error::{Error, Result};
    pub use crate::metrics::*;
    pub use crate::types::*;
}
