//! `taskwarden-core`: configuration and shared error types.
//!
//! Everything here is plain data: the engine and store crates receive the
//! relevant config sections by value and never read files or env vars
//! themselves.

pub mod config;
pub mod error;

pub use config::TaskwardenConfig;
pub use error::{CoreError, Result};
