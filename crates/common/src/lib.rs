//! Shared types and error definitions used across all sinobridge crates.

pub mod error;
pub mod types;

pub use error::{Error, Result};
