//! voldrv Common - Shared types and utilities
//!
//! This crate provides the identifiers, error definitions and configuration
//! used across the snapshot, backend and metadata store crates.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use types::*;
