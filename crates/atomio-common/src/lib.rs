//! Atomio Common - Shared types and utilities
//!
//! This crate provides the error taxonomy, configuration structures and
//! small value types used across all Atomio components.

pub mod config;
pub mod error;
pub mod types;

pub use config::{StorageConfig, WriteBackConfig};
pub use error::{Error, Result, StoreError};
pub use types::*;
