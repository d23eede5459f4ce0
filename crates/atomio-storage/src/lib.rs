#![allow(clippy::result_large_err)]
//! Atomio Storage
//!
//! Stores hypergraph atoms through the write-back queue. An
//! [`AtomStorage`] session wraps any [`AtomBackend`]; [`MemoryBackend`]
//! is a content-addressed in-memory implementation used by tests and the
//! bench.

pub mod atom;
pub mod backend;
pub mod memory;
pub mod storage;

pub use atom::{Atom, AtomDocument, AtomId};
pub use backend::{AtomBackend, AtomWrite, BackendAdapter, WriteKind};
pub use memory::{MemoryBackend, MemoryConnection, content_id};
pub use storage::{AtomStorage, StorageStats};
