//! Backend contract
//!
//! [`AtomBackend`] is what a concrete store implements. [`BackendAdapter`]
//! turns one into the factory and store primitive the write-back queue
//! expects, so the queue never sees atoms directly.

use crate::atom::{Atom, AtomId};
use async_trait::async_trait;
use atomio_common::StoreError;
use atomio_writeback::{ConnectionFactory, QueueItem, StorePrimitive};
use std::sync::Arc;

/// A store that can persist and remove atoms
#[async_trait]
pub trait AtomBackend: Send + Sync + 'static {
    /// Connection handle type
    type Connection: Send + 'static;

    /// Open one connection
    async fn connect(&self) -> Result<Self::Connection, StoreError>;

    /// Prepare the backend before any write is queued
    ///
    /// Runs once per session on a foreground connection.
    async fn initialize(&self, _conn: &mut Self::Connection) -> Result<(), StoreError> {
        Ok(())
    }

    /// Persist the atom's current document, values included
    async fn store_atom(&self, atom: &Atom, conn: &mut Self::Connection) -> Result<(), StoreError>;

    /// Remove the atom; removing an unknown atom succeeds
    async fn remove_atom(&self, id: AtomId, conn: &mut Self::Connection) -> Result<(), StoreError>;

    /// Liveness hook
    fn is_healthy(&self) -> bool {
        true
    }
}

/// What a queued write does to its atom
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Store,
    Remove,
}

impl WriteKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Store => "store",
            Self::Remove => "remove",
        }
    }
}

/// A queued write of one atom
#[derive(Debug, Clone)]
pub struct AtomWrite {
    pub atom: Arc<Atom>,
    pub kind: WriteKind,
}

impl AtomWrite {
    pub const fn store(atom: Arc<Atom>) -> Self {
        Self {
            atom,
            kind: WriteKind::Store,
        }
    }

    pub const fn remove(atom: Arc<Atom>) -> Self {
        Self {
            atom,
            kind: WriteKind::Remove,
        }
    }
}

impl QueueItem for AtomWrite {
    type Key = AtomId;

    fn key(&self) -> AtomId {
        self.atom.id()
    }
}

/// Exposes an [`AtomBackend`] to the write-back queue
pub struct BackendAdapter<B> {
    backend: Arc<B>,
}

impl<B> BackendAdapter<B> {
    pub const fn new(backend: Arc<B>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl<B: AtomBackend> ConnectionFactory for BackendAdapter<B> {
    type Connection = B::Connection;

    async fn connect(&self) -> Result<B::Connection, StoreError> {
        self.backend.connect().await
    }
}

#[async_trait]
impl<B: AtomBackend> StorePrimitive<AtomWrite> for BackendAdapter<B> {
    type Connection = B::Connection;

    async fn store(&self, item: &AtomWrite, conn: &mut B::Connection) -> Result<(), StoreError> {
        match item.kind {
            WriteKind::Store => self.backend.store_atom(&item.atom, conn).await,
            WriteKind::Remove => self.backend.remove_atom(item.atom.id(), conn).await,
        }
    }
}
