//! In-memory content-addressed backend
//!
//! Each stored atom becomes a JSON document named by the hex SHA-256 of
//! its bytes, and an index maps atom IDs to the current document name.
//! The backend also records what it was asked to do.

use crate::atom::{Atom, AtomDocument, AtomId};
use crate::backend::{AtomBackend, WriteKind};
use async_trait::async_trait;
use atomio_common::StoreError;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, trace};

/// Connection to a [`MemoryBackend`]
#[derive(Debug)]
pub struct MemoryConnection {
    pub id: usize,
    /// Requests issued on this connection
    pub requests: u64,
}

#[derive(Default)]
struct Contents {
    /// Document name -> encoded document
    documents: HashMap<String, Vec<u8>>,
    /// Atom -> current document name
    index: HashMap<AtomId, String>,
}

/// Test and bench backend
#[derive(Default)]
pub struct MemoryBackend {
    contents: Mutex<Contents>,
    latency: Mutex<Option<Duration>>,
    failing: Mutex<HashSet<AtomId>>,
    /// Fail every Nth store request when non-zero
    fail_every: AtomicU64,
    requests: AtomicU64,
    store_calls: Mutex<HashMap<AtomId, u64>>,
    dispatch_log: Mutex<Vec<(AtomId, WriteKind)>>,
    connections: AtomicUsize,
    initialized: AtomicBool,
    unhealthy: AtomicBool,
}

/// Name of an encoded document
pub fn content_id(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every store and remove by `latency`
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock() = latency;
    }

    /// Make stores and removes of `id` fail
    pub fn fail_atom(&self, id: AtomId) {
        self.failing.lock().insert(id);
    }

    pub fn heal_atom(&self, id: AtomId) {
        self.failing.lock().remove(&id);
    }

    /// Fail every `n`th request; zero disables
    pub fn fail_every(&self, n: u64) {
        self.fail_every.store(n, Ordering::Relaxed);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.unhealthy.store(!healthy, Ordering::Relaxed);
    }

    /// Number of times a write of `id` reached the backend
    pub fn store_calls(&self, id: AtomId) -> u64 {
        self.store_calls.lock().get(&id).copied().unwrap_or(0)
    }

    /// Every write in the order the backend received it
    pub fn dispatch_log(&self) -> Vec<(AtomId, WriteKind)> {
        self.dispatch_log.lock().clone()
    }

    pub fn connections_opened(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Name of the document currently stored for `id`
    pub fn content_id_of(&self, id: AtomId) -> Option<String> {
        self.contents.lock().index.get(&id).cloned()
    }

    /// Decode the document currently stored for `id`
    pub fn document(&self, id: AtomId) -> Option<AtomDocument> {
        let contents = self.contents.lock();
        let cid = contents.index.get(&id)?;
        let bytes = contents.documents.get(cid)?;
        serde_json::from_slice(bytes).ok()
    }

    pub fn document_count(&self) -> usize {
        self.contents.lock().documents.len()
    }

    async fn begin_request(
        &self,
        id: AtomId,
        kind: WriteKind,
        conn: &mut MemoryConnection,
    ) -> Result<(), StoreError> {
        conn.requests += 1;
        *self.store_calls.lock().entry(id).or_insert(0) += 1;
        self.dispatch_log.lock().push((id, kind));

        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let n = self.requests.fetch_add(1, Ordering::Relaxed) + 1;
        let every = self.fail_every.load(Ordering::Relaxed);
        if every != 0 && n % every == 0 {
            return Err(StoreError::backend(format!(
                "injected failure on request {n} ({} {id})",
                kind.as_str()
            )));
        }
        if self.failing.lock().contains(&id) {
            return Err(StoreError::backend(format!("atom {id} is marked failing")));
        }
        Ok(())
    }
}

#[async_trait]
impl AtomBackend for MemoryBackend {
    type Connection = MemoryConnection;

    async fn connect(&self) -> Result<MemoryConnection, StoreError> {
        let id = self.connections.fetch_add(1, Ordering::Relaxed);
        trace!("Memory backend connection {} opened", id);
        Ok(MemoryConnection { id, requests: 0 })
    }

    async fn initialize(&self, conn: &mut MemoryConnection) -> Result<(), StoreError> {
        conn.requests += 1;
        self.initialized.store(true, Ordering::Release);
        debug!("Memory backend initialized on connection {}", conn.id);
        Ok(())
    }

    async fn store_atom(&self, atom: &Atom, conn: &mut MemoryConnection) -> Result<(), StoreError> {
        self.begin_request(atom.id(), WriteKind::Store, conn).await?;

        let bytes = serde_json::to_vec(&atom.to_document())
            .map_err(|e| StoreError::Encoding(e.to_string()))?;
        let cid = content_id(&bytes);

        let mut contents = self.contents.lock();
        if let Some(old) = contents.index.insert(atom.id(), cid.clone())
            && old != cid
        {
            contents.documents.remove(&old);
        }
        contents.documents.insert(cid, bytes);
        Ok(())
    }

    async fn remove_atom(&self, id: AtomId, conn: &mut MemoryConnection) -> Result<(), StoreError> {
        self.begin_request(id, WriteKind::Remove, conn).await?;

        let mut contents = self.contents.lock();
        if let Some(cid) = contents.index.remove(&id) {
            contents.documents.remove(&cid);
        }
        Ok(())
    }

    fn is_healthy(&self) -> bool {
        !self.unhealthy.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_store_is_content_addressed() {
        let backend = MemoryBackend::new();
        let mut conn = backend.connect().await.unwrap();
        let atom = Atom::node("ConceptNode", "cat");

        backend.store_atom(&atom, &mut conn).await.unwrap();
        let first = backend.content_id_of(atom.id()).unwrap();
        assert_eq!(first.len(), 64);

        // Same document, same name
        backend.store_atom(&atom, &mut conn).await.unwrap();
        assert_eq!(backend.content_id_of(atom.id()).unwrap(), first);

        atom.set_value("tv", json!([1.0, 0.5]));
        backend.store_atom(&atom, &mut conn).await.unwrap();
        assert_ne!(backend.content_id_of(atom.id()).unwrap(), first);
        assert_eq!(backend.document_count(), 1);
        assert_eq!(backend.document(atom.id()).unwrap().values["tv"], json!([1.0, 0.5]));
        assert_eq!(conn.requests, 3);
    }

    #[tokio::test]
    async fn test_remove_and_failure_hooks() {
        let backend = MemoryBackend::new();
        let mut conn = backend.connect().await.unwrap();
        let atom = Atom::node("ConceptNode", "dog");

        backend.store_atom(&atom, &mut conn).await.unwrap();
        backend.remove_atom(atom.id(), &mut conn).await.unwrap();
        assert!(backend.document(atom.id()).is_none());
        backend.remove_atom(atom.id(), &mut conn).await.unwrap();

        backend.fail_atom(atom.id());
        let err = backend.store_atom(&atom, &mut conn).await.unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));
        backend.heal_atom(atom.id());

        assert_eq!(backend.store_calls(atom.id()), 4);
        assert_eq!(
            backend.dispatch_log().iter().map(|(_, k)| *k).collect::<Vec<_>>(),
            vec![WriteKind::Store, WriteKind::Remove, WriteKind::Remove, WriteKind::Store]
        );
    }

    #[tokio::test]
    async fn test_fail_every_nth_request() {
        let backend = MemoryBackend::new();
        backend.fail_every(3);
        let mut conn = backend.connect().await.unwrap();
        let atom = Atom::node("ConceptNode", "x");

        let mut outcomes = Vec::new();
        for _ in 0..6 {
            outcomes.push(backend.store_atom(&atom, &mut conn).await.is_ok());
        }
        assert_eq!(outcomes, vec![true, true, false, true, true, false]);
    }
}
