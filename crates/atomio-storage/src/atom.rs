//! Atoms and their values
//!
//! An atom is a typed node or link in a hypergraph. Its identity, type,
//! name and outgoing set are fixed at construction; its values (keyed
//! valuations) can change at any time, including while a write of the
//! atom is queued. Writers read the values when the write drains.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Atom identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AtomId(Uuid);

impl AtomId {
    /// Generate a new random atom ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for AtomId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for AtomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A node or link with mutable values
#[derive(Debug)]
pub struct Atom {
    id: AtomId,
    atom_type: String,
    /// Set for nodes
    name: Option<String>,
    /// Set for links
    outgoing: Vec<AtomId>,
    values: RwLock<BTreeMap<String, Value>>,
}

impl Atom {
    /// Create a named node
    pub fn node(atom_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: AtomId::new(),
            atom_type: atom_type.into(),
            name: Some(name.into()),
            outgoing: Vec::new(),
            values: RwLock::new(BTreeMap::new()),
        }
    }

    /// Create a link over existing atoms
    pub fn link(atom_type: impl Into<String>, outgoing: Vec<AtomId>) -> Self {
        Self {
            id: AtomId::new(),
            atom_type: atom_type.into(),
            name: None,
            outgoing,
            values: RwLock::new(BTreeMap::new()),
        }
    }

    pub const fn id(&self) -> AtomId {
        self.id
    }

    pub fn atom_type(&self) -> &str {
        &self.atom_type
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn outgoing(&self) -> &[AtomId] {
        &self.outgoing
    }

    pub const fn is_link(&self) -> bool {
        self.name.is_none()
    }

    /// Set a value, returning the previous one
    pub fn set_value(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.values.write().insert(key.into(), value)
    }

    pub fn value(&self, key: &str) -> Option<Value> {
        self.values.read().get(key).cloned()
    }

    pub fn value_count(&self) -> usize {
        self.values.read().len()
    }

    /// Current document for this atom
    ///
    /// Values are copied at call time, so the document reflects every
    /// update made before it.
    pub fn to_document(&self) -> AtomDocument {
        AtomDocument {
            id: self.id,
            atom_type: self.atom_type.clone(),
            name: self.name.clone(),
            outgoing: self.outgoing.clone(),
            values: self.values.read().clone(),
        }
    }
}

/// Serialized form of an atom
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AtomDocument {
    pub id: AtomId,
    #[serde(rename = "type")]
    pub atom_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outgoing: Vec<AtomId>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub values: BTreeMap<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_node_and_link() {
        let a = Atom::node("ConceptNode", "cat");
        let b = Atom::node("ConceptNode", "animal");
        let link = Atom::link("InheritanceLink", vec![a.id(), b.id()]);

        assert!(!a.is_link());
        assert!(link.is_link());
        assert_eq!(link.outgoing(), &[a.id(), b.id()]);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_document_sees_latest_values() {
        let atom = Atom::node("ConceptNode", "cat");
        atom.set_value("tv", json!([0.5, 0.1]));
        assert_eq!(atom.set_value("tv", json!([0.9, 0.8])), Some(json!([0.5, 0.1])));

        let doc = atom.to_document();
        assert_eq!(doc.values["tv"], json!([0.9, 0.8]));

        let encoded = serde_json::to_value(&doc).unwrap();
        assert_eq!(encoded["type"], "ConceptNode");
        assert_eq!(encoded["name"], "cat");
        assert!(encoded.get("outgoing").is_none());
    }
}
