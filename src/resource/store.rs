use std::collections::HashMap;
use thiserror::Error;

use super::document::Document;
use super::key::ResourceKey;

#[derive(Debug, Error, PartialEq)]
#[error("duplicate resource key: {0}")]
pub struct DuplicateResourceError(pub ResourceKey);

/// In-memory index of every ingested document, keyed by reference key.
/// Populated once by the ingester and read-only afterwards; concurrent reads
/// need no synchronization.
#[derive(Debug, Default, PartialEq)]
pub struct ResourceStore {
    documents: HashMap<ResourceKey, Document>,
}

impl ResourceStore {
    pub fn insert(&mut self, document: Document) -> Result<(), DuplicateResourceError> {
        let key = document.key().clone();
        if self.documents.contains_key(&key) {
            return Err(DuplicateResourceError(key));
        }
        self.documents.insert(key, document);
        Ok(())
    }

    pub fn get(&self, key: &ResourceKey) -> Option<&Document> {
        self.documents.get(key)
    }

    pub fn documents(&self) -> impl Iterator<Item = &Document> {
        self.documents.values()
    }

    /// All documents of the given kind, sorted by key for deterministic walks.
    pub fn by_kind(&self, kind: &str) -> Vec<&Document> {
        let mut docs: Vec<&Document> = self
            .documents
            .values()
            .filter(|d| d.key().kind == kind)
            .collect();
        docs.sort_by(|a, b| a.key().cmp(b.key()));
        docs
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn doc(kind: &str, namespace: &str, name: &str) -> Document {
        Document::new(
            ResourceKey::new("", kind, namespace, name),
            serde_yaml::Value::Null,
            String::new(),
        )
    }

    #[test]
    fn test_insert_and_get() {
        let mut store = ResourceStore::default();
        store.insert(doc("ConfigMap", "a", "values")).unwrap();

        let key = ResourceKey::new("", "ConfigMap", "a", "values");
        assert!(store.get(&key).is_some());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_duplicate_key_is_rejected() {
        let mut store = ResourceStore::default();
        store.insert(doc("ConfigMap", "a", "values")).unwrap();

        assert_matches!(
            store.insert(doc("ConfigMap", "a", "values")),
            Err(DuplicateResourceError(key)) => {
                assert_eq!(key.name, "values");
            }
        );
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_by_kind_is_sorted() {
        let mut store = ResourceStore::default();
        store.insert(doc("HelmRelease", "b", "z")).unwrap();
        store.insert(doc("HelmRelease", "a", "y")).unwrap();
        store.insert(doc("ConfigMap", "a", "x")).unwrap();

        let releases = store.by_kind("HelmRelease");
        let names: Vec<&str> = releases.iter().map(|d| d.key().name.as_str()).collect();
        assert_eq!(names, vec!["y", "z"]);
    }
}
