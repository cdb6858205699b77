//! Registered identity set.
//!
//! Writers replace the whole registry behind an `Arc`, so a [`Snapshot`]
//! handed out earlier keeps seeing exactly the identities that existed when
//! it was taken.

use crate::types::{Embedding, EmbeddingError, Identity, IdentityId};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("invalid embedding: {0}")]
    InvalidEmbedding(#[from] EmbeddingError),
    #[error("an identity is already registered with email {0}")]
    DuplicateIdentity(String),
    #[error("no identity registered with email {0}")]
    NotRegistered(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Point-in-time view of the registered identities, ordered by id.
#[derive(Debug, Clone)]
pub struct Snapshot {
    identities: Arc<[Identity]>,
}

impl Snapshot {
    pub fn new(mut identities: Vec<Identity>) -> Self {
        identities.sort_by_key(|i| i.id);
        Self {
            identities: identities.into(),
        }
    }

    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Identity> {
        self.identities.iter()
    }

    pub fn get(&self, id: IdentityId) -> Option<&Identity> {
        self.identities
            .binary_search_by_key(&id, |i| i.id)
            .ok()
            .map(|idx| &self.identities[idx])
    }
}

/// Owner of all registered identities.
///
/// Implementations must make `insert` and `reenroll` atomic: a snapshot
/// either contains the complete record or nothing of it.
pub trait EmbeddingStore: Send + Sync {
    /// Embedding dimension every stored identity has.
    fn dimension(&self) -> usize;

    /// Register a new identity. Email must not already be present.
    fn insert(&self, name: &str, email: &str, embedding: Embedding)
        -> Result<IdentityId, StoreError>;

    /// Replace the embedding of the identity registered under `email`.
    fn reenroll(&self, email: &str, embedding: Embedding) -> Result<IdentityId, StoreError>;

    fn snapshot(&self) -> Result<Snapshot, StoreError>;

    fn count(&self) -> Result<usize, StoreError>;
}

struct Registry {
    snapshot: Snapshot,
    by_email: HashMap<String, IdentityId>,
    next_id: i64,
}

/// Process-local store. Insertion is copy-on-write, which is fine for the
/// hundreds-to-thousands of identities a site registers.
pub struct MemoryEmbeddingStore {
    dim: usize,
    registry: RwLock<Registry>,
}

impl MemoryEmbeddingStore {
    pub fn new(dim: usize) -> Self {
        Self {
            dim,
            registry: RwLock::new(Registry {
                snapshot: Snapshot::empty(),
                by_email: HashMap::new(),
                next_id: 1,
            }),
        }
    }
}

fn poisoned() -> StoreError {
    StoreError::Unavailable("registry lock poisoned".into())
}

impl EmbeddingStore for MemoryEmbeddingStore {
    fn dimension(&self) -> usize {
        self.dim
    }

    fn insert(
        &self,
        name: &str,
        email: &str,
        embedding: Embedding,
    ) -> Result<IdentityId, StoreError> {
        embedding.validate(self.dim)?;

        let mut registry = self.registry.write().map_err(|_| poisoned())?;
        if registry.by_email.contains_key(email) {
            return Err(StoreError::DuplicateIdentity(email.to_string()));
        }

        let id = IdentityId(registry.next_id);
        let mut identities: Vec<Identity> = registry.snapshot.iter().cloned().collect();
        identities.push(Identity {
            id,
            name: name.to_string(),
            email: email.to_string(),
            embedding,
            registered_at: Utc::now(),
        });

        registry.next_id += 1;
        registry.by_email.insert(email.to_string(), id);
        registry.snapshot = Snapshot::new(identities);
        Ok(id)
    }

    fn reenroll(&self, email: &str, embedding: Embedding) -> Result<IdentityId, StoreError> {
        embedding.validate(self.dim)?;

        let mut registry = self.registry.write().map_err(|_| poisoned())?;
        let id = *registry
            .by_email
            .get(email)
            .ok_or_else(|| StoreError::NotRegistered(email.to_string()))?;

        let identities: Vec<Identity> = registry
            .snapshot
            .iter()
            .map(|identity| {
                if identity.id == id {
                    Identity {
                        embedding: embedding.clone(),
                        ..identity.clone()
                    }
                } else {
                    identity.clone()
                }
            })
            .collect();
        registry.snapshot = Snapshot::new(identities);
        Ok(id)
    }

    fn snapshot(&self) -> Result<Snapshot, StoreError> {
        let registry = self.registry.read().map_err(|_| poisoned())?;
        Ok(registry.snapshot.clone())
    }

    fn count(&self) -> Result<usize, StoreError> {
        let registry = self.registry.read().map_err(|_| poisoned())?;
        Ok(registry.snapshot.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;

    fn emb(x: f32) -> Embedding {
        Embedding::new(vec![x, 0.0, 0.0])
    }

    #[test]
    fn test_insert_assigns_increasing_ids() {
        let store = MemoryEmbeddingStore::new(3);
        let a = store.insert("Alice", "alice@example.com", emb(1.0)).unwrap();
        let b = store.insert("Bob", "bob@example.com", emb(2.0)).unwrap();
        assert!(a < b);
        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn test_insert_rejects_wrong_dimension() {
        let store = MemoryEmbeddingStore::new(3);
        let err = store
            .insert("Alice", "alice@example.com", Embedding::new(vec![1.0, 2.0]))
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidEmbedding(EmbeddingError::DimensionMismatch { expected: 3, actual: 2 })
        ));
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_duplicate_email_keeps_first_record() {
        let store = MemoryEmbeddingStore::new(3);
        let first = store.insert("Alice", "alice@example.com", emb(1.0)).unwrap();
        let err = store
            .insert("Impostor", "alice@example.com", emb(9.0))
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateIdentity(ref e) if e == "alice@example.com"));

        let snapshot = store.snapshot().unwrap();
        assert_eq!(snapshot.len(), 1);
        let alice = snapshot.get(first).unwrap();
        assert_eq!(alice.name, "Alice");
        assert_eq!(alice.embedding, emb(1.0));
    }

    #[test]
    fn test_snapshot_is_point_in_time() {
        let store = MemoryEmbeddingStore::new(3);
        store.insert("Alice", "alice@example.com", emb(1.0)).unwrap();
        let before = store.snapshot().unwrap();
        store.insert("Bob", "bob@example.com", emb(2.0)).unwrap();
        assert_eq!(before.len(), 1);
        assert_eq!(store.snapshot().unwrap().len(), 2);
    }

    #[test]
    fn test_reenroll_replaces_embedding_wholesale() {
        let store = MemoryEmbeddingStore::new(3);
        let id = store.insert("Alice", "alice@example.com", emb(1.0)).unwrap();
        let before = store.snapshot().unwrap();

        let same = store
            .reenroll("alice@example.com", Embedding::new(vec![0.0, 5.0, 5.0]))
            .unwrap();
        assert_eq!(same, id);

        let after = store.snapshot().unwrap();
        assert_eq!(after.get(id).unwrap().embedding.values, vec![0.0, 5.0, 5.0]);
        assert_eq!(after.get(id).unwrap().name, "Alice");
        // Earlier snapshot still sees the old vector.
        assert_eq!(before.get(id).unwrap().embedding, emb(1.0));
    }

    #[test]
    fn test_reenroll_unknown_email() {
        let store = MemoryEmbeddingStore::new(3);
        let err = store.reenroll("ghost@example.com", emb(1.0)).unwrap_err();
        assert!(matches!(err, StoreError::NotRegistered(_)));
    }

    #[test]
    fn test_concurrent_duplicate_registration_stores_one() {
        let store = MemoryEmbeddingStore::new(3);
        let barrier = Barrier::new(8);
        let successes: usize = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|i| {
                    let store = &store;
                    let barrier = &barrier;
                    s.spawn(move || {
                        barrier.wait();
                        store.insert("Alice", "alice@example.com", emb(i as f32)).is_ok()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|ok| *ok)
                .count()
        });
        assert_eq!(successes, 1);
        assert_eq!(store.count().unwrap(), 1);
    }

    #[test]
    fn test_snapshot_get_missing() {
        let snapshot = Snapshot::empty();
        assert!(snapshot.is_empty());
        assert!(snapshot.get(IdentityId(1)).is_none());
    }
}
