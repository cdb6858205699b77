//! SQLite-backed [`EmbeddingStore`].

use crate::{from_millis, lock};
use chrono::Utc;
use presence_core::{Embedding, EmbeddingStore, Identity, IdentityId, Snapshot, StoreError};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::sync::{Arc, Mutex};

fn unavailable(e: impl std::fmt::Display) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

pub(crate) fn encode_embedding(embedding: &Embedding) -> Vec<u8> {
    embedding
        .values
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect()
}

pub(crate) fn decode_embedding(blob: &[u8]) -> Option<Embedding> {
    if blob.len() % 4 != 0 {
        return None;
    }
    let values = blob
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Some(Embedding::new(values))
}

pub struct SqliteEmbeddingStore {
    conn: Arc<Mutex<Connection>>,
    dim: usize,
}

impl SqliteEmbeddingStore {
    pub fn new(conn: Arc<Mutex<Connection>>, dim: usize) -> Self {
        Self { conn, dim }
    }
}

impl EmbeddingStore for SqliteEmbeddingStore {
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

        let mut conn = lock(&self.conn).map_err(unavailable)?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(unavailable)?;

        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM identities WHERE email = ?1",
                params![email],
                |row| row.get(0),
            )
            .optional()
            .map_err(unavailable)?;
        if existing.is_some() {
            return Err(StoreError::DuplicateIdentity(email.to_string()));
        }

        tx.execute(
            "INSERT INTO identities (name, email, embedding, registered_at_ms)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                name,
                email,
                encode_embedding(&embedding),
                Utc::now().timestamp_millis()
            ],
        )
        .map_err(unavailable)?;
        let id = IdentityId(tx.last_insert_rowid());
        tx.commit().map_err(unavailable)?;
        Ok(id)
    }

    fn reenroll(&self, email: &str, embedding: Embedding) -> Result<IdentityId, StoreError> {
        embedding.validate(self.dim)?;

        let mut conn = lock(&self.conn).map_err(unavailable)?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(unavailable)?;

        let id: i64 = tx
            .query_row(
                "SELECT id FROM identities WHERE email = ?1",
                params![email],
                |row| row.get(0),
            )
            .optional()
            .map_err(unavailable)?
            .ok_or_else(|| StoreError::NotRegistered(email.to_string()))?;

        tx.execute(
            "UPDATE identities SET embedding = ?1 WHERE id = ?2",
            params![encode_embedding(&embedding), id],
        )
        .map_err(unavailable)?;
        tx.commit().map_err(unavailable)?;
        Ok(IdentityId(id))
    }

    fn snapshot(&self) -> Result<Snapshot, StoreError> {
        let conn = lock(&self.conn).map_err(unavailable)?;
        let mut stmt = conn
            .prepare(
                "SELECT id, name, email, embedding, registered_at_ms
                 FROM identities ORDER BY id",
            )
            .map_err(unavailable)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Vec<u8>>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })
            .map_err(unavailable)?;

        let mut identities = Vec::new();
        for row in rows {
            let (id, name, email, blob, registered_at_ms) = row.map_err(unavailable)?;
            let embedding = decode_embedding(&blob).ok_or_else(|| {
                unavailable(format!("identity {id}: embedding blob is {} bytes", blob.len()))
            })?;
            if embedding.dim() != self.dim {
                return Err(unavailable(format!(
                    "identity {id}: stored {}-dim embedding, expected {}",
                    embedding.dim(),
                    self.dim
                )));
            }
            identities.push(Identity {
                id: IdentityId(id),
                name,
                email,
                embedding,
                registered_at: from_millis(registered_at_ms).map_err(unavailable)?,
            });
        }
        Ok(Snapshot::new(identities))
    }

    fn count(&self) -> Result<usize, StoreError> {
        let conn = lock(&self.conn).map_err(unavailable)?;
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM identities", [], |row| row.get(0))
            .map_err(unavailable)?;
        usize::try_from(n).map_err(unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;
    use presence_core::EmbeddingError;

    fn emb(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    #[test]
    fn test_embedding_blob_layout() {
        let e = emb(&[1.0, -2.5, 0.125]);
        let blob = encode_embedding(&e);
        assert_eq!(blob.len(), 12);
        assert_eq!(&blob[0..4], &1.0f32.to_le_bytes());
        assert_eq!(decode_embedding(&blob), Some(e));
    }

    #[test]
    fn test_decode_rejects_truncated_blob() {
        assert_eq!(decode_embedding(&[0, 0, 128]), None);
    }

    #[test]
    fn test_insert_and_snapshot() {
        let db = Database::open_in_memory().unwrap();
        let store = db.embedding_store(3);
        let a = store.insert("Alice", "alice@example.com", emb(&[0.1, 0.2, 0.3])).unwrap();
        let b = store.insert("Bob", "bob@example.com", emb(&[0.4, 0.5, 0.6])).unwrap();
        assert!(a < b);

        let snapshot = store.snapshot().unwrap();
        assert_eq!(snapshot.len(), 2);
        let alice = snapshot.get(a).unwrap();
        assert_eq!(alice.name, "Alice");
        assert_eq!(alice.email, "alice@example.com");
        assert_eq!(alice.embedding, emb(&[0.1, 0.2, 0.3]));
        assert_eq!(store.count().unwrap(), 2);
    }

    #[test]
    fn test_duplicate_email_rejected() {
        let db = Database::open_in_memory().unwrap();
        let store = db.embedding_store(3);
        store.insert("Alice", "alice@example.com", emb(&[0.1, 0.2, 0.3])).unwrap();
        let err = store
            .insert("Other", "alice@example.com", emb(&[0.9, 0.9, 0.9]))
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateIdentity(_)));

        let snapshot = store.snapshot().unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.iter().next().unwrap().name, "Alice");
    }

    #[test]
    fn test_wrong_dimension_rejected_before_write() {
        let db = Database::open_in_memory().unwrap();
        let store = db.embedding_store(3);
        let err = store
            .insert("Alice", "alice@example.com", emb(&[0.1, 0.2]))
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidEmbedding(EmbeddingError::DimensionMismatch { .. })
        ));
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_reenroll() {
        let db = Database::open_in_memory().unwrap();
        let store = db.embedding_store(2);
        let id = store.insert("Alice", "alice@example.com", emb(&[0.0, 0.0])).unwrap();
        assert_eq!(store.reenroll("alice@example.com", emb(&[1.0, 1.0])).unwrap(), id);
        assert_eq!(
            store.snapshot().unwrap().get(id).unwrap().embedding,
            emb(&[1.0, 1.0])
        );
        assert!(matches!(
            store.reenroll("bob@example.com", emb(&[1.0, 1.0])),
            Err(StoreError::NotRegistered(_))
        ));
    }

    #[test]
    fn test_dimension_drift_is_unavailable() {
        let db = Database::open_in_memory().unwrap();
        db.embedding_store(2)
            .insert("Alice", "alice@example.com", emb(&[0.0, 0.0]))
            .unwrap();
        let err = db.embedding_store(3).snapshot().unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
    }

    #[test]
    fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("presence.db");
        {
            let db = Database::open(&path).unwrap();
            db.embedding_store(2)
                .insert("Alice", "alice@example.com", emb(&[0.5, 0.5]))
                .unwrap();
        }
        let db = Database::open(&path).unwrap();
        let snapshot = db.embedding_store(2).snapshot().unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.iter().next().unwrap().embedding, emb(&[0.5, 0.5]));
    }
}
