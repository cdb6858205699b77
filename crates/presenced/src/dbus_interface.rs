use presence_core::{Embedding, IdentityService, ServiceError};
use serde::Serialize;
use std::sync::Arc;
use zbus::{fdo, interface};

pub const BUS_NAME: &str = "org.freedesktop.Presence1";
pub const OBJECT_PATH: &str = "/org/freedesktop/Presence1";

/// D-Bus interface for the Presence attendance daemon.
///
/// Bus name: org.freedesktop.Presence1
/// Object path: /org/freedesktop/Presence1
pub struct PresenceService {
    service: Arc<IdentityService>,
}

impl PresenceService {
    pub fn new(service: Arc<IdentityService>) -> Self {
        Self { service }
    }
}

#[interface(name = "org.freedesktop.Presence1")]
impl PresenceService {
    /// Register a new identity, returning its id.
    async fn register(&self, name: &str, email: &str, embedding: Vec<f64>) -> fdo::Result<i64> {
        tracing::info!(name, email, dim = embedding.len(), "register requested");
        let (name, email) = (name.to_string(), email.to_string());
        let id = run_blocking(&self.service, "register", move |s| {
            s.register(&name, &email, to_embedding(embedding))
        })
        .await?;
        Ok(id.0)
    }

    /// Replace the embedding of an existing identity.
    async fn reenroll(&self, email: &str, embedding: Vec<f64>) -> fdo::Result<i64> {
        tracing::info!(email, dim = embedding.len(), "reenroll requested");
        let email = email.to_string();
        let id = run_blocking(&self.service, "reenroll", move |s| {
            s.reenroll(&email, to_embedding(embedding))
        })
        .await?;
        Ok(id.0)
    }

    /// Match an embedding and record attendance. Returns the outcome as JSON.
    async fn authenticate(&self, embedding: Vec<f64>) -> fdo::Result<String> {
        tracing::debug!(dim = embedding.len(), "authenticate requested");
        let outcome = run_blocking(&self.service, "authenticate", move |s| {
            s.authenticate(&to_embedding(embedding))
        })
        .await?;
        to_json(&outcome)
    }

    /// All attendance events, most recent first, as JSON.
    async fn list_attendance(&self) -> fdo::Result<String> {
        let entries = run_blocking(&self.service, "list_attendance", |s| s.list_attendance()).await?;
        to_json(&entries)
    }

    /// Registered identities without embeddings, as JSON.
    async fn list_identities(&self) -> fdo::Result<String> {
        let identities =
            run_blocking(&self.service, "list_identities", |s| s.list_identities()).await?;
        to_json(&identities)
    }

    /// Return daemon status information.
    async fn status(&self) -> fdo::Result<String> {
        let status = run_blocking(&self.service, "status", |s| s.status()).await?;
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "identities": status.identities,
            "dimension": status.dimension,
            "threshold": status.threshold,
            "dedup_window_secs": status.dedup_window_secs,
        })
        .to_string())
    }
}

/// Run a service call on the blocking pool.
///
/// The spawned task is detached from the D-Bus call: if the caller goes
/// away, an attendance write already in flight still runs to completion.
async fn run_blocking<T, F>(service: &Arc<IdentityService>, op: &'static str, f: F) -> fdo::Result<T>
where
    T: Send + 'static,
    F: FnOnce(&IdentityService) -> Result<T, ServiceError> + Send + 'static,
{
    let service = Arc::clone(service);
    tokio::task::spawn_blocking(move || f(&service))
        .await
        .map_err(|e| fdo::Error::Failed(format!("{op} task failed: {e}")))?
        .map_err(|e| to_fdo(op, e))
}

fn to_fdo(op: &str, e: ServiceError) -> fdo::Error {
    match e {
        ServiceError::InvalidEmbedding(_) => fdo::Error::InvalidArgs(e.to_string()),
        ServiceError::DuplicateIdentity(_) => fdo::Error::FileExists(e.to_string()),
        ServiceError::NotRegistered(_) => fdo::Error::UnknownObject(e.to_string()),
        ServiceError::Unavailable(_) => {
            tracing::warn!(op, error = %e, "storage unavailable");
            fdo::Error::IOError(e.to_string())
        }
        ServiceError::Misconfigured(_) => fdo::Error::Failed(e.to_string()),
    }
}

/// D-Bus carries doubles; embeddings are single precision. Values outside
/// f32 range become infinite and are rejected by validation.
fn to_embedding(values: Vec<f64>) -> Embedding {
    Embedding::new(values.into_iter().map(|v| v as f32).collect())
}

fn to_json<T: Serialize>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| fdo::Error::Failed(format!("encoding reply: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use presence_core::{
        EmbeddingStore, EuclideanMatcher, ManualClock, MemoryEmbeddingStore, MemoryLedger,
    };

    fn service() -> Arc<IdentityService> {
        let store = Arc::new(MemoryEmbeddingStore::new(3));
        let directory: Arc<dyn EmbeddingStore> = store.clone();
        let ledger = Arc::new(MemoryLedger::new(Duration::hours(24), directory));
        Arc::new(
            IdentityService::new(
                store,
                ledger,
                EuclideanMatcher::new(3, 0.6),
                Arc::new(ManualClock::new(Utc::now())),
            )
            .unwrap(),
        )
    }

    #[test]
    fn test_error_mapping_is_distinct() {
        let invalid = to_fdo(
            "t",
            ServiceError::InvalidEmbedding(presence_core::EmbeddingError::Empty),
        );
        assert!(matches!(invalid, fdo::Error::InvalidArgs(_)));
        assert!(matches!(
            to_fdo("t", ServiceError::DuplicateIdentity("a@b".into())),
            fdo::Error::FileExists(_)
        ));
        assert!(matches!(
            to_fdo("t", ServiceError::NotRegistered("a@b".into())),
            fdo::Error::UnknownObject(_)
        ));
        assert!(matches!(
            to_fdo("t", ServiceError::Unavailable("down".into())),
            fdo::Error::IOError(_)
        ));
    }

    #[test]
    fn test_to_embedding_overflow_is_rejected() {
        let e = to_embedding(vec![0.5, 1e300, 0.0]);
        assert!(e.validate(3).is_err());
    }

    #[tokio::test]
    async fn test_run_blocking_register_and_authenticate() {
        let service = service();
        let id = run_blocking(&service, "register", |s| {
            s.register("Alice", "alice@example.com", to_embedding(vec![0.1, 0.2, 0.3]))
        })
        .await
        .unwrap();

        let outcome = run_blocking(&service, "authenticate", |s| {
            s.authenticate(&to_embedding(vec![0.1, 0.2, 0.3]))
        })
        .await
        .unwrap();
        let json: serde_json::Value = serde_json::from_str(&to_json(&outcome).unwrap()).unwrap();
        assert_eq!(json["status"], "MATCHED");
        assert_eq!(json["recorded"], true);
        assert_eq!(json["identity"]["id"], id.0);
        assert_eq!(json["identity"]["name"], "Alice");
    }

    #[tokio::test]
    async fn test_run_blocking_maps_errors() {
        let service = service();
        let err = run_blocking(&service, "authenticate", |s| {
            s.authenticate(&to_embedding(vec![0.1]))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, fdo::Error::InvalidArgs(_)));
    }
}
