//! Single entry point for registration, authentication, and reporting.
//!
//! `authenticate` walks one attempt through
//! `Received → Validating → Matching → (NoMatch | Match → Recording) → Done`
//! and performs at most one attendance write per call. Failures from the
//! store or ledger surface as [`ServiceError::Unavailable`] without retries.

use crate::clock::Clock;
use crate::ledger::{AttendanceLedger, LedgerError};
use crate::matcher::{EuclideanMatcher, Matcher};
use crate::store::{EmbeddingStore, StoreError};
use crate::types::{
    AttendanceEntry, AttendanceEvent, Embedding, EmbeddingError, IdentityId, IdentitySummary,
};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("invalid embedding: {0}")]
    InvalidEmbedding(#[from] EmbeddingError),
    #[error("an identity is already registered with email {0}")]
    DuplicateIdentity(String),
    #[error("no identity registered with email {0}")]
    NotRegistered(String),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("misconfigured: {0}")]
    Misconfigured(String),
}

impl ServiceError {
    /// Only storage outages are worth retrying; everything else needs new input.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ServiceError::Unavailable(_))
    }

    pub fn status(&self) -> AuthStatus {
        match self {
            ServiceError::InvalidEmbedding(_) => AuthStatus::InvalidInput,
            _ => AuthStatus::Unavailable,
        }
    }
}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::InvalidEmbedding(e) => ServiceError::InvalidEmbedding(e),
            StoreError::DuplicateIdentity(email) => ServiceError::DuplicateIdentity(email),
            StoreError::NotRegistered(email) => ServiceError::NotRegistered(email),
            StoreError::Unavailable(msg) => ServiceError::Unavailable(msg),
        }
    }
}

impl From<LedgerError> for ServiceError {
    fn from(e: LedgerError) -> Self {
        // An unknown identity here means the ledger and the store disagree.
        ServiceError::Unavailable(e.to_string())
    }
}

/// Caller-visible status of one authentication attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthStatus {
    Matched,
    NotFound,
    InvalidInput,
    Unavailable,
}

/// Successful outcome of [`IdentityService::authenticate`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthOutcome {
    Matched {
        identity: IdentitySummary,
        distance: f32,
        /// `false` when an event already exists inside the dedup window.
        recorded: bool,
        event: AttendanceEvent,
    },
    NotFound {
        /// Distance to the nearest registered identity, if any are registered.
        distance: Option<f32>,
    },
}

impl AuthOutcome {
    pub fn status(&self) -> AuthStatus {
        match self {
            AuthOutcome::Matched { .. } => AuthStatus::Matched,
            AuthOutcome::NotFound { .. } => AuthStatus::NotFound,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceStatus {
    pub identities: usize,
    pub dimension: usize,
    pub threshold: f32,
    pub dedup_window_secs: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthStage {
    Received,
    Validating,
    Matching,
    NoMatch,
    Match,
    Recording,
    Done,
}

fn transition(from: AuthStage, to: AuthStage) -> AuthStage {
    tracing::debug!(from = ?from, stage = ?to, "authenticate");
    to
}

/// Orchestrates the store, matcher and ledger. Owns no data itself.
pub struct IdentityService<M = EuclideanMatcher> {
    store: Arc<dyn EmbeddingStore>,
    ledger: Arc<dyn AttendanceLedger>,
    matcher: M,
    clock: Arc<dyn Clock>,
}

impl<M: Matcher> IdentityService<M> {
    /// Fails if the store and matcher disagree on embedding dimension.
    pub fn new(
        store: Arc<dyn EmbeddingStore>,
        ledger: Arc<dyn AttendanceLedger>,
        matcher: M,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ServiceError> {
        if store.dimension() != matcher.dimension() {
            return Err(ServiceError::Misconfigured(format!(
                "store holds {}-dim embeddings but matcher expects {}",
                store.dimension(),
                matcher.dimension()
            )));
        }
        Ok(Self {
            store,
            ledger,
            matcher,
            clock,
        })
    }

    pub fn register(
        &self,
        name: &str,
        email: &str,
        embedding: Embedding,
    ) -> Result<IdentityId, ServiceError> {
        embedding.validate(self.matcher.dimension())?;
        let id = self.store.insert(name, email, embedding)?;
        tracing::info!(identity_id = %id, name, "identity registered");
        Ok(id)
    }

    pub fn reenroll(&self, email: &str, embedding: Embedding) -> Result<IdentityId, ServiceError> {
        embedding.validate(self.matcher.dimension())?;
        let id = self.store.reenroll(email, embedding)?;
        tracing::info!(identity_id = %id, "identity re-enrolled");
        Ok(id)
    }

    /// Resolve a probe embedding to an identity and record attendance on match.
    pub fn authenticate(&self, probe: &Embedding) -> Result<AuthOutcome, ServiceError> {
        let stage = transition(AuthStage::Received, AuthStage::Validating);
        probe.validate(self.matcher.dimension())?;

        let stage = transition(stage, AuthStage::Matching);
        let snapshot = self.store.snapshot().map_err(|e| {
            tracing::warn!(error = %e, "snapshot failed");
            e
        })?;
        let result = self.matcher.find_nearest(probe, &snapshot)?;

        let matched = result
            .identity_id
            .filter(|_| result.matched)
            .and_then(|id| snapshot.get(id));
        let Some(identity) = matched else {
            let stage = transition(stage, AuthStage::NoMatch);
            transition(stage, AuthStage::Done);
            tracing::info!(
                distance = result.distance,
                candidates = snapshot.len(),
                "no identity within threshold"
            );
            return Ok(AuthOutcome::NotFound {
                distance: (!snapshot.is_empty()).then_some(result.distance),
            });
        };

        let stage = transition(stage, AuthStage::Match);
        let stage = transition(stage, AuthStage::Recording);
        let recording = self
            .ledger
            .record_if_absent(identity.id, self.clock.now())
            .map_err(|e| {
                tracing::warn!(identity_id = %identity.id, error = %e, "attendance write failed");
                e
            })?;
        transition(stage, AuthStage::Done);

        tracing::info!(
            identity_id = %identity.id,
            distance = result.distance,
            recorded = recording.recorded,
            "identity matched"
        );

        Ok(AuthOutcome::Matched {
            identity: identity.summary(),
            distance: result.distance,
            recorded: recording.recorded,
            event: recording.event,
        })
    }

    pub fn list_attendance(&self) -> Result<Vec<AttendanceEntry>, ServiceError> {
        Ok(self.ledger.list_all()?)
    }

    /// Registered identities ordered by id, without embeddings.
    pub fn list_identities(&self) -> Result<Vec<IdentitySummary>, ServiceError> {
        let snapshot = self.store.snapshot()?;
        Ok(snapshot.iter().map(|i| i.summary()).collect())
    }

    pub fn status(&self) -> Result<ServiceStatus, ServiceError> {
        Ok(ServiceStatus {
            identities: self.store.count()?,
            dimension: self.matcher.dimension(),
            threshold: self.matcher.threshold(),
            dedup_window_secs: self.ledger.window().num_seconds(),
        })
    }
}
