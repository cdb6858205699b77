use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EmbeddingError {
    #[error("embedding is empty")]
    Empty,
    #[error("expected {expected}-dim embedding, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("embedding component {index} is not a finite number")]
    NonFinite { index: usize },
}

/// Face embedding vector (128-dimensional for the upstream descriptor network).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Check that the embedding has exactly `dim` finite components.
    pub fn validate(&self, dim: usize) -> Result<(), EmbeddingError> {
        if self.values.is_empty() {
            return Err(EmbeddingError::Empty);
        }
        if self.values.len() != dim {
            return Err(EmbeddingError::DimensionMismatch {
                expected: dim,
                actual: self.values.len(),
            });
        }
        match self.values.iter().position(|v| !v.is_finite()) {
            Some(index) => Err(EmbeddingError::NonFinite { index }),
            None => Ok(()),
        }
    }

    /// Compute Euclidean distance between two embeddings.
    ///
    /// Both sides must already have the same dimension; extra components on
    /// the longer side are ignored.
    ///
    /// Accumulates in f64 and saturates at `f32::MAX`, so two finite
    /// embeddings are always a finite distance apart.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        let sum: f64 = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(&a, &b)| (f64::from(a) - f64::from(b)).powi(2))
            .sum();
        sum.sqrt().min(f64::from(f32::MAX)) as f32
    }
}

impl From<Vec<f32>> for Embedding {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}

/// Store-assigned identity key. Allocated in increasing order, so a smaller
/// id always belongs to an earlier registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(pub i64);

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A registered person and their enrolled embedding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    pub name: String,
    pub email: String,
    pub embedding: Embedding,
    pub registered_at: DateTime<Utc>,
}

impl Identity {
    pub fn summary(&self) -> IdentitySummary {
        IdentitySummary {
            id: self.id,
            name: self.name.clone(),
            email: self.email.clone(),
            registered_at: self.registered_at,
        }
    }
}

/// Identity without its embedding, safe to hand back to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentitySummary {
    pub id: IdentityId,
    pub name: String,
    pub email: String,
    pub registered_at: DateTime<Utc>,
}

/// One recorded attendance. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceEvent {
    pub id: String,
    pub identity_id: IdentityId,
    pub timestamp: DateTime<Utc>,
}

impl AttendanceEvent {
    /// Create an event with a fresh random id.
    pub fn new(identity_id: IdentityId, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            identity_id,
            timestamp,
        }
    }
}

/// Attendance event joined with the identity's name, for reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttendanceEntry {
    pub identity_id: IdentityId,
    pub identity_name: String,
    pub timestamp: DateTime<Utc>,
}

/// Result of matching a probe embedding against a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub matched: bool,
    /// Euclidean distance to the nearest identity; infinite for an empty snapshot.
    pub distance: f32,
    /// ID of the matched identity (only set when `matched`).
    pub identity_id: Option<IdentityId>,
}
