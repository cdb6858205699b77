//! Nearest-neighbour search over a store snapshot.

use crate::store::Snapshot;
use crate::types::{Embedding, EmbeddingError, IdentityId, MatchResult};

/// Distances closer than this to the minimum count as a tie.
const TIE_EPSILON: f32 = 1e-6;

/// Strategy for comparing a probe embedding against the registered identities.
pub trait Matcher {
    /// Embedding dimension the matcher accepts.
    fn dimension(&self) -> usize;

    /// Acceptance threshold applied to the nearest distance.
    fn threshold(&self) -> f32;

    fn find_nearest(
        &self,
        probe: &Embedding,
        snapshot: &Snapshot,
    ) -> Result<MatchResult, EmbeddingError>;
}

/// Euclidean-distance matcher.
///
/// Always scores every snapshot entry. Among entries tied at the minimum
/// distance the smallest identity id wins, so the result depends only on
/// the probe and the snapshot contents.
#[derive(Debug, Clone, Copy)]
pub struct EuclideanMatcher {
    dimension: usize,
    threshold: f32,
}

impl EuclideanMatcher {
    pub fn new(dimension: usize, threshold: f32) -> Self {
        Self {
            dimension,
            threshold,
        }
    }
}

impl Matcher for EuclideanMatcher {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn threshold(&self) -> f32 {
        self.threshold
    }

    fn find_nearest(
        &self,
        probe: &Embedding,
        snapshot: &Snapshot,
    ) -> Result<MatchResult, EmbeddingError> {
        probe.validate(self.dimension)?;

        let scored: Vec<(IdentityId, f32)> = snapshot
            .iter()
            .map(|identity| (identity.id, probe.euclidean_distance(&identity.embedding)))
            .collect();

        let min_distance = scored
            .iter()
            .map(|&(_, d)| d)
            .fold(f32::INFINITY, f32::min);

        // Snapshot is id-ordered, so the first tied entry has the smallest id.
        let nearest = scored
            .iter()
            .find(|&&(_, d)| d - min_distance <= TIE_EPSILON)
            .map(|&(id, _)| id);

        Ok(match nearest {
            Some(id) if min_distance <= self.threshold => MatchResult {
                matched: true,
                distance: min_distance,
                identity_id: Some(id),
            },
            _ => MatchResult {
                matched: false,
                distance: min_distance,
                identity_id: None,
            },
        })
    }
}
