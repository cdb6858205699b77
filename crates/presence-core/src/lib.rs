//! presence-core — Identity resolution and attendance deduplication.
//!
//! Matches probe face embeddings against the registered identity set and
//! records at most one attendance event per identity per dedup window.
//! Embedding extraction happens upstream; this crate never sees pixels.

pub mod clock;
pub mod ledger;
pub mod matcher;
pub mod service;
pub mod store;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use ledger::{AttendanceLedger, LedgerError, MemoryLedger, Recording};
pub use matcher::{EuclideanMatcher, Matcher};
pub use service::{AuthOutcome, AuthStatus, IdentityService, ServiceError, ServiceStatus};
pub use store::{EmbeddingStore, MemoryEmbeddingStore, Snapshot, StoreError};
pub use types::{
    AttendanceEntry, AttendanceEvent, Embedding, EmbeddingError, Identity, IdentityId,
    IdentitySummary, MatchResult,
};
