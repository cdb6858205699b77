//! Append-only attendance log with per-identity deduplication.

use crate::store::EmbeddingStore;
use crate::types::{AttendanceEntry, AttendanceEvent, IdentityId};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("no identity {0} to record attendance for")]
    UnknownIdentity(IdentityId),
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
}

/// Outcome of [`AttendanceLedger::record_if_absent`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recording {
    /// `true` if a new event was written.
    pub recorded: bool,
    /// The new event, or the most recent one already inside the window.
    pub event: AttendanceEvent,
}

/// Owner of all attendance events.
pub trait AttendanceLedger: Send + Sync {
    /// Dedup window: one event per identity per this span.
    fn window(&self) -> Duration;

    /// Write an event at `now` unless the identity already has one at or
    /// after `now - window`. Indivisible per identity; calls for different
    /// identities must not wait on each other.
    fn record_if_absent(
        &self,
        identity_id: IdentityId,
        now: DateTime<Utc>,
    ) -> Result<Recording, LedgerError>;

    /// All events joined to identity names, most recent first.
    fn list_all(&self) -> Result<Vec<AttendanceEntry>, LedgerError>;
}

/// Earliest timestamp that still falls inside the window ending at `now`.
pub fn window_start(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    now.checked_sub_signed(window)
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Most-recent-first, ties broken by identity id.
pub fn sort_entries(entries: &mut [AttendanceEntry]) {
    entries.sort_by(|a, b| {
        b.timestamp
            .cmp(&a.timestamp)
            .then_with(|| a.identity_id.cmp(&b.identity_id))
    });
}

type Lane = Arc<Mutex<Vec<AttendanceEvent>>>;

/// Process-local ledger.
///
/// Each identity gets its own lane behind its own mutex; the lane map lock
/// is only held long enough to look a lane up. Names for `list_all` come
/// from the identity directory at read time.
pub struct MemoryLedger {
    window: Duration,
    directory: Arc<dyn EmbeddingStore>,
    lanes: Mutex<HashMap<IdentityId, Lane>>,
}

impl MemoryLedger {
    pub fn new(window: Duration, directory: Arc<dyn EmbeddingStore>) -> Self {
        Self {
            window,
            directory,
            lanes: Mutex::new(HashMap::new()),
        }
    }

    fn lane(&self, identity_id: IdentityId) -> Result<Lane, LedgerError> {
        let mut lanes = self.lanes.lock().map_err(|_| poisoned())?;
        Ok(Arc::clone(lanes.entry(identity_id).or_default()))
    }
}

fn poisoned() -> LedgerError {
    LedgerError::Unavailable("ledger lock poisoned".into())
}

impl AttendanceLedger for MemoryLedger {
    fn window(&self) -> Duration {
        self.window
    }

    fn record_if_absent(
        &self,
        identity_id: IdentityId,
        now: DateTime<Utc>,
    ) -> Result<Recording, LedgerError> {
        let snapshot = self
            .directory
            .snapshot()
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?;
        if snapshot.get(identity_id).is_none() {
            return Err(LedgerError::UnknownIdentity(identity_id));
        }

        let lane = self.lane(identity_id)?;
        let mut events = lane.lock().map_err(|_| poisoned())?;

        let since = window_start(now, self.window);
        let latest = events
            .iter()
            .filter(|e| e.timestamp >= since)
            .max_by_key(|e| e.timestamp);
        if let Some(existing) = latest {
            return Ok(Recording {
                recorded: false,
                event: existing.clone(),
            });
        }

        let event = AttendanceEvent::new(identity_id, now);
        events.push(event.clone());
        Ok(Recording {
            recorded: true,
            event,
        })
    }

    fn list_all(&self) -> Result<Vec<AttendanceEntry>, LedgerError> {
        let snapshot = self
            .directory
            .snapshot()
            .map_err(|e| LedgerError::Unavailable(e.to_string()))?;
        let lanes: Vec<(IdentityId, Lane)> = {
            let lanes = self.lanes.lock().map_err(|_| poisoned())?;
            lanes.iter().map(|(id, lane)| (*id, Arc::clone(lane))).collect()
        };

        let mut entries = Vec::new();
        for (identity_id, lane) in lanes {
            let Some(identity) = snapshot.get(identity_id) else {
                continue;
            };
            let events = lane.lock().map_err(|_| poisoned())?;
            entries.extend(events.iter().map(|e| AttendanceEntry {
                identity_id,
                identity_name: identity.name.clone(),
                timestamp: e.timestamp,
            }));
        }
        sort_entries(&mut entries);
        Ok(entries)
    }
}
