//! SQLite-backed [`AttendanceLedger`].
//!
//! The window check and the insert share one `IMMEDIATE` transaction, which
//! takes SQLite's write lock up front: two callers can never both see "no
//! event yet" for the same identity.

use crate::{from_millis, lock};
use chrono::{DateTime, Duration, Utc};
use presence_core::ledger::window_start;
use presence_core::{
    AttendanceEntry, AttendanceEvent, AttendanceLedger, IdentityId, LedgerError, Recording,
};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use std::sync::{Arc, Mutex};

fn unavailable(e: impl std::fmt::Display) -> LedgerError {
    LedgerError::Unavailable(e.to_string())
}

pub struct SqliteLedger {
    conn: Arc<Mutex<Connection>>,
    window: Duration,
}

impl SqliteLedger {
    pub fn new(conn: Arc<Mutex<Connection>>, window: Duration) -> Self {
        Self { conn, window }
    }
}

impl AttendanceLedger for SqliteLedger {
    fn window(&self) -> Duration {
        self.window
    }

    fn record_if_absent(
        &self,
        identity_id: IdentityId,
        now: DateTime<Utc>,
    ) -> Result<Recording, LedgerError> {
        // Stored at millisecond precision; hand back what was stored.
        let now_ms = now.timestamp_millis();
        let since_ms = window_start(now, self.window).timestamp_millis();

        let mut conn = lock(&self.conn).map_err(unavailable)?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(unavailable)?;

        let latest: Option<(String, i64)> = tx
            .query_row(
                "SELECT id, timestamp_ms FROM attendance
                 WHERE identity_id = ?1 AND timestamp_ms >= ?2
                 ORDER BY timestamp_ms DESC LIMIT 1",
                params![identity_id.0, since_ms],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(unavailable)?;

        if let Some((id, timestamp_ms)) = latest {
            return Ok(Recording {
                recorded: false,
                event: AttendanceEvent {
                    id,
                    identity_id,
                    timestamp: from_millis(timestamp_ms).map_err(unavailable)?,
                },
            });
        }

        let event = AttendanceEvent::new(identity_id, from_millis(now_ms).map_err(unavailable)?);
        tx.execute(
            "INSERT INTO attendance (id, identity_id, timestamp_ms) VALUES (?1, ?2, ?3)",
            params![event.id, identity_id.0, now_ms],
        )
        .map_err(|e| match e.sqlite_error_code() {
            Some(ErrorCode::ConstraintViolation) => LedgerError::UnknownIdentity(identity_id),
            _ => unavailable(e),
        })?;
        tx.commit().map_err(unavailable)?;

        tracing::debug!(identity_id = %identity_id, event_id = %event.id, "attendance written");
        Ok(Recording {
            recorded: true,
            event,
        })
    }

    fn list_all(&self) -> Result<Vec<AttendanceEntry>, LedgerError> {
        let conn = lock(&self.conn).map_err(unavailable)?;
        let mut stmt = conn
            .prepare(
                "SELECT a.identity_id, i.name, a.timestamp_ms
                 FROM attendance a JOIN identities i ON i.id = a.identity_id
                 ORDER BY a.timestamp_ms DESC, a.identity_id ASC",
            )
            .map_err(unavailable)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })
            .map_err(unavailable)?;

        let mut entries = Vec::new();
        for row in rows {
            let (identity_id, identity_name, timestamp_ms) = row.map_err(unavailable)?;
            entries.push(AttendanceEntry {
                identity_id: IdentityId(identity_id),
                identity_name,
                timestamp: from_millis(timestamp_ms).map_err(unavailable)?,
            });
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;
    use presence_core::{
        AuthOutcome, Embedding, EmbeddingStore, EuclideanMatcher, IdentityService, ManualClock,
    };
    use std::sync::Barrier;

    fn t0() -> DateTime<Utc> {
        from_millis(1_760_000_000_000).unwrap()
    }

    fn setup() -> (Database, IdentityId, IdentityId) {
        let db = Database::open_in_memory().unwrap();
        let store = db.embedding_store(2);
        let alice = store
            .insert("Alice", "alice@example.com", Embedding::new(vec![0.0, 1.0]))
            .unwrap();
        let bob = store
            .insert("Bob", "bob@example.com", Embedding::new(vec![1.0, 0.0]))
            .unwrap();
        (db, alice, bob)
    }

    #[test]
    fn test_dedup_within_window() {
        let (db, alice, _) = setup();
        let ledger = db.ledger(Duration::hours(24));

        let first = ledger.record_if_absent(alice, t0()).unwrap();
        assert!(first.recorded);
        assert_eq!(first.event.timestamp, t0());

        let second = ledger
            .record_if_absent(alice, t0() + Duration::minutes(1))
            .unwrap();
        assert!(!second.recorded);
        assert_eq!(second.event, first.event);

        let later = ledger
            .record_if_absent(alice, t0() + Duration::hours(25))
            .unwrap();
        assert!(later.recorded);
        assert_ne!(later.event.id, first.event.id);
    }

    #[test]
    fn test_timestamps_truncate_to_millis() {
        let (db, alice, _) = setup();
        let ledger = db.ledger(Duration::hours(24));
        let now = t0() + Duration::nanoseconds(1_500_000);
        let recording = ledger.record_if_absent(alice, now).unwrap();
        assert_eq!(recording.event.timestamp, t0() + Duration::milliseconds(1));
    }

    #[test]
    fn test_unknown_identity_is_rejected() {
        let (db, _, _) = setup();
        let ledger = db.ledger(Duration::hours(24));
        let err = ledger.record_if_absent(IdentityId(999), t0()).unwrap_err();
        assert!(matches!(err, LedgerError::UnknownIdentity(IdentityId(999))));
        assert!(ledger.list_all().unwrap().is_empty());
    }

    #[test]
    fn test_list_all_joins_names_most_recent_first() {
        let (db, alice, bob) = setup();
        let ledger = db.ledger(Duration::hours(24));
        ledger.record_if_absent(alice, t0()).unwrap();
        ledger.record_if_absent(bob, t0() + Duration::hours(1)).unwrap();
        ledger.record_if_absent(alice, t0() + Duration::days(1) + Duration::seconds(1)).unwrap();

        let entries = ledger.list_all().unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.identity_name.as_str()).collect();
        assert_eq!(names, vec!["Alice", "Bob", "Alice"]);
        assert_eq!(entries[0].identity_id, alice);
    }

    #[test]
    fn test_concurrent_records_yield_exactly_one() {
        let (db, alice, _) = setup();
        let ledger = db.ledger(Duration::hours(24));
        let n = 16;
        let barrier = Barrier::new(n);

        let recorded = std::thread::scope(|s| {
            let handles: Vec<_> = (0..n)
                .map(|i| {
                    let ledger = &ledger;
                    let barrier = &barrier;
                    s.spawn(move || {
                        barrier.wait();
                        ledger
                            .record_if_absent(alice, t0() + Duration::milliseconds(i as i64))
                            .unwrap()
                            .recorded
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .filter(|r| *r)
                .count()
        });

        assert_eq!(recorded, 1);
        assert_eq!(ledger.list_all().unwrap().len(), 1);
    }

    #[test]
    fn test_service_over_sqlite() {
        let db = Database::open_in_memory().unwrap();
        let clock = Arc::new(ManualClock::new(t0()));
        let service = IdentityService::new(
            Arc::new(db.embedding_store(4)),
            Arc::new(db.ledger(Duration::hours(24))),
            EuclideanMatcher::new(4, 0.6),
            clock.clone(),
        )
        .unwrap();

        let alice = Embedding::new(vec![0.1, 0.2, 0.3, 0.4]);
        service.register("Alice", "alice@example.com", alice.clone()).unwrap();

        assert!(matches!(
            service.authenticate(&alice).unwrap(),
            AuthOutcome::Matched { recorded: true, .. }
        ));
        assert!(matches!(
            service.authenticate(&alice).unwrap(),
            AuthOutcome::Matched { recorded: false, .. }
        ));
        clock.advance(Duration::hours(24) + Duration::seconds(1));
        assert!(matches!(
            service.authenticate(&alice).unwrap(),
            AuthOutcome::Matched { recorded: true, .. }
        ));

        let report = service.list_attendance().unwrap();
        assert_eq!(report.len(), 2);
        assert!(report.iter().all(|e| e.identity_name == "Alice"));
    }
}
