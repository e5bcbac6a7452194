//! Best-effort authorization audit trail.
//!
//! Decisions are recorded through a bounded channel; when the queue is full
//! the entry is dropped and a counter incremented; the decision path never
//! blocks on auditing. A drain worker writes queued entries to the
//! `authorization_log` table.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use sea_orm::{ActiveModelTrait, DatabaseConnection, NotSet, Set};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::entities::authorization_log;

#[derive(Debug, Clone, PartialEq)]
pub struct AuditEntry {
    pub realm_id: i32,
    pub principal_id: i32,
    pub action_name: Option<String>,
    pub resource_type_name: Option<String>,
    pub decision: bool,
    pub resource_ids: Option<Vec<i32>>,
    pub external_resource_ids: Option<Vec<String>>,
}

/// Non-blocking producer half of the audit queue. Cheap to clone.
#[derive(Clone)]
pub struct AuditSink {
    tx: mpsc::Sender<AuditEntry>,
    dropped: Arc<AtomicU64>,
}

impl AuditSink {
    /// Create a sink with a bounded queue; hand the receiver to
    /// [`run_drain`].
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<AuditEntry>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Enqueue an entry, dropping it if the queue is full.
    pub fn record(&self, entry: AuditEntry) {
        if let Err(err) = self.tx.try_send(entry) {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            debug!(dropped_total = total, "Audit queue full, entry dropped: {err}");
        }
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Drain worker: consumes queued entries and persists them. Store failures
/// are logged and swallowed; auditing never affects decisions.
pub async fn run_drain(db: DatabaseConnection, mut rx: mpsc::Receiver<AuditEntry>) {
    info!("Audit drain worker started");
    while let Some(entry) = rx.recv().await {
        if let Err(err) = write_entry(&db, entry).await {
            error!("Failed to persist audit entry: {err}");
        }
    }
    info!("Audit drain worker stopped");
}

async fn write_entry(db: &DatabaseConnection, entry: AuditEntry) -> Result<(), sea_orm::DbErr> {
    let row = authorization_log::ActiveModel {
        id: NotSet,
        timestamp: Set(Utc::now()),
        realm_id: Set(entry.realm_id),
        principal_id: Set(entry.principal_id),
        action_name: Set(entry.action_name),
        resource_type_name: Set(entry.resource_type_name),
        decision: Set(entry.decision),
        resource_ids: Set(entry
            .resource_ids
            .map(|ids| serde_json::json!(ids))),
        external_resource_ids: Set(entry
            .external_resource_ids
            .map(|ids| serde_json::json!(ids))),
    };
    row.insert(db).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(decision: bool) -> AuditEntry {
        AuditEntry {
            realm_id: 1,
            principal_id: 2,
            action_name: Some("view".into()),
            resource_type_name: Some("docs".into()),
            decision,
            resource_ids: None,
            external_resource_ids: None,
        }
    }

    #[tokio::test]
    async fn test_record_enqueues() {
        let (sink, mut rx) = AuditSink::new(4);
        sink.record(entry(true));
        let received = rx.recv().await.unwrap();
        assert!(received.decision);
        assert_eq!(sink.dropped_count(), 0);
    }

    #[tokio::test]
    async fn test_overflow_drops_without_blocking() {
        let (sink, _rx) = AuditSink::new(2);
        for _ in 0..5 {
            sink.record(entry(false));
        }
        // Two fit in the queue, three were dropped; record() never awaited.
        assert_eq!(sink.dropped_count(), 3);
    }

    #[tokio::test]
    async fn test_drain_persists_entries() {
        use sea_orm::{Database, EntityTrait};
        use sea_orm_migration::MigratorTrait;

        let temp_file = tempfile::NamedTempFile::new().unwrap();
        let url = format!("sqlite://{}?mode=rwc", temp_file.path().display());
        let db = Database::connect(&url).await.unwrap();
        migration::Migrator::up(&db, None).await.unwrap();

        let (sink, rx) = AuditSink::new(8);
        sink.record(AuditEntry {
            external_resource_ids: Some(vec!["doc-2".into()]),
            ..entry(true)
        });
        drop(sink); // close the channel so the drain loop terminates
        run_drain(db.clone(), rx).await;

        let rows = crate::entities::AuthorizationLog::find().all(&db).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(rows[0].decision);
        assert_eq!(
            rows[0].external_resource_ids,
            Some(serde_json::json!(["doc-2"]))
        );
    }
}
