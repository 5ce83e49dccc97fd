//! Write-behind wrapper around a [`Store`]
//!
//! Writes are queued and applied in order by a blocking worker, so the engine
//! never waits on disk while holding its lock. Reads go straight to the inner
//! store and may not yet observe queued writes; the engine only reads durable
//! state during recovery, before anything is queued.

use chrono::{DateTime, Local};
use rollcall_api::NotificationRecord;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{AuditEvent, Store, StoreError, StoreResult, StoredAbsences};

enum WriteOp {
    Audit(AuditEvent),
    Record(NotificationRecord),
    ClearRecords,
    Absences(StoredAbsences),
    LastReset(DateTime<Local>),
    Flush(oneshot::Sender<()>),
}

pub struct WriteBehindStore {
    inner: Arc<dyn Store>,
    tx: mpsc::UnboundedSender<WriteOp>,
}

impl WriteBehindStore {
    /// Start the writer. Must be called from within a tokio runtime.
    ///
    /// The worker exits once every handle to the returned store is dropped.
    pub fn spawn(inner: Arc<dyn Store>) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<WriteOp>();
        let worker_store = inner.clone();

        let handle = tokio::task::spawn_blocking(move || {
            while let Some(op) = rx.blocking_recv() {
                let result = match op {
                    WriteOp::Audit(event) => worker_store.append_audit(event),
                    WriteOp::Record(record) => worker_store.save_notification_record(&record),
                    WriteOp::ClearRecords => worker_store.clear_notification_records(),
                    WriteOp::Absences(absences) => worker_store.save_absences(&absences),
                    WriteOp::LastReset(at) => worker_store.set_last_reset_at(at),
                    WriteOp::Flush(done) => {
                        let _ = done.send(());
                        Ok(())
                    }
                };
                if let Err(e) = result {
                    warn!(error = %e, "Deferred store write failed");
                }
            }
            debug!("Store writer stopped");
        });

        (Self { inner, tx }, handle)
    }

    fn enqueue(&self, op: WriteOp) -> StoreResult<()> {
        self.tx.send(op).map_err(|_| StoreError::WriterClosed)
    }

    /// Wait until every write queued before this call has been applied
    pub async fn flush(&self) -> StoreResult<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.enqueue(WriteOp::Flush(done_tx))?;
        done_rx.await.map_err(|_| StoreError::WriterClosed)
    }
}

impl Store for WriteBehindStore {
    fn append_audit(&self, event: AuditEvent) -> StoreResult<()> {
        self.enqueue(WriteOp::Audit(event))
    }

    fn get_recent_audits(&self, limit: usize) -> StoreResult<Vec<AuditEvent>> {
        self.inner.get_recent_audits(limit)
    }

    fn load_notification_records(&self) -> StoreResult<Vec<NotificationRecord>> {
        self.inner.load_notification_records()
    }

    fn save_notification_record(&self, record: &NotificationRecord) -> StoreResult<()> {
        self.enqueue(WriteOp::Record(record.clone()))
    }

    fn clear_notification_records(&self) -> StoreResult<()> {
        self.enqueue(WriteOp::ClearRecords)
    }

    fn load_absences(&self) -> StoreResult<Vec<StoredAbsences>> {
        self.inner.load_absences()
    }

    fn save_absences(&self, absences: &StoredAbsences) -> StoreResult<()> {
        self.enqueue(WriteOp::Absences(absences.clone()))
    }

    fn last_reset_at(&self) -> StoreResult<Option<DateTime<Local>>> {
        self.inner.last_reset_at()
    }

    fn set_last_reset_at(&self, at: DateTime<Local>) -> StoreResult<()> {
        self.enqueue(WriteOp::LastReset(at))
    }

    fn is_healthy(&self) -> bool {
        !self.tx.is_closed() && self.inner.is_healthy()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AuditEventType, SqliteStore};
    use rollcall_util::StudentId;

    #[tokio::test]
    async fn writes_land_in_order_after_flush() {
        let inner = Arc::new(SqliteStore::in_memory().unwrap());
        let (store, _worker) = WriteBehindStore::spawn(inner.clone());

        let now = rollcall_util::now();
        let mut record = NotificationRecord::empty(StudentId::new(3));
        record.camera.advance(now);
        store.save_notification_record(&record).unwrap();
        record.camera.advance(now);
        store.save_notification_record(&record).unwrap();
        store
            .append_audit(AuditEvent::new(AuditEventType::ServiceStarted))
            .unwrap();

        store.flush().await.unwrap();

        let records = inner.load_notification_records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].camera.stage_count, 2);
        assert_eq!(inner.get_recent_audits(5).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn worker_exits_when_store_dropped() {
        let inner = Arc::new(SqliteStore::in_memory().unwrap());
        let (store, worker) = WriteBehindStore::spawn(inner);
        store.clear_notification_records().unwrap();
        drop(store);
        worker.await.unwrap();
    }
}
