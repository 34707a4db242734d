//! Asynchronous batching writer
//!
//! Audit records queue in a bounded FIFO and are persisted in batches, with
//! two triggers: queue size reaching `batch_size` and a periodic timer every
//! `flush_interval`. At most one flush runs at a time; triggers that arrive
//! mid-flush coalesce through a pending bit instead of stacking SQL writes.
//! Enqueues during an in-flight flush land at the tail and are picked up by
//! the next batch, never lost.

mod store;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Mutex as FlushLock;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::config::AuditConfig;
use crate::error::{AuditError, AuditResult, SanitizedError};
use crate::record::{merge_metadata, AuditContext, AuditRecord};

pub use store::{quote_ident, AuditStore, PendingRecord, PgAuditStore};

/// Batching writer for audit records.
///
/// Cheap to clone; all clones share the same queue and flusher.
#[derive(Clone)]
pub struct BatchWriter {
    inner: Arc<WriterInner>,
}

struct WriterInner {
    store: Arc<dyn AuditStore>,
    config: Arc<AuditConfig>,
    queue: Mutex<VecDeque<PendingRecord>>,
    /// Held for the duration of a flush; doubles as the single-in-flight flag.
    flush_lock: Arc<FlushLock<()>>,
    /// Set when a trigger found a flush already running.
    flush_pending: AtomicBool,
    flushing: AtomicBool,
    closed: AtomicBool,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

impl BatchWriter {
    /// Create a writer and start its periodic flusher.
    pub fn new(store: Arc<dyn AuditStore>, config: Arc<AuditConfig>) -> Self {
        let inner = Arc::new(WriterInner {
            store,
            config,
            queue: Mutex::new(VecDeque::new()),
            flush_lock: Arc::new(FlushLock::new(())),
            flush_pending: AtomicBool::new(false),
            flushing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            flusher: Mutex::new(None),
        });

        let handle = WriterInner::spawn_timer(&inner);
        *inner.flusher.lock().expect("flusher lock poisoned") = Some(handle);

        Self { inner }
    }

    /// Enqueue records under the given (already layered) scope context.
    ///
    /// Resolves the effective context snapshot per record, applies the queue
    /// bound, and triggers a flush when the batch threshold is reached. With
    /// `wait_for_write` the triggered flush is awaited and its result
    /// propagates; otherwise the flush runs in the background and failures
    /// reach only the error sink.
    pub async fn enqueue(
        &self,
        records: Vec<AuditRecord>,
        scope_context: &AuditContext,
    ) -> AuditResult<()> {
        let inner = &self.inner;

        if inner.closed.load(Ordering::SeqCst) {
            return Err(AuditError::Closed);
        }

        if records.is_empty() {
            return Ok(());
        }

        let pending: Vec<PendingRecord> = records
            .into_iter()
            .map(|record| inner.resolve(record, scope_context))
            .collect();

        let queue_len = {
            let mut queue = inner.queue.lock().expect("queue lock poisoned");

            let incoming = pending.len();
            let max = inner.config.max_queue_size;
            let accepted = if queue.len() + incoming > max {
                if inner.config.strict_mode {
                    return Err(AuditError::QueueOverflow {
                        pending: queue.len(),
                        incoming,
                        max,
                    });
                }

                let room = max.saturating_sub(queue.len());
                let overflow = AuditError::QueueOverflow {
                    pending: queue.len(),
                    incoming,
                    max,
                };
                (inner.config.error_sink)(
                    "[AUDIT] audit queue full, dropping overflowing records",
                    &SanitizedError::from_audit(&overflow),
                );
                room
            } else {
                incoming
            };

            queue.extend(pending.into_iter().take(accepted));
            queue.len()
        };

        if queue_len >= inner.config.batch_size {
            if inner.config.wait_for_write {
                self.flush().await?;
            } else {
                inner.trigger_flush();
            }
        }

        Ok(())
    }

    /// Flush until the queue is empty, waiting for any in-flight flush first.
    ///
    /// Returns the number of records persisted by this call. In strict mode a
    /// failed batch is re-prepended to the head of the queue and the error
    /// propagates; in lenient mode the batch is dropped and reported to the
    /// error sink.
    pub async fn flush(&self) -> AuditResult<usize> {
        let guard = self.inner.flush_lock.clone().lock_owned().await;
        self.inner.drain(guard).await
    }

    /// Stop the timer, drain the queue, and refuse further enqueues.
    ///
    /// Idempotent; a repeated call after a strict-mode flush failure retries
    /// the drain.
    pub async fn shutdown(&self) -> AuditResult<()> {
        let inner = &self.inner;

        if !inner.closed.swap(true, Ordering::SeqCst) {
            if let Some(handle) = inner.flusher.lock().expect("flusher lock poisoned").take() {
                handle.abort();
            }
            debug!("Audit writer shutting down");
        }

        if self.queue_size() > 0 {
            self.flush().await?;
        }

        Ok(())
    }

    /// Number of records currently queued.
    pub fn queue_size(&self) -> usize {
        self.inner.queue.lock().expect("queue lock poisoned").len()
    }

    /// Whether a flush is currently writing.
    pub fn is_flushing(&self) -> bool {
        self.inner.flushing.load(Ordering::SeqCst)
    }

    /// Whether the writer has been shut down.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl WriterInner {
    /// Resolve the effective context snapshot for one record.
    ///
    /// `scope_context` already layers writer defaults under the task-scoped
    /// context; this adds the configured extractors and the record's own
    /// metadata (rightmost wins, forbidden keys dropped, empty collapses to
    /// null).
    fn resolve(&self, record: AuditRecord, scope_context: &AuditContext) -> PendingRecord {
        let extracted = self.config.get_metadata.as_ref().and_then(|f| f());
        let metadata = merge_metadata(&[
            extracted.as_ref(),
            scope_context.metadata.as_ref(),
            record.metadata.as_ref(),
        ]);

        let mut context = scope_context.clone();
        if context.user_id.is_none() {
            context.user_id = self.config.get_user_id.as_ref().and_then(|f| f());
        }

        PendingRecord::new(record, &context, metadata)
    }

    /// Trigger a background flush, coalescing when one is already running.
    fn trigger_flush(self: &Arc<Self>) {
        match self.flush_lock.clone().try_lock_owned() {
            Ok(guard) => {
                let inner = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(err) = inner.drain(guard).await {
                        (inner.config.error_sink)(
                            "[AUDIT] failed to persist audit batch",
                            &SanitizedError::from_audit(&err),
                        );
                    }
                });
            }
            Err(_) => {
                self.flush_pending.store(true, Ordering::SeqCst);
            }
        }
    }

    /// Write batches until the queue is empty. Caller holds the flush lock.
    async fn drain(
        &self,
        _guard: tokio::sync::OwnedMutexGuard<()>,
    ) -> AuditResult<usize> {
        self.flushing.store(true, Ordering::SeqCst);
        let result = self.drain_inner().await;
        self.flushing.store(false, Ordering::SeqCst);
        result
    }

    async fn drain_inner(&self) -> AuditResult<usize> {
        let mut written = 0;

        loop {
            let batch: Vec<PendingRecord> = {
                let mut queue = self.queue.lock().expect("queue lock poisoned");
                let take = queue.len().min(self.config.batch_size);
                queue.drain(..take).collect()
            };

            if batch.is_empty() {
                // A trigger may have fired between our last write and the
                // empty check; honor it before releasing the lock.
                if self.flush_pending.swap(false, Ordering::SeqCst) {
                    continue;
                }
                return Ok(written);
            }

            match self.store.insert_batch(&batch).await {
                Ok(()) => {
                    written += batch.len();
                    debug!(count = batch.len(), "Flushed audit batch");
                }
                Err(err) => {
                    if self.config.strict_mode {
                        let mut queue = self.queue.lock().expect("queue lock poisoned");
                        for record in batch.into_iter().rev() {
                            queue.push_front(record);
                        }
                        return Err(AuditError::Database(err));
                    }

                    let dropped = batch.len();
                    let err = AuditError::Database(err);
                    (self.config.error_sink)(
                        "[AUDIT] failed to persist audit batch, records dropped",
                        &SanitizedError::from_audit(&err),
                    );
                    warn!(count = dropped, "Dropped audit batch after write failure");
                }
            }
        }
    }

    /// Periodic flusher. Holds only a weak handle so an abandoned writer can
    /// drop; exits once the writer closes.
    fn spawn_timer(inner: &Arc<Self>) -> JoinHandle<()> {
        let weak = Arc::downgrade(inner);
        let period = inner.config.flush_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                interval.tick().await;

                let Some(inner) = weak.upgrade() else { break };
                if inner.closed.load(Ordering::SeqCst) {
                    break;
                }

                let queued = inner.queue.lock().expect("queue lock poisoned").len();
                if queued > 0 {
                    inner.trigger_flush();
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::AuditAction;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    /// Store double: counts executes, records batch sizes, optionally fails.
    struct RecordingStore {
        executes: AtomicUsize,
        persisted: Mutex<Vec<PendingRecord>>,
        fail: AtomicBool,
        delay: Option<Duration>,
    }

    impl RecordingStore {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                executes: AtomicUsize::new(0),
                persisted: Mutex::new(Vec::new()),
                fail: AtomicBool::new(false),
                delay: None,
            })
        }

        fn with_delay(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                executes: AtomicUsize::new(0),
                persisted: Mutex::new(Vec::new()),
                fail: AtomicBool::new(false),
                delay: Some(delay),
            })
        }

        fn executes(&self) -> usize {
            self.executes.load(Ordering::SeqCst)
        }

        fn persisted_count(&self) -> usize {
            self.persisted.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl AuditStore for RecordingStore {
        async fn insert_batch(&self, records: &[PendingRecord]) -> Result<(), sqlx::Error> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.executes.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(sqlx::Error::Protocol("injected write failure".into()));
            }
            self.persisted.lock().unwrap().extend_from_slice(records);
            Ok(())
        }
    }

    fn record(n: usize) -> AuditRecord {
        AuditRecord::new(AuditAction::Insert, "users", n.to_string())
    }

    fn records(n: usize) -> Vec<AuditRecord> {
        (0..n).map(record).collect()
    }

    fn writer_with(store: Arc<RecordingStore>, config: AuditConfig) -> BatchWriter {
        BatchWriter::new(store, Arc::new(config))
    }

    #[tokio::test]
    async fn test_size_trigger_flushes() {
        let store = RecordingStore::new();
        let writer = writer_with(
            Arc::clone(&store),
            AuditConfig::builder().batch_size(3).wait_for_write(true).build(),
        );

        writer.enqueue(records(3), &AuditContext::new()).await.unwrap();

        assert_eq!(store.executes(), 1);
        assert_eq!(store.persisted_count(), 3);
        assert_eq!(writer.queue_size(), 0);
    }

    #[tokio::test]
    async fn test_below_threshold_waits_for_timer() {
        let store = RecordingStore::new();
        let writer = writer_with(
            Arc::clone(&store),
            AuditConfig::builder()
                .batch_size(10)
                .flush_interval(Duration::from_millis(20))
                .build(),
        );

        writer.enqueue(records(2), &AuditContext::new()).await.unwrap();
        assert_eq!(store.executes(), 0);

        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(store.executes(), 1);
        assert_eq!(store.persisted_count(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_enqueue_during_flush_not_lost() {
        let store = RecordingStore::with_delay(Duration::from_millis(50));
        let writer = writer_with(
            Arc::clone(&store),
            AuditConfig::builder().batch_size(5).build(),
        );

        // Fills the batch and kicks off a slow background flush.
        writer.enqueue(records(5), &AuditContext::new()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(writer.is_flushing());

        // Lands at the tail while the first batch is mid-write.
        writer.enqueue(records(3), &AuditContext::new()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(store.executes(), 2);
        assert_eq!(store.persisted_count(), 8);
        assert_eq!(writer.queue_size(), 0);
    }

    #[tokio::test]
    async fn test_overflow_strict_fails() {
        let store = RecordingStore::new();
        let writer = writer_with(
            Arc::clone(&store),
            AuditConfig::builder()
                .batch_size(2)
                .max_queue_size(2)
                .strict_mode(true)
                .wait_for_write(true)
                .build(),
        );

        let err = writer
            .enqueue(records(3), &AuditContext::new())
            .await
            .unwrap_err();

        assert!(matches!(err, AuditError::QueueOverflow { max: 2, .. }));
        assert_eq!(writer.queue_size(), 0);
    }

    #[tokio::test]
    async fn test_overflow_lenient_drops_excess_and_reports() {
        let reported = Arc::new(AtomicUsize::new(0));
        let reported_clone = Arc::clone(&reported);
        let store = RecordingStore::new();
        let writer = writer_with(
            Arc::clone(&store),
            AuditConfig::builder()
                .batch_size(100)
                .max_queue_size(4)
                .error_sink(move |message, err| {
                    assert!(message.starts_with("[AUDIT]"));
                    assert_eq!(err.name, "QueueOverflow");
                    reported_clone.fetch_add(1, Ordering::SeqCst);
                })
                .build(),
        );

        writer.enqueue(records(6), &AuditContext::new()).await.unwrap();

        assert_eq!(writer.queue_size(), 4);
        assert_eq!(reported.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_strict_write_failure_retains_batch() {
        let store = RecordingStore::new();
        store.fail.store(true, Ordering::SeqCst);
        let writer = writer_with(
            Arc::clone(&store),
            AuditConfig::builder()
                .batch_size(2)
                .strict_mode(true)
                .wait_for_write(true)
                .build(),
        );

        let err = writer
            .enqueue(records(2), &AuditContext::new())
            .await
            .unwrap_err();

        assert!(matches!(err, AuditError::Database(_)));
        assert_eq!(writer.queue_size(), 2);

        // The retained batch persists once the store recovers.
        store.fail.store(false, Ordering::SeqCst);
        let written = writer.flush().await.unwrap();
        assert_eq!(written, 2);
        assert_eq!(writer.queue_size(), 0);
    }

    #[tokio::test]
    async fn test_lenient_write_failure_drops_batch_and_reports() {
        let reported = Arc::new(AtomicUsize::new(0));
        let reported_clone = Arc::clone(&reported);
        let store = RecordingStore::new();
        store.fail.store(true, Ordering::SeqCst);
        let writer = writer_with(
            Arc::clone(&store),
            AuditConfig::builder()
                .batch_size(2)
                .error_sink(move |message, err| {
                    assert!(message.starts_with("[AUDIT]"));
                    assert_eq!(err.name, "WriteFailure");
                    reported_clone.fetch_add(1, Ordering::SeqCst);
                })
                .build(),
        );

        writer.enqueue(records(2), &AuditContext::new()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(writer.queue_size(), 0);
        assert_eq!(reported.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_context_resolution_layers() {
        let store = RecordingStore::new();
        let writer = writer_with(
            Arc::clone(&store),
            AuditConfig::builder()
                .batch_size(1)
                .wait_for_write(true)
                .get_user_id(|| Some("fallback-user".to_string()))
                .get_metadata(|| {
                    let mut m = crate::record::JsonMap::new();
                    m.insert("env".to_string(), serde_json::json!("test"));
                    Some(m)
                })
                .build(),
        );

        // Scope context without user id: the extractor fills it in.
        let mut scoped_meta = crate::record::JsonMap::new();
        scoped_meta.insert("request".to_string(), serde_json::json!("r-1"));
        let scope = AuditContext::new()
            .with_ip_address("10.0.0.9")
            .with_metadata(scoped_meta);

        writer.enqueue(vec![record(1)], &scope).await.unwrap();

        let persisted = store.persisted.lock().unwrap();
        let row = &persisted[0];
        assert_eq!(row.user_id.as_deref(), Some("fallback-user"));
        assert_eq!(row.ip_address.as_deref(), Some("10.0.0.9"));
        let metadata = row.metadata.as_ref().unwrap();
        assert_eq!(metadata["env"], serde_json::json!("test"));
        assert_eq!(metadata["request"], serde_json::json!("r-1"));
    }

    #[tokio::test]
    async fn test_empty_metadata_resolves_to_none() {
        let store = RecordingStore::new();
        let writer = writer_with(
            Arc::clone(&store),
            AuditConfig::builder()
                .batch_size(1)
                .wait_for_write(true)
                .get_metadata(|| Some(crate::record::JsonMap::new()))
                .build(),
        );

        let scope = AuditContext::new().with_metadata(crate::record::JsonMap::new());
        writer.enqueue(vec![record(1)], &scope).await.unwrap();

        let persisted = store.persisted.lock().unwrap();
        assert!(persisted[0].metadata.is_none());
    }

    #[tokio::test]
    async fn test_shutdown_drains_and_rejects_enqueues() {
        let store = RecordingStore::new();
        let writer = writer_with(
            Arc::clone(&store),
            AuditConfig::builder().batch_size(100).build(),
        );

        writer.enqueue(records(3), &AuditContext::new()).await.unwrap();
        writer.shutdown().await.unwrap();

        assert_eq!(store.persisted_count(), 3);
        assert!(writer.is_closed());

        let err = writer
            .enqueue(records(1), &AuditContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AuditError::Closed));

        // Idempotent.
        writer.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_per_table_order_preserved() {
        let store = RecordingStore::new();
        let writer = writer_with(
            Arc::clone(&store),
            AuditConfig::builder().batch_size(2).build(),
        );

        for i in 0..7 {
            writer.enqueue(vec![record(i)], &AuditContext::new()).await.unwrap();
        }
        writer.flush().await.unwrap();

        let persisted = store.persisted.lock().unwrap();
        assert_eq!(persisted.len(), 7);
        for (i, row) in persisted.iter().enumerate() {
            assert_eq!(row.record_id, i.to_string());
        }
    }
}
