//! Audit & History Writer (spec §4.D): batches rows for the three
//! logical streams, retries with fixed backoff, and spills to the DLQ
//! on final failure. One writer per terminal; its background flush
//! tasks are tracked so `stop()` can join them per the component
//! lifecycle contract in §4.E.

use super::dlq::DeadLetterQueue;
use super::{AuditRecord, ParameterHistorySample, ProcessDataPoint, Store};
use log::warn;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

const MAX_ROWS_PER_BATCH: usize = 100;
const MAX_BATCH_AGE: Duration = Duration::from_millis(500);
const RETRY_BACKOFFS: [Duration; 3] =
    [Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(4)];

const STREAM_PARAMETER_HISTORY: &str = "parameter_value_history";
const STREAM_PROCESS_DATA_POINTS: &str = "process_data_points";
const STREAM_AUDIT: &str = "parameter_control_commands";

pub struct Writer {
    history_tx: mpsc::UnboundedSender<ParameterHistorySample>,
    data_point_tx: mpsc::UnboundedSender<ProcessDataPoint>,
    audit_tx: mpsc::UnboundedSender<AuditRecord>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

/// Accumulates rows until `MAX_ROWS_PER_BATCH` is hit or
/// `MAX_BATCH_AGE` elapses since the first row in the pending batch.
struct Batch<T> {
    rows: Vec<T>,
    opened_at: Option<Instant>,
}

impl<T> Batch<T> {
    fn new() -> Self {
        Batch {
            rows: Vec::new(),
            opened_at: None,
        }
    }

    fn push(&mut self, row: T) {
        if self.opened_at.is_none() {
            self.opened_at = Some(Instant::now());
        }
        self.rows.push(row);
    }

    fn ready(&self) -> bool {
        self.rows.len() >= MAX_ROWS_PER_BATCH
            || self.opened_at.is_some_and(|t| t.elapsed() >= MAX_BATCH_AGE)
    }

    fn take(&mut self) -> Vec<T> {
        self.opened_at = None;
        std::mem::take(&mut self.rows)
    }
}

impl Writer {
    pub fn start(store: Arc<dyn Store>, dlq: Arc<DeadLetterQueue>, replay_interval: Duration) -> Self {
        let (history_tx, history_rx) = mpsc::unbounded_channel();
        let (data_point_tx, data_point_rx) = mpsc::unbounded_channel();
        let (audit_tx, audit_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut tasks = Vec::new();

        {
            let store = store.clone();
            let dlq = dlq.clone();
            let shutdown_rx = shutdown_rx.clone();
            tasks.push(tokio::spawn(run_history(store, dlq, history_rx, shutdown_rx)));
        }
        {
            let store = store.clone();
            let dlq = dlq.clone();
            let shutdown_rx = shutdown_rx.clone();
            tasks.push(tokio::spawn(run_data_points(store, dlq, data_point_rx, shutdown_rx)));
        }
        {
            let store = store.clone();
            let dlq = dlq.clone();
            let shutdown_rx = shutdown_rx.clone();
            tasks.push(tokio::spawn(run_audit(store, dlq, audit_rx, shutdown_rx)));
        }
        {
            let shutdown_rx = shutdown_rx.clone();
            tasks.push(tokio::spawn(run_dlq_replay(store, dlq, replay_interval, shutdown_rx)));
        }

        Writer {
            history_tx,
            data_point_tx,
            audit_tx,
            shutdown_tx,
            tasks,
        }
    }

    pub fn submit_history(&self, row: ParameterHistorySample) {
        let _ = self.history_tx.send(row);
    }

    pub fn submit_data_point(&self, row: ProcessDataPoint) {
        let _ = self.data_point_tx.send(row);
    }

    pub fn submit_audit(&self, row: AuditRecord) {
        let _ = self.audit_tx.send(row);
    }

    /// Cooperative stop: flushes whatever is buffered and joins every
    /// background flush task before returning.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

macro_rules! batch_loop {
    ($name:ident, $row:ty, $stream:expr, $insert:ident) => {
        async fn $name(
            store: Arc<dyn Store>,
            dlq: Arc<DeadLetterQueue>,
            mut rx: mpsc::UnboundedReceiver<$row>,
            mut shutdown: watch::Receiver<bool>,
        ) {
            let mut batch: Batch<$row> = Batch::new();
            loop {
                let timeout = tokio::time::sleep(MAX_BATCH_AGE);
                tokio::select! {
                    maybe_row = rx.recv() => {
                        match maybe_row {
                            Some(row) => batch.push(row),
                            None => {
                                flush(&store, &dlq, batch.take()).await;
                                return;
                            }
                        }
                    }
                    _ = timeout => {}
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            flush(&store, &dlq, batch.take()).await;
                            return;
                        }
                    }
                }
                if batch.ready() {
                    flush(&store, &dlq, batch.take()).await;
                }
            }

            async fn flush(store: &Arc<dyn Store>, dlq: &Arc<DeadLetterQueue>, rows: Vec<$row>) {
                if rows.is_empty() {
                    return;
                }
                for (attempt, backoff) in RETRY_BACKOFFS.iter().enumerate() {
                    match store.$insert(&rows).await {
                        Ok(()) => return,
                        Err(e) => {
                            warn!(
                                "{} batch of {} rows failed (attempt {}/{}): {e}",
                                $stream,
                                rows.len(),
                                attempt + 1,
                                RETRY_BACKOFFS.len()
                            );
                            if attempt + 1 < RETRY_BACKOFFS.len() {
                                tokio::time::sleep(*backoff).await;
                            }
                        }
                    }
                }
                warn!(
                    "{} batch of {} rows exhausted retries, spilling to dead-letter queue",
                    $stream,
                    rows.len()
                );
                dlq.spill($stream, &rows).await;
            }
        }
    };
}

batch_loop!(run_history, ParameterHistorySample, STREAM_PARAMETER_HISTORY, insert_parameter_history_batch);
batch_loop!(run_data_points, ProcessDataPoint, STREAM_PROCESS_DATA_POINTS, insert_process_data_point_batch);

/// Audit records are inserted one at a time (the table *is* the audit
/// trail — spec §4.G), but still flow through batching/backoff/DLQ so a
/// store outage doesn't lose them either.
async fn run_audit(
    store: Arc<dyn Store>,
    dlq: Arc<DeadLetterQueue>,
    mut rx: mpsc::UnboundedReceiver<AuditRecord>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            maybe_row = rx.recv() => {
                match maybe_row {
                    Some(row) => insert_audit_with_retry(&store, &dlq, row).await,
                    None => return,
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

async fn insert_audit_with_retry(store: &Arc<dyn Store>, dlq: &Arc<DeadLetterQueue>, row: AuditRecord) {
    for (attempt, backoff) in RETRY_BACKOFFS.iter().enumerate() {
        match store.insert_audit_record(&row).await {
            Ok(()) => return,
            Err(e) => {
                warn!(
                    "{} row failed (attempt {}/{}): {e}",
                    STREAM_AUDIT,
                    attempt + 1,
                    RETRY_BACKOFFS.len()
                );
                if attempt + 1 < RETRY_BACKOFFS.len() {
                    tokio::time::sleep(*backoff).await;
                }
            }
        }
    }
    warn!("{} row exhausted retries, spilling to dead-letter queue", STREAM_AUDIT);
    dlq.spill(STREAM_AUDIT, &[row]).await;
}

/// Background recovery loop (spec §4.D): every `replay_interval`, scans
/// `deadletter/` and resubmits each stream's pending rows. Each call to
/// `replay_all` only matches files whose rows deserialize as that
/// stream's row type; a stream's own file on a non-matching attempt
/// deserializes to an empty batch and is left untouched.
async fn run_dlq_replay(
    store: Arc<dyn Store>,
    dlq: Arc<DeadLetterQueue>,
    replay_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(replay_interval) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }

        // These batch inserts are all-or-nothing, so a failure's residual
        // is the whole batch; that degenerates to the old leave-the-file
        // behavior, but goes through the same residual-rewrite path.
        let store_for_history = store.clone();
        dlq.replay_all(move |_stream, rows: Vec<ParameterHistorySample>| {
            let store = store_for_history.clone();
            async move {
                match store.insert_parameter_history_batch(&rows).await {
                    Ok(()) => Ok(Vec::new()),
                    Err(_) => Ok(rows),
                }
            }
        })
        .await;

        let store_for_process = store.clone();
        dlq.replay_all(move |_stream, rows: Vec<ProcessDataPoint>| {
            let store = store_for_process.clone();
            async move {
                match store.insert_process_data_point_batch(&rows).await {
                    Ok(()) => Ok(Vec::new()),
                    Err(_) => Ok(rows),
                }
            }
        })
        .await;

        // Audit rows insert one at a time; a failure partway through
        // leaves the still-unplaced rows (the failed one and everything
        // after it) as the residual to rewrite, rather than discarding
        // the rows that already succeeded.
        let store_for_audit = store.clone();
        dlq.replay_all(move |_stream, rows: Vec<AuditRecord>| {
            let store = store_for_audit.clone();
            async move {
                let mut rows = rows.into_iter();
                for row in rows.by_ref() {
                    if store.insert_audit_record(&row).await.is_err() {
                        let mut residual = vec![row];
                        residual.extend(rows);
                        return Ok(residual);
                    }
                }
                Ok(Vec::new())
            }
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MockStore;
    use chrono::Utc;

    #[tokio::test]
    async fn history_rows_flush_on_stop() {
        let mock = Arc::new(MockStore::new());
        let store: Arc<dyn Store> = mock.clone();
        let dlq = Arc::new(DeadLetterQueue::new(std::env::temp_dir().join(format!(
            "aldctl-writer-test-{}",
            std::process::id()
        ))));
        let writer = Writer::start(store, dlq, Duration::from_secs(60));
        writer.submit_history(ParameterHistorySample {
            parameter_id: 1,
            value: 42.0,
            timestamp: Utc::now(),
            machine_id: "m1".into(),
        });
        writer.stop().await;

        assert_eq!(mock.parameter_history().len(), 1);
    }
}
