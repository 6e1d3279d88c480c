//! On-disk dead-letter queue for batches the store rejected after retry
//! (spec §4.D). One JSON-lines file per logical stream under a
//! `deadletter/` directory; a background loop replays and prunes it.

use crate::error::PlcResult;
use log::{error, warn};
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

pub struct DeadLetterQueue {
    dir: PathBuf,
}

impl DeadLetterQueue {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        DeadLetterQueue { dir: dir.into() }
    }

    fn stream_path(&self, stream: &str) -> PathBuf {
        self.dir.join(format!("{stream}.jsonl"))
    }

    /// Appends a failed batch's rows, one JSON object per line. I/O
    /// failures here are logged and counted, never propagated as a
    /// crash — §4.D forbids the writer taking the terminal down over a
    /// DLQ write failure.
    pub async fn spill<T: Serialize>(&self, stream: &str, rows: &[T]) {
        if let Err(e) = self.try_spill(stream, rows).await {
            error!("failed to write {stream} batch to dead-letter queue: {e}");
        }
    }

    async fn try_spill<T: Serialize>(&self, stream: &str, rows: &[T]) -> PlcResult<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let mut buf = String::new();
        for row in rows {
            buf.push_str(&serde_json::to_string(row)?);
            buf.push('\n');
        }
        let path = self.stream_path(stream);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(buf.as_bytes()).await?;
        Ok(())
    }

    /// Replays every pending stream file by calling `resubmit` on its
    /// rows. `resubmit` returns the rows it could *not* place (empty on
    /// full success); those residual rows overwrite the file, and an
    /// empty residual deletes it. Returning `Err` leaves the file
    /// untouched, for a failure mode that couldn't even tell which rows
    /// landed (e.g. the store itself is unreachable).
    pub async fn replay_all<T, F, Fut>(&self, resubmit: F)
    where
        T: Serialize + DeserializeOwned,
        F: Fn(String, Vec<T>) -> Fut,
        Fut: std::future::Future<Output = PlcResult<Vec<T>>>,
    {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
            Err(e) => {
                warn!("could not scan dead-letter directory {:?}: {e}", self.dir);
                return;
            }
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let Some(stream) = stream_name_from_path(&path) else {
                continue;
            };
            let Ok(contents) = tokio::fs::read_to_string(&path).await else {
                continue;
            };
            let rows: Vec<T> = contents
                .lines()
                .filter_map(|line| serde_json::from_str(line).ok())
                .collect();
            if rows.is_empty() {
                continue;
            }
            match resubmit(stream.clone(), rows).await {
                Ok(residual) if residual.is_empty() => {
                    if let Err(e) = tokio::fs::remove_file(&path).await {
                        warn!("replayed {stream} but could not remove {:?}: {e}", path);
                    }
                }
                Ok(residual) => {
                    warn!(
                        "replay of {stream} partially succeeded, rewriting {} residual row(s)",
                        residual.len()
                    );
                    if let Err(e) = self.rewrite(&path, &residual).await {
                        warn!("could not rewrite residual {stream} dead-letter rows: {e}");
                    }
                }
                Err(e) => {
                    warn!("replay of {stream} dead-letter batch failed, leaving file in place: {e}");
                }
            }
        }
    }

    async fn rewrite<T: Serialize>(&self, path: &Path, rows: &[T]) -> PlcResult<()> {
        let mut buf = String::new();
        for row in rows {
            buf.push_str(&serde_json::to_string(row)?);
            buf.push('\n');
        }
        tokio::fs::write(path, buf).await?;
        Ok(())
    }
}

fn stream_name_from_path(path: &Path) -> Option<String> {
    path.file_stem().map(|s| s.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Serialize, Deserialize, Clone, PartialEq, Debug)]
    struct Row {
        value: i32,
    }

    #[tokio::test]
    async fn spilled_batch_replays_and_clears_file() {
        let dir = std::env::temp_dir().join(format!("aldctl-dlq-test-{}", std::process::id()));
        let _ = tokio::fs::remove_dir_all(&dir).await;
        let dlq = DeadLetterQueue::new(&dir);
        dlq.spill("parameter_value_history", &[Row { value: 1 }, Row { value: 2 }])
            .await;

        let replayed = Arc::new(AtomicUsize::new(0));
        let replayed2 = replayed.clone();
        dlq.replay_all(move |_stream, rows: Vec<Row>| {
            let replayed = replayed2.clone();
            async move {
                replayed.fetch_add(rows.len(), Ordering::SeqCst);
                Ok(Vec::new())
            }
        })
        .await;

        assert_eq!(replayed.load(Ordering::SeqCst), 2);
        assert!(!dir.join("parameter_value_history.jsonl").exists());
    }

    #[tokio::test]
    async fn partially_replayed_batch_rewrites_residual_rows() {
        let dir = std::env::temp_dir().join(format!("aldctl-dlq-partial-test-{}", std::process::id()));
        let _ = tokio::fs::remove_dir_all(&dir).await;
        let dlq = DeadLetterQueue::new(&dir);
        dlq.spill("audit_log", &[Row { value: 1 }, Row { value: 2 }, Row { value: 3 }])
            .await;

        dlq.replay_all(|_stream, rows: Vec<Row>| async move {
            // Pretend only the first row placed; the rest stay pending.
            Ok(rows.into_iter().skip(1).collect())
        })
        .await;

        let contents = tokio::fs::read_to_string(dir.join("audit_log.jsonl")).await.unwrap();
        let residual: Vec<Row> = contents.lines().map(|l| serde_json::from_str(l).unwrap()).collect();
        assert_eq!(residual, vec![Row { value: 2 }, Row { value: 3 }]);
    }
}
