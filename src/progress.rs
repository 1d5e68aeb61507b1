//! Cursor persistence
//!
//! The attester hands its cursor to a [`ProgressSink`] after every batch. The
//! sled-backed store also restores the cursor on startup, so a restart resumes
//! where the last persisted batch ended. Snapshots go through a single
//! [`ProgressWriter`] task so they land in batch order.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::types::AttesterCursor;

const CURSOR_KEY: &[u8] = b"attester_cursor";

#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn persist(&self, cursor: AttesterCursor, success_count: usize) -> Result<()>;
}

/// Last persisted position plus bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub cursor: AttesterCursor,
    /// Successes in the batch that produced this record
    pub last_success_count: usize,
    /// Running total across all persisted batches
    pub total_success_count: u64,
    pub updated_at: DateTime<Utc>,
}

/// Durable cursor store on an embedded sled database
pub struct SledProgressStore {
    db: sled::Db,
    // Held across the read-modify-write of the record
    write_lock: Mutex<()>,
}

impl SledProgressStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let db = sled::open(path)
            .with_context(|| format!("Failed to open progress store at {}", path.display()))?;
        Ok(Self {
            db,
            write_lock: Mutex::new(()),
        })
    }

    pub fn load(&self) -> Result<Option<ProgressRecord>> {
        match self.db.get(CURSOR_KEY)? {
            Some(bytes) => {
                let record = serde_json::from_slice(&bytes).context("Corrupt progress record")?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl ProgressSink for SledProgressStore {
    async fn persist(&self, cursor: AttesterCursor, success_count: usize) -> Result<()> {
        {
            let _guard = self.write_lock.lock();
            let previous_total = self.load()?.map(|r| r.total_success_count).unwrap_or(0);
            let record = ProgressRecord {
                cursor,
                last_success_count: success_count,
                total_success_count: previous_total + success_count as u64,
                updated_at: Utc::now(),
            };
            self.db
                .insert(CURSOR_KEY, serde_json::to_vec(&record)?)
                .context("Failed to write progress record")?;
        }
        self.db
            .flush_async()
            .await
            .context("Failed to flush progress store")?;
        debug!(
            starting_block = cursor.starting_block,
            offset = cursor.offset,
            success_count,
            "Persisted attester cursor"
        );
        Ok(())
    }
}

/// Feeds snapshots to one background task that persists them in order.
///
/// Sending never blocks the attester. Write failures are logged and the
/// next snapshot is still attempted.
pub struct ProgressWriter {
    tx: mpsc::UnboundedSender<(AttesterCursor, usize)>,
}

impl ProgressWriter {
    /// Must be called from within a tokio runtime.
    pub fn spawn(sink: Arc<dyn ProgressSink>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<(AttesterCursor, usize)>();
        tokio::spawn(async move {
            while let Some((cursor, success_count)) = rx.recv().await {
                if let Err(e) = sink.persist(cursor, success_count).await {
                    warn!(error = %format!("{:#}", e), "Failed to persist progress");
                }
            }
            debug!("Progress writer stopped");
        });
        Self { tx }
    }

    pub fn submit(&self, cursor: AttesterCursor, success_count: usize) {
        if self.tx.send((cursor, success_count)).is_err() {
            warn!("Progress writer is gone, dropping snapshot");
        }
    }
}

/// Sink that only logs, for runs without a progress store
pub struct LoggingProgressSink;

#[async_trait]
impl ProgressSink for LoggingProgressSink {
    async fn persist(&self, cursor: AttesterCursor, success_count: usize) -> Result<()> {
        info!(
            starting_block = cursor.starting_block,
            offset = cursor.offset,
            success_count,
            "Attester cursor updated"
        );
        Ok(())
    }
}
