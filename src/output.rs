use chrono::{DateTime, Utc};
use log::trace;
use serde::Serialize;
use std::sync::RwLock;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::{Result, WardenError};

/// Which stream of the child a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputSource {
    Stdout,
    Stderr,
}

/// One line of output from a managed process.
///
/// Immutable once created; used both for live tailing and for retroactive
/// pattern matching by the readiness detector.
#[derive(Debug, Clone, Serialize)]
pub struct OutputRecord {
    /// Unique id for this record
    pub id: Uuid,

    /// Id of the process that produced the line
    pub process_id: String,

    /// The line of text, without its trailing newline
    pub data: String,

    /// Originating stream
    pub source: OutputSource,

    /// When the line was captured
    pub created_at: DateTime<Utc>,

    /// Equal to `created_at`; records are never mutated
    pub updated_at: DateTime<Utc>,
}

impl OutputRecord {
    /// Create a record for a freshly captured line
    pub fn line(process_id: impl Into<String>, data: impl Into<String>, source: OutputSource) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            process_id: process_id.into(),
            data: data.into(),
            source,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Accumulated output of a single managed process.
///
/// Appended to only by the capture tasks of the process that owns it;
/// everyone else reads snapshots. Growth is unbounded by design, the owner
/// can drop the history via [`OutputBuffer::clear`].
#[derive(Debug)]
pub struct OutputBuffer {
    /// Ordered record history
    records: RwLock<Vec<OutputRecord>>,

    /// Live tail subscribers
    tail_tx: broadcast::Sender<OutputRecord>,
}

impl OutputBuffer {
    /// Create a new empty buffer
    pub fn new() -> Self {
        let (tail_tx, _) = broadcast::channel(256);
        Self {
            records: RwLock::new(Vec::new()),
            tail_tx,
        }
    }

    /// Append a record and forward it to any live tail subscribers
    pub fn append(&self, record: OutputRecord) -> Result<()> {
        trace!(
            "[{}] {:?}: {}",
            record.process_id, record.source, record.data
        );

        let mut records = self
            .records
            .write()
            .map_err(|_| WardenError::Internal("Lock poisoned".to_string()))?;
        records.push(record.clone());

        // No subscribers is fine
        let _ = self.tail_tx.send(record);

        Ok(())
    }

    /// Get a snapshot of all records captured so far
    pub fn snapshot(&self) -> Result<Vec<OutputRecord>> {
        let records = self
            .records
            .read()
            .map_err(|_| WardenError::Internal("Lock poisoned".to_string()))?;
        Ok(records.clone())
    }

    /// Number of records captured so far
    pub fn len(&self) -> Result<usize> {
        let records = self
            .records
            .read()
            .map_err(|_| WardenError::Internal("Lock poisoned".to_string()))?;
        Ok(records.len())
    }

    /// Whether the buffer is empty
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Drop the entire history
    pub fn clear(&self) -> Result<()> {
        let mut records = self
            .records
            .write()
            .map_err(|_| WardenError::Internal("Lock poisoned".to_string()))?;
        records.clear();
        Ok(())
    }

    /// Subscribe to records appended from now on
    pub fn tail(&self) -> OutputStream {
        OutputStream {
            rx: self.tail_tx.subscribe(),
        }
    }
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// A lazy, unbounded sequence of output records from one process.
///
/// Ends when the producing process is dropped; a restarted process must be
/// tailed afresh.
pub struct OutputStream {
    rx: broadcast::Receiver<OutputRecord>,
}

impl OutputStream {
    /// Get the next record, or `None` once the producer is gone.
    ///
    /// A slow consumer may miss records; per-stream ordering of the records
    /// it does see is preserved.
    pub async fn next(&mut self) -> Option<OutputRecord> {
        loop {
            match self.rx.recv().await {
                Ok(record) => return Some(record),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
