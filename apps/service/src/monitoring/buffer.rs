use std::mem;

use anyhow::Result;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::types::ProbeResult;
use crate::database::Database;

/// Probe results waiting to be written.
///
/// Every monitor loop appends here; a flush timer swaps the contents out and
/// writes them as one batch. The lock is only held for the append or the swap,
/// never across storage I/O.
#[derive(Debug, Default)]
pub struct WriteBuffer {
    pending: Mutex<Vec<ProbeResult>>,
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&self, results: impl IntoIterator<Item = ProbeResult>) {
        self.pending.lock().extend(results);
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Take everything currently buffered
    pub fn take(&self) -> Vec<ProbeResult> {
        mem::take(&mut *self.pending.lock())
    }

    /// Put a batch that failed to persist back in front of newer results
    fn restore(&self, mut batch: Vec<ProbeResult>) {
        let mut pending = self.pending.lock();
        batch.append(&mut pending);
        *pending = batch;
    }

    /// Write all buffered results in one batch. An empty buffer is a no-op.
    ///
    /// On failure the batch is returned to the buffer so the next flush
    /// retries it.
    pub async fn flush(&self, database: &dyn Database) -> Result<usize> {
        let batch = self.take();
        if batch.is_empty() {
            return Ok(0);
        }

        match database.insert_probe_results(&batch).await {
            Ok(written) => {
                debug!("Flushed {} probe results", written);
                Ok(written)
            }
            Err(e) => {
                warn!("Failed to flush {} probe results, keeping them for retry: {:#}", batch.len(), e);
                self.restore(batch);
                Err(e)
            }
        }
    }
}
