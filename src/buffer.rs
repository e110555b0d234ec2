//! # Batched Write Buffer
//!
//! Queues pending records per destination and writes them through the store
//! in bounded batches, smoothing many small updates into few `batch_save`
//! calls. Pending entries are idempotent by record key: re-enqueueing a key
//! replaces the earlier payload in place.

use hashbrown::HashMap;
use tracing::debug;

use crate::error::Result;
use crate::model::CanonicalRecord;
use crate::store::RecordStore;

#[derive(Debug, Clone, Default)]
struct PendingQueue {
    records: Vec<CanonicalRecord>,
    by_key: HashMap<String, usize>,
}

impl PendingQueue {
    fn push(&mut self, record: CanonicalRecord) {
        match self.by_key.get(&record.key) {
            Some(&index) => self.records[index] = record,
            None => {
                self.by_key.insert(record.key.clone(), self.records.len());
                self.records.push(record);
            }
        }
    }

    fn drain(&mut self) -> Vec<CanonicalRecord> {
        self.by_key.clear();
        std::mem::take(&mut self.records)
    }
}

/// Per-destination write-back buffer with a bounded batch size.
#[derive(Debug, Clone)]
pub struct WriteBuffer {
    max_batch: usize,
    pending: HashMap<String, PendingQueue>,
}

impl WriteBuffer {
    /// Create a buffer whose flushes never exceed `max_batch` records per
    /// store call.
    pub fn new(max_batch: usize) -> Self {
        Self {
            max_batch: max_batch.max(1),
            pending: HashMap::new(),
        }
    }

    /// Queue one record for a destination.
    pub fn enqueue(&mut self, destination: &str, record: CanonicalRecord) {
        self.pending
            .entry(destination.to_string())
            .or_default()
            .push(record);
    }

    /// Queue a sequence of records for a destination.
    pub fn enqueue_all<I>(&mut self, destination: &str, records: I)
    where
        I: IntoIterator<Item = CanonicalRecord>,
    {
        let queue = self.pending.entry(destination.to_string()).or_default();
        for record in records {
            queue.push(record);
        }
    }

    /// Queue a pre-serialized JSON record payload.
    pub fn enqueue_payload(&mut self, destination: &str, payload: &str) -> Result<()> {
        let record: CanonicalRecord = serde_json::from_str(payload)
            .map_err(|e| crate::error::EngineError::Validation(format!("undecodable record payload: {e}")))?;
        self.enqueue(destination, record);
        Ok(())
    }

    /// Number of records pending for a destination.
    pub fn pending_len(&self, destination: &str) -> usize {
        self.pending
            .get(destination)
            .map(|q| q.records.len())
            .unwrap_or(0)
    }

    /// Write a destination's pending records through the store.
    ///
    /// Pending records are only written when `force` is set; an unforced
    /// flush leaves them accumulating, which is what turns many small
    /// updates into few store calls. A forced flush drains the queue in
    /// chunks of at most `max_batch` records, oldest first; no single store
    /// call exceeds the limit. Returns the number of records written.
    pub fn flush(
        &mut self,
        store: &mut dyn RecordStore,
        destination: &str,
        force: bool,
    ) -> Result<usize> {
        let Some(queue) = self.pending.get_mut(destination) else {
            return Ok(0);
        };
        if queue.records.is_empty() {
            return Ok(0);
        }
        if !force {
            debug!(
                destination,
                pending = queue.records.len(),
                "flush deferred until forced"
            );
            return Ok(0);
        }

        let records = queue.drain();
        let written = records.len();
        let mut chunks = records.into_iter().peekable();
        let mut batch = Vec::with_capacity(self.max_batch.min(written));
        while let Some(record) = chunks.next() {
            batch.push(record);
            if batch.len() == self.max_batch || chunks.peek().is_none() {
                store.batch_save(destination, std::mem::take(&mut batch))?;
            }
        }
        debug!(destination, written, "flushed write buffer");
        Ok(written)
    }

    /// Force-flush every destination with pending records.
    pub fn flush_all(&mut self, store: &mut dyn RecordStore) -> Result<usize> {
        let destinations: Vec<String> = self.pending.keys().cloned().collect();
        let mut written = 0;
        for destination in destinations {
            written += self.flush(store, &destination, true)?;
        }
        Ok(written)
    }
}
