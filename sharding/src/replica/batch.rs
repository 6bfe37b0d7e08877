//! Request batching and the log-entry wire format.
//!
//! Inbound prepare requests are coalesced into batches to amortise the
//! per-entry raft overhead; the batch timeout bounds latency under sparse
//! load. A batch is encoded as the opaque payload of a single log entry and
//! must decode to identical content on every replica.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::replica::PrepareRequest;

/// Wire form of one prepare request; timestamps are Unix seconds.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct PrepareRequestRecord {
    pub tx_id: String,
    pub shard_id: String,
    pub read_set: BTreeMap<String, Vec<u8>>,
    pub write_set: BTreeMap<String, Vec<u8>>,
    pub timestamp: i64,
}

/// Ordered batch of prepare requests committed as one log entry.
///
/// The order inside the batch is the order dependencies are evaluated and
/// the map mutated on every replica.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct PrepareRequestBatch {
    pub requests: Vec<PrepareRequestRecord>,
}

/// Request to remove a transaction's tentative effects. Reserved: applying
/// one currently has no dependency-map side effect.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct AbortEntry {
    pub tx_id: String,
    pub timestamp: i64,
}

/// The two payload variants a normal log entry can carry. The serde enum
/// tag keeps them distinguishable at the decoder.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub enum LogPayload {
    Batch(PrepareRequestBatch),
    Abort(AbortEntry),
}

fn unix_seconds(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}

/// Encode a batch for proposal.
pub fn encode_batch(batch: &[PrepareRequest]) -> Result<Vec<u8>, bincode::Error> {
    let records = batch
        .iter()
        .map(|req| PrepareRequestRecord {
            tx_id: req.tx_id.clone(),
            shard_id: req.shard_id.clone(),
            read_set: req.read_set.clone(),
            write_set: req.write_set.clone(),
            timestamp: unix_seconds(req.timestamp),
        })
        .collect();

    bincode::serialize(&LogPayload::Batch(PrepareRequestBatch { requests: records }))
}

/// Encode an abort entry for proposal.
pub fn encode_abort(tx_id: &str) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(&LogPayload::Abort(AbortEntry {
        tx_id: tx_id.to_string(),
        timestamp: unix_seconds(SystemTime::now()),
    }))
}

/// Decode a committed log-entry payload.
pub fn decode_payload(data: &[u8]) -> Result<LogPayload, bincode::Error> {
    bincode::deserialize(data)
}

struct BatchState {
    queue: Vec<PrepareRequest>,
    last_flush: Instant,
}

/// Coalescing buffer for inbound prepare requests.
///
/// The mutex is held only across append and snapshot-and-clear, never
/// across serialization or propose.
pub(crate) struct Batcher {
    state: Mutex<BatchState>,
    max_batch_size: usize,
}

impl Batcher {
    pub(crate) fn new(max_batch_size: usize) -> Self {
        Batcher {
            state: Mutex::new(BatchState {
                queue: Vec::with_capacity(max_batch_size),
                last_flush: Instant::now(),
            }),
            max_batch_size,
        }
    }

    /// Append a request and return the resulting buffer length.
    pub(crate) fn push(&self, req: PrepareRequest) -> usize {
        let mut state = self.state.lock().unwrap();
        state.queue.push(req);
        state.queue.len()
    }

    /// Snapshot-and-clear the buffer. Returns `None` when empty, so an
    /// empty batch is never proposed.
    pub(crate) fn drain(&self) -> Option<Vec<PrepareRequest>> {
        let mut state = self.state.lock().unwrap();
        if state.queue.is_empty() {
            return None;
        }
        let batch = std::mem::replace(&mut state.queue, Vec::with_capacity(self.max_batch_size));
        state.last_flush = Instant::now();
        Some(batch)
    }

    pub(crate) fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// When the buffer last flushed (or when the batcher was created).
    pub(crate) fn last_flush(&self) -> Instant {
        self.state.lock().unwrap().last_flush
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(tx_id: &str, key: &str) -> PrepareRequest {
        let mut write_set = BTreeMap::new();
        write_set.insert(key.to_string(), b"value".to_vec());
        PrepareRequest {
            tx_id: tx_id.to_string(),
            shard_id: "shard-0".to_string(),
            read_set: BTreeMap::new(),
            write_set,
            timestamp: SystemTime::now(),
        }
    }

    #[test]
    fn test_batch_round_trip() {
        let mut req = request("tx-1", "k1");
        req.read_set.insert("r1".to_string(), b"hint".to_vec());
        let batch = vec![req, request("tx-2", "k2")];

        let data = encode_batch(&batch).unwrap();
        let decoded = match decode_payload(&data).unwrap() {
            LogPayload::Batch(b) => b,
            LogPayload::Abort(_) => panic!("decoded batch as abort"),
        };

        assert_eq!(decoded.requests.len(), 2);
        assert_eq!(decoded.requests[0].tx_id, "tx-1");
        assert_eq!(decoded.requests[0].read_set["r1"], b"hint");
        assert_eq!(decoded.requests[1].write_set["k2"], b"value");

        // Same bytes decode to the same content everywhere.
        let again = encode_batch(&batch).unwrap();
        assert_eq!(data, again);
    }

    #[test]
    fn test_abort_is_tag_dispatched() {
        let data = encode_abort("tx-gone").unwrap();
        match decode_payload(&data).unwrap() {
            LogPayload::Abort(abort) => assert_eq!(abort.tx_id, "tx-gone"),
            LogPayload::Batch(_) => panic!("decoded abort as batch"),
        }
    }

    #[test]
    fn test_garbage_payload_is_rejected() {
        assert!(decode_payload(b"\xff\xff\xff\xff not a payload").is_err());
    }

    #[test]
    fn test_drain_empty_buffer_yields_nothing() {
        let batcher = Batcher::new(50);
        assert!(batcher.drain().is_none());
    }

    #[test]
    fn test_push_reports_length_and_drain_clears() {
        let batcher = Batcher::new(3);
        assert_eq!(batcher.push(request("tx-1", "a")), 1);
        assert_eq!(batcher.push(request("tx-2", "b")), 2);
        assert_eq!(batcher.push(request("tx-3", "c")), 3);

        let created = batcher.last_flush();
        let batch = batcher.drain().unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(batch[0].tx_id, "tx-1");
        assert_eq!(batch[2].tx_id, "tx-3");
        assert!(batcher.last_flush() >= created);
        assert!(batcher.drain().is_none());
    }
}
