//! Shard replica: one member of a shard's raft group.
//!
//! The replica runs the consensus loop, batches inbound prepare requests,
//! applies committed batches against the dependency map, and emits a signed
//! prepare proof per request on its commit stream.

mod batch;
mod dependency;
mod node;
mod proposal;
mod storage;

pub use batch::{AbortEntry, LogPayload, PrepareRequestBatch, PrepareRequestRecord};
pub use dependency::{DependencyMap, TransactionDependencyInfo};
pub use node::{sign_proof, ShardReplica};
pub use storage::VolatileStore;

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

pub const DEFAULT_BATCH_MAX_SIZE: usize = 50;
pub const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_millis(300);
pub const DEFAULT_EXPIRY_DURATION: Duration = Duration::from_secs(300);

/// One logical raft tick of wall time.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_ELECTION_TICKS: usize = 50;
pub const DEFAULT_HEARTBEAT_TICKS: usize = 5;

pub(crate) const INBOUND_QUEUE_CAPACITY: usize = 1000;
pub(crate) const OUTBOUND_MESSAGE_CAPACITY: usize = 100;
pub(crate) const COMMIT_STREAM_CAPACITY: usize = 1000;
pub(crate) const ERROR_STREAM_CAPACITY: usize = 10;
pub(crate) const PROPOSE_SEND_TIMEOUT: Duration = Duration::from_millis(500);

/// Configuration for one shard replica.
#[derive(Debug, Clone)]
pub struct ShardConfig {
    /// Shard owning this partition of the key space
    pub shard_id: String,
    /// All members of the raft group; replica IDs are their 1-based positions
    pub replica_nodes: Vec<String>,
    /// This replica's ID, in `1..=replica_nodes.len()`
    pub replica_id: u64,
}

/// Tunables for a shard replica. Defaults match the production settings;
/// tests shrink the tick interval to keep elections sub-second.
#[derive(Debug, Clone)]
pub struct ShardOptions {
    pub batch_timeout: Duration,
    pub max_batch_size: usize,
    pub tick_interval: Duration,
    pub election_ticks: usize,
    pub heartbeat_ticks: usize,
    pub record_expiry: Duration,
    pub inbound_capacity: usize,
}

impl Default for ShardOptions {
    fn default() -> Self {
        ShardOptions {
            batch_timeout: DEFAULT_BATCH_TIMEOUT,
            max_batch_size: DEFAULT_BATCH_MAX_SIZE,
            tick_interval: DEFAULT_TICK_INTERVAL,
            election_ticks: DEFAULT_ELECTION_TICKS,
            heartbeat_ticks: DEFAULT_HEARTBEAT_TICKS,
            record_expiry: DEFAULT_EXPIRY_DURATION,
            inbound_capacity: INBOUND_QUEUE_CAPACITY,
        }
    }
}

/// A tentative transaction footprint submitted for dependency preparation.
#[derive(Debug, Clone)]
pub struct PrepareRequest {
    /// Unique per submission
    pub tx_id: String,
    pub shard_id: String,
    /// Key to value-hint
    pub read_set: BTreeMap<String, Vec<u8>>,
    /// Key to tentative value
    pub write_set: BTreeMap<String, Vec<u8>>,
    pub timestamp: SystemTime,
}

/// Commit receipt for one prepared transaction, emitted once per request
/// per replica on its commit stream.
#[derive(Debug, Clone)]
pub struct PrepareProof {
    pub tx_id: String,
    pub shard_id: String,
    /// Log index of the containing batch; identical for all requests in it
    pub commit_index: u64,
    /// Leader at apply time on this replica; may differ between replicas if
    /// leadership changed mid-apply
    pub leader_id: u64,
    pub term: u64,
    pub signature: Vec<u8>,
    /// Whether the transaction conflicts with a prior in-flight transaction
    pub has_dependency: bool,
    /// The conflicting writer, when `has_dependency` is set
    pub dependent_tx_id: Option<String>,
}
