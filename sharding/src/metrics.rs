//! Metrics collection for the sharding engine.
//!
//! Counters are registered into a crate-level Prometheus registry; callers
//! that want exposition gather from [`REGISTRY_INSTANCE`].

use lazy_static::lazy_static;
use prometheus::{CounterVec, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry instance
    pub static ref REGISTRY_INSTANCE: Registry = Registry::new();

    /// Batches proposed to the consensus driver, per shard
    pub static ref PROPOSED_BATCH_COUNTER: CounterVec = CounterVec::new(
        Opts::new("proposed_batches", "batches proposed to raft"),
        &["shard"]
    )
    .unwrap();

    /// Prepare proofs emitted on commit streams, per shard
    pub static ref EMITTED_PROOF_COUNTER: CounterVec = CounterVec::new(
        Opts::new("emitted_proofs", "prepare proofs emitted"),
        &["shard"]
    )
    .unwrap();

    /// Prepare proofs dropped because the commit stream was full, per shard
    pub static ref DROPPED_PROOF_COUNTER: CounterVec = CounterVec::new(
        Opts::new("dropped_proofs", "prepare proofs dropped on full commit stream"),
        &["shard"]
    )
    .unwrap();

    /// Raft messages handled by the router, by outcome
    pub static ref ROUTED_MESSAGE_COUNTER: CounterVec = CounterVec::new(
        Opts::new("routed_messages", "raft messages routed"),
        &["outcome"]
    )
    .unwrap();
}

/// Initializes the metrics registry
///
/// Registers all metric collectors with the global registry
pub fn init_registry() {
    let _ = REGISTRY_INSTANCE.register(Box::new(PROPOSED_BATCH_COUNTER.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(EMITTED_PROOF_COUNTER.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(DROPPED_PROOF_COUNTER.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(ROUTED_MESSAGE_COUNTER.clone()));
}
