//! Sharded, replicated dependency-preparation engine.
//!
//! Each shard owns a disjoint partition of the key space and maintains a
//! replicated log through a raft consensus group. The shard leader batches
//! inbound prepare requests, proposes batches through raft, and on commit
//! every replica emits a signed prepare proof per transaction together with
//! a dependency annotation, so an upstream coordinator can detect conflicts
//! before ordering transactions into blocks.

pub mod error;
pub mod experiment;
pub mod metrics;
pub mod replica;
pub mod router;

pub use error::ShardError;
pub use replica::{
    DependencyMap, PrepareProof, PrepareRequest, ShardConfig, ShardOptions, ShardReplica,
    TransactionDependencyInfo,
};
pub use router::MessageRouter;
