use thiserror::Error;

/// Errors surfaced by a shard replica.
///
/// Construction errors are fatal; everything else is recoverable and the
/// replica keeps applying the log. Clients that hit a propose failure see
/// no proof and time out upstream.
#[derive(Debug, Error)]
pub enum ShardError {
    /// Invalid cluster spec at construction time.
    #[error("invalid shard config: {0}")]
    InvalidConfig(String),

    /// The consensus driver rejected a proposal (no leader, dropped).
    #[error("propose failed: {0}")]
    Propose(String),

    /// The inbound proposal queue stayed full past the send timeout.
    #[error("propose timed out: inbound queue full")]
    ProposeTimeout,

    /// The replica has been stopped; its channels are closed.
    #[error("replica stopped")]
    Stopped,

    /// Payload serialization failed; the batch was dropped.
    #[error("serialize failed: {0}")]
    Serialize(String),

    /// Error returned by the consensus driver.
    #[error("raft error: {0}")]
    Raft(#[from] raft::Error),
}
