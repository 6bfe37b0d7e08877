use tokio::sync::oneshot::{self, Receiver, Sender};

use crate::error::ShardError;

/// A pre-encoded log-entry payload on its way to the raft loop.
///
/// The optional ack carries the driver's propose result back to the caller;
/// batch flushes are fire-and-forget and leave it empty.
pub(crate) struct Proposal {
    pub data: Vec<u8>,
    pub ack: Option<Sender<Result<(), ShardError>>>,
}

impl Proposal {
    /// Fire-and-forget proposal (batch flushes).
    pub(crate) fn background(data: Vec<u8>) -> Self {
        Proposal { data, ack: None }
    }

    /// Acknowledged proposal; the receiver resolves with the propose result.
    pub(crate) fn acked(data: Vec<u8>) -> (Self, Receiver<Result<(), ShardError>>) {
        let (tx, rx) = oneshot::channel();
        (
            Proposal {
                data,
                ack: Some(tx),
            },
            rx,
        )
    }
}
