//! Simulated transport between shard replicas.
//!
//! Replaces the wire-level transport in tests and experiments: outbound
//! raft message batches are delivered to their targets with a fixed
//! per-hop latency and a configurable drop probability. Each delivery runs
//! on its own task, so reordering within a source/target pair is possible;
//! the consensus driver tolerates both.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use raft::eraftpb::Message;
use tokio::time;

use crate::error::ShardError;
use crate::metrics;
use crate::replica::ShardReplica;

pub struct MessageRouter {
    nodes: RwLock<HashMap<u64, Arc<ShardReplica>>>,
    latency: Duration,
    loss: f64,
}

impl MessageRouter {
    /// A router with the given per-hop latency and drop probability in
    /// `0.0..=1.0`.
    pub fn new(latency: Duration, loss: f64) -> Self {
        MessageRouter {
            nodes: RwLock::new(HashMap::new()),
            latency,
            loss,
        }
    }

    /// Register a replica and start pumping its outbound message stream
    /// through the router.
    pub fn attach(self: &Arc<Self>, replica: Arc<ShardReplica>) -> Result<(), ShardError> {
        let mut messages = replica.messages().ok_or_else(|| {
            ShardError::InvalidConfig(format!(
                "outbound message stream of replica {} already taken",
                replica.replica_id()
            ))
        })?;
        let id = replica.replica_id();
        self.nodes.write().unwrap().insert(id, replica);

        let router = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(batch) = messages.recv().await {
                router.route(id, batch);
            }
        });
        Ok(())
    }

    /// Remove a replica from the registry; in-flight deliveries to it
    /// complete, later ones are dropped.
    pub fn detach(&self, id: u64) {
        self.nodes.write().unwrap().remove(&id);
    }

    /// Deliver a batch of outbound messages from `from`. Each message is
    /// independently lost, delayed, then stepped into its target.
    pub fn route(self: &Arc<Self>, from: u64, msgs: Vec<Message>) {
        log::trace!("routing {} messages from replica {}", msgs.len(), from);
        for msg in msgs {
            if self.loss > 0.0 && rand::random::<f64>() < self.loss {
                metrics::ROUTED_MESSAGE_COUNTER
                    .with_label_values(&["lost"])
                    .inc();
                continue;
            }

            let target = match self.nodes.read().unwrap().get(&msg.to) {
                Some(node) => Arc::clone(node),
                None => {
                    metrics::ROUTED_MESSAGE_COUNTER
                        .with_label_values(&["unroutable"])
                        .inc();
                    continue;
                }
            };

            let latency = self.latency;
            tokio::spawn(async move {
                if !latency.is_zero() {
                    time::sleep(latency).await;
                }
                if target.step(msg).await.is_ok() {
                    metrics::ROUTED_MESSAGE_COUNTER
                        .with_label_values(&["delivered"])
                        .inc();
                }
            });
        }
    }
}
