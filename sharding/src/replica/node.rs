#![allow(clippy::field_reassign_with_default)]

//! The shard replica handle and its raft event loop.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use protobuf::Message as PbMessage;
use raft::{prelude::*, StateRole};
use slog::{o, Drain};
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio::sync::watch;
use tokio::time::{self, MissedTickBehavior};

use crate::error::ShardError;
use crate::metrics;
use crate::replica::batch::{self, Batcher, LogPayload, PrepareRequestRecord};
use crate::replica::dependency::DependencyMap;
use crate::replica::proposal::Proposal;
use crate::replica::storage::VolatileStore;
use crate::replica::{
    PrepareProof, PrepareRequest, ShardConfig, ShardOptions, COMMIT_STREAM_CAPACITY,
    ERROR_STREAM_CAPACITY, OUTBOUND_MESSAGE_CAPACITY, PROPOSE_SEND_TIMEOUT,
};

const MAX_SIZE_PER_MSG: u64 = 1024 * 1024;
const MAX_INFLIGHT_MSGS: usize = 256;
const LOGGER_CHANNEL_SIZE: usize = 4096;
const PROPOSAL_CHANNEL_CAPACITY: usize = 100;

/// Deterministic signature token for a prepare proof.
pub fn sign_proof(shard_id: &str, commit_index: u64, tx_id: &str) -> Vec<u8> {
    format!("{}:{}:{}", shard_id, commit_index, tx_id).into_bytes()
}

/// State shared between the replica handle, the raft loop, and the batch
/// timer.
struct Shared {
    dependency_map: DependencyMap,
    batch: Batcher,
    commit_index: AtomicU64,
    leader_id: AtomicU64,
    is_leader: AtomicBool,
    requests_handled: AtomicI64,
}

/// One member of a shard's raft group.
///
/// Owns the channel ends clients talk to; the consensus driver itself lives
/// on the raft-loop task and is reached only through those channels.
pub struct ShardReplica {
    shard_id: String,
    replica_id: u64,
    shared: Arc<Shared>,
    propose_tx: Sender<PrepareRequest>,
    proposal_tx: Sender<Proposal>,
    step_tx: Sender<Message>,
    messages_rx: Mutex<Option<Receiver<Vec<Message>>>>,
    commits_rx: Mutex<Option<Receiver<PrepareProof>>>,
    errors_rx: Mutex<Option<Receiver<ShardError>>>,
    shutdown_tx: watch::Sender<bool>,
    stopped: AtomicBool,
}

impl ShardReplica {
    /// Create a replica with default raft timing.
    pub fn new(
        config: ShardConfig,
        batch_timeout: Duration,
        max_batch_size: usize,
    ) -> Result<Self, ShardError> {
        Self::with_options(
            config,
            ShardOptions {
                batch_timeout,
                max_batch_size,
                ..ShardOptions::default()
            },
        )
    }

    /// Create a replica and start its raft loop and batch timer.
    pub fn with_options(config: ShardConfig, options: ShardOptions) -> Result<Self, ShardError> {
        let peer_count = config.replica_nodes.len() as u64;
        if peer_count == 0 {
            return Err(ShardError::InvalidConfig(
                "replica node list is empty".to_string(),
            ));
        }
        if config.replica_id == 0 || config.replica_id > peer_count {
            return Err(ShardError::InvalidConfig(format!(
                "replica id {} outside 1..={}",
                config.replica_id, peer_count
            )));
        }

        let voters: Vec<u64> = (1..=peer_count).collect();
        let store = VolatileStore::new(voters);

        let cfg = Config {
            id: config.replica_id,
            election_tick: options.election_ticks,
            heartbeat_tick: options.heartbeat_ticks,
            max_size_per_msg: MAX_SIZE_PER_MSG,
            max_inflight_msgs: MAX_INFLIGHT_MSGS,
            ..Default::default()
        };

        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog_async::Async::new(drain)
            .chan_size(LOGGER_CHANNEL_SIZE)
            .overflow_strategy(slog_async::OverflowStrategy::Block)
            .build()
            .fuse();
        let logger =
            slog::Logger::root(drain, o!("tag" => format!("peer_{}", config.replica_id)));

        let raft_group = RawNode::new(&cfg, store.clone(), &logger)?;

        let shared = Arc::new(Shared {
            dependency_map: DependencyMap::new(options.record_expiry),
            batch: Batcher::new(options.max_batch_size),
            commit_index: AtomicU64::new(0),
            leader_id: AtomicU64::new(0),
            is_leader: AtomicBool::new(false),
            requests_handled: AtomicI64::new(0),
        });

        let (propose_tx, propose_rx) = mpsc::channel(options.inbound_capacity);
        let (proposal_tx, proposal_rx) = mpsc::channel(PROPOSAL_CHANNEL_CAPACITY);
        let (step_tx, step_rx) = mpsc::channel(options.inbound_capacity);
        let (out_tx, messages_rx) = mpsc::channel(OUTBOUND_MESSAGE_CAPACITY);
        let (commit_tx, commits_rx) = mpsc::channel(COMMIT_STREAM_CAPACITY);
        let (error_tx, errors_rx) = mpsc::channel(ERROR_STREAM_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let worker = RaftWorker {
            shard_id: config.shard_id.clone(),
            replica_id: config.replica_id,
            raft_group,
            store,
            shared: shared.clone(),
            step_rx,
            propose_rx,
            proposal_rx,
            out_tx,
            commit_tx,
            error_tx,
            shutdown_rx: shutdown_rx.clone(),
            tick_interval: options.tick_interval,
        };
        tokio::spawn(worker.run());

        spawn_batch_timer(
            config.shard_id.clone(),
            shared.clone(),
            proposal_tx.clone(),
            options.batch_timeout,
            shutdown_rx,
        );

        Ok(ShardReplica {
            shard_id: config.shard_id,
            replica_id: config.replica_id,
            shared,
            propose_tx,
            proposal_tx,
            step_tx,
            messages_rx: Mutex::new(Some(messages_rx)),
            commits_rx: Mutex::new(Some(commits_rx)),
            errors_rx: Mutex::new(Some(errors_rx)),
            shutdown_tx,
            stopped: AtomicBool::new(false),
        })
    }

    /// Enqueue a prepare request on the inbound queue. Times out after
    /// 500 ms when the queue is full.
    pub async fn propose(&self, req: PrepareRequest) -> Result<(), ShardError> {
        match self.propose_tx.send_timeout(req, PROPOSE_SEND_TIMEOUT).await {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(ShardError::ProposeTimeout),
            Err(SendTimeoutError::Closed(_)) => Err(ShardError::Stopped),
        }
    }

    /// Deliver an inbound raft message to the consensus driver.
    pub async fn step(&self, msg: Message) -> Result<(), ShardError> {
        self.step_tx.send(msg).await.map_err(|_| ShardError::Stopped)
    }

    /// Propose an abort entry through the log and return the driver's
    /// propose result.
    pub async fn handle_abort(&self, tx_id: &str) -> Result<(), ShardError> {
        let data =
            batch::encode_abort(tx_id).map_err(|e| ShardError::Serialize(e.to_string()))?;
        let (proposal, ack) = Proposal::acked(data);
        self.proposal_tx
            .send(proposal)
            .await
            .map_err(|_| ShardError::Stopped)?;
        ack.await.map_err(|_| ShardError::Stopped)?
    }

    /// Outbound raft message batches. Take-once; `None` if already taken.
    pub fn messages(&self) -> Option<Receiver<Vec<Message>>> {
        self.messages_rx.lock().unwrap().take()
    }

    /// Commit stream of prepare proofs. Take-once; `None` if already taken.
    pub fn commits(&self) -> Option<Receiver<PrepareProof>> {
        self.commits_rx.lock().unwrap().take()
    }

    /// Best-effort error stream. Take-once; `None` if already taken.
    pub fn errors(&self) -> Option<Receiver<ShardError>> {
        self.errors_rx.lock().unwrap().take()
    }

    /// Signal shutdown. Safe to call more than once.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            let _ = self.shutdown_tx.send(true);
        }
    }

    pub fn shard_id(&self) -> &str {
        &self.shard_id
    }

    pub fn replica_id(&self) -> u64 {
        self.replica_id
    }

    /// Leader as last observed by this replica's raft loop.
    pub fn leader_id(&self) -> u64 {
        self.shared.leader_id.load(Ordering::SeqCst)
    }

    pub fn is_leader(&self) -> bool {
        self.shared.is_leader.load(Ordering::SeqCst)
    }

    /// Index of the last applied batch entry.
    pub fn commit_index(&self) -> u64 {
        self.shared.commit_index.load(Ordering::SeqCst)
    }

    pub fn requests_handled(&self) -> i64 {
        self.shared.requests_handled.load(Ordering::SeqCst)
    }

    pub fn dependency_map(&self) -> &DependencyMap {
        &self.shared.dependency_map
    }

    /// Build a handle whose queues have no consumer. Lets tests exercise
    /// the full-queue path without racing the raft loop.
    #[cfg(test)]
    fn detached(
        config: ShardConfig,
        options: ShardOptions,
    ) -> (Self, Receiver<PrepareRequest>) {
        let shared = Arc::new(Shared {
            dependency_map: DependencyMap::new(options.record_expiry),
            batch: Batcher::new(options.max_batch_size),
            commit_index: AtomicU64::new(0),
            leader_id: AtomicU64::new(0),
            is_leader: AtomicBool::new(false),
            requests_handled: AtomicI64::new(0),
        });
        let (propose_tx, propose_rx) = mpsc::channel(options.inbound_capacity);
        let (proposal_tx, _) = mpsc::channel(PROPOSAL_CHANNEL_CAPACITY);
        let (step_tx, _) = mpsc::channel(options.inbound_capacity);
        let (shutdown_tx, _) = watch::channel(false);
        (
            ShardReplica {
                shard_id: config.shard_id,
                replica_id: config.replica_id,
                shared,
                propose_tx,
                proposal_tx,
                step_tx,
                messages_rx: Mutex::new(None),
                commits_rx: Mutex::new(None),
                errors_rx: Mutex::new(None),
                shutdown_tx,
                stopped: AtomicBool::new(false),
            },
            propose_rx,
        )
    }
}

impl Drop for ShardReplica {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_batch_timer(
    shard_id: String,
    shared: Arc<Shared>,
    proposal_tx: Sender<Proposal>,
    batch_timeout: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut ticker = time::interval(batch_timeout);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let Some(pending) = shared.batch.drain() else {
                        continue;
                    };
                    match batch::encode_batch(&pending) {
                        Ok(data) => {
                            if proposal_tx.send(Proposal::background(data)).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            log::error!("failed to serialize batch for shard {}: {}", shard_id, e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => return,
            }
        }
    });
}

/// The raft event loop. Owns the consensus driver; everything reaches it
/// through the worker's channels, so only one ready cycle is ever in
/// flight and the log store sees no concurrent access.
struct RaftWorker {
    shard_id: String,
    replica_id: u64,
    raft_group: RawNode<VolatileStore>,
    store: VolatileStore,
    shared: Arc<Shared>,
    step_rx: Receiver<Message>,
    propose_rx: Receiver<PrepareRequest>,
    proposal_rx: Receiver<Proposal>,
    out_tx: Sender<Vec<Message>>,
    commit_tx: Sender<PrepareProof>,
    error_tx: Sender<ShardError>,
    shutdown_rx: watch::Receiver<bool>,
    tick_interval: Duration,
}

impl RaftWorker {
    async fn run(mut self) {
        let mut ticker = time::interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        'event: loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.raft_group.tick();
                }
                Some(msg) = self.step_rx.recv() => {
                    self.step_message(msg);
                    while let Ok(msg) = self.step_rx.try_recv() {
                        self.step_message(msg);
                    }
                }
                Some(req) = self.propose_rx.recv() => {
                    let pending = self.shared.batch.push(req);
                    if pending >= self.shared.batch.max_batch_size() {
                        self.flush_batch();
                    }
                }
                Some(proposal) = self.proposal_rx.recv() => {
                    self.handle_proposal(proposal);
                }
                _ = self.shutdown_rx.changed() => break,
            }

            // Advancing can expose another ready; drain before sleeping.
            while self.raft_group.has_ready() {
                if !self.on_ready().await {
                    break 'event;
                }
            }
            self.publish_status();
        }

        log::info!(
            "shard {} replica {}: raft loop stopped",
            self.shard_id,
            self.replica_id
        );
    }

    fn step_message(&mut self, msg: Message) {
        if let Err(e) = self.raft_group.step(msg) {
            log::warn!("shard {}: failed to step raft message: {}", self.shard_id, e);
            let _ = self.error_tx.try_send(ShardError::Raft(e));
        }
    }

    fn handle_proposal(&mut self, proposal: Proposal) {
        let result = self.propose_payload(proposal.data);
        if let Some(ack) = proposal.ack {
            let _ = ack.send(result);
        }
    }

    /// Size-triggered flush; the timeout path drains on the timer task and
    /// arrives here pre-encoded through the proposal channel.
    fn flush_batch(&mut self) {
        let Some(pending) = self.shared.batch.drain() else {
            return;
        };
        match batch::encode_batch(&pending) {
            Ok(data) => {
                let _ = self.propose_payload(data);
            }
            Err(e) => {
                log::error!("failed to serialize batch for shard {}: {}", self.shard_id, e);
            }
        }
    }

    fn propose_payload(&mut self, data: Vec<u8>) -> Result<(), ShardError> {
        match self.raft_group.propose(vec![], data) {
            Ok(()) => {
                metrics::PROPOSED_BATCH_COUNTER
                    .with_label_values(&[self.shard_id.as_str()])
                    .inc();
                Ok(())
            }
            Err(e) => {
                log::error!("failed to propose batch for shard {}: {}", self.shard_id, e);
                let err = ShardError::Propose(e.to_string());
                let _ = self.error_tx.try_send(ShardError::Propose(e.to_string()));
                Err(err)
            }
        }
    }

    /// One ready cycle. Returns false when shutdown was observed while
    /// blocked on the outbound message stream.
    async fn on_ready(&mut self) -> bool {
        if !self.raft_group.has_ready() {
            return true;
        }
        let mut ready = self.raft_group.ready();

        // This core never produces a snapshot, but the driver contract
        // requires applying a non-empty one when it shows up.
        if *ready.snapshot() != Snapshot::default() {
            if let Err(e) = self.store.apply_snapshot(ready.snapshot().clone()) {
                log::error!("shard {}: failed to apply snapshot: {}", self.shard_id, e);
            }
        }

        let committed = ready.take_committed_entries();

        if let Err(e) = self.store.append_entries(ready.entries()) {
            log::error!("shard {}: failed to append raft log: {}", self.shard_id, e);
        }
        if let Some(hs) = ready.hs() {
            self.store.set_hardstate(hs.clone());
        }

        if !ready.messages().is_empty() {
            if !self.forward_messages(ready.take_messages()).await {
                return false;
            }
        }
        if !ready.persisted_messages().is_empty() {
            if !self.forward_messages(ready.take_persisted_messages()).await {
                return false;
            }
        }

        self.handle_committed_entries(committed);

        let mut light_rd = self.raft_group.advance(ready);
        if let Some(commit) = light_rd.commit_index() {
            self.store.set_commit(commit);
        }
        if !light_rd.messages().is_empty() {
            if !self.forward_messages(light_rd.take_messages()).await {
                return false;
            }
        }
        self.handle_committed_entries(light_rd.take_committed_entries());
        self.raft_group.advance_apply();

        true
    }

    /// Push a message batch onto the outbound stream. Blocks on
    /// backpressure, yielding only to shutdown.
    async fn forward_messages(&mut self, msgs: Vec<Message>) -> bool {
        tokio::select! {
            res = self.out_tx.send(msgs) => {
                if res.is_err() {
                    log::warn!("shard {}: outbound message stream closed", self.shard_id);
                }
                true
            }
            _ = self.shutdown_rx.changed() => false,
        }
    }

    fn handle_committed_entries(&mut self, entries: Vec<Entry>) {
        for entry in entries {
            if entry.data.is_empty() {
                // Raft appends an empty entry when a leader is elected.
                continue;
            }

            match entry.get_entry_type() {
                EntryType::EntryConfChange => {
                    let mut cc = ConfChange::default();
                    match cc.merge_from_bytes(&entry.data) {
                        Ok(()) => match self.raft_group.apply_conf_change(&cc) {
                            Ok(cs) => self.store.set_conf_state(cs),
                            Err(e) => log::error!(
                                "shard {}: failed to apply conf change: {}",
                                self.shard_id,
                                e
                            ),
                        },
                        Err(e) => log::error!(
                            "shard {}: failed to decode conf change: {}",
                            self.shard_id,
                            e
                        ),
                    }
                }
                _ => self.apply_entry(&entry),
            }
        }
    }

    /// Apply one committed batch entry: decode, then per request evaluate,
    /// prove, update, emit, count.
    fn apply_entry(&mut self, entry: &Entry) {
        self.shared.commit_index.store(entry.index, Ordering::SeqCst);

        let payload = match batch::decode_payload(entry.data.as_ref()) {
            Ok(payload) => payload,
            Err(e) => {
                // The index is still consumed; later entries must keep applying.
                log::error!(
                    "shard {}: failed to decode entry {}: {}",
                    self.shard_id,
                    entry.index,
                    e
                );
                return;
            }
        };

        match payload {
            LogPayload::Batch(prepare_batch) => {
                for req in &prepare_batch.requests {
                    self.apply_request(req, entry.index, entry.term);
                }
            }
            LogPayload::Abort(abort) => {
                // Reserved: removing tentative effects is not wired up yet.
                log::debug!(
                    "shard {}: abort entry for tx {} at index {}",
                    self.shard_id,
                    abort.tx_id,
                    entry.index
                );
            }
        }
    }

    fn apply_request(&mut self, req: &PrepareRequestRecord, index: u64, term: u64) {
        let dependent_tx_id = self
            .shared
            .dependency_map
            .check(&req.read_set, &req.write_set);
        let has_dependency = dependent_tx_id.is_some();
        if let Some(dep) = &dependent_tx_id {
            log::debug!(
                "shard {}: tx {} depends on {}",
                self.shard_id,
                req.tx_id,
                dep
            );
        }

        let proof = PrepareProof {
            tx_id: req.tx_id.clone(),
            shard_id: self.shard_id.clone(),
            commit_index: index,
            leader_id: self.raft_group.raft.leader_id,
            term,
            signature: sign_proof(&self.shard_id, index, &req.tx_id),
            has_dependency,
            dependent_tx_id,
        };

        self.shared
            .dependency_map
            .update(&req.tx_id, &req.write_set, has_dependency);

        match self.commit_tx.try_send(proof) {
            Ok(()) => {
                metrics::EMITTED_PROOF_COUNTER
                    .with_label_values(&[self.shard_id.as_str()])
                    .inc();
                log::debug!(
                    "shard {}: sent proof for tx {} at index {}",
                    self.shard_id,
                    req.tx_id,
                    index
                );
            }
            Err(TrySendError::Full(_)) => {
                metrics::DROPPED_PROOF_COUNTER
                    .with_label_values(&[self.shard_id.as_str()])
                    .inc();
                log::warn!(
                    "commit stream full for shard {}, dropping proof for tx {}",
                    self.shard_id,
                    req.tx_id
                );
            }
            Err(TrySendError::Closed(_)) => {}
        }

        self.shared.requests_handled.fetch_add(1, Ordering::SeqCst);
    }

    fn publish_status(&self) {
        self.shared
            .leader_id
            .store(self.raft_group.raft.leader_id, Ordering::SeqCst);
        self.shared.is_leader.store(
            self.raft_group.raft.state == StateRole::Leader,
            Ordering::SeqCst,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::SystemTime;

    fn request(tx_id: &str) -> PrepareRequest {
        let mut write_set = BTreeMap::new();
        write_set.insert("k".to_string(), b"v".to_vec());
        PrepareRequest {
            tx_id: tx_id.to_string(),
            shard_id: "shard-0".to_string(),
            read_set: BTreeMap::new(),
            write_set,
            timestamp: SystemTime::now(),
        }
    }

    #[test]
    fn test_sign_proof_token() {
        assert_eq!(sign_proof("shard-0", 7, "tx-1"), b"shard-0:7:tx-1".to_vec());
    }

    #[test]
    fn test_invalid_config_is_fatal() {
        let err = ShardReplica::with_options(
            ShardConfig {
                shard_id: "s".to_string(),
                replica_nodes: vec![],
                replica_id: 1,
            },
            ShardOptions::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, ShardError::InvalidConfig(_)));

        let err = ShardReplica::with_options(
            ShardConfig {
                shard_id: "s".to_string(),
                replica_nodes: vec!["node1".to_string()],
                replica_id: 2,
            },
            ShardOptions::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, ShardError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_full_inbound_queue_times_out() {
        let (replica, _propose_rx) = ShardReplica::detached(
            ShardConfig {
                shard_id: "s".to_string(),
                replica_nodes: vec!["node1".to_string()],
                replica_id: 1,
            },
            ShardOptions {
                inbound_capacity: 2,
                ..ShardOptions::default()
            },
        );

        replica.propose(request("tx-1")).await.unwrap();
        replica.propose(request("tx-2")).await.unwrap();

        let started = std::time::Instant::now();
        let err = replica.propose(request("tx-3")).await.err().unwrap();
        assert!(matches!(err, ShardError::ProposeTimeout));
        assert!(started.elapsed() >= Duration::from_millis(400));
    }
}
