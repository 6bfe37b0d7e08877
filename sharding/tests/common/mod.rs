#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use tokio::sync::mpsc::Receiver;
use tokio::time;

use sharding::{
    MessageRouter, PrepareProof, PrepareRequest, ShardConfig, ShardOptions, ShardReplica,
};

/// Replica tunables with sub-second elections so cluster tests stay fast.
pub fn fast_options() -> ShardOptions {
    ShardOptions {
        batch_timeout: Duration::from_millis(50),
        tick_interval: Duration::from_millis(10),
        election_ticks: 20,
        heartbeat_ticks: 2,
        ..ShardOptions::default()
    }
}

pub fn write_request(shard_id: &str, tx_id: &str, key: &str, value: &[u8]) -> PrepareRequest {
    let mut write_set = BTreeMap::new();
    write_set.insert(key.to_string(), value.to_vec());
    PrepareRequest {
        tx_id: tx_id.to_string(),
        shard_id: shard_id.to_string(),
        read_set: BTreeMap::new(),
        write_set,
        timestamp: SystemTime::now(),
    }
}

pub struct Cluster {
    pub replicas: Vec<Arc<ShardReplica>>,
    pub commits: Vec<Receiver<PrepareProof>>,
    pub router: Arc<MessageRouter>,
}

impl Cluster {
    pub fn stop(&self) {
        for replica in &self.replicas {
            replica.stop();
        }
    }
}

/// Build an n-replica cluster wired through the simulated transport.
pub fn build_cluster(
    shard_id: &str,
    n: usize,
    options: ShardOptions,
    latency: Duration,
    loss: f64,
) -> Cluster {
    let replica_nodes: Vec<String> = (1..=n).map(|i| format!("node{}", i)).collect();
    let router = Arc::new(MessageRouter::new(latency, loss));

    let mut replicas = Vec::with_capacity(n);
    let mut commits = Vec::with_capacity(n);
    for i in 0..n {
        let replica = Arc::new(
            ShardReplica::with_options(
                ShardConfig {
                    shard_id: shard_id.to_string(),
                    replica_nodes: replica_nodes.clone(),
                    replica_id: (i + 1) as u64,
                },
                options.clone(),
            )
            .unwrap(),
        );
        commits.push(replica.commits().unwrap());
        router.attach(Arc::clone(&replica)).unwrap();
        replicas.push(replica);
    }

    Cluster {
        replicas,
        commits,
        router,
    }
}

/// Wait until some replica reports itself leader; returns its index.
pub async fn wait_for_leader(replicas: &[Arc<ShardReplica>], timeout: Duration) -> Option<usize> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Some(idx) = replicas.iter().position(|r| r.is_leader()) {
            return Some(idx);
        }
        time::sleep(Duration::from_millis(20)).await;
    }
    None
}

/// Wait until a replica has learned who the leader is. Proposals routed
/// through a follower are forwarded to the leader, but only once the
/// follower knows one; before that the driver drops them.
pub async fn wait_leader_known(replica: &ShardReplica, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if replica.leader_id() != 0 {
            return true;
        }
        time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Drain a commit stream until the given transaction's proof shows up.
pub async fn await_proof(
    commits: &mut Receiver<PrepareProof>,
    tx_id: &str,
    timeout: Duration,
) -> Option<PrepareProof> {
    let deadline = time::sleep(timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            proof = commits.recv() => match proof {
                Some(p) if p.tx_id == tx_id => return Some(p),
                Some(_) => continue,
                None => return None,
            },
            _ = &mut deadline => return None,
        }
    }
}

/// Collect the next `count` proofs from a commit stream.
pub async fn collect_proofs(
    commits: &mut Receiver<PrepareProof>,
    count: usize,
    timeout: Duration,
) -> Vec<PrepareProof> {
    let deadline = time::sleep(timeout);
    tokio::pin!(deadline);
    let mut proofs = Vec::with_capacity(count);

    while proofs.len() < count {
        tokio::select! {
            proof = commits.recv() => match proof {
                Some(p) => proofs.push(p),
                None => break,
            },
            _ = &mut deadline => break,
        }
    }
    proofs
}
