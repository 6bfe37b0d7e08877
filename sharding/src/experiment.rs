//! Experiment harness: builds a cluster of N = 2f+1 replicas wired through
//! the simulated transport, drives load from concurrent clients with a
//! configured hot-key contention rate, and measures committed throughput.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use hdrhistogram::Histogram;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::time;

use crate::error::ShardError;
use crate::replica::{PrepareRequest, ShardConfig, ShardOptions, ShardReplica};
use crate::router::MessageRouter;

/// Key deliberately shared across transactions to induce contention.
pub const HOT_KEY: &str = "hot-key";
const NORMAL_KEY_PREFIX: &str = "key-";
const EXPERIMENT_SHARD_ID: &str = "experiment-shard";
const COLLECTOR_CAPACITY: usize = 10000;

/// Parameters for one experiment run.
#[derive(Debug, Clone)]
pub struct ExperimentConfig {
    /// f; the cluster has 2f+1 replicas
    pub fault_tolerance: usize,
    /// Total transactions to push through the shard
    pub tx_count: usize,
    /// Concurrent client tasks draining the shared workload
    pub client_count: usize,
    /// Probability that a transaction writes the hot key
    pub dependency_rate: f64,
    /// Wall-clock deadline for the run
    pub duration: Duration,
    /// Per-message drop probability in the simulated network
    pub loss_probability: f64,
    /// Per-hop delivery latency
    pub latency: Duration,
    /// Grace period for leader election before load starts
    pub election_wait: Duration,
    /// Replica tunables (the harness default shortens the batch timeout)
    pub options: ShardOptions,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        ExperimentConfig {
            fault_tolerance: 1,
            tx_count: 1000,
            client_count: 10,
            dependency_rate: 0.0,
            duration: Duration::from_secs(10),
            loss_probability: 0.0,
            latency: Duration::from_millis(5),
            election_wait: Duration::from_secs(2),
            options: ShardOptions {
                batch_timeout: Duration::from_millis(100),
                ..ShardOptions::default()
            },
        }
    }
}

/// Outcome of one experiment run.
pub struct ExperimentReport {
    /// Unique transactions observed on the combined commit stream
    pub committed: usize,
    pub tx_count: usize,
    /// Run time, capped at the configured deadline
    pub elapsed: Duration,
    /// Unique commits per second
    pub throughput: f64,
    /// committed / tx_count
    pub success_rate: f64,
    /// Submit-to-first-proof latency, microseconds
    pub latency: Histogram<u64>,
}

/// Run one experiment to completion or deadline.
pub async fn run_experiment(config: ExperimentConfig) -> Result<ExperimentReport, ShardError> {
    let f = config.fault_tolerance;
    let n = 2 * f + 1;

    let replica_nodes: Vec<String> = (1..=n).map(|i| format!("node{}", i)).collect();
    let router = Arc::new(MessageRouter::new(config.latency, config.loss_probability));

    // A collector multiplexes every replica's commit stream into one
    // channel; a tx counts once globally on first observation.
    let (collector_tx, mut all_commits) = mpsc::channel(COLLECTOR_CAPACITY);

    let mut replicas = Vec::with_capacity(n);
    for i in 0..n {
        let shard_config = ShardConfig {
            shard_id: EXPERIMENT_SHARD_ID.to_string(),
            replica_nodes: replica_nodes.clone(),
            replica_id: (i + 1) as u64,
        };
        let replica = Arc::new(ShardReplica::with_options(
            shard_config,
            config.options.clone(),
        )?);

        let mut commits = replica.commits().ok_or_else(|| {
            ShardError::InvalidConfig("commit stream already taken".to_string())
        })?;
        let collector = collector_tx.clone();
        tokio::spawn(async move {
            while let Some(proof) = commits.recv().await {
                if collector.send(proof).await.is_err() {
                    return;
                }
            }
        });

        router.attach(Arc::clone(&replica))?;
        replicas.push(replica);
    }
    drop(collector_tx);

    time::sleep(config.election_wait).await;

    let start = Instant::now();
    let submit_times: Arc<Mutex<HashMap<String, Instant>>> =
        Arc::new(Mutex::new(HashMap::new()));
    let cursor = Arc::new(AtomicUsize::new(0));

    let mut clients = Vec::with_capacity(config.client_count);
    for _ in 0..config.client_count {
        let replicas = replicas.clone();
        let cursor = Arc::clone(&cursor);
        let submit_times = Arc::clone(&submit_times);
        let tx_count = config.tx_count;
        let dependency_rate = config.dependency_rate;

        clients.push(tokio::spawn(async move {
            loop {
                let i = cursor.fetch_add(1, Ordering::SeqCst);
                if i >= tx_count {
                    return;
                }

                let (node, is_dependent) = {
                    let mut rng = rand::thread_rng();
                    (
                        rng.gen_range(0..replicas.len()),
                        rng.gen::<f64>() < dependency_rate,
                    )
                };
                let key = if is_dependent {
                    HOT_KEY.to_string()
                } else {
                    format!("{}{}", NORMAL_KEY_PREFIX, i)
                };

                let tx_id = format!("tx-{}-{}", f, i);
                let mut write_set = BTreeMap::new();
                write_set.insert(key, b"value".to_vec());
                let req = PrepareRequest {
                    tx_id: tx_id.clone(),
                    shard_id: EXPERIMENT_SHARD_ID.to_string(),
                    read_set: BTreeMap::new(),
                    write_set,
                    timestamp: SystemTime::now(),
                };

                submit_times.lock().unwrap().insert(tx_id, Instant::now());
                // A full inbound queue times the send out; the request is
                // simply lost and shows up as a missing commit.
                let _ = replicas[node].propose(req).await;
            }
        }));
    }

    let mut committed: HashSet<String> = HashSet::with_capacity(config.tx_count);
    let mut latency = Histogram::<u64>::new(3).unwrap();

    let deadline = time::sleep(config.duration);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            Some(proof) = all_commits.recv() => {
                if committed.insert(proof.tx_id.clone()) {
                    if let Some(submitted) = submit_times.lock().unwrap().remove(&proof.tx_id) {
                        let _ = latency.record(submitted.elapsed().as_micros() as u64);
                    }
                }
                if committed.len() >= config.tx_count {
                    break;
                }
            }
            _ = &mut deadline => break,
        }
    }

    let mut elapsed = start.elapsed();
    if elapsed > config.duration {
        elapsed = config.duration;
    }

    for client in clients {
        client.abort();
    }
    for replica in &replicas {
        replica.stop();
    }

    let committed_count = committed.len();
    Ok(ExperimentReport {
        committed: committed_count,
        tx_count: config.tx_count,
        elapsed,
        throughput: committed_count as f64 / elapsed.as_secs_f64(),
        success_rate: committed_count as f64 / config.tx_count as f64,
        latency,
    })
}
