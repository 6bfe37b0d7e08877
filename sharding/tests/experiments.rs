//! End-to-end experiment-harness runs: full completion without faults and
//! best-effort completion over a lossy network.

mod common;

use std::time::Duration;

use common::fast_options;
use sharding::experiment::{run_experiment, ExperimentConfig};
use sharding::ShardOptions;

fn harness_options() -> ShardOptions {
    ShardOptions {
        batch_timeout: Duration::from_millis(100),
        ..fast_options()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_single_replica_workload_completes() {
    let report = run_experiment(ExperimentConfig {
        fault_tolerance: 0,
        tx_count: 200,
        client_count: 4,
        dependency_rate: 0.2,
        duration: Duration::from_secs(30),
        loss_probability: 0.0,
        latency: Duration::from_millis(1),
        election_wait: Duration::from_secs(2),
        options: harness_options(),
    })
    .await
    .unwrap();

    assert_eq!(report.committed, 200);
    assert!((report.success_rate - 1.0).abs() < f64::EPSILON);
    assert!(report.throughput > 0.0);
    assert!(report.elapsed <= Duration::from_secs(30));
    assert_eq!(report.latency.len(), 200);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_three_replica_workload_completes() {
    let report = run_experiment(ExperimentConfig {
        fault_tolerance: 1,
        tx_count: 300,
        client_count: 8,
        dependency_rate: 0.3,
        duration: Duration::from_secs(30),
        loss_probability: 0.0,
        latency: Duration::from_millis(1),
        election_wait: Duration::from_secs(2),
        options: harness_options(),
    })
    .await
    .unwrap();

    // Loss-free network and a generous deadline: every accepted
    // transaction eventually shows up on the combined commit stream.
    assert_eq!(report.committed, 300);
    assert!(report.throughput > 0.0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_lossy_network_commits_best_effort() {
    // A proposal forwarded from a follower to the leader is the one message
    // raft does not retransmit; small batches bound how many transactions a
    // single lost forward takes with it.
    let options = ShardOptions {
        max_batch_size: 2,
        ..harness_options()
    };
    let report = run_experiment(ExperimentConfig {
        fault_tolerance: 1,
        tx_count: 1000,
        client_count: 10,
        dependency_rate: 0.0,
        duration: Duration::from_secs(30),
        loss_probability: 0.10,
        latency: Duration::from_millis(1),
        election_wait: Duration::from_secs(2),
        options,
    })
    .await
    .unwrap();

    // Raft retries recover from simulated drops; at least 90% of the
    // workload must commit within the deadline.
    assert!(
        report.committed >= 900,
        "only {} of 1000 transactions committed",
        report.committed
    );
}
