//! Experiment driver for the sharded prepare engine.
//!
//! Sweeps the configured fault-tolerance levels, running one in-process
//! cluster per level, and prints throughput, success rate, and latency
//! percentiles, followed by a dump of the collected metrics.

mod config;

use std::time::Duration;

use clap::Parser;
use prometheus::{Encoder, TextEncoder};
use sharding::experiment::{run_experiment, ExperimentConfig};
use sharding::metrics;

/// Command line arguments for the driver
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short = 'c', long = "config", default_value_t = String::from("./config/benchmark.toml"))]
    config: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::try_init().unwrap_or_default();
    let args = Args::parse();
    let runtime = config::RuntimeConfig::from_toml(&args.config).expect("config is missing");

    metrics::init_registry();

    println!("Starting sharded prepare experiments");
    println!("====================================");

    for f in &runtime.fault_tolerance_levels {
        let report = run_experiment(ExperimentConfig {
            fault_tolerance: *f,
            tx_count: runtime.tx_count,
            client_count: runtime.client_count,
            dependency_rate: runtime.dependency_rate,
            duration: Duration::from_secs(runtime.duration_secs),
            loss_probability: runtime.loss_probability,
            latency: Duration::from_millis(runtime.latency_ms),
            election_wait: Duration::from_secs(runtime.election_wait_secs),
            options: ExperimentConfig::default().options,
        })
        .await?;

        println!(
            "Config: f={}, Txs={}, Clients={}, Dep={:.2} -> Throughput: {:.2} tx/s, Success: {:.2}%",
            f,
            report.tx_count,
            runtime.client_count,
            runtime.dependency_rate,
            report.throughput,
            report.success_rate * 100.0
        );
        println!("Latency distribution (microseconds):");
        println!("p50: {}", report.latency.value_at_percentile(50.0));
        println!("p90: {}", report.latency.value_at_percentile(90.0));
        println!("p95: {}", report.latency.value_at_percentile(95.0));
        println!("p99: {}", report.latency.value_at_percentile(99.0));
        println!("p99.9: {}", report.latency.value_at_percentile(99.9));
    }

    let encoder = TextEncoder::new();
    let metric_families = metrics::REGISTRY_INSTANCE.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    println!("\n{}", String::from_utf8_lossy(&buffer));

    Ok(())
}
