//! Configuration for the experiment driver.
//!
//! Parameters load from a TOML file; a missing or malformed file falls back
//! to the defaults with a warning.

use log::warn;
use serde_derive::Deserialize;

/// Parameters for a batch of experiment runs.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Fault-tolerance levels to sweep; each runs a 2f+1 cluster
    pub fault_tolerance_levels: Vec<usize>,
    /// Transactions per run
    pub tx_count: usize,
    /// Concurrent client tasks
    pub client_count: usize,
    /// Fraction of transactions that write the hot key
    pub dependency_rate: f64,
    /// Deadline per run, seconds
    pub duration_secs: u64,
    /// Simulated network drop probability
    pub loss_probability: f64,
    /// Simulated per-hop latency, milliseconds
    pub latency_ms: u64,
    /// Election grace period before load starts, seconds
    pub election_wait_secs: u64,
}

impl RuntimeConfig {
    /// Creates a RuntimeConfig with default values
    pub fn new() -> Self {
        RuntimeConfig {
            fault_tolerance_levels: vec![0, 1, 2, 3],
            tx_count: 1000,
            client_count: 10,
            dependency_rate: 0.0,
            duration_secs: 10,
            loss_probability: 0.0,
            latency_ms: 5,
            election_wait_secs: 2,
        }
    }

    /// Loads configuration from a TOML file
    ///
    /// Returns the parsed config, or the defaults if the file cannot be
    /// read or parsed.
    pub fn from_toml(path: &str) -> Option<Self> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) => {
                warn!(
                    "Something went wrong reading the runtime config file, {:?}",
                    e
                );
                return Some(RuntimeConfig::new());
            }
        };
        match toml::from_str(&contents) {
            Ok(c) => Some(c),
            Err(e) => {
                warn!(
                    "Something went wrong reading the runtime config file, {:?}",
                    e
                );
                Some(RuntimeConfig::new())
            }
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig::new()
    }
}
