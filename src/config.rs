use anyhow::Context;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::indexer::IndexerConfig;
use crate::sink::SinkConfig;

/// Above this many concurrent leeches the process may run out of file
/// descriptors on default limits.
pub const LEECH_FD_WARN: usize = 1000;

#[derive(Clone, Debug)]
pub struct Config {
    pub data_dir: PathBuf,

    // Indexer
    pub indexer_addrs: Vec<SocketAddr>,
    pub indexer_interval_ms: u64,
    pub indexer_max_neighbors: usize,
    pub indexer_bootstrap: Vec<String>,
    pub indexer_output_capacity: usize,

    // Leech
    pub leech_max_n: usize,
    pub leech_session_timeout_secs: u64,
    pub leech_fetch_timeout_secs: u64,
    pub leech_max_metadata_bytes: usize,

    pub shutdown_grace_ms: u64,
    pub verbosity: u8,
}

type Lookup<'a> = &'a dyn Fn(&str) -> Option<String>;

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        // If a .env file exists, load it. If not, keep going.
        // Precedence: process env > .env > code defaults.
        let _ = dotenvy::dotenv();
        Self::from_lookup(&|name: &str| std::env::var(name).ok())
    }

    fn from_lookup(env: Lookup<'_>) -> anyhow::Result<Self> {
        let data_dir = PathBuf::from(env_string(env, "TRAWLER_DATA_DIR", "data"));

        let indexer_addrs = parse_socket_addrs(&env_csv_strings(env, "TRAWLER_INDEXER_ADDRS", &["0.0.0.0:0"]))
            .context("parse TRAWLER_INDEXER_ADDRS")?;
        let indexer_interval_ms = env_u64(env, "TRAWLER_INDEXER_INTERVAL_MS", 1000).max(1);
        let indexer_max_neighbors = env_usize(env, "TRAWLER_INDEXER_MAX_NEIGHBORS", 1000).max(1);
        let indexer_bootstrap = env_csv_strings(
            env,
            "TRAWLER_INDEXER_BOOTSTRAP",
            &[
                "router.bittorrent.com:6881",
                "dht.transmissionbt.com:6881",
                "router.utorrent.com:6881",
            ],
        );
        let indexer_output_capacity = env_usize(env, "TRAWLER_INDEXER_OUTPUT_CAPACITY", 4096).max(1);

        let leech_max_n = env_usize(env, "TRAWLER_LEECH_MAX_N", 50).max(1);
        let leech_session_timeout_secs = env_u64(env, "TRAWLER_LEECH_SESSION_TIMEOUT_SECS", 5).max(1);
        let leech_fetch_timeout_secs = env_u64(env, "TRAWLER_LEECH_FETCH_TIMEOUT_SECS", 20).max(1);
        let leech_max_metadata_bytes = env_usize(env, "TRAWLER_LEECH_MAX_METADATA_BYTES", 10 * 1024 * 1024);

        let shutdown_grace_ms = env_u64(env, "TRAWLER_SHUTDOWN_GRACE_MS", 2000);
        let verbosity = env_u8(env, "TRAWLER_VERBOSITY", 1);

        Ok(Self {
            data_dir,

            indexer_addrs,
            indexer_interval_ms,
            indexer_max_neighbors,
            indexer_bootstrap,
            indexer_output_capacity,

            leech_max_n,
            leech_session_timeout_secs,
            leech_fetch_timeout_secs,
            leech_max_metadata_bytes,

            shutdown_grace_ms,
            verbosity,
        })
    }

    pub fn indexer(&self) -> IndexerConfig {
        IndexerConfig {
            interval: Duration::from_millis(self.indexer_interval_ms),
            max_neighbors: self.indexer_max_neighbors,
            bootstrap: self.indexer_bootstrap.clone(),
        }
    }

    pub fn sink(&self) -> SinkConfig {
        SinkConfig {
            max_leeches: self.leech_max_n,
            session_timeout: Duration::from_secs(self.leech_session_timeout_secs),
            fetch_timeout: Duration::from_secs(self.leech_fetch_timeout_secs),
            max_metadata_size: self.leech_max_metadata_bytes,
            drain_capacity: self.leech_max_n,
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Default log filter when `RUST_LOG` is not set.
    pub fn log_filter(&self) -> &'static str {
        match self.verbosity {
            0 => "warn",
            1 => "info",
            _ => "debug",
        }
    }
}

pub fn parse_socket_addrs(values: &[String]) -> anyhow::Result<Vec<SocketAddr>> {
    if values.is_empty() {
        anyhow::bail!("at least one address is required");
    }
    values
        .iter()
        .map(|v| {
            v.parse::<SocketAddr>()
                .map_err(|e| anyhow::anyhow!("invalid address {v:?}: {e}"))
        })
        .collect()
}

fn env_opt_string(env: Lookup<'_>, name: &str) -> Option<String> {
    env(name)
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_string(env: Lookup<'_>, name: &str, default: &str) -> String {
    env_opt_string(env, name).unwrap_or_else(|| default.to_string())
}

fn env_u64(env: Lookup<'_>, name: &str, default: u64) -> u64 {
    env(name)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_u8(env: Lookup<'_>, name: &str, default: u8) -> u8 {
    env(name)
        .and_then(|v| v.trim().parse::<u8>().ok())
        .unwrap_or(default)
}

fn env_usize(env: Lookup<'_>, name: &str, default: usize) -> usize {
    env(name)
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_csv_strings(env: Lookup<'_>, name: &str, defaults: &[&str]) -> Vec<String> {
    if let Some(s) = env_opt_string(env, name) {
        let v: Vec<String> = s
            .split(',')
            .map(|x| x.trim().to_string())
            .filter(|x| !x.is_empty())
            .collect();
        if !v.is_empty() {
            return v;
        }
    }
    defaults.iter().map(|s| s.to_string()).collect()
}
