//! reconnect-harness: connection teardown/re-establishment checker
//!
//! Drives a set of peers through repeated rounds of:
//! - full-mesh dialing
//! - concurrent echo traffic over many multiplexed streams
//! - one-sided connection teardown
//! - verification that every peer is back to zero connections
//!
//! Configuration via CLI arguments or TOML file.

mod config;
mod error;
mod harness;
mod net;

use config::Config;
use harness::{echo, RoundDriver};
use net::memory::MemoryNetwork;
use net::Host;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        peers = config.peers,
        streams = config.streams(),
        messages = config.messages,
        rounds = config.rounds,
        settle_ms = config.settle.as_millis() as u64,
        reclaim_ms = config.reclaim.as_millis() as u64,
        "Starting reconnect harness"
    );

    let mut builder = tokio::runtime::Builder::new_multi_thread();
    if let Some(workers) = config.workers {
        builder.worker_threads(workers);
    }
    let runtime = builder.enable_all().build()?;

    runtime.block_on(run(config))
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let network = MemoryNetwork::new(config.memory_options());
    let hosts: Vec<_> = (0..config.peers)
        .map(|_| {
            let host = network.add_host();
            echo::register(host.as_ref());
            host
        })
        .collect();

    for (i, host) in hosts.iter().enumerate() {
        info!(host = i, peer = %host.id(), addr = %host.peer_info().addr, "Peer ready");
    }

    let driver = RoundDriver::new(hosts, config.round_params(), config.rounds)?;
    let reports = driver.run().await?;

    let messages: usize = reports.iter().map(|r| r.messages).sum();
    let bytes: u64 = reports.iter().map(|r| r.bytes_echoed).sum();
    let open_failures: usize = reports.iter().map(|r| r.open_failures.len()).sum();
    info!(
        rounds = driver.rounds(),
        messages,
        bytes,
        open_failures,
        dials = network.dial_count(),
        sessions = network.session_count(),
        open_sessions = network.open_session_count(),
        "All rounds converged"
    );
    Ok(())
}
