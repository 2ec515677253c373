//! Repeats rounds over a fixed peer set.

use super::round::{RoundOrchestrator, RoundParams, RoundReport};
use crate::error::HarnessError;
use crate::net::Host;
use std::sync::Arc;
use tracing::{error, info};

/// Runs `rounds` rounds back to back. Round N+1 starts only after round N
/// verified that every peer is back to zero connections.
///
/// Peers must already have the echo responder registered.
pub struct RoundDriver<H: Host> {
    orchestrator: RoundOrchestrator<H>,
    rounds: usize,
}

impl<H: Host> RoundDriver<H> {
    pub fn new(hosts: Vec<Arc<H>>, params: RoundParams, rounds: usize) -> Result<Self, HarnessError> {
        Ok(Self {
            orchestrator: RoundOrchestrator::new(hosts, params)?,
            rounds,
        })
    }

    pub fn rounds(&self) -> usize {
        self.rounds
    }

    /// Run every round, stopping at the first failure.
    pub async fn run(&self) -> Result<Vec<RoundReport>, HarnessError> {
        let mut reports = Vec::with_capacity(self.rounds);
        let peers = self.orchestrator.hosts().len();

        for round in 0..self.rounds {
            info!(
                round,
                of = self.rounds,
                peers,
                streams = self.orchestrator.params().streams,
                "Starting round"
            );
            match self.orchestrator.run(round).await {
                Ok(report) => {
                    report.log_summary();
                    reports.push(report);
                }
                Err(e) => {
                    error!(round, error = %e, "Round failed");
                    return Err(e);
                }
            }
        }
        Ok(reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::driver::DriverConfig;
    use crate::harness::echo;
    use crate::net::memory::{MemoryNetwork, MemoryOptions};
    use std::time::Duration;

    fn params(streams: usize, messages: usize) -> RoundParams {
        RoundParams {
            streams,
            messages,
            driver: DriverConfig {
                buffer_size: 65536,
                seed: None,
                step_timeout: Duration::from_secs(5),
            },
            settle_window: Duration::from_millis(20),
            poll_interval: Duration::from_millis(1),
        }
    }

    fn echo_network(peers: usize) -> (MemoryNetwork, Vec<Arc<crate::net::memory::MemoryHost>>) {
        let net = MemoryNetwork::new(MemoryOptions {
            reclaim_delay: Duration::from_millis(10),
            stream_window: 256 * 1024,
        });
        let hosts = (0..peers)
            .map(|_| {
                let host = net.add_host();
                echo::register(host.as_ref());
                host
            })
            .collect();
        (net, hosts)
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_peers_converge_every_round() {
        let (net, hosts) = echo_network(2);
        let driver = RoundDriver::new(hosts.clone(), params(3, 4), 4).unwrap();

        let reports = driver.run().await.unwrap();
        assert_eq!(reports.len(), 4);
        for (i, report) in reports.iter().enumerate() {
            assert_eq!(report.round, i);
            assert_eq!(report.dials, 1);
            assert_eq!(report.streams_opened, 3);
            assert_eq!(report.messages, 12);
            assert!(report.settle_time <= Duration::from_millis(20));
        }
        assert_eq!(net.dial_count(), 4);
        assert_eq!(net.session_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_five_peers_two_rounds() {
        let (net, hosts) = echo_network(5);
        let driver = RoundDriver::new(hosts.clone(), params(25, 4), 2).unwrap();

        let reports = driver.run().await.unwrap();
        assert_eq!(reports.len(), 2);
        for report in &reports {
            assert_eq!(report.dials, 10);
            assert_eq!(report.streams_opened, 25);
            assert_eq!(report.messages, 100);
            assert_eq!(report.closes, 10);
        }
        for host in &hosts {
            assert_eq!(host.connection_count(), 0);
        }

        // Every round built fresh connections and closed each of them once.
        let log = net.close_log();
        assert_eq!(log.len(), 20);
        assert!(log.iter().all(|r| !r.redundant && r.closer < r.remote));
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_failure_stops_the_run() {
        let net = MemoryNetwork::new(MemoryOptions {
            reclaim_delay: Duration::from_millis(50),
            stream_window: 256 * 1024,
        });
        let hosts: Vec<_> = (0..2)
            .map(|_| {
                let host = net.add_host();
                echo::register(host.as_ref());
                host
            })
            .collect();
        let driver = RoundDriver::new(hosts, params(2, 1), 3).unwrap();

        let err = driver.run().await.unwrap_err();
        assert!(matches!(err, HarnessError::Convergence { round: 0, .. }));
        assert_eq!(net.dial_count(), 1);
    }
}
