//! One connect / traffic / teardown / verify cycle over a peer set.
//!
//! The round runs in strict phases:
//!
//! 1. check that no peer carries connections over from a previous round
//! 2. build the full mesh
//! 3. open streams round-robin over adjacent peers, one driver and one
//!    coordinator task per stream
//! 4. join every coordinator (barrier); failed coordinators abort their
//!    driver first, so no stream I/O is in flight past this point
//! 5. close every connection from its initiator side only
//! 6. poll until every peer reports zero connections or the settle
//!    window runs out
//!
//! Stream failures are reported after verification so a broken round still
//! leaves the peers clean for the next one.

use super::driver::{DriverConfig, DriverOutcome, StreamDriver};
use super::handshake::{self, HandshakeError, HandshakeState};
use super::{echo, mesh};
use crate::error::HarnessError;
use crate::net::{order, Connection, Host, PeerId, ProtocolId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Parameters of a round.
#[derive(Debug, Clone)]
pub struct RoundParams {
    /// Number of streams opened per round.
    pub streams: usize,
    /// Message cycles per stream.
    pub messages: usize,
    pub driver: DriverConfig,
    /// Upper bound on the wait for teardown to converge.
    pub settle_window: Duration,
    /// How often connection counts are polled while converging.
    pub poll_interval: Duration,
}

/// Stream `index` runs from host `from` to host `to` (indices in the peer list).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    pub index: usize,
    pub from: usize,
    pub to: usize,
}

/// Round-robin over adjacent peers: stream `i` goes from `i mod P` to
/// `(i + 1) mod P`.
pub fn assignments(peers: usize, streams: usize) -> Vec<Assignment> {
    if peers == 0 {
        return Vec::new();
    }
    (0..streams)
        .map(|i| Assignment {
            index: i,
            from: i % peers,
            to: (i + 1) % peers,
        })
        .collect()
}

/// A stream that could not be opened. The round goes on without it.
#[derive(Debug, Clone)]
pub struct OpenFailure {
    pub stream: usize,
    pub from: PeerId,
    pub to: PeerId,
    pub reason: String,
}

/// A stream whose message cycle did not complete.
#[derive(Debug)]
pub struct StreamFailure {
    pub stream: usize,
    pub from: PeerId,
    pub to: PeerId,
    pub error: HandshakeError,
}

/// What a round did.
#[derive(Debug, Default)]
pub struct RoundReport {
    pub round: usize,
    pub dials: usize,
    pub streams_opened: usize,
    pub open_failures: Vec<OpenFailure>,
    pub messages: usize,
    pub bytes_echoed: u64,
    pub stream_failures: Vec<StreamFailure>,
    pub closes: usize,
    pub close_errors: usize,
    pub settle_time: Duration,
}

#[derive(Debug, Default, Clone, Copy)]
struct StreamStats {
    messages: usize,
    bytes: u64,
}

pub struct RoundOrchestrator<H: Host> {
    hosts: Vec<Arc<H>>,
    params: RoundParams,
    protocol: ProtocolId,
}

impl<H: Host> RoundOrchestrator<H> {
    pub fn new(hosts: Vec<Arc<H>>, params: RoundParams) -> Result<Self, HarnessError> {
        if hosts.len() < 2 {
            return Err(HarnessError::TooFewPeers(hosts.len()));
        }
        Ok(Self {
            hosts,
            params,
            protocol: echo::protocol(),
        })
    }

    pub fn hosts(&self) -> &[Arc<H>] {
        &self.hosts
    }

    pub fn params(&self) -> &RoundParams {
        &self.params
    }

    pub async fn run(&self, round: usize) -> Result<RoundReport, HarnessError> {
        let mut report = RoundReport {
            round,
            ..Default::default()
        };

        self.check_clean(round)?;
        report.dials = mesh::connect_all(&self.hosts).await?;
        debug!(round, dials = report.dials, "Mesh complete");

        let coordinators = self.start_streams(&mut report).await;
        self.join_streams(coordinators, &mut report).await;

        for (i, host) in self.hosts.iter().enumerate() {
            debug!(round, host = i, peer = %host.id(), conns = host.connection_count(), "Before teardown");
        }
        self.teardown(&mut report).await;

        report.settle_time = self.converge(round).await?;

        if let Some(first) = report.stream_failures.first() {
            return Err(HarnessError::StreamFailures {
                round,
                failed: report.stream_failures.len(),
                total: report.streams_opened,
                first: format!(
                    "stream {} ({} -> {}): {}",
                    first.stream, first.from, first.to, first.error
                ),
            });
        }
        Ok(report)
    }

    fn check_clean(&self, round: usize) -> Result<(), HarnessError> {
        for host in &self.hosts {
            let residual = host.connection_count();
            if residual > 0 {
                return Err(HarnessError::Leak {
                    round,
                    peer: host.id(),
                    residual,
                });
            }
        }
        Ok(())
    }

    async fn start_streams(
        &self,
        report: &mut RoundReport,
    ) -> Vec<(Assignment, JoinHandle<Result<StreamStats, HandshakeError>>)> {
        let mut coordinators = Vec::with_capacity(self.params.streams);

        for assignment in assignments(self.hosts.len(), self.params.streams) {
            let from = &self.hosts[assignment.from];
            let to = &self.hosts[assignment.to];

            let stream = match from.new_stream(to.id(), &self.protocol).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(stream = assignment.index, peer = %from.id(), remote = %to.id(), error = %e, "Failed to open stream");
                    report.open_failures.push(OpenFailure {
                        stream: assignment.index,
                        from: from.id(),
                        to: to.id(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            report.streams_opened += 1;

            let (worker, handoff) =
                StreamDriver::spawn(stream, assignment.index, &self.params.driver);
            let coordinator = tokio::spawn(coordinate(
                assignment.index,
                handoff,
                worker,
                self.params.messages,
                self.params.driver.step_timeout,
            ));
            coordinators.push((assignment, coordinator));
        }
        coordinators
    }

    async fn join_streams(
        &self,
        coordinators: Vec<(Assignment, JoinHandle<Result<StreamStats, HandshakeError>>)>,
        report: &mut RoundReport,
    ) {
        for (assignment, coordinator) in coordinators {
            let result = match coordinator.await {
                Ok(result) => result,
                Err(e) => Err(HandshakeError::WorkerFailed {
                    state: HandshakeState::Idle,
                    reason: format!("coordinator task failed: {e}"),
                }),
            };
            match result {
                Ok(stats) => {
                    report.messages += stats.messages;
                    report.bytes_echoed += stats.bytes;
                }
                Err(error) => {
                    let from = self.hosts[assignment.from].id();
                    let to = self.hosts[assignment.to].id();
                    warn!(stream = assignment.index, peer = %from, remote = %to, %error, "Stream failed");
                    report.stream_failures.push(StreamFailure {
                        stream: assignment.index,
                        from,
                        to,
                        error,
                    });
                }
            }
        }
    }

    /// Close every connection from its initiator side.
    async fn teardown(&self, report: &mut RoundReport) {
        for host in &self.hosts {
            for conn in host.connections() {
                if !order::is_initiator(conn.local_peer(), conn.remote_peer()) {
                    continue;
                }
                debug!(peer = %conn.local_peer(), remote = %conn.remote_peer(), conn = %conn.descriptor(), "Closing");
                match conn.close().await {
                    Ok(()) => report.closes += 1,
                    Err(e) => {
                        warn!(conn = %conn.descriptor(), error = %e, "Close failed");
                        report.close_errors += 1;
                    }
                }
            }
        }
    }

    /// Wait until every peer reports zero connections.
    async fn converge(&self, round: usize) -> Result<Duration, HarnessError> {
        await_convergence(
            &self.hosts,
            self.params.settle_window,
            self.params.poll_interval,
        )
        .await
        .map_err(|(peer, residual, waited)| HarnessError::Convergence {
            round,
            peer,
            residual,
            waited,
        })
    }
}

/// Poll `hosts` until none has open connections.
///
/// Returns how long it took, or the first offending peer and its residual
/// count once `window` has elapsed.
pub async fn await_convergence<H: Host>(
    hosts: &[Arc<H>],
    window: Duration,
    poll: Duration,
) -> Result<Duration, (PeerId, usize, Duration)> {
    let start = Instant::now();
    let deadline = start + window;

    loop {
        let residual = hosts
            .iter()
            .map(|h| (h.id(), h.connection_count()))
            .find(|(_, count)| *count > 0);

        match residual {
            None => return Ok(start.elapsed()),
            Some((peer, count)) if Instant::now() >= deadline => {
                return Err((peer, count, start.elapsed()));
            }
            Some(_) => tokio::time::sleep(poll).await,
        }
    }
}

/// Drive one stream: wait for the handshake, run `messages` cycles, close.
///
/// On any failure the worker is aborted and awaited before returning, so
/// the barrier never releases while the stream may still be in use.
async fn coordinate(
    index: usize,
    handoff: oneshot::Receiver<handshake::Handshake>,
    worker: JoinHandle<DriverOutcome>,
    messages: usize,
    step_timeout: Duration,
) -> Result<StreamStats, HandshakeError> {
    match drive(index, handoff, messages, step_timeout).await {
        Ok(stats) => match worker.await {
            Ok(DriverOutcome::Closed { messages }) if messages == stats.messages => {
                debug!(stream = index, messages, "Closed");
                Ok(stats)
            }
            Ok(DriverOutcome::Closed { messages }) => Err(HandshakeError::WorkerFailed {
                state: HandshakeState::Closed,
                reason: format!(
                    "worker completed {messages} cycles, coordinator saw {}",
                    stats.messages
                ),
            }),
            Ok(DriverOutcome::Abandoned { messages }) => Err(HandshakeError::WorkerFailed {
                state: HandshakeState::Closed,
                reason: format!("worker abandoned the stream after {messages} cycles"),
            }),
            Ok(DriverOutcome::Failed { messages, reason }) => Err(HandshakeError::WorkerFailed {
                state: HandshakeState::Closed,
                reason: format!("worker failed after {messages} cycles: {reason}"),
            }),
            Err(e) => Err(HandshakeError::WorkerFailed {
                state: HandshakeState::Closed,
                reason: format!("stream worker task failed: {e}"),
            }),
        },
        Err(e) => {
            worker.abort();
            let _ = worker.await;
            Err(e)
        }
    }
}

async fn drive(
    index: usize,
    handoff: oneshot::Receiver<handshake::Handshake>,
    messages: usize,
    step_timeout: Duration,
) -> Result<StreamStats, HandshakeError> {
    debug!(stream = index, "Getting handle");
    let mut handshake = handshake::receive(handoff, step_timeout).await?;

    let mut stats = StreamStats::default();
    for k in 0..messages {
        let message = handshake.send_message().await?;
        stats.messages += 1;
        stats.bytes += message.echoed as u64;
        debug!(stream = index, message = k, len = message.sent, "Echoed");
    }
    handshake.close().await?;
    debug!(stream = index, state = ?handshake.state(), messages = stats.messages, "Handshake finished");
    Ok(stats)
}

impl RoundReport {
    /// Log a one-line summary.
    pub fn log_summary(&self) {
        info!(
            round = self.round,
            dials = self.dials,
            streams = self.streams_opened,
            open_failures = self.open_failures.len(),
            messages = self.messages,
            bytes = self.bytes_echoed,
            closes = self.closes,
            close_errors = self.close_errors,
            settle_ms = self.settle_time.as_millis() as u64,
            "Round complete"
        );
        for failure in &self.open_failures {
            debug!(
                round = self.round,
                stream = failure.stream,
                peer = %failure.from,
                remote = %failure.to,
                reason = %failure.reason,
                "Stream was not opened"
            );
        }
    }
}
