//! Round-level errors.

use crate::net::{NetError, PeerId};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("need at least two peers, got {0}")]
    TooFewPeers(usize),

    #[error("duplicate peer identity {0}")]
    DuplicatePeer(PeerId),

    /// A mesh dial failed; the round aborts.
    #[error("failed to connect {from} -> {to}: {source}")]
    Dial {
        from: PeerId,
        to: PeerId,
        #[source]
        source: NetError,
    },

    /// Connections from an earlier round were still around.
    #[error("round {round}: peer {peer} starts with {residual} conns")]
    Leak {
        round: usize,
        peer: PeerId,
        residual: usize,
    },

    /// Teardown did not reach zero connections within the settle window.
    #[error("round {round}: peer {peer} has {residual} conns after {waited:?}, not zero")]
    Convergence {
        round: usize,
        peer: PeerId,
        residual: usize,
        waited: Duration,
    },

    /// Stream workers failed or stalled.
    #[error("round {round}: {failed} of {total} streams failed, first: {first}")]
    StreamFailures {
        round: usize,
        failed: usize,
        total: usize,
        first: String,
    },
}
