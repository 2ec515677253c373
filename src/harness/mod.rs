//! Reconnect harness.
//!
//! Drives a peer set through repeated rounds of mesh dialing, concurrent
//! echo traffic over many streams, one-sided teardown and convergence
//! checks.
//!
//! - `echo`: inbound echo responder
//! - `handshake`: coordinator/worker turn-taking with per-step timeouts
//! - `driver`: per-stream worker
//! - `mesh`: full-mesh dialing
//! - `round`: a single round
//! - `rounds`: repeated rounds

pub mod driver;
pub mod echo;
pub mod handshake;
pub mod mesh;
pub mod round;
pub mod rounds;

pub use driver::DriverConfig;
pub use round::RoundParams;
pub use rounds::RoundDriver;
