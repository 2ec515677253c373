//! Connection-layer interface consumed by the harness.
//!
//! The harness never touches connection state directly. It commands the
//! layer through these traits (dial, open stream, close) and observes it
//! (list connections). Any peer/host implementation that can provide
//! multiplexed, ordered, reliable streams can be driven through them.
//!
//! An in-process implementation lives in [`memory`].

pub mod memory;
pub mod order;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Identity of a peer. Totally ordered; see [`order`] for how the order is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerId(u64);

impl PeerId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Everything needed to dial a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub id: PeerId,
    pub addr: String,
}

/// Opaque protocol identifier negotiated per stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProtocolId(String);

impl ProtocolId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Connection details handed to inbound stream handlers.
#[derive(Debug, Clone)]
pub struct ConnMeta {
    pub local: PeerId,
    pub remote: PeerId,
    pub descriptor: String,
}

/// Inbound stream handler installed per protocol.
pub type StreamHandler<S> = Arc<dyn Fn(S, ConnMeta) + Send + Sync>;

/// Errors reported by the connection layer.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("no peer listening on {0}")]
    UnknownAddress(String),

    #[error("address {addr} belongs to {actual}, expected {expected}")]
    PeerMismatch {
        addr: String,
        expected: PeerId,
        actual: PeerId,
    },

    #[error("cannot dial self ({0})")]
    DialSelf(PeerId),

    #[error("not connected to {0}")]
    NotConnected(PeerId),

    #[error("peer {peer} does not support protocol {protocol}")]
    ProtocolNotSupported { peer: PeerId, protocol: ProtocolId },

    #[error("session limit of {0} reached")]
    SessionLimit(usize),

    #[error("connection {0} already closed")]
    AlreadyClosed(String),
}

pub type NetResult<T> = Result<T, NetError>;

/// A live session between two peers, shared by both peers' views.
pub trait Connection: Clone + Send + Sync + 'static {
    fn local_peer(&self) -> PeerId;

    fn remote_peer(&self) -> PeerId;

    /// Loggable identifier, stable for the lifetime of the connection.
    fn descriptor(&self) -> String;

    /// Close the connection for both peers. Returns
    /// [`NetError::AlreadyClosed`] if it was closed before.
    fn close(&self) -> impl Future<Output = NetResult<()>> + Send;
}

/// A peer that can dial, open multiplexed streams and accept them.
pub trait Host: Send + Sync + 'static {
    type Conn: Connection;
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn id(&self) -> PeerId;

    fn peer_info(&self) -> PeerInfo;

    /// Dial a peer. A no-op if a live connection already exists.
    fn connect(&self, info: &PeerInfo) -> impl Future<Output = NetResult<()>> + Send;

    /// Open a stream to `peer` over an existing connection.
    fn new_stream(
        &self,
        peer: PeerId,
        protocol: &ProtocolId,
    ) -> impl Future<Output = NetResult<Self::Stream>> + Send;

    fn set_stream_handler(&self, protocol: ProtocolId, handler: StreamHandler<Self::Stream>);

    /// Snapshot of this peer's open connections.
    fn connections(&self) -> Vec<Self::Conn>;

    fn connection_count(&self) -> usize {
        self.connections().len()
    }
}
