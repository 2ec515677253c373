//! In-process connection layer.
//!
//! Hosts live in one [`MemoryNetwork`] and reach each other by
//! `/memory/<n>` addresses. Connections are shared sessions that appear in
//! both peers' views; streams are `tokio::io::duplex` pairs.
//!
//! Closing a connection behaves like a real multiplexer: the closing peer
//! drops it from its view at once, the remote peer notices only after a
//! reclaim delay. Harness code must therefore wait for convergence instead
//! of assuming teardown is synchronous.

mod registry;
mod stream;

use registry::{Session, SessionRegistry, SessionState};
pub use stream::MemoryStream;

use crate::net::{
    ConnMeta, Connection, Host, NetError, NetResult, PeerId, PeerInfo, ProtocolId,
    StreamHandler,
};
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, trace};

/// Maximum number of sessions the network keeps track of.
const MAX_SESSIONS: usize = 65536;

/// Tunables of the in-memory network.
#[derive(Debug, Clone)]
pub struct MemoryOptions {
    /// Delay before the remote side of a closed connection is reclaimed.
    pub reclaim_delay: Duration,
    /// Per-direction buffer of each stream.
    pub stream_window: usize,
}

impl Default for MemoryOptions {
    fn default() -> Self {
        Self {
            reclaim_delay: Duration::from_millis(10),
            stream_window: 256 * 1024,
        }
    }
}

/// One close call issued on a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseRecord {
    pub conn_id: u64,
    pub closer: PeerId,
    pub remote: PeerId,
    /// Whether the connection was already closed when the call was made.
    pub redundant: bool,
}

/// Per-connection state shared by both peer views and all handles.
#[derive(Debug)]
struct ConnShared {
    id: u64,
    slot: usize,
    dialer: PeerId,
    listener: PeerId,
    closed: watch::Sender<bool>,
}

impl ConnShared {
    fn descriptor(&self) -> String {
        format!("mem/{}({}<->{})", self.id, self.dialer, self.listener)
    }

    fn other(&self, peer: PeerId) -> PeerId {
        if peer == self.dialer {
            self.listener
        } else {
            self.dialer
        }
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

struct HostState {
    id: PeerId,
    addr: String,
    conns: Mutex<HashMap<u64, Arc<ConnShared>>>,
    handlers: RwLock<HashMap<ProtocolId, StreamHandler<MemoryStream>>>,
}

struct NetInner {
    options: MemoryOptions,
    hosts: RwLock<HashMap<PeerId, Arc<HostState>>>,
    addrs: RwLock<HashMap<String, PeerId>>,
    sessions: Mutex<SessionRegistry>,
    next_conn_id: AtomicU64,
    dials: AtomicU64,
    close_log: Mutex<Vec<CloseRecord>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl NetInner {
    fn host(&self, id: PeerId) -> Option<Arc<HostState>> {
        self.hosts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    fn resolve(&self, addr: &str) -> Option<PeerId> {
        self.addrs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(addr)
            .copied()
    }

    /// Drop `conn` from `peer`'s view, releasing the session once no view
    /// holds it any more.
    fn reclaim(&self, conn: &ConnShared, peer: PeerId) {
        if let Some(host) = self.host(peer) {
            lock(&host.conns).remove(&conn.id);
        }
        let other = conn.other(peer);
        let still_held = self
            .host(other)
            .map(|h| lock(&h.conns).contains_key(&conn.id))
            .unwrap_or(false);
        if !still_held {
            if let Some(session) = lock(&self.sessions).remove(conn.slot, conn.id) {
                let closer = match session.state {
                    SessionState::Closing { closer } => Some(closer),
                    SessionState::Open => None,
                };
                trace!(
                    conn = session.conn_id,
                    dialer = %session.dialer,
                    listener = %session.listener,
                    closer = ?closer,
                    "Session released"
                );
            }
        }
    }
}

/// A set of hosts that can reach each other in-process.
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<NetInner>,
}

impl MemoryNetwork {
    pub fn new(options: MemoryOptions) -> Self {
        Self {
            inner: Arc::new(NetInner {
                options,
                hosts: RwLock::new(HashMap::new()),
                addrs: RwLock::new(HashMap::new()),
                sessions: Mutex::new(SessionRegistry::new(MAX_SESSIONS)),
                next_conn_id: AtomicU64::new(1),
                dials: AtomicU64::new(0),
                close_log: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Add a host with a random identity.
    pub fn add_host(&self) -> Arc<MemoryHost> {
        let mut rng = rand::thread_rng();
        loop {
            let id = PeerId::new(rng.gen());
            if let Some(host) = self.add_host_with_id(id) {
                return host;
            }
        }
    }

    /// Add a host with a fixed identity. `None` if the identity is taken.
    pub fn add_host_with_id(&self, id: PeerId) -> Option<Arc<MemoryHost>> {
        let mut hosts = self
            .inner
            .hosts
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if hosts.contains_key(&id) {
            return None;
        }

        let addr = format!("/memory/{}", hosts.len());
        let state = Arc::new(HostState {
            id,
            addr: addr.clone(),
            conns: Mutex::new(HashMap::new()),
            handlers: RwLock::new(HashMap::new()),
        });
        hosts.insert(id, Arc::clone(&state));
        self.inner
            .addrs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(addr.clone(), id);

        debug!(peer = %id, %addr, "Host added");
        Some(Arc::new(MemoryHost {
            state,
            net: Arc::clone(&self.inner),
        }))
    }

    /// Sessions the layer still holds, including ones being reclaimed.
    pub fn session_count(&self) -> usize {
        lock(&self.inner.sessions).len()
    }

    /// Sessions not yet closed by either side.
    pub fn open_session_count(&self) -> usize {
        lock(&self.inner.sessions).open_count()
    }

    /// Number of dials that created a new connection.
    pub fn dial_count(&self) -> u64 {
        self.inner.dials.load(Ordering::SeqCst)
    }

    /// Every close call issued so far, in order.
    pub fn close_log(&self) -> Vec<CloseRecord> {
        lock(&self.inner.close_log).clone()
    }
}

/// A peer attached to a [`MemoryNetwork`].
pub struct MemoryHost {
    state: Arc<HostState>,
    net: Arc<NetInner>,
}

impl MemoryHost {
    fn find_conn(&self, peer: PeerId) -> Option<Arc<ConnShared>> {
        lock(&self.state.conns)
            .values()
            .filter(|c| c.other(self.state.id) == peer && !c.is_closed())
            .min_by_key(|c| c.id)
            .cloned()
    }

    /// Create a connection to `remote` unless a live one exists. Returns
    /// `None` when already connected.
    ///
    /// The session lock is held from the lookup to the insert into both
    /// views, so concurrent dials in either direction create one session.
    fn dial(&self, remote: &HostState) -> NetResult<Option<Arc<ConnShared>>> {
        let mut sessions = lock(&self.net.sessions);
        if self.find_conn(remote.id).is_some() {
            return Ok(None);
        }

        let local = self.state.id;
        let id = self.net.next_conn_id.fetch_add(1, Ordering::SeqCst);
        let slot = sessions
            .insert(Session::new(id, local, remote.id))
            .ok_or(NetError::SessionLimit(MAX_SESSIONS))?;
        let (closed, _) = watch::channel(false);
        let conn = Arc::new(ConnShared {
            id,
            slot,
            dialer: local,
            listener: remote.id,
            closed,
        });

        lock(&self.state.conns).insert(id, Arc::clone(&conn));
        lock(&remote.conns).insert(id, Arc::clone(&conn));
        self.net.dials.fetch_add(1, Ordering::SeqCst);
        Ok(Some(conn))
    }
}

impl Host for MemoryHost {
    type Conn = MemoryConn;
    type Stream = MemoryStream;

    fn id(&self) -> PeerId {
        self.state.id
    }

    fn peer_info(&self) -> PeerInfo {
        PeerInfo {
            id: self.state.id,
            addr: self.state.addr.clone(),
        }
    }

    async fn connect(&self, info: &PeerInfo) -> NetResult<()> {
        let local = self.state.id;
        if info.id == local {
            return Err(NetError::DialSelf(local));
        }

        let actual = self
            .net
            .resolve(&info.addr)
            .ok_or_else(|| NetError::UnknownAddress(info.addr.clone()))?;
        if actual != info.id {
            return Err(NetError::PeerMismatch {
                addr: info.addr.clone(),
                expected: info.id,
                actual,
            });
        }

        let remote = self
            .net
            .host(info.id)
            .ok_or_else(|| NetError::UnknownAddress(info.addr.clone()))?;

        match self.dial(&remote)? {
            Some(conn) => {
                debug!(peer = %local, remote = %info.id, conn = %conn.descriptor(), "Connected");
            }
            None => trace!(peer = %local, remote = %info.id, "Already connected"),
        }
        Ok(())
    }

    async fn new_stream(&self, peer: PeerId, protocol: &ProtocolId) -> NetResult<MemoryStream> {
        let conn = self.find_conn(peer).ok_or(NetError::NotConnected(peer))?;
        let remote = self.net.host(peer).ok_or(NetError::NotConnected(peer))?;

        let handler = remote
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(protocol)
            .cloned()
            .ok_or_else(|| NetError::ProtocolNotSupported {
                peer,
                protocol: protocol.clone(),
            })?;

        let descriptor = conn.descriptor();
        let (local_end, remote_end) =
            MemoryStream::pair(self.net.options.stream_window, &conn.closed, descriptor.clone());

        trace!(peer = %self.state.id, remote = %peer, %protocol, conn = %descriptor, "Stream opened");
        handler(
            remote_end,
            ConnMeta {
                local: peer,
                remote: self.state.id,
                descriptor,
            },
        );
        Ok(local_end)
    }

    fn set_stream_handler(&self, protocol: ProtocolId, handler: StreamHandler<MemoryStream>) {
        self.state
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(protocol, handler);
    }

    fn connections(&self) -> Vec<MemoryConn> {
        lock(&self.state.conns)
            .values()
            .map(|shared| MemoryConn {
                shared: Arc::clone(shared),
                local: self.state.id,
                net: Arc::clone(&self.net),
            })
            .collect()
    }

    fn connection_count(&self) -> usize {
        lock(&self.state.conns).len()
    }
}

/// A connection as seen from one peer.
#[derive(Clone)]
pub struct MemoryConn {
    shared: Arc<ConnShared>,
    local: PeerId,
    net: Arc<NetInner>,
}

impl Connection for MemoryConn {
    fn local_peer(&self) -> PeerId {
        self.local
    }

    fn remote_peer(&self) -> PeerId {
        self.shared.other(self.local)
    }

    fn descriptor(&self) -> String {
        self.shared.descriptor()
    }

    async fn close(&self) -> NetResult<()> {
        let local = self.local;
        let remote = self.remote_peer();
        let redundant = self.shared.closed.send_replace(true);

        lock(&self.net.close_log).push(CloseRecord {
            conn_id: self.shared.id,
            closer: local,
            remote,
            redundant,
        });
        if redundant {
            return Err(NetError::AlreadyClosed(self.descriptor()));
        }

        if let Some(session) = lock(&self.net.sessions).get_mut(self.shared.slot) {
            if session.conn_id == self.shared.id {
                session.close(local);
            }
        }
        self.net.reclaim(&self.shared, local);

        let delay = self.net.options.reclaim_delay;
        if delay.is_zero() {
            self.net.reclaim(&self.shared, remote);
        } else {
            let net = Arc::clone(&self.net);
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                net.reclaim(&shared, remote);
            });
        }

        debug!(peer = %local, remote = %remote, conn = %self.descriptor(), "Connection closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_test::{assert_err, assert_ok};

    fn network(reclaim_ms: u64) -> MemoryNetwork {
        MemoryNetwork::new(MemoryOptions {
            reclaim_delay: Duration::from_millis(reclaim_ms),
            stream_window: 1024,
        })
    }

    #[tokio::test]
    async fn test_connect_registers_both_views() {
        let net = network(0);
        let a = net.add_host_with_id(PeerId::new(1)).unwrap();
        let b = net.add_host_with_id(PeerId::new(2)).unwrap();

        assert_ok!(a.connect(&b.peer_info()).await);

        assert_eq!(a.connection_count(), 1);
        assert_eq!(b.connection_count(), 1);
        assert_eq!(net.session_count(), 1);

        let conn = &a.connections()[0];
        assert_eq!(conn.local_peer(), PeerId::new(1));
        assert_eq!(conn.remote_peer(), PeerId::new(2));
        assert_eq!(b.connections()[0].remote_peer(), PeerId::new(1));
        assert_eq!(conn.descriptor(), b.connections()[0].descriptor());
    }

    #[tokio::test]
    async fn test_connect_is_idempotent() {
        let net = network(0);
        let a = net.add_host();
        let b = net.add_host();

        assert_ok!(a.connect(&b.peer_info()).await);
        assert_ok!(a.connect(&b.peer_info()).await);
        assert_ok!(b.connect(&a.peer_info()).await);

        assert_eq!(net.dial_count(), 1);
        assert_eq!(a.connection_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_dials_create_one_session() {
        let net = network(0);
        let a = net.add_host();
        let b = net.add_host();

        let mut dials = Vec::new();
        for i in 0..32 {
            let (from, to) = if i % 2 == 0 {
                (Arc::clone(&a), b.peer_info())
            } else {
                (Arc::clone(&b), a.peer_info())
            };
            dials.push(tokio::spawn(async move { from.connect(&to).await }));
        }
        for dial in dials {
            assert_ok!(dial.await.unwrap());
        }

        assert_eq!(net.dial_count(), 1);
        assert_eq!(net.session_count(), 1);
        assert_eq!(a.connection_count(), 1);
        assert_eq!(b.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_connect_errors() {
        let net = network(0);
        let a = net.add_host_with_id(PeerId::new(1)).unwrap();
        let b = net.add_host_with_id(PeerId::new(2)).unwrap();

        let err = assert_err!(a.connect(&a.peer_info()).await);
        assert!(matches!(err, NetError::DialSelf(_)));

        let unknown = PeerInfo {
            id: PeerId::new(3),
            addr: "/memory/99".to_string(),
        };
        let err = assert_err!(a.connect(&unknown).await);
        assert!(matches!(err, NetError::UnknownAddress(_)));

        let wrong = PeerInfo {
            id: PeerId::new(3),
            addr: b.peer_info().addr,
        };
        let err = assert_err!(a.connect(&wrong).await);
        assert!(matches!(err, NetError::PeerMismatch { .. }));
    }

    #[test]
    fn test_duplicate_identity_rejected() {
        let net = network(0);
        assert!(net.add_host_with_id(PeerId::new(1)).is_some());
        assert!(net.add_host_with_id(PeerId::new(1)).is_none());
    }

    #[tokio::test]
    async fn test_new_stream_requires_connection_and_handler() {
        let net = network(0);
        let a = net.add_host_with_id(PeerId::new(1)).unwrap();
        let b = net.add_host_with_id(PeerId::new(2)).unwrap();
        let proto = ProtocolId::new("/test/1");

        let err = assert_err!(a.new_stream(b.id(), &proto).await);
        assert!(matches!(err, NetError::NotConnected(_)));

        assert_ok!(a.connect(&b.peer_info()).await);
        let err = assert_err!(a.new_stream(b.id(), &proto).await);
        assert!(matches!(err, NetError::ProtocolNotSupported { .. }));
    }

    #[tokio::test]
    async fn test_handler_receives_inbound_stream() {
        let net = network(0);
        let a = net.add_host_with_id(PeerId::new(1)).unwrap();
        let b = net.add_host_with_id(PeerId::new(2)).unwrap();
        let proto = ProtocolId::new("/test/1");
        let seen = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&seen);
        b.set_stream_handler(
            proto.clone(),
            Arc::new(move |mut stream: MemoryStream, meta: ConnMeta| {
                assert_eq!(meta.local, PeerId::new(2));
                assert_eq!(meta.remote, PeerId::new(1));
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let _ = stream.write_all(b"hi").await;
                });
            }),
        );

        assert_ok!(a.connect(&b.peer_info()).await);
        let mut stream = assert_ok!(a.new_stream(b.id(), &proto).await);
        let mut buf = [0u8; 2];
        assert_ok!(stream.read_exact(&mut buf).await);
        assert_eq!(&buf, b"hi");
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_reclaims_remote_view_after_delay() {
        let net = network(10);
        let a = net.add_host_with_id(PeerId::new(1)).unwrap();
        let b = net.add_host_with_id(PeerId::new(2)).unwrap();
        assert_ok!(a.connect(&b.peer_info()).await);

        let conn = a.connections().remove(0);
        assert_ok!(conn.close().await);
        assert!(conn.shared.is_closed());

        assert_eq!(a.connection_count(), 0);
        assert_eq!(b.connection_count(), 1);
        assert_eq!(net.session_count(), 1);
        assert_eq!(net.open_session_count(), 0);

        tokio::time::sleep(Duration::from_millis(11)).await;
        assert_eq!(b.connection_count(), 0);
        assert_eq!(net.session_count(), 0);
    }

    #[tokio::test]
    async fn test_double_close_is_reported() {
        let net = network(0);
        let a = net.add_host_with_id(PeerId::new(1)).unwrap();
        let b = net.add_host_with_id(PeerId::new(2)).unwrap();
        assert_ok!(a.connect(&b.peer_info()).await);

        let from_a = a.connections().remove(0);
        let from_b = b.connections().remove(0);
        assert_ok!(from_a.close().await);
        let err = assert_err!(from_b.close().await);
        assert!(matches!(err, NetError::AlreadyClosed(_)));

        let log = net.close_log();
        assert_eq!(log.len(), 2);
        assert!(!log[0].redundant);
        assert!(log[1].redundant);
    }

    #[tokio::test]
    async fn test_streams_reset_when_connection_closes() {
        let net = network(0);
        let a = net.add_host_with_id(PeerId::new(1)).unwrap();
        let b = net.add_host_with_id(PeerId::new(2)).unwrap();
        let proto = ProtocolId::new("/test/1");
        b.set_stream_handler(proto.clone(), Arc::new(|_stream: MemoryStream, _meta: ConnMeta| {}));

        assert_ok!(a.connect(&b.peer_info()).await);
        let mut stream = assert_ok!(a.new_stream(b.id(), &proto).await);
        assert_ok!(a.connections()[0].close().await);

        let err = assert_err!(stream.write_all(b"late").await);
        assert_eq!(err.kind(), std::io::ErrorKind::ConnectionReset);

        let err = assert_err!(a.new_stream(b.id(), &proto).await);
        assert!(matches!(err, NetError::NotConnected(_)));
    }

    #[tokio::test]
    async fn test_blocked_read_fails_when_connection_closes() {
        let net = network(0);
        let a = net.add_host_with_id(PeerId::new(1)).unwrap();
        let b = net.add_host_with_id(PeerId::new(2)).unwrap();
        let proto = ProtocolId::new("/test/1");

        // The remote end is kept alive but never written to.
        let held = Arc::new(Mutex::new(Vec::new()));
        let keep = Arc::clone(&held);
        b.set_stream_handler(
            proto.clone(),
            Arc::new(move |stream: MemoryStream, _meta: ConnMeta| {
                lock(&keep).push(stream);
            }),
        );

        assert_ok!(a.connect(&b.peer_info()).await);
        let mut stream = assert_ok!(a.new_stream(b.id(), &proto).await);
        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 1];
            stream.read(&mut buf).await
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!reader.is_finished());

        assert_ok!(a.connections()[0].close().await);
        let result = tokio::time::timeout(Duration::from_millis(500), reader)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.unwrap_err().kind(), std::io::ErrorKind::ConnectionReset);
        assert_eq!(lock(&held).len(), 1);
    }
}
