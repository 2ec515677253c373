//! Symmetry-breaking policy between two peers.
//!
//! Two independent peers must agree, without talking, on which of them acts
//! on a shared connection. The rule is the same for dialing and for closing:
//! the peer with the lower [`PeerId`] acts, the higher one stays passive.
//! Keeping the rule in one place guarantees the mesh builder and the
//! teardown step never disagree.

use super::PeerId;

/// Role of a peer with respect to one remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Dials the remote and closes the connection at teardown.
    Initiator,
    /// Waits to be dialed and never closes.
    Passive,
}

/// Role of `local` towards `remote`.
///
/// Equal identities have no initiator.
pub fn role(local: PeerId, remote: PeerId) -> Option<Role> {
    match local.cmp(&remote) {
        std::cmp::Ordering::Less => Some(Role::Initiator),
        std::cmp::Ordering::Greater => Some(Role::Passive),
        std::cmp::Ordering::Equal => None,
    }
}

/// Whether `local` is the side that dials and closes.
pub fn is_initiator(local: PeerId, remote: PeerId) -> bool {
    role(local, remote) == Some(Role::Initiator)
}

/// Orders a pair as `(initiator, passive)`. `None` for identical peers.
pub fn ordered_pair(a: PeerId, b: PeerId) -> Option<(PeerId, PeerId)> {
    match role(a, b)? {
        Role::Initiator => Some((a, b)),
        Role::Passive => Some((b, a)),
    }
}
