//! Full-mesh connection builder.

use crate::error::HarnessError;
use crate::net::{order, Host, PeerId};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// One dial of the mesh: host index `from` dials host index `to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dial {
    pub from: usize,
    pub to: usize,
}

/// Dials needed to connect every unordered pair of `ids` exactly once.
///
/// Each pair is dialed by its initiator (see [`order`]), so two peers never
/// dial each other at the same time.
pub fn plan(ids: &[PeerId]) -> Result<Vec<Dial>, HarnessError> {
    let mut seen = HashSet::with_capacity(ids.len());
    for id in ids {
        if !seen.insert(*id) {
            return Err(HarnessError::DuplicatePeer(*id));
        }
    }

    let mut dials = Vec::with_capacity(ids.len() * ids.len().saturating_sub(1) / 2);
    for i in 0..ids.len() {
        for j in (i + 1)..ids.len() {
            let (initiator, _) =
                order::ordered_pair(ids[i], ids[j]).ok_or(HarnessError::DuplicatePeer(ids[i]))?;
            if initiator == ids[i] {
                dials.push(Dial { from: i, to: j });
            } else {
                dials.push(Dial { from: j, to: i });
            }
        }
    }
    Ok(dials)
}

/// Connect every pair of `hosts`. Any dial failure aborts.
///
/// Returns the number of dials issued.
pub async fn connect_all<H: Host>(hosts: &[Arc<H>]) -> Result<usize, HarnessError> {
    let ids: Vec<PeerId> = hosts.iter().map(|h| h.id()).collect();
    let dials = plan(&ids)?;

    for dial in &dials {
        let from = &hosts[dial.from];
        let to = hosts[dial.to].peer_info();
        debug!(peer = %from.id(), remote = %to.id, addr = %to.addr, "Dialing");
        from.connect(&to)
            .await
            .map_err(|source| HarnessError::Dial {
                from: from.id(),
                to: to.id,
                source,
            })?;
    }
    Ok(dials.len())
}
