//! Ethernet address learning (TAP mode)
//!
//! Maps source addresses seen in decrypted frames back to the peer that
//! sent them, so outbound unicast frames go to one peer instead of being
//! flooded. Entries age out; a peer's entries vanish with the peer.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::peer::PeerId;
use crate::types::EthAddr;

struct EthEntry {
    peer: PeerId,
    last_seen: Instant,
}

/// Learned `address -> peer` table.
#[derive(Default)]
pub struct EthAddrTable {
    entries: HashMap<EthAddr, EthEntry>,
}

impl EthAddrTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Learn or refresh a source address.
    pub fn learn(&mut self, addr: EthAddr, peer: PeerId, now: Instant) {
        match self.entries.get_mut(&addr) {
            Some(entry) => {
                if entry.peer != peer {
                    debug!("{} moved to peer {}", addr, peer);
                    entry.peer = peer;
                }
                entry.last_seen = now;
            }
            None => {
                debug!("learned {} on peer {}", addr, peer);
                self.entries.insert(addr, EthEntry { peer, last_seen: now });
            }
        }
    }

    /// Peer a destination address was learned on, if the entry is fresh.
    pub fn lookup(&self, addr: &EthAddr, now: Instant, stale_time: Duration) -> Option<PeerId> {
        let entry = self.entries.get(addr)?;
        if now.duration_since(entry.last_seen) >= stale_time {
            return None;
        }
        Some(entry.peer)
    }

    /// Drop entries older than `stale_time`. Part of the maintenance sweep.
    pub fn purge_stale(&mut self, now: Instant, stale_time: Duration) {
        self.entries
            .retain(|_, entry| now.duration_since(entry.last_seen) < stale_time);
    }

    /// Drop everything learned on a peer; called when the peer goes away.
    pub fn purge_peer(&mut self, peer: PeerId) {
        self.entries.retain(|_, entry| entry.peer != peer);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
