//! XOR-metric routing table.
//!
//! Peers are grouped into 256 buckets by the length of the prefix they share
//! with the local id. Within a bucket entries are kept in contact order, least
//! recently contacted first; inserting into a full bucket evicts the front.

use std::collections::HashMap;
use std::net::SocketAddr;

use crate::network::address::{PeerAddr, PeerId};

const BUCKET_COUNT: usize = 256;
/// Addresses remembered per peer; the oldest is dropped first.
pub const MAX_ADDRS_PER_PEER: usize = 4;

#[derive(Debug, Clone)]
struct Entry {
    peer_id: PeerId,
    addrs: Vec<SocketAddr>,
}

/// Result of recording a contact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContactOutcome {
    Inserted,
    Refreshed,
    Evicted(PeerId),
    /// Contact with the local id, not stored.
    Ignored,
}

pub struct RoutingTable {
    local_id: PeerId,
    bucket_size: usize,
    buckets: Vec<Vec<Entry>>,
    index: HashMap<PeerId, usize>,
}

/// Bucket index for `other`: count of leading bits shared with `local`.
pub fn bucket_index(local: &PeerId, other: &PeerId) -> Option<usize> {
    let dist = local.distance(other);
    for (byte_idx, byte) in dist.iter().enumerate() {
        if *byte != 0 {
            return Some(byte_idx * 8 + byte.leading_zeros() as usize);
        }
    }
    None
}

impl RoutingTable {
    pub fn new(local_id: PeerId, bucket_size: usize) -> Self {
        Self {
            local_id,
            bucket_size: bucket_size.max(1),
            buckets: vec![Vec::new(); BUCKET_COUNT],
            index: HashMap::new(),
        }
    }

    /// Records a contact with `peer_id` reachable at `addr`, moving it to the
    /// most-recently-contacted end of its bucket.
    pub fn update(&mut self, peer_id: PeerId, addr: SocketAddr) -> ContactOutcome {
        let Some(idx) = bucket_index(&self.local_id, &peer_id) else {
            return ContactOutcome::Ignored;
        };
        let bucket = &mut self.buckets[idx];

        if let Some(pos) = bucket.iter().position(|e| e.peer_id == peer_id) {
            let mut entry = bucket.remove(pos);
            entry.addrs.retain(|a| a != &addr);
            entry.addrs.push(addr);
            if entry.addrs.len() > MAX_ADDRS_PER_PEER {
                entry.addrs.remove(0);
            }
            bucket.push(entry);
            return ContactOutcome::Refreshed;
        }

        let entry = Entry {
            peer_id,
            addrs: vec![addr],
        };
        self.index.insert(peer_id, idx);

        if bucket.len() < self.bucket_size {
            bucket.push(entry);
            return ContactOutcome::Inserted;
        }

        let evicted = bucket.remove(0);
        bucket.push(entry);
        self.index.remove(&evicted.peer_id);
        ContactOutcome::Evicted(evicted.peer_id)
    }

    /// Addresses known for `peer_id`, oldest first.
    pub fn addrs(&self, peer_id: &PeerId) -> Vec<SocketAddr> {
        self.index
            .get(peer_id)
            .and_then(|idx| self.buckets[*idx].iter().find(|e| &e.peer_id == peer_id))
            .map(|e| e.addrs.clone())
            .unwrap_or_default()
    }

    /// Latest known address for `peer_id`.
    pub fn find(&self, peer_id: &PeerId) -> Option<SocketAddr> {
        self.addrs(peer_id).last().copied()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// One `PeerAddr` per known address, across all buckets.
    pub fn entries(&self) -> Vec<PeerAddr> {
        self.buckets
            .iter()
            .flat_map(|b| b.iter())
            .flat_map(|e| e.addrs.iter().map(move |a| PeerAddr::new(e.peer_id, *a)))
            .collect()
    }

    /// The `count` entries closest to `target` by XOR distance.
    pub fn nearest(&self, target: &PeerId, count: usize) -> Vec<PeerAddr> {
        let mut all: Vec<(PeerId, SocketAddr)> = self
            .buckets
            .iter()
            .flat_map(|b| b.iter())
            .filter_map(|e| e.addrs.last().map(|a| (e.peer_id, *a)))
            .collect();
        all.sort_by_key(|(id, _)| id.distance(target));
        all.into_iter()
            .take(count)
            .map(|(id, addr)| PeerAddr::new(id, addr))
            .collect()
    }
}
