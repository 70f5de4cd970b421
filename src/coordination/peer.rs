//! Peer identities and Hamming-distance placement.
//!
//! Placement is a pure function of the task's content hash and the set of
//! eligible peers, so every peer holding the same table predicts the same
//! owner for a task.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use uuid::Uuid;

use crate::coordination::clock::ContentHash;

/// 256-bit peer identifier, comparable bitwise with a [`ContentHash`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(#[serde(with = "crate::util::hex32")] [u8; 32]);

impl PeerId {
    /// Derive a peer id from a stable name.
    pub fn from_name(name: &str) -> Self {
        Self(Sha256::digest(name.as_bytes()).into())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(Sha256::digest(uuid.as_bytes()).into())
    }

    pub fn random() -> Self {
        Self::from_uuid(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// First 8 hex characters.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Hamming distance between this peer and a task's content hash.
    pub fn distance(&self, hash: &ContentHash) -> u32 {
        hamming(&self.0, hash.as_bytes())
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

/// Number of differing bits.
pub fn hamming(a: &[u8; 32], b: &[u8; 32]) -> u32 {
    a.iter().zip(b.iter()).map(|(x, y)| (x ^ y).count_ones()).sum()
}

/// Where a task should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Local,
    Delegate(PeerId),
}

/// Last-known state of a remote peer.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub id: PeerId,
    /// Tasks the peer reported as in flight.
    pub load: usize,
    /// Tasks the peer is willing to run at once.
    pub capacity: usize,
    /// When gossip was last received, `None` if never.
    pub last_seen: Option<Instant>,
}

impl PeerInfo {
    pub fn is_fresh(&self, now: Instant, staleness: Duration) -> bool {
        self.last_seen
            .map(|seen| now.saturating_duration_since(seen) <= staleness)
            .unwrap_or(false)
    }

    pub fn has_capacity(&self) -> bool {
        self.load < self.capacity
    }
}

/// Known peers plus the placement rule.
#[derive(Debug, Clone)]
pub struct PeerTable {
    local: PeerId,
    peers: BTreeMap<PeerId, PeerInfo>,
    staleness: Duration,
}

impl PeerTable {
    pub fn new(local: PeerId, staleness: Duration) -> Self {
        Self {
            local,
            peers: BTreeMap::new(),
            staleness,
        }
    }

    pub fn local(&self) -> PeerId {
        self.local
    }

    /// Register a peer that has not gossiped yet.
    pub fn add(&mut self, peer: PeerId) {
        if peer == self.local {
            return;
        }
        self.peers.entry(peer).or_insert(PeerInfo {
            id: peer,
            load: 0,
            capacity: 0,
            last_seen: None,
        });
    }

    /// Record gossip from `peer`.
    pub fn observe(&mut self, peer: PeerId, load: usize, capacity: usize, now: Instant) {
        if peer == self.local {
            return;
        }
        let info = self.peers.entry(peer).or_insert(PeerInfo {
            id: peer,
            load,
            capacity,
            last_seen: None,
        });
        info.load = load;
        info.capacity = capacity;
        info.last_seen = Some(now);
    }

    pub fn remove(&mut self, peer: &PeerId) -> Option<PeerInfo> {
        self.peers.remove(peer)
    }

    pub fn get(&self, peer: &PeerId) -> Option<&PeerInfo> {
        self.peers.get(peer)
    }

    pub fn ids(&self) -> Vec<PeerId> {
        self.peers.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Peers whose gossip is recent enough and that report spare capacity.
    pub fn eligible(&self, now: Instant) -> impl Iterator<Item = &PeerInfo> {
        let staleness = self.staleness;
        self.peers
            .values()
            .filter(move |p| p.is_fresh(now, staleness) && p.has_capacity())
    }

    /// Pick where a task with `hash` should run.
    ///
    /// The local peer competes with every eligible remote peer on
    /// `(distance, id)`. A remote winner is only chosen if its distance is
    /// at most `max_distance`.
    pub fn place(&self, hash: &ContentHash, now: Instant, max_distance: u32) -> Placement {
        let local = (self.local.distance(hash), self.local);
        let best = self
            .eligible(now)
            .map(|p| (p.id.distance(hash), p.id))
            .chain(std::iter::once(local))
            .min();

        match best {
            Some((distance, id)) if id != self.local && distance <= max_distance => {
                Placement::Delegate(id)
            }
            _ => Placement::Local,
        }
    }
}
