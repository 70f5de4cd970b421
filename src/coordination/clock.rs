//! Merkle clock: a hash-linked logical clock.
//!
//! Every entry hashes its own content together with the hashes of the
//! frontier it was appended on top of, so causal history is recoverable by
//! walking parent hashes. The clock keeps the latest entry per peer (the
//! heads) plus every entry it has seen (the history).

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::trace;

use crate::coordination::peer::PeerId;
use crate::core::task::TaskId;
use crate::error::{Error, Result};

/// SHA-256 digest, displayed and serialized as hex.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(#[serde(with = "crate::util::hex32")] [u8; 32]);

impl ContentHash {
    /// Hash a sequence of byte strings. Each part is length-prefixed so
    /// `["ab", "c"]` and `["a", "bc"]` differ.
    pub fn of<P: AsRef<[u8]>>(parts: &[P]) -> Self {
        let mut hasher = Sha256::new();
        for part in parts {
            let part = part.as_ref();
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part);
        }
        Self(hasher.finalize().into())
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
}

impl std::fmt::Display for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ContentHash({})", self.short())
    }
}

/// Locally significant events recorded in the clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum ClockEvent {
    TaskScheduled { task: TaskId },
    TaskCompleted { task: TaskId },
    TaskDelegated { task: TaskId, peer: PeerId },
    /// A task offered by `from` was executed here.
    TaskHosted { task: TaskId, from: PeerId },
}

/// One hash-linked clock entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClockEntry {
    pub peer: PeerId,
    /// Monotonic per peer, starting at 1.
    pub counter: u64,
    pub event: ClockEvent,
    /// Frontier the entry was appended on.
    pub parents: BTreeSet<ContentHash>,
    pub hash: ContentHash,
}

impl ClockEntry {
    pub fn new(
        peer: PeerId,
        counter: u64,
        event: ClockEvent,
        parents: BTreeSet<ContentHash>,
    ) -> Self {
        let hash = Self::compute_hash(&peer, counter, &event, &parents);
        Self {
            peer,
            counter,
            event,
            parents,
            hash,
        }
    }

    fn compute_hash(
        peer: &PeerId,
        counter: u64,
        event: &ClockEvent,
        parents: &BTreeSet<ContentHash>,
    ) -> ContentHash {
        let event_bytes = serde_json::to_vec(event).unwrap_or_default();
        let counter_bytes = counter.to_be_bytes();
        let mut parts: Vec<&[u8]> = vec![
            peer.as_bytes().as_slice(),
            counter_bytes.as_slice(),
            event_bytes.as_slice(),
        ];
        parts.extend(parents.iter().map(|p| p.as_bytes().as_slice()));
        ContentHash::of(&parts)
    }

    /// Check that `hash` matches the entry's content.
    pub fn verify(&self) -> bool {
        self.counter > 0
            && Self::compute_hash(&self.peer, self.counter, &self.event, &self.parents) == self.hash
    }

    /// Ordering used to pick between two entries from the same peer.
    fn rank(&self) -> (u64, ContentHash) {
        (self.counter, self.hash)
    }
}

/// Latest-known entry per peer plus every entry seen so far.
#[derive(Debug, Clone)]
pub struct MerkleClock {
    owner: PeerId,
    heads: BTreeMap<PeerId, ClockEntry>,
    history: HashMap<ContentHash, ClockEntry>,
}

impl MerkleClock {
    pub fn new(owner: PeerId) -> Self {
        Self {
            owner,
            heads: BTreeMap::new(),
            history: HashMap::new(),
        }
    }

    pub fn owner(&self) -> PeerId {
        self.owner
    }

    /// Record a local event on top of the current frontier.
    pub fn append(&mut self, event: ClockEvent) -> ClockEntry {
        let counter = self.counter(&self.owner) + 1;
        let entry = ClockEntry::new(self.owner, counter, event, self.frontier());
        trace!(counter, hash = %entry.hash.short(), "clock append");
        self.insert(entry.clone());
        entry
    }

    /// Merge a single remote entry.
    ///
    /// Returns whether the entry was new. Entries whose hash does not match
    /// their content are rejected.
    pub fn observe(&mut self, entry: ClockEntry) -> Result<bool> {
        if !entry.verify() {
            return Err(Error::InvalidClockEntry(format!(
                "hash mismatch for entry {} from {}",
                entry.hash.short(),
                entry.peer.short()
            )));
        }
        if self.history.contains_key(&entry.hash) {
            return Ok(false);
        }
        self.insert(entry);
        Ok(true)
    }

    fn insert(&mut self, entry: ClockEntry) {
        let replace = self
            .heads
            .get(&entry.peer)
            .map(|head| entry.rank() > head.rank())
            .unwrap_or(true);
        if replace {
            self.heads.insert(entry.peer, entry.clone());
        }
        self.history.insert(entry.hash, entry);
    }

    /// Merge every entry known to `other` into this clock.
    ///
    /// Per peer the entry with the higher counter wins, ties broken by the
    /// larger hash. Histories are unioned.
    pub fn merge(&mut self, other: &MerkleClock) {
        for entry in other.history.values() {
            if !self.history.contains_key(&entry.hash) {
                self.insert(entry.clone());
            }
        }
    }

    /// Non-mutating merge.
    pub fn merged(&self, other: &MerkleClock) -> MerkleClock {
        let mut out = self.clone();
        out.merge(other);
        out
    }

    /// Hashes of the current per-peer heads.
    pub fn frontier(&self) -> BTreeSet<ContentHash> {
        self.heads.values().map(|e| e.hash).collect()
    }

    pub fn head(&self, peer: &PeerId) -> Option<&ClockEntry> {
        self.heads.get(peer)
    }

    pub fn heads(&self) -> impl Iterator<Item = &ClockEntry> {
        self.heads.values()
    }

    /// Latest counter known for `peer`, 0 if none.
    pub fn counter(&self, peer: &PeerId) -> u64 {
        self.heads.get(peer).map(|e| e.counter).unwrap_or(0)
    }

    pub fn get(&self, hash: &ContentHash) -> Option<&ClockEntry> {
        self.history.get(hash)
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Whether `a` is reachable by walking `b`'s parent hashes.
    pub fn precedes(&self, a: &ContentHash, b: &ContentHash) -> bool {
        let Some(start) = self.history.get(b) else {
            return false;
        };
        let mut seen = HashSet::new();
        let mut work: VecDeque<ContentHash> = start.parents.iter().copied().collect();
        while let Some(hash) = work.pop_front() {
            if hash == *a {
                return true;
            }
            if !seen.insert(hash) {
                continue;
            }
            if let Some(entry) = self.history.get(&hash) {
                work.extend(entry.parents.iter().copied());
            }
        }
        false
    }

    /// Neither entry precedes the other.
    pub fn concurrent(&self, a: &ContentHash, b: &ContentHash) -> bool {
        a != b && !self.precedes(a, b) && !self.precedes(b, a)
    }
}

/// Two clocks are equal when they know the same heads and history,
/// regardless of which peer owns them.
impl PartialEq for MerkleClock {
    fn eq(&self, other: &Self) -> bool {
        self.heads == other.heads
            && self.history.len() == other.history.len()
            && self.history.keys().all(|k| other.history.contains_key(k))
    }
}

impl Eq for MerkleClock {}
