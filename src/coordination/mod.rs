//! Peer coordination: causal clock, placement and delegation.
//!
//! Peers never agree on a global order. Causality travels through the
//! Merkle clock, and placement is a deterministic Hamming-distance function
//! so any peer can predict which peer should take a task.

pub mod clock;
pub mod coordinator;
pub mod peer;
pub mod protocol;

pub use clock::{ClockEntry, ClockEvent, ContentHash, MerkleClock};
pub use coordinator::{Coordinator, CoordinatorHandle, IncomingDelegation, PendingDelegation};
pub use peer::{hamming, PeerId, PeerInfo, PeerTable, Placement};
pub use protocol::{
    DelegatedTask, Envelope, LocalNetwork, OfferId, PeerMessage, TaskOutcome, Transport,
};
