//! Peer messages and the transport seam.
//!
//! A transport only needs to deliver [`Envelope`]s to the recipient's
//! inbound channel. [`LocalNetwork`] wires peers inside one process.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, RwLock};
use tracing::trace;
use uuid::Uuid;

use crate::coordination::clock::{ClockEntry, ContentHash};
use crate::coordination::peer::PeerId;
use crate::core::task::{TaskId, TaskNode};
use crate::error::{Error, Result};

/// Correlates an offer with its accept/reject and result.
pub type OfferId = Uuid;

/// A task handed to another peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelegatedTask {
    pub task_id: TaskId,
    pub name: String,
    pub payload: Value,
    pub inputs: Vec<Value>,
    /// Zero-based execution attempt on the origin peer.
    pub attempt: u32,
    pub content_hash: ContentHash,
}

impl DelegatedTask {
    pub fn from_node(task: &TaskNode) -> Self {
        Self {
            task_id: task.id,
            name: task.name.clone(),
            payload: task.payload.clone(),
            inputs: task.inputs.clone(),
            attempt: task.retry_count,
            content_hash: task.content_hash(),
        }
    }
}

/// Result of running a task, local or remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum TaskOutcome {
    Completed { result: Value },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum PeerMessage {
    /// Clock entries plus the sender's load, doubling as a heartbeat.
    Gossip {
        entries: Vec<ClockEntry>,
        load: usize,
        capacity: usize,
    },
    DelegationOffer {
        offer_id: OfferId,
        task: DelegatedTask,
    },
    DelegationAccept {
        offer_id: OfferId,
    },
    DelegationReject {
        offer_id: OfferId,
        reason: String,
    },
    DelegationResult {
        offer_id: OfferId,
        outcome: TaskOutcome,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: PeerId,
    pub message: PeerMessage,
}

/// Outbound half of a peer link. Inbound messages arrive on the
/// `mpsc::Receiver<Envelope>` handed to the coordinator.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver `envelope` to `to`. Must not wait for the recipient to
    /// process the message.
    async fn send(&self, to: PeerId, envelope: Envelope) -> Result<()>;
}

/// In-process mesh of peers connected by bounded channels.
#[derive(Clone)]
pub struct LocalNetwork {
    inboxes: Arc<RwLock<HashMap<PeerId, mpsc::Sender<Envelope>>>>,
    buffer: usize,
}

impl LocalNetwork {
    pub fn new(buffer: usize) -> Self {
        Self {
            inboxes: Arc::new(RwLock::new(HashMap::new())),
            buffer: buffer.max(1),
        }
    }

    /// Attach `peer` and return its inbound channel.
    pub async fn register(&self, peer: PeerId) -> mpsc::Receiver<Envelope> {
        let (tx, rx) = mpsc::channel(self.buffer);
        self.inboxes.write().await.insert(peer, tx);
        rx
    }

    /// Detach `peer`; later sends to it fail.
    pub async fn disconnect(&self, peer: &PeerId) {
        self.inboxes.write().await.remove(peer);
    }

    pub async fn peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self.inboxes.read().await.keys().copied().collect();
        peers.sort();
        peers
    }
}

#[async_trait]
impl Transport for LocalNetwork {
    async fn send(&self, to: PeerId, envelope: Envelope) -> Result<()> {
        let inboxes = self.inboxes.read().await;
        let inbox = inboxes
            .get(&to)
            .ok_or_else(|| Error::Transport(format!("unknown peer {}", to.short())))?;
        trace!(to = %to.short(), "local send");
        inbox.try_send(envelope).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                Error::Transport(format!("inbox of {} is full", to.short()))
            }
            mpsc::error::TrySendError::Closed(_) => {
                Error::Transport(format!("peer {} is gone", to.short()))
            }
        })
    }
}
