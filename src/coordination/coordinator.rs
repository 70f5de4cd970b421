//! Coordination loop.
//!
//! One tokio task owns the Merkle clock, the peer table and the table of
//! outstanding delegation offers. Everything else talks to it through a
//! [`CoordinatorHandle`], and remote peers through the inbound envelope
//! channel, so no state is shared between concurrent handlers.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::CoordinationConfig;
use crate::coordination::clock::{ClockEntry, ClockEvent, ContentHash, MerkleClock};
use crate::coordination::peer::{PeerId, PeerInfo, PeerTable, Placement};
use crate::coordination::protocol::{
    DelegatedTask, Envelope, OfferId, PeerMessage, TaskOutcome, Transport,
};
use crate::error::{Error, Result};

/// A task offered by a remote peer that this peer agreed to run.
///
/// Holds one of the `accept_capacity` slots until dropped.
#[derive(Debug)]
pub struct IncomingDelegation {
    pub from: PeerId,
    pub offer_id: OfferId,
    pub task: DelegatedTask,
    _permit: OwnedSemaphorePermit,
}

enum Command {
    Record {
        event: ClockEvent,
        reply: oneshot::Sender<ClockEntry>,
    },
    Place {
        hash: ContentHash,
        reply: oneshot::Sender<Placement>,
    },
    Offer {
        offer_id: OfferId,
        peer: PeerId,
        task: DelegatedTask,
        accepted: oneshot::Sender<std::result::Result<(), String>>,
        result: oneshot::Sender<TaskOutcome>,
    },
    Abandon {
        offer_id: OfferId,
    },
    Respond {
        to: PeerId,
        offer_id: OfferId,
        outcome: TaskOutcome,
    },
    AddPeer(PeerId),
    Clock {
        reply: oneshot::Sender<MerkleClock>,
    },
    Peers {
        reply: oneshot::Sender<Vec<PeerInfo>>,
    },
    PendingOffers {
        reply: oneshot::Sender<usize>,
    },
}

struct PendingOffer {
    peer: PeerId,
    accepted: Option<oneshot::Sender<std::result::Result<(), String>>>,
    result: oneshot::Sender<TaskOutcome>,
}

/// Coordination state before it is spawned.
pub struct Coordinator {
    local: PeerId,
    config: CoordinationConfig,
    transport: Arc<dyn Transport>,
    clock: MerkleClock,
    peers: PeerTable,
    pending: HashMap<OfferId, PendingOffer>,
    accept_slots: Arc<Semaphore>,
}

impl Coordinator {
    pub fn new(local: PeerId, config: CoordinationConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            local,
            clock: MerkleClock::new(local),
            peers: PeerTable::new(local, config.staleness_threshold()),
            pending: HashMap::new(),
            accept_slots: Arc::new(Semaphore::new(config.accept_capacity)),
            config,
            transport,
        }
    }

    /// Seed the peer table. Peers only become delegation targets once
    /// their gossip arrives.
    pub fn with_peers(mut self, peers: impl IntoIterator<Item = PeerId>) -> Self {
        for peer in peers {
            self.peers.add(peer);
        }
        self
    }

    pub fn local(&self) -> PeerId {
        self.local
    }

    /// Start the coordination loop.
    ///
    /// # Arguments
    ///
    /// * `inbound` - Envelopes addressed to this peer
    /// * `incoming` - Receives offers this peer accepted
    /// * `cancel` - Stops the loop
    pub fn spawn(
        self,
        inbound: mpsc::Receiver<Envelope>,
        incoming: mpsc::Sender<IncomingDelegation>,
        cancel: CancellationToken,
    ) -> CoordinatorHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(self.config.send_buffer.max(1));
        let handle = CoordinatorHandle {
            local: self.local,
            cmd_tx,
            offer_timeout: self.config.offer_timeout(),
            result_timeout: self.config.result_timeout(),
            cancel: cancel.clone(),
        };

        debug!(peer = %self.local.short(), "Coordinator::spawn");
        tokio::spawn(self.run(inbound, cmd_rx, incoming, cancel));
        handle
    }

    async fn run(
        mut self,
        mut inbound: mpsc::Receiver<Envelope>,
        mut commands: mpsc::Receiver<Command>,
        incoming: mpsc::Sender<IncomingDelegation>,
        cancel: CancellationToken,
    ) {
        let mut gossip = tokio::time::interval(self.config.gossip_interval());
        gossip.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(peer = %self.local.short(), "Coordinator cancelled");
                    break;
                }
                Some(command) = commands.recv() => self.handle_command(command).await,
                Some(envelope) = inbound.recv() => self.handle_message(envelope, &incoming).await,
                _ = gossip.tick() => self.heartbeat().await,
            }
        }
    }

    fn load(&self) -> usize {
        self.config
            .accept_capacity
            .saturating_sub(self.accept_slots.available_permits())
    }

    fn gossip(&self, entries: Vec<ClockEntry>) -> Envelope {
        Envelope {
            from: self.local,
            message: PeerMessage::Gossip {
                entries,
                load: self.load(),
                capacity: self.config.accept_capacity,
            },
        }
    }

    async fn broadcast(&self, entries: Vec<ClockEntry>) {
        for peer in self.peers.ids() {
            if let Err(e) = self.transport.send(peer, self.gossip(entries.clone())).await {
                warn!(peer = %peer.short(), error = %e, "dropped gossip");
            }
        }
    }

    async fn heartbeat(&self) {
        let heads: Vec<ClockEntry> = self.clock.heads().cloned().collect();
        for peer in self.peers.ids() {
            if let Err(e) = self.transport.send(peer, self.gossip(heads.clone())).await {
                debug!(peer = %peer.short(), error = %e, "heartbeat not delivered");
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Record { event, reply } => {
                let entry = self.clock.append(event);
                self.broadcast(vec![entry.clone()]).await;
                let _ = reply.send(entry);
            }
            Command::Place { hash, reply } => {
                let placement =
                    self.peers
                        .place(&hash, Instant::now(), self.config.max_delegation_distance);
                let _ = reply.send(placement);
            }
            Command::Offer {
                offer_id,
                peer,
                task,
                accepted,
                result,
            } => {
                let envelope = Envelope {
                    from: self.local,
                    message: PeerMessage::DelegationOffer { offer_id, task },
                };
                match self.transport.send(peer, envelope).await {
                    Ok(()) => {
                        self.pending.insert(
                            offer_id,
                            PendingOffer {
                                peer,
                                accepted: Some(accepted),
                                result,
                            },
                        );
                    }
                    Err(e) => {
                        let _ = accepted.send(Err(e.to_string()));
                    }
                }
            }
            Command::Abandon { offer_id } => {
                if self.pending.remove(&offer_id).is_some() {
                    debug!(%offer_id, "abandoned delegation offer");
                }
            }
            Command::Respond {
                to,
                offer_id,
                outcome,
            } => {
                let envelope = Envelope {
                    from: self.local,
                    message: PeerMessage::DelegationResult { offer_id, outcome },
                };
                if let Err(e) = self.transport.send(to, envelope).await {
                    warn!(peer = %to.short(), error = %e, "failed to return delegated result");
                }
            }
            Command::AddPeer(peer) => self.peers.add(peer),
            Command::Clock { reply } => {
                let _ = reply.send(self.clock.clone());
            }
            Command::Peers { reply } => {
                let infos = self
                    .peers
                    .ids()
                    .iter()
                    .filter_map(|id| self.peers.get(id).cloned())
                    .collect();
                let _ = reply.send(infos);
            }
            Command::PendingOffers { reply } => {
                let _ = reply.send(self.pending.len());
            }
        }
    }

    async fn handle_message(
        &mut self,
        envelope: Envelope,
        incoming: &mpsc::Sender<IncomingDelegation>,
    ) {
        let from = envelope.from;
        match envelope.message {
            PeerMessage::Gossip {
                entries,
                load,
                capacity,
            } => {
                self.peers.observe(from, load, capacity, Instant::now());
                for entry in entries {
                    if let Err(e) = self.clock.observe(entry) {
                        warn!(peer = %from.short(), error = %e, "ignored clock entry");
                    }
                }
            }
            PeerMessage::DelegationOffer { offer_id, task } => {
                self.peers.add(from);
                let reply = match self.accept_slots.clone().try_acquire_owned() {
                    Ok(permit) => {
                        let task_id = task.task_id;
                        let delegation = IncomingDelegation {
                            from,
                            offer_id,
                            task,
                            _permit: permit,
                        };
                        match incoming.send(delegation).await {
                            Ok(()) => {
                                info!(peer = %from.short(), task_id = %task_id, "accepted delegation");
                                PeerMessage::DelegationAccept { offer_id }
                            }
                            Err(_) => PeerMessage::DelegationReject {
                                offer_id,
                                reason: "shutting down".to_string(),
                            },
                        }
                    }
                    Err(_) => PeerMessage::DelegationReject {
                        offer_id,
                        reason: "over capacity".to_string(),
                    },
                };
                let envelope = Envelope {
                    from: self.local,
                    message: reply,
                };
                if let Err(e) = self.transport.send(from, envelope).await {
                    warn!(peer = %from.short(), error = %e, "failed to answer delegation offer");
                }
            }
            PeerMessage::DelegationAccept { offer_id } => {
                if let Some(pending) = self.pending.get_mut(&offer_id) {
                    if pending.peer == from {
                        if let Some(accepted) = pending.accepted.take() {
                            let _ = accepted.send(Ok(()));
                        }
                    }
                }
            }
            PeerMessage::DelegationReject { offer_id, reason } => {
                if self.pending.get(&offer_id).map(|p| p.peer) == Some(from) {
                    if let Some(mut pending) = self.pending.remove(&offer_id) {
                        if let Some(accepted) = pending.accepted.take() {
                            let _ = accepted.send(Err(reason));
                        }
                    }
                }
            }
            PeerMessage::DelegationResult { offer_id, outcome } => {
                if self.pending.get(&offer_id).map(|p| p.peer) == Some(from) {
                    if let Some(pending) = self.pending.remove(&offer_id) {
                        let _ = pending.result.send(outcome);
                    }
                }
            }
        }
    }
}

/// Cheap, cloneable access to a running coordinator.
#[derive(Clone)]
pub struct CoordinatorHandle {
    local: PeerId,
    cmd_tx: mpsc::Sender<Command>,
    offer_timeout: std::time::Duration,
    result_timeout: std::time::Duration,
    cancel: CancellationToken,
}

impl CoordinatorHandle {
    pub fn local(&self) -> PeerId {
        self.local
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx.send(make(tx)).await.map_err(|_| Error::ShutDown)?;
        rx.await.map_err(|_| Error::ShutDown)
    }

    /// Append a local event to the clock and gossip it.
    pub async fn record(&self, event: ClockEvent) -> Result<ClockEntry> {
        self.request(|reply| Command::Record { event, reply }).await
    }

    /// Where a task with `hash` should run, per the current peer table.
    pub async fn place(&self, hash: ContentHash) -> Result<Placement> {
        self.request(|reply| Command::Place { hash, reply }).await
    }

    /// Offer `task` to `peer` and wait for the answer.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DelegationRejected`] if the peer declines or the
    /// offer cannot be sent, and [`Error::DelegationTimeout`] if no answer
    /// arrives within the offer timeout.
    pub async fn delegate(&self, peer: PeerId, task: DelegatedTask) -> Result<PendingDelegation> {
        let offer_id = Uuid::new_v4();
        let (accepted_tx, accepted_rx) = oneshot::channel();
        let (result_tx, result_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Offer {
                offer_id,
                peer,
                task,
                accepted: accepted_tx,
                result: result_tx,
            })
            .await
            .map_err(|_| Error::ShutDown)?;

        match tokio::time::timeout(self.offer_timeout, accepted_rx).await {
            Ok(Ok(Ok(()))) => Ok(PendingDelegation {
                peer,
                offer_id,
                result_rx: Some(result_rx),
                timeout: self.result_timeout,
                cmd_tx: self.cmd_tx.clone(),
            }),
            Ok(Ok(Err(reason))) => Err(Error::DelegationRejected { peer, reason }),
            Ok(Err(_)) => Err(Error::ShutDown),
            Err(_) => {
                let _ = self.cmd_tx.send(Command::Abandon { offer_id }).await;
                Err(Error::DelegationTimeout {
                    peer,
                    timeout: self.offer_timeout,
                })
            }
        }
    }

    /// Send the outcome of a hosted delegation back to its origin.
    pub async fn respond(&self, to: PeerId, offer_id: OfferId, outcome: TaskOutcome) -> Result<()> {
        self.cmd_tx
            .send(Command::Respond {
                to,
                offer_id,
                outcome,
            })
            .await
            .map_err(|_| Error::ShutDown)
    }

    pub async fn add_peer(&self, peer: PeerId) -> Result<()> {
        self.cmd_tx
            .send(Command::AddPeer(peer))
            .await
            .map_err(|_| Error::ShutDown)
    }

    /// Snapshot of the clock.
    pub async fn clock(&self) -> Result<MerkleClock> {
        self.request(|reply| Command::Clock { reply }).await
    }

    pub async fn peers(&self) -> Result<Vec<PeerInfo>> {
        self.request(|reply| Command::Peers { reply }).await
    }

    /// Number of sent offers still waiting for an answer or a result.
    pub async fn pending_offers(&self) -> Result<usize> {
        self.request(|reply| Command::PendingOffers { reply }).await
    }

    /// Signal the coordination loop to stop.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// An accepted offer awaiting its result.
///
/// Dropping it before the result arrives abandons the offer, so the
/// coordinator forgets it even if the peer never answers.
pub struct PendingDelegation {
    peer: PeerId,
    offer_id: OfferId,
    /// `None` once the result arrived or the offer was abandoned.
    result_rx: Option<oneshot::Receiver<TaskOutcome>>,
    timeout: std::time::Duration,
    cmd_tx: mpsc::Sender<Command>,
}

impl PendingDelegation {
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// Wait for the remote outcome, bounded by the result timeout.
    pub async fn outcome(mut self) -> Result<TaskOutcome> {
        let Some(result_rx) = self.result_rx.as_mut() else {
            return Err(Error::ShutDown);
        };
        match tokio::time::timeout(self.timeout, result_rx).await {
            Ok(Ok(outcome)) => {
                self.result_rx = None;
                Ok(outcome)
            }
            // The coordinator dropped the offer itself.
            Ok(Err(_)) => {
                self.result_rx = None;
                Err(Error::ShutDown)
            }
            Err(_) => {
                self.result_rx = None;
                let _ = self
                    .cmd_tx
                    .send(Command::Abandon {
                        offer_id: self.offer_id,
                    })
                    .await;
                Err(Error::DelegationTimeout {
                    peer: self.peer,
                    timeout: self.timeout,
                })
            }
        }
    }
}

impl Drop for PendingDelegation {
    fn drop(&mut self) {
        if self.result_rx.take().is_some() {
            debug!(offer_id = %self.offer_id, "dropping unresolved delegation");
            if self
                .cmd_tx
                .try_send(Command::Abandon {
                    offer_id: self.offer_id,
                })
                .is_err()
            {
                warn!(offer_id = %self.offer_id, "could not abandon delegation offer");
            }
        }
    }
}
