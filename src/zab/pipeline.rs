//! Atomic broadcast of writes: propose, acknowledge, commit
//!
//! Only the leader drives a round. Followers forward client writes to it,
//! acknowledge its proposals and apply its commits.

use crate::common::{Error, NodeConfig, Result};
use crate::zab::messages::{Ack, Commit, DeleteRequest, Proposal, WriteRequest};
use crate::zab::peer_client::PeerClient;
use crate::zab::state::{ProposalEvent, ProposalState, ProposalTracker, SyncTracker};
use crate::ztree::{MetadataRecord, ZTree};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

pub const PROPOSE_PATH: &str = "/proposeWrite";
pub const ACK_PATH: &str = "/acknowledgeProposal";
pub const COMMIT_PATH: &str = "/commitWrite";
pub const DELETE_PATH: &str = "/deleteMetadata";

/// Reject a message whose sender is not the leader recorded in `store`
pub fn ensure_from_leader(store: &ZTree, sender: Option<&str>) -> Result<String> {
    let leader = store.get_local()?.leader;
    let actual = sender.unwrap_or_default();
    if leader.is_empty() || actual != leader {
        tracing::warn!(sender = %actual, leader = %leader, "Dropping message from non-leader");
        return Err(Error::WrongSender {
            expected: leader,
            actual: actual.to_string(),
        });
    }
    Ok(leader)
}

/// Time left before `deadline`; every wait of one write shares a deadline
fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

/// The last committed round, kept so a late acknowledgement can still be
/// answered with its commit
struct LastCommit {
    commit: Commit,
    delivered: HashSet<String>,
}

pub struct Pipeline {
    config: Arc<NodeConfig>,
    store: Arc<ZTree>,
    peers: PeerClient,
    proposal: Arc<ProposalTracker>,
    sync: Arc<SyncTracker>,
    last_commit: Mutex<Option<LastCommit>>,
}

impl Pipeline {
    pub fn new(
        config: Arc<NodeConfig>,
        store: Arc<ZTree>,
        peers: PeerClient,
        proposal: Arc<ProposalTracker>,
        sync: Arc<SyncTracker>,
    ) -> Self {
        Self {
            config,
            store,
            peers,
            proposal,
            sync,
            last_commit: Mutex::new(None),
        }
    }

    pub fn proposal(&self) -> &ProposalTracker {
        &self.proposal
    }

    /// Leader as recorded in the local znode
    pub fn leader(&self) -> Result<String> {
        Ok(self.store.get_local()?.leader)
    }

    pub fn is_leader(&self) -> Result<bool> {
        Ok(self.leader()? == self.config.node_address)
    }

    /// Reject a message whose sender is not the current leader
    pub fn ensure_from_leader(&self, sender: Option<&str>) -> Result<String> {
        ensure_from_leader(&self.store, sender)
    }

    fn set_last_commit(&self, commit: Commit, delivered: HashSet<String>) {
        let mut slot = self.last_commit.lock().unwrap_or_else(|p| p.into_inner());
        *slot = Some(LastCommit { commit, delivered });
    }

    /// Mark `peer` as served for `round`, returning the commit if it was not yet
    fn claim_delivery(&self, round: u64, peer: &str) -> Option<Commit> {
        let mut slot = self.last_commit.lock().unwrap_or_else(|p| p.into_inner());
        let last = slot.as_mut()?;
        if last.commit.round == round && last.delivered.insert(peer.to_string()) {
            Some(last.commit.clone())
        } else {
            None
        }
    }

    // === Leader ===

    /// Run one write through propose, acknowledge and commit.
    ///
    /// `receiver` is the node that first accepted the write.
    pub async fn lead(&self, mut request: WriteRequest, receiver: &str) -> Result<MetadataRecord> {
        if request.metadata.sender_address.is_empty() {
            return Err(Error::InvalidRequest("metadata.senderAddress is required".into()));
        }
        if request.metadata.timestamp.is_empty() {
            request.metadata.timestamp = request.timestamp.to_string();
        }
        if request.metadata.receiver_address.is_empty() {
            request.metadata.receiver_address = receiver.to_string();
        }

        let deadline = Instant::now() + self.config.proposal_timeout();
        self.sync.wait_idle(remaining(deadline)).await?;
        let round = self.proposal.acquire(remaining(deadline)).await?;

        tracing::info!(
            round,
            sender = %request.metadata.sender_address,
            timestamp = %request.timestamp,
            "Proposing write"
        );

        let followers = self.config.others();
        let proposal = Proposal {
            round,
            request: request.clone(),
        };
        for (peer, res) in self.peers.broadcast(&followers, PROPOSE_PATH, &proposal).await {
            if let Err(e) = res {
                tracing::warn!(round, peer = %peer, "Proposal not delivered: {}", e);
            }
        }

        if let Err(e) = self
            .proposal
            .wait_acknowledged(round, remaining(deadline))
            .await
        {
            self.proposal.observe(ProposalEvent::Abort);
            tracing::warn!(round, "Aborting proposal without a majority: {}", e);
            return Err(Error::ConsensusTimeout(format!(
                "round {} not acknowledged by a majority",
                round
            )));
        }

        let outcome = match self.store.upsert(&request.metadata) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.proposal.observe(ProposalEvent::Abort);
                return Err(e);
            }
        };
        let record = outcome.record().clone();
        if !outcome.changed() {
            tracing::debug!(round, id = record.id, "Write left the record unchanged");
        }

        let commit = Commit {
            round,
            request,
            record: record.clone(),
        };

        // commit on the acknowledgers before reopening the gate
        let acked: Vec<String> = self.proposal.acked().into_iter().collect();
        self.send_commits(&acked, &commit).await;
        self.set_last_commit(commit.clone(), acked.into_iter().collect());

        let mut late = Vec::new();
        for peer in self.proposal.commit() {
            if self.claim_delivery(round, &peer).is_some() {
                late.push(peer);
            }
        }
        self.send_commits(&late, &commit).await;

        self.notify_clients(&record, &commit.request.payload);

        tracing::info!(round, id = record.id, version = record.version, "Write committed");
        Ok(record)
    }

    async fn send_commits(&self, followers: &[String], commit: &Commit) {
        for (peer, res) in self.peers.broadcast(followers, COMMIT_PATH, commit).await {
            if let Err(e) = res {
                tracing::warn!(round = commit.round, peer = %peer, "Commit not delivered: {}", e);
            }
        }
    }

    /// Handle an acknowledgement from a follower
    pub async fn on_ack(&self, ack: Ack) -> Result<ProposalState> {
        if !self.is_leader()? {
            return Err(Error::NotLeader(self.leader()?));
        }
        if !self.config.peers.contains(&ack.address) || ack.address == self.config.node_address {
            return Err(Error::InvalidRequest(format!(
                "{} is not a follower of this ensemble",
                ack.address
            )));
        }

        let (state, quorum) = self.proposal.observe(ProposalEvent::Ack {
            round: ack.round,
            from: ack.address.clone(),
        });
        tracing::debug!(round = ack.round, from = %ack.address, %state, quorum, "Ack received");

        // the round already committed without this follower
        let late_commit = if self.proposal.last_committed() == Some(ack.round) {
            self.claim_delivery(ack.round, &ack.address)
        } else {
            None
        };
        if let Some(commit) = late_commit {
            tracing::info!(round = ack.round, peer = %ack.address, "Sending late commit");
            if let Err(e) = self.peers.notify(&ack.address, COMMIT_PATH, &commit).await {
                tracing::warn!(peer = %ack.address, "Late commit not delivered: {}", e);
            }
        }
        Ok(state)
    }

    /// Best-effort delivery of the payload to each downstream client
    fn notify_clients(&self, record: &MetadataRecord, payload: &serde_json::Value) {
        if payload.is_null() || record.clients.is_empty() {
            return;
        }
        for client in record.clients.clone() {
            let peers = self.peers.clone();
            let path = self.config.notify_path.clone();
            let payload = payload.clone();
            tokio::spawn(async move {
                if let Err(e) = peers.notify(&client, &path, &payload).await {
                    tracing::warn!(client = %client, "Client notification failed: {}", e);
                }
            });
        }
    }

    /// Administrative delete, replicated by the leader
    pub async fn delete(&self, id: u64) -> Result<MetadataRecord> {
        let deadline = Instant::now() + self.config.proposal_timeout();
        self.sync.wait_idle(remaining(deadline)).await?;
        let round = self.proposal.acquire(remaining(deadline)).await?;

        let removed = match self.store.delete(id) {
            Ok(record) => record,
            Err(e) => {
                self.proposal.observe(ProposalEvent::Abort);
                return Err(e);
            }
        };

        let followers = self.config.others();
        for (peer, res) in self
            .peers
            .broadcast(&followers, DELETE_PATH, &DeleteRequest { id })
            .await
        {
            if let Err(e) = res {
                tracing::warn!(peer = %peer, id, "Delete not replicated: {}", e);
            }
        }
        self.proposal.commit();

        tracing::info!(round, id, "Record deleted");
        Ok(removed)
    }

    // === Follower ===

    /// Accept a proposal from the leader and acknowledge it in the background
    pub fn on_proposal(&self, sender: Option<&str>, proposal: &Proposal) -> Result<()> {
        let leader = self.ensure_from_leader(sender)?;
        tracing::debug!(round = proposal.round, leader = %leader, "Proposal received");

        let ack = Ack {
            round: proposal.round,
            address: self.config.node_address.clone(),
        };
        let peers = self.peers.clone();
        tokio::spawn(async move {
            if let Err(e) = peers.notify(&leader, ACK_PATH, &ack).await {
                tracing::warn!(round = ack.round, leader = %leader, "Ack not delivered: {}", e);
            }
        });
        Ok(())
    }

    /// Apply a commit from the leader
    pub fn on_commit(&self, sender: Option<&str>, commit: &Commit) -> Result<bool> {
        self.ensure_from_leader(sender)?;
        let applied = self.store.apply(&commit.record)?;
        tracing::debug!(
            round = commit.round,
            id = commit.record.id,
            version = commit.record.version,
            applied,
            "Commit applied"
        );
        Ok(applied)
    }

    /// Raw apply of a committed record; only this node or the leader may call it
    pub fn write_metadata(&self, sender: Option<&str>, record: &MetadataRecord) -> Result<bool> {
        if sender != Some(self.config.node_address.as_str()) {
            self.ensure_from_leader(sender)?;
        }
        self.store.apply(record)
    }

    /// Apply a replicated delete from the leader
    pub fn on_delete(&self, sender: Option<&str>, request: &DeleteRequest) -> Result<MetadataRecord> {
        self.ensure_from_leader(sender)?;
        self.store.delete(request.id)
    }
}
