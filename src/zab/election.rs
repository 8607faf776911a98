//! Bully leader election
//!
//! A candidate challenges every higher-ranked peer. Any higher peer that
//! answers takes over the election; if none does, the candidate declares
//! itself leader to the whole ensemble and synchronizes it.

use crate::common::{compare_addresses, NodeConfig, Result};
use crate::zab::messages::{DeclareLeader, ElectRequest, ElectResponse};
use crate::zab::peer_client::PeerClient;
use crate::zab::state::{ElectionState, ElectionTracker};
use crate::zab::sync::Synchronizer;
use crate::ztree::ZTree;
use rand::Rng;
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

pub const ELECT_PATH: &str = "/electLeader";
pub const DECLARE_PATH: &str = "/declareLeaderReceive";

/// How one election attempt ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionOutcome {
    /// This node declared itself leader
    Won,
    /// A higher peer declared itself
    Lost(String),
    /// Another election was already running here
    AlreadyRunning,
    /// No declare-leader message arrived within the retry budget
    GaveUp,
}

pub struct Election {
    config: Arc<NodeConfig>,
    store: Arc<ZTree>,
    peers: PeerClient,
    tracker: Arc<ElectionTracker>,
    sync: Arc<Synchronizer>,
}

impl Election {
    pub fn new(
        config: Arc<NodeConfig>,
        store: Arc<ZTree>,
        peers: PeerClient,
        tracker: Arc<ElectionTracker>,
        sync: Arc<Synchronizer>,
    ) -> Self {
        Self {
            config,
            store,
            peers,
            tracker,
            sync,
        }
    }

    pub fn tracker(&self) -> &ElectionTracker {
        &self.tracker
    }

    /// Peers that outrank this node
    pub fn higher_peers(&self) -> Vec<String> {
        higher_than(&self.config.node_address, &self.config.peers)
    }

    /// Start an election in the background
    pub fn spawn(self: &Arc<Self>) {
        let election = self.clone();
        tokio::spawn(async move {
            if let Err(e) = election.run().await {
                tracing::error!("Election failed: {}", e);
            }
        });
    }

    /// Run the Bully election to completion
    pub async fn run(&self) -> Result<ElectionOutcome> {
        if !self.tracker.try_start() {
            tracing::debug!("Election already running");
            return Ok(ElectionOutcome::AlreadyRunning);
        }

        let me = self.config.node_address.clone();
        let higher = self.higher_peers();
        let max_rounds = self.config.max_election_rounds.max(1);

        for attempt in 1..=max_rounds {
            tracing::info!(node = %me, attempt, challengers = higher.len(), "Starting election");

            let mut declares = self.tracker.subscribe_declares();

            let request = ElectRequest {
                address: me.clone(),
            };
            let replies = self
                .peers
                .gather::<_, ElectResponse>(&higher, ELECT_PATH, &request)
                .await;

            let outranked_by: Vec<String> = replies
                .into_iter()
                .filter_map(|(peer, res)| match res {
                    Ok(reply) if !reply.success => Some(peer),
                    Ok(_) => None,
                    Err(e) => {
                        tracing::debug!(peer = %peer, "Excluded from election: {}", e);
                        None
                    }
                })
                .collect();

            if outranked_by.is_empty() {
                self.win().await?;
                return Ok(ElectionOutcome::Won);
            }

            tracing::info!(outranked_by = ?outranked_by, "Waiting for a higher node to declare");
            let wait = tokio::time::timeout(self.config.election_timeout(), declares.changed());
            if let Ok(Ok(())) = wait.await {
                let leader = self.store.get_local()?.leader;
                if leader == me {
                    return Ok(ElectionOutcome::Won);
                }
                return Ok(ElectionOutcome::Lost(leader));
            }

            // spread retries so candidates do not collide
            let jitter = rand::thread_rng().gen_range(0..100);
            tokio::time::sleep(Duration::from_millis(jitter)).await;
        }

        tracing::warn!("No leader declared after {} rounds", max_rounds);
        self.tracker.set(ElectionState::Idle);
        Ok(ElectionOutcome::GaveUp)
    }

    async fn win(&self) -> Result<()> {
        let me = self.config.node_address.clone();
        self.sync.prepare();

        let declare = DeclareLeader {
            leader: me.clone(),
            peers: self.config.peers.clone(),
        };
        self.store
            .update_leader_and_peers(&declare.leader, &declare.peers)?;
        self.tracker.declared(true);
        tracing::info!(leader = %me, "Declared leader");

        for (peer, res) in self
            .peers
            .broadcast(&self.config.others(), DECLARE_PATH, &declare)
            .await
        {
            if let Err(e) = res {
                tracing::warn!(peer = %peer, "Declare not delivered: {}", e);
            }
        }

        // writes wait on the tracker, so a failed sync still releases them
        let _ = self.sync.run().await;
        Ok(())
    }

    // === Receiver side ===

    /// Answer a self-elect message; outranking the candidate starts our own election
    pub fn on_elect(self: &Arc<Self>, request: &ElectRequest) -> ElectResponse {
        let me = &self.config.node_address;
        let success = compare_addresses(&request.address, me) == Ordering::Greater;
        if !success {
            tracing::info!(candidate = %request.address, "Outranking candidate");
            if self.tracker.state() != ElectionState::Electing {
                self.spawn();
            }
        }
        ElectResponse {
            success,
            address: me.clone(),
        }
    }

    /// Accept a declare-leader message from the node it names.
    ///
    /// A declare from a node this one outranks is not applied; it means the
    /// sender missed this node during its challenge, so this node runs its
    /// own election instead.
    pub fn on_declare(
        self: &Arc<Self>,
        sender: Option<&str>,
        declare: &DeclareLeader,
    ) -> Result<()> {
        if sender != Some(declare.leader.as_str()) {
            tracing::warn!(
                sender = ?sender,
                leader = %declare.leader,
                "Declare not sent by the declared leader"
            );
            return Err(crate::common::Error::WrongSender {
                expected: declare.leader.clone(),
                actual: sender.unwrap_or_default().to_string(),
            });
        }
        let me = &self.config.node_address;
        if compare_addresses(&declare.leader, me) == Ordering::Less {
            tracing::warn!(leader = %declare.leader, "Declared leader is outranked, challenging it");
            self.spawn();
            return Ok(());
        }
        self.store
            .update_leader_and_peers(&declare.leader, &declare.peers)?;
        let is_self = declare.leader == *me;
        self.tracker.declared(is_self);
        tracing::info!(leader = %declare.leader, "Leader declared");
        Ok(())
    }
}

/// Members of `peers` ranked above `me`
pub fn higher_than(me: &str, peers: &[String]) -> Vec<String> {
    peers
        .iter()
        .filter(|p| compare_addresses(p, me) == Ordering::Greater)
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peers(list: &[&str]) -> Vec<String> {
        list.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_higher_than_numeric() {
        let ensemble = peers(&["8080", "8081", "8082", "10000"]);
        assert_eq!(higher_than("8081", &ensemble), peers(&["8082", "10000"]));
        assert!(higher_than("10000", &ensemble).is_empty());
    }

    #[test]
    fn test_higher_than_mixed() {
        let ensemble = peers(&["node-a", "node-c", "node-b"]);
        assert_eq!(higher_than("node-a", &ensemble), peers(&["node-c", "node-b"]));
    }

    #[test]
    fn test_highest_wins_from_any_initiator() {
        // whoever starts, the only node with no challenger is the top-ranked one
        let ensemble = peers(&["8081", "8080", "8082"]);
        let unchallenged: Vec<String> = ensemble
            .iter()
            .filter(|p| higher_than(p, &ensemble).is_empty())
            .cloned()
            .collect();
        assert_eq!(unchallenged, peers(&["8082"]));
    }
}
