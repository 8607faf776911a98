//! Data synchronization run by a newly elected leader
//!
//! Prepare gathers the highest record id of a majority, catch-up pulls the
//! records the leader is missing, push sends every acked peer what it is
//! missing. Records are only ever added when their id is free, so a run can
//! be repeated safely.

use crate::common::{Error, NodeConfig, Result};
use crate::zab::messages::{RecordList, RequestMetadata, SyncRequest, SyncResponse};
use crate::zab::peer_client::PeerClient;
use crate::zab::pipeline::ensure_from_leader;
use crate::zab::state::{SyncEvent, SyncState, SyncTracker};
use crate::ztree::{MetadataRecord, ZTree};
use std::sync::Arc;

pub const SYNC_REQUEST_PATH: &str = "/syncRequest";
pub const SYNC_RESPONSE_PATH: &str = "/syncResponse";
pub const REQUEST_METADATA_PATH: &str = "/requestMetadata";
pub const UPDATE_METADATA_PATH: &str = "/updateMetadata";

/// Summary of one synchronization run
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub acked_peers: usize,
    pub pulled: usize,
    pub pushed: usize,
}

pub struct Synchronizer {
    config: Arc<NodeConfig>,
    store: Arc<ZTree>,
    peers: PeerClient,
    tracker: Arc<SyncTracker>,
    // one run at a time; a re-elected leader may trigger overlapping runs
    running: tokio::sync::Mutex<()>,
}

impl Synchronizer {
    pub fn new(
        config: Arc<NodeConfig>,
        store: Arc<ZTree>,
        peers: PeerClient,
        tracker: Arc<SyncTracker>,
    ) -> Self {
        Self {
            config,
            store,
            peers,
            tracker,
            running: tokio::sync::Mutex::new(()),
        }
    }

    pub fn tracker(&self) -> &SyncTracker {
        &self.tracker
    }

    /// Hold writes back until [`run`](Self::run) finishes
    pub fn prepare(&self) {
        if self.tracker.state() == SyncState::Synced {
            self.tracker.observe(SyncEvent::Prepare);
        }
    }

    /// Run the three phases; the tracker is back to `Synced` afterwards
    pub async fn run(&self) -> Result<SyncReport> {
        let _running = self.running.lock().await;
        self.prepare();
        let res = self.run_phases().await;
        self.tracker.observe(SyncEvent::Finish);
        match &res {
            Ok(report) => tracing::info!(
                acked = report.acked_peers,
                pulled = report.pulled,
                pushed = report.pushed,
                "Synchronization finished"
            ),
            Err(e) => tracing::warn!("Synchronization abandoned: {}", e),
        }
        res
    }

    async fn run_phases(&self) -> Result<SyncReport> {
        let others = self.config.others();
        let request = SyncRequest {
            address: self.config.node_address.clone(),
        };
        for (peer, res) in self
            .peers
            .broadcast(&others, SYNC_REQUEST_PATH, &request)
            .await
        {
            if let Err(e) = res {
                tracing::debug!(peer = %peer, "Sync request not delivered: {}", e);
            }
        }

        self.tracker
            .wait_acked(self.config.sync_timeout())
            .await
            .map_err(|_| Error::ConsensusTimeout("sync prepare quorum not reached".into()))?;

        let pulled = self.catch_up(&others).await?;
        let acked = self.tracker.acked_peers();
        let pushed = self.push(&acked).await?;

        Ok(SyncReport {
            acked_peers: acked.len(),
            pulled,
            pushed,
        })
    }

    async fn catch_up(&self, others: &[String]) -> Result<usize> {
        let request = RequestMetadata {
            highest_id: self.store.highest_id()?,
        };
        let mut pulled = 0;
        for (peer, res) in self
            .peers
            .gather::<_, RecordList>(others, REQUEST_METADATA_PATH, &request)
            .await
        {
            match res {
                Ok(list) => pulled += insert_missing(&self.store, &list.records)?,
                Err(e) => tracing::debug!(peer = %peer, "Catch-up skipped: {}", e),
            }
        }
        Ok(pulled)
    }

    async fn push(&self, acked: &std::collections::HashMap<String, u64>) -> Result<usize> {
        let mut pushed = 0;
        for (peer, highest_id) in acked {
            let list = RecordList {
                records: self.store.records_after(*highest_id)?,
            };
            if list.records.is_empty() {
                continue;
            }
            match self.peers.notify(peer, UPDATE_METADATA_PATH, &list).await {
                Ok(()) => pushed += list.records.len(),
                Err(e) => tracing::warn!(peer = %peer, "Sync push failed: {}", e),
            }
        }
        Ok(pushed)
    }

    // === Peer side ===

    /// Answer a prepare from the leader in the background
    pub fn on_sync_request(&self, sender: Option<&str>, request: SyncRequest) -> Result<()> {
        let leader = ensure_from_leader(&self.store, sender)?;
        if request.address != leader {
            return Err(Error::InvalidRequest(format!(
                "sync request names {} but the leader is {}",
                request.address, leader
            )));
        }
        let response = SyncResponse {
            address: self.config.node_address.clone(),
            highest_id: self.store.highest_id()?,
        };
        let peers = self.peers.clone();
        tokio::spawn(async move {
            if let Err(e) = peers
                .notify(&request.address, SYNC_RESPONSE_PATH, &response)
                .await
            {
                tracing::warn!(leader = %request.address, "Sync response not delivered: {}", e);
            }
        });
        Ok(())
    }

    /// Count a peer's prepare answer; only ensemble members may answer
    pub fn on_sync_response(
        &self,
        sender: Option<&str>,
        response: SyncResponse,
    ) -> Result<SyncState> {
        if sender != Some(response.address.as_str()) {
            tracing::warn!(
                sender = ?sender,
                peer = %response.address,
                "Sync response from another node"
            );
            return Err(Error::WrongSender {
                expected: response.address,
                actual: sender.unwrap_or_default().to_string(),
            });
        }
        if !self.config.others().contains(&response.address) {
            return Err(Error::InvalidRequest(format!(
                "{} is not a member of this ensemble",
                response.address
            )));
        }
        let (state, quorum) = self.tracker.observe(SyncEvent::PeerAck {
            from: response.address.clone(),
            highest_id: response.highest_id,
        });
        tracing::debug!(peer = %response.address, highest_id = response.highest_id, %state, quorum, "Sync ack");
        Ok(state)
    }

    /// Records this node holds beyond the requester's highest id
    pub fn on_request_metadata(
        &self,
        sender: Option<&str>,
        request: &RequestMetadata,
    ) -> Result<RecordList> {
        ensure_from_leader(&self.store, sender)?;
        Ok(RecordList {
            records: self.store.records_after(request.highest_id)?,
        })
    }

    /// Insert pushed records whose id is still free
    pub fn on_update_metadata(&self, sender: Option<&str>, list: &RecordList) -> Result<usize> {
        ensure_from_leader(&self.store, sender)?;
        insert_missing(&self.store, &list.records)
    }
}

/// Insert every non-local record whose id is absent; returns how many were added
pub fn insert_missing(store: &ZTree, records: &[MetadataRecord]) -> Result<usize> {
    let mut added = 0;
    for record in records.iter().filter(|r| !r.is_local() && r.id != 0) {
        if store.insert_if_absent(record)? {
            added += 1;
        }
    }
    Ok(added)
}
