//! Peer health monitor and the election trigger it feeds

use crate::common::{NodeConfig, Result};
use crate::zab::election::Election;
use crate::zab::messages::{FailureEvent, HealthCheck};
use crate::zab::peer_client::PeerClient;
use crate::ztree::ZTree;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const HEALTH_PATH: &str = "/";

/// Capacity of the failure channel; probes block when the listener lags
pub const FAILURE_CHANNEL_CAPACITY: usize = 64;

pub struct HealthMonitor {
    config: Arc<NodeConfig>,
    peers: PeerClient,
    failures: mpsc::Sender<FailureEvent>,
}

impl HealthMonitor {
    pub fn new(
        config: Arc<NodeConfig>,
        peers: PeerClient,
        failures: mpsc::Sender<FailureEvent>,
    ) -> Self {
        Self {
            config,
            peers,
            failures,
        }
    }

    /// Raise the one-shot startup event
    pub async fn wake_up(&self) {
        let event = FailureEvent::wakeup(self.config.node_address.clone());
        if self.failures.send(event).await.is_err() {
            tracing::warn!("Failure listener is gone");
        }
    }

    /// Probe every other peer once, returning the unreachable ones
    pub async fn probe_all(&self) -> Vec<String> {
        let ping = HealthCheck {
            message: "ping".to_string(),
            address: self.config.node_address.clone(),
        };
        let mut unreachable = Vec::new();
        let replies = self
            .peers
            .gather::<_, HealthCheck>(&self.config.others(), HEALTH_PATH, &ping)
            .await;
        for (peer, res) in replies {
            match res {
                Ok(pong) => tracing::debug!(peer = %peer, reply = %pong.message, "Peer healthy"),
                Err(e) if e.is_unreachable() => {
                    tracing::warn!(peer = %peer, "Peer unreachable: {}", e);
                    unreachable.push(peer);
                }
                Err(e) => tracing::warn!(peer = %peer, "Peer answered the probe with an error: {}", e),
            }
        }
        unreachable
    }

    /// Probe forever, every `health_interval`
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.config.health_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            for peer in self.probe_all().await {
                if self
                    .failures
                    .send(FailureEvent::unreachable(peer))
                    .await
                    .is_err()
                {
                    return;
                }
            }
        }
    }
}

/// Whether a failure event calls for an election
pub fn should_elect(event: &FailureEvent, leader: &str) -> bool {
    event.wakeup || leader.is_empty() || event.address == leader
}

/// Consume failure events and start elections when the leader is in doubt
pub fn spawn_failure_listener(
    mut failures: mpsc::Receiver<FailureEvent>,
    store: Arc<ZTree>,
    election: Arc<Election>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = failures.recv().await {
            let leader = match current_leader(&store) {
                Ok(leader) => leader,
                Err(e) => {
                    tracing::error!("Cannot read local znode: {}", e);
                    continue;
                }
            };
            if should_elect(&event, &leader) {
                tracing::info!(
                    address = %event.address,
                    at = %event.at,
                    wakeup = event.wakeup,
                    leader = %leader,
                    "Triggering election"
                );
                election.spawn();
            }
        }
    })
}

fn current_leader(store: &ZTree) -> Result<String> {
    Ok(store.get_local()?.leader)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_elect() {
        assert!(should_elect(&FailureEvent::wakeup("8080"), "8082"));
        assert!(should_elect(&FailureEvent::unreachable("8082"), "8082"));
        assert!(should_elect(&FailureEvent::unreachable("8081"), ""));
        assert!(!should_elect(&FailureEvent::unreachable("8081"), "8082"));
    }
}
