//! Proposal, synchronization and election state machines
//!
//! The trackers are plain state machines behind a mutex. They do no
//! networking: handlers feed them events through `observe` and waiters
//! subscribe to the published state through a watch channel.

use crate::common::{quorum, Error, Result};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // The guarded data stays consistent even if a holder panicked
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Wait on a watch channel until `pred` holds or `timeout` expires
async fn wait_until<S, F>(rx: &mut watch::Receiver<S>, timeout: Duration, pred: F) -> Result<()>
where
    F: FnMut(&S) -> bool,
{
    match tokio::time::timeout(timeout, rx.wait_for(pred)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(_)) => Err(Error::Internal("state channel closed".into())),
        Err(_) => Err(Error::Timeout(format!("no transition within {:?}", timeout))),
    }
}

// ============================================================================
// Proposal
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposalState {
    /// Idle; a new write may start
    Committed,
    Proposed,
    Acknowledged,
}

impl fmt::Display for ProposalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProposalState::Committed => write!(f, "committed"),
            ProposalState::Proposed => write!(f, "proposed"),
            ProposalState::Acknowledged => write!(f, "acknowledged"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProposalEvent {
    Propose,
    Ack { round: u64, from: String },
    Commit,
    Abort,
}

struct ProposalInner {
    state: ProposalState,
    round: u64,
    acked: HashSet<String>,
    last_committed: Option<u64>,
}

/// Leader-side counter for one outstanding proposal
pub struct ProposalTracker {
    inner: Mutex<ProposalInner>,
    ensemble_size: usize,
    state_tx: watch::Sender<ProposalState>,
}

impl ProposalTracker {
    pub fn new(ensemble_size: usize) -> Self {
        let (state_tx, _) = watch::channel(ProposalState::Committed);
        Self {
            inner: Mutex::new(ProposalInner {
                state: ProposalState::Committed,
                round: 0,
                acked: HashSet::new(),
                last_committed: None,
            }),
            ensemble_size,
            state_tx,
        }
    }

    fn quorum_reached(&self, inner: &ProposalInner) -> bool {
        // the leader counts for itself
        inner.acked.len() + 1 >= quorum(self.ensemble_size)
    }

    fn apply(&self, inner: &mut ProposalInner, event: ProposalEvent) -> (ProposalState, bool) {
        match event {
            ProposalEvent::Propose => {
                if inner.state == ProposalState::Committed {
                    inner.round += 1;
                    inner.acked.clear();
                    inner.state = if self.quorum_reached(inner) {
                        ProposalState::Acknowledged
                    } else {
                        ProposalState::Proposed
                    };
                }
            }
            ProposalEvent::Ack { round, from } => {
                let live = matches!(
                    inner.state,
                    ProposalState::Proposed | ProposalState::Acknowledged
                );
                if live && round == inner.round {
                    inner.acked.insert(from);
                    if inner.state == ProposalState::Proposed && self.quorum_reached(inner) {
                        inner.state = ProposalState::Acknowledged;
                    }
                }
            }
            ProposalEvent::Commit => {
                if inner.state != ProposalState::Committed {
                    inner.last_committed = Some(inner.round);
                    inner.state = ProposalState::Committed;
                }
            }
            ProposalEvent::Abort => {
                inner.state = ProposalState::Committed;
            }
        }
        self.state_tx.send_replace(inner.state);
        (inner.state, self.quorum_reached(inner))
    }

    /// Feed one event, returning the new state and whether a majority acked
    pub fn observe(&self, event: ProposalEvent) -> (ProposalState, bool) {
        let mut inner = lock(&self.inner);
        self.apply(&mut inner, event)
    }

    /// Start a new round if the node is idle, returning its number
    pub fn begin(&self) -> Option<u64> {
        let mut inner = lock(&self.inner);
        if inner.state != ProposalState::Committed {
            return None;
        }
        self.apply(&mut inner, ProposalEvent::Propose);
        Some(inner.round)
    }

    /// Commit the current round and return every follower that acked it
    pub fn commit(&self) -> HashSet<String> {
        let mut inner = lock(&self.inner);
        self.apply(&mut inner, ProposalEvent::Commit);
        inner.acked.clone()
    }

    pub fn state(&self) -> ProposalState {
        lock(&self.inner).state
    }

    pub fn round(&self) -> u64 {
        lock(&self.inner).round
    }

    pub fn last_committed(&self) -> Option<u64> {
        lock(&self.inner).last_committed
    }

    /// Followers that acked the current (or last committed) round
    pub fn acked(&self) -> HashSet<String> {
        lock(&self.inner).acked.clone()
    }

    /// Wait for the node to become idle and open a round, within `timeout`
    pub async fn acquire(&self, timeout: Duration) -> Result<u64> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut rx = self.state_tx.subscribe();
        loop {
            if let Some(round) = self.begin() {
                return Ok(round);
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return Err(Error::ConsensusTimeout(
                    "previous proposal still outstanding".into(),
                ));
            }
            wait_until(&mut rx, remaining, |s| *s == ProposalState::Committed)
                .await
                .map_err(|_| {
                    Error::ConsensusTimeout("previous proposal still outstanding".into())
                })?;
        }
    }

    /// Wait until `round` reaches a majority of acknowledgements
    pub async fn wait_acknowledged(&self, round: u64, timeout: Duration) -> Result<()> {
        let mut rx = self.state_tx.subscribe();
        wait_until(&mut rx, timeout, |s| *s != ProposalState::Proposed).await?;
        let inner = lock(&self.inner);
        if inner.round == round && inner.state == ProposalState::Acknowledged {
            Ok(())
        } else {
            Err(Error::ConsensusTimeout(format!("round {} was abandoned", round)))
        }
    }
}

// ============================================================================
// Synchronization
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Prepared,
    Acked,
    /// Idle; writes may proceed
    Synced,
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncState::Prepared => write!(f, "prepared"),
            SyncState::Acked => write!(f, "acked"),
            SyncState::Synced => write!(f, "synced"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    Prepare,
    PeerAck { from: String, highest_id: u64 },
    Finish,
}

struct SyncInner {
    state: SyncState,
    peers: HashMap<String, u64>,
}

/// Leader-side counter for one synchronization run
pub struct SyncTracker {
    inner: Mutex<SyncInner>,
    ensemble_size: usize,
    state_tx: watch::Sender<SyncState>,
}

impl SyncTracker {
    pub fn new(ensemble_size: usize) -> Self {
        let (state_tx, _) = watch::channel(SyncState::Synced);
        Self {
            inner: Mutex::new(SyncInner {
                state: SyncState::Synced,
                peers: HashMap::new(),
            }),
            ensemble_size,
            state_tx,
        }
    }

    fn quorum_reached(&self, inner: &SyncInner) -> bool {
        inner.peers.len() + 1 >= quorum(self.ensemble_size)
    }

    pub fn observe(&self, event: SyncEvent) -> (SyncState, bool) {
        let mut inner = lock(&self.inner);
        match event {
            SyncEvent::Prepare => {
                inner.peers.clear();
                inner.state = if self.quorum_reached(&inner) {
                    SyncState::Acked
                } else {
                    SyncState::Prepared
                };
            }
            SyncEvent::PeerAck { from, highest_id } => {
                if inner.state != SyncState::Synced {
                    inner.peers.insert(from, highest_id);
                    if inner.state == SyncState::Prepared && self.quorum_reached(&inner) {
                        inner.state = SyncState::Acked;
                    }
                }
            }
            SyncEvent::Finish => {
                inner.state = SyncState::Synced;
            }
        }
        self.state_tx.send_replace(inner.state);
        (inner.state, self.quorum_reached(&inner))
    }

    pub fn state(&self) -> SyncState {
        lock(&self.inner).state
    }

    /// Peers that answered the prepare, with their highest record id
    pub fn acked_peers(&self) -> HashMap<String, u64> {
        lock(&self.inner).peers.clone()
    }

    pub async fn wait_acked(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.state_tx.subscribe();
        wait_until(&mut rx, timeout, |s| *s == SyncState::Acked).await
    }

    /// Wait until no synchronization is running
    pub async fn wait_idle(&self, timeout: Duration) -> Result<()> {
        let mut rx = self.state_tx.subscribe();
        wait_until(&mut rx, timeout, |s| *s == SyncState::Synced)
            .await
            .map_err(|_| Error::ConsensusTimeout("synchronization still running".into()))
    }
}

// ============================================================================
// Election
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionState {
    Idle,
    Electing,
    Leader,
    Follower,
}

impl fmt::Display for ElectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ElectionState::Idle => write!(f, "idle"),
            ElectionState::Electing => write!(f, "electing"),
            ElectionState::Leader => write!(f, "leader"),
            ElectionState::Follower => write!(f, "follower"),
        }
    }
}

/// Election role plus a counter of declare-leader messages seen
pub struct ElectionTracker {
    state: Mutex<ElectionState>,
    declares_tx: watch::Sender<u64>,
}

impl Default for ElectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ElectionTracker {
    pub fn new() -> Self {
        let (declares_tx, _) = watch::channel(0);
        Self {
            state: Mutex::new(ElectionState::Idle),
            declares_tx,
        }
    }

    pub fn state(&self) -> ElectionState {
        *lock(&self.state)
    }

    pub fn set(&self, state: ElectionState) {
        *lock(&self.state) = state;
    }

    /// Enter `Electing` unless an election is already running
    pub fn try_start(&self) -> bool {
        let mut state = lock(&self.state);
        if *state == ElectionState::Electing {
            return false;
        }
        *state = ElectionState::Electing;
        true
    }

    /// Record a declare-leader message and settle the role
    pub fn declared(&self, is_self: bool) {
        self.set(if is_self {
            ElectionState::Leader
        } else {
            ElectionState::Follower
        });
        self.declares_tx.send_modify(|n| *n += 1);
    }

    pub fn subscribe_declares(&self) -> watch::Receiver<u64> {
        self.declares_tx.subscribe()
    }
}
