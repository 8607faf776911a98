//! Coordination protocol
//!
//! - Bully election of a single leader
//! - Propose/acknowledge/commit broadcast of writes, ordered by a
//!   timestamp sequencer
//! - Peer health checks that trigger re-election
//! - Synchronization run by every new leader

pub mod election;
pub mod health;
pub mod messages;
pub mod peer_client;
pub mod pipeline;
pub mod sequencer;
pub mod state;
pub mod sync;

pub use election::{Election, ElectionOutcome};
pub use health::HealthMonitor;
pub use messages::{FailureEvent, Timestamp, WriteRequest};
pub use peer_client::PeerClient;
pub use pipeline::Pipeline;
pub use sequencer::Sequencer;
pub use state::{
    ElectionState, ElectionTracker, ProposalState, ProposalTracker, SyncState, SyncTracker,
};
pub use sync::{SyncReport, Synchronizer};
