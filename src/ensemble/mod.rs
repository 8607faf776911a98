//! Ensemble node
//!
//! A node owns:
//! - its local ZTree replica
//! - the HTTP API shared by clients and peers
//! - the health monitor and the election it triggers

pub mod http;
pub mod server;

pub use http::{create_router, AppState, NodeStatus};
pub use server::Node;
