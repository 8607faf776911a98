//! # zooweeper
//!
//! A miniature ZooKeeper-style coordination service with:
//! - Bully election of a single leader
//! - Zab-like propose/acknowledge/commit broadcast of writes
//! - FIFO ordering of client writes by timestamp
//! - Health checks that trigger re-election
//! - Leader-driven synchronization of the replicated metadata tree
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//!        client write                       client read
//!             │                                  │
//! ┌───────────▼──────────┐            ┌──────────▼──────────┐
//! │ Follower (8080)      │  forward   │ Leader (8082)       │
//! │  sequencer ──────────┼───────────►│  sequencer          │
//! │  ZTree (RocksDB)     │            │  propose/ack/commit │
//! └──────────▲───────────┘            └───┬─────────────┬───┘
//!            │  proposal / commit         │             │
//!            └────────────────────────────┘             ▼
//!                                             Follower (8081)
//! ```
//!
//! ## Usage
//!
//! ### Start an ensemble
//! ```bash
//! zooweeper serve --address 8080 --peers 8080,8081,8082
//! zooweeper serve --address 8081 --peers 8080,8081,8082
//! zooweeper serve --address 8082 --peers 8080,8081,8082
//! ```
//!
//! ### Use the CLI
//! ```bash
//! # Register a sender and its clients
//! zw put 9090 --clients 9091,9092 --timestamp 1
//!
//! # Read the tree from any node
//! zw --node http://localhost:8081 get
//!
//! # Leader, roles and pipeline state
//! zw status
//! ```

pub mod common;
pub mod ensemble;
pub mod zab;
pub mod ztree;

// Re-export commonly used types
pub use common::{Error, NodeConfig, Result};
pub use ensemble::Node;
pub use ztree::{MetadataRecord, ZTree};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
