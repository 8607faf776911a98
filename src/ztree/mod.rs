//! Replicated metadata tree
//!
//! Each node keeps a full local copy. Record `1` describes the node itself;
//! client records hang under it and are versioned per sender.

pub mod record;
pub mod store;

pub use record::{MetadataRecord, LOCAL_ID, ROOT_PARENT};
pub use store::{UpsertOutcome, ZTree};
