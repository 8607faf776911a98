//! Wire messages exchanged between nodes and with clients
//!
//! Every body is JSON with camelCase field names.

use crate::ztree::MetadataRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Client timestamp carried by a write.
///
/// Accepts a JSON number or string. Two numeric timestamps compare as
/// numbers; two non-numeric ones compare as strings; a numeric timestamp
/// always sorts before a non-numeric one so the order stays total.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Timestamp {
    Number(serde_json::Number),
    Text(String),
}

/// Numeric view of a timestamp; integers never go through `f64`
#[derive(Debug, Clone, Copy)]
enum Numeric {
    Int(i128),
    Float(f64),
}

impl Numeric {
    fn cmp(self, other: Numeric) -> Ordering {
        match (self, other) {
            (Numeric::Int(a), Numeric::Int(b)) => a.cmp(&b),
            (a, b) => a.as_f64().total_cmp(&b.as_f64()),
        }
    }

    fn as_f64(self) -> f64 {
        match self {
            Numeric::Int(v) => v as f64,
            Numeric::Float(v) => v,
        }
    }
}

impl Timestamp {
    fn numeric(&self) -> Option<Numeric> {
        match self {
            Timestamp::Number(n) => {
                if let Some(v) = n.as_u64() {
                    Some(Numeric::Int(v.into()))
                } else if let Some(v) = n.as_i64() {
                    Some(Numeric::Int(v.into()))
                } else {
                    n.as_f64().filter(|v| v.is_finite()).map(Numeric::Float)
                }
            }
            Timestamp::Text(s) => {
                let s = s.trim();
                match s.parse::<i128>() {
                    Ok(v) => Some(Numeric::Int(v)),
                    Err(_) => s
                        .parse::<f64>()
                        .ok()
                        .filter(|v| v.is_finite())
                        .map(Numeric::Float),
                }
            }
        }
    }
}

impl Default for Timestamp {
    fn default() -> Self {
        Timestamp::Text(String::new())
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timestamp::Number(n) => write!(f, "{}", n),
            Timestamp::Text(s) => write!(f, "{}", s),
        }
    }
}

impl Ord for Timestamp {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.numeric(), other.numeric()) {
            (Some(a), Some(b)) => a.cmp(b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => self.to_string().cmp(&other.to_string()),
        }
    }
}

impl PartialOrd for Timestamp {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Timestamp {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Timestamp {}

impl From<u64> for Timestamp {
    fn from(v: u64) -> Self {
        Timestamp::Number(v.into())
    }
}

impl From<&str> for Timestamp {
    fn from(s: &str) -> Self {
        Timestamp::Text(s.to_string())
    }
}

/// Body of `POST /metadata`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteRequest {
    pub timestamp: Timestamp,
    pub metadata: MetadataRecord,
    /// Forwarded to the record's clients once committed
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Leader → follower proposal
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Proposal {
    pub round: u64,
    pub request: WriteRequest,
}

/// Follower → leader acknowledgement
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    pub round: u64,
    pub address: String,
}

/// Leader → follower commit, carrying the record as the leader stored it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Commit {
    pub round: u64,
    pub request: WriteRequest,
    pub record: MetadataRecord,
}

/// Bully self-elect message
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElectRequest {
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElectResponse {
    /// `false` when the responder outranks the candidate
    pub success: bool,
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeclareLeader {
    pub leader: String,
    pub peers: Vec<String>,
}

/// Health probe body, answered with `message = "pong"`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    pub message: String,
    pub address: String,
}

/// Raised by the health monitor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureEvent {
    pub address: String,
    pub at: DateTime<Utc>,
    /// Local startup rather than a failed probe
    pub wakeup: bool,
}

impl FailureEvent {
    pub fn unreachable(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            at: Utc::now(),
            wakeup: false,
        }
    }

    pub fn wakeup(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            at: Utc::now(),
            wakeup: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub address: String,
    pub highest_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestMetadata {
    pub highest_id: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordList {
    pub records: Vec<MetadataRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteRequest {
    pub id: u64,
}
