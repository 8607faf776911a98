//! ZNode metadata record

use serde::{Deserialize, Serialize};

/// Id of the self-descriptor record every node owns
pub const LOCAL_ID: u64 = 1;

/// Parent id of the self-descriptor (the root of the tree)
pub const ROOT_PARENT: u64 = 0;

/// One row of the replicated tree.
///
/// Record `1` describes the local node (its address, the leader it believes
/// in and the full peer list). Every other record belongs to a client
/// (`sender_address`) and hangs under record `1`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MetadataRecord {
    pub id: u64,
    pub node_address: String,
    pub leader: String,
    pub peers: Vec<String>,
    pub timestamp: String,
    pub version: u64,
    pub parent_id: u64,
    pub clients: Vec<String>,
    pub sender_address: String,
    pub receiver_address: String,
}

impl MetadataRecord {
    pub fn is_local(&self) -> bool {
        self.id == LOCAL_ID
    }

    /// Whether `other` carries the same content for this sender.
    ///
    /// Content is the set of attached clients; order and duplicates are
    /// ignored so a re-sent write with shuffled clients stays idempotent.
    pub fn same_content(&self, other: &MetadataRecord) -> bool {
        normalized(&self.clients) == normalized(&other.clients)
    }
}

fn normalized(clients: &[String]) -> Vec<&str> {
    let mut out: Vec<&str> = clients.iter().map(|c| c.as_str()).collect();
    out.sort_unstable();
    out.dedup();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_field_names() {
        let record = MetadataRecord {
            id: 2,
            sender_address: "9090".to_string(),
            parent_id: LOCAL_ID,
            ..Default::default()
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["senderAddress"], "9090");
        assert_eq!(value["parentId"], 1);
        assert!(value.get("sender_address").is_none());
    }

    #[test]
    fn test_missing_fields_default() {
        let record: MetadataRecord =
            serde_json::from_str(r#"{"senderAddress":"9090","clients":["9091"]}"#).unwrap();
        assert_eq!(record.id, 0);
        assert_eq!(record.version, 0);
        assert_eq!(record.clients, vec!["9091".to_string()]);
    }

    #[test]
    fn test_same_content_ignores_order() {
        let a = MetadataRecord {
            clients: vec!["9091".into(), "9092".into()],
            ..Default::default()
        };
        let b = MetadataRecord {
            clients: vec!["9092".into(), "9091".into(), "9091".into()],
            ..Default::default()
        };
        let c = MetadataRecord {
            clients: vec!["9093".into()],
            ..Default::default()
        };
        assert!(a.same_content(&b));
        assert!(!a.same_content(&c));
    }
}
