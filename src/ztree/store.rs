//! ZTree store using RocksDB
//!
//! One column family holds every record, keyed by the big-endian record id
//! so iteration order is id order. Mutations are serialized by a store-wide
//! lock; reads go straight to RocksDB.

use crate::common::{Error, Result};
use crate::ztree::record::{MetadataRecord, LOCAL_ID, ROOT_PARENT};
use rocksdb::{ColumnFamily, Direction, IteratorMode, Options, DB};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const CF_ZNODES: &str = "znodes";

/// Result of an upsert keyed by sender
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// First write for this sender
    Inserted(MetadataRecord),
    /// Content changed, version bumped
    Updated(MetadataRecord),
    /// Identical content, nothing written
    Unchanged(MetadataRecord),
}

impl UpsertOutcome {
    pub fn record(&self) -> &MetadataRecord {
        match self {
            UpsertOutcome::Inserted(r) | UpsertOutcome::Updated(r) | UpsertOutcome::Unchanged(r) => r,
        }
    }

    pub fn into_record(self) -> MetadataRecord {
        match self {
            UpsertOutcome::Inserted(r) | UpsertOutcome::Updated(r) | UpsertOutcome::Unchanged(r) => r,
        }
    }

    pub fn changed(&self) -> bool {
        !matches!(self, UpsertOutcome::Unchanged(_))
    }
}

/// The local replica of the metadata tree
pub struct ZTree {
    db: DB,
    write_lock: Mutex<()>,
}

fn key(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

fn decode_id(bytes: &[u8]) -> Result<u64> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| Error::MetadataCorrupted(format!("bad key length {}", bytes.len())))?;
    Ok(u64::from_be_bytes(raw))
}

fn decode_record(bytes: &[u8]) -> Result<MetadataRecord> {
    Ok(bincode::deserialize(bytes)?)
}

impl ZTree {
    /// Open or create the store
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let db = DB::open_cf(&opts, path, vec![CF_ZNODES])?;

        Ok(Self {
            db,
            write_lock: Mutex::new(()),
        })
    }

    fn cf(&self) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(CF_ZNODES)
            .ok_or_else(|| Error::Internal(format!("missing column family {}", CF_ZNODES)))
    }

    fn lock(&self) -> Result<MutexGuard<'_, ()>> {
        self.write_lock
            .lock()
            .map_err(|_| Error::Internal("ztree write lock poisoned".into()))
    }

    fn put(&self, record: &MetadataRecord) -> Result<()> {
        let value = bincode::serialize(record)
            .map_err(|e| Error::Internal(format!("Serialize error: {}", e)))?;
        self.db.put_cf(self.cf()?, key(record.id), value)?;
        Ok(())
    }

    /// Get a record by id
    pub fn get(&self, id: u64) -> Result<Option<MetadataRecord>> {
        match self.db.get_cf(self.cf()?, key(id))? {
            Some(bytes) => Ok(Some(decode_record(&bytes)?)),
            None => Ok(None),
        }
    }

    fn scan(&self, mode: IteratorMode) -> Result<Vec<MetadataRecord>> {
        let mut records = Vec::new();
        for item in self.db.iterator_cf(self.cf()?, mode) {
            let (_, value) = item?;
            records.push(decode_record(&value)?);
        }
        Ok(records)
    }

    // === Self-descriptor ===

    /// Self-registration: create record 1 if this node has never run before
    pub fn ensure_local(
        &self,
        node_address: &str,
        leader: &str,
        peers: &[String],
    ) -> Result<MetadataRecord> {
        let _guard = self.lock()?;
        if let Some(existing) = self.get(LOCAL_ID)? {
            return Ok(existing);
        }
        let record = MetadataRecord {
            id: LOCAL_ID,
            node_address: node_address.to_string(),
            leader: leader.to_string(),
            peers: peers.to_vec(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            version: 0,
            parent_id: ROOT_PARENT,
            ..Default::default()
        };
        self.put(&record)?;
        tracing::info!("Registered local znode for {}", node_address);
        Ok(record)
    }

    /// The self-descriptor record
    pub fn get_local(&self) -> Result<MetadataRecord> {
        self.get(LOCAL_ID)?
            .ok_or_else(|| Error::NotFound("local znode".into()))
    }

    /// Rewrite the leader and peer list of record 1
    pub fn update_leader_and_peers(&self, leader: &str, peers: &[String]) -> Result<()> {
        let _guard = self.lock()?;
        let mut local = self.get_local()?;
        if local.leader == leader && local.peers == peers {
            return Ok(());
        }
        local.leader = leader.to_string();
        if !peers.is_empty() {
            local.peers = peers.to_vec();
        }
        self.put(&local)
    }

    // === Writes ===

    /// Insert a record at its id, or at the next id when `id == 0`
    pub fn insert(&self, record: &MetadataRecord) -> Result<u64> {
        let _guard = self.lock()?;
        self.insert_locked(record)
    }

    fn insert_locked(&self, record: &MetadataRecord) -> Result<u64> {
        let id = if record.id == 0 {
            self.highest_id()? + 1
        } else {
            record.id
        };
        if self.get(id)?.is_some() {
            return Err(Error::AlreadyExists(id));
        }
        if id != LOCAL_ID && record.parent_id >= id {
            return Err(Error::InvalidRequest(format!(
                "record {} cannot hang under parent {}",
                id, record.parent_id
            )));
        }
        let mut stored = record.clone();
        stored.id = id;
        self.put(&stored)?;
        Ok(id)
    }

    /// Insert a record only when its id is still free.
    ///
    /// Returns whether the record was written. Used by synchronization,
    /// which must be additive and idempotent.
    pub fn insert_if_absent(&self, record: &MetadataRecord) -> Result<bool> {
        if record.id == 0 {
            return Err(Error::InvalidRequest("synced record has no id".into()));
        }
        let _guard = self.lock()?;
        match self.insert_locked(record) {
            Ok(_) => Ok(true),
            Err(Error::AlreadyExists(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Insert the sender's record, or bump its version when content changed
    pub fn upsert(&self, record: &MetadataRecord) -> Result<UpsertOutcome> {
        if record.sender_address.is_empty() {
            return Err(Error::InvalidRequest("senderAddress is required".into()));
        }
        let _guard = self.lock()?;
        match self.find_by_sender(&record.sender_address)? {
            None => {
                let fresh = MetadataRecord {
                    id: 0,
                    timestamp: record.timestamp.clone(),
                    version: 1,
                    parent_id: LOCAL_ID,
                    clients: record.clients.clone(),
                    sender_address: record.sender_address.clone(),
                    receiver_address: record.receiver_address.clone(),
                    ..Default::default()
                };
                let id = self.insert_locked(&fresh)?;
                Ok(UpsertOutcome::Inserted(MetadataRecord { id, ..fresh }))
            }
            Some(existing) if existing.same_content(record) => {
                Ok(UpsertOutcome::Unchanged(existing))
            }
            Some(mut existing) => {
                existing.clients = record.clients.clone();
                existing.timestamp = record.timestamp.clone();
                existing.receiver_address = record.receiver_address.clone();
                existing.version += 1;
                self.put(&existing)?;
                Ok(UpsertOutcome::Updated(existing))
            }
        }
    }

    /// Store a committed record exactly as the leader assigned it.
    ///
    /// An older or equal version of the same sender at that id is left
    /// alone; anything else at that id is replaced by the leader's copy.
    pub fn apply(&self, record: &MetadataRecord) -> Result<bool> {
        if record.id <= LOCAL_ID {
            return Err(Error::InvalidRequest(format!(
                "committed record has reserved id {}",
                record.id
            )));
        }
        let _guard = self.lock()?;
        if let Some(existing) = self.get(record.id)? {
            if existing.sender_address == record.sender_address
                && existing.version >= record.version
            {
                return Ok(false);
            }
            if existing.sender_address != record.sender_address {
                tracing::warn!(
                    "Replacing diverged znode {} ({} -> {})",
                    record.id,
                    existing.sender_address,
                    record.sender_address
                );
            }
        }
        self.put(record)?;
        Ok(true)
    }

    /// Administrative delete. Record 1 and records with children are refused.
    pub fn delete(&self, id: u64) -> Result<MetadataRecord> {
        if id == LOCAL_ID {
            return Err(Error::InvalidRequest("the local znode cannot be deleted".into()));
        }
        let _guard = self.lock()?;
        let existing = self
            .get(id)?
            .ok_or_else(|| Error::NotFound(format!("znode {}", id)))?;
        if !self.records_with_parent(id)?.is_empty() {
            return Err(Error::InvalidRequest(format!("znode {} has children", id)));
        }
        self.db.delete_cf(self.cf()?, key(id))?;
        Ok(existing)
    }

    // === Queries ===

    /// Every record, ascending id
    pub fn all_records(&self) -> Result<Vec<MetadataRecord>> {
        self.scan(IteratorMode::Start)
    }

    pub fn records_with_parent(&self, parent_id: u64) -> Result<Vec<MetadataRecord>> {
        Ok(self
            .all_records()?
            .into_iter()
            .filter(|r| r.parent_id == parent_id && r.id != parent_id)
            .collect())
    }

    /// Records with an id strictly greater than `id`
    pub fn records_after(&self, id: u64) -> Result<Vec<MetadataRecord>> {
        match id.checked_add(1) {
            Some(start) => self.scan(IteratorMode::From(&key(start), Direction::Forward)),
            None => Ok(Vec::new()),
        }
    }

    /// Highest record id, 0 for an empty store
    pub fn highest_id(&self) -> Result<u64> {
        match self.db.iterator_cf(self.cf()?, IteratorMode::End).next() {
            Some(item) => {
                let (k, _) = item?;
                decode_id(&k)
            }
            None => Ok(0),
        }
    }

    pub fn id_exists(&self, id: u64) -> Result<bool> {
        Ok(self.get(id)?.is_some())
    }

    fn find_by_sender(&self, sender: &str) -> Result<Option<MetadataRecord>> {
        Ok(self
            .all_records()?
            .into_iter()
            .rev()
            .find(|r| r.id != LOCAL_ID && r.sender_address == sender))
    }

    /// Current version of a sender's record
    pub fn version_of(&self, sender: &str) -> Result<Option<u64>> {
        Ok(self.find_by_sender(sender)?.map(|r| r.version))
    }

    /// Downstream clients attached under a sender
    pub fn clients_of(&self, sender: &str) -> Result<Vec<String>> {
        Ok(self
            .find_by_sender(sender)?
            .map(|r| r.clients)
            .unwrap_or_default())
    }

    /// Flush to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}
