//! Persistence backends for the atom store
//!
//! # Column Families (RocksDB)
//!
//! - `atoms` - Atom entries (key: aid)
//! - `sequence` - Insertion order (key: sequence number, big endian)
//! - `addresses` - Secondary index (key: address || '|' || sequence)
//!
//! Both backends return entries in insertion order so that history replays
//! deliver atoms in the order they were first observed.

use crate::{
    atom::{Atom, AtomObservation},
    config::{Config, StorageBackend},
    error::{Error, Result},
    types::{Address, Aid, AtomStatus},
};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::RwLock;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, DB};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Column family names
const CF_ATOMS: &str = "atoms";
const CF_SEQUENCE: &str = "sequence";
const CF_ADDRESSES: &str = "addresses";

/// One persisted atom row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AtomEntry {
    /// The atom
    pub atom: Arc<Atom>,
    /// Latest status
    pub status: AtomStatus,
    /// Addresses derived from the atom
    pub addresses: BTreeSet<Address>,
    /// Time of the last insert or status change
    pub updated_at: DateTime<Utc>,
}

impl AtomEntry {
    /// Fresh entry for `atom`
    pub fn new(atom: Arc<Atom>, status: AtomStatus) -> Self {
        let addresses = atom.addresses();
        Self {
            atom,
            status,
            addresses,
            updated_at: Utc::now(),
        }
    }

    /// Identifier of the stored atom
    pub fn aid(&self) -> Aid {
        self.atom.aid()
    }

    /// Whether the atom concerns `address` (`None` matches everything)
    pub fn concerns(&self, address: Option<&Address>) -> bool {
        address.map_or(true, |a| self.addresses.contains(a))
    }

    /// Observation reflecting this row
    pub fn to_observation(&self) -> AtomObservation {
        AtomObservation {
            atom: self.atom.clone(),
            status: self.status,
            timestamp: self.updated_at,
        }
    }
}

/// Document-store abstraction backing the atom store
///
/// Implementations need not be thread-aware beyond `Send + Sync`: the atom
/// store actor is the only caller.
pub trait AtomPersistence: Send + Sync {
    /// Insert a new row. Callers guarantee the aid is not present yet.
    fn insert(&self, entry: &AtomEntry) -> Result<()>;

    /// Find a row by aid
    fn find(&self, aid: &Aid) -> Result<Option<AtomEntry>>;

    /// Every row, in insertion order
    fn find_all(&self) -> Result<Vec<AtomEntry>>;

    /// Rows concerning `address`, in insertion order
    fn find_by_address(&self, address: &Address) -> Result<Vec<AtomEntry>>;

    /// Replace the status of a row, returns false if the aid is unknown
    fn update_status(&self, aid: &Aid, status: AtomStatus, updated_at: DateTime<Utc>)
        -> Result<bool>;

    /// Delete a row, returns false if the aid is unknown
    fn remove(&self, aid: &Aid) -> Result<bool>;

    /// Number of rows
    fn len(&self) -> Result<usize>;
}

/// Open the backend selected by the configuration
pub fn open_persistence(config: &Config) -> Result<Box<dyn AtomPersistence>> {
    match config.storage.backend {
        StorageBackend::Memory => Ok(Box::new(MemoryPersistence::new())),
        StorageBackend::RocksDb => Ok(Box::new(RocksDbPersistence::open(config)?)),
    }
}

/// Volatile, insertion-ordered backend
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    rows: RwLock<IndexMap<Aid, AtomEntry>>,
}

impl MemoryPersistence {
    /// Empty backend
    pub fn new() -> Self {
        Self::default()
    }
}

impl AtomPersistence for MemoryPersistence {
    fn insert(&self, entry: &AtomEntry) -> Result<()> {
        self.rows.write().insert(entry.aid(), entry.clone());
        Ok(())
    }

    fn find(&self, aid: &Aid) -> Result<Option<AtomEntry>> {
        Ok(self.rows.read().get(aid).cloned())
    }

    fn find_all(&self) -> Result<Vec<AtomEntry>> {
        Ok(self.rows.read().values().cloned().collect())
    }

    fn find_by_address(&self, address: &Address) -> Result<Vec<AtomEntry>> {
        Ok(self
            .rows
            .read()
            .values()
            .filter(|e| e.concerns(Some(address)))
            .cloned()
            .collect())
    }

    fn update_status(
        &self,
        aid: &Aid,
        status: AtomStatus,
        updated_at: DateTime<Utc>,
    ) -> Result<bool> {
        match self.rows.write().get_mut(aid) {
            Some(entry) => {
                entry.status = status;
                entry.updated_at = updated_at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn remove(&self, aid: &Aid) -> Result<bool> {
        Ok(self.rows.write().shift_remove(aid).is_some())
    }

    fn len(&self) -> Result<usize> {
        Ok(self.rows.read().len())
    }
}

/// Row layout inside the `atoms` column family
#[derive(Debug, Serialize, Deserialize)]
struct StoredAtom {
    sequence: u64,
    entry: AtomEntry,
}

/// RocksDB backend
pub struct RocksDbPersistence {
    db: Arc<DB>,
    next_sequence: AtomicU64,
}

impl RocksDbPersistence {
    /// Open or create database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.storage.data_dir;
        let tuning = &config.storage.rocksdb;

        // Create directory if not exists
        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_write_buffer_size(tuning.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(tuning.max_write_buffer_number);
        db_opts.set_max_background_jobs(tuning.max_background_jobs);

        if tuning.enable_statistics {
            db_opts.enable_statistics();
        }

        let cf_descriptors = vec![
            ColumnFamilyDescriptor::new(CF_ATOMS, Self::cf_options_atoms()),
            ColumnFamilyDescriptor::new(CF_SEQUENCE, Options::default()),
            ColumnFamilyDescriptor::new(CF_ADDRESSES, Self::cf_options_addresses()),
        ];

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

        let storage = Self {
            db: Arc::new(db),
            next_sequence: AtomicU64::new(0),
        };
        let next = storage.last_sequence()?.map_or(0, |s| s + 1);
        storage.next_sequence.store(next, Ordering::SeqCst);

        tracing::info!(path = ?path, next_sequence = next, "Opened RocksDB atom store");

        Ok(storage)
    }

    fn cf_options_atoms() -> Options {
        let mut opts = Options::default();
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        opts
    }

    fn cf_options_addresses() -> Options {
        let mut opts = Options::default();
        // Index lookups benefit from bloom filters
        let mut block_opts = rocksdb::BlockBasedOptions::default();
        block_opts.set_bloom_filter(10.0, false);
        opts.set_block_based_table_factory(&block_opts);
        opts
    }

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    fn last_sequence(&self) -> Result<Option<u64>> {
        let cf = self.cf_handle(CF_SEQUENCE)?;
        let mut iter = self.db.iterator_cf(cf, IteratorMode::End);
        match iter.next() {
            Some(item) => {
                let (key, _) = item?;
                Ok(Some(Self::decode_sequence(&key)?))
            }
            None => Ok(None),
        }
    }

    fn load(&self, aid: &Aid) -> Result<Option<StoredAtom>> {
        let cf = self.cf_handle(CF_ATOMS)?;
        match self.db.get_cf(cf, aid.as_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    fn aid_from_value(value: &[u8]) -> Result<Aid> {
        let bytes: [u8; 32] = value
            .try_into()
            .map_err(|_| Error::Storage(format!("Corrupt aid of {} bytes", value.len())))?;
        Ok(Aid::from_bytes(bytes))
    }

    fn decode_sequence(key: &[u8]) -> Result<u64> {
        let bytes: [u8; 8] = key
            .try_into()
            .map_err(|_| Error::Storage(format!("Corrupt sequence key of {} bytes", key.len())))?;
        Ok(u64::from_be_bytes(bytes))
    }

    fn load_aids(&self, aids: Vec<Aid>) -> Result<Vec<AtomEntry>> {
        let mut entries = Vec::with_capacity(aids.len());
        for aid in aids {
            if let Some(stored) = self.load(&aid)? {
                entries.push(stored.entry);
            }
        }
        Ok(entries)
    }

    // Index key helpers

    fn index_prefix_address(address: &Address) -> Vec<u8> {
        let mut key = address.as_str().as_bytes().to_vec();
        key.push(b'|'); // Separator
        key
    }

    fn index_key_address_sequence(address: &Address, sequence: u64) -> Vec<u8> {
        let mut key = Self::index_prefix_address(address);
        key.extend_from_slice(&sequence.to_be_bytes());
        key
    }
}

impl AtomPersistence for RocksDbPersistence {
    fn insert(&self, entry: &AtomEntry) -> Result<()> {
        let aid = entry.aid();
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let stored = StoredAtom {
            sequence,
            entry: entry.clone(),
        };

        let mut batch = WriteBatch::default();

        // 1. Atom row
        let cf_atoms = self.cf_handle(CF_ATOMS)?;
        batch.put_cf(cf_atoms, aid.as_bytes(), bincode::serialize(&stored)?);

        // 2. Insertion order
        let cf_sequence = self.cf_handle(CF_SEQUENCE)?;
        batch.put_cf(cf_sequence, sequence.to_be_bytes(), aid.as_bytes());

        // 3. Address index
        let cf_addresses = self.cf_handle(CF_ADDRESSES)?;
        for address in &entry.addresses {
            let key = Self::index_key_address_sequence(address, sequence);
            batch.put_cf(cf_addresses, key, aid.as_bytes());
        }

        // Atomic commit
        self.db.write(batch)?;

        tracing::debug!(aid = %aid, sequence, status = %entry.status, "Atom persisted");

        Ok(())
    }

    fn find(&self, aid: &Aid) -> Result<Option<AtomEntry>> {
        Ok(self.load(aid)?.map(|stored| stored.entry))
    }

    fn find_all(&self) -> Result<Vec<AtomEntry>> {
        let cf = self.cf_handle(CF_SEQUENCE)?;
        let mut aids = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            aids.push(Self::aid_from_value(&value)?);
        }
        self.load_aids(aids)
    }

    fn find_by_address(&self, address: &Address) -> Result<Vec<AtomEntry>> {
        let cf = self.cf_handle(CF_ADDRESSES)?;
        let prefix = Self::index_prefix_address(address);

        let mut aids = Vec::new();
        for item in self.db.prefix_iterator_cf(cf, &prefix) {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            aids.push(Self::aid_from_value(&value)?);
        }
        self.load_aids(aids)
    }

    fn update_status(
        &self,
        aid: &Aid,
        status: AtomStatus,
        updated_at: DateTime<Utc>,
    ) -> Result<bool> {
        let Some(mut stored) = self.load(aid)? else {
            return Ok(false);
        };
        stored.entry.status = status;
        stored.entry.updated_at = updated_at;

        let cf = self.cf_handle(CF_ATOMS)?;
        self.db.put_cf(cf, aid.as_bytes(), bincode::serialize(&stored)?)?;
        Ok(true)
    }

    fn remove(&self, aid: &Aid) -> Result<bool> {
        let Some(stored) = self.load(aid)? else {
            return Ok(false);
        };

        let mut batch = WriteBatch::default();
        batch.delete_cf(self.cf_handle(CF_ATOMS)?, aid.as_bytes());
        batch.delete_cf(self.cf_handle(CF_SEQUENCE)?, stored.sequence.to_be_bytes());
        let cf_addresses = self.cf_handle(CF_ADDRESSES)?;
        for address in &stored.entry.addresses {
            batch.delete_cf(
                cf_addresses,
                Self::index_key_address_sequence(address, stored.sequence),
            );
        }
        self.db.write(batch)?;
        Ok(true)
    }

    fn len(&self) -> Result<usize> {
        let cf = self.cf_handle(CF_SEQUENCE)?;
        let mut count = 0usize;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            item?;
            count += 1;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::ParticleGroup;
    use crate::particle::{MessageParticle, Particle, SpunParticle};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn test_config() -> (Config, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.storage.backend = StorageBackend::RocksDb;
        config.storage.data_dir = temp_dir.path().to_path_buf();
        (config, temp_dir)
    }

    fn test_entry(from: &str, to: &str, nonce: u64) -> AtomEntry {
        let atom = Atom::new(vec![ParticleGroup::new(vec![SpunParticle::up(
            Particle::Message(MessageParticle {
                from: Address::new(from),
                to: Address::new(to),
                data: vec![1, 2, 3],
                metadata: BTreeMap::new(),
                nonce,
            }),
        )])]);
        AtomEntry::new(Arc::new(atom), AtomStatus::Stored)
    }

    fn exercise_backend(backend: &dyn AtomPersistence) {
        let first = test_entry("alice", "bob", 1);
        let second = test_entry("carol", "dave", 2);
        let third = test_entry("bob", "carol", 3);

        backend.insert(&first).unwrap();
        backend.insert(&second).unwrap();
        backend.insert(&third).unwrap();
        assert_eq!(backend.len().unwrap(), 3);

        let all: Vec<Aid> = backend.find_all().unwrap().iter().map(AtomEntry::aid).collect();
        assert_eq!(all, vec![first.aid(), second.aid(), third.aid()]);

        let bobs: Vec<Aid> = backend
            .find_by_address(&Address::new("bob"))
            .unwrap()
            .iter()
            .map(AtomEntry::aid)
            .collect();
        assert_eq!(bobs, vec![first.aid(), third.aid()]);

        assert!(backend
            .update_status(&first.aid(), AtomStatus::StoredFinal, Utc::now())
            .unwrap());
        assert_eq!(
            backend.find(&first.aid()).unwrap().unwrap().status,
            AtomStatus::StoredFinal
        );

        assert!(backend.remove(&first.aid()).unwrap());
        assert!(!backend.remove(&first.aid()).unwrap());
        assert!(backend.find(&first.aid()).unwrap().is_none());
        assert_eq!(backend.find_by_address(&Address::new("bob")).unwrap().len(), 1);
    }

    #[test]
    fn test_memory_backend() {
        exercise_backend(&MemoryPersistence::new());
    }

    #[test]
    fn test_rocksdb_backend() {
        let (config, _temp) = test_config();
        let backend = RocksDbPersistence::open(&config).unwrap();
        exercise_backend(&backend);
    }

    #[test]
    fn test_rocksdb_update_unknown_aid() {
        let (config, _temp) = test_config();
        let backend = RocksDbPersistence::open(&config).unwrap();
        let entry = test_entry("alice", "bob", 1);
        assert!(!backend
            .update_status(&entry.aid(), AtomStatus::Stored, Utc::now())
            .unwrap());
    }

    #[test]
    fn test_rocksdb_reopen_keeps_order() {
        let (config, _temp) = test_config();
        let first = test_entry("alice", "bob", 1);
        let second = test_entry("alice", "bob", 2);

        {
            let backend = RocksDbPersistence::open(&config).unwrap();
            backend.insert(&first).unwrap();
        }

        let backend = RocksDbPersistence::open(&config).unwrap();
        backend.insert(&second).unwrap();

        let all: Vec<Aid> = backend.find_all().unwrap().iter().map(AtomEntry::aid).collect();
        assert_eq!(all, vec![first.aid(), second.aid()]);
    }
}
