//! RocksDB-backed sheet store.
//!
//! Column families:
//! - `sheets`  — bincode-encoded sheet records keyed by sheet id (8 bytes BE);
//!   the JSON content inside each record is LZ4 compressed
//! - `members` — room roles keyed by `<room_id:8 BE><user_id:8 BE>`
//! - `meta`    — the next sheet id, so ids of deleted sheets are not reused
//!
//! Reference: Kleppmann — DDIA, Chapter 3 (LSM Trees, SSTables)

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::{ensure_can_edit, prepare_commit, prepare_visibility, DocumentStore, StoreError};
use crate::document::{validate_content, Mutation, SheetRecord};
use crate::permission::{RoomRole, Visibility};
use crate::{RoomId, SheetId, UserId};

/// Column family names.
const CF_SHEETS: &str = "sheets";
const CF_MEMBERS: &str = "members";
const CF_META: &str = "meta";

/// All column family names for initialization.
const COLUMN_FAMILIES: &[&str] = &[CF_SHEETS, CF_MEMBERS, CF_META];

const NEXT_ID_KEY: &[u8] = b"next_sheet_id";

/// Store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// fsync every commit (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 512)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("tabletop_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 512,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

/// On-disk form of a [`SheetRecord`].
#[derive(Debug, Serialize, Deserialize)]
struct StoredSheet {
    id: SheetId,
    owner_id: UserId,
    room_id: RoomId,
    visibility: Visibility,
    version: u64,
    created_at: u64,
    updated_at: u64,
    /// LZ4-compressed JSON
    content: Vec<u8>,
}

impl StoredSheet {
    fn from_record(record: &SheetRecord) -> Result<Self, StoreError> {
        let json = serde_json::to_vec(&record.content)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(Self {
            id: record.id,
            owner_id: record.owner_id,
            room_id: record.room_id,
            visibility: record.visibility,
            version: record.version,
            created_at: record.created_at,
            updated_at: record.updated_at,
            content: lz4_flex::compress_prepend_size(&json),
        })
    }

    fn into_record(self) -> Result<SheetRecord, StoreError> {
        let json = lz4_flex::decompress_size_prepended(&self.content)
            .map_err(|e| StoreError::Compression(e.to_string()))?;
        let content: Value = serde_json::from_slice(&json)
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(SheetRecord {
            id: self.id,
            owner_id: self.owner_id,
            room_id: self.room_id,
            visibility: self.visibility,
            content,
            version: self.version,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }

    fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::Serialization(e.to_string()))
    }

    fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (sheet, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
        Ok(sheet)
    }
}

/// RocksDB-backed sheet store.
///
/// Commits are serialized by `commit_lock`; each one is a single
/// synchronous read-modify-write of the sheet key.
pub struct RocksDocumentStore {
    /// RocksDB instance (single-threaded mode, writes serialized by `commit_lock`)
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Next sheet id to hand out
    next_id: AtomicU64,
    commit_lock: Mutex<()>,
}

impl RocksDocumentStore {
    /// Open the store at the configured path, creating the database and
    /// column families if they don't exist.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);
        db_opts.increase_parallelism(num_cpus());

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        let next_id = Self::recover_next_id(&db);
        log::info!(
            "sheet store opened at {} (next id {next_id})",
            config.path.display()
        );

        Ok(Self {
            db,
            config,
            next_id: AtomicU64::new(next_id),
            commit_lock: Mutex::new(()),
        })
    }

    fn cf_options(name: &str, config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);
        opts.set_write_buffer_size(config.write_buffer_size);

        match name {
            CF_SHEETS => {
                // Content is already LZ4 compressed inside the record
                opts.set_compression_type(DBCompressionType::None);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
            CF_MEMBERS => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.set_max_write_buffer_number(2);
            }
            _ => {}
        }

        opts
    }

    /// The stored next id, or one past the highest sheet id on disk when
    /// that is larger, or 1 for an empty store.
    fn recover_next_id(db: &DBWithThreadMode<SingleThreaded>) -> u64 {
        let from_meta = db
            .cf_handle(CF_META)
            .and_then(|cf| db.get_cf(&cf, NEXT_ID_KEY).ok().flatten())
            .and_then(|bytes| read_u64(&bytes))
            .unwrap_or(1);
        let from_sheets = match db.cf_handle(CF_SHEETS) {
            Some(cf) => match db.iterator_cf(&cf, IteratorMode::End).next() {
                Some(Ok((key, _))) => read_u64(&key).map_or(1, |id| id + 1),
                _ => 1,
            },
            None => 1,
        };
        from_meta.max(from_sheets)
    }

    /// Get the database path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Force a flush of memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    fn put_sheet(&self, record: &SheetRecord) -> Result<(), StoreError> {
        let cf = self.cf(CF_SHEETS)?;
        let encoded = StoredSheet::from_record(record)?.encode()?;
        self.db
            .put_cf_opt(&cf, record.id.to_be_bytes(), &encoded, &self.write_options())?;
        Ok(())
    }

    fn write_options(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }

    fn lock_commits(&self) -> Result<MutexGuard<'_, ()>, StoreError> {
        self.commit_lock
            .lock()
            .map_err(|_| StoreError::Database("commit lock poisoned".into()))
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn member_key(room_id: RoomId, user_id: UserId) -> [u8; 16] {
        let mut key = [0u8; 16];
        key[..8].copy_from_slice(&room_id.to_be_bytes());
        key[8..].copy_from_slice(&user_id.to_be_bytes());
        key
    }
}

impl DocumentStore for RocksDocumentStore {
    fn create_with_content(
        &self,
        owner_id: UserId,
        room_id: RoomId,
        visibility: Visibility,
        content: Value,
    ) -> Result<SheetRecord, StoreError> {
        validate_content(&content)?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let record = SheetRecord::new(id, owner_id, room_id, visibility, content);
        let encoded = StoredSheet::from_record(&record)?.encode()?;

        // Atomic batch write: sheet + next id
        let cf_sheets = self.cf(CF_SHEETS)?;
        let cf_meta = self.cf(CF_META)?;
        let mut batch = WriteBatch::default();
        batch.put_cf(&cf_sheets, id.to_be_bytes(), &encoded);
        batch.put_cf(&cf_meta, NEXT_ID_KEY, (id + 1).to_be_bytes());
        self.db.write_opt(batch, &self.write_options())?;
        Ok(record)
    }

    fn load(&self, sheet_id: SheetId) -> Result<SheetRecord, StoreError> {
        let cf = self.cf(CF_SHEETS)?;
        match self.db.get_cf(&cf, sheet_id.to_be_bytes())? {
            Some(bytes) => StoredSheet::decode(&bytes)?.into_record(),
            None => Err(StoreError::NotFound(sheet_id)),
        }
    }

    fn list(&self) -> Result<Vec<SheetId>, StoreError> {
        let cf = self.cf(CF_SHEETS)?;
        let mut ids = Vec::new();
        for item in self.db.iterator_cf(&cf, IteratorMode::Start) {
            let (key, _) = item?;
            let id = read_u64(&key)
                .ok_or_else(|| StoreError::Deserialization("invalid sheet key".into()))?;
            ids.push(id);
        }
        Ok(ids)
    }

    fn set_member_role(
        &self,
        room_id: RoomId,
        user_id: UserId,
        role: Option<RoomRole>,
    ) -> Result<(), StoreError> {
        let cf = self.cf(CF_MEMBERS)?;
        let key = Self::member_key(room_id, user_id);
        match role {
            Some(role) => {
                let value = bincode::serde::encode_to_vec(role, bincode::config::standard())
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;
                self.db.put_cf(&cf, key, value)?;
            }
            None => self.db.delete_cf(&cf, key)?,
        }
        Ok(())
    }

    fn member_role(&self, room_id: RoomId, user_id: UserId) -> Result<Option<RoomRole>, StoreError> {
        let cf = self.cf(CF_MEMBERS)?;
        match self.db.get_cf(&cf, Self::member_key(room_id, user_id))? {
            Some(bytes) => {
                let (role, _) =
                    bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
                Ok(Some(role))
            }
            None => Ok(None),
        }
    }

    fn commit(
        &self,
        sheet_id: SheetId,
        user_id: UserId,
        mutation: &Mutation,
    ) -> Result<u64, StoreError> {
        let _guard = self.lock_commits()?;
        let current = self.load(sheet_id)?;
        let role = self.member_role(current.room_id, user_id)?;
        let next = prepare_commit(current, user_id, role, mutation)?;
        self.put_sheet(&next)?;
        Ok(next.version)
    }

    fn change_visibility(
        &self,
        sheet_id: SheetId,
        user_id: UserId,
        visibility: Visibility,
    ) -> Result<u64, StoreError> {
        let _guard = self.lock_commits()?;
        let next = prepare_visibility(self.load(sheet_id)?, user_id, visibility)?;
        self.put_sheet(&next)?;
        Ok(next.version)
    }

    fn delete(&self, sheet_id: SheetId, user_id: UserId) -> Result<(), StoreError> {
        let _guard = self.lock_commits()?;
        let current = self.load(sheet_id)?;
        let role = self.member_role(current.room_id, user_id)?;
        ensure_can_edit(&current, user_id, role)?;

        let cf = self.cf(CF_SHEETS)?;
        self.db
            .delete_cf_opt(&cf, sheet_id.to_be_bytes(), &self.write_options())?;
        log::debug!("sheet {sheet_id} deleted by user {user_id}");
        Ok(())
    }
}

fn read_u64(bytes: &[u8]) -> Option<u64> {
    let buf: [u8; 8] = bytes.get(..8)?.try_into().ok()?;
    Some(u64::from_be_bytes(buf))
}

/// Get number of CPU cores for RocksDB parallelism.
fn num_cpus() -> i32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as i32)
        .unwrap_or(4)
}
