//! RocksDB-backed session event store.
//!
//! Column families:
//! - `events`         — `<session:16><seq:4 BE>` → LZ4-compressed JSON event
//! - `events_by_time` — `<session:16><ts:8><seq:4 BE>` → empty (seek index)
//! - `sessions`       — `<session:16>` → bincode session record
//!
//! Timestamps are stored sign-flipped big-endian so byte order matches
//! numeric order, negative values included.

use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};
use serde::Deserialize;
use std::collections::{BinaryHeap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use uuid::Uuid;

use super::{NewEvent, SessionEvent, SessionMetadata, SessionRecord, StoreError};
use crate::protocol::now_millis;

const CF_EVENTS: &str = "events";
const CF_EVENTS_BY_TIME: &str = "events_by_time";
const CF_SESSIONS: &str = "sessions";

const COLUMN_FAMILIES: &[&str] = &[CF_EVENTS, CF_EVENTS_BY_TIME, CF_SESSIONS];

const EVENT_KEY_LEN: usize = 20;
const TIME_KEY_LEN: usize = 28;

/// Store configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every batch (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size per column family (default: 16MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("overlay_sessions"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 16 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, temp directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 4 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 1024 * 1024,
        }
    }
}

fn event_key(session: Uuid, sequence: u32) -> [u8; EVENT_KEY_LEN] {
    let mut key = [0u8; EVENT_KEY_LEN];
    key[..16].copy_from_slice(session.as_bytes());
    key[16..].copy_from_slice(&sequence.to_be_bytes());
    key
}

fn time_key(session: Uuid, timestamp: i64, sequence: u32) -> [u8; TIME_KEY_LEN] {
    let mut key = [0u8; TIME_KEY_LEN];
    key[..16].copy_from_slice(session.as_bytes());
    key[16..24].copy_from_slice(&((timestamp as u64) ^ (1 << 63)).to_be_bytes());
    key[24..].copy_from_slice(&sequence.to_be_bytes());
    key
}

fn decode_time_key(key: &[u8]) -> Option<(i64, u32)> {
    if key.len() != TIME_KEY_LEN {
        return None;
    }
    let ts = u64::from_be_bytes(key[16..24].try_into().ok()?) ^ (1 << 63);
    let seq = u32::from_be_bytes(key[24..].try_into().ok()?);
    Some((ts as i64, seq))
}

fn decode_sequence(key: &[u8]) -> Option<u32> {
    if key.len() != EVENT_KEY_LEN {
        return None;
    }
    Some(u32::from_be_bytes(key[16..].try_into().ok()?))
}

fn encode_event(event: &SessionEvent) -> Result<Vec<u8>, StoreError> {
    let json = serde_json::to_vec(event).map_err(|e| StoreError::Serialization(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&json))
}

fn decode_event(bytes: &[u8]) -> Result<SessionEvent, StoreError> {
    let json = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| StoreError::Compression(e.to_string()))?;
    serde_json::from_slice(&json).map_err(|e| StoreError::Deserialization(e.to_string()))
}

fn encode_record(record: &SessionRecord) -> Result<Vec<u8>, StoreError> {
    bincode::serde::encode_to_vec(record, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode_record(bytes: &[u8]) -> Result<SessionRecord, StoreError> {
    let (record, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(record)
}

/// Append-only, seekable event log keyed by session.
pub struct SessionStore {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
    /// Last committed sequence per session. Also serializes appends.
    sequences: Mutex<HashMap<Uuid, u32>>,
}

impl SessionStore {
    /// Open the store, creating the database and column families if needed.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(name, &config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;
        log::info!("Session store opened at {}", config.path.display());

        Ok(Self {
            db,
            config,
            sequences: Mutex::new(HashMap::new()),
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
            // Values are already LZ4 frames.
            CF_EVENTS => opts.set_compression_type(DBCompressionType::None),
            CF_EVENTS_BY_TIME => opts.set_compression_type(DBCompressionType::Lz4),
            _ => {
                opts.set_compression_type(DBCompressionType::Lz4);
                opts.optimize_for_point_lookup(config.block_cache_size as u64);
            }
        }
        opts
    }

    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn write_options(&self) -> WriteOptions {
        let mut opts = WriteOptions::default();
        opts.set_sync(self.config.sync_writes);
        opts
    }

    // ─── Sessions ─────────────────────────────────────────────────────

    /// Create a new session in `layer_id`.
    pub fn create_session(&self, layer_id: &str) -> Result<SessionRecord, StoreError> {
        let record = SessionRecord {
            session_id: Uuid::new_v4(),
            layer_id: layer_id.to_string(),
            created_at: now_millis(),
        };
        let cf = self.cf(CF_SESSIONS)?;
        self.db
            .put_cf_opt(cf, record.session_id.as_bytes(), encode_record(&record)?, &self.write_options())?;
        log::info!("Session {} started in layer {layer_id}", record.session_id);
        Ok(record)
    }

    pub fn session(&self, session_id: Uuid) -> Result<SessionRecord, StoreError> {
        let cf = self.cf(CF_SESSIONS)?;
        match self.db.get_cf(cf, session_id.as_bytes())? {
            Some(bytes) => decode_record(&bytes),
            None => Err(StoreError::SessionNotFound(session_id)),
        }
    }

    /// Every session, oldest first.
    pub fn list_sessions(&self) -> Result<Vec<SessionRecord>, StoreError> {
        let cf = self.cf(CF_SESSIONS)?;
        let mut sessions = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            sessions.push(decode_record(&value)?);
        }
        sessions.sort_by_key(|s| s.created_at);
        Ok(sessions)
    }

    /// Delete a session and all of its events in one batch.
    pub fn delete_session(&self, session_id: Uuid) -> Result<u64, StoreError> {
        let cf_sessions = self.cf(CF_SESSIONS)?;
        let cf_events = self.cf(CF_EVENTS)?;
        let cf_time = self.cf(CF_EVENTS_BY_TIME)?;

        let mut guard = self.sequences.lock().unwrap_or_else(PoisonError::into_inner);
        let mut batch = WriteBatch::default();
        batch.delete_cf(cf_sessions, session_id.as_bytes());

        let mut removed = 0u64;
        for cf in [cf_events, cf_time] {
            let iter = self.db.iterator_cf(
                cf,
                IteratorMode::From(session_id.as_bytes(), Direction::Forward),
            );
            for item in iter {
                let (key, _) = item?;
                if !key.starts_with(session_id.as_bytes()) {
                    break;
                }
                batch.delete_cf(cf, &key);
                if key.len() == EVENT_KEY_LEN {
                    removed += 1;
                }
            }
        }

        self.db.write_opt(batch, &self.write_options())?;
        guard.remove(&session_id);
        log::info!("Session {session_id} deleted ({removed} events)");
        Ok(removed)
    }

    // ─── Events ───────────────────────────────────────────────────────

    /// Highest committed sequence, read from the last event key.
    fn last_sequence(&self, session_id: Uuid) -> Result<Option<u32>, StoreError> {
        let cf = self.cf(CF_EVENTS)?;
        let upper = event_key(session_id, u32::MAX);
        let mut iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&upper, Direction::Reverse));
        match iter.next() {
            Some(item) => {
                let (key, _) = item?;
                if key.starts_with(session_id.as_bytes()) {
                    Ok(decode_sequence(&key))
                } else {
                    Ok(None)
                }
            }
            None => Ok(None),
        }
    }

    /// Append events atomically. Sequences are assigned contiguously at
    /// commit; on failure nothing is written and no sequence is consumed.
    pub fn append_batch(
        &self,
        session_id: Uuid,
        events: Vec<NewEvent>,
    ) -> Result<Vec<SessionEvent>, StoreError> {
        if events.is_empty() {
            return Ok(Vec::new());
        }
        let cf_events = self.cf(CF_EVENTS)?;
        let cf_time = self.cf(CF_EVENTS_BY_TIME)?;

        let mut sequences = self.sequences.lock().unwrap_or_else(PoisonError::into_inner);
        let last = match sequences.get(&session_id) {
            Some(seq) => *seq,
            None => {
                self.session(session_id)?;
                self.last_sequence(session_id)?.unwrap_or(0)
            }
        };
        let count = u32::try_from(events.len()).map_err(|_| StoreError::SequenceExhausted(session_id))?;
        if last.checked_add(count).is_none() {
            return Err(StoreError::SequenceExhausted(session_id));
        }

        let mut batch = WriteBatch::default();
        let mut stored = Vec::with_capacity(events.len());
        for (offset, event) in events.into_iter().enumerate() {
            let sequence = last + 1 + offset as u32;
            let event = SessionEvent {
                id: Uuid::new_v4().to_string(),
                user_id: event.user_id,
                event_type: event.event_type,
                payload: event.payload,
                timestamp: event.timestamp,
                sequence,
            };
            batch.put_cf(cf_events, event_key(session_id, sequence), encode_event(&event)?);
            batch.put_cf(cf_time, time_key(session_id, event.timestamp, sequence), []);
            stored.push(event);
        }

        self.db.write_opt(batch, &self.write_options())?;
        sequences.insert(session_id, last + count);
        log::debug!("Appended {count} events to session {session_id}");
        Ok(stored)
    }

    /// Full replay in sequence order.
    pub fn events(&self, session_id: Uuid) -> Result<Vec<SessionEvent>, StoreError> {
        self.events_from_sequence(session_id, 0, usize::MAX)
    }

    /// Events with sequence ≥ `from`, in sequence order, capped at `limit`.
    pub fn events_from_sequence(
        &self,
        session_id: Uuid,
        from: u32,
        limit: usize,
    ) -> Result<Vec<SessionEvent>, StoreError> {
        let cf = self.cf(CF_EVENTS)?;
        let start = event_key(session_id, from);
        let mut events = Vec::new();
        for item in self
            .db
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward))
        {
            if events.len() >= limit {
                break;
            }
            let (key, value) = item?;
            if !key.starts_with(session_id.as_bytes()) {
                break;
            }
            events.push(decode_event(&value)?);
        }
        Ok(events)
    }

    /// Events with timestamp ≥ `from_ms`, ordered by sequence, capped at
    /// `limit`. The time index locates rows; sequence decides order. Only
    /// the `limit` lowest sequences are held while the index is scanned.
    pub fn events_from_timestamp(
        &self,
        session_id: Uuid,
        from_ms: i64,
        limit: usize,
    ) -> Result<Vec<SessionEvent>, StoreError> {
        let cf_time = self.cf(CF_EVENTS_BY_TIME)?;
        let cf_events = self.cf(CF_EVENTS)?;

        if limit == 0 {
            return Ok(Vec::new());
        }

        let start = time_key(session_id, from_ms, 0);
        let mut lowest = BinaryHeap::new();
        for item in self
            .db
            .iterator_cf(cf_time, IteratorMode::From(&start, Direction::Forward))
        {
            let (key, _) = item?;
            if !key.starts_with(session_id.as_bytes()) {
                break;
            }
            if let Some((_, seq)) = decode_time_key(&key) {
                lowest.push(seq);
                if lowest.len() > limit {
                    lowest.pop();
                }
            }
        }
        let sequences = lowest.into_sorted_vec();

        let mut events = Vec::with_capacity(sequences.len());
        for seq in sequences {
            if let Some(value) = self.db.get_cf(cf_events, event_key(session_id, seq))? {
                events.push(decode_event(&value)?);
            }
        }
        Ok(events)
    }

    /// Count, first/last timestamp and duration, aggregated from stored
    /// rows on every call.
    pub fn metadata(&self, session_id: Uuid) -> Result<SessionMetadata, StoreError> {
        self.session(session_id)?;
        let cf_time = self.cf(CF_EVENTS_BY_TIME)?;

        let mut event_count = 0u64;
        let mut first_timestamp = None;
        let mut last_timestamp = None;
        for item in self.db.iterator_cf(
            cf_time,
            IteratorMode::From(session_id.as_bytes(), Direction::Forward),
        ) {
            let (key, _) = item?;
            if !key.starts_with(session_id.as_bytes()) {
                break;
            }
            if let Some((ts, _)) = decode_time_key(&key) {
                event_count += 1;
                first_timestamp.get_or_insert(ts);
                last_timestamp = Some(ts);
            }
        }

        let duration_ms = match (first_timestamp, last_timestamp) {
            (Some(first), Some(last)) => last.saturating_sub(first),
            _ => 0,
        };
        Ok(SessionMetadata {
            session_id,
            event_count,
            first_timestamp,
            last_timestamp,
            duration_ms,
            last_sequence: self.last_sequence(session_id)?,
        })
    }

    /// Flush memtables to disk.
    pub fn sync(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::EventType;
    use serde_json::json;
    use tempfile::TempDir;

    fn open() -> (SessionStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = SessionStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        (store, dir)
    }

    fn event(ts: i64) -> NewEvent {
        NewEvent::at("alice", EventType::CursorMove, json!({"u": 0.5, "v": 0.5}), ts)
    }

    #[test]
    fn test_time_key_orders_negative_timestamps() {
        let s = Uuid::new_v4();
        assert!(time_key(s, -5, 0) < time_key(s, 3, 0));
        assert!(time_key(s, 3, 9) < time_key(s, 4, 0));
        assert_eq!(decode_time_key(&time_key(s, -5, 7)), Some((-5, 7)));
    }

    #[test]
    fn test_append_assigns_contiguous_sequences() {
        let (store, _dir) = open();
        let session = store.create_session("layer").unwrap();
        let first = store
            .append_batch(session.session_id, vec![event(100), event(200)])
            .unwrap();
        let second = store.append_batch(session.session_id, vec![event(300)]).unwrap();
        assert_eq!(first.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(second[0].sequence, 3);
    }

    #[test]
    fn test_append_to_unknown_session() {
        let (store, _dir) = open();
        let err = store.append_batch(Uuid::new_v4(), vec![event(1)]).unwrap_err();
        assert!(matches!(err, StoreError::SessionNotFound(_)));
    }

    #[test]
    fn test_empty_batch_is_noop() {
        let (store, _dir) = open();
        let session = store.create_session("layer").unwrap();
        assert!(store.append_batch(session.session_id, Vec::new()).unwrap().is_empty());
        assert_eq!(store.metadata(session.session_id).unwrap().event_count, 0);
    }

    #[test]
    fn test_seek_by_timestamp() {
        let (store, _dir) = open();
        let session = store.create_session("layer").unwrap();
        store
            .append_batch(session.session_id, vec![event(100), event(200), event(300)])
            .unwrap();
        let events = store.events_from_timestamp(session.session_id, 200, 100).unwrap();
        assert_eq!(events.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn test_seek_orders_by_sequence_not_time() {
        let (store, _dir) = open();
        let session = store.create_session("layer").unwrap();
        // Producer clocks disagree: later sequence, earlier timestamp.
        store
            .append_batch(session.session_id, vec![event(500), event(300), event(400)])
            .unwrap();
        let events = store.events_from_timestamp(session.session_id, 350, 10).unwrap();
        assert_eq!(events.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![1, 3]);

        let capped = store.events_from_timestamp(session.session_id, 0, 2).unwrap();
        assert_eq!(capped.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_seek_limit_far_below_matches() {
        let (store, _dir) = open();
        let session = store.create_session("layer").unwrap();
        // Timestamps fall as sequences rise, so the lowest sequences sit at
        // the far end of the time index.
        store
            .append_batch(session.session_id, (0..500).map(|i| event(10_000 - i)).collect())
            .unwrap();
        let page = store.events_from_timestamp(session.session_id, 0, 5).unwrap();
        assert_eq!(page.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![1, 2, 3, 4, 5]);
        assert!(store.events_from_timestamp(session.session_id, 0, 0).unwrap().is_empty());
    }

    #[test]
    fn test_events_from_sequence_with_limit() {
        let (store, _dir) = open();
        let session = store.create_session("layer").unwrap();
        store
            .append_batch(session.session_id, (0..10).map(|i| event(i * 10)).collect())
            .unwrap();
        let page = store.events_from_sequence(session.session_id, 4, 3).unwrap();
        assert_eq!(page.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![4, 5, 6]);
    }

    #[test]
    fn test_metadata_aggregates() {
        let (store, _dir) = open();
        let session = store.create_session("layer").unwrap();
        store
            .append_batch(session.session_id, vec![event(1_000), event(4_000), event(2_500)])
            .unwrap();
        let meta = store.metadata(session.session_id).unwrap();
        assert_eq!(meta.event_count, 3);
        assert_eq!(meta.first_timestamp, Some(1_000));
        assert_eq!(meta.last_timestamp, Some(4_000));
        assert_eq!(meta.duration_ms, 3_000);
        assert_eq!(meta.last_sequence, Some(3));
    }

    #[test]
    fn test_metadata_extreme_timestamps_saturate() {
        let (store, _dir) = open();
        let session = store.create_session("layer").unwrap();
        store
            .append_batch(session.session_id, vec![event(i64::MIN), event(i64::MAX)])
            .unwrap();
        let meta = store.metadata(session.session_id).unwrap();
        assert_eq!(meta.first_timestamp, Some(i64::MIN));
        assert_eq!(meta.last_timestamp, Some(i64::MAX));
        assert_eq!(meta.duration_ms, i64::MAX);
    }

    #[test]
    fn test_sessions_are_isolated() {
        let (store, _dir) = open();
        let a = store.create_session("layer").unwrap();
        let b = store.create_session("layer").unwrap();
        store.append_batch(a.session_id, vec![event(1), event(2)]).unwrap();
        store.append_batch(b.session_id, vec![event(3)]).unwrap();
        assert_eq!(store.events(a.session_id).unwrap().len(), 2);
        assert_eq!(store.events(b.session_id).unwrap()[0].sequence, 1);
        assert_eq!(store.list_sessions().unwrap().len(), 2);
    }

    #[test]
    fn test_delete_session() {
        let (store, _dir) = open();
        let session = store.create_session("layer").unwrap();
        store.append_batch(session.session_id, vec![event(1), event(2)]).unwrap();
        assert_eq!(store.delete_session(session.session_id).unwrap(), 2);
        assert!(store.events(session.session_id).unwrap().is_empty());
        assert!(matches!(
            store.session(session.session_id),
            Err(StoreError::SessionNotFound(_))
        ));
    }

    #[test]
    fn test_sequence_recovered_after_reopen() {
        let dir = TempDir::new().unwrap();
        let session_id = {
            let store = SessionStore::open(StoreConfig::for_testing(dir.path())).unwrap();
            let session = store.create_session("layer").unwrap();
            store.append_batch(session.session_id, vec![event(1), event(2)]).unwrap();
            session.session_id
        };
        let store = SessionStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        let next = store.append_batch(session_id, vec![event(3)]).unwrap();
        assert_eq!(next[0].sequence, 3);
    }
}
