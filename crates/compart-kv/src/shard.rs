//! Shard — one RAM-first key/value store.
//!
//! A shard keeps its whole working set in a hash table and makes it durable
//! through the append-only log in its directory.
//!
//! **Read path**: RAM only, concurrent readers through an RwLock
//! **Write path**: log append first, then RAM
//! **Compaction**: rewrites the live set into one segment and drops the rest

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::ShardConfig;
use crate::error::{KvError, KvResult};
use crate::format::{encode_record, Operation};
use crate::log::{list_segments, segment_path, LogReader, LogWriter};
use crate::platform::{durable_sync, sync_dir};

/// Flush threshold for the compaction write buffer
const COMPACTION_BUFFER_BYTES: usize = 8 * 1024 * 1024;

/// Outcome of [`Shard::compact`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionStats {
    /// Segments replaced by the compacted one
    pub segments_removed: usize,
    /// Live entries written to the compacted segment
    pub live_entries: usize,
    /// Bytes on disk before compaction
    pub original_bytes: u64,
    /// Bytes on disk after compaction
    pub compacted_bytes: u64,
}

impl CompactionStats {
    /// Space reclaimed in bytes.
    pub fn bytes_saved(&self) -> u64 {
        self.original_bytes.saturating_sub(self.compacted_bytes)
    }
}

/// RAM hash table plus the log that makes it durable.
///
/// All methods take `&self`. Readers share the RwLock; writers serialize on
/// the log Mutex and then briefly take the table's write lock.
pub struct Shard {
    data: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
    log: Mutex<LogWriter>,
    path: PathBuf,
    config: ShardConfig,
}

impl Shard {
    /// Open or create a shard in directory `path`, replaying its log.
    pub fn open<P: AsRef<Path>>(path: P, config: ShardConfig) -> KvResult<Self> {
        config.validate().map_err(KvError::InvalidConfig)?;
        let path = path.as_ref().to_path_buf();

        let mut data = HashMap::new();
        for record in LogReader::new(&path).recover()? {
            match record.op {
                Operation::Put => {
                    data.insert(record.key, record.value);
                }
                Operation::Delete => {
                    data.remove(&record.key);
                }
            }
        }
        if !data.is_empty() {
            debug!(shard = %path.display(), entries = data.len(), "Recovered shard from log");
        }

        let log = LogWriter::open(&path, config.segment_size_bytes)?;

        Ok(Self {
            data: RwLock::new(data),
            log: Mutex::new(log),
            path,
            config,
        })
    }

    fn check_sizes(&self, key: &[u8], value: &[u8]) -> KvResult<()> {
        if key.len() > self.config.max_key_size {
            return Err(KvError::OversizedRecord {
                size: key.len() as u64,
                max_size: self.config.max_key_size as u64,
                component: "key",
            });
        }
        if value.len() > self.config.max_value_size {
            return Err(KvError::OversizedRecord {
                size: value.len() as u64,
                max_size: self.config.max_value_size as u64,
                component: "value",
            });
        }
        Ok(())
    }

    /// Copy of the value stored under `key`.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.data.read().get(key).cloned()
    }

    /// Run `f` on the stored value without copying it out of the table.
    pub fn with_value<R>(&self, key: &[u8], f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        self.data.read().get(key).map(|value| f(value))
    }

    /// Values for several keys under a single read lock.
    pub fn get_many<K: AsRef<[u8]>>(&self, keys: &[K]) -> Vec<Option<Vec<u8>>> {
        let data = self.data.read();
        keys.iter().map(|key| data.get(key.as_ref()).cloned()).collect()
    }

    /// Store `value` under `key`.
    ///
    /// The log append completes (and is synced when `durable_writes` is set)
    /// before RAM is touched; if it fails RAM is never modified.
    pub fn put(&self, key: &[u8], value: &[u8]) -> KvResult<()> {
        self.check_sizes(key, value)?;
        {
            let mut log = self.log.lock();
            log.append(key, value, Operation::Put, self.config.durable_writes)?;
        }
        self.data.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    /// Store many entries with one log write and at most one sync.
    pub fn put_batch<K: AsRef<[u8]>, V: AsRef<[u8]>>(&self, entries: &[(K, V)]) -> KvResult<()> {
        for (key, value) in entries {
            self.check_sizes(key.as_ref(), value.as_ref())?;
        }
        {
            let mut log = self.log.lock();
            log.append_batch(
                entries.iter().map(|(k, v)| (k.as_ref(), v.as_ref(), Operation::Put)),
                self.config.durable_writes,
            )?;
        }
        let mut data = self.data.write();
        for (key, value) in entries {
            data.insert(key.as_ref().to_vec(), value.as_ref().to_vec());
        }
        Ok(())
    }

    /// Remove `key`. Returns whether it was present.
    pub fn delete(&self, key: &[u8]) -> KvResult<bool> {
        {
            let mut log = self.log.lock();
            log.append(key, &[], Operation::Delete, self.config.durable_writes)?;
        }
        Ok(self.data.write().remove(key).is_some())
    }

    /// Remove every key starting with `prefix`. Returns how many were removed.
    pub fn delete_prefix(&self, prefix: &[u8]) -> KvResult<usize> {
        let keys = self.keys_with_prefix(prefix);
        if keys.is_empty() {
            return Ok(0);
        }
        {
            let mut log = self.log.lock();
            log.append_batch(
                keys.iter().map(|k| (k.as_slice(), &[][..], Operation::Delete)),
                self.config.durable_writes,
            )?;
        }
        let mut data = self.data.write();
        for key in &keys {
            data.remove(key);
        }
        Ok(keys.len())
    }

    /// Make every write so far durable.
    pub fn sync(&self) -> KvResult<()> {
        self.log.lock().sync()
    }

    /// Check if key exists.
    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.data.read().contains_key(key)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Returns true if the shard has no entries.
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Shard directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sorted keys starting with `prefix`.
    pub fn keys_with_prefix(&self, prefix: &[u8]) -> Vec<Vec<u8>> {
        let data = self.data.read();
        let mut keys: Vec<Vec<u8>> = data
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Rewrite the live set into a single fresh segment.
    ///
    /// Crash safety follows the atomic rename pattern: the compacted segment
    /// is written under a temporary name, synced, renamed into place, and
    /// only then are the old segments removed. Replaying old segments plus
    /// the compacted one yields the same table, so a crash at any point
    /// loses nothing.
    pub fn compact(&self) -> KvResult<CompactionStats> {
        let mut log = self.log.lock();
        log.sync()?;

        let old_segments = list_segments(&self.path)?;
        let mut original_bytes = 0u64;
        for (_, path) in &old_segments {
            original_bytes += fs::metadata(path)
                .map_err(|e| KvError::io_at(path, &e, "Failed to stat segment for compaction"))?
                .len();
        }

        let sequence = log.sequence() + 1;
        let final_path = segment_path(&self.path, sequence);
        let temp_path = final_path.with_extension("ckv.compact");

        let (live_entries, compacted_bytes) = {
            let data = self.data.read();
            let mut file = File::create(&temp_path)
                .map_err(|e| KvError::io_at(&temp_path, &e, "Failed to create compacted segment"))?;
            let mut buffer = Vec::with_capacity(COMPACTION_BUFFER_BYTES);
            let mut written = 0u64;

            for (key, value) in data.iter() {
                encode_record(key, value, Operation::Put, &mut buffer)?;
                if buffer.len() >= COMPACTION_BUFFER_BYTES {
                    file.write_all(&buffer)
                        .map_err(|e| KvError::io_at(&temp_path, &e, "Compacted segment write failed"))?;
                    written += buffer.len() as u64;
                    buffer.clear();
                }
            }
            file.write_all(&buffer)
                .map_err(|e| KvError::io_at(&temp_path, &e, "Compacted segment write failed"))?;
            written += buffer.len() as u64;
            durable_sync(&file)
                .map_err(|e| KvError::io_at(&temp_path, &e, "Compacted segment sync failed"))?;
            (data.len(), written)
        };

        fs::rename(&temp_path, &final_path)
            .map_err(|e| KvError::io_at(&final_path, &e, "Failed to rename compacted segment"))?;
        sync_dir(&self.path).map_err(|e| KvError::io_at(&self.path, &e, "Directory sync failed"))?;

        for (_, path) in &old_segments {
            if let Err(e) = fs::remove_file(path) {
                warn!(segment = %path.display(), error = %e, "Failed to remove compacted segment");
            }
        }
        sync_dir(&self.path).map_err(|e| KvError::io_at(&self.path, &e, "Directory sync failed"))?;

        log.switch_to(sequence)?;

        let stats = CompactionStats {
            segments_removed: old_segments.len(),
            live_entries,
            original_bytes,
            compacted_bytes,
        };
        info!(
            shard = %self.path.display(),
            live_entries,
            bytes_saved = stats.bytes_saved(),
            "Compacted shard"
        );
        Ok(stats)
    }
}

impl Drop for Shard {
    fn drop(&mut self) {
        if let Err(e) = self.log.get_mut().sync() {
            warn!(shard = %self.path.display(), error = %e, "Failed to sync shard log on close");
        }
    }
}
