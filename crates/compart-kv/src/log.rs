//! Append-only record log for shards
//!
//! A shard's log is a directory of segments named `log-{seq:016x}.ckv`.
//! Writes are appended to the highest segment; once it would exceed the
//! rotation size a new segment is started. Replay reads every segment in
//! sequence order and returns the records in write order.
//!
//! Write ordering contract: a record is appended (and synced, when the caller
//! asks for it) before the shard's RAM table is updated.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{KvError, KvResult};
use crate::format::{decode_record, encode_record, find_next_magic, Operation, Record, RECORD_HEADER_SIZE, RECORD_MAGIC};
use crate::platform::durable_sync;

const SEGMENT_PREFIX: &str = "log-";
const SEGMENT_SUFFIX: &str = ".ckv";

/// Path of segment `sequence` inside `dir`.
pub fn segment_path(dir: &Path, sequence: u64) -> PathBuf {
    dir.join(format!("{}{:016x}{}", SEGMENT_PREFIX, sequence, SEGMENT_SUFFIX))
}

/// All segments in `dir`, sorted by sequence number.
pub fn list_segments(dir: &Path) -> KvResult<Vec<(u64, PathBuf)>> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| KvError::io_at(dir, &e, "Failed to read log directory"))?;

    let mut segments = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| KvError::io_at(dir, &e, "Failed to read directory entry"))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(hex) = name
            .strip_prefix(SEGMENT_PREFIX)
            .and_then(|rest| rest.strip_suffix(SEGMENT_SUFFIX))
        else {
            continue;
        };
        if let Ok(sequence) = u64::from_str_radix(hex, 16) {
            segments.push((sequence, entry.path()));
        }
    }
    segments.sort_by_key(|(sequence, _)| *sequence);
    Ok(segments)
}

/// Appends records to the current segment and rotates on size.
pub struct LogWriter {
    file: File,
    path: PathBuf,
    size: u64,
    dir: PathBuf,
    sequence: u64,
    segment_size: u64,
    scratch: Vec<u8>,
}

impl LogWriter {
    /// Open the log in `dir`, resuming the highest existing segment.
    pub fn open(dir: &Path, segment_size: u64) -> KvResult<Self> {
        std::fs::create_dir_all(dir)
            .map_err(|e| KvError::io_at(dir, &e, "Failed to create log directory"))?;

        let sequence = list_segments(dir)?
            .last()
            .map(|(sequence, _)| *sequence)
            .unwrap_or(1);
        let (file, path, size) = open_segment(dir, sequence)?;

        Ok(Self {
            file,
            path,
            size,
            dir: dir.to_path_buf(),
            sequence,
            segment_size,
            scratch: Vec::new(),
        })
    }

    /// Append one record. With `sync` the call returns only once the bytes
    /// are durable.
    pub fn append(&mut self, key: &[u8], value: &[u8], op: Operation, sync: bool) -> KvResult<()> {
        self.scratch.clear();
        encode_record(key, value, op, &mut self.scratch)?;
        self.write_scratch(sync)
    }

    /// Append many records with a single write and at most one sync.
    pub fn append_batch<'a, I>(&mut self, records: I, sync: bool) -> KvResult<()>
    where
        I: IntoIterator<Item = (&'a [u8], &'a [u8], Operation)>,
    {
        self.scratch.clear();
        for (key, value, op) in records {
            encode_record(key, value, op, &mut self.scratch)?;
        }
        if self.scratch.is_empty() {
            return Ok(());
        }
        self.write_scratch(sync)
    }

    fn write_scratch(&mut self, sync: bool) -> KvResult<()> {
        let len = self.scratch.len() as u64;
        if self.size > 0 && self.size + len > self.segment_size {
            self.rotate()?;
        }

        self.file
            .write_all(&self.scratch)
            .map_err(|e| KvError::io_at(&self.path, &e, "Log write failed"))?;
        if sync {
            self.sync()?;
        }
        self.size += len;
        Ok(())
    }

    /// Sync the current segment without writing anything.
    pub fn sync(&self) -> KvResult<()> {
        durable_sync(&self.file).map_err(|e| KvError::io_at(&self.path, &e, "Log sync failed"))
    }

    /// Close the current segment and continue in a new one.
    pub fn rotate(&mut self) -> KvResult<()> {
        self.switch_to(self.sequence + 1)
    }

    /// Continue writing in segment `sequence`, syncing the current one first.
    pub(crate) fn switch_to(&mut self, sequence: u64) -> KvResult<()> {
        self.sync()?;
        let (file, path, size) = open_segment(&self.dir, sequence)?;
        debug!(segment = %path.display(), "Switched log segment");
        self.file = file;
        self.path = path;
        self.size = size;
        self.sequence = sequence;
        Ok(())
    }

    /// Sequence number of the segment being written.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Path of the segment being written.
    pub fn current_path(&self) -> &Path {
        &self.path
    }

    /// Size of the segment being written.
    pub fn current_size(&self) -> u64 {
        self.size
    }
}

fn open_segment(dir: &Path, sequence: u64) -> KvResult<(File, PathBuf, u64)> {
    let path = segment_path(dir, sequence);
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| KvError::io_at(&path, &e, "Failed to open log segment"))?;
    let size = file
        .metadata()
        .map_err(|e| KvError::io_at(&path, &e, "Failed to stat log segment"))?
        .len();
    Ok((file, path, size))
}

/// Replays segments into records.
pub struct LogReader {
    dir: PathBuf,
}

impl LogReader {
    /// Reader for the log in `dir`.
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self { dir: dir.as_ref().to_path_buf() }
    }

    /// All intact records of all segments, in write order.
    ///
    /// Per segment: records with a bad magic or checksum are skipped by
    /// scanning for the next magic; a record cut short at the end of the
    /// segment is the crash point and ends replay of that segment.
    pub fn replay(&self) -> KvResult<Vec<Record>> {
        Ok(self.scan()?.0)
    }

    /// Like [`LogReader::replay`], but cuts unreadable bytes off the end of
    /// the newest segment so that appends resume at a record boundary.
    pub fn recover(&self) -> KvResult<Vec<Record>> {
        let (records, tail) = self.scan()?;
        if let Some((path, valid_len)) = tail {
            let file = OpenOptions::new()
                .write(true)
                .open(&path)
                .map_err(|e| KvError::io_at(&path, &e, "Failed to open segment for repair"))?;
            file.set_len(valid_len)
                .map_err(|e| KvError::io_at(&path, &e, "Failed to truncate torn segment"))?;
            durable_sync(&file).map_err(|e| KvError::io_at(&path, &e, "Failed to sync repaired segment"))?;
            warn!(segment = %path.display(), valid_len, "Truncated torn tail of newest segment");
        }
        Ok(records)
    }

    /// Records of every segment, plus the newest segment's readable length
    /// when it ends in unreadable bytes.
    fn scan(&self) -> KvResult<(Vec<Record>, Option<(PathBuf, u64)>)> {
        if !self.dir.exists() {
            return Ok((Vec::new(), None));
        }
        let mut records = Vec::new();
        let mut tail = None;
        for (_, path) in list_segments(&self.dir)? {
            let (segment, valid_len) = scan_segment(&path)?;
            records.extend(segment);
            tail = valid_len.map(|len| (path, len));
        }
        debug!(dir = %self.dir.display(), records = records.len(), "Replayed shard log");
        Ok((records, tail))
    }

    /// Records of a single segment.
    pub fn replay_segment(path: &Path) -> KvResult<Vec<Record>> {
        Ok(scan_segment(path)?.0)
    }
}

/// Decode a segment. The second value is the offset where decoding stopped,
/// if unreadable bytes follow it.
fn scan_segment(path: &Path) -> KvResult<(Vec<Record>, Option<u64>)> {
    let mut buffer = Vec::new();
    File::open(path)
        .and_then(|mut file| file.read_to_end(&mut buffer))
        .map_err(|e| KvError::io_at(path, &e, "Failed to read log segment"))?;

    let mut records = Vec::new();
    let mut offset = 0usize;

    while offset < buffer.len() {
        if buffer.len() - offset < RECORD_HEADER_SIZE {
            warn!(segment = %path.display(), offset, "Partial record header at end of segment");
            break;
        }
        if buffer[offset..offset + 4] != RECORD_MAGIC {
            warn!(segment = %path.display(), offset, "Bad record magic, scanning for next record");
            match find_next_magic(&buffer, offset + 1) {
                Some(next) => {
                    offset = next;
                    continue;
                }
                None => break,
            }
        }

        match decode_record(&buffer[offset..], path, offset as u64) {
            Ok((record, used)) => {
                records.push(record);
                offset += used;
            }
            Err(KvError::TornWrite { available_bytes, expected_size, .. }) => {
                warn!(
                    segment = %path.display(),
                    offset,
                    expected_size,
                    available_bytes,
                    "Torn write at end of segment"
                );
                break;
            }
            Err(e) => {
                warn!(segment = %path.display(), offset, error = %e, "Corrupt record, resyncing");
                match find_next_magic(&buffer, offset + 1) {
                    Some(next) => offset = next,
                    None => break,
                }
            }
        }
    }

    let valid_len = (offset < buffer.len()).then_some(offset as u64);
    Ok((records, valid_len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SEGMENT: u64 = 1024 * 1024;

    #[test]
    fn test_write_replay_roundtrip() {
        let temp = TempDir::new().unwrap();

        let mut writer = LogWriter::open(temp.path(), SEGMENT).unwrap();
        writer.append(b"header", b"h", Operation::Put, true).unwrap();
        writer.append(b"counts:1", b"\x02\x00", Operation::Put, false).unwrap();
        writer.append(b"header", b"", Operation::Delete, false).unwrap();
        writer.sync().unwrap();
        drop(writer);

        let records = LogReader::new(temp.path()).replay().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].key, b"header");
        assert_eq!(records[1].value, b"\x02\x00");
        assert_eq!(records[2].op, Operation::Delete);
    }

    #[test]
    fn test_batch_append() {
        let temp = TempDir::new().unwrap();
        let mut writer = LogWriter::open(temp.path(), SEGMENT).unwrap();
        let batch: Vec<(&[u8], &[u8], Operation)> = vec![
            (&b"a"[..], &b"1"[..], Operation::Put),
            (&b"b"[..], &b"2"[..], Operation::Put),
        ];
        writer.append_batch(batch, true).unwrap();
        drop(writer);

        let records = LogReader::new(temp.path()).replay().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].key, b"b");
    }

    #[test]
    fn test_rotation_keeps_order() {
        let temp = TempDir::new().unwrap();
        let mut writer = LogWriter::open(temp.path(), 64).unwrap();
        for i in 0..10u8 {
            writer.append(&[b'k', i], &[i; 20], Operation::Put, false).unwrap();
        }
        assert!(writer.sequence() > 1);
        drop(writer);

        assert!(list_segments(temp.path()).unwrap().len() > 1);
        let records = LogReader::new(temp.path()).replay().unwrap();
        assert_eq!(records.len(), 10);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.key, vec![b'k', i as u8]);
        }
    }

    #[test]
    fn test_corruption_skips_bad_record() {
        let temp = TempDir::new().unwrap();
        let mut writer = LogWriter::open(temp.path(), SEGMENT).unwrap();
        writer.append(b"good1", b"val1", Operation::Put, false).unwrap();
        let first_len = writer.current_size() as usize;
        writer.append(b"good2", b"val2", Operation::Put, false).unwrap();
        writer.append(b"good3", b"val3", Operation::Put, false).unwrap();
        let path = writer.current_path().to_path_buf();
        drop(writer);

        let mut data = std::fs::read(&path).unwrap();
        // last byte of the second record's value
        let second_end = first_len * 2;
        data[second_end - 1] ^= 0xFF;
        std::fs::write(&path, data).unwrap();

        let records = LogReader::new(temp.path()).replay().unwrap();
        let keys: Vec<&[u8]> = records.iter().map(|r| r.key.as_slice()).collect();
        assert_eq!(keys, vec![&b"good1"[..], &b"good3"[..]]);
    }

    #[test]
    fn test_torn_write_stops_cleanly() {
        let temp = TempDir::new().unwrap();
        let mut writer = LogWriter::open(temp.path(), SEGMENT).unwrap();
        writer.append(b"complete", b"entry", Operation::Put, true).unwrap();
        let path = writer.current_path().to_path_buf();
        drop(writer);

        let mut data = std::fs::read(&path).unwrap();
        data.extend_from_slice(&RECORD_MAGIC);
        data.extend_from_slice(&[0xFF, 0x00, 0x00, 0x00]);
        data.extend_from_slice(&[0u8; 8]);
        std::fs::write(&path, data).unwrap();

        let records = LogReader::new(temp.path()).replay().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, b"complete");
    }

    #[test]
    fn test_recover_truncates_torn_tail() {
        let temp = TempDir::new().unwrap();
        let mut writer = LogWriter::open(temp.path(), SEGMENT).unwrap();
        writer.append(b"complete", b"entry", Operation::Put, true).unwrap();
        let path = writer.current_path().to_path_buf();
        let good_len = writer.current_size();
        drop(writer);

        let mut data = std::fs::read(&path).unwrap();
        data.extend_from_slice(&RECORD_MAGIC);
        data.extend_from_slice(&[0x10, 0x00]);
        std::fs::write(&path, data).unwrap();

        assert_eq!(LogReader::new(temp.path()).recover().unwrap().len(), 1);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), good_len);

        let mut writer = LogWriter::open(temp.path(), SEGMENT).unwrap();
        writer.append(b"after", b"crash", Operation::Put, true).unwrap();
        drop(writer);
        let records = LogReader::new(temp.path()).replay().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].key, b"after");
    }

    #[test]
    fn test_missing_directory_replays_nothing() {
        let temp = TempDir::new().unwrap();
        let records = LogReader::new(temp.path().join("absent")).replay().unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_segment_naming() {
        let temp = TempDir::new().unwrap();
        let writer = LogWriter::open(temp.path(), SEGMENT).unwrap();
        let name = writer.current_path().file_name().unwrap().to_str().unwrap().to_string();
        assert_eq!(name, "log-0000000000000001.ckv");
    }
}
