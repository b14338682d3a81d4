//! Integration tests: shard recovery from damaged logs.

use std::fs::OpenOptions;
use std::io::Write;

use compart_kv::log::list_segments;
use compart_kv::{Shard, ShardConfig};
use tempfile::TempDir;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn filled_shard(dir: &TempDir) {
    let shard = Shard::open(dir.path(), ShardConfig::durable()).unwrap();
    shard.put(b"frame:1:0", &[1; 64]).unwrap();
    shard.put(b"frame:1:1", &[2; 64]).unwrap();
    shard.put(b"frame:1:2", &[3; 64]).unwrap();
}

fn only_segment(dir: &TempDir) -> std::path::PathBuf {
    let segments = list_segments(dir.path()).unwrap();
    assert_eq!(segments.len(), 1);
    segments[0].1.clone()
}

// ---------------------------------------------------------------------------
// Damage at the tail
// ---------------------------------------------------------------------------

#[test]
fn test_torn_tail_is_dropped() {
    let dir = TempDir::new().unwrap();
    filled_shard(&dir);

    // half a record header, as left by a crash mid-append
    let mut file = OpenOptions::new().append(true).open(only_segment(&dir)).unwrap();
    file.write_all(b"CKV1\x00\x00").unwrap();
    drop(file);

    let shard = Shard::open(dir.path(), ShardConfig::durable()).unwrap();
    assert_eq!(shard.len(), 3);
    assert_eq!(shard.get(b"frame:1:2"), Some(vec![3; 64]));

    // the shard keeps accepting writes after the damaged tail
    shard.put(b"frame:1:3", &[4; 64]).unwrap();
    drop(shard);
    let shard = Shard::open(dir.path(), ShardConfig::durable()).unwrap();
    assert_eq!(shard.get(b"frame:1:3"), Some(vec![4; 64]));
    assert_eq!(shard.len(), 4);
}

#[test]
fn test_corrupt_record_is_skipped() {
    let dir = TempDir::new().unwrap();
    filled_shard(&dir);

    let path = only_segment(&dir);
    let mut bytes = std::fs::read(&path).unwrap();
    // last byte belongs to the value of the last record
    let last = bytes.len() - 1;
    bytes[last] ^= 0xFF;
    std::fs::write(&path, bytes).unwrap();

    let shard = Shard::open(dir.path(), ShardConfig::durable()).unwrap();
    assert_eq!(shard.get(b"frame:1:0"), Some(vec![1; 64]));
    assert_eq!(shard.get(b"frame:1:1"), Some(vec![2; 64]));
    assert_eq!(shard.get(b"frame:1:2"), None);
}

// ---------------------------------------------------------------------------
// Compaction
// ---------------------------------------------------------------------------

#[test]
fn test_compaction_survives_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let shard = Shard::open(dir.path(), ShardConfig::durable()).unwrap();
        for i in 0..100u32 {
            shard.put(format!("counts:{}", i % 10).as_bytes(), &i.to_le_bytes()).unwrap();
        }
        shard.delete_prefix(b"counts:9").unwrap();
        let stats = shard.compact().unwrap();
        assert_eq!(stats.live_entries, 9);
        assert!(stats.compacted_bytes < stats.original_bytes);
    }

    let shard = Shard::open(dir.path(), ShardConfig::durable()).unwrap();
    assert_eq!(shard.len(), 9);
    assert_eq!(shard.get(b"counts:3"), Some(93u32.to_le_bytes().to_vec()));
    assert!(!shard.contains_key(b"counts:9"));
    assert_eq!(list_segments(dir.path()).unwrap().len(), 1);
}
