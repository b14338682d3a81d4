//! Key/value backend
//!
//! A report is a set of entries in one or more [`Shard`]s under
//! `<store>/shard-NN`. Every shard holds a full replica; reads stripe their
//! keys across shards so that a frame load fans out over all of them.
//!
//! A store may gain shards after a report was written; the header records
//! how many shards held the report, and reads stripe across only those.
//!
//! Keys are scoped by report name and target (`<name>/<target>/`):
//!
//! | key                   | value                                    |
//! |-----------------------|------------------------------------------|
//! | `header`              | 40-byte header, see [`KvHeader`]         |
//! | `gids`                | `u32` per cell                           |
//! | `dunit`, `tunit`      | UTF-8 unit strings                       |
//! | `counts:<gid>`        | `u16` compartment count per section      |
//! | `frame:<gid>:<index>` | `f32` per compartment of the cell        |
//!
//! Numbers are stored in the writer's byte order; the header magic tells a
//! reader whether to swap.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use compart_kv::{Shard, ShardConfig};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::backend::{check_header, neuron_run, ReportBackend, ReportSink};
use crate::bytes::{decode_f32s, encode_f32s, ByteReader};
use crate::config::ReportConfig;
use crate::error::{ReportError, ReportWarning, Result};
use crate::index::{CellRun, CompartmentIndex, ViewMapping};
use crate::pool::TaskPool;
use crate::time::TimeAxis;
use crate::types::{AccessMode, FrameBatch, Gid, GidSet, ReportMetadata};

/// Header magic in the writer's byte order
pub const HEADER_MAGIC: u32 = 0xdb;
/// Bumped with every change to a key or value layout
pub const FORMAT_VERSION: u32 = 3;
/// Encoded header size
pub const HEADER_LENGTH: usize = 40;

const SHARD_PREFIX: &str = "shard-";

/// Report-level header entry.
///
/// Layout: magic u32 @0, version u32 @4, gid count u32 @8, shard count u32 @12,
/// start f64 @16, end f64 @24, step f64 @32.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KvHeader {
    pub version: u32,
    pub gid_count: u32,
    /// Shards replicating the report; 0 means every shard of the store
    pub shards: u32,
    pub start_time: f64,
    pub end_time: f64,
    pub time_step: f64,
}

impl KvHeader {
    pub fn encode(&self) -> [u8; HEADER_LENGTH] {
        let mut buf = [0u8; HEADER_LENGTH];
        buf[0..4].copy_from_slice(&HEADER_MAGIC.to_ne_bytes());
        buf[4..8].copy_from_slice(&self.version.to_ne_bytes());
        buf[8..12].copy_from_slice(&self.gid_count.to_ne_bytes());
        buf[12..16].copy_from_slice(&self.shards.to_ne_bytes());
        buf[16..24].copy_from_slice(&self.start_time.to_ne_bytes());
        buf[24..32].copy_from_slice(&self.end_time.to_ne_bytes());
        buf[32..40].copy_from_slice(&self.time_step.to_ne_bytes());
        buf
    }

    /// Decode a header, returning whether the entries need byte swapping.
    pub fn decode(bytes: &[u8], source: &str) -> Result<(Self, bool)> {
        let native = ByteReader::new(bytes, source);
        let swapped = if native.u32_at(0, "magic")? == HEADER_MAGIC {
            false
        } else if native.swapped(true).u32_at(0, "magic")? == HEADER_MAGIC {
            debug!(report = source, "Key/value report written with foreign byte order");
            true
        } else {
            return Err(ReportError::corrupt(
                source,
                format!("header magic 0x{:x} is not 0x{:x}", native.u32_at(0, "magic")?, HEADER_MAGIC),
            ));
        };
        let r = native.swapped(swapped);
        let header = Self {
            version: r.u32_at(4, "version")?,
            gid_count: r.u32_at(8, "gid count")?,
            shards: r.u32_at(12, "shard count")?,
            start_time: r.f64_at(16, "start time")?,
            end_time: r.f64_at(24, "end time")?,
            time_step: r.f64_at(32, "time step")?,
        };
        if header.version != FORMAT_VERSION {
            return Err(ReportError::VersionMismatch { expected: FORMAT_VERSION, found: header.version });
        }
        if !(header.end_time > header.start_time) || !(header.time_step > 0.0) {
            return Err(ReportError::corrupt(
                source,
                format!(
                    "invalid report time {}..{}/{}",
                    header.start_time, header.end_time, header.time_step
                ),
            ));
        }
        Ok((header, swapped))
    }
}

/// Key builder for one report scope.
#[derive(Debug, Clone)]
struct Scope {
    prefix: String,
}

impl Scope {
    fn new(name: &str, target: &str) -> Self {
        Self { prefix: format!("{}/{}/", name, target) }
    }

    fn key(&self, suffix: &str) -> Vec<u8> {
        format!("{}{}", self.prefix, suffix).into_bytes()
    }

    fn header(&self) -> Vec<u8> {
        self.key("header")
    }

    fn gids(&self) -> Vec<u8> {
        self.key("gids")
    }

    fn data_unit(&self) -> Vec<u8> {
        self.key("dunit")
    }

    fn time_unit(&self) -> Vec<u8> {
        self.key("tunit")
    }

    fn counts(&self, gid: Gid) -> Vec<u8> {
        self.key(&format!("counts:{}", gid))
    }

    fn frame(&self, gid: Gid, index: usize) -> Vec<u8> {
        self.key(&format!("frame:{}:{}", gid, index))
    }
}

/// The shards of one store, each a full replica.
struct ShardSet {
    root: PathBuf,
    shards: Vec<Shard>,
}

impl ShardSet {
    fn shard_path(root: &Path, i: usize) -> PathBuf {
        root.join(format!("{}{:02}", SHARD_PREFIX, i))
    }

    /// Number of shard directories present under `root`.
    fn existing(root: &Path) -> Result<usize> {
        if !root.is_dir() {
            return Ok(0);
        }
        let mut count = 0;
        while Self::shard_path(root, count).is_dir() {
            count += 1;
        }
        Ok(count)
    }

    /// Open at least `count` shards, creating missing ones.
    fn create(root: &Path, count: usize, config: &ShardConfig) -> Result<Self> {
        let count = count.max(1).max(Self::existing(root)?);
        let shards = (0..count)
            .map(|i| Shard::open(Self::shard_path(root, i), config.clone()).map_err(ReportError::from))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { root: root.to_path_buf(), shards })
    }

    /// Open the shards of an existing store.
    fn open(root: &Path, config: &ShardConfig) -> Result<Self> {
        let count = Self::existing(root)?;
        if count == 0 {
            return Err(ReportError::Io {
                path: Some(root.to_path_buf()),
                kind: std::io::ErrorKind::NotFound,
                message: "no key/value store found".to_string(),
            });
        }
        Self::create(root, count, config)
    }

    /// Keep only the first `count` shards, the ones a report was written to.
    fn limit(&mut self, count: usize, source: &str) -> Result<()> {
        if count > self.shards.len() {
            return Err(ReportError::corrupt(
                source,
                format!("report was written to {} shards, store has {}", count, self.shards.len()),
            ));
        }
        if count > 0 {
            self.shards.truncate(count);
        }
        Ok(())
    }

    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.shards.iter().find_map(|shard| shard.get(key))
    }

    /// Fetch `keys` from one replica under a single lock.
    fn get_many(&self, keys: &[Vec<u8>]) -> Vec<Option<Vec<u8>>> {
        match self.shards.first() {
            Some(shard) => shard.get_many(keys),
            None => vec![None; keys.len()],
        }
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        for shard in &self.shards {
            shard.put(key, value)?;
        }
        Ok(())
    }

    /// Write `entries` to every shard, one log append per shard.
    fn put_batch(&self, entries: &[(Vec<u8>, Vec<u8>)]) -> Result<()> {
        for shard in &self.shards {
            shard.put_batch(entries)?;
        }
        Ok(())
    }

    /// Fetch `keys`, key `i` from shard `i % shards`, all shards in parallel.
    fn fetch_striped<T, F>(&self, keys: &[Vec<u8>], decode: F) -> Vec<Option<T>>
    where
        T: Send,
        F: Fn(&[u8]) -> T + Sync,
    {
        let stripes = self.shards.len();
        let fetched: Vec<Vec<(usize, Option<T>)>> = self
            .shards
            .par_iter()
            .enumerate()
            .map(|(s, shard)| {
                (s..keys.len())
                    .step_by(stripes)
                    .map(|i| (i, shard.with_value(&keys[i], &decode)))
                    .collect()
            })
            .collect();

        let mut values: Vec<Option<T>> = (0..keys.len()).map(|_| None).collect();
        for (i, value) in fetched.into_iter().flatten() {
            values[i] = value;
        }
        values
    }

    fn delete_prefix(&self, prefix: &[u8]) -> Result<usize> {
        let mut removed = 0;
        for shard in &self.shards {
            removed = removed.max(shard.delete_prefix(prefix)?);
        }
        Ok(removed)
    }

    fn sync(&self) -> Result<()> {
        for shard in &self.shards {
            shard.sync()?;
        }
        Ok(())
    }

    fn compact(&self) -> Result<()> {
        for shard in &self.shards {
            shard.compact()?;
        }
        Ok(())
    }
}

fn encode_u32s(values: impl IntoIterator<Item = u32>) -> Vec<u8> {
    values.into_iter().flat_map(u32::to_ne_bytes).collect()
}

fn encode_u16s(values: &[u16]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_ne_bytes()).collect()
}

fn decode_u32s(bytes: &[u8], swapped: bool) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|c| {
            let value = u32::from_ne_bytes([c[0], c[1], c[2], c[3]]);
            if swapped { value.swap_bytes() } else { value }
        })
        .collect()
}

fn decode_u16s(bytes: &[u8], swapped: bool) -> Option<Vec<u16>> {
    if bytes.len() % 2 != 0 {
        return None;
    }
    Some(
        bytes
            .chunks_exact(2)
            .map(|c| {
                let value = u16::from_ne_bytes([c[0], c[1]]);
                if swapped { value.swap_bytes() } else { value }
            })
            .collect(),
    )
}

/// Read side of a key/value report.
pub struct KvBackend {
    store: ShardSet,
    scope: Scope,
    source: String,
    swapped: bool,
    metadata: ReportMetadata,
    axis: TimeAxis,
    index: Arc<CompartmentIndex>,
    warnings: Vec<ReportWarning>,
}

impl KvBackend {
    /// Open the report `name`/`target` in the store at `root`.
    ///
    /// Only the cells in `requested` are loaded (all of them when it is
    /// empty); requested cells without a stored mapping are reported as a
    /// [`ReportWarning::MissingMapping`].
    pub fn open(
        root: &Path,
        name: &str,
        target: &str,
        requested: &GidSet,
        config: &ReportConfig,
        pool: &TaskPool,
    ) -> Result<Self> {
        let mut store = ShardSet::open(root, &config.shard)?;
        let scope = Scope::new(name, target);
        let source = format!("{}#{}", root.display(), scope.prefix);

        let header_bytes = store
            .get(&scope.header())
            .ok_or_else(|| ReportError::corrupt(&source, "incomplete or missing report header"))?;
        let (header, swapped) = KvHeader::decode(&header_bytes, &source)?;
        store.limit(header.shards as usize, &source)?;

        let unit = |value: Option<Vec<u8>>, default: &str| {
            value
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                .filter(|unit| !unit.is_empty())
                .unwrap_or_else(|| default.to_string())
        };
        let mut entries = store
            .get_many(&[scope.gids(), scope.data_unit(), scope.time_unit()])
            .into_iter();
        let stored = entries
            .next()
            .flatten()
            .map(|bytes| decode_u32s(&bytes, swapped))
            .ok_or_else(|| ReportError::corrupt(&source, "missing gid set"))?;
        let data_unit = unit(entries.next().flatten(), "mV");
        let time_unit = unit(entries.next().flatten(), "ms");
        if stored.len() != header.gid_count as usize {
            return Err(ReportError::corrupt(
                &source,
                format!("header lists {} gids, gid set holds {}", header.gid_count, stored.len()),
            ));
        }

        let (gids, mut missing): (Vec<Gid>, Vec<Gid>) = if requested.is_empty() {
            (stored, Vec::new())
        } else {
            let stored: GidSet = stored.into_iter().collect();
            requested.iter().copied().partition(|gid| stored.contains(gid))
        };
        let total = gids.len() + missing.len();

        let keys: Vec<Vec<u8>> = gids.iter().map(|&gid| scope.counts(gid)).collect();
        let fetched = pool.install(|| store.fetch_striped(&keys, |bytes| decode_u16s(bytes, swapped)));

        let mut counts = Vec::with_capacity(gids.len());
        for (&gid, value) in gids.iter().zip(fetched) {
            match value.flatten() {
                Some(section_counts) => counts.push((gid, section_counts)),
                None => missing.push(gid),
            }
        }
        let mut warnings = Vec::new();
        if !missing.is_empty() {
            if counts.is_empty() {
                return Err(ReportError::MissingMapping { missing: missing.len(), requested: total });
            }
            missing.sort_unstable();
            warn!(report = %source, missing = missing.len(), "Cells without compartment mapping skipped");
            warnings.push(ReportWarning::MissingMapping { requested: total, missing });
        }

        let index = CompartmentIndex::from_counts(counts);
        let axis = TimeAxis::new(header.start_time, header.end_time, header.time_step);
        let metadata = ReportMetadata {
            start_time: header.start_time,
            end_time: header.end_time,
            time_step: header.time_step,
            time_unit,
            data_unit,
            cell_count: index.len(),
            frame_count: axis.frame_count(),
            compartment_count: index.frame_size(),
        };

        info!(
            report = %source,
            shards = store.shards.len(),
            cells = metadata.cell_count,
            frames = metadata.frame_count,
            swapped,
            "Opened key/value report"
        );

        Ok(Self {
            store,
            scope,
            source,
            swapped,
            metadata,
            axis,
            index: Arc::new(index),
            warnings,
        })
    }

    /// Shards the report is read from.
    pub fn shard_count(&self) -> usize {
        self.store.shards.len()
    }

    /// Fetch one key per `(frame, run)` pair and scatter the values into rows.
    fn gather(&self, runs: &[CellRun], row_size: usize, frames: &[usize]) -> Result<FrameBatch> {
        let mut batch = FrameBatch {
            timestamps: frames.iter().map(|&frame| self.axis.timestamp(frame)).collect(),
            data: vec![0.0; row_size * frames.len()],
            frame_size: row_size,
        };
        if runs.is_empty() {
            return Ok(batch);
        }

        let keys: Vec<Vec<u8>> = frames
            .iter()
            .flat_map(|&frame| runs.iter().map(move |run| (frame, run.gid)))
            .map(|(frame, gid)| self.scope.frame(gid, frame))
            .collect();
        let values = self.store.fetch_striped(&keys, |bytes| bytes.to_vec());

        let mut found = 0;
        for (k, value) in values.into_iter().enumerate() {
            let row = k / runs.len();
            let run = &runs[k % runs.len()];
            match value {
                Some(bytes) if bytes.len() == run.len * 4 => {
                    let start = row * row_size + run.target;
                    decode_f32s(&bytes, self.swapped, &mut batch.data[start..start + run.len]);
                    found += 1;
                }
                Some(bytes) => warn!(
                    report = %self.source,
                    gid = run.gid,
                    frame = frames[row],
                    expected = run.len,
                    stored = bytes.len() / 4,
                    "Frame entry has the wrong size"
                ),
                None => {}
            }
        }
        if found < keys.len() {
            return Err(ReportError::MissingData { expected: keys.len(), found });
        }
        Ok(batch)
    }
}

impl ReportBackend for KvBackend {
    fn metadata(&self) -> &ReportMetadata {
        &self.metadata
    }

    fn time_axis(&self) -> &TimeAxis {
        &self.axis
    }

    fn index(&self) -> &Arc<CompartmentIndex> {
        &self.index
    }

    fn warnings(&self) -> &[ReportWarning] {
        &self.warnings
    }

    fn load_frames(&self, mapping: &ViewMapping, frames: &[usize]) -> Result<FrameBatch> {
        let runs: Vec<CellRun> = mapping.runs().collect();
        self.gather(&runs, mapping.frame_size(), frames)
    }

    fn load_neuron(&self, mapping: &ViewMapping, gid: Gid) -> Result<FrameBatch> {
        let run = neuron_run(mapping, gid)?;
        let frames: Vec<usize> = (0..self.axis.frame_count()).collect();
        self.gather(std::slice::from_ref(&run), run.len, &frames)
    }
}

/// Write side of a key/value report.
///
/// The header is persisted lazily, on the first frame written after the
/// header or cell set changed and on every `flush`, so it always describes
/// everything written so far.
pub struct KvWriter {
    store: ShardSet,
    scope: Scope,
    source: String,
    metadata: Option<ReportMetadata>,
    compartments: BTreeMap<Gid, usize>,
    header_dirty: bool,
}

impl KvWriter {
    /// Open `name`/`target` in the store at `root` for writing.
    pub fn create(
        root: &Path,
        name: &str,
        target: &str,
        shards: usize,
        config: &ShardConfig,
        mode: AccessMode,
    ) -> Result<Self> {
        let store = ShardSet::create(root, shards, config)?;
        let scope = Scope::new(name, target);
        let source = format!("{}#{}", store.root.display(), scope.prefix);

        let mut writer = Self {
            store,
            scope,
            source,
            metadata: None,
            compartments: BTreeMap::new(),
            header_dirty: false,
        };
        if writer.store.get(&writer.scope.header()).is_some() {
            match mode {
                AccessMode::Write => {
                    return Err(ReportError::AlreadyExists { uri: writer.source.clone() });
                }
                AccessMode::Overwrite => {
                    info!(report = %writer.source, "Overwriting existing report");
                    writer.erase()?;
                }
            }
        }
        debug!(report = %writer.source, shards = writer.store.shards.len(), "Created key/value report");
        Ok(writer)
    }

    fn flush_header(&mut self) -> Result<()> {
        if !self.header_dirty {
            return Ok(());
        }
        let metadata = self
            .metadata
            .as_ref()
            .ok_or_else(|| ReportError::InvalidArgument("write_header must be called before writing data".into()))?;
        let header = KvHeader {
            version: FORMAT_VERSION,
            gid_count: self.compartments.len() as u32,
            shards: self.store.shards.len() as u32,
            start_time: metadata.start_time,
            end_time: metadata.end_time,
            time_step: metadata.time_step,
        };
        self.store.put_batch(&[
            (self.scope.header(), header.encode().to_vec()),
            (self.scope.gids(), encode_u32s(self.compartments.keys().copied())),
            (self.scope.data_unit(), metadata.data_unit.clone().into_bytes()),
            (self.scope.time_unit(), metadata.time_unit.clone().into_bytes()),
        ])?;
        self.header_dirty = false;
        debug!(report = %self.source, cells = self.compartments.len(), "Wrote report header");
        Ok(())
    }
}

impl ReportSink for KvWriter {
    fn write_header(&mut self, metadata: &ReportMetadata) -> Result<()> {
        check_header(metadata)?;
        self.metadata = Some(metadata.clone());
        self.header_dirty = true;
        Ok(())
    }

    fn write_compartments(&mut self, gid: Gid, counts: &[u16]) -> Result<()> {
        if counts.is_empty() {
            return Err(ReportError::InvalidArgument(format!("gid {} has no sections", gid)));
        }
        self.store.put(&self.scope.counts(gid), &encode_u16s(counts))?;
        let total = counts.iter().map(|&c| usize::from(c)).sum();
        self.compartments.insert(gid, total);
        self.header_dirty = true;
        Ok(())
    }

    fn write_frame(&mut self, gid: Gid, values: &[f32], timestamp: f64) -> Result<()> {
        let metadata = self
            .metadata
            .as_ref()
            .ok_or_else(|| ReportError::InvalidArgument("write_header must be called before write_frame".into()))?;
        let expected = *self
            .compartments
            .get(&gid)
            .ok_or_else(|| ReportError::InvalidArgument(format!("gid {} has no compartments registered", gid)))?;
        if values.len() != expected {
            return Err(ReportError::InvalidArgument(format!(
                "gid {} should have {} values, got {}",
                gid,
                expected,
                values.len()
            )));
        }
        let axis = TimeAxis::new(metadata.start_time, metadata.end_time, metadata.time_step);
        let index = axis.checked_frame_index(timestamp)?;

        self.flush_header()?;
        self.store.put(&self.scope.frame(gid, index), &encode_f32s(values))
    }

    fn flush(&mut self) -> Result<()> {
        self.flush_header()?;
        self.store.sync()
    }

    fn erase(&mut self) -> Result<()> {
        let removed = self.store.delete_prefix(self.scope.prefix.as_bytes())?;
        self.store.compact()?;
        self.metadata = None;
        self.compartments.clear();
        self.header_dirty = false;
        info!(report = %self.source, entries = removed, "Erased report");
        Ok(())
    }
}

impl Drop for KvWriter {
    fn drop(&mut self) {
        if self.header_dirty && self.metadata.is_some() {
            if let Err(e) = self.flush() {
                warn!(report = %self.source, error = %e, "Failed to flush report on close");
            }
        }
    }
}
