//! Binary file backend
//!
//! A binary report is one flat file: header, cell table, mapping block and
//! frame data, all in the writer's byte order. Opening decodes the header
//! (swapping if needed), the cell table and the mapping block; the mapping is
//! decoded per cell on a bounded pool. Frames are then served from either a
//! read-only mapping or batched positional reads.
//!
//! The format is read-only here; [`BinarySink`] rejects every write.

mod header;
mod reader;

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use tracing::{info, warn};

pub use header::{BinaryHeader, CellInfo, CELL_INFO_LENGTH, HEADER_LENGTH, IDENTIFIER};

use crate::backend::aio::open_batched_reader;
use crate::backend::{neuron_run, ReportBackend, ReportSink};
use crate::bytes::ByteReader;
use crate::config::{ReadStrategy, ReportConfig};
use crate::error::{ReportError, ReportWarning, Result};
use crate::index::{CellRun, CompartmentIndex, RawCell, ViewMapping};
use crate::time::TimeAxis;
use crate::types::{FrameBatch, Gid, GidSet, ReportMetadata};
use reader::{FrameLayout, FrameSource, ReadPlan};

/// Read side of a binary report.
pub struct BinaryBackend {
    path: PathBuf,
    header: BinaryHeader,
    metadata: ReportMetadata,
    axis: TimeAxis,
    index: Arc<CompartmentIndex>,
    layout: FrameLayout,
    source: FrameSource,
    warnings: Vec<ReportWarning>,
}

impl BinaryBackend {
    /// Open `path`; `strategy` overrides the configured read strategy.
    ///
    /// The mapping block is decoded whole; the index then keeps only the
    /// cells of `requested` (all of them when it is empty).
    pub fn open(
        path: &Path,
        requested: &GidSet,
        config: &ReportConfig,
        strategy: Option<ReadStrategy>,
    ) -> Result<Self> {
        let name = path.display().to_string();
        let file = File::open(path).map_err(|e| ReportError::io_at(path, &e, "Failed to open report"))?;
        // SAFETY: the mapping is read-only and reports are not rewritten in place.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| ReportError::io_at(path, &e, "Failed to map report"))?;

        let header = BinaryHeader::parse(&mmap, &name)?;
        let cells = CellInfo::parse_table(&mmap, &header, &name)?;
        let data_offset = cells
            .first()
            .map(|cell| cell.data_offset)
            .ok_or_else(|| ReportError::corrupt(&name, "empty cell table"))?;
        if data_offset < header.cell_table_end() as u64 {
            return Err(ReportError::corrupt(
                &name,
                format!("data block at {} overlaps the cell table", data_offset),
            ));
        }

        let full = decode_mapping(&mmap, &header, cells, data_offset, config.mapping_threads, &name)?;
        let (index, warning) = full.restrict(requested)?;
        let compartment_count = if requested.is_empty() {
            header.compartment_count
        } else {
            index.cells().iter().map(|cell| cell.compartment_count).sum()
        };

        let frame_bytes = header.compartment_count as u64 * 4;
        let available = match frame_bytes {
            0 => header.frame_count,
            bytes => ((mmap.len() as u64).saturating_sub(data_offset) / bytes) as usize,
        };
        if available < header.frame_count {
            warn!(
                report = %name,
                header_frames = header.frame_count,
                stored_frames = available,
                "Report is truncated, serving only the complete frames"
            );
        }
        let axis = TimeAxis::new(header.start_time, header.end_time, header.time_step)
            .with_stored_frames(header.frame_count.min(available));

        let metadata = ReportMetadata {
            start_time: header.start_time,
            end_time: header.end_time,
            time_step: header.time_step,
            time_unit: header.time_unit.clone(),
            data_unit: header.data_unit.clone(),
            cell_count: index.len(),
            frame_count: axis.frame_count(),
            compartment_count,
        };
        let layout = FrameLayout {
            data_offset,
            frame_size: header.compartment_count,
            swapped: header.swapped,
        };

        let strategy = strategy.unwrap_or(config.read_strategy).resolve();
        let source = match strategy {
            ReadStrategy::Batched => {
                drop(mmap);
                FrameSource::Batched(open_batched_reader(file, path, config.io_batch_size))
            }
            _ => FrameSource::Mapped(mmap),
        };

        info!(
            report = %name,
            cells = metadata.cell_count,
            frames = metadata.frame_count,
            compartments = metadata.compartment_count,
            strategy = ?source.strategy(),
            swapped = header.swapped,
            "Opened binary report"
        );

        Ok(Self {
            path: path.to_path_buf(),
            header,
            metadata,
            axis,
            index: Arc::new(index),
            layout,
            source,
            warnings: warning.into_iter().collect(),
        })
    }

    /// The decoded header.
    pub fn header(&self) -> &BinaryHeader {
        &self.header
    }

    /// Strategy frames are read with.
    pub fn strategy(&self) -> ReadStrategy {
        self.source.strategy()
    }

    fn check_frames(&self, frames: &[usize]) -> Result<()> {
        match frames.iter().find(|&&frame| frame >= self.axis.frame_count()) {
            Some(frame) => Err(ReportError::InvalidArgument(format!(
                "frame {} beyond the {} stored frames",
                frame,
                self.axis.frame_count()
            ))),
            None => Ok(()),
        }
    }
}

/// Decode every cell's section tags and build the index on a bounded pool.
fn decode_mapping(
    mmap: &Mmap,
    header: &BinaryHeader,
    cells: Vec<CellInfo>,
    data_offset: u64,
    threads: usize,
    name: &str,
) -> Result<CompartmentIndex> {
    let pool = ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|i| format!("report-mapping-{}", i))
        .build()
        .map_err(|e| ReportError::InvalidConfig(format!("failed to start mapping pool: {}", e)))?;
    let bytes = ByteReader::new(mmap, name).swapped(header.swapped);
    let stride = header.mapping_size * 4;

    let raw = pool.install(|| {
        cells
            .par_iter()
            .map(|cell| {
                let relative = cell.data_offset.checked_sub(data_offset).filter(|r| r % 4 == 0).ok_or_else(|| {
                    ReportError::corrupt(
                        name,
                        format!("cell {} data offset {} not inside the data block", cell.gid, cell.data_offset),
                    )
                })?;
                let base = usize::try_from(cell.mapping_offset)
                    .map_err(|_| ReportError::corrupt(name, format!("cell {} mapping offset too large", cell.gid)))?;
                let section_tags = (0..cell.compartment_count)
                    .map(|j| {
                        let tag = bytes.f32_at(base + j * stride, "section id")?;
                        if !tag.is_finite() || tag < 0.0 || tag > u32::MAX as f32 {
                            return Err(ReportError::corrupt(
                                name,
                                format!("cell {} has invalid section id {}", cell.gid, tag),
                            ));
                        }
                        Ok(tag as u32)
                    })
                    .collect::<Result<Vec<u32>>>()?;
                Ok(RawCell {
                    gid: cell.gid,
                    accumulated_offset: relative / 4,
                    section_tags,
                })
            })
            .collect::<Result<Vec<RawCell>>>()
    })?;

    CompartmentIndex::from_section_tags(raw, header.compartment_count, &pool, name)
}

impl ReportBackend for BinaryBackend {
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
        self.check_frames(frames)?;
        let runs: Vec<CellRun> = mapping.runs().collect();
        let row_size = mapping.frame_size();
        let mut batch = FrameBatch {
            timestamps: frames.iter().map(|&frame| self.axis.timestamp(frame)).collect(),
            data: vec![0.0; row_size * frames.len()],
            frame_size: row_size,
        };
        let plan = ReadPlan {
            runs: &runs,
            row_size,
            whole_frame: mapping.is_identity(),
            frames,
        };
        self.source.read(&self.layout, &plan, &mut batch.data, &self.path)?;
        Ok(batch)
    }

    fn load_neuron(&self, mapping: &ViewMapping, gid: Gid) -> Result<FrameBatch> {
        let run = neuron_run(mapping, gid)?;
        let frames: Vec<usize> = (0..self.axis.frame_count()).collect();
        let mut batch = FrameBatch {
            timestamps: frames.iter().map(|&frame| self.axis.timestamp(frame)).collect(),
            data: vec![0.0; run.len * frames.len()],
            frame_size: run.len,
        };
        let plan = ReadPlan {
            runs: std::slice::from_ref(&run),
            row_size: run.len,
            whole_frame: false,
            frames: &frames,
        };
        self.source.read(&self.layout, &plan, &mut batch.data, &self.path)?;
        Ok(batch)
    }
}

/// Write side of a binary report: every operation is unsupported.
#[derive(Debug)]
pub struct BinarySink {
    path: PathBuf,
}

impl BinarySink {
    pub fn new(path: &Path) -> Self {
        Self { path: path.to_path_buf() }
    }

    fn unsupported(&self, operation: &'static str) -> ReportError {
        warn!(report = %self.path.display(), operation, "Binary reports are read-only");
        ReportError::NotImplemented { backend: "binary", operation }
    }
}

impl ReportSink for BinarySink {
    fn write_header(&mut self, _metadata: &ReportMetadata) -> Result<()> {
        Err(self.unsupported("write_header"))
    }

    fn write_compartments(&mut self, _gid: Gid, _counts: &[u16]) -> Result<()> {
        Err(self.unsupported("write_compartments"))
    }

    fn write_frame(&mut self, _gid: Gid, _values: &[f32], _timestamp: f64) -> Result<()> {
        Err(self.unsupported("write_frame"))
    }

    fn flush(&mut self) -> Result<()> {
        Err(self.unsupported("flush"))
    }

    fn erase(&mut self) -> Result<()> {
        Err(self.unsupported("erase"))
    }
}
