//! `dummy://` — a synthetic read source for benchmarking readers.
//!
//! `dummy://[?size=<cells>][&randomValues]` serves `size` cells (1024 by
//! default) of 256 compartments each over 1025 frames. The population and its
//! section layout are drawn from an RNG seeded with the cell count, so the
//! same URI always describes the same report. Frame values are zero unless
//! `randomValues` is set, in which case frame `f` is drawn from an RNG seeded
//! with `f`.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

use crate::backend::{neuron_run, ReportBackend};
use crate::error::{ReportError, ReportWarning, Result};
use crate::index::{CellRun, CompartmentIndex, ViewMapping};
use crate::time::TimeAxis;
use crate::types::{FrameBatch, Gid, GidSet, ReportMetadata};

/// Cells served when the URI gives no size
pub const DEFAULT_CELLS: usize = 1024;
/// Compartments of every synthetic cell
pub const CELL_COMPARTMENTS: usize = 256;

const MAX_SECTION_COMPARTMENTS: u16 = 31;
const END_TIME: f64 = 1024.0;

/// Section counts summing to exactly [`CELL_COMPARTMENTS`].
fn cell_sections(rng: &mut StdRng) -> Vec<u16> {
    let mut counts = Vec::new();
    let mut total = 0;
    while total < CELL_COMPARTMENTS {
        let count = rng.gen_range(1..=MAX_SECTION_COMPARTMENTS);
        counts.push(count);
        total += usize::from(count);
    }
    if let Some(last) = counts.last_mut() {
        *last -= (total - CELL_COMPARTMENTS) as u16;
    }
    counts
}

/// Reproducible population of `cells` cells.
fn population(cells: usize) -> Vec<(Gid, Vec<u16>)> {
    let mut rng = StdRng::seed_from_u64(cells as u64);
    let mut gids = GidSet::new();
    while gids.len() < cells {
        gids.insert(rng.gen());
    }
    gids.into_iter().map(|gid| (gid, cell_sections(&mut rng))).collect()
}

pub struct DummyBackend {
    metadata: ReportMetadata,
    axis: TimeAxis,
    index: Arc<CompartmentIndex>,
    random_values: bool,
    warnings: Vec<ReportWarning>,
}

impl DummyBackend {
    pub fn open(cells: usize, random_values: bool, requested: &GidSet) -> Result<Self> {
        if cells == 0 {
            return Err(ReportError::InvalidArgument("dummy report needs at least one cell".into()));
        }
        let full = CompartmentIndex::from_counts(population(cells));
        let (index, warning) = full.restrict(requested)?;
        let axis = TimeAxis::new(0.0, END_TIME, 1.0);
        let metadata = ReportMetadata {
            start_time: axis.start(),
            end_time: axis.end(),
            time_step: axis.step(),
            time_unit: "lightmilliseconds".to_string(),
            data_unit: "unobtanium".to_string(),
            cell_count: index.len(),
            frame_count: axis.frame_count(),
            compartment_count: index.len() * CELL_COMPARTMENTS,
        };
        info!(cells = metadata.cell_count, random_values, "Opened dummy report");
        Ok(Self {
            metadata,
            axis,
            index: Arc::new(index),
            random_values,
            warnings: warning.into_iter().collect(),
        })
    }

    /// Fill one row with the values of `runs` for `frame`.
    fn fill_row(&self, runs: &[CellRun], frame: usize, row: &mut [f32]) {
        if !self.random_values {
            return;
        }
        let mut rng = StdRng::seed_from_u64(frame as u64);
        let stored: Vec<f32> = (0..self.index.frame_size())
            .map(|_| f32::from(rng.gen::<i16>()) / 1000.0)
            .collect();
        for run in runs {
            let source = run.source as usize;
            row[run.target..run.target + run.len].copy_from_slice(&stored[source..source + run.len]);
        }
    }

    fn gather(&self, runs: &[CellRun], row_size: usize, frames: &[usize]) -> FrameBatch {
        let mut batch = FrameBatch {
            timestamps: frames.iter().map(|&frame| self.axis.timestamp(frame)).collect(),
            data: vec![0.0; row_size * frames.len()],
            frame_size: row_size,
        };
        if row_size > 0 {
            for (row, &frame) in batch.data.chunks_exact_mut(row_size).zip(frames) {
                self.fill_row(runs, frame, row);
            }
        }
        batch
    }
}

impl ReportBackend for DummyBackend {
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
        Ok(self.gather(&runs, mapping.frame_size(), frames))
    }

    fn load_neuron(&self, mapping: &ViewMapping, gid: Gid) -> Result<FrameBatch> {
        let run = neuron_run(mapping, gid)?;
        let frames: Vec<usize> = (0..self.axis.frame_count()).collect();
        Ok(self.gather(std::slice::from_ref(&run), run.len, &frames))
    }
}
