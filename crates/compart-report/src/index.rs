//! Compartment index — where each cell's sections live inside a frame
//!
//! The full-population [`CompartmentIndex`] is built once per report and then
//! only read. Views ask it for a [`ViewMapping`]: the same tables re-packed so
//! the selected cells sit back to back from offset 0.
//!
//! Offsets are absolute positions inside a frame buffer. A section without
//! compartments keeps [`UNDEFINED_OFFSET`] and a count of 0.

use hashbrown::HashMap;
use rayon::prelude::*;
use rayon::ThreadPool;
use tracing::{debug, warn};

use crate::error::{ReportError, ReportWarning, Result};
use crate::types::{Gid, GidSet, UNDEFINED_OFFSET};

/// One cell of the full population.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellRecord {
    pub gid: Gid,
    pub compartment_count: usize,
    /// Position of the cell's first compartment in the full frame
    pub accumulated_offset: u64,
}

/// Raw mapping input: one section id per compartment, in frame order.
#[derive(Debug, Clone)]
pub struct RawCell {
    pub gid: Gid,
    pub accumulated_offset: u64,
    pub section_tags: Vec<u32>,
}

/// Section tables of one cell.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CellSections {
    offsets: Vec<u64>,
    counts: Vec<u16>,
}

/// Collapse a tag sequence into per-section offset and count tables.
///
/// Runs of equal tags become one section; runs are visited in section order
/// because simulators interleave sections freely. A section must be one
/// contiguous run, otherwise its range would overlap its neighbours.
fn sections_from_tags(cell: &RawCell, source: &str) -> Result<CellSections> {
    let mut runs: Vec<(u32, u64, usize)> = Vec::new();
    for (position, &tag) in cell.section_tags.iter().enumerate() {
        match runs.last_mut() {
            Some((section, _, len)) if *section == tag => *len += 1,
            _ => runs.push((tag, position as u64, 1)),
        }
    }
    runs.sort_by_key(|&(section, start, _)| (section, start));
    if let Some(pair) = runs.windows(2).find(|pair| pair[0].0 == pair[1].0) {
        return Err(ReportError::corrupt(
            source,
            format!(
                "cell {} section {} is split at compartments {} and {}",
                cell.gid, pair[0].0, pair[0].1, pair[1].1
            ),
        ));
    }

    let sections = runs.last().map(|&(section, _, _)| section as usize + 1).unwrap_or(0);
    let mut offsets = vec![UNDEFINED_OFFSET; sections];
    let mut counts = vec![0u16; sections];
    for (section, start, len) in runs {
        let section = section as usize;
        offsets[section] = cell.accumulated_offset + start;
        counts[section] = u16::try_from(len).map_err(|_| {
            ReportError::corrupt(
                source,
                format!("cell {} section {} has more than {} compartments", cell.gid, section, u16::MAX),
            )
        })?;
    }
    Ok(CellSections { offsets, counts })
}

/// Immutable full-population mapping.
#[derive(Debug, Clone)]
pub struct CompartmentIndex {
    cells: Vec<CellRecord>,
    sections: Vec<CellSections>,
    positions: HashMap<Gid, usize>,
    frame_size: usize,
}

impl CompartmentIndex {
    /// Build from per-compartment section tags, decoding cells on `pool`.
    ///
    /// `frame_size` is the width of a full stored frame; cell offsets must
    /// fall inside it.
    pub fn from_section_tags(
        mut raw: Vec<RawCell>,
        frame_size: usize,
        pool: &ThreadPool,
        source: &str,
    ) -> Result<Self> {
        raw.sort_by_key(|cell| cell.gid);
        for pair in raw.windows(2) {
            if pair[0].gid == pair[1].gid {
                return Err(ReportError::corrupt(source, format!("duplicate gid {}", pair[0].gid)));
            }
        }
        for cell in &raw {
            let end = cell.accumulated_offset + cell.section_tags.len() as u64;
            if end > frame_size as u64 {
                return Err(ReportError::corrupt(
                    source,
                    format!("cell {} ends at compartment {} beyond frame of {}", cell.gid, end, frame_size),
                ));
            }
        }

        let sections = pool.install(|| {
            raw.par_iter()
                .map(|cell| sections_from_tags(cell, source))
                .collect::<Result<Vec<_>>>()
        })?;

        let cells = raw
            .iter()
            .map(|cell| CellRecord {
                gid: cell.gid,
                compartment_count: cell.section_tags.len(),
                accumulated_offset: cell.accumulated_offset,
            })
            .collect();
        debug!(cells = raw.len(), frame_size, "Built compartment index");
        Ok(Self::assemble(cells, sections, frame_size))
    }

    /// Build from per-section counts, laying cells out back to back in GID order.
    pub fn from_counts(mut counts: Vec<(Gid, Vec<u16>)>) -> Self {
        counts.sort_by_key(|(gid, _)| *gid);
        counts.dedup_by_key(|(gid, _)| *gid);

        let mut cells = Vec::with_capacity(counts.len());
        let mut sections = Vec::with_capacity(counts.len());
        let mut running = 0u64;
        for (gid, section_counts) in counts {
            let start = running;
            let offsets = section_counts
                .iter()
                .map(|&count| {
                    if count == 0 {
                        UNDEFINED_OFFSET
                    } else {
                        let offset = running;
                        running += u64::from(count);
                        offset
                    }
                })
                .collect();
            cells.push(CellRecord {
                gid,
                compartment_count: (running - start) as usize,
                accumulated_offset: start,
            });
            sections.push(CellSections { offsets, counts: section_counts });
        }
        Self::assemble(cells, sections, running as usize)
    }

    fn assemble(cells: Vec<CellRecord>, sections: Vec<CellSections>, frame_size: usize) -> Self {
        let positions = cells.iter().enumerate().map(|(i, cell)| (cell.gid, i)).collect();
        Self { cells, sections, positions, frame_size }
    }

    /// The same index holding only the cells of `requested` (all when empty).
    ///
    /// Offsets stay those of the stored frame. Requested cells the index does
    /// not know are reported as [`ReportWarning::MissingMapping`]; if none
    /// are known the call fails with `MissingMapping`.
    pub fn restrict(&self, requested: &GidSet) -> Result<(Self, Option<ReportWarning>)> {
        if requested.is_empty() {
            return Ok((self.clone(), None));
        }
        let mut cells = Vec::with_capacity(requested.len());
        let mut sections = Vec::with_capacity(requested.len());
        let mut missing = Vec::new();
        for gid in requested {
            match self.positions.get(gid) {
                Some(&i) => {
                    cells.push(self.cells[i]);
                    sections.push(self.sections[i].clone());
                }
                None => missing.push(*gid),
            }
        }
        if cells.is_empty() {
            return Err(ReportError::MissingMapping { missing: missing.len(), requested: requested.len() });
        }
        let warning = (!missing.is_empty()).then(|| {
            warn!(requested = requested.len(), missing = missing.len(), "Requested cells have no mapping");
            ReportWarning::MissingMapping { requested: requested.len(), missing }
        });
        Ok((Self::assemble(cells, sections, self.frame_size), warning))
    }

    /// All GIDs of the report.
    pub fn gids(&self) -> GidSet {
        self.cells.iter().map(|cell| cell.gid).collect()
    }

    /// Cells in GID order.
    pub fn cells(&self) -> &[CellRecord] {
        &self.cells
    }

    pub fn cell(&self, gid: Gid) -> Option<&CellRecord> {
        self.positions.get(&gid).map(|&i| &self.cells[i])
    }

    /// Per-section counts of `gid`.
    pub fn section_counts(&self, gid: Gid) -> Option<&[u16]> {
        self.positions.get(&gid).map(|&i| self.sections[i].counts.as_slice())
    }

    /// Values in one full stored frame.
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Re-pack the index for `subset` (empty means every cell).
    ///
    /// GIDs not in the report are dropped with a [`ReportWarning::PartialGids`];
    /// if none remain the call fails with `GidsOutOfRange`.
    pub fn repack(&self, subset: &GidSet) -> Result<(ViewMapping, Option<ReportWarning>)> {
        let (kept, warning): (Vec<usize>, _) = if subset.is_empty() {
            ((0..self.cells.len()).collect(), None)
        } else {
            let mut kept = Vec::with_capacity(subset.len());
            let mut missing = Vec::new();
            for gid in subset {
                match self.positions.get(gid) {
                    Some(&i) => kept.push(i),
                    None => missing.push(*gid),
                }
            }
            if kept.is_empty() {
                return Err(ReportError::GidsOutOfRange { requested: subset.len() });
            }
            let warning = (!missing.is_empty()).then(|| {
                warn!(requested = subset.len(), missing = missing.len(), "Requested GIDs not in report");
                ReportWarning::PartialGids { requested: subset.len(), missing }
            });
            (kept, warning)
        };

        let mut mapping = ViewMapping::with_capacity(kept.len());
        let mut running = 0u64;
        for i in kept {
            let cell = &self.cells[i];
            let sections = &self.sections[i];
            let offsets = sections
                .offsets
                .iter()
                .map(|&offset| {
                    if offset == UNDEFINED_OFFSET {
                        UNDEFINED_OFFSET
                    } else {
                        offset - cell.accumulated_offset + running
                    }
                })
                .collect();
            mapping.gids.push(cell.gid);
            mapping.offsets.push(offsets);
            mapping.counts.push(sections.counts.clone());
            mapping.cell_sizes.push(cell.compartment_count);
            mapping.source_starts.push(cell.accumulated_offset);
            mapping.target_starts.push(running as usize);
            running += cell.compartment_count as u64;
        }
        mapping.frame_size = running as usize;
        mapping.identity = mapping.frame_size == self.frame_size
            && mapping
                .source_starts
                .iter()
                .zip(&mapping.target_starts)
                .all(|(&source, &target)| source == target as u64);
        Ok((mapping, warning))
    }
}

/// Index tables of one view, contiguous from offset 0.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewMapping {
    gids: Vec<Gid>,
    offsets: Vec<Vec<u64>>,
    counts: Vec<Vec<u16>>,
    cell_sizes: Vec<usize>,
    source_starts: Vec<u64>,
    target_starts: Vec<usize>,
    frame_size: usize,
    identity: bool,
}

/// A cell's block: where it is stored and where it goes in a view frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellRun {
    pub gid: Gid,
    /// First compartment in the stored frame
    pub source: u64,
    /// First compartment in the view frame
    pub target: usize,
    pub len: usize,
}

impl ViewMapping {
    fn with_capacity(cells: usize) -> Self {
        Self {
            gids: Vec::with_capacity(cells),
            offsets: Vec::with_capacity(cells),
            counts: Vec::with_capacity(cells),
            cell_sizes: Vec::with_capacity(cells),
            source_starts: Vec::with_capacity(cells),
            target_starts: Vec::with_capacity(cells),
            frame_size: 0,
            identity: false,
        }
    }

    /// GIDs of the view, ascending.
    pub fn gids(&self) -> &[Gid] {
        &self.gids
    }

    /// Per-cell section offsets inside a view frame.
    pub fn offsets(&self) -> &[Vec<u64>] {
        &self.offsets
    }

    /// Per-cell section compartment counts.
    pub fn counts(&self) -> &[Vec<u16>] {
        &self.counts
    }

    /// Compartments of the `i`-th cell.
    pub fn num_compartments(&self, i: usize) -> usize {
        self.cell_sizes[i]
    }

    /// Values in one view frame.
    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// True when a view frame is byte-for-byte the stored frame.
    pub fn is_identity(&self) -> bool {
        self.identity
    }

    /// Position of `gid` in the view.
    pub fn position(&self, gid: Gid) -> Option<usize> {
        self.gids.binary_search(&gid).ok()
    }

    /// Cell blocks in view order.
    pub fn runs(&self) -> impl Iterator<Item = CellRun> + '_ {
        (0..self.gids.len()).map(move |i| CellRun {
            gid: self.gids[i],
            source: self.source_starts[i],
            target: self.target_starts[i],
            len: self.cell_sizes[i],
        })
    }

    /// The block of `gid`.
    pub fn run(&self, gid: Gid) -> Option<CellRun> {
        self.position(gid).map(|i| CellRun {
            gid,
            source: self.source_starts[i],
            target: self.target_starts[i],
            len: self.cell_sizes[i],
        })
    }

    /// `(gid, section)` owning each value of a view frame.
    pub fn index(&self) -> Vec<(Gid, u32)> {
        let mut index = vec![(0, 0); self.frame_size];
        for (i, &gid) in self.gids.iter().enumerate() {
            for (section, (&offset, &count)) in self.offsets[i].iter().zip(&self.counts[i]).enumerate() {
                if offset == UNDEFINED_OFFSET {
                    continue;
                }
                let start = offset as usize;
                let end = (start + usize::from(count)).min(self.frame_size);
                for slot in &mut index[start..end] {
                    *slot = (gid, section as u32);
                }
            }
        }
        index
    }
}
