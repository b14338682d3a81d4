//! Frame data access for binary reports
//!
//! Two strategies fill the same destination layout: a memory-mapped copy and
//! batched positional reads. Both read, per frame, either the whole stored
//! frame (identity views) or one run per cell, and byte-swap while decoding
//! when the file was written with the other byte order.

use std::path::Path;

use memmap2::Mmap;

use crate::backend::aio::{BatchedReader, ReadRequest};
use crate::bytes::decode_f32s;
use crate::config::ReadStrategy;
use crate::error::{ReportError, Result};
use crate::index::CellRun;

/// Where frames live inside the file.
#[derive(Debug, Clone, Copy)]
pub struct FrameLayout {
    /// Offset of frame 0
    pub data_offset: u64,
    /// Values per stored frame
    pub frame_size: usize,
    pub swapped: bool,
}

impl FrameLayout {
    fn value_offset(&self, frame: usize, compartment: u64) -> u64 {
        self.data_offset + (frame as u64 * self.frame_size as u64 + compartment) * 4
    }
}

/// What a read fills: `runs` of every frame in `frames`, rows of `row_size`.
///
/// Runs must tile `[0, row_size)` in order.
pub struct ReadPlan<'a> {
    pub runs: &'a [CellRun],
    pub row_size: usize,
    pub whole_frame: bool,
    pub frames: &'a [usize],
}

/// Backing store for frame reads.
pub enum FrameSource {
    Mapped(Mmap),
    Batched(Box<dyn BatchedReader>),
}

impl FrameSource {
    pub fn strategy(&self) -> ReadStrategy {
        match self {
            FrameSource::Mapped(_) => ReadStrategy::MemoryMapped,
            FrameSource::Batched(_) => ReadStrategy::Batched,
        }
    }

    /// Fill `out` (`plan.frames.len() * plan.row_size` values) from the file.
    pub fn read(&self, layout: &FrameLayout, plan: &ReadPlan<'_>, out: &mut [f32], path: &Path) -> Result<()> {
        debug_assert_eq!(out.len(), plan.frames.len() * plan.row_size);
        debug_assert_eq!(plan.runs.iter().map(|r| r.len).sum::<usize>(), plan.row_size);
        if plan.row_size == 0 {
            return Ok(());
        }
        match self {
            FrameSource::Mapped(mmap) => read_mapped(mmap, layout, plan, out, path),
            FrameSource::Batched(reader) => read_batched(reader.as_ref(), layout, plan, out),
        }
    }
}

fn mapped_slice<'m>(mmap: &'m Mmap, offset: u64, values: usize, path: &Path) -> Result<&'m [u8]> {
    usize::try_from(offset)
        .ok()
        .and_then(|start| mmap.get(start..start.checked_add(values * 4)?))
        .ok_or_else(|| ReportError::Io {
            path: Some(path.to_path_buf()),
            kind: std::io::ErrorKind::UnexpectedEof,
            message: format!("{} values at offset {} lie beyond the end of the file", values, offset),
        })
}

fn read_mapped(mmap: &Mmap, layout: &FrameLayout, plan: &ReadPlan<'_>, out: &mut [f32], path: &Path) -> Result<()> {
    for (row, &frame) in out.chunks_mut(plan.row_size).zip(plan.frames) {
        if plan.whole_frame {
            let bytes = mapped_slice(mmap, layout.value_offset(frame, 0), plan.row_size, path)?;
            decode_f32s(bytes, layout.swapped, row);
            continue;
        }
        for run in plan.runs.iter().filter(|run| run.len > 0) {
            let bytes = mapped_slice(mmap, layout.value_offset(frame, run.source), run.len, path)?;
            decode_f32s(bytes, layout.swapped, &mut row[run.target..run.target + run.len]);
        }
    }
    Ok(())
}

fn read_batched(reader: &dyn BatchedReader, layout: &FrameLayout, plan: &ReadPlan<'_>, out: &mut [f32]) -> Result<()> {
    // runs tile each row in order, so the staged bytes line up with `out`
    let mut staging = vec![0u8; out.len() * 4];
    {
        let per_frame = if plan.whole_frame { 1 } else { plan.runs.len() };
        let mut requests = Vec::with_capacity(plan.frames.len() * per_frame);
        for (row, &frame) in staging.chunks_mut(plan.row_size * 4).zip(plan.frames) {
            if plan.whole_frame {
                requests.push(ReadRequest {
                    offset: layout.value_offset(frame, 0),
                    buffer: row,
                });
                continue;
            }
            let mut rest = row;
            for run in plan.runs {
                let (head, tail) = std::mem::take(&mut rest).split_at_mut(run.len * 4);
                rest = tail;
                if run.len > 0 {
                    requests.push(ReadRequest {
                        offset: layout.value_offset(frame, run.source),
                        buffer: head,
                    });
                }
            }
        }
        reader.read_all(&mut requests)?;
    }
    decode_f32s(&staging, layout.swapped, out);
    Ok(())
}
