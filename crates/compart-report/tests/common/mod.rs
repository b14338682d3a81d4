//! Synthetic binary reports.
//!
//! The binary backend is read-only, so tests lay files out by hand. Frame
//! `f` stores `f * 1000 + c` at canonical compartment `c`, which makes every
//! value identify its own position.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Once;

use compart_report::backend::binary::{CELL_INFO_LENGTH, HEADER_LENGTH, IDENTIFIER};
use compart_report::{Gid, TimeAxis};
use tempfile::TempDir;

/// Route engine logs to the test harness; `RUST_LOG` overrides the level.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// One cell: gid and compartments per section id `0..n`.
#[derive(Debug, Clone)]
pub struct SyntheticCell {
    pub gid: Gid,
    pub sections: Vec<u16>,
    /// Order the sections are laid out in; ascending when empty
    pub layout: Vec<usize>,
}

impl SyntheticCell {
    pub fn new(gid: Gid, sections: &[u16]) -> Self {
        Self { gid, sections: sections.to_vec(), layout: Vec::new() }
    }

    /// A cell whose sections are stored in `layout` order.
    pub fn interleaved(gid: Gid, sections: &[u16], layout: &[usize]) -> Self {
        Self { gid, sections: sections.to_vec(), layout: layout.to_vec() }
    }

    fn layout(&self) -> Vec<usize> {
        if self.layout.is_empty() {
            (0..self.sections.len()).collect()
        } else {
            self.layout.clone()
        }
    }

    pub fn compartments(&self) -> usize {
        self.sections.iter().map(|&c| usize::from(c)).sum()
    }
}

#[derive(Debug, Clone)]
pub struct SyntheticReport {
    pub start: f64,
    pub end: f64,
    pub step: f64,
    /// Cells in file order
    pub cells: Vec<SyntheticCell>,
    /// Frames actually written; the header always claims the full count
    pub stored_frames: Option<usize>,
}

impl SyntheticReport {
    pub fn new(start: f64, end: f64, step: f64, cells: Vec<SyntheticCell>) -> Self {
        Self { start, end, step, cells, stored_frames: None }
    }

    pub fn frame_count(&self) -> usize {
        TimeAxis::frame_count_for(self.start, self.end, self.step)
    }

    pub fn frame_size(&self) -> usize {
        self.cells.iter().map(SyntheticCell::compartments).sum()
    }

    /// Canonical position of the first compartment of `gid`.
    pub fn cell_start(&self, gid: Gid) -> usize {
        let mut start = 0;
        for cell in &self.cells {
            if cell.gid == gid {
                return start;
            }
            start += cell.compartments();
        }
        panic!("gid {} not in report", gid);
    }

    /// Values a view over `gids` (ascending) holds for `frame`.
    pub fn expected(&self, gids: &[Gid], frame: usize) -> Vec<f32> {
        let mut values = Vec::new();
        for &gid in gids {
            let cell = self.cells.iter().find(|c| c.gid == gid).unwrap();
            let start = self.cell_start(gid);
            values.extend((start..start + cell.compartments()).map(|c| value(frame, c)));
        }
        values
    }

    /// Write the report to `path` in native or foreign byte order.
    pub fn write(&self, path: &Path, swapped: bool) {
        let mut out = Writer { buf: vec![0u8; HEADER_LENGTH], swapped };
        let frame_size = self.frame_size();
        let frames = self.frame_count();

        out.f64_at(0, IDENTIFIER);
        out.i32_at(8, HEADER_LENGTH as i32);
        out.str_at(16, "1.0.0");
        out.str_at(32, "synthetic");
        out.i32_at(48, self.cells.len() as i32);
        out.i32_at(52, frame_size as i32);
        out.i32_at(64, frames as i32);
        out.f64_at(72, self.start);
        out.f64_at(80, self.end);
        out.f64_at(88, self.step);
        out.str_at(96, "mV");
        out.str_at(112, "ms");
        out.i32_at(128, 1);
        out.str_at(144, "section");
        out.str_at(176, "");
        out.str_at(192, "soma");

        let table_end = HEADER_LENGTH + self.cells.len() * CELL_INFO_LENGTH;
        let mapping_start = table_end;
        let data_start = mapping_start + frame_size * 4;
        out.buf.resize(data_start, 0);

        let mut accumulated = 0;
        for (i, cell) in self.cells.iter().enumerate() {
            let base = HEADER_LENGTH + i * CELL_INFO_LENGTH;
            out.i32_at(base, cell.gid as i32);
            out.i32_at(base + 8, cell.compartments() as i32);
            out.u64_at(base + 16, (data_start + accumulated * 4) as u64);
            out.u64_at(base + 24, 0);
            out.u64_at(base + 32, (mapping_start + accumulated * 4) as u64);

            let mut position = mapping_start + accumulated * 4;
            for section in cell.layout() {
                for _ in 0..cell.sections[section] {
                    out.f32_at(position, section as f32);
                    position += 4;
                }
            }
            accumulated += cell.compartments();
        }

        let stored = self.stored_frames.unwrap_or(frames);
        for frame in 0..stored {
            for c in 0..frame_size {
                out.push_f32(value(frame, c));
            }
        }
        std::fs::write(path, out.buf).unwrap();
    }

    /// Write into a fresh temporary directory, returning the file path.
    pub fn write_temp(&self, swapped: bool) -> (TempDir, PathBuf) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("report.bbp");
        self.write(&path, swapped);
        (dir, path)
    }
}

pub fn value(frame: usize, compartment: usize) -> f32 {
    frame as f32 * 1000.0 + compartment as f32
}

/// Two-cell layout shared by several tests: cells 394 and 400 among others.
pub fn circuit(start: f64, end: f64, step: f64) -> SyntheticReport {
    SyntheticReport::new(
        start,
        end,
        step,
        vec![
            SyntheticCell::new(1, &[1, 3, 2]),
            SyntheticCell::new(394, &[1, 4]),
            SyntheticCell::new(400, &[2, 0, 5]),
            SyntheticCell::new(512, &[1]),
        ],
    )
}

struct Writer {
    buf: Vec<u8>,
    swapped: bool,
}

impl Writer {
    fn bytes_at<const N: usize>(&mut self, offset: usize, mut bytes: [u8; N]) {
        if self.swapped {
            bytes.reverse();
        }
        self.buf[offset..offset + N].copy_from_slice(&bytes);
    }

    fn f64_at(&mut self, offset: usize, v: f64) {
        self.bytes_at(offset, v.to_ne_bytes());
    }

    fn f32_at(&mut self, offset: usize, v: f32) {
        self.bytes_at(offset, v.to_ne_bytes());
    }

    fn i32_at(&mut self, offset: usize, v: i32) {
        self.bytes_at(offset, v.to_ne_bytes());
    }

    fn u64_at(&mut self, offset: usize, v: u64) {
        self.bytes_at(offset, v.to_ne_bytes());
    }

    fn str_at(&mut self, offset: usize, s: &str) {
        self.buf[offset..offset + s.len()].copy_from_slice(s.as_bytes());
    }

    fn push_f32(&mut self, v: f32) {
        let mut bytes = v.to_ne_bytes();
        if self.swapped {
            bytes.reverse();
        }
        self.buf.extend_from_slice(&bytes);
    }
}
