//! `null://` — a sink that accepts and discards everything.
//!
//! Useful for timing a producer without storage in the way. It keeps
//! counters so callers can check what would have been written.

use tracing::debug;

use crate::backend::{check_header, ReportSink};
use crate::error::Result;
use crate::types::{Gid, ReportMetadata};

#[derive(Debug, Default)]
pub struct NullSink {
    cells: usize,
    frames: usize,
    values: usize,
}

impl NullSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cells registered with `write_compartments`.
    pub fn cells_written(&self) -> usize {
        self.cells
    }

    /// Calls to `write_frame`.
    pub fn frames_written(&self) -> usize {
        self.frames
    }

    /// Values passed to `write_frame`.
    pub fn values_written(&self) -> usize {
        self.values
    }
}

impl ReportSink for NullSink {
    fn write_header(&mut self, metadata: &ReportMetadata) -> Result<()> {
        check_header(metadata)
    }

    fn write_compartments(&mut self, _gid: Gid, _counts: &[u16]) -> Result<()> {
        self.cells += 1;
        Ok(())
    }

    fn write_frame(&mut self, _gid: Gid, values: &[f32], _timestamp: f64) -> Result<()> {
        self.frames += 1;
        self.values += values.len();
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        debug!(frames = self.frames, values = self.values, "Null sink flushed");
        Ok(())
    }

    fn erase(&mut self) -> Result<()> {
        *self = Self::default();
        Ok(())
    }
}
