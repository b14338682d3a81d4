//! Value types shared by every backend

use std::collections::BTreeSet;

/// Cell identifier
pub type Gid = u32;

/// Ordered set of cell identifiers
pub type GidSet = BTreeSet<Gid>;

/// Section offset sentinel for sections without compartments
pub const UNDEFINED_OFFSET: u64 = u64::MAX;

/// How a writer treats a report that already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessMode {
    /// Fail with `AlreadyExists`
    #[default]
    Write,
    /// Erase the existing report first
    Overwrite,
}

/// Report-wide metadata as stored in the header.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportMetadata {
    /// Time of the first frame
    pub start_time: f64,
    /// Time of the last frame
    pub end_time: f64,
    /// Distance between frames
    pub time_step: f64,
    /// Unit of the time fields, e.g. `ms`
    pub time_unit: String,
    /// Unit of the frame values, e.g. `mV`
    pub data_unit: String,
    /// Number of cells in the report
    pub cell_count: usize,
    /// Number of frames
    pub frame_count: usize,
    /// Values per full frame
    pub compartment_count: usize,
}

impl ReportMetadata {
    /// Metadata for a report being written; counts are filled as cells are added.
    pub fn new(start_time: f64, end_time: f64, time_step: f64) -> Self {
        Self {
            start_time,
            end_time,
            time_step,
            time_unit: "ms".to_string(),
            data_unit: "mV".to_string(),
            cell_count: 0,
            frame_count: crate::time::TimeAxis::frame_count_for(start_time, end_time, time_step),
            compartment_count: 0,
        }
    }

    /// Set the units, builder style.
    pub fn with_units(mut self, data_unit: impl Into<String>, time_unit: impl Into<String>) -> Self {
        self.data_unit = data_unit.into();
        self.time_unit = time_unit.into();
        self
    }
}

/// One time sample of a view.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Time of the sample
    pub timestamp: f64,
    /// One value per compartment, in view order
    pub data: Vec<f32>,
}

/// Consecutive frames in one contiguous buffer.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FrameBatch {
    /// Timestamps, ascending
    pub timestamps: Vec<f64>,
    /// `timestamps.len() * frame_size` values, frame after frame
    pub data: Vec<f32>,
    /// Values per frame
    pub frame_size: usize,
}

impl FrameBatch {
    /// Empty batch for frames of `frame_size` values.
    pub fn with_capacity(frame_size: usize, frames: usize) -> Self {
        Self {
            timestamps: Vec::with_capacity(frames),
            data: Vec::with_capacity(frame_size * frames),
            frame_size,
        }
    }

    /// Append one frame. `values` must hold exactly `frame_size` values.
    pub fn push(&mut self, timestamp: f64, values: &[f32]) {
        debug_assert_eq!(values.len(), self.frame_size);
        self.timestamps.push(timestamp);
        self.data.extend_from_slice(values);
    }

    /// Values of frame `i`.
    pub fn frame(&self, i: usize) -> &[f32] {
        &self.data[i * self.frame_size..(i + 1) * self.frame_size]
    }

    /// Number of frames.
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    /// Returns true if the batch holds no frames.
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Iterate frames as `(timestamp, values)`.
    pub fn iter(&self) -> impl Iterator<Item = (f64, &[f32])> {
        self.timestamps.iter().copied().enumerate().map(move |(i, t)| (t, self.frame(i)))
    }
}
