//! Storage backends
//!
//! The set of backends is closed: [`Backend`] is what a report reads from,
//! [`Sink`] is what a writer writes to. Both dispatch through the
//! [`ReportBackend`] / [`ReportSink`] traits.

pub mod aio;
pub mod binary;
pub mod dummy;
pub mod kv;
pub mod null;

use std::sync::Arc;

use crate::error::{ReportError, ReportWarning, Result};
use crate::index::{CellRun, CompartmentIndex, ViewMapping};
use crate::time::TimeAxis;
use crate::types::{FrameBatch, Gid, ReportMetadata};

use binary::{BinaryBackend, BinarySink};
use dummy::DummyBackend;
use kv::{KvBackend, KvWriter};
use null::NullSink;

/// Read operations every backend provides.
pub trait ReportBackend: Send + Sync {
    fn metadata(&self) -> &ReportMetadata;

    fn time_axis(&self) -> &TimeAxis;

    /// Full-population index, built at open.
    fn index(&self) -> &Arc<CompartmentIndex>;

    /// Conditions noticed while opening.
    fn warnings(&self) -> &[ReportWarning];

    /// The given frames of `mapping`, in the given order.
    fn load_frames(&self, mapping: &ViewMapping, frames: &[usize]) -> Result<FrameBatch>;

    /// Every frame of one cell of `mapping`.
    fn load_neuron(&self, mapping: &ViewMapping, gid: Gid) -> Result<FrameBatch>;
}

/// Write operations; called from a single thread.
pub trait ReportSink: Send {
    fn write_header(&mut self, metadata: &ReportMetadata) -> Result<()>;

    /// Register `gid` with its per-section compartment counts.
    fn write_compartments(&mut self, gid: Gid, counts: &[u16]) -> Result<()>;

    /// Store the values of `gid` for the frame containing `timestamp`.
    fn write_frame(&mut self, gid: Gid, values: &[f32], timestamp: f64) -> Result<()>;

    fn flush(&mut self) -> Result<()>;

    /// Remove everything written to this report.
    fn erase(&mut self) -> Result<()>;
}

/// Readable backends.
pub enum Backend {
    Binary(BinaryBackend),
    KeyValue(KvBackend),
    Dummy(DummyBackend),
}

impl Backend {
    pub fn name(&self) -> &'static str {
        match self {
            Backend::Binary(_) => "binary",
            Backend::KeyValue(_) => "kv",
            Backend::Dummy(_) => "dummy",
        }
    }

    fn inner(&self) -> &dyn ReportBackend {
        match self {
            Backend::Binary(backend) => backend,
            Backend::KeyValue(backend) => backend,
            Backend::Dummy(backend) => backend,
        }
    }
}

impl ReportBackend for Backend {
    fn metadata(&self) -> &ReportMetadata {
        self.inner().metadata()
    }

    fn time_axis(&self) -> &TimeAxis {
        self.inner().time_axis()
    }

    fn index(&self) -> &Arc<CompartmentIndex> {
        self.inner().index()
    }

    fn warnings(&self) -> &[ReportWarning] {
        self.inner().warnings()
    }

    fn load_frames(&self, mapping: &ViewMapping, frames: &[usize]) -> Result<FrameBatch> {
        self.inner().load_frames(mapping, frames)
    }

    fn load_neuron(&self, mapping: &ViewMapping, gid: Gid) -> Result<FrameBatch> {
        self.inner().load_neuron(mapping, gid)
    }
}

/// Writable backends.
pub enum Sink {
    Binary(BinarySink),
    KeyValue(KvWriter),
    Null(NullSink),
}

impl Sink {
    pub fn name(&self) -> &'static str {
        match self {
            Sink::Binary(_) => "binary",
            Sink::KeyValue(_) => "kv",
            Sink::Null(_) => "null",
        }
    }

    fn inner(&mut self) -> &mut dyn ReportSink {
        match self {
            Sink::Binary(sink) => sink,
            Sink::KeyValue(sink) => sink,
            Sink::Null(sink) => sink,
        }
    }
}

impl ReportSink for Sink {
    fn write_header(&mut self, metadata: &ReportMetadata) -> Result<()> {
        self.inner().write_header(metadata)
    }

    fn write_compartments(&mut self, gid: Gid, counts: &[u16]) -> Result<()> {
        self.inner().write_compartments(gid, counts)
    }

    fn write_frame(&mut self, gid: Gid, values: &[f32], timestamp: f64) -> Result<()> {
        self.inner().write_frame(gid, values, timestamp)
    }

    fn flush(&mut self) -> Result<()> {
        self.inner().flush()
    }

    fn erase(&mut self) -> Result<()> {
        self.inner().erase()
    }
}

/// The block of `gid` in `mapping`, relocated to the start of a row.
pub(crate) fn neuron_run(mapping: &ViewMapping, gid: Gid) -> Result<CellRun> {
    mapping
        .run(gid)
        .map(|run| CellRun { target: 0, ..run })
        .ok_or_else(|| ReportError::InvalidArgument(format!("gid {} is not part of this view", gid)))
}

/// Validation shared by the writing backends.
pub(crate) fn check_header(metadata: &ReportMetadata) -> Result<()> {
    if !(metadata.end_time > metadata.start_time) {
        return Err(ReportError::InvalidInterval {
            start: metadata.start_time,
            end: metadata.end_time,
        });
    }
    if !(metadata.time_step > 0.0) || !metadata.time_step.is_finite() {
        return Err(ReportError::InvalidArgument(format!(
            "time step must be positive, got {}",
            metadata.time_step
        )));
    }
    Ok(())
}
