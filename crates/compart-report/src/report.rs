//! Engine, reports, views and writers
//!
//! ```no_run
//! use compart_report::{GidSet, ReportConfig, ReportEngine};
//!
//! let engine = ReportEngine::new(ReportConfig::workstation())?;
//! let report = engine.open("file:///data/soma.bbp")?;
//! let view = report.create_view(&GidSet::from([394, 400]))?;
//! let frame = view.load_frame(report.metadata().start_time).wait()?;
//! assert_eq!(frame.data.len(), view.frame_size());
//! # Ok::<(), compart_report::ReportError>(())
//! ```

use std::sync::Arc;

use tracing::{debug, info};

use crate::backend::binary::{BinaryBackend, BinarySink};
use crate::backend::dummy::DummyBackend;
use crate::backend::kv::{KvBackend, KvWriter};
use crate::backend::null::NullSink;
use crate::backend::{Backend, ReportBackend, ReportSink, Sink};
use crate::config::ReportConfig;
use crate::error::{ReportError, ReportWarning, Result};
use crate::index::{CompartmentIndex, ViewMapping};
use crate::pool::{LoadHandle, TaskPool};
use crate::time::TimeAxis;
use crate::types::{AccessMode, Frame, FrameBatch, Gid, GidSet, ReportMetadata};
use crate::uri::ReportUri;

/// Entry point: opens reports for reading and creates them for writing.
#[derive(Debug, Clone)]
pub struct ReportEngine {
    config: ReportConfig,
}

impl ReportEngine {
    pub fn new(config: ReportConfig) -> Result<Self> {
        config.validate().map_err(ReportError::InvalidConfig)?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &ReportConfig {
        &self.config
    }

    /// Open the report at `uri` for reading.
    pub fn open(&self, uri: &str) -> Result<Report> {
        self.open_with_gids(uri, &GidSet::new())
    }

    /// Open the report at `uri`, loading the mapping of `gids` only.
    ///
    /// An empty set loads every cell. Requested cells the report has no
    /// mapping for are left out and listed in [`Report::warnings`]; if none
    /// of them has one the open fails with `MissingMapping`.
    pub fn open_with_gids(&self, uri: &str, gids: &GidSet) -> Result<Report> {
        let parsed = ReportUri::parse(uri)?;
        let pool = Arc::new(TaskPool::new("report-worker", self.config.worker_threads)?);
        let backend = match parsed {
            ReportUri::Binary { path, strategy } => {
                Backend::Binary(BinaryBackend::open(&path, gids, &self.config, strategy)?)
            }
            ReportUri::KeyValue { path, name, target, .. } => {
                Backend::KeyValue(KvBackend::open(&path, &name, &target, gids, &self.config, &pool)?)
            }
            ReportUri::Dummy { cells, random_values } => {
                Backend::Dummy(DummyBackend::open(cells, random_values, gids)?)
            }
            ReportUri::Null => {
                return Err(ReportError::UnsupportedFormat {
                    uri: uri.to_string(),
                    reason: "null reports cannot be read".into(),
                })
            }
        };
        debug!(uri, backend = backend.name(), workers = pool.threads(), "Report ready");
        Ok(Report {
            uri: uri.to_string(),
            backend: Arc::new(backend),
            pool,
        })
    }

    /// Create the report at `uri` for writing.
    pub fn create(&self, uri: &str, mode: AccessMode) -> Result<ReportWriter> {
        let sink = match ReportUri::parse(uri)? {
            ReportUri::Binary { path, .. } => Sink::Binary(BinarySink::new(&path)),
            ReportUri::KeyValue { path, shards, name, target } => Sink::KeyValue(KvWriter::create(
                &path,
                &name,
                &target,
                shards.unwrap_or(self.config.kv_shards),
                &self.config.shard,
                mode,
            )?),
            ReportUri::Null | ReportUri::Dummy { .. } => Sink::Null(NullSink::new()),
        };
        info!(uri, backend = sink.name(), ?mode, "Created report writer");
        Ok(ReportWriter { uri: uri.to_string(), sink })
    }
}

/// An open report. Views created from it share its backend and task pool.
pub struct Report {
    uri: String,
    backend: Arc<Backend>,
    pool: Arc<TaskPool>,
}

impl Report {
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Name of the backend serving this report.
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn metadata(&self) -> &ReportMetadata {
        self.backend.metadata()
    }

    pub fn time_axis(&self) -> &TimeAxis {
        self.backend.time_axis()
    }

    /// Every cell in the report, or those it was opened with.
    pub fn gids(&self) -> GidSet {
        self.backend.index().gids()
    }

    /// Full-population index.
    pub fn index(&self) -> &Arc<CompartmentIndex> {
        self.backend.index()
    }

    /// Conditions noticed while opening.
    pub fn warnings(&self) -> &[ReportWarning] {
        self.backend.warnings()
    }

    /// View of `gids`; an empty set selects every cell.
    pub fn create_view(&self, gids: &GidSet) -> Result<View> {
        let (mapping, warning) = self.backend.index().repack(gids)?;
        debug!(uri = %self.uri, cells = mapping.gids().len(), compartments = mapping.frame_size(), "Created view");
        Ok(View {
            backend: Arc::clone(&self.backend),
            pool: Arc::clone(&self.pool),
            mapping: Arc::new(mapping),
            warnings: warning.into_iter().collect(),
        })
    }
}

impl Drop for Report {
    fn drop(&mut self) {
        debug!(uri = %self.uri, "Closed report");
    }
}

/// A GID subset of a report with its own contiguous layout.
///
/// Every load captures the mapping current at the time of the call, so
/// [`View::update_mapping`] never affects loads already in flight.
pub struct View {
    backend: Arc<Backend>,
    pool: Arc<TaskPool>,
    mapping: Arc<ViewMapping>,
    warnings: Vec<ReportWarning>,
}

impl View {
    /// Cells of the view, ascending.
    pub fn gids(&self) -> &[Gid] {
        self.mapping.gids()
    }

    pub fn mapping(&self) -> &ViewMapping {
        &self.mapping
    }

    /// Values per frame of this view.
    pub fn frame_size(&self) -> usize {
        self.mapping.frame_size()
    }

    /// Conditions noticed while building the mapping.
    pub fn warnings(&self) -> &[ReportWarning] {
        &self.warnings
    }

    /// Select a different GID subset. Fails without touching the view.
    pub fn update_mapping(&mut self, gids: &GidSet) -> Result<()> {
        let (mapping, warning) = self.backend.index().repack(gids)?;
        self.mapping = Arc::new(mapping);
        self.warnings = warning.into_iter().collect();
        Ok(())
    }

    /// The frame containing `timestamp`.
    pub fn load_frame(&self, timestamp: f64) -> LoadHandle<Frame> {
        let frame = match self.backend.time_axis().checked_frame_index(timestamp) {
            Ok(frame) => frame,
            Err(e) => return LoadHandle::ready(Err(e)),
        };
        let backend = Arc::clone(&self.backend);
        let mapping = Arc::clone(&self.mapping);
        self.pool.post(move || {
            let batch = backend.load_frames(&mapping, &[frame])?;
            Ok(Frame {
                timestamp: batch.timestamps.first().copied().unwrap_or(timestamp),
                data: batch.data,
            })
        })
    }

    /// Every frame in `[start, end)`.
    pub fn load_frames(&self, start: f64, end: f64) -> LoadHandle<FrameBatch> {
        match self.backend.time_axis().frames(start, end) {
            Ok(frames) => self.post_frames(frames.collect()),
            Err(e) => LoadHandle::ready(Err(e)),
        }
    }

    /// Frames in `[start, end)` sampled every `step`, a multiple of the time step.
    pub fn load_frames_every(&self, start: f64, end: f64, step: f64) -> LoadHandle<FrameBatch> {
        match self.backend.time_axis().samples(start, end, step) {
            Ok(frames) => self.post_frames(frames),
            Err(e) => LoadHandle::ready(Err(e)),
        }
    }

    /// Every frame of the report.
    pub fn load_all(&self) -> LoadHandle<FrameBatch> {
        self.post_frames((0..self.backend.time_axis().frame_count()).collect())
    }

    /// Time series of one cell of the view, one row per frame.
    pub fn load_neuron(&self, gid: Gid) -> LoadHandle<FrameBatch> {
        if self.mapping.position(gid).is_none() {
            return LoadHandle::ready(Err(ReportError::InvalidArgument(format!(
                "gid {} is not part of this view",
                gid
            ))));
        }
        let backend = Arc::clone(&self.backend);
        let mapping = Arc::clone(&self.mapping);
        self.pool.post(move || backend.load_neuron(&mapping, gid))
    }

    fn post_frames(&self, frames: Vec<usize>) -> LoadHandle<FrameBatch> {
        if frames.is_empty() {
            return LoadHandle::ready(Ok(FrameBatch::with_capacity(self.mapping.frame_size(), 0)));
        }
        let backend = Arc::clone(&self.backend);
        let mapping = Arc::clone(&self.mapping);
        self.pool.post(move || backend.load_frames(&mapping, &frames))
    }
}

/// Write access to one report. Calls must come from a single thread.
pub struct ReportWriter {
    uri: String,
    sink: Sink,
}

impl ReportWriter {
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Name of the backend written to.
    pub fn backend_name(&self) -> &'static str {
        self.sink.name()
    }

    pub fn write_header(&mut self, metadata: &ReportMetadata) -> Result<()> {
        self.sink.write_header(metadata)
    }

    pub fn write_compartments(&mut self, gid: Gid, counts: &[u16]) -> Result<()> {
        self.sink.write_compartments(gid, counts)
    }

    pub fn write_frame(&mut self, gid: Gid, values: &[f32], timestamp: f64) -> Result<()> {
        self.sink.write_frame(gid, values, timestamp)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.sink.flush()
    }

    /// Remove everything written to the report.
    pub fn erase(&mut self) -> Result<()> {
        self.sink.erase()
    }
}
