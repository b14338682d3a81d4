//! Binary report header and cell table
//!
//! Layout (byte offsets, values in the writer's byte order):
//!
//! ```text
//!   0  identifier        f64   1.001, tells the reader whether to swap
//!   8  header size       i32   start of the cell table
//!  16  library version   char[16]
//!  32  simulator version char[16]
//!  48  cell count        i32
//!  52  compartments      i32   values per frame
//!  64  frame count       i32
//!  72  start time        f64
//!  80  end time          f64
//!  88  time step         f64
//!  96  data unit         char[16]
//! 112  time unit         char[16]
//! 128  mapping size      i32   floats per compartment in the mapping block
//! 144  mapping name      char[16]
//! 160  extra map size    i32
//! 176  extra map name    char[16]
//! 192  report name       char[32]
//! ```
//!
//! Each 64-byte cell info holds gid (i32 @0), compartment count (i32 @8),
//! data offset (u64 @16), extra mapping offset (u64 @24) and mapping offset
//! (u64 @32).

use tracing::debug;

use crate::bytes::ByteReader;
use crate::error::{ReportError, Result};
use crate::types::Gid;

/// Identifier written by a native-order writer
pub const IDENTIFIER: f64 = 1.001;
/// Size of the fixed header region
pub const HEADER_LENGTH: usize = 1024;
/// Size of one cell info record
pub const CELL_INFO_LENGTH: usize = 64;

const OFF_IDENTIFIER: usize = 0;
const OFF_HEADER_SIZE: usize = 8;
const OFF_LIBRARY_VERSION: usize = 16;
const OFF_SIMULATOR_VERSION: usize = 32;
const OFF_CELL_COUNT: usize = 48;
const OFF_COMPARTMENT_COUNT: usize = 52;
const OFF_FRAME_COUNT: usize = 64;
const OFF_START: usize = 72;
const OFF_END: usize = 80;
const OFF_STEP: usize = 88;
const OFF_DATA_UNIT: usize = 96;
const OFF_TIME_UNIT: usize = 112;
const OFF_MAPPING_SIZE: usize = 128;
const OFF_MAPPING_NAME: usize = 144;
const OFF_EXTRA_MAPPING_SIZE: usize = 160;
const OFF_EXTRA_MAPPING_NAME: usize = 176;
const OFF_REPORT_NAME: usize = 192;

const CELL_GID: usize = 0;
const CELL_COMPARTMENTS: usize = 8;
const CELL_DATA: usize = 16;
const CELL_EXTRA_MAPPING: usize = 24;
const CELL_MAPPING: usize = 32;

const NAME_WIDTH: usize = 16;
const REPORT_NAME_WIDTH: usize = 32;

/// Decoded binary header.
#[derive(Debug, Clone, PartialEq)]
pub struct BinaryHeader {
    /// File was written with the opposite byte order
    pub swapped: bool,
    pub header_size: usize,
    pub library_version: String,
    pub simulator_version: String,
    pub cell_count: usize,
    pub compartment_count: usize,
    pub frame_count: usize,
    pub start_time: f64,
    pub end_time: f64,
    pub time_step: f64,
    pub data_unit: String,
    pub time_unit: String,
    pub mapping_size: usize,
    pub mapping_name: String,
    pub extra_mapping_size: usize,
    pub extra_mapping_name: String,
    pub report_name: String,
}

impl BinaryHeader {
    /// Decode the header from the start of the file.
    ///
    /// A foreign identifier triggers one retry with every numeric field
    /// byte-swapped; if that does not yield the identifier either the file is
    /// corrupt.
    pub fn parse(data: &[u8], source: &str) -> Result<Self> {
        let native = ByteReader::new(data, source);
        let identifier = native.f64_at(OFF_IDENTIFIER, "identifier")?;
        let swapped = if identifier == IDENTIFIER {
            false
        } else if native.swapped(true).f64_at(OFF_IDENTIFIER, "identifier")? == IDENTIFIER {
            debug!(report = source, "Binary report written with foreign byte order");
            true
        } else {
            return Err(ReportError::corrupt(
                source,
                format!("identifier {} is not {} in either byte order", identifier, IDENTIFIER),
            ));
        };
        let r = native.swapped(swapped);

        let mut data_unit = r.cstr_at(OFF_DATA_UNIT, NAME_WIDTH, "data unit")?;
        if data_unit.is_empty() || data_unit == "mv" {
            data_unit = "mV".to_string();
        }
        let mut time_unit = r.cstr_at(OFF_TIME_UNIT, NAME_WIDTH, "time unit")?;
        if time_unit.is_empty() {
            time_unit = "ms".to_string();
        }

        let header = Self {
            swapped,
            header_size: r.count_at(OFF_HEADER_SIZE, "header size")?,
            library_version: r.cstr_at(OFF_LIBRARY_VERSION, NAME_WIDTH, "library version")?,
            simulator_version: r.cstr_at(OFF_SIMULATOR_VERSION, NAME_WIDTH, "simulator version")?,
            cell_count: r.count_at(OFF_CELL_COUNT, "cell count")?,
            compartment_count: r.count_at(OFF_COMPARTMENT_COUNT, "compartment count")?,
            frame_count: r.count_at(OFF_FRAME_COUNT, "frame count")?,
            start_time: r.f64_at(OFF_START, "start time")?,
            end_time: r.f64_at(OFF_END, "end time")?,
            time_step: r.f64_at(OFF_STEP, "time step")?,
            data_unit,
            time_unit,
            mapping_size: r.count_at(OFF_MAPPING_SIZE, "mapping size")?,
            mapping_name: r.cstr_at(OFF_MAPPING_NAME, NAME_WIDTH, "mapping name")?,
            extra_mapping_size: r.count_at(OFF_EXTRA_MAPPING_SIZE, "extra mapping size")?,
            extra_mapping_name: r.cstr_at(OFF_EXTRA_MAPPING_NAME, NAME_WIDTH, "extra mapping name")?,
            report_name: r.cstr_at(OFF_REPORT_NAME, REPORT_NAME_WIDTH, "report name")?,
        };
        header.validate(source)?;
        Ok(header)
    }

    fn validate(&self, source: &str) -> Result<()> {
        let fail = |reason: String| Err(ReportError::corrupt(source, reason));
        if !(self.end_time > self.start_time) {
            return fail(format!("end time {} not after start time {}", self.end_time, self.start_time));
        }
        if !(self.time_step > 0.0) || !self.time_step.is_finite() {
            return fail(format!("time step {} not positive", self.time_step));
        }
        if self.header_size < OFF_REPORT_NAME + REPORT_NAME_WIDTH {
            return fail(format!("header size {} smaller than the header fields", self.header_size));
        }
        if self.cell_count == 0 {
            return fail("report has no cells".to_string());
        }
        if self.mapping_size == 0 {
            return fail("mapping size is 0".to_string());
        }
        Ok(())
    }

    /// Offset of the first byte past the cell table.
    pub fn cell_table_end(&self) -> usize {
        self.header_size + self.cell_count * CELL_INFO_LENGTH
    }
}

/// One cell info record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellInfo {
    pub gid: Gid,
    pub compartment_count: usize,
    pub data_offset: u64,
    pub extra_mapping_offset: u64,
    pub mapping_offset: u64,
}

impl CellInfo {
    /// Decode the cell table, in file order.
    pub fn parse_table(data: &[u8], header: &BinaryHeader, source: &str) -> Result<Vec<CellInfo>> {
        let r = ByteReader::new(data, source).swapped(header.swapped);
        (0..header.cell_count)
            .map(|i| {
                let base = header.header_size + i * CELL_INFO_LENGTH;
                let gid = r.i32_at(base + CELL_GID, "cell gid")?;
                let gid = Gid::try_from(gid)
                    .map_err(|_| ReportError::corrupt(source, format!("negative gid {} in cell {}", gid, i)))?;
                Ok(CellInfo {
                    gid,
                    compartment_count: r.count_at(base + CELL_COMPARTMENTS, "cell compartment count")?,
                    data_offset: r.u64_at(base + CELL_DATA, "cell data offset")?,
                    extra_mapping_offset: r.u64_at(base + CELL_EXTRA_MAPPING, "cell extra mapping offset")?,
                    mapping_offset: r.u64_at(base + CELL_MAPPING, "cell mapping offset")?,
                })
            })
            .collect()
    }
}
