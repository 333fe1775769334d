//! The baseline reader protocol.
//!
//! A [`BaselineReader`] serves time-by-frequency slices of single baselines
//! out of a table whose rows are stored time-major across all baselines.
//! Callers queue [`ReadRequest`]s, run them as one batch with
//! [`BaselineReader::perform_read_requests`], then collect one
//! [`BaselineResult`] per request, in order, with
//! [`BaselineReader::next_result`]. Flag writes are queued and flushed the same
//! way.
//!
//! Three backends implement the protocol:
//! - [`direct::DirectReader`] indexes the rows of each baseline and re-reads
//!   them from the table for every batch.
//! - [`memory::MemoryReader`] loads the whole table into memory.
//! - [`reordering::ReorderingReader`] rewrites the table once into
//!   baseline-contiguous temporary files.
//!
//! [`crate::selector::new_reader`] picks one of them.

pub mod direct;
pub mod file_buffer;
pub mod lookup;
pub mod memory;
pub mod reordering;

use std::{collections::VecDeque, fmt, ops::Range, path::PathBuf, str::FromStr};

use derive_builder::Builder;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::warn;
use marlu::{
    c32,
    ndarray::{s, Array2, ArrayView2},
    UVW,
};

use crate::{
    error::ReaderError,
    io::{error::IOError, ScalarColumns, VisTable, DEFAULT_DATA_COLUMN},
    metadata::{BandInfo, BaselineKey, MsMetadata, TimeInterval},
};

/// Which backend serves the requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadMode {
    /// Re-scan the needed rows of the table for every batch.
    Direct,
    /// Load the whole table into memory.
    Memory,
    /// Reorder the table into baseline-contiguous temporary files.
    Reordering,
    /// Choose between memory and reordering from the table size.
    #[default]
    Auto,
}

impl fmt::Display for ReadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Direct => "direct",
            Self::Memory => "memory",
            Self::Reordering => "reordering",
            Self::Auto => "auto",
        })
    }
}

impl FromStr for ReadMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "direct" => Ok(Self::Direct),
            "memory" => Ok(Self::Memory),
            "reordering" | "reorder" | "indirect" => Ok(Self::Reordering),
            "auto" => Ok(Self::Auto),
            other => Err(format!(
                "unknown read mode {other}, expected one of direct, memory, reordering, auto"
            )),
        }
    }
}

/// Options shared by all backends.
///
/// Fields not set on a [`ReaderOptionsBuilder`] take their value from
/// [`ReaderOptions::default`].
#[derive(Builder, Debug, Clone, PartialEq)]
#[builder(default)]
pub struct ReaderOptions {
    /// Which backend to use
    pub mode: ReadMode,
    /// The visibility column to read and write
    #[builder(setter(into))]
    pub data_column: String,
    /// Read visibilities. When off, results hold zeros.
    pub read_data: bool,
    /// Read flags. When off, rows present in the table are reported unflagged.
    pub read_flags: bool,
    /// Read a UVW coordinate for each time step.
    pub read_uvw: bool,
    /// Only serve these time steps of each sequence
    pub interval: TimeInterval,
    /// Directory for the reordered temporary files
    #[builder(setter(into))]
    pub temp_dir: PathBuf,
    /// Name prefix of the temporary files. Readers given the same token share
    /// their reordered files; by default each reader makes up its own.
    #[builder(setter(into, strip_option))]
    pub temp_token: Option<String>,
    /// Leave the temporary files behind when the reader is closed, so a later
    /// reader with the same token can reuse them.
    pub keep_temp_files: bool,
    /// Memory budget in bytes, instead of the system's total memory
    #[builder(setter(strip_option))]
    pub memory_limit: Option<u64>,
    /// Size of the reorder write buffer in bytes, instead of a tenth of the
    /// memory budget
    #[builder(setter(strip_option))]
    pub reorder_buffer_bytes: Option<usize>,
    /// Draw progress bars on stderr
    pub draw_progress: bool,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            mode: ReadMode::Auto,
            data_column: DEFAULT_DATA_COLUMN.to_string(),
            read_data: true,
            read_flags: true,
            read_uvw: true,
            interval: TimeInterval::default(),
            temp_dir: PathBuf::from("."),
            temp_token: None,
            keep_temp_files: false,
            memory_limit: None,
            reorder_buffer_bytes: None,
            draw_progress: false,
        }
    }
}

/// A queued read of a time range of one baseline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRequest {
    /// The time series to read
    pub key: BaselineKey,
    /// Half-open range of time indices
    pub time_range: Range<usize>,
}

impl ReadRequest {
    /// The number of time steps requested.
    pub fn width(&self) -> usize {
        self.time_range.len()
    }
}

/// A queued flag write for one baseline.
///
/// `flags` holds one `(time, channel)` mask per polarization, or a single mask
/// that applies to all of them. The first `left_border` and last
/// `right_border` time steps of the masks are not written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlagWriteRequest {
    /// The time series to write
    pub key: BaselineKey,
    /// Time index of the first row of the masks
    pub start: usize,
    /// The masks
    pub flags: Vec<Array2<bool>>,
    /// Leading time steps to leave untouched
    pub left_border: usize,
    /// Trailing time steps to leave untouched
    pub right_border: usize,
}

impl FlagWriteRequest {
    /// A write of `flags` starting at time index 0, with no borders.
    pub fn new(key: BaselineKey, flags: Vec<Array2<bool>>) -> Self {
        Self {
            key,
            start: 0,
            flags,
            left_border: 0,
            right_border: 0,
        }
    }

    /// Start the masks at time index `start` instead.
    pub fn with_start(mut self, start: usize) -> Self {
        self.start = start;
        self
    }

    /// Leave `left` leading and `right` trailing time steps untouched.
    pub fn with_borders(mut self, left: usize, right: usize) -> Self {
        self.left_border = left;
        self.right_border = right;
        self
    }

    /// The number of time steps in the masks.
    pub fn width(&self) -> usize {
        self.flags.first().map_or(0, Array2::nrows)
    }

    /// The time indices the masks cover.
    pub fn time_range(&self) -> Range<usize> {
        self.start..self.start + self.width()
    }

    /// The time indices that will actually be written.
    pub fn written_range(&self) -> Range<usize> {
        let range = self.time_range();
        let start = (range.start + self.left_border).min(range.end);
        let end = range.end.saturating_sub(self.right_border).max(start);
        start..end
    }

    /// The mask for polarization `pol`.
    pub fn mask(&self, pol: usize) -> &Array2<bool> {
        if self.flags.len() == 1 {
            &self.flags[0]
        } else {
            &self.flags[pol]
        }
    }

    /// The flags of time index `time` (absolute) as a `(channel, polarization)`
    /// cell, the layout rows are stored in.
    pub(crate) fn cell(&self, time: usize, pol_count: usize) -> Array2<bool> {
        let t = time - self.start;
        let channels = self.flags.first().map_or(0, Array2::ncols);
        Array2::from_shape_fn((channels, pol_count), |(c, p)| self.mask(p)[(t, c)])
    }
}

/// The outcome of one [`ReadRequest`].
///
/// Matrices are `(time, channel)` shaped, one per polarization, and always
/// cover the whole requested range. Time steps the table has no row for are
/// zero and flagged.
#[derive(Debug, Clone, PartialEq)]
pub struct BaselineResult {
    /// The time series that was read
    pub key: BaselineKey,
    /// The time indices covered
    pub time_range: Range<usize>,
    /// Real parts of the visibilities
    pub real: Vec<Array2<f32>>,
    /// Imaginary parts of the visibilities
    pub imag: Vec<Array2<f32>>,
    /// Flags
    pub flags: Vec<Array2<bool>>,
    /// One UVW per time step, zero where there was no row
    pub uvw: Vec<UVW>,
    /// The band of the baseline, with its channel frequencies
    pub band: BandInfo,
}

fn allocate<T: Clone>(
    shape: (usize, usize),
    fill: T,
    what: &'static str,
) -> Result<Array2<T>, ReaderError> {
    let num_elems = shape.0 * shape.1;
    let mut v = Vec::new();
    if v.try_reserve_exact(num_elems).is_err() {
        let need_gib = num_elems * std::mem::size_of::<T>() / 1024_usize.pow(3);
        return Err(ReaderError::InsufficientMemory { need_gib, what });
    }
    v.resize(num_elems, fill);
    Array2::from_shape_vec(shape, v).map_err(|e| ReaderError::BadArrayShape {
        argument: "shape".to_string(),
        function: "allocate".to_string(),
        expected: format!("{shape:?}"),
        received: e.to_string(),
    })
}

impl BaselineResult {
    /// A zero-valued, fully flagged result.
    ///
    /// # Errors
    ///
    /// Will return [`ReaderError::InsufficientMemory`] if the matrices can't be
    /// allocated.
    pub fn new_flagged(
        key: BaselineKey,
        time_range: Range<usize>,
        band: &BandInfo,
        pol_count: usize,
    ) -> Result<Self, ReaderError> {
        let shape = (time_range.len(), band.channel_count());
        let mut real = Vec::with_capacity(pol_count);
        let mut imag = Vec::with_capacity(pol_count);
        let mut flags = Vec::with_capacity(pol_count);
        for _ in 0..pol_count {
            real.push(allocate(shape, 0., "result visibilities")?);
            imag.push(allocate(shape, 0., "result visibilities")?);
            flags.push(allocate(shape, true, "result flags")?);
        }
        Ok(Self {
            key,
            uvw: vec![UVW::default(); time_range.len()],
            time_range,
            real,
            imag,
            flags,
            band: band.clone(),
        })
    }

    /// A fully flagged result for `request`, shaped from the catalog.
    ///
    /// # Errors
    ///
    /// Will return [`ReaderError::IndexOutOfRange`] if the band is unknown, or
    /// [`ReaderError::InsufficientMemory`].
    pub fn for_request(meta: &MsMetadata, request: &ReadRequest) -> Result<Self, ReaderError> {
        let band = meta
            .band(request.key.band)
            .ok_or(ReaderError::IndexOutOfRange {
                what: "band",
                index: request.key.band,
                count: meta.band_count(),
            })?;
        Self::new_flagged(
            request.key,
            request.time_range.clone(),
            band,
            meta.polarization_count(),
        )
    }

    /// The number of time steps.
    pub fn width(&self) -> usize {
        self.time_range.len()
    }

    /// The number of channels.
    pub fn channel_count(&self) -> usize {
        self.band.channel_count()
    }

    /// The number of polarizations.
    pub fn polarization_count(&self) -> usize {
        self.flags.len()
    }

    /// The visibility of polarization `pol` at `(time, channel)`, relative to
    /// the start of the result.
    pub fn visibility(&self, pol: usize, time: usize, channel: usize) -> c32 {
        c32::new(self.real[pol][(time, channel)], self.imag[pol][(time, channel)])
    }

    /// Fill time step `t` (relative) from a `(channel, polarization)` cell.
    /// `None` data leaves zeros, `None` flags marks the samples unflagged.
    pub(crate) fn set_row(
        &mut self,
        t: usize,
        data: Option<ArrayView2<c32>>,
        flags: Option<ArrayView2<bool>>,
    ) {
        for p in 0..self.flags.len() {
            for c in 0..self.band.channel_count() {
                if let Some(data) = &data {
                    let vis = data[(c, p)];
                    self.real[p][(t, c)] = vis.re;
                    self.imag[p][(t, c)] = vis.im;
                }
                self.flags[p][(t, c)] = flags.as_ref().map_or(false, |f| f[(c, p)]);
            }
        }
    }

    /// Whether a `(channel, polarization)` cell fits this result.
    pub(crate) fn fits_cell(&self, shape: (usize, usize)) -> bool {
        shape == (self.band.channel_count(), self.flags.len())
    }

    /// The time steps `range` (relative) of this result, as a new result.
    pub fn slice(&self, range: Range<usize>) -> Self {
        let sub = |m: &Array2<f32>| m.slice(s![range.clone(), ..]).to_owned();
        Self {
            key: self.key,
            time_range: self.time_range.start + range.start..self.time_range.start + range.end,
            real: self.real.iter().map(sub).collect(),
            imag: self.imag.iter().map(sub).collect(),
            flags: self
                .flags
                .iter()
                .map(|m| m.slice(s![range.clone(), ..]).to_owned())
                .collect(),
            uvw: self.uvw[range.clone()].to_vec(),
            band: self.band.clone(),
        }
    }
}

/// The request and result queues every backend keeps.
#[derive(Debug, Default)]
pub struct RequestQueue {
    reads: Vec<ReadRequest>,
    writes: Vec<FlagWriteRequest>,
    results: VecDeque<BaselineResult>,
}

impl RequestQueue {
    /// Queue a read.
    pub fn push_read(&mut self, request: ReadRequest) {
        self.reads.push(request);
    }

    /// Queue a flag write.
    pub fn push_write(&mut self, request: FlagWriteRequest) {
        self.writes.push(request);
    }

    /// Take the queued reads for a new batch.
    ///
    /// # Errors
    ///
    /// Will return [`ReaderError::UnconsumedResults`] if results of a previous
    /// batch have not all been collected.
    pub fn begin_read_batch(&mut self) -> Result<Vec<ReadRequest>, ReaderError> {
        if !self.results.is_empty() {
            return Err(ReaderError::UnconsumedResults {
                pending: self.results.len(),
            });
        }
        Ok(std::mem::take(&mut self.reads))
    }

    /// Take the queued flag writes.
    pub fn take_writes(&mut self) -> Vec<FlagWriteRequest> {
        std::mem::take(&mut self.writes)
    }

    /// Make the results of a batch available, in request order.
    pub fn push_results(&mut self, results: Vec<BaselineResult>) {
        self.results.extend(results);
    }

    /// Pop the oldest result.
    ///
    /// # Errors
    ///
    /// Will return [`ReaderError::NoResults`] if there are none.
    pub fn pop_result(&mut self) -> Result<BaselineResult, ReaderError> {
        self.results.pop_front().ok_or(ReaderError::NoResults)
    }

    /// Number of queued reads.
    pub fn pending_reads(&self) -> usize {
        self.reads.len()
    }

    /// Number of queued flag writes.
    pub fn pending_writes(&self) -> usize {
        self.writes.len()
    }

    /// Number of results not yet collected.
    pub fn pending_results(&self) -> usize {
        self.results.len()
    }
}

/// Serves baseline time series out of a visibility table.
///
/// Preparation (indexing, loading or reordering the table) happens on first
/// use, or eagerly with [`BaselineReader::prepare`]. Dirty state is written
/// back by [`BaselineReader::write_to_source`] or [`BaselineReader::close`];
/// dropping a reader without closing it attempts the same, but can only log
/// failures.
pub trait BaselineReader {
    /// Which backend this is.
    fn mode(&self) -> ReadMode;

    /// The catalog of the table, built on first call.
    ///
    /// # Errors
    ///
    /// Will return [`ReaderError`] if the table can't be scanned.
    fn metadata(&mut self) -> Result<&MsMetadata, ReaderError>;

    /// The request and result queues.
    fn queue(&mut self) -> &mut RequestQueue;

    /// Do the one-time preparation now instead of on first use.
    ///
    /// # Errors
    ///
    /// Will return [`ReaderError`] if the table can't be read, or temporary
    /// files can't be written.
    fn prepare(&mut self) -> Result<(), ReaderError>;

    /// Serve all queued read requests as one batch. Results become available
    /// through [`BaselineReader::next_result`] in request order.
    ///
    /// # Errors
    ///
    /// Will return [`ReaderError::UnconsumedResults`] if results of a
    /// previous batch are still queued, or an I/O error.
    fn perform_read_requests(&mut self) -> Result<(), ReaderError>;

    /// Flush all queued flag writes.
    ///
    /// # Errors
    ///
    /// Will return [`ReaderError`] on I/O failure.
    fn perform_flag_write_requests(&mut self) -> Result<(), ReaderError>;

    /// Replace the visibilities of a baseline, from time index 0. `real` and
    /// `imag` hold one `(time, channel)` matrix per polarization.
    ///
    /// # Errors
    ///
    /// Will return [`ReaderError::DataWriteUnsupported`] for backends that
    /// can't persist visibilities.
    fn perform_data_write_task(
        &mut self,
        real: Vec<Array2<f32>>,
        imag: Vec<Array2<f32>>,
        antenna1: usize,
        antenna2: usize,
        band: usize,
        sequence_id: usize,
    ) -> Result<(), ReaderError>;

    /// Whether there are changes that have not been written to the table.
    fn is_modified(&self) -> bool;

    /// Write pending changes back to the table.
    ///
    /// # Errors
    ///
    /// Will return [`ReaderError`] on I/O failure.
    fn write_to_source(&mut self) -> Result<(), ReaderError>;

    /// Write pending changes back and release temporary resources. Every
    /// later call on the reader fails with [`ReaderError::Closed`].
    ///
    /// # Errors
    ///
    /// Will return [`ReaderError`] on I/O failure.
    fn close(&mut self) -> Result<(), ReaderError>;

    /// The smallest number of baselines worth buffering for `threads`
    /// consumers.
    fn min_recommended_buffer_size(&self, threads: usize) -> usize {
        threads
    }

    /// The largest number of baselines worth buffering for `threads`
    /// consumers.
    fn max_recommended_buffer_size(&self, threads: usize) -> usize {
        2 * threads
    }

    /// Queue a read of the whole sequence of a baseline.
    ///
    /// # Errors
    ///
    /// Will return [`ReaderError::IndexOutOfRange`] for indices the catalog
    /// doesn't know.
    fn add_read_request(
        &mut self,
        antenna1: usize,
        antenna2: usize,
        band: usize,
        sequence_id: usize,
    ) -> Result<(), ReaderError> {
        let count = self.metadata()?.timestep_count(sequence_id);
        self.add_read_request_range(antenna1, antenna2, band, sequence_id, 0..count)
    }

    /// Queue a read of the time indices `time_range` of a baseline.
    ///
    /// # Errors
    ///
    /// Will return [`ReaderError::IndexOutOfRange`] or
    /// [`ReaderError::InvalidTimeRange`] for requests outside the catalog.
    fn add_read_request_range(
        &mut self,
        antenna1: usize,
        antenna2: usize,
        band: usize,
        sequence_id: usize,
        time_range: Range<usize>,
    ) -> Result<(), ReaderError> {
        let key = BaselineKey::new(antenna1, antenna2, band, sequence_id);
        let meta = self.metadata()?;
        meta.validate_key(&key)?;
        meta.validate_range(&key, &time_range)?;
        self.queue().push_read(ReadRequest { key, time_range });
        Ok(())
    }

    /// Pop the oldest result of the last batch.
    ///
    /// # Errors
    ///
    /// Will return [`ReaderError::NoResults`] if no results are queued.
    fn next_result(&mut self) -> Result<BaselineResult, ReaderError> {
        self.queue().pop_result()
    }

    /// Queue a flag write of a baseline from time index 0. `flags` holds one
    /// mask per polarization, or one mask for all of them.
    ///
    /// # Errors
    ///
    /// see [`BaselineReader::add_flag_write_request`]
    fn add_write_task(
        &mut self,
        flags: Vec<Array2<bool>>,
        antenna1: usize,
        antenna2: usize,
        band: usize,
        sequence_id: usize,
    ) -> Result<(), ReaderError> {
        let key = BaselineKey::new(antenna1, antenna2, band, sequence_id);
        self.add_flag_write_request(FlagWriteRequest::new(key, flags))
    }

    /// Queue a flag write.
    ///
    /// # Errors
    ///
    /// Will return [`ReaderError::PolarizationMismatch`] if the number of masks
    /// is neither 1 nor the polarization count,
    /// [`ReaderError::BadArrayShape`] if the masks aren't all
    /// `(time, channel)` shaped for the band, or an index error.
    fn add_flag_write_request(&mut self, request: FlagWriteRequest) -> Result<(), ReaderError> {
        let meta = self.metadata()?;
        let pol_count = meta.polarization_count();
        if request.flags.len() != 1 && request.flags.len() != pol_count {
            return Err(ReaderError::PolarizationMismatch {
                expected: pol_count,
                received: request.flags.len(),
            });
        }
        meta.validate_key(&request.key)?;
        let expected = (request.width(), meta.channel_count(request.key.band));
        if let Some(bad) = request.flags.iter().find(|m| m.dim() != expected) {
            return Err(ReaderError::BadArrayShape {
                argument: "flags".to_string(),
                function: "add_flag_write_request".to_string(),
                expected: format!("{expected:?}"),
                received: format!("{:?}", bad.dim()),
            });
        }
        meta.validate_range(&request.key, &request.time_range())?;
        self.queue().push_write(request);
        Ok(())
    }
}

/// Check the shape of a data write against the catalog.
pub(crate) fn validate_data_write(
    meta: &MsMetadata,
    real: &[Array2<f32>],
    imag: &[Array2<f32>],
    key: &BaselineKey,
) -> Result<(), ReaderError> {
    let pol_count = meta.polarization_count();
    if real.len() != pol_count || imag.len() != pol_count {
        return Err(ReaderError::PolarizationMismatch {
            expected: pol_count,
            received: real.len().min(imag.len()),
        });
    }
    meta.validate_key(key)?;
    let width = real.first().map_or(0, Array2::nrows);
    let expected = (width, meta.channel_count(key.band));
    if let Some(bad) = real.iter().chain(imag).find(|m| m.dim() != expected) {
        return Err(ReaderError::BadArrayShape {
            argument: "real/imag".to_string(),
            function: "perform_data_write_task".to_string(),
            expected: format!("{expected:?}"),
            received: format!("{:?}", bad.dim()),
        });
    }
    meta.validate_range(key, &(0..width))
}

/// State every backend carries: the table, the options, the lazily built
/// catalog and the queues.
#[derive(Debug)]
pub(crate) struct ReaderCore<T> {
    pub table: T,
    pub options: ReaderOptions,
    pub queue: RequestQueue,
    meta: Option<MsMetadata>,
    cols: Option<ScalarColumns>,
    closed: bool,
}

impl<T: VisTable> ReaderCore<T> {
    pub fn new(table: T, options: ReaderOptions) -> Self {
        Self {
            table,
            options,
            queue: RequestQueue::default(),
            meta: None,
            cols: None,
            closed: false,
        }
    }

    fn build_meta(&mut self) -> Result<MsMetadata, ReaderError> {
        let cols = self.table.scalar_columns()?;
        let meta = MsMetadata::from_columns(&mut self.table, &cols, &self.options.interval)?;
        self.cols = Some(cols);
        Ok(meta)
    }

    /// The catalog, the table and the options, building the catalog first if
    /// needed.
    pub fn split(&mut self) -> Result<(&MsMetadata, &mut T, &ReaderOptions), ReaderError> {
        if self.closed {
            return Err(ReaderError::Closed);
        }
        let meta = match self.meta.take() {
            Some(meta) => meta,
            None => self.build_meta()?,
        };
        let meta = self.meta.insert(meta);
        Ok((meta, &mut self.table, &self.options))
    }

    pub fn metadata(&mut self) -> Result<&MsMetadata, ReaderError> {
        self.split().map(|(meta, _, _)| meta)
    }

    /// The scalar columns for a full pass over the table. The copy read while
    /// building the catalog is handed out once, later passes read them again.
    pub fn take_columns(&mut self) -> Result<ScalarColumns, ReaderError> {
        self.metadata()?;
        match self.cols.take() {
            Some(cols) => Ok(cols),
            None => Ok(self.table.scalar_columns()?),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn mark_closed(&mut self) {
        self.closed = true;
    }
}

/// The cells of one row, as far as the options ask for them.
pub(crate) struct RowCells {
    pub data: Option<Array2<c32>>,
    pub flags: Option<Array2<bool>>,
    pub uvw: Option<UVW>,
}

impl RowCells {
    pub fn read<T: VisTable>(
        table: &mut T,
        options: &ReaderOptions,
        row: usize,
    ) -> Result<Self, IOError> {
        Ok(Self {
            data: if options.read_data {
                Some(table.read_data(row, &options.data_column)?)
            } else {
                None
            },
            flags: if options.read_flags {
                Some(table.read_flags(row)?)
            } else {
                None
            },
            uvw: if options.read_uvw {
                Some(table.read_uvw(row)?)
            } else {
                None
            },
        })
    }

    /// The `(channel, polarization)` shape of the cells read, if any were.
    pub fn shape(&self) -> Option<(usize, usize)> {
        match (&self.data, &self.flags) {
            (Some(data), _) => Some(data.dim()),
            (None, Some(flags)) => Some(flags.dim()),
            (None, None) => None,
        }
    }

    /// Copy into time step `t` (relative) of `result`. Returns false, leaving
    /// the result untouched, if the cells don't fit the result's band.
    pub fn fill(&self, result: &mut BaselineResult, t: usize) -> bool {
        if let Some(shape) = self.shape() {
            if !result.fits_cell(shape) {
                return false;
            }
        }
        result.set_row(
            t,
            self.data.as_ref().map(|d| d.view()),
            self.flags.as_ref().map(|f| f.view()),
        );
        if let Some(uvw) = self.uvw {
            result.uvw[t] = uvw;
        }
        true
    }
}

/// Write a flag cell, logging and skipping rows whose cell shape doesn't
/// match the catalog.
pub(crate) fn write_flag_cell<T: VisTable>(
    table: &mut T,
    row: usize,
    cell: ArrayView2<bool>,
) -> Result<(), IOError> {
    match table.write_flags(row, cell) {
        Err(IOError::BadCellShape {
            expected, received, ..
        }) => {
            warn!("row {row} has flag shape {expected}, not {received}, skipping");
            Ok(())
        }
        other => other,
    }
}

/// Write a visibility cell, logging and skipping rows whose cell shape
/// doesn't match the catalog.
pub(crate) fn write_data_cell<T: VisTable>(
    table: &mut T,
    row: usize,
    column: &str,
    cell: ArrayView2<c32>,
) -> Result<(), IOError> {
    match table.write_data(row, column, cell) {
        Err(IOError::BadCellShape {
            expected, received, ..
        }) => {
            warn!("row {row} has {column} shape {expected}, not {received}, skipping");
            Ok(())
        }
        other => other,
    }
}

/// A progress bar over `len` items, drawn only if `draw_progress`.
pub(crate) fn progress_bar(len: usize, message: &'static str, draw_progress: bool) -> ProgressBar {
    let draw_target = if draw_progress {
        ProgressDrawTarget::stderr()
    } else {
        ProgressDrawTarget::hidden()
    };
    let progress = ProgressBar::with_draw_target(Some(len as u64), draw_target);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{msg:16}: [{elapsed_precise}] [{wide_bar:.cyan/blue}] {percent:3}% ({eta:5})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("=> "),
    );
    progress.set_message(message);
    progress
}
