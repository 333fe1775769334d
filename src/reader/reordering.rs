//! Serve requests from temporary files that hold the table reordered
//! baseline by baseline.
//!
//! On first use the whole table is read once, in row order, and every row is
//! written to the [`Region`] of its baseline in two files: one of visibilities
//! and one of flags (see [`super::file_buffer`] for the encoding). Time steps a
//! baseline has no row for are padded with zero, flagged samples, so every
//! region holds its full sequence. After that, each request is a single
//! contiguous read.
//!
//! A third file records which table was reordered. A reader given the same
//! [`ReaderOptions::temp_token`] as an earlier one that kept its files
//! ([`ReaderOptions::keep_temp_files`]) reuses them instead of reordering
//! again. Files a reader reuses are never deleted by it.

use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::atomic::{AtomicUsize, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use log::{debug, error, info, trace, warn};
use marlu::{c32, ndarray::Array2};

use super::{
    direct::{read_uvw, BaselineRowIndex},
    file_buffer::{
        encode_data, encode_flags, DataSamples, FlagSamples, ReorderedFileBuffer, SampleFile,
        DATA_SAMPLE_BYTES, FLAG_SAMPLE_BYTES,
    },
    lookup::{Region, SequenceIndexLookupTable},
    progress_bar, validate_data_write, write_data_cell, write_flag_cell, BaselineReader,
    BaselineResult, ReadMode, ReadRequest, ReaderCore, ReaderOptions, RequestQueue,
};
use crate::{
    error::ReaderError,
    io::{error::IOError, ScalarColumns, VisTable},
    metadata::{BaselineKey, MsMetadata},
    selection::RowSelection,
    selector,
};

/// The reorder write buffer never grows past this many bytes.
pub const MAX_REORDER_BUFFER_BYTES: usize = 1 << 30;

/// How far a [`ReorderingReader`] has got with its temporary files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReorderState {
    /// No files yet
    NotReordered,
    /// Files are being written. A reader left in this state holds partial
    /// files.
    Reordering,
    /// Files are complete, either written or reused
    Ready,
}

/// The temporary files of a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TempFilePaths {
    /// Visibility samples
    pub data: PathBuf,
    /// Flag samples
    pub flags: PathBuf,
    /// The path of the table the files were made from
    pub meta: PathBuf,
}

impl TempFilePaths {
    /// The files of `token` in `dir`.
    pub fn new(dir: &Path, token: &str) -> Self {
        Self {
            data: dir.join(format!("{token}-data.tmp")),
            flags: dir.join(format!("{token}-flag.tmp")),
            meta: dir.join(format!("{token}-meta.tmp")),
        }
    }

    /// All three paths.
    pub fn all(&self) -> [&Path; 3] {
        [&self.data, &self.flags, &self.meta]
    }
}

/// A token no other reader, in this process or any other, is using.
pub fn unique_token() -> String {
    static NONCE: AtomicUsize = AtomicUsize::new(0);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos());
    format!(
        "msreorder-{}-{:x}-{}",
        std::process::id(),
        nanos,
        NONCE.fetch_add(1, Ordering::Relaxed)
    )
}

/// An absolute form of `path` that is the same for every reader of the same
/// table, whether or not it exists on disk.
fn canonical_source(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path.to_path_buf(),
    })
}

/// The write buffer size for a reorder: a tenth of the memory budget, at
/// most [`MAX_REORDER_BUFFER_BYTES`].
pub fn reorder_buffer_bytes(options: &ReaderOptions) -> usize {
    options.reorder_buffer_bytes.unwrap_or_else(|| {
        let tenth = selector::memory_budget(options) / 10;
        usize::try_from(tenth).map_or(MAX_REORDER_BUFFER_BYTES, |b| {
            b.min(MAX_REORDER_BUFFER_BYTES)
        })
    })
}

/// Whether the files at `paths` are a complete reorder of `source` laid out
/// like `lookup`.
fn files_match(paths: &TempFilePaths, source: &Path, lookup: &SequenceIndexLookupTable) -> bool {
    let Ok(recorded) = fs::read_to_string(&paths.meta) else {
        return false;
    };
    if Path::new(recorded.trim_end()) != canonical_source(source) {
        debug!(
            "{} was made from {}, not {}",
            paths.meta.display(),
            recorded.trim_end(),
            source.display()
        );
        return false;
    }
    let size_matches = |path: &Path, sample_bytes: u64| {
        fs::metadata(path)
            .map(|m| m.len() == lookup.total_samples() * sample_bytes)
            .unwrap_or(false)
    };
    size_matches(&paths.data, DATA_SAMPLE_BYTES) && size_matches(&paths.flags, FLAG_SAMPLE_BYTES)
}

/// The open reordered files.
#[derive(Debug)]
struct ReorderedFiles {
    data: SampleFile,
    flags: SampleFile,
    lookup: SequenceIndexLookupTable,
}

/// Flag bytes queued per padding write.
const PAD_CHUNK_SAMPLES: u64 = 1 << 16;

/// Queue flags for time steps `steps` of `region`. Their visibilities are
/// left as the zeros the file was created with.
fn pad_region(
    flags: &mut ReorderedFileBuffer,
    region: &Region,
    steps: std::ops::Range<usize>,
) -> Result<(), IOError> {
    let samples = region.samples_of(&steps);
    let ones = vec![1; samples.end.saturating_sub(samples.start).min(PAD_CHUNK_SAMPLES) as usize];
    let mut start = samples.start;
    while start < samples.end {
        let count = (samples.end - start).min(PAD_CHUNK_SAMPLES);
        flags.write_at(start, &ones[..count as usize])?;
        start += count;
    }
    Ok(())
}

/// Remove `path`, if it exists.
fn remove_if_present(path: &Path) -> Result<(), IOError> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != ErrorKind::NotFound => Err(IOError::TempFileCreate {
            path: path.display().to_string(),
            err,
            source_file: file!(),
            source_line: line!(),
        }),
        _ => Ok(()),
    }
}

/// Read every row of `table` into freshly created files at `paths`.
fn reorder_table<T: VisTable>(
    meta: &MsMetadata,
    table: &mut T,
    options: &ReaderOptions,
    cols: &ScalarColumns,
    paths: &TempFilePaths,
    lookup: SequenceIndexLookupTable,
) -> Result<ReorderedFiles, ReaderError> {
    let total = lookup.total_samples();
    info!(
        "reordering {} into {} samples in {}",
        meta.path().display(),
        total,
        paths.data.display()
    );
    // the meta file is only written once the new files are complete
    remove_if_present(&paths.meta)?;
    let mut data = SampleFile::create(&paths.data, total, DATA_SAMPLE_BYTES)?;
    let mut flags = SampleFile::create(&paths.flags, total, FLAG_SAMPLE_BYTES)?;
    let capacity = reorder_buffer_bytes(options).max(1);
    debug!("reorder buffer of {capacity} bytes");

    let pol_count = meta.polarization_count();
    let mut skipped = 0;
    {
        let mut data_buffer = data.buffered(capacity);
        let mut flag_buffer = flags.buffered((capacity / 8).max(1));
        // the first time step of each region not written yet
        let mut next = vec![0_usize; lookup.regions().len()];
        let mut data_bytes = Vec::new();
        let mut flag_bytes = Vec::new();
        let progress = progress_bar(cols.len(), "reordering", options.draw_progress);
        for logical in &RowSelection::new(cols, meta) {
            progress.inc(1);
            let Some(region_index) = lookup.region_index(&logical.key) else {
                continue;
            };
            let region = lookup.regions()[region_index];
            let expected = (meta.channel_count(logical.key.band), pol_count);
            let data_cell = table.read_data(logical.row, &options.data_column)?;
            let flag_cell = table.read_flags(logical.row)?;
            if data_cell.dim() != expected || flag_cell.dim() != expected {
                warn!(
                    "row {} of {} has cell shape {:?}, expected {:?}, skipping",
                    logical.row,
                    logical.key,
                    data_cell.dim(),
                    expected
                );
                skipped += 1;
                continue;
            }
            let t = logical.time_index;
            pad_region(&mut flag_buffer, &region, next[region_index]..t)?;
            let first = region.samples_of(&(t..t + 1)).start;
            data_bytes.clear();
            encode_data(data_cell.iter().copied(), &mut data_bytes);
            data_buffer.write_at(first, &data_bytes)?;
            flag_bytes.clear();
            encode_flags(flag_cell.iter().copied(), &mut flag_bytes);
            flag_buffer.write_at(first, &flag_bytes)?;
            next[region_index] = next[region_index].max(t + 1);
        }
        progress.finish();
        for (region, &done) in lookup.regions().iter().zip(&next) {
            pad_region(&mut flag_buffer, region, done..region.timesteps)?;
        }
        data_buffer.finish()?;
        flag_buffer.finish()?;
    }
    data.sync()?;
    flags.sync()?;

    let source = canonical_source(meta.path());
    fs::write(&paths.meta, source.display().to_string()).map_err(|err| {
        IOError::TempFileCreate {
            path: paths.meta.display().to_string(),
            err,
            source_file: file!(),
            source_line: line!(),
        }
    })?;
    if skipped > 0 {
        warn!("{skipped} rows with an unexpected cell shape were left out of the reorder");
    }
    info!("reordered {} regions", lookup.regions().len());
    Ok(ReorderedFiles {
        data,
        flags,
        lookup,
    })
}

/// Write the samples of the time steps in `files` back over the rows of
/// `table`.
fn write_back<T: VisTable>(
    meta: &MsMetadata,
    table: &mut T,
    options: &ReaderOptions,
    cols: &ScalarColumns,
    files: &mut ReorderedFiles,
    write_data: bool,
    write_flags: bool,
) -> Result<usize, ReaderError> {
    let pol_count = meta.polarization_count();
    table.reopen_for_write()?;
    let progress = progress_bar(cols.len(), "writing back", options.draw_progress);
    let mut written = 0;
    for logical in &RowSelection::new(cols, meta) {
        progress.inc(1);
        let Some(region) = files.lookup.get(&logical.key).copied() else {
            continue;
        };
        let t = logical.time_index;
        let samples = region.samples_of(&(t..t + 1));
        let shape = (meta.channel_count(logical.key.band), pol_count);
        if write_flags {
            let bytes = files.flags.read_samples(samples.clone())?;
            let decoded = FlagSamples::new(&bytes);
            let cell = Array2::from_shape_fn(shape, |(c, p)| {
                decoded.get(c * pol_count + p).unwrap_or(true)
            });
            write_flag_cell(table, logical.row, cell.view())?;
        }
        if write_data {
            let bytes = files.data.read_samples(samples)?;
            let decoded = DataSamples::new(&bytes);
            let cell = Array2::from_shape_fn(shape, |(c, p)| {
                decoded.get(c * pol_count + p).unwrap_or_default()
            });
            write_data_cell(table, logical.row, &options.data_column, cell.view())?;
        }
        written += 1;
    }
    progress.finish();
    Ok(written)
}

/// Clear the flags of the time steps the table has a row for. The others
/// stay flagged.
fn unflag_present_rows(
    index: &BaselineRowIndex,
    requests: &[ReadRequest],
    results: &mut [BaselineResult],
) {
    for (request, result) in requests.iter().zip(results.iter_mut()) {
        for &(_, time_index) in index.rows(&request.key) {
            if !request.time_range.contains(&time_index) {
                continue;
            }
            let t = time_index - request.time_range.start;
            for flags in &mut result.flags {
                flags.row_mut(t).fill(false);
            }
        }
    }
}

/// A [`BaselineReader`] over a reordered copy of the table on disk.
///
/// Both flags and visibilities can be written. Writes go to the temporary
/// files, and reach the table on [`BaselineReader::write_to_source`] or
/// [`BaselineReader::close`].
#[derive(Debug)]
pub struct ReorderingReader<T: VisTable> {
    core: ReaderCore<T>,
    paths: TempFilePaths,
    state: ReorderState,
    owns_files: bool,
    files: Option<ReorderedFiles>,
    row_index: Option<BaselineRowIndex>,
    data_changed: bool,
    flags_changed: bool,
}

impl<T: VisTable> ReorderingReader<T> {
    /// Create a reader over `table`. Nothing is read until first use.
    pub fn new(table: T, options: ReaderOptions) -> Self {
        let token = options.temp_token.clone().unwrap_or_else(unique_token);
        let paths = TempFilePaths::new(&options.temp_dir, &token);
        Self {
            core: ReaderCore::new(table, options),
            paths,
            state: ReorderState::NotReordered,
            owns_files: false,
            files: None,
            row_index: None,
            data_changed: false,
            flags_changed: false,
        }
    }

    /// Where the temporary files are.
    pub fn paths(&self) -> &TempFilePaths {
        &self.paths
    }

    /// How far the reorder has got.
    pub fn state(&self) -> ReorderState {
        self.state
    }

    fn take_files(&mut self) -> Result<ReorderedFiles, ReaderError> {
        if let Some(files) = self.files.take() {
            return Ok(files);
        }
        let (meta, _, _) = self.core.split()?;
        let lookup = SequenceIndexLookupTable::new(meta);
        if files_match(&self.paths, meta.path(), &lookup) {
            info!("reusing reordered files {}", self.paths.data.display());
            let files = ReorderedFiles {
                data: SampleFile::open(&self.paths.data, DATA_SAMPLE_BYTES)?,
                flags: SampleFile::open(&self.paths.flags, FLAG_SAMPLE_BYTES)?,
                lookup,
            };
            self.state = ReorderState::Ready;
            return Ok(files);
        }

        trace!("start ReorderingReader reorder");
        let cols = self.core.take_columns()?;
        self.state = ReorderState::Reordering;
        self.owns_files = true;
        let (meta, table, options) = self.core.split()?;
        let files = reorder_table(meta, table, options, &cols, &self.paths, lookup)?;
        self.state = ReorderState::Ready;
        Ok(files)
    }

    fn take_row_index(&mut self) -> Result<BaselineRowIndex, ReaderError> {
        if let Some(index) = self.row_index.take() {
            return Ok(index);
        }
        let cols = self.core.take_columns()?;
        let (meta, _, options) = self.core.split()?;
        Ok(BaselineRowIndex::new(
            &RowSelection::new(&cols, meta),
            options.draw_progress,
        ))
    }

    fn read_batch(
        meta: &MsMetadata,
        options: &ReaderOptions,
        files: &mut ReorderedFiles,
        requests: &[ReadRequest],
    ) -> Result<Vec<BaselineResult>, ReaderError> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            let mut result = BaselineResult::for_request(meta, request)?;
            let Some(region) = files.lookup.get(&request.key).copied() else {
                results.push(result);
                continue;
            };
            let samples = region.samples_of(&request.time_range);
            let pol_count = result.polarization_count();
            let channel_count = result.channel_count();
            let index = |t: usize, c: usize, p: usize| (t * channel_count + c) * pol_count + p;
            if options.read_data {
                let bytes = files.data.read_samples(samples.clone())?;
                let decoded = DataSamples::new(&bytes);
                for t in 0..result.width() {
                    for c in 0..channel_count {
                        for p in 0..pol_count {
                            let vis = decoded.get(index(t, c, p)).unwrap_or_default();
                            result.real[p][(t, c)] = vis.re;
                            result.imag[p][(t, c)] = vis.im;
                        }
                    }
                }
            }
            if options.read_flags {
                let bytes = files.flags.read_samples(samples)?;
                let decoded = FlagSamples::new(&bytes);
                for t in 0..result.width() {
                    for c in 0..channel_count {
                        for p in 0..pol_count {
                            result.flags[p][(t, c)] = decoded.get(index(t, c, p)).unwrap_or(true);
                        }
                    }
                }
            }
            results.push(result);
        }
        Ok(results)
    }

    fn remove_temp_files(&self) {
        for path in self.paths.all() {
            match fs::remove_file(path) {
                Ok(()) => debug!("removed {}", path.display()),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => warn!("could not remove {}: {}", path.display(), e),
            }
        }
    }
}

impl<T: VisTable> BaselineReader for ReorderingReader<T> {
    fn mode(&self) -> ReadMode {
        ReadMode::Reordering
    }

    fn metadata(&mut self) -> Result<&MsMetadata, ReaderError> {
        self.core.metadata()
    }

    fn queue(&mut self) -> &mut RequestQueue {
        &mut self.core.queue
    }

    fn min_recommended_buffer_size(&self, _threads: usize) -> usize {
        1
    }

    fn max_recommended_buffer_size(&self, _threads: usize) -> usize {
        2
    }

    fn prepare(&mut self) -> Result<(), ReaderError> {
        let files = self.take_files()?;
        self.files = Some(files);
        Ok(())
    }

    fn perform_read_requests(&mut self) -> Result<(), ReaderError> {
        let files = self.take_files()?;
        let files = self.files.insert(files);
        let requests = self.core.queue.begin_read_batch()?;
        trace!("ReorderingReader reading {} requests", requests.len());
        let (meta, _, options) = self.core.split()?;
        let mut results = Self::read_batch(meta, options, files, &requests)?;
        let (read_flags, read_uvw_cells) = (options.read_flags, options.read_uvw);
        if !read_flags || read_uvw_cells {
            let index = self.take_row_index()?;
            let index = &*self.row_index.insert(index);
            if !read_flags {
                unflag_present_rows(index, &requests, &mut results);
            }
            if read_uvw_cells {
                read_uvw(&mut self.core.table, index, &requests, &mut results)?;
            }
        }
        self.core.queue.push_results(results);
        Ok(())
    }

    fn perform_flag_write_requests(&mut self) -> Result<(), ReaderError> {
        let files = self.take_files()?;
        let files = self.files.insert(files);
        let writes = self.core.queue.take_writes();
        let pol_count = self.core.metadata()?.polarization_count();
        let mut bytes = Vec::new();
        for write in &writes {
            let Some(region) = files.lookup.get(&write.key).copied() else {
                warn!("the table has no rows for {}, flag write dropped", write.key);
                continue;
            };
            let written = write.written_range();
            if written.is_empty() {
                continue;
            }
            let channel_count = write.flags.first().map_or(0, Array2::ncols);
            bytes.clear();
            encode_flags(
                written.clone().flat_map(|t| {
                    (0..channel_count).flat_map(move |c| {
                        (0..pol_count).map(move |p| write.mask(p)[(t - write.start, c)])
                    })
                }),
                &mut bytes,
            );
            files
                .flags
                .write_samples(region.samples_of(&written).start, &bytes)?;
            self.flags_changed = true;
        }
        Ok(())
    }

    fn perform_data_write_task(
        &mut self,
        real: Vec<Array2<f32>>,
        imag: Vec<Array2<f32>>,
        antenna1: usize,
        antenna2: usize,
        band: usize,
        sequence_id: usize,
    ) -> Result<(), ReaderError> {
        let key = BaselineKey::new(antenna1, antenna2, band, sequence_id);
        validate_data_write(self.core.metadata()?, &real, &imag, &key)?;
        let files = self.take_files()?;
        let files = self.files.insert(files);
        let Some(region) = files.lookup.get(&key).copied() else {
            warn!("the table has no rows for {key}, data write dropped");
            return Ok(());
        };
        let width = real.first().map_or(0, Array2::nrows);
        let channel_count = real.first().map_or(0, Array2::ncols);
        let pol_count = real.len();
        let mut bytes = Vec::with_capacity(width * channel_count * pol_count * 8);
        let (real, imag) = (&real, &imag);
        encode_data(
            (0..width).flat_map(|t| {
                (0..channel_count).flat_map(move |c| {
                    (0..pol_count).map(move |p| c32::new(real[p][(t, c)], imag[p][(t, c)]))
                })
            }),
            &mut bytes,
        );
        files.data.write_samples(region.offset, &bytes)?;
        self.data_changed = true;
        Ok(())
    }

    fn is_modified(&self) -> bool {
        self.data_changed || self.flags_changed
    }

    fn write_to_source(&mut self) -> Result<(), ReaderError> {
        if self.core.is_closed() {
            return Err(ReaderError::Closed);
        }
        if !self.is_modified() {
            return Ok(());
        }
        let Some(mut files) = self.files.take() else {
            return Ok(());
        };
        let (write_data, write_flags) = (self.data_changed, self.flags_changed);
        let result = self.core.take_columns().and_then(|cols| {
            let (meta, table, options) = self.core.split()?;
            write_back(
                meta,
                table,
                options,
                &cols,
                &mut files,
                write_data,
                write_flags,
            )
        });
        self.files = Some(files);
        let written = result?;
        info!(
            "wrote {}{}{} of {} rows back to {}",
            if write_data { "visibilities" } else { "" },
            if write_data && write_flags { " and " } else { "" },
            if write_flags { "flags" } else { "" },
            written,
            self.paths.data.display()
        );
        self.data_changed = false;
        self.flags_changed = false;
        Ok(())
    }

    fn close(&mut self) -> Result<(), ReaderError> {
        if self.core.is_closed() {
            return Ok(());
        }
        self.write_to_source()?;
        self.files = None;
        self.row_index = None;
        let partial = self.state == ReorderState::Reordering;
        if partial || (self.owns_files && !self.core.options.keep_temp_files) {
            self.remove_temp_files();
        }
        self.core.mark_closed();
        Ok(())
    }
}

impl<T: VisTable> Drop for ReorderingReader<T> {
    fn drop(&mut self) {
        if !self.core.is_closed() {
            if let Err(e) = self.close() {
                error!(
                    "closing the reordering reader failed, changes may not have been saved and {} was left behind: {e}",
                    self.paths.data.display()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        io::{MemTable, DEFAULT_DATA_COLUMN},
        reader::{FlagWriteRequest, ReaderOptionsBuilder},
    };
    use approx::assert_abs_diff_eq;
    use tempfile::tempdir;

    fn options(dir: &Path) -> ReaderOptions {
        ReaderOptionsBuilder::default()
            .mode(ReadMode::Reordering)
            .temp_dir(dir)
            .reorder_buffer_bytes(64)
            .build()
            .unwrap()
    }

    #[test]
    fn test_reorder_and_read() {
        let dir = tempdir().unwrap();
        let table = MemTable::synthetic("reorder.ms", 3, 4, 2, 5);
        let mut reader = ReorderingReader::new(table.clone(), options(dir.path()));
        assert_eq!(reader.state(), ReorderState::NotReordered);
        reader.prepare().unwrap();
        assert_eq!(reader.state(), ReorderState::Ready);
        assert_eq!(
            fs::metadata(&reader.paths().data).unwrap().len(),
            6 * 5 * 4 * 2 * DATA_SAMPLE_BYTES
        );

        reader.add_read_request_range(1, 1, 0, 0, 1..4).unwrap();
        reader.perform_read_requests().unwrap();
        let result = reader.next_result().unwrap();
        let mut reference = table.clone();
        for t in 0..3 {
            let row = (t + 1) * 6 + 3;
            let data = reference.read_data(row, DEFAULT_DATA_COLUMN).unwrap();
            for c in 0..4 {
                for p in 0..2 {
                    assert_abs_diff_eq!(result.real[p][(t, c)], data[(c, p)].re);
                    assert_abs_diff_eq!(result.imag[p][(t, c)], data[(c, p)].im);
                    assert!(!result.flags[p][(t, c)]);
                }
            }
            assert_eq!(result.uvw[t], reference.read_uvw(row).unwrap());
        }

        let paths = reader.paths().clone();
        reader.close().unwrap();
        for path in paths.all() {
            assert!(!path.exists());
        }
    }

    #[test]
    fn test_missing_time_steps_are_padded() {
        let dir = tempdir().unwrap();
        let table = MemTable::synthetic("reorder-pad.ms", 2, 2, 1, 5);
        let first = table.first_time();
        let step = crate::io::mem_table::SYNTHETIC_TIME_STEP;
        // baseline 0x1 has no rows at time steps 1 and 4
        table.retain_rows(|row| {
            !(row.antenna1 == 0
                && row.antenna2 == 1
                && (row.time == first + step || row.time == first + 4. * step))
        });
        let mut reader = ReorderingReader::new(table, options(dir.path()));
        reader.add_read_request(0, 1, 0, 0).unwrap();
        reader.perform_read_requests().unwrap();
        let result = reader.next_result().unwrap();
        assert_eq!(result.width(), 5);
        for t in 0..5 {
            let missing = t == 1 || t == 4;
            assert_eq!(result.flags[0][(t, 0)], missing);
            assert_eq!(result.flags[0][(t, 1)], missing);
            if missing {
                assert_eq!(result.visibility(0, t, 1), c32::new(0., 0.));
            } else {
                assert_ne!(result.visibility(0, t, 0), c32::new(0., 0.));
            }
        }
    }

    #[test]
    fn test_writes_reach_the_table() {
        let dir = tempdir().unwrap();
        let table = MemTable::synthetic("reorder-write.ms", 2, 3, 2, 4);
        let mut reader = ReorderingReader::new(table.clone(), options(dir.path()));
        let request = FlagWriteRequest::new(
            BaselineKey::new(0, 1, 0, 0),
            vec![
                Array2::from_elem((2, 3), true),
                Array2::from_elem((2, 3), false),
            ],
        )
        .with_start(2);
        reader.add_flag_write_request(request).unwrap();
        reader.perform_flag_write_requests().unwrap();
        let real = vec![Array2::from_elem((4, 3), 7.); 2];
        let imag = vec![Array2::from_elem((4, 3), -1.); 2];
        reader
            .perform_data_write_task(real, imag, 1, 1, 0, 0)
            .unwrap();
        assert!(reader.is_modified());

        reader.add_read_request(0, 1, 0, 0).unwrap();
        reader.perform_read_requests().unwrap();
        let result = reader.next_result().unwrap();
        assert!(result.flags[0][(3, 2)] && !result.flags[1][(3, 2)]);
        assert!(!result.flags[0][(1, 2)]);

        reader.close().unwrap();
        assert!(!reader.is_modified());
        // baseline 0x1 is row 1 of 3 per time step, 1x1 is row 2
        let row = table.row(3 * 3 + 1).unwrap();
        assert!(row.flags[(2, 0)] && !row.flags[(2, 1)]);
        assert!(table.row(4).unwrap().flags.iter().all(|&f| !f));
        for t in 0..4 {
            let row = table.row(t * 3 + 2).unwrap();
            assert!(row.data.iter().all(|&v| v == c32::new(7., -1.)));
        }
        assert_eq!(table.row(0).unwrap().data[(0, 0)], c32::new(0., 0.));
    }

    #[test]
    fn test_shared_token_reuses_files() {
        let dir = tempdir().unwrap();
        let table = MemTable::synthetic("reorder-reuse.ms", 2, 2, 2, 3);
        let shared = ReaderOptionsBuilder::default()
            .temp_dir(dir.path())
            .temp_token("shared")
            .keep_temp_files(true)
            .build()
            .unwrap();
        let mut first = ReorderingReader::new(table.clone(), shared.clone());
        first.prepare().unwrap();
        first.close().unwrap();
        let reads = table.data_reads();
        assert_eq!(reads, 9);
        assert!(first.paths().meta.exists());

        let mut second = ReorderingReader::new(table.clone(), shared);
        second.add_read_request(0, 1, 0, 0).unwrap();
        second.perform_read_requests().unwrap();
        assert_eq!(table.data_reads(), reads);
        let result = second.next_result().unwrap();
        assert_eq!(result.visibility(1, 2, 1), c32::new(7.25, 0.));
        second.close().unwrap();
        // files it didn't make are left alone
        assert!(second.paths().data.exists());

        // a different table with the same token is reordered again
        let other = MemTable::synthetic("reorder-other.ms", 2, 2, 2, 3);
        let options = ReaderOptionsBuilder::default()
            .temp_dir(dir.path())
            .temp_token("shared")
            .build()
            .unwrap();
        let mut third = ReorderingReader::new(other.clone(), options);
        third.prepare().unwrap();
        assert_eq!(other.data_reads(), 9);
        third.close().unwrap();
        assert!(!third.paths().data.exists());
    }

    #[test]
    fn test_failed_reorder_removes_partial_files() {
        let dir = tempdir().unwrap();
        let table = MemTable::synthetic("reorder-failed.ms", 2, 2, 2, 3);
        let options = ReaderOptionsBuilder::default()
            .temp_dir(dir.path())
            .temp_token("failed")
            .keep_temp_files(true)
            .data_column("MISSING")
            .build()
            .unwrap();
        let mut reader = ReorderingReader::new(table, options);
        assert!(reader.prepare().is_err());
        assert_eq!(reader.state(), ReorderState::Reordering);
        assert!(reader.paths().data.exists() && reader.paths().flags.exists());

        reader.close().unwrap();
        for path in reader.paths().all() {
            assert!(!path.exists(), "{} left behind", path.display());
        }
    }

    #[test]
    fn test_stale_meta_is_removed_before_reordering() {
        let dir = tempdir().unwrap();
        let keep = |column: &str| {
            ReaderOptionsBuilder::default()
                .temp_dir(dir.path())
                .temp_token("stale")
                .keep_temp_files(true)
                .data_column(column)
                .build()
                .unwrap()
        };
        let small = MemTable::synthetic("reorder-stale.ms", 2, 2, 2, 3);
        let mut first = ReorderingReader::new(small, keep(DEFAULT_DATA_COLUMN));
        first.prepare().unwrap();
        first.close().unwrap();
        assert!(first.paths().meta.exists());

        // same source path, more baselines
        let grown = MemTable::synthetic("reorder-stale.ms", 3, 2, 2, 3);
        let mut second = ReorderingReader::new(grown, keep("MISSING"));
        assert!(second.prepare().is_err());
        // the sample files already have the sizes of the grown table
        assert_eq!(
            fs::metadata(&second.paths().flags).unwrap().len(),
            6 * 3 * 2 * 2 * FLAG_SAMPLE_BYTES
        );
        assert!(!second.paths().meta.exists());
        second.close().unwrap();
        assert!(!second.paths().data.exists());
    }

    #[test]
    fn test_unique_tokens() {
        assert_ne!(unique_token(), unique_token());
        let paths = TempFilePaths::new(Path::new("/tmp"), "tok");
        assert_eq!(paths.flags, PathBuf::from("/tmp/tok-flag.tmp"));
        let options = ReaderOptionsBuilder::default()
            .memory_limit(1 << 40)
            .build()
            .unwrap();
        assert_eq!(reorder_buffer_bytes(&options), MAX_REORDER_BUFFER_BYTES);
        let options = ReaderOptionsBuilder::default()
            .memory_limit(1000)
            .build()
            .unwrap();
        assert_eq!(reorder_buffer_bytes(&options), 100);
    }
}
