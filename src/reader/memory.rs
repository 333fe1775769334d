//! Serve requests from a copy of the whole table held in memory.

use std::collections::BTreeMap;

use log::{debug, error, info, trace, warn};
use marlu::ndarray::{s, Array2};

use super::{
    progress_bar, write_flag_cell, BaselineReader, BaselineResult, ReadMode, ReadRequest,
    ReaderCore, ReaderOptions, RequestQueue, RowCells,
};
use crate::{
    error::ReaderError,
    io::{ScalarColumns, VisTable},
    metadata::{BaselineKey, MsMetadata},
    selection::RowSelection,
    selector,
};

/// A [`BaselineReader`] that loads every baseline of the table on first use.
///
/// Flag writes only change the in-memory copy until the reader is written
/// back with [`BaselineReader::write_to_source`] or closed. Visibilities can't
/// be written.
#[derive(Debug)]
pub struct MemoryReader<T: VisTable> {
    core: ReaderCore<T>,
    baselines: Option<BTreeMap<BaselineKey, BaselineResult>>,
    // time steps of each baseline that a row was loaded into
    loaded_steps: BTreeMap<BaselineKey, Vec<bool>>,
    flags_changed: bool,
}

impl<T: VisTable> MemoryReader<T> {
    /// Create a reader over `table`. Nothing is read until first use.
    pub fn new(table: T, options: ReaderOptions) -> Self {
        Self {
            core: ReaderCore::new(table, options),
            baselines: None,
            loaded_steps: BTreeMap::new(),
            flags_changed: false,
        }
    }

    /// Whether the system has room for `required_bytes` of table data, see
    /// [`selector::is_enough_memory_available`].
    pub fn is_enough_memory_available(required_bytes: u64) -> bool {
        selector::is_enough_memory_available(required_bytes, selector::total_memory())
    }

    fn take_baselines(&mut self) -> Result<BTreeMap<BaselineKey, BaselineResult>, ReaderError> {
        if let Some(baselines) = self.baselines.take() {
            return Ok(baselines);
        }
        trace!("start MemoryReader load");
        let cols = self.core.take_columns()?;
        let (meta, table, options) = self.core.split()?;
        // flags are always loaded, they are written back for every row
        let load_options = ReaderOptions {
            read_flags: true,
            ..options.clone()
        };
        let mut baselines = BTreeMap::new();
        for sequence in meta.sequences() {
            let request = ReadRequest {
                key: sequence.key,
                time_range: 0..meta.timestep_count(sequence.key.sequence_id),
            };
            baselines.insert(sequence.key, BaselineResult::for_request(meta, &request)?);
        }

        let selection = RowSelection::new(&cols, meta);
        let progress = progress_bar(cols.len(), "loading rows", options.draw_progress);
        let mut loaded = 0;
        let mut loaded_steps: BTreeMap<BaselineKey, Vec<bool>> = BTreeMap::new();
        for logical in &selection {
            progress.inc(1);
            let Some(result) = baselines.get_mut(&logical.key) else {
                continue;
            };
            let cells = RowCells::read(table, &load_options, logical.row)?;
            if cells.fill(result, logical.time_index) {
                loaded_steps
                    .entry(logical.key)
                    .or_insert_with(|| vec![false; result.width()])[logical.time_index] = true;
                loaded += 1;
            } else {
                warn!(
                    "row {} of {} has cell shape {:?}, expected {} channels and {} polarizations, skipping",
                    logical.row,
                    logical.key,
                    cells.shape(),
                    result.channel_count(),
                    result.polarization_count()
                );
            }
        }
        progress.finish();
        info!(
            "loaded {} rows of {} baselines from {}",
            loaded,
            baselines.len(),
            meta.path().display()
        );
        self.loaded_steps = loaded_steps;
        Ok(baselines)
    }

    /// `stored` sliced to `request`, reporting every loaded time step
    /// unflagged when flags aren't read.
    fn serve(&self, stored: &BaselineResult, request: &ReadRequest) -> BaselineResult {
        let mut result = stored.slice(request.time_range.clone());
        if !self.core.options.read_flags {
            let loaded = self.loaded_steps.get(&request.key).map_or(&[][..], Vec::as_slice);
            for (t, time_index) in request.time_range.clone().enumerate() {
                let present = loaded.get(time_index).copied().unwrap_or(false);
                for flags in &mut result.flags {
                    flags.row_mut(t).fill(!present);
                }
            }
        }
        result
    }

    fn write_flags_back(
        meta: &MsMetadata,
        table: &mut T,
        options: &ReaderOptions,
        cols: &ScalarColumns,
        baselines: &BTreeMap<BaselineKey, BaselineResult>,
    ) -> Result<usize, ReaderError> {
        let pol_count = meta.polarization_count();
        table.reopen_for_write()?;
        let progress = progress_bar(cols.len(), "writing flags", options.draw_progress);
        let mut written = 0;
        for logical in &RowSelection::new(cols, meta) {
            progress.inc(1);
            let Some(result) = baselines.get(&logical.key) else {
                continue;
            };
            let cell = Array2::from_shape_fn((result.channel_count(), pol_count), |(c, p)| {
                result.flags[p][(logical.time_index, c)]
            });
            write_flag_cell(table, logical.row, cell.view())?;
            written += 1;
        }
        progress.finish();
        Ok(written)
    }
}

impl<T: VisTable> BaselineReader for MemoryReader<T> {
    fn mode(&self) -> ReadMode {
        ReadMode::Memory
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
        let baselines = self.take_baselines()?;
        self.baselines = Some(baselines);
        Ok(())
    }

    fn perform_read_requests(&mut self) -> Result<(), ReaderError> {
        let baselines = self.take_baselines()?;
        self.baselines = Some(baselines);
        let requests = self.core.queue.begin_read_batch()?;
        trace!("MemoryReader reading {} requests", requests.len());
        let mut results = Vec::with_capacity(requests.len());
        for request in &requests {
            let stored = self.baselines.as_ref().and_then(|b| b.get(&request.key));
            results.push(match stored {
                Some(stored) => self.serve(stored, request),
                None => BaselineResult::for_request(self.core.metadata()?, request)?,
            });
        }
        self.core.queue.push_results(results);
        Ok(())
    }

    fn perform_flag_write_requests(&mut self) -> Result<(), ReaderError> {
        let baselines = self.take_baselines()?;
        let baselines = self.baselines.insert(baselines);
        let writes = self.core.queue.take_writes();
        for write in &writes {
            let Some(stored) = baselines.get_mut(&write.key) else {
                warn!("the table has no rows for {}, flag write dropped", write.key);
                continue;
            };
            let written = write.written_range();
            let source = written.start - write.start..written.end - write.start;
            for (pol, flags) in stored.flags.iter_mut().enumerate() {
                flags
                    .slice_mut(s![written.clone(), ..])
                    .assign(&write.mask(pol).slice(s![source.clone(), ..]));
            }
            self.flags_changed = true;
        }
        Ok(())
    }

    fn perform_data_write_task(
        &mut self,
        _real: Vec<Array2<f32>>,
        _imag: Vec<Array2<f32>>,
        _antenna1: usize,
        _antenna2: usize,
        _band: usize,
        _sequence_id: usize,
    ) -> Result<(), ReaderError> {
        Err(ReaderError::DataWriteUnsupported { reader: "memory" })
    }

    fn is_modified(&self) -> bool {
        self.flags_changed
    }

    fn write_to_source(&mut self) -> Result<(), ReaderError> {
        if self.core.is_closed() {
            return Err(ReaderError::Closed);
        }
        if !self.flags_changed {
            return Ok(());
        }
        let Some(baselines) = self.baselines.take() else {
            return Ok(());
        };
        let cols = self.core.take_columns()?;
        let result = self
            .core
            .split()
            .and_then(|(meta, table, options)| {
                Self::write_flags_back(meta, table, options, &cols, &baselines)
            });
        self.baselines = Some(baselines);
        let written = result?;
        debug!("wrote flags of {written} rows back to the table");
        self.flags_changed = false;
        Ok(())
    }

    fn close(&mut self) -> Result<(), ReaderError> {
        if self.core.is_closed() {
            return Ok(());
        }
        self.write_to_source()?;
        self.core.mark_closed();
        self.baselines = None;
        Ok(())
    }
}

impl<T: VisTable> Drop for MemoryReader<T> {
    fn drop(&mut self) {
        if !self.core.is_closed() {
            if let Err(e) = self.close() {
                error!("closing the memory reader failed, flags may not have been saved: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        io::MemTable,
        reader::{FlagWriteRequest, ReaderOptionsBuilder},
    };
    use marlu::c32;

    #[test]
    fn test_reads_slices_of_loaded_baselines() {
        let table = MemTable::synthetic("memory.ms", 3, 4, 2, 5);
        let mut reader = MemoryReader::new(table.clone(), ReaderOptions::default());
        reader.prepare().unwrap();
        let reads_after_load = table.data_reads();
        assert_eq!(reads_after_load, 6 * 5);

        reader.add_read_request_range(0, 2, 0, 0, 2..4).unwrap();
        reader.add_read_request(2, 2, 0, 0).unwrap();
        reader.perform_read_requests().unwrap();
        assert_eq!(table.data_reads(), reads_after_load);

        let result = reader.next_result().unwrap();
        assert_eq!(result.time_range, 2..4);
        // baseline 0x2 is row 2 of each time step
        assert_eq!(result.visibility(1, 1, 3), c32::new(3. * 6. + 2. + 0.75, -2.));
        let result = reader.next_result().unwrap();
        assert_eq!(result.width(), 5);
        assert!(result.flags.iter().all(|f| f.iter().all(|&x| !x)));
    }

    #[test]
    fn test_flag_writes_are_deferred() {
        let table = MemTable::synthetic("memory-write.ms", 3, 4, 2, 5);
        let mut reader = MemoryReader::new(table.clone(), ReaderOptions::default());
        let mut mask = Array2::from_elem((5, 4), false);
        mask[(3, 1)] = true;
        reader.add_write_task(vec![mask], 1, 2, 0, 0).unwrap();
        reader.perform_flag_write_requests().unwrap();
        assert!(reader.is_modified());

        // visible to reads, not yet in the table
        reader.add_read_request(1, 2, 0, 0).unwrap();
        reader.perform_read_requests().unwrap();
        let result = reader.next_result().unwrap();
        assert!(result.flags[0][(3, 1)] && result.flags[1][(3, 1)]);
        assert!(!result.flags[0][(3, 0)]);
        assert!(table.row(3 * 6 + 4).unwrap().flags.iter().all(|&f| !f));

        reader.close().unwrap();
        assert!(!reader.is_modified());
        let row = table.row(3 * 6 + 4).unwrap();
        assert!(row.flags[(1, 0)] && row.flags[(1, 1)]);
        assert!(!row.flags[(0, 0)]);
        assert!(table.row(2 * 6 + 4).unwrap().flags.iter().all(|&f| !f));
    }

    #[test]
    fn test_drop_writes_back() {
        let table = MemTable::synthetic("memory-drop.ms", 3, 4, 2, 5);
        {
            let mut reader = MemoryReader::new(table.clone(), ReaderOptions::default());
            reader
                .add_write_task(vec![Array2::from_elem((5, 4), true)], 0, 0, 0, 0)
                .unwrap();
            reader.perform_flag_write_requests().unwrap();
        }
        assert!(table.row(6).unwrap().flags.iter().all(|&f| f));
    }

    #[test]
    fn test_absent_baseline() {
        let table = MemTable::synthetic("memory-absent.ms", 3, 2, 1, 3);
        table.retain_rows(|row| !(row.antenna1 == 0 && row.antenna2 == 1));
        let mut reader = MemoryReader::new(table, ReaderOptions::default());
        reader.add_read_request(0, 1, 0, 0).unwrap();
        reader.perform_read_requests().unwrap();
        let result = reader.next_result().unwrap();
        assert_eq!(result.width(), 3);
        assert!(result.flags[0].iter().all(|&f| f));

        reader
            .add_flag_write_request(FlagWriteRequest::new(
                BaselineKey::new(0, 1, 0, 0),
                vec![Array2::from_elem((3, 2), false)],
            ))
            .unwrap();
        reader.perform_flag_write_requests().unwrap();
        assert!(!reader.is_modified());
        assert!(matches!(
            reader.perform_data_write_task(vec![], vec![], 0, 1, 0, 0),
            Err(ReaderError::DataWriteUnsupported { reader: "memory" })
        ));
    }

    #[test]
    fn test_unread_flags_survive_write_back() {
        let table = MemTable::synthetic("memory-unread.ms", 3, 4, 2, 5);
        // baseline 0x2 at the first time step
        let mut handle = table.clone();
        handle.reopen_for_write().unwrap();
        handle
            .write_flags(2, Array2::from_elem((4, 2), true).view())
            .unwrap();

        let options = ReaderOptionsBuilder::default()
            .read_flags(false)
            .build()
            .unwrap();
        let mut reader = MemoryReader::new(table.clone(), options);
        reader.add_read_request(0, 2, 0, 0).unwrap();
        reader.perform_read_requests().unwrap();
        let result = reader.next_result().unwrap();
        assert!(result.flags.iter().all(|f| f.iter().all(|&x| !x)));

        reader
            .add_write_task(vec![Array2::from_elem((5, 4), false); 2], 1, 1, 0, 0)
            .unwrap();
        reader.perform_flag_write_requests().unwrap();
        reader.close().unwrap();

        assert!(table.row(2).unwrap().flags.iter().all(|&f| f));
        assert!(table.row(6 + 2).unwrap().flags.iter().all(|&f| !f));
    }

    #[test]
    fn test_read_only_table_fails_on_close() {
        let table = MemTable::synthetic("memory-readonly.ms", 2, 2, 1, 2);
        table.set_read_only(true);
        let mut reader = MemoryReader::new(table, ReaderOptions::default());
        reader
            .add_write_task(vec![Array2::from_elem((2, 2), true)], 0, 1, 0, 0)
            .unwrap();
        reader.perform_flag_write_requests().unwrap();
        assert!(reader.close().is_err());
        assert!(reader.is_modified());
        reader.flags_changed = false;
    }
}
