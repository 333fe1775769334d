//! Serve requests by reading the needed rows straight from the table.
//!
//! The first I/O call scans the table once and records the rows of every
//! baseline, not their data. Each batch of requests then becomes a single
//! pass over the rows it needs, in row order.

use std::collections::BTreeMap;

use itertools::Itertools;
use log::{debug, trace, warn};
use marlu::ndarray::Array2;

use super::{
    progress_bar, write_flag_cell, BaselineReader, BaselineResult, ReadMode, ReadRequest,
    ReaderCore, ReaderOptions, RequestQueue, RowCells,
};
use crate::{
    error::ReaderError,
    io::{error::IOError, VisTable},
    metadata::{BaselineKey, MsMetadata},
    selection::RowSelection,
};

/// The rows of each baseline, with the time index of each row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BaselineRowIndex {
    rows: BTreeMap<BaselineKey, Vec<(usize, usize)>>,
}

impl BaselineRowIndex {
    /// Index every row of `selection`.
    pub fn new(selection: &RowSelection, draw_progress: bool) -> Self {
        let mut rows: BTreeMap<_, Vec<_>> = BTreeMap::new();
        let mut iter = selection.iter();
        let progress = progress_bar(iter.size_hint().1.unwrap_or(0), "indexing rows", draw_progress);
        for logical in iter.by_ref() {
            rows.entry(logical.key)
                .or_default()
                .push((logical.row, logical.time_index));
            progress.inc(1);
        }
        progress.finish();
        debug!(
            "indexed {} baselines, skipped {} rows without an observation time",
            rows.len(),
            iter.skipped()
        );
        Self { rows }
    }

    /// The `(row, time index)` pairs of `key`, in row order.
    pub fn rows(&self, key: &BaselineKey) -> &[(usize, usize)] {
        self.rows.get(key).map_or(&[], Vec::as_slice)
    }

    /// The number of baselines indexed.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether nothing was indexed.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// The `(row, time index, request index)` triples needed to serve
    /// `requests`, in row order.
    fn plan(&self, requests: &[ReadRequest]) -> Vec<(usize, usize, usize)> {
        requests
            .iter()
            .enumerate()
            .flat_map(|(request_index, request)| {
                self.rows(&request.key)
                    .iter()
                    .filter(|(_, time_index)| request.time_range.contains(time_index))
                    .map(move |&(row, time_index)| (row, time_index, request_index))
            })
            .sorted_unstable()
            .collect()
    }
}

/// Read only the UVW of the rows that serve `requests` into `results`, in
/// one pass.
pub(crate) fn read_uvw<T: VisTable>(
    table: &mut T,
    index: &BaselineRowIndex,
    requests: &[ReadRequest],
    results: &mut [BaselineResult],
) -> Result<(), IOError> {
    let mut last = None;
    for (row, time_index, request_index) in index.plan(requests) {
        let uvw = match last {
            Some((last_row, uvw)) if last_row == row => uvw,
            _ => table.read_uvw(row)?,
        };
        last = Some((row, uvw));
        let result = &mut results[request_index];
        result.uvw[time_index - result.time_range.start] = uvw;
    }
    Ok(())
}

/// A [`BaselineReader`] that keeps nothing but a row index in memory.
///
/// Visibilities can't be written, only flags.
#[derive(Debug)]
pub struct DirectReader<T: VisTable> {
    core: ReaderCore<T>,
    index: Option<BaselineRowIndex>,
}

impl<T: VisTable> DirectReader<T> {
    /// Create a reader over `table`. Nothing is read until first use.
    pub fn new(table: T, options: ReaderOptions) -> Self {
        Self {
            core: ReaderCore::new(table, options),
            index: None,
        }
    }

    fn take_index(&mut self) -> Result<BaselineRowIndex, ReaderError> {
        if let Some(index) = self.index.take() {
            return Ok(index);
        }
        trace!("start DirectReader index scan");
        let cols = self.core.take_columns()?;
        let (meta, _, options) = self.core.split()?;
        Ok(BaselineRowIndex::new(
            &RowSelection::new(&cols, meta),
            options.draw_progress,
        ))
    }

    fn read_batch(
        meta: &MsMetadata,
        table: &mut T,
        options: &ReaderOptions,
        index: &BaselineRowIndex,
        requests: &[ReadRequest],
    ) -> Result<Vec<BaselineResult>, ReaderError> {
        let mut results = requests
            .iter()
            .map(|request| BaselineResult::for_request(meta, request))
            .collect::<Result<Vec<_>, _>>()?;
        let mut last: Option<(usize, RowCells)> = None;
        for (row, time_index, request_index) in index.plan(requests) {
            let cells = match last.take() {
                Some((last_row, cells)) if last_row == row => cells,
                _ => RowCells::read(table, options, row)?,
            };
            let result = &mut results[request_index];
            let t = time_index - result.time_range.start;
            if !cells.fill(result, t) {
                warn!(
                    "row {row} of {} has cell shape {:?}, expected {} channels and {} polarizations, skipping",
                    result.key,
                    cells.shape(),
                    result.channel_count(),
                    result.polarization_count()
                );
            }
            last = Some((row, cells));
        }
        Ok(results)
    }
}

impl<T: VisTable> BaselineReader for DirectReader<T> {
    fn mode(&self) -> ReadMode {
        ReadMode::Direct
    }

    fn metadata(&mut self) -> Result<&MsMetadata, ReaderError> {
        self.core.metadata()
    }

    fn queue(&mut self) -> &mut RequestQueue {
        &mut self.core.queue
    }

    fn prepare(&mut self) -> Result<(), ReaderError> {
        let index = self.take_index()?;
        self.index = Some(index);
        Ok(())
    }

    fn perform_read_requests(&mut self) -> Result<(), ReaderError> {
        let index = self.take_index()?;
        let index = &*self.index.insert(index);
        let requests = self.core.queue.begin_read_batch()?;
        trace!("DirectReader reading {} requests", requests.len());
        let (meta, table, options) = self.core.split()?;
        let results = Self::read_batch(meta, table, options, index, &requests)?;
        self.core.queue.push_results(results);
        Ok(())
    }

    fn perform_flag_write_requests(&mut self) -> Result<(), ReaderError> {
        let index = self.take_index()?;
        let index = &*self.index.insert(index);
        let writes = self.core.queue.take_writes();
        if writes.is_empty() {
            return Ok(());
        }
        let (meta, table, _) = self.core.split()?;
        let pol_count = meta.polarization_count();
        let mut plan = Vec::new();
        for (write_index, write) in writes.iter().enumerate() {
            let rows = index.rows(&write.key);
            if rows.is_empty() {
                warn!("the table has no rows for {}, flag write dropped", write.key);
            }
            let written = write.written_range();
            plan.extend(
                rows.iter()
                    .filter(|(_, time_index)| written.contains(time_index))
                    .map(|&(row, time_index)| (row, time_index, write_index)),
            );
        }
        plan.sort_unstable();
        trace!("DirectReader writing flags of {} rows", plan.len());
        table.reopen_for_write()?;
        for (row, time_index, write_index) in plan {
            let cell: Array2<bool> = writes[write_index].cell(time_index, pol_count);
            write_flag_cell(table, row, cell.view())?;
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
        Err(ReaderError::DataWriteUnsupported { reader: "direct" })
    }

    fn is_modified(&self) -> bool {
        false
    }

    fn write_to_source(&mut self) -> Result<(), ReaderError> {
        if self.core.is_closed() {
            return Err(ReaderError::Closed);
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), ReaderError> {
        self.core.mark_closed();
        self.index = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        io::{MemTable, DEFAULT_DATA_COLUMN},
        reader::FlagWriteRequest,
    };
    use marlu::c32;

    #[test]
    fn test_read_matches_table() {
        let table = MemTable::synthetic("direct.ms", 3, 4, 2, 5);
        let mut reader = DirectReader::new(table.clone(), ReaderOptions::default());
        reader.add_read_request(1, 2, 0, 0).unwrap();
        reader.add_read_request_range(0, 0, 0, 0, 1..3).unwrap();
        reader.perform_read_requests().unwrap();

        let result = reader.next_result().unwrap();
        assert_eq!(result.width(), 5);
        let mut reference = table.clone();
        for t in 0..5 {
            // baseline 1x2 is the 5th of 6 baselines per time step
            let row = t * 6 + 4;
            let data = reference.read_data(row, DEFAULT_DATA_COLUMN).unwrap();
            for c in 0..4 {
                for p in 0..2 {
                    assert_eq!(result.visibility(p, t, c), data[(c, p)]);
                    assert!(!result.flags[p][(t, c)]);
                }
            }
            assert_eq!(result.uvw[t], reference.read_uvw(row).unwrap());
        }

        let result = reader.next_result().unwrap();
        assert_eq!(result.time_range, 1..3);
        assert_eq!(result.visibility(0, 0, 0), c32::new(6., 0.));
        assert!(matches!(reader.next_result(), Err(ReaderError::NoResults)));
    }

    #[test]
    fn test_missing_rows_are_flagged() {
        let table = MemTable::synthetic("direct-missing.ms", 2, 2, 1, 4);
        let first = table.first_time();
        table.retain_rows(|row| !(row.antenna2 == 1 && row.antenna1 == 0 && row.time > first));
        let mut reader = DirectReader::new(table, ReaderOptions::default());
        reader.add_read_request(0, 1, 0, 0).unwrap();
        reader.perform_read_requests().unwrap();
        let result = reader.next_result().unwrap();
        assert_eq!(result.width(), 4);
        assert!(!result.flags[0][(0, 1)]);
        for t in 1..4 {
            assert!(result.flags[0][(t, 0)] && result.flags[0][(t, 1)]);
            assert_eq!(result.visibility(0, t, 1), c32::new(0., 0.));
        }
    }

    #[test]
    fn test_flag_write_respects_borders() {
        let table = MemTable::synthetic("direct-write.ms", 2, 3, 2, 6);
        let mut reader = DirectReader::new(table.clone(), ReaderOptions::default());
        let request = FlagWriteRequest::new(
            BaselineKey::new(0, 1, 0, 0),
            vec![Array2::from_elem((4, 3), true)],
        )
        .with_start(1)
        .with_borders(1, 1);
        reader.add_flag_write_request(request).unwrap();
        reader.perform_flag_write_requests().unwrap();
        assert!(!reader.is_modified());

        let flagged: Vec<bool> = (0..6)
            .map(|t| table.row(t * 3 + 1).unwrap().flags.iter().all(|&f| f))
            .collect();
        assert_eq!(flagged, vec![false, false, true, true, false, false]);
    }

    #[test]
    fn test_usage_errors() {
        let table = MemTable::synthetic("direct-usage.ms", 2, 2, 2, 3);
        let mut reader = DirectReader::new(table, ReaderOptions::default());
        assert!(matches!(
            reader.add_write_task(vec![Array2::from_elem((3, 2), true); 3], 0, 1, 0, 0),
            Err(ReaderError::PolarizationMismatch {
                expected: 2,
                received: 3
            })
        ));
        assert!(matches!(
            reader.add_write_task(vec![Array2::from_elem((3, 5), true)], 0, 1, 0, 0),
            Err(ReaderError::BadArrayShape { .. })
        ));
        assert!(matches!(
            reader.perform_data_write_task(vec![], vec![], 0, 1, 0, 0),
            Err(ReaderError::DataWriteUnsupported { reader: "direct" })
        ));
        reader.add_read_request(0, 1, 0, 0).unwrap();
        reader.perform_read_requests().unwrap();
        assert!(matches!(
            reader.perform_read_requests(),
            Err(ReaderError::UnconsumedResults { pending: 1 })
        ));
        reader.close().unwrap();
        assert!(matches!(
            reader.add_read_request(0, 1, 0, 0),
            Err(ReaderError::Closed)
        ));
    }
}
