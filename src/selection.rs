//! Mapping table rows to logical coordinates.
//!
//! Every backend walks the main table in native row order and needs to know,
//! for each row, which baseline time series it belongs to and where in that
//! series it sits. [`RowSelection`] is the single place that works this out,
//! so the offsets the backends compute always agree with each other.
//!
//! A new sequence starts whenever the field changes between consecutive rows.
//! Rows whose timestamp is not one of the sequence's observation times (for
//! example because an interval was selected) have no logical coordinate and
//! are not yielded.
//!
//! # Examples
//!
//! ```rust
//! use msreorder::{
//!     io::{MemTable, VisTable},
//!     metadata::{MsMetadata, TimeInterval},
//!     selection::RowSelection,
//! };
//!
//! let mut table = MemTable::synthetic("example.ms", 2, 4, 2, 3);
//! let cols = table.scalar_columns().unwrap();
//! let meta = MsMetadata::from_columns(&mut table, &cols, &TimeInterval::default()).unwrap();
//!
//! let selection = RowSelection::new(&cols, &meta);
//! let mut rows = selection.iter();
//! let first = rows.next().unwrap();
//! assert_eq!(first.row, 0);
//! assert_eq!(first.time_index, 0);
//! assert_eq!(rows.count(), 3 * 3 - 1);
//! ```

use crate::{
    io::ScalarColumns,
    metadata::{band_of, BaselineKey, MsMetadata},
};

/// Tracks the sequence id while walking rows in native order.
#[derive(Debug, Default, Clone)]
pub struct SequenceTracker {
    prev_field: Option<usize>,
    started: usize,
}

impl SequenceTracker {
    /// Feed the field id of the next row. Returns the row's sequence id, and
    /// whether this row starts a new sequence.
    pub fn advance(&mut self, field_id: usize) -> (usize, bool) {
        let is_new = self.prev_field != Some(field_id);
        if is_new {
            self.prev_field = Some(field_id);
            self.started += 1;
        }
        (self.started - 1, is_new)
    }
}

/// A row of the main table and its logical coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogicalRow {
    /// Row number in the main table
    pub row: usize,
    /// The time series the row belongs to
    pub key: BaselineKey,
    /// Position of the row's timestamp in its sequence
    pub time_index: usize,
}

/// Maps the rows described by a set of scalar columns onto the catalog.
#[derive(Debug, Clone, Copy)]
pub struct RowSelection<'a> {
    cols: &'a ScalarColumns,
    meta: &'a MsMetadata,
}

impl<'a> RowSelection<'a> {
    /// Create a selection over `cols`, which must have been read from the same
    /// table as `meta`.
    pub fn new(cols: &'a ScalarColumns, meta: &'a MsMetadata) -> Self {
        Self { cols, meta }
    }

    /// Iterate the rows that have a logical coordinate, in row order.
    pub fn iter(&self) -> LogicalRows<'a> {
        LogicalRows {
            cols: self.cols,
            meta: self.meta,
            tracker: SequenceTracker::default(),
            row: 0,
            skipped: 0,
        }
    }
}

impl<'a> IntoIterator for &RowSelection<'a> {
    type Item = LogicalRow;
    type IntoIter = LogicalRows<'a>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over [`LogicalRow`]s, see [`RowSelection::iter`].
#[derive(Debug, Clone)]
pub struct LogicalRows<'a> {
    cols: &'a ScalarColumns,
    meta: &'a MsMetadata,
    tracker: SequenceTracker,
    row: usize,
    skipped: usize,
}

impl LogicalRows<'_> {
    /// How many rows have been passed over so far because their timestamp is
    /// not an observation time of their sequence.
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

impl Iterator for LogicalRows<'_> {
    type Item = LogicalRow;

    fn next(&mut self) -> Option<Self::Item> {
        while self.row < self.cols.len() {
            let row = self.row;
            self.row += 1;
            let (sequence_id, _) = self.tracker.advance(self.cols.field_id[row]);
            let time_index = self
                .meta
                .observation_times(sequence_id)
                .and_then(|times| times.index_of(self.cols.time[row]));
            let Some(time_index) = time_index else {
                self.skipped += 1;
                continue;
            };
            let key = BaselineKey::new(
                self.cols.antenna1[row],
                self.cols.antenna2[row],
                band_of(self.meta.data_desc_to_band(), self.cols.data_desc_id[row]),
                sequence_id,
            );
            return Some(LogicalRow {
                row,
                key,
                time_index,
            });
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.cols.len() - self.row))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        io::{MemTable, VisTable},
        metadata::TimeInterval,
    };

    #[test]
    fn test_sequence_tracker() {
        let mut tracker = SequenceTracker::default();
        assert_eq!(tracker.advance(3), (0, true));
        assert_eq!(tracker.advance(3), (0, false));
        assert_eq!(tracker.advance(1), (1, true));
        assert_eq!(tracker.advance(3), (2, true));
    }

    #[test]
    fn test_rows_in_order() {
        let mut table = MemTable::synthetic("rows.ms", 3, 2, 1, 4);
        let cols = table.scalar_columns().unwrap();
        let meta = MsMetadata::from_columns(&mut table, &cols, &TimeInterval::default()).unwrap();
        let selection = RowSelection::new(&cols, &meta);
        let rows: Vec<_> = selection.iter().collect();
        assert_eq!(rows.len(), cols.len());
        for (expected_row, logical) in rows.iter().enumerate() {
            assert_eq!(logical.row, expected_row);
            assert_eq!(logical.time_index, expected_row / 6);
            assert_eq!(logical.key.sequence_id, 0);
        }
    }

    #[test]
    fn test_rows_outside_interval_are_skipped() {
        let mut table = MemTable::synthetic("skip.ms", 2, 1, 1, 5);
        let cols = table.scalar_columns().unwrap();
        let meta = MsMetadata::from_columns(
            &mut table,
            &cols,
            &TimeInterval {
                start: Some(1),
                end: Some(3),
            },
        )
        .unwrap();
        let selection = RowSelection::new(&cols, &meta);
        let mut iter = selection.iter();
        let rows: Vec<_> = iter.by_ref().collect();
        // 3 baselines per time step, 2 time steps kept
        assert_eq!(rows.len(), 6);
        assert_eq!(iter.skipped(), 9);
        assert_eq!(rows[0].row, 3);
        assert_eq!(rows[0].time_index, 0);
        assert_eq!(rows[5].time_index, 1);
    }

    #[test]
    fn test_swapped_antennas_are_canonical() {
        let mut table = MemTable::synthetic("swapped.ms", 2, 1, 1, 1);
        table.push_synthetic_row(table.first_time() + 100., 1, 0, 0, 0);
        let cols = table.scalar_columns().unwrap();
        let meta = MsMetadata::from_columns(&mut table, &cols, &TimeInterval::default()).unwrap();
        let rows: Vec<_> = RowSelection::new(&cols, &meta).iter().collect();
        let last = rows.last().unwrap();
        assert_eq!((last.key.antenna1, last.key.antenna2), (0, 1));
        assert_eq!(last.time_index, 1);
    }
}
