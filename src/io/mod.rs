//! Access to the source visibility table.
//!
//! The baseline readers never touch a storage format directly, they go
//! through [`VisTable`]. [`mem_table::MemTable`] keeps a whole table in memory,
//! and with the `ms` feature [`ms::MsTable`] reads and writes CASA measurement
//! sets.

pub mod error;
pub mod mem_table;
#[cfg(feature = "ms")]
pub mod ms;

use std::path::Path;

use marlu::{
    c32,
    ndarray::{Array2, ArrayView2},
    UVW,
};

use crate::metadata::{AntennaInfo, BandInfo, FieldInfo, Polarization};

use self::error::IOError;

pub use mem_table::{MemTable, MemTableBuilder};
#[cfg(feature = "ms")]
pub use ms::MsTable;

/// The name of the default visibility column.
pub const DEFAULT_DATA_COLUMN: &str = "DATA";

/// The scalar columns of the main table that describe where a row belongs,
/// in native row order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScalarColumns {
    /// TIME, in the table's native unit (MJD seconds for measurement sets)
    pub time: Vec<f64>,
    /// ANTENNA1
    pub antenna1: Vec<usize>,
    /// ANTENNA2
    pub antenna2: Vec<usize>,
    /// FIELD_ID
    pub field_id: Vec<usize>,
    /// DATA_DESC_ID, the sub-band identifier of the row
    pub data_desc_id: Vec<usize>,
}

impl ScalarColumns {
    /// The number of rows described.
    pub fn len(&self) -> usize {
        self.time.len()
    }

    /// Whether there are no rows.
    pub fn is_empty(&self) -> bool {
        self.time.is_empty()
    }
}

/// A column-oriented visibility table that can be read and written by row.
///
/// Visibility and flag cells are `(channel, polarization)` shaped, one cell per
/// row. Implementations may require [`VisTable::reopen_for_write`] before any
/// of the `write_*` methods succeed.
pub trait VisTable {
    /// The location of the table, used to recognise reordered caches of it.
    fn path(&self) -> &Path;

    /// The number of rows in the main table.
    fn num_rows(&self) -> usize;

    /// The antenna table.
    ///
    /// # Errors
    ///
    /// Can throw [`IOError`] if there is an issue reading.
    fn antennas(&mut self) -> Result<Vec<AntennaInfo>, IOError>;

    /// The spectral windows, with their channel frequencies.
    ///
    /// # Errors
    ///
    /// Can throw [`IOError`] if there is an issue reading.
    fn bands(&mut self) -> Result<Vec<BandInfo>, IOError>;

    /// The field table.
    ///
    /// # Errors
    ///
    /// Can throw [`IOError`] if there is an issue reading.
    fn fields(&mut self) -> Result<Vec<FieldInfo>, IOError>;

    /// The correlation products stored in each cell, in cell order.
    ///
    /// # Errors
    ///
    /// Can throw [`IOError`] if there is an issue reading.
    fn polarizations(&mut self) -> Result<Vec<Polarization>, IOError>;

    /// The number of correlation products in each cell.
    ///
    /// # Errors
    ///
    /// Can throw [`IOError`] if there is an issue reading.
    fn num_polarizations(&mut self) -> Result<usize, IOError> {
        Ok(self.polarizations()?.len())
    }

    /// The spectral window of each data description.
    ///
    /// # Errors
    ///
    /// Can throw [`IOError`] if there is an issue reading.
    fn data_desc_to_band(&mut self) -> Result<Vec<usize>, IOError>;

    /// The telescope name, if the table records one.
    ///
    /// # Errors
    ///
    /// Can throw [`IOError`] if there is an issue reading.
    fn telescope_name(&mut self) -> Result<Option<String>, IOError> {
        Ok(None)
    }

    /// Read the scalar row-description columns of the whole main table.
    ///
    /// # Errors
    ///
    /// Can throw [`IOError`] if there is an issue reading.
    fn scalar_columns(&mut self) -> Result<ScalarColumns, IOError>;

    /// Read the visibilities of a row from the named data column.
    ///
    /// # Errors
    ///
    /// Can throw [`IOError`] if there is an issue reading.
    fn read_data(&mut self, row: usize, column: &str) -> Result<Array2<c32>, IOError>;

    /// Read the flags of a row.
    ///
    /// # Errors
    ///
    /// Can throw [`IOError`] if there is an issue reading.
    fn read_flags(&mut self, row: usize) -> Result<Array2<bool>, IOError>;

    /// Read the UVW coordinate of a row.
    ///
    /// # Errors
    ///
    /// Can throw [`IOError`] if there is an issue reading.
    fn read_uvw(&mut self, row: usize) -> Result<UVW, IOError>;

    /// Make the table writable. Calling this more than once is harmless.
    ///
    /// # Errors
    ///
    /// Can throw [`IOError`] if the table can not be opened for writing.
    fn reopen_for_write(&mut self) -> Result<(), IOError>;

    /// Replace the flags of a row.
    ///
    /// # Errors
    ///
    /// Can throw [`IOError`] if there is an issue writing.
    fn write_flags(&mut self, row: usize, flags: ArrayView2<bool>) -> Result<(), IOError>;

    /// Replace the visibilities of a row in the named data column.
    ///
    /// # Errors
    ///
    /// Can throw [`IOError`] if there is an issue writing.
    fn write_data(
        &mut self,
        row: usize,
        column: &str,
        data: ArrayView2<c32>,
    ) -> Result<(), IOError>;
}
