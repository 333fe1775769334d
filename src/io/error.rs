//! Errors that can occur in the io module

use thiserror::Error;

#[derive(Error, Debug)]
#[allow(clippy::upper_case_acronyms)]
/// All the errors that can occur in table and temporary file io operations
pub enum IOError {
    /// Error when creating or pre-allocating a temporary file.
    #[error("{source_file}:{source_line}\nCouldn't create temporary file {path}, check access rights and free disk space: {err}")]
    TempFileCreate {
        /// The path of the temporary file
        path: String,
        /// The underlying io error
        err: std::io::Error,
        /// The file where the error originated (usually `file!()`)
        source_file: &'static str,
        /// The line number where the error originated (usually `line!()`)
        source_line: u32,
    },

    /// Error when reading from, writing to or seeking in a temporary file.
    #[error("{source_file}:{source_line}\nI/O error on temporary file {path}: {err}")]
    TempFileAccess {
        /// The path of the temporary file
        path: String,
        /// The underlying io error
        err: std::io::Error,
        /// The file where the error originated (usually `file!()`)
        source_file: &'static str,
        /// The line number where the error originated (usually `line!()`)
        source_line: u32,
    },

    /// A read or write fell outside the bounds of a temporary file region.
    #[error("access to sample range {start}..{end} is outside of {path} ({len} samples)")]
    TempFileBounds {
        /// The path of the temporary file
        path: String,
        /// First sample of the access
        start: u64,
        /// One past the last sample of the access
        end: u64,
        /// Number of samples available
        len: u64,
    },

    /// The source table does not have a column that is needed.
    #[error("column {column} is not present in table {table}")]
    MissingColumn {
        /// The name of the missing column
        column: String,
        /// The table that was searched
        table: String,
    },

    /// A row index past the end of the table.
    #[error("row {row} is out of range for a table with {num_rows} rows")]
    RowOutOfRange {
        /// The requested row
        row: usize,
        /// Number of rows in the table
        num_rows: usize,
    },

    /// A cell had an unexpected shape.
    #[error("cell {column}[{row}] has shape {received}, expected {expected}")]
    BadCellShape {
        /// The column of the cell
        column: String,
        /// The row of the cell
        row: usize,
        /// The shape that was expected
        expected: String,
        /// The shape that was found
        received: String,
    },

    /// A negative index where an identifier was expected.
    #[error("column {column} contains a negative value {value} at row {row}")]
    NegativeIdentifier {
        /// The column that was read
        column: String,
        /// The row of the value
        row: usize,
        /// The offending value
        value: i64,
    },

    /// The table was written to without being reopened for writing.
    #[error("table {0} is not open for writing")]
    ReadOnly(String),

    #[cfg(feature = "ms")]
    /// Error when trying to interface with a measurement set.
    #[error("Error when trying to interface with measurement set: {0}")]
    Table(#[from] marlu::rubbl_casatables::TableError),

    #[cfg(feature = "ms")]
    /// Error from casacore.
    #[error("Error from casacore: {0}")]
    Casacore(#[from] marlu::rubbl_casatables::CasacoreError),

    /// A generic io error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
