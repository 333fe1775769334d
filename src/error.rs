//! Errors that can occur in msreorder

use thiserror::Error;

use crate::io::error::IOError;

#[derive(Error, Debug)]
/// Errors raised by the baseline readers.
///
/// Protocol misuse is always reported here rather than corrected.
/// Inconsistent rows in the source table are not errors: they are logged and
/// skipped.
pub enum ReaderError {
    /// Read requests were performed while results of the previous batch were
    /// still waiting to be collected.
    #[error("{pending} results of the previous read are still unconsumed, collect them with next_result before performing more reads")]
    UnconsumedResults {
        /// Number of results not yet collected
        pending: usize,
    },

    /// A result was asked for, but none are queued.
    #[error("no read results are available, add read requests and call perform_read_requests first")]
    NoResults,

    /// A flag write supplied a number of masks that is neither 1 nor the
    /// polarization count.
    #[error("trying to write {received} flag masks to a set with {expected} polarizations")]
    PolarizationMismatch {
        /// Number of polarizations in the table
        expected: usize,
        /// Number of masks received
        received: usize,
    },

    /// Error for bad array shape in provided argument
    #[error("bad array shape supplied to argument {argument} of function {function}. expected {expected}, received {received}")]
    BadArrayShape {
        /// The argument name within the funciton
        argument: String,
        /// The function name
        function: String,
        /// The expected shape
        expected: String,
        /// The shape that was received instead
        received: String,
    },

    /// The backend keeps no copy of the visibilities it could write back.
    #[error("writing visibility data is not supported by the {reader} reader, use the reordering reader instead")]
    DataWriteUnsupported {
        /// Name of the backend
        reader: &'static str,
    },

    /// An antenna, band or sequence index that the catalog doesn't know.
    #[error("{what} index {index} is out of range, there are {count}")]
    IndexOutOfRange {
        /// What kind of index
        what: &'static str,
        /// The index given
        index: usize,
        /// Number of valid values
        count: usize,
    },

    /// A time range that is inverted or extends past its sequence.
    #[error("time range {start}..{end} is invalid for sequence {sequence_id} with {count} time steps")]
    InvalidTimeRange {
        /// Start of the range
        start: usize,
        /// End of the range
        end: usize,
        /// The sequence of the request
        sequence_id: usize,
        /// Number of time steps in the sequence
        count: usize,
    },

    /// The source table has no polarization information.
    #[error("the source table does not describe any polarizations")]
    NoPolarizations,

    /// The reader was used after [`crate::BaselineReader::close`].
    #[error("the reader has been closed")]
    Closed,

    /// Not enough memory could be reserved for a buffer.
    #[error("Insufficient memory available to allocate {need_gib} GiB for {what}")]
    InsufficientMemory {
        /// The amount of memory needed, in GiB
        need_gib: usize,
        /// What the memory was for
        what: &'static str,
    },

    /// Error derived from [`IOError`]
    #[error(transparent)]
    IOError(#[from] IOError),
}

#[derive(Error, Debug)]
/// Errors relating to CLI invocation
pub enum CLIError {
    /// When a bad CLI argument is provided
    #[error("Invalid Command Line Argument {option}: {received}. Expected {expected}")]
    InvalidCommandLineArgument {
        /// The argument name within the funciton
        option: String,
        /// The expected value
        expected: String,
        /// The argument value that was received instead
        received: String,
    },
    /// When a required argument is missing
    #[error("Missing Command Line Argument {option}")]
    MissingCommandLineArgument {
        /// The argument name
        option: String,
    },
    /// The input can't be opened by this build
    #[error("{what} requires msreorder to be built with the {feature} feature")]
    MissingFeature {
        /// What was attempted
        what: String,
        /// The cargo feature that is needed
        feature: &'static str,
    },
    /// Invalid reader options
    #[error(transparent)]
    Options(#[from] crate::reader::ReaderOptionsBuilderError),
}

#[derive(Error, Debug)]
/// The errors that the command-line front end can return
pub enum MsReorderError {
    /// Error derived from [`CLIError`]
    #[error(transparent)]
    CLIError(#[from] CLIError),

    /// Error derived from [`ReaderError`]
    #[error(transparent)]
    ReaderError(#[from] ReaderError),

    /// Error derived from [`IOError`]
    #[error(transparent)]
    IOError(#[from] IOError),

    #[cfg(feature = "cli")]
    /// Error derived from [`clap::Error`]
    #[error(transparent)]
    ClapError(#[from] clap::Error),

    /// Nothing went wrong, the user just asked for a dry run.
    #[error("Dry run")]
    DryRun {},
}
