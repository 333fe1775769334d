#![warn(missing_docs)]
#![warn(clippy::missing_safety_doc)]
#![warn(clippy::missing_errors_doc)]

//! msreorder serves the visibilities of a radio interferometry measurement
//! set one baseline at a time, even though the table stores its rows
//! time-major across all baselines.
//!
//! # Examples
//!
//! Read a baseline out of a synthetic table, flag one sample and write it back
//!
//! ```rust
//! use msreorder::{new_reader, MemTable, ReadMode, ReaderOptionsBuilder};
//! use msreorder::ndarray::Array2;
//!
//! // 3 antennas, 4 channels, 2 polarizations, 5 time steps
//! let table = MemTable::synthetic("example.ms", 3, 4, 2, 5);
//!
//! let options = ReaderOptionsBuilder::default()
//!     .mode(ReadMode::Memory)
//!     .build()
//!     .unwrap();
//! let mut reader = new_reader(table.clone(), options).unwrap();
//!
//! // antenna 0 against antenna 1, band 0, sequence 0
//! reader.add_read_request(0, 1, 0, 0).unwrap();
//! reader.perform_read_requests().unwrap();
//! let result = reader.next_result().unwrap();
//! assert_eq!(result.width(), 5);
//! assert_eq!(result.channel_count(), 4);
//!
//! let mut mask = Array2::from_elem((5, 4), false);
//! mask[(2, 3)] = true;
//! reader.add_write_task(vec![mask], 0, 1, 0, 0).unwrap();
//! reader.perform_flag_write_requests().unwrap();
//!
//! // the memory reader writes flags back to the table when it is closed
//! reader.close().unwrap();
//! assert!(table.row(2 * 6 + 1).unwrap().flags[(3, 0)]);
//! ```
//!
//! # Details
//!
//! A reader is picked by [`selector::new_reader`]:
//! - [`ReadMode::Direct`] finds the rows of each requested baseline in the
//!   table every time.
//! - [`ReadMode::Memory`] loads the whole table.
//! - [`ReadMode::Reordering`] rewrites the table once into temporary files
//!   where every baseline is contiguous.
//! - [`ReadMode::Auto`] loads the table if it takes less than half of the
//!   memory, and reorders it otherwise.
//!
//! Tables are accessed through the [`io::VisTable`] trait. Measurement sets
//! are read with `rubbl_casatables` when the `ms`
//! feature is enabled; [`io::MemTable`] is an in-memory table for tests.

pub mod error;
pub use error::{MsReorderError, ReaderError};

pub mod io;
pub use io::{MemTable, VisTable};
#[cfg(feature = "ms")]
pub use io::MsTable;

pub mod metadata;
pub use metadata::{BaselineKey, MsMetadata, TimeInterval};

pub mod selection;

pub mod reader;
pub use reader::{
    BaselineReader, BaselineResult, FlagWriteRequest, ReadMode, ReadRequest, ReaderOptions,
    ReaderOptionsBuilder,
};

pub mod selector;
pub use selector::new_reader;

#[cfg(feature = "cli")]
pub mod cli;

pub use marlu;
pub use marlu::{c32, ndarray};
