//! Choosing a backend.
//!
//! [`ReadMode::Auto`] loads the table into memory when it comfortably fits,
//! and reorders it on disk otherwise. The estimate only looks at the shape of
//! the table, not at which rows an interval actually selects.

use log::{debug, info, warn};
use sysinfo::System;

use crate::{
    error::ReaderError,
    io::{ScalarColumns, VisTable},
    metadata::TimeInterval,
    reader::{
        direct::DirectReader, memory::MemoryReader, reordering::ReorderingReader, BaselineReader,
        ReadMode, ReaderOptions,
    },
};

/// Bytes held per sample: two `f32` and a flag.
pub const BYTES_PER_SAMPLE: u64 = 2 * std::mem::size_of::<f32>() as u64 + 1;

/// The estimated in-memory size of a table: every row holding
/// `polarizations * channels` samples of the first band.
///
/// # Errors
///
/// Will return [`ReaderError`] if the subtables can't be read.
pub fn data_size<T: VisTable + ?Sized>(table: &mut T) -> Result<u64, ReaderError> {
    let pol_count = table.num_polarizations()? as u64;
    let channel_count = table
        .bands()?
        .first()
        .map_or(0, |band| band.channel_count() as u64);
    Ok(pol_count * channel_count * table.num_rows() as u64 * BYTES_PER_SAMPLE)
}

/// The number of times the TIME column changes value, counting the first row.
pub fn timestep_count(cols: &ScalarColumns) -> usize {
    let mut count = 0;
    let mut prev = None;
    for &time in &cols.time {
        if prev != Some(time) {
            count += 1;
            prev = Some(time);
        }
    }
    count
}

/// [`data_size`] scaled to the fraction of time steps `interval` selects.
///
/// Unbounded intervals, and intervals at least as long as the table, give
/// the full size.
///
/// # Errors
///
/// Will return [`ReaderError`] if the table can't be read.
pub fn interval_data_size<T: VisTable + ?Sized>(
    table: &mut T,
    interval: &TimeInterval,
) -> Result<u64, ReaderError> {
    let full = data_size(table)?;
    if interval.is_unbounded() {
        return Ok(full);
    }
    let total = timestep_count(&table.scalar_columns()?);
    let start = interval.start.unwrap_or(0);
    let end = interval.end.unwrap_or(total);
    let requested = end.saturating_sub(start);
    if total == 0 || requested >= total {
        return Ok(full);
    }
    Ok((full as f64 * requested as f64 / total as f64) as u64)
}

/// The total physical memory of this machine, in bytes.
pub fn total_memory() -> u64 {
    let mut system = System::new();
    system.refresh_memory();
    system.total_memory()
}

/// The memory budget of a reader: [`ReaderOptions::memory_limit`] if set,
/// the total system memory otherwise.
pub fn memory_budget(options: &ReaderOptions) -> u64 {
    options.memory_limit.unwrap_or_else(total_memory)
}

/// Whether `required_bytes` fits twice into `total_memory`.
pub fn is_enough_memory_available(required_bytes: u64, total_memory: u64) -> bool {
    const MB: u64 = 1_000_000;
    if required_bytes.saturating_mul(2) < total_memory {
        debug!(
            "{} MB required, {} MB available: will use memory read mode",
            required_bytes / MB,
            total_memory / MB
        );
        true
    } else {
        warn!(
            "{} MB required, but {} MB available. Because this is not at least twice as much, the reordering mode (slower!) will be used",
            required_bytes / MB,
            total_memory / MB
        );
        false
    }
}

/// The backend `options` ask for, with [`ReadMode::Auto`] resolved for
/// `table`.
///
/// # Errors
///
/// Will return [`ReaderError`] if the size of the table can't be estimated.
pub fn select_mode<T: VisTable + ?Sized>(
    table: &mut T,
    options: &ReaderOptions,
) -> Result<ReadMode, ReaderError> {
    if options.mode != ReadMode::Auto {
        return Ok(options.mode);
    }
    let required = interval_data_size(table, &options.interval)?;
    let mode = if is_enough_memory_available(required, memory_budget(options)) {
        ReadMode::Memory
    } else {
        ReadMode::Reordering
    };
    Ok(mode)
}

/// Create the reader `options` ask for.
///
/// # Errors
///
/// Will return [`ReaderError`] if [`ReadMode::Auto`] can't be resolved.
pub fn new_reader<T: VisTable + 'static>(
    mut table: T,
    options: ReaderOptions,
) -> Result<Box<dyn BaselineReader>, ReaderError> {
    let mode = select_mode(&mut table, &options)?;
    info!("reading {} in {} mode", table.path().display(), mode);
    Ok(match mode {
        ReadMode::Direct => Box::new(DirectReader::new(table, options)),
        ReadMode::Memory => Box::new(MemoryReader::new(table, options)),
        ReadMode::Reordering | ReadMode::Auto => Box::new(ReorderingReader::new(table, options)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{io::MemTable, reader::ReaderOptionsBuilder};

    #[test]
    fn test_data_size() {
        // 3 baselines (autos included) at 5 time steps
        let mut table = MemTable::synthetic("size.ms", 2, 4, 2, 5);
        assert_eq!(data_size(&mut table).unwrap(), 2 * 4 * 15 * 9);
        assert_eq!(
            timestep_count(&table.scalar_columns().unwrap()),
            5
        );
        assert_eq!(
            interval_data_size(&mut table, &TimeInterval::new(1..3)).unwrap(),
            2 * 4 * 15 * 9 * 2 / 5
        );
        assert_eq!(
            interval_data_size(&mut table, &TimeInterval::new(0..9)).unwrap(),
            2 * 4 * 15 * 9
        );
        assert_eq!(
            interval_data_size(&mut table, &TimeInterval::default()).unwrap(),
            2 * 4 * 15 * 9
        );
    }

    #[test]
    fn test_empty_table_size() {
        let mut table = MemTable::synthetic("empty.ms", 2, 4, 2, 0);
        assert_eq!(data_size(&mut table).unwrap(), 0);
        assert_eq!(
            interval_data_size(&mut table, &TimeInterval::new(0..1)).unwrap(),
            0
        );
    }

    #[test]
    fn test_memory_threshold() {
        assert!(is_enough_memory_available(499, 1000));
        assert!(!is_enough_memory_available(500, 1000));
        assert!(!is_enough_memory_available(u64::MAX, 1000));
        assert!(total_memory() > 0);
    }

    #[test]
    fn test_select_mode() {
        let mut table = MemTable::synthetic("select.ms", 2, 4, 2, 5);
        let size = data_size(&mut table).unwrap();
        let options = |limit| {
            ReaderOptionsBuilder::default()
                .memory_limit(limit)
                .build()
                .unwrap()
        };
        assert_eq!(
            select_mode(&mut table, &options(size * 2 + 1)).unwrap(),
            ReadMode::Memory
        );
        assert_eq!(
            select_mode(&mut table, &options(size * 2)).unwrap(),
            ReadMode::Reordering
        );
        let direct = ReaderOptionsBuilder::default()
            .mode(ReadMode::Direct)
            .memory_limit(0)
            .build()
            .unwrap();
        assert_eq!(select_mode(&mut table, &direct).unwrap(), ReadMode::Direct);
    }

    #[test]
    fn test_new_reader_modes() {
        let table = MemTable::synthetic("new-reader.ms", 2, 4, 2, 5);
        for mode in [ReadMode::Direct, ReadMode::Memory, ReadMode::Reordering] {
            let options = ReaderOptionsBuilder::default().mode(mode).build().unwrap();
            let mut reader = new_reader(table.clone(), options).unwrap();
            assert_eq!(reader.mode(), mode);
            reader.close().unwrap();
        }
        let options = ReaderOptionsBuilder::default()
            .memory_limit(1)
            .build()
            .unwrap();
        let mut reader = new_reader(table, options).unwrap();
        assert_eq!(reader.mode(), ReadMode::Reordering);
        reader.close().unwrap();
    }
}
