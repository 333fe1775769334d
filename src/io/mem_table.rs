//! An in-memory visibility table.
//!
//! [`MemTable`] is a cheap-to-clone handle to a table kept entirely in memory.
//! Clones share their rows, so a reader can own one handle while the caller
//! keeps another to look at what was written back. All access goes through a
//! single lock.

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
};

use marlu::{
    c32,
    ndarray::{Array2, ArrayView2},
    RADec, XyzGeocentric, UVW,
};

use super::{error::IOError, ScalarColumns, VisTable, DEFAULT_DATA_COLUMN};
use crate::metadata::{band_of, AntennaInfo, BandInfo, FieldInfo, Polarization};

/// The timestamp of the first time step of [`MemTable::synthetic`] tables.
pub const SYNTHETIC_FIRST_TIME: f64 = 4.87e9;
/// The spacing of time steps in [`MemTable::synthetic`] tables.
pub const SYNTHETIC_TIME_STEP: f64 = 2.0;

/// A row of a [`MemTable`].
#[derive(Debug, Clone, PartialEq)]
pub struct MemRow {
    /// TIME
    pub time: f64,
    /// ANTENNA1
    pub antenna1: usize,
    /// ANTENNA2
    pub antenna2: usize,
    /// FIELD_ID
    pub field_id: usize,
    /// DATA_DESC_ID
    pub data_desc_id: usize,
    /// Visibilities, `(channel, polarization)`
    pub data: Array2<c32>,
    /// Flags, `(channel, polarization)`
    pub flags: Array2<bool>,
    /// UVW
    pub uvw: UVW,
}

#[derive(Debug)]
struct MemTableData {
    telescope_name: Option<String>,
    antennas: Vec<AntennaInfo>,
    bands: Vec<BandInfo>,
    fields: Vec<FieldInfo>,
    polarizations: Vec<Polarization>,
    data_desc_to_band: Vec<usize>,
    rows: Vec<MemRow>,
    writable: bool,
    read_only: bool,
}

/// A shared, in-memory visibility table.
#[derive(Debug, Clone)]
pub struct MemTable {
    path: PathBuf,
    data_column: String,
    inner: Arc<RwLock<MemTableData>>,
    data_reads: Arc<AtomicUsize>,
}

/// Builds an empty [`MemTable`].
#[derive(Debug, Clone)]
pub struct MemTableBuilder {
    path: PathBuf,
    data_column: String,
    telescope_name: Option<String>,
    antennas: usize,
    bands: Vec<BandInfo>,
    fields: usize,
    polarizations: Vec<Polarization>,
    writable: bool,
}

impl MemTableBuilder {
    /// Start a table that pretends to live at `path`.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            data_column: DEFAULT_DATA_COLUMN.to_string(),
            telescope_name: None,
            antennas: 0,
            bands: Vec::new(),
            fields: 1,
            polarizations: vec![Polarization::XX, Polarization::YY],
            writable: false,
        }
    }

    /// Number of antennas in the antenna table.
    pub fn antennas(mut self, antennas: usize) -> Self {
        self.antennas = antennas;
        self
    }

    /// Add a band. Each band gets its own data description.
    pub fn band(mut self, band: BandInfo) -> Self {
        self.bands.push(band);
        self
    }

    /// Number of fields in the field table.
    pub fn fields(mut self, fields: usize) -> Self {
        self.fields = fields;
        self
    }

    /// The correlation products of each cell.
    pub fn polarizations(mut self, polarizations: Vec<Polarization>) -> Self {
        self.polarizations = polarizations;
        self
    }

    /// Name of the visibility column.
    pub fn data_column(mut self, name: &str) -> Self {
        self.data_column = name.to_string();
        self
    }

    /// Telescope name.
    pub fn telescope_name(mut self, name: &str) -> Self {
        self.telescope_name = Some(name.to_string());
        self
    }

    /// Whether writes are accepted before [`VisTable::reopen_for_write`].
    pub fn writable(mut self, writable: bool) -> Self {
        self.writable = writable;
        self
    }

    /// Create the table, with no rows.
    pub fn build(self) -> MemTable {
        let antennas = (0..self.antennas)
            .map(|id| AntennaInfo {
                id,
                name: format!("ANT{id:03}"),
                station: "SYNTH".to_string(),
                position: XyzGeocentric {
                    x: -2_559_454.0 + 10. * id as f64,
                    y: 5_095_372.0,
                    z: -2_849_057.0,
                },
                diameter_m: 4.0,
                mount: "ALT-AZ".to_string(),
            })
            .collect();
        let fields = (0..self.fields)
            .map(|field_id| FieldInfo {
                field_id,
                name: format!("field{field_id}"),
                delay_dir: RADec::from_degrees(15. * field_id as f64, -27.),
            })
            .collect();
        let data_desc_to_band = (0..self.bands.len()).collect();
        MemTable {
            path: self.path,
            data_column: self.data_column,
            inner: Arc::new(RwLock::new(MemTableData {
                telescope_name: self.telescope_name,
                antennas,
                bands: self.bands,
                fields,
                polarizations: self.polarizations,
                data_desc_to_band,
                rows: Vec::new(),
                writable: self.writable,
                read_only: false,
            })),
            data_reads: Arc::new(AtomicUsize::new(0)),
        }
    }
}

fn synthetic_polarizations(count: usize) -> Vec<Polarization> {
    use Polarization::*;
    match count {
        1 => vec![StokesI],
        2 => vec![XX, YY],
        4 => vec![XX, XY, YX, YY],
        n => (0..n as i32).map(|i| Other(100 + i)).collect(),
    }
}

impl MemTable {
    /// A single-band, single-field table with every baseline (autos
    /// included) of `antennas` antennas at each of `timesteps` time steps,
    /// in time-major order.
    ///
    /// The visibilities of row `r` are `(r + c / 4, p - c)` for channel `c`
    /// and polarization `p`, and nothing is flagged.
    pub fn synthetic<P: AsRef<Path>>(
        path: P,
        antennas: usize,
        channels: usize,
        polarizations: usize,
        timesteps: usize,
    ) -> Self {
        let table = MemTableBuilder::new(path)
            .antennas(antennas)
            .band(BandInfo::uniform(0, 150e6, 40e3, channels))
            .polarizations(synthetic_polarizations(polarizations))
            .build();
        for timestep in 0..timesteps {
            let time = SYNTHETIC_FIRST_TIME + timestep as f64 * SYNTHETIC_TIME_STEP;
            for antenna1 in 0..antennas {
                for antenna2 in antenna1..antennas {
                    table.push_synthetic_row(time, antenna1, antenna2, 0, 0);
                }
            }
        }
        table
    }

    /// The time of the first time step of [`MemTable::synthetic`] tables.
    pub fn first_time(&self) -> f64 {
        SYNTHETIC_FIRST_TIME
    }

    fn read_lock(&self) -> RwLockReadGuard<'_, MemTableData> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_lock(&self) -> RwLockWriteGuard<'_, MemTableData> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a row.
    pub fn push_row(&self, row: MemRow) {
        self.write_lock().rows.push(row);
    }

    /// Append a row with generated, unflagged visibilities shaped for the band
    /// of `data_desc_id`.
    pub fn push_synthetic_row(
        &self,
        time: f64,
        antenna1: usize,
        antenna2: usize,
        field_id: usize,
        data_desc_id: usize,
    ) {
        let mut inner = self.write_lock();
        let band = band_of(&inner.data_desc_to_band, data_desc_id);
        let channels = inner.bands.get(band).map_or(0, BandInfo::channel_count);
        let pols = inner.polarizations.len();
        let row = inner.rows.len();
        let data = Array2::from_shape_fn((channels, pols), |(c, p)| {
            c32::new(row as f32 + c as f32 / 4., p as f32 - c as f32)
        });
        inner.rows.push(MemRow {
            time,
            antenna1,
            antenna2,
            field_id,
            data_desc_id,
            data,
            flags: Array2::from_elem((channels, pols), false),
            uvw: UVW {
                u: (antenna2 as f64 - antenna1 as f64) * 10.,
                v: time - SYNTHETIC_FIRST_TIME,
                w: row as f64,
            },
        });
    }

    /// Keep only the rows for which `keep` returns true.
    pub fn retain_rows<F: FnMut(&MemRow) -> bool>(&self, keep: F) {
        self.write_lock().rows.retain(keep);
    }

    /// A copy of a row.
    pub fn row(&self, row: usize) -> Option<MemRow> {
        self.read_lock().rows.get(row).cloned()
    }

    /// Call `f` with every row, in order.
    pub fn for_each_row<F: FnMut(usize, &MemRow)>(&self, mut f: F) {
        for (index, row) in self.read_lock().rows.iter().enumerate() {
            f(index, row);
        }
    }

    /// How many times visibilities have been read from this table, across all
    /// handles.
    pub fn data_reads(&self) -> usize {
        self.data_reads.load(Ordering::Relaxed)
    }

    /// Whether writes are accepted.
    pub fn is_writable(&self) -> bool {
        self.read_lock().writable
    }

    /// Make [`VisTable::reopen_for_write`] fail, like a table on read-only
    /// storage.
    pub fn set_read_only(&self, read_only: bool) {
        let mut inner = self.write_lock();
        inner.read_only = read_only;
        if read_only {
            inner.writable = false;
        }
    }

    fn check_cell<T>(
        &self,
        rows: &[MemRow],
        row: usize,
        column: &str,
        cell: &ArrayView2<T>,
    ) -> Result<(), IOError> {
        let existing = rows.get(row).ok_or(IOError::RowOutOfRange {
            row,
            num_rows: rows.len(),
        })?;
        if existing.flags.dim() != cell.dim() {
            return Err(IOError::BadCellShape {
                column: column.to_string(),
                row,
                expected: format!("{:?}", existing.flags.dim()),
                received: format!("{:?}", cell.dim()),
            });
        }
        Ok(())
    }
}

impl VisTable for MemTable {
    fn path(&self) -> &Path {
        &self.path
    }

    fn num_rows(&self) -> usize {
        self.read_lock().rows.len()
    }

    fn antennas(&mut self) -> Result<Vec<AntennaInfo>, IOError> {
        Ok(self.read_lock().antennas.clone())
    }

    fn bands(&mut self) -> Result<Vec<BandInfo>, IOError> {
        Ok(self.read_lock().bands.clone())
    }

    fn fields(&mut self) -> Result<Vec<FieldInfo>, IOError> {
        Ok(self.read_lock().fields.clone())
    }

    fn polarizations(&mut self) -> Result<Vec<Polarization>, IOError> {
        Ok(self.read_lock().polarizations.clone())
    }

    fn data_desc_to_band(&mut self) -> Result<Vec<usize>, IOError> {
        Ok(self.read_lock().data_desc_to_band.clone())
    }

    fn telescope_name(&mut self) -> Result<Option<String>, IOError> {
        Ok(self.read_lock().telescope_name.clone())
    }

    fn scalar_columns(&mut self) -> Result<ScalarColumns, IOError> {
        let inner = self.read_lock();
        let mut cols = ScalarColumns::default();
        for row in &inner.rows {
            cols.time.push(row.time);
            cols.antenna1.push(row.antenna1);
            cols.antenna2.push(row.antenna2);
            cols.field_id.push(row.field_id);
            cols.data_desc_id.push(row.data_desc_id);
        }
        Ok(cols)
    }

    fn read_data(&mut self, row: usize, column: &str) -> Result<Array2<c32>, IOError> {
        if column != self.data_column {
            return Err(IOError::MissingColumn {
                column: column.to_string(),
                table: self.path.display().to_string(),
            });
        }
        self.data_reads.fetch_add(1, Ordering::Relaxed);
        let inner = self.read_lock();
        inner
            .rows
            .get(row)
            .map(|r| r.data.clone())
            .ok_or(IOError::RowOutOfRange {
                row,
                num_rows: inner.rows.len(),
            })
    }

    fn read_flags(&mut self, row: usize) -> Result<Array2<bool>, IOError> {
        let inner = self.read_lock();
        inner
            .rows
            .get(row)
            .map(|r| r.flags.clone())
            .ok_or(IOError::RowOutOfRange {
                row,
                num_rows: inner.rows.len(),
            })
    }

    fn read_uvw(&mut self, row: usize) -> Result<UVW, IOError> {
        let inner = self.read_lock();
        inner
            .rows
            .get(row)
            .map(|r| r.uvw)
            .ok_or(IOError::RowOutOfRange {
                row,
                num_rows: inner.rows.len(),
            })
    }

    fn reopen_for_write(&mut self) -> Result<(), IOError> {
        let mut inner = self.write_lock();
        if inner.read_only {
            return Err(IOError::ReadOnly(self.path.display().to_string()));
        }
        inner.writable = true;
        Ok(())
    }

    fn write_flags(&mut self, row: usize, flags: ArrayView2<bool>) -> Result<(), IOError> {
        let mut inner = self.write_lock();
        if !inner.writable {
            return Err(IOError::ReadOnly(self.path.display().to_string()));
        }
        self.check_cell(&inner.rows, row, "FLAG", &flags)?;
        inner.rows[row].flags.assign(&flags);
        Ok(())
    }

    fn write_data(
        &mut self,
        row: usize,
        column: &str,
        data: ArrayView2<c32>,
    ) -> Result<(), IOError> {
        if column != self.data_column {
            return Err(IOError::MissingColumn {
                column: column.to_string(),
                table: self.path.display().to_string(),
            });
        }
        let mut inner = self.write_lock();
        if !inner.writable {
            return Err(IOError::ReadOnly(self.path.display().to_string()));
        }
        self.check_cell(&inner.rows, row, column, &data)?;
        inner.rows[row].data.assign(&data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_layout() {
        let mut table = MemTable::synthetic("layout.ms", 3, 4, 2, 2);
        assert_eq!(table.num_rows(), 12);
        let cols = table.scalar_columns().unwrap();
        assert_eq!(&cols.antenna1[..6], &[0, 0, 0, 1, 1, 2]);
        assert_eq!(&cols.antenna2[..6], &[0, 1, 2, 1, 2, 2]);
        assert_eq!(cols.time[6], SYNTHETIC_FIRST_TIME + SYNTHETIC_TIME_STEP);
        let data = table.read_data(7, DEFAULT_DATA_COLUMN).unwrap();
        assert_eq!(data.dim(), (4, 2));
        assert_eq!(data[(2, 1)], c32::new(7.5, -1.));
        assert!(!table.read_flags(7).unwrap().iter().any(|&f| f));
        assert_eq!(table.data_reads(), 1);
    }

    #[test]
    fn test_clones_share_rows() {
        let table = MemTable::synthetic("shared.ms", 2, 2, 1, 1);
        let mut writer = table.clone();
        let flags = Array2::from_elem((2, 1), true);
        assert!(matches!(
            writer.write_flags(0, flags.view()),
            Err(IOError::ReadOnly(_))
        ));
        writer.reopen_for_write().unwrap();
        writer.write_flags(0, flags.view()).unwrap();
        assert!(table.row(0).unwrap().flags.iter().all(|&f| f));
        assert!(table.is_writable());

        table.set_read_only(true);
        assert!(matches!(
            writer.reopen_for_write(),
            Err(IOError::ReadOnly(_))
        ));
    }

    #[test]
    fn test_bad_cell_shape() {
        let mut table = MemTableBuilder::new("shape.ms")
            .antennas(2)
            .band(BandInfo::uniform(0, 100e6, 1e3, 3))
            .writable(true)
            .build();
        table.push_synthetic_row(1., 0, 1, 0, 0);
        let flags = Array2::from_elem((2, 2), true);
        assert!(matches!(
            table.write_flags(0, flags.view()),
            Err(IOError::BadCellShape { row: 0, .. })
        ));
        assert!(matches!(
            table.read_flags(1),
            Err(IOError::RowOutOfRange { row: 1, num_rows: 1 })
        ));
        assert!(matches!(
            table.read_data(0, "CORRECTED_DATA"),
            Err(IOError::MissingColumn { .. })
        ));
    }
}
