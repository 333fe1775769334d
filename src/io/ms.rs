//! CASA measurement sets, through `rubbl_casatables`.

use std::{
    fmt,
    path::{Path, PathBuf},
};

use log::{debug, trace};
use marlu::{
    c32,
    ndarray::{Array2, ArrayView2},
    rubbl_casatables::{Table, TableOpenMode},
    RADec, XyzGeocentric, UVW,
};

use super::{error::IOError, ScalarColumns, VisTable};
use crate::metadata::{AntennaInfo, BandInfo, ChannelInfo, FieldInfo, Polarization};

fn to_index(column: &str, values: Vec<i32>) -> Result<Vec<usize>, IOError> {
    values
        .into_iter()
        .enumerate()
        .map(|(row, value)| {
            usize::try_from(value).map_err(|_| IOError::NegativeIdentifier {
                column: column.to_string(),
                row,
                value: value.into(),
            })
        })
        .collect()
}

/// A measurement set on disk.
///
/// The main table is opened read-only until [`VisTable::reopen_for_write`].
/// Subtables are opened when they are read.
pub struct MsTable {
    path: PathBuf,
    main: Table,
    num_rows: usize,
    writable: bool,
}

impl fmt::Debug for MsTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MsTable")
            .field("path", &self.path)
            .field("num_rows", &self.num_rows)
            .field("writable", &self.writable)
            .finish()
    }
}

impl MsTable {
    /// Open the measurement set at `path` for reading.
    ///
    /// # Errors
    ///
    /// Will return [`IOError::Table`] if the main table can't be opened.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, IOError> {
        let path = path.as_ref().to_path_buf();
        trace!("opening measurement set {}", path.display());
        let main = Table::open(&path, TableOpenMode::Read)?;
        let num_rows = main.n_rows() as usize;
        debug!("{} has {} rows", path.display(), num_rows);
        Ok(Self {
            path,
            main,
            num_rows,
            writable: false,
        })
    }

    fn subtable(&self, name: &str) -> Result<Table, IOError> {
        Ok(Table::open(
            format!("{}/{}", self.path.display(), name),
            TableOpenMode::Read,
        )?)
    }

    fn check_row(&self, row: usize) -> Result<u64, IOError> {
        if row >= self.num_rows {
            return Err(IOError::RowOutOfRange {
                row,
                num_rows: self.num_rows,
            });
        }
        Ok(row as u64)
    }

    fn check_writable(&self) -> Result<(), IOError> {
        if self.writable {
            Ok(())
        } else {
            Err(IOError::ReadOnly(self.path.display().to_string()))
        }
    }

    fn check_shape<T>(
        &mut self,
        column: &str,
        row: usize,
        cell: &ArrayView2<T>,
    ) -> Result<(), IOError> {
        let existing: Array2<bool> = self.main.get_cell("FLAG", row as u64)?;
        if existing.dim() != cell.dim() {
            return Err(IOError::BadCellShape {
                column: column.to_string(),
                row,
                expected: format!("{:?}", existing.dim()),
                received: format!("{:?}", cell.dim()),
            });
        }
        Ok(())
    }
}

impl VisTable for MsTable {
    fn path(&self) -> &Path {
        &self.path
    }

    fn num_rows(&self) -> usize {
        self.num_rows
    }

    fn antennas(&mut self) -> Result<Vec<AntennaInfo>, IOError> {
        let mut table = self.subtable("ANTENNA")?;
        let names: Vec<String> = table.get_col_as_vec("NAME")?;
        let stations: Vec<String> = table.get_col_as_vec("STATION")?;
        let diameters: Vec<f64> = table.get_col_as_vec("DISH_DIAMETER")?;
        let mounts: Vec<String> = table.get_col_as_vec("MOUNT")?;
        let mut antennas = Vec::with_capacity(names.len());
        for (id, name) in names.into_iter().enumerate() {
            let position: Vec<f64> = table.get_cell_as_vec("POSITION", id as u64)?;
            let [x, y, z] = position[..] else {
                return Err(IOError::BadCellShape {
                    column: "ANTENNA/POSITION".to_string(),
                    row: id,
                    expected: "[3]".to_string(),
                    received: format!("[{}]", position.len()),
                });
            };
            antennas.push(AntennaInfo {
                id,
                name,
                station: stations.get(id).cloned().unwrap_or_default(),
                position: XyzGeocentric { x, y, z },
                diameter_m: diameters.get(id).copied().unwrap_or_default(),
                mount: mounts.get(id).cloned().unwrap_or_default(),
            });
        }
        Ok(antennas)
    }

    fn bands(&mut self) -> Result<Vec<BandInfo>, IOError> {
        let mut table = self.subtable("SPECTRAL_WINDOW")?;
        let mut bands = Vec::new();
        for window_index in 0..table.n_rows() {
            let freqs: Vec<f64> = table.get_cell_as_vec("CHAN_FREQ", window_index)?;
            let widths: Vec<f64> = table.get_cell_as_vec("CHAN_WIDTH", window_index)?;
            let channels = freqs
                .into_iter()
                .enumerate()
                .map(|(index, freq_hz)| ChannelInfo {
                    index,
                    freq_hz,
                    width_hz: widths.get(index).copied().unwrap_or_default(),
                })
                .collect();
            bands.push(BandInfo {
                window_index: window_index as usize,
                channels,
            });
        }
        Ok(bands)
    }

    fn fields(&mut self) -> Result<Vec<FieldInfo>, IOError> {
        let mut table = self.subtable("FIELD")?;
        let names: Vec<String> = table.get_col_as_vec("NAME")?;
        let mut fields = Vec::with_capacity(names.len());
        for (field_id, name) in names.into_iter().enumerate() {
            let dir: Vec<f64> = table.get_cell_as_vec("DELAY_DIR", field_id as u64)?;
            fields.push(FieldInfo {
                field_id,
                name,
                delay_dir: RADec {
                    ra: dir.first().copied().unwrap_or_default(),
                    dec: dir.get(1).copied().unwrap_or_default(),
                },
            });
        }
        Ok(fields)
    }

    fn polarizations(&mut self) -> Result<Vec<Polarization>, IOError> {
        let mut table = self.subtable("POLARIZATION")?;
        if table.n_rows() == 0 {
            return Ok(Vec::new());
        }
        let codes: Vec<i32> = table.get_cell_as_vec("CORR_TYPE", 0)?;
        Ok(codes.into_iter().map(Polarization::from_corr_type).collect())
    }

    fn data_desc_to_band(&mut self) -> Result<Vec<usize>, IOError> {
        let mut table = self.subtable("DATA_DESCRIPTION")?;
        to_index(
            "DATA_DESCRIPTION/SPECTRAL_WINDOW_ID",
            table.get_col_as_vec("SPECTRAL_WINDOW_ID")?,
        )
    }

    fn telescope_name(&mut self) -> Result<Option<String>, IOError> {
        let mut table = self.subtable("OBSERVATION")?;
        if table.n_rows() == 0 {
            return Ok(None);
        }
        let name: String = table.get_cell("TELESCOPE_NAME", 0)?;
        Ok(Some(name))
    }

    fn scalar_columns(&mut self) -> Result<ScalarColumns, IOError> {
        trace!("reading scalar columns of {}", self.path.display());
        Ok(ScalarColumns {
            time: self.main.get_col_as_vec("TIME")?,
            antenna1: to_index("ANTENNA1", self.main.get_col_as_vec("ANTENNA1")?)?,
            antenna2: to_index("ANTENNA2", self.main.get_col_as_vec("ANTENNA2")?)?,
            field_id: to_index("FIELD_ID", self.main.get_col_as_vec("FIELD_ID")?)?,
            data_desc_id: to_index("DATA_DESC_ID", self.main.get_col_as_vec("DATA_DESC_ID")?)?,
        })
    }

    fn read_data(&mut self, row: usize, column: &str) -> Result<Array2<c32>, IOError> {
        let row = self.check_row(row)?;
        Ok(self.main.get_cell(column, row)?)
    }

    fn read_flags(&mut self, row: usize) -> Result<Array2<bool>, IOError> {
        let row = self.check_row(row)?;
        Ok(self.main.get_cell("FLAG", row)?)
    }

    fn read_uvw(&mut self, row: usize) -> Result<UVW, IOError> {
        let index = self.check_row(row)?;
        let uvw: Vec<f64> = self.main.get_cell_as_vec("UVW", index)?;
        match uvw[..] {
            [u, v, w] => Ok(UVW { u, v, w }),
            _ => Err(IOError::BadCellShape {
                column: "UVW".to_string(),
                row,
                expected: "[3]".to_string(),
                received: format!("[{}]", uvw.len()),
            }),
        }
    }

    fn reopen_for_write(&mut self) -> Result<(), IOError> {
        if self.writable {
            return Ok(());
        }
        debug!("reopening {} for writing", self.path.display());
        self.main = Table::open(&self.path, TableOpenMode::ReadWrite)?;
        self.writable = true;
        Ok(())
    }

    fn write_flags(&mut self, row: usize, flags: ArrayView2<bool>) -> Result<(), IOError> {
        self.check_writable()?;
        let index = self.check_row(row)?;
        self.check_shape("FLAG", row, &flags)?;
        self.main.put_cell("FLAG", index, &flags.to_owned())?;
        Ok(())
    }

    fn write_data(
        &mut self,
        row: usize,
        column: &str,
        data: ArrayView2<c32>,
    ) -> Result<(), IOError> {
        self.check_writable()?;
        let index = self.check_row(row)?;
        self.check_shape(column, row, &data)?;
        self.main.put_cell(column, index, &data.to_owned())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negative_identifiers_are_rejected() {
        assert_eq!(to_index("ANTENNA1", vec![0, 3, 1]).unwrap(), vec![0, 3, 1]);
        assert!(matches!(
            to_index("ANTENNA2", vec![0, -1]),
            Err(IOError::NegativeIdentifier { row: 1, value: -1, .. })
        ));
    }

    #[test]
    fn test_open_missing_table() {
        let dir = tempfile::tempdir().unwrap();
        assert!(MsTable::open(dir.path().join("missing.ms")).is_err());
    }
}
