//! Observation metadata derived once from a source table.
//!
//! [`MsMetadata`] is the catalog the baseline readers share: the antenna, band,
//! field and polarization tables, every sequence present in the main table,
//! and for each sequence an [`ObservationTimeIndex`] that turns timestamps into
//! dense time indices.

use std::{
    collections::BTreeSet,
    fmt,
    ops::Range,
    path::{Path, PathBuf},
};

use log::{debug, trace};
use marlu::{RADec, XyzGeocentric};

use crate::{
    error::ReaderError,
    io::{ScalarColumns, VisTable},
    selection::SequenceTracker,
};

/// An antenna from the antenna table.
#[derive(Debug, Clone, PartialEq)]
pub struct AntennaInfo {
    /// Index of the antenna in the antenna table
    pub id: usize,
    /// Antenna name
    pub name: String,
    /// Station the antenna belongs to
    pub station: String,
    /// Geocentric position \[meters\]
    pub position: XyzGeocentric,
    /// Dish diameter \[meters\]
    pub diameter_m: f64,
    /// Mount type, e.g. "ALT-AZ"
    pub mount: String,
}

/// A single frequency channel of a band.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelInfo {
    /// Index of the channel within its band
    pub index: usize,
    /// Centre frequency \[Hz\]
    pub freq_hz: f64,
    /// Channel width \[Hz\]
    pub width_hz: f64,
}

/// A spectral window (sub-band) and its channels.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BandInfo {
    /// Index of the spectral window
    pub window_index: usize,
    /// The channels of this band, in cell order
    pub channels: Vec<ChannelInfo>,
}

impl BandInfo {
    /// A band of `count` evenly spaced channels starting at `first_freq_hz`.
    pub fn uniform(window_index: usize, first_freq_hz: f64, width_hz: f64, count: usize) -> Self {
        Self {
            window_index,
            channels: (0..count)
                .map(|index| ChannelInfo {
                    index,
                    freq_hz: first_freq_hz + index as f64 * width_hz,
                    width_hz,
                })
                .collect(),
        }
    }

    /// The number of channels in this band.
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// The centre frequencies of all channels \[Hz\].
    pub fn frequencies(&self) -> Vec<f64> {
        self.channels.iter().map(|c| c.freq_hz).collect()
    }

    /// Mean of the channel frequencies \[Hz\], 0 for an empty band.
    pub fn centre_freq_hz(&self) -> f64 {
        if self.channels.is_empty() {
            return 0.;
        }
        self.channels.iter().map(|c| c.freq_hz).sum::<f64>() / self.channels.len() as f64
    }
}

/// An entry of the field table.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldInfo {
    /// Index of the field
    pub field_id: usize,
    /// Field name
    pub name: String,
    /// Delay tracking centre
    pub delay_dir: RADec,
}

/// A correlation product, decoded from the CASA `CORR_TYPE` codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Polarization {
    StokesI,
    StokesQ,
    StokesU,
    StokesV,
    RR,
    RL,
    LR,
    LL,
    XX,
    XY,
    YX,
    YY,
    /// A code this crate does not name
    Other(i32),
}

impl Polarization {
    /// Decode a CASA `CORR_TYPE` value.
    pub fn from_corr_type(code: i32) -> Self {
        match code {
            1 => Self::StokesI,
            2 => Self::StokesQ,
            3 => Self::StokesU,
            4 => Self::StokesV,
            5 => Self::RR,
            6 => Self::RL,
            7 => Self::LR,
            8 => Self::LL,
            9 => Self::XX,
            10 => Self::XY,
            11 => Self::YX,
            12 => Self::YY,
            other => Self::Other(other),
        }
    }

    /// The CASA `CORR_TYPE` value.
    pub fn corr_type(self) -> i32 {
        match self {
            Self::StokesI => 1,
            Self::StokesQ => 2,
            Self::StokesU => 3,
            Self::StokesV => 4,
            Self::RR => 5,
            Self::RL => 6,
            Self::LR => 7,
            Self::LL => 8,
            Self::XX => 9,
            Self::XY => 10,
            Self::YX => 11,
            Self::YY => 12,
            Self::Other(code) => code,
        }
    }
}

impl fmt::Display for Polarization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StokesI => write!(f, "I"),
            Self::StokesQ => write!(f, "Q"),
            Self::StokesU => write!(f, "U"),
            Self::StokesV => write!(f, "V"),
            Self::Other(code) => write!(f, "CORR_TYPE({code})"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// Identifies one logical time series: a baseline within a band and a
/// sequence. Antennas are always stored in canonical order
/// (`antenna1 <= antenna2`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BaselineKey {
    /// The lower antenna index
    pub antenna1: usize,
    /// The higher antenna index
    pub antenna2: usize,
    /// The band (spectral window) index
    pub band: usize,
    /// The sequence index
    pub sequence_id: usize,
}

impl BaselineKey {
    /// Create a key, swapping the antennas into canonical order if needed.
    pub fn new(antenna1: usize, antenna2: usize, band: usize, sequence_id: usize) -> Self {
        let (antenna1, antenna2) = if antenna1 <= antenna2 {
            (antenna1, antenna2)
        } else {
            (antenna2, antenna1)
        };
        Self {
            antenna1,
            antenna2,
            band,
            sequence_id,
        }
    }

    /// The flat baseline index `antenna1 * antenna_count + antenna2`.
    pub fn baseline_index(&self, antenna_count: usize) -> usize {
        self.antenna1 * antenna_count + self.antenna2
    }
}

impl fmt::Display for BaselineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{} (band {}, sequence {})",
            self.antenna1, self.antenna2, self.band, self.sequence_id
        )
    }
}

/// A sequence present in the main table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Sequence {
    /// Which time series this is
    pub key: BaselineKey,
    /// The field observed during the sequence
    pub field_id: usize,
}

/// The distinct, sorted timestamps of one sequence, each mapped to its
/// position.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ObservationTimeIndex {
    times: Vec<f64>,
}

impl ObservationTimeIndex {
    /// Build an index from timestamps in any order, dropping duplicates.
    pub fn new(mut times: Vec<f64>) -> Self {
        times.sort_by(f64::total_cmp);
        times.dedup_by(|a, b| a.total_cmp(b).is_eq());
        Self { times }
    }

    /// The dense index of `time`, or `None` if the time is not part of the
    /// sequence.
    pub fn index_of(&self, time: f64) -> Option<usize> {
        self.times.binary_search_by(|t| t.total_cmp(&time)).ok()
    }

    /// The number of time steps.
    pub fn len(&self) -> usize {
        self.times.len()
    }

    /// Whether there are no time steps.
    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// The sorted timestamps.
    pub fn times(&self) -> &[f64] {
        &self.times
    }

    /// Keep the first `end` times, then drop the first `start` of those.
    fn trim(&mut self, interval: &TimeInterval) {
        trim_times(&mut self.times, interval);
    }
}

/// An optional restriction of the time steps that are read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeInterval {
    /// First time step to keep
    pub start: Option<usize>,
    /// One past the last time step to keep
    pub end: Option<usize>,
}

impl TimeInterval {
    /// An interval covering `range`.
    pub fn new(range: Range<usize>) -> Self {
        Self {
            start: Some(range.start),
            end: Some(range.end),
        }
    }

    /// Whether neither bound is set.
    pub fn is_unbounded(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }
}

fn trim_times(times: &mut Vec<f64>, interval: &TimeInterval) {
    if let Some(end) = interval.end {
        times.truncate(end);
    }
    if let Some(start) = interval.start {
        if times.len() > start {
            times.drain(..start);
        } else {
            times.clear();
        }
    }
}

/// Map a data description to its band, falling back to the identity when the
/// data description table doesn't know it.
pub(crate) fn band_of(data_desc_to_band: &[usize], data_desc_id: usize) -> usize {
    data_desc_to_band
        .get(data_desc_id)
        .copied()
        .unwrap_or(data_desc_id)
}

/// Everything the baseline readers need to know about a table, except the
/// visibilities themselves.
#[derive(Debug, Clone)]
pub struct MsMetadata {
    path: PathBuf,
    num_rows: usize,
    telescope_name: Option<String>,
    antennas: Vec<AntennaInfo>,
    antenna_count: usize,
    bands: Vec<BandInfo>,
    fields: Vec<FieldInfo>,
    polarizations: Vec<Polarization>,
    data_desc_to_band: Vec<usize>,
    baselines: Vec<(usize, usize)>,
    sequences: Vec<Sequence>,
    observation_times: Vec<ObservationTimeIndex>,
    all_times: Vec<f64>,
}

impl MsMetadata {
    /// Scan `table` once and build the catalog, restricting each sequence to
    /// `interval`.
    ///
    /// # Errors
    ///
    /// Will return [`ReaderError`] if the table can't be read, or it has no
    /// polarizations.
    pub fn new<T: VisTable + ?Sized>(
        table: &mut T,
        interval: &TimeInterval,
    ) -> Result<Self, ReaderError> {
        let cols = table.scalar_columns()?;
        Self::from_columns(table, &cols, interval)
    }

    /// Build the catalog from scalar columns that were already read from
    /// `table`.
    ///
    /// # Errors
    ///
    /// Will return [`ReaderError`] if the subtables can't be read, or there are
    /// no polarizations.
    pub fn from_columns<T: VisTable + ?Sized>(
        table: &mut T,
        cols: &ScalarColumns,
        interval: &TimeInterval,
    ) -> Result<Self, ReaderError> {
        trace!("start MsMetadata::from_columns");
        let antennas = table.antennas()?;
        let bands = table.bands()?;
        let fields = table.fields()?;
        let polarizations = table.polarizations()?;
        if polarizations.is_empty() {
            return Err(ReaderError::NoPolarizations);
        }
        let data_desc_to_band = table.data_desc_to_band()?;
        let telescope_name = table.telescope_name()?;

        let mut tracker = SequenceTracker::default();
        let mut times_per_sequence: Vec<Vec<f64>> = Vec::new();
        let mut all_times = Vec::new();
        let mut prev_time: Option<f64> = None;
        let mut baselines = BTreeSet::new();
        let mut sequences = BTreeSet::new();
        let mut max_antenna = None;

        for row in 0..cols.len() {
            let field_id = cols.field_id[row];
            let (sequence_id, is_new_sequence) = tracker.advance(field_id);
            if is_new_sequence {
                times_per_sequence.push(Vec::new());
            }
            let time = cols.time[row];
            if is_new_sequence || prev_time != Some(time) {
                prev_time = Some(time);
                times_per_sequence[sequence_id].push(time);
                all_times.push(time);
            }
            let key = BaselineKey::new(
                cols.antenna1[row],
                cols.antenna2[row],
                band_of(&data_desc_to_band, cols.data_desc_id[row]),
                sequence_id,
            );
            max_antenna = max_antenna.max(Some(key.antenna2));
            baselines.insert((key.antenna1, key.antenna2));
            sequences.insert(Sequence { key, field_id });
        }

        let mut observation_times: Vec<_> = times_per_sequence
            .into_iter()
            .map(ObservationTimeIndex::new)
            .collect();
        all_times.sort_by(f64::total_cmp);
        all_times.dedup_by(|a, b| a.total_cmp(b).is_eq());
        if !interval.is_unbounded() {
            for times in &mut observation_times {
                times.trim(interval);
            }
            trim_times(&mut all_times, interval);
        }

        let antenna_count = antennas.len().max(max_antenna.map_or(0, |a| a + 1));
        debug!(
            "catalog of {}: {} rows, {} antennas, {} bands, {} sequences, {} time steps",
            table.path().display(),
            cols.len(),
            antenna_count,
            bands.len(),
            observation_times.len(),
            all_times.len()
        );

        Ok(Self {
            path: table.path().to_path_buf(),
            num_rows: cols.len(),
            telescope_name,
            antennas,
            antenna_count,
            bands,
            fields,
            polarizations,
            data_desc_to_band,
            baselines: baselines.into_iter().collect(),
            sequences: sequences.into_iter().collect(),
            observation_times,
            all_times,
        })
    }

    /// The path of the table this catalog describes.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The number of rows in the main table.
    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    /// The telescope name, if the table records one.
    pub fn telescope_name(&self) -> Option<&str> {
        self.telescope_name.as_deref()
    }

    /// The antenna table.
    pub fn antennas(&self) -> &[AntennaInfo] {
        &self.antennas
    }

    /// The number of antennas, large enough for every antenna index used in
    /// the main table.
    pub fn antenna_count(&self) -> usize {
        self.antenna_count
    }

    /// All bands.
    pub fn bands(&self) -> &[BandInfo] {
        &self.bands
    }

    /// A band by index.
    pub fn band(&self, band: usize) -> Option<&BandInfo> {
        self.bands.get(band)
    }

    /// The number of bands.
    pub fn band_count(&self) -> usize {
        self.bands.len()
    }

    /// The number of channels of `band`, 0 if there is no such band.
    pub fn channel_count(&self, band: usize) -> usize {
        self.bands.get(band).map_or(0, BandInfo::channel_count)
    }

    /// The field table.
    pub fn fields(&self) -> &[FieldInfo] {
        &self.fields
    }

    /// The number of fields.
    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// The correlation products of each cell.
    pub fn polarizations(&self) -> &[Polarization] {
        &self.polarizations
    }

    /// The number of correlation products per cell.
    pub fn polarization_count(&self) -> usize {
        self.polarizations.len()
    }

    /// The band of every data description.
    pub fn data_desc_to_band(&self) -> &[usize] {
        &self.data_desc_to_band
    }

    /// The distinct canonical antenna pairs in the main table.
    pub fn baselines(&self) -> &[(usize, usize)] {
        &self.baselines
    }

    /// Every sequence in the main table, sorted by key.
    pub fn sequences(&self) -> &[Sequence] {
        &self.sequences
    }

    /// The number of sequences.
    pub fn sequence_count(&self) -> usize {
        self.observation_times.len()
    }

    /// The time index of sequence `sequence_id`.
    pub fn observation_times(&self, sequence_id: usize) -> Option<&ObservationTimeIndex> {
        self.observation_times.get(sequence_id)
    }

    /// The time indices of all sequences.
    pub fn all_observation_time_indices(&self) -> &[ObservationTimeIndex] {
        &self.observation_times
    }

    /// The number of time steps of `sequence_id`, 0 if there is no such
    /// sequence.
    pub fn timestep_count(&self, sequence_id: usize) -> usize {
        self.observation_times
            .get(sequence_id)
            .map_or(0, ObservationTimeIndex::len)
    }

    /// The sorted timestamps of the whole table, after interval trimming.
    pub fn all_observation_times(&self) -> &[f64] {
        &self.all_times
    }

    /// A slice of [`MsMetadata::all_observation_times`], clamped to the
    /// available times.
    pub fn observation_times_in(&self, range: Range<usize>) -> &[f64] {
        let end = range.end.min(self.all_times.len());
        let start = range.start.min(end);
        &self.all_times[start..end]
    }

    /// Whether `key` is a sequence present in the main table.
    pub fn contains(&self, key: &BaselineKey) -> bool {
        self.sequences
            .binary_search_by(|s| s.key.cmp(key))
            .is_ok()
    }

    /// Check that every index of `key` refers to something in the catalog.
    ///
    /// # Errors
    ///
    /// Will return [`ReaderError::IndexOutOfRange`] naming the first index
    /// that is out of range.
    pub fn validate_key(&self, key: &BaselineKey) -> Result<(), ReaderError> {
        let checks = [
            ("antenna", key.antenna2, self.antenna_count),
            ("band", key.band, self.band_count()),
            ("sequence", key.sequence_id, self.sequence_count()),
        ];
        for (what, index, count) in checks {
            if index >= count {
                return Err(ReaderError::IndexOutOfRange { what, index, count });
            }
        }
        Ok(())
    }

    /// Check that `range` is a valid time range of the sequence of `key`.
    ///
    /// # Errors
    ///
    /// Will return [`ReaderError::InvalidTimeRange`] if the range is inverted
    /// or extends past the sequence.
    pub fn validate_range(&self, key: &BaselineKey, range: &Range<usize>) -> Result<(), ReaderError> {
        let count = self.timestep_count(key.sequence_id);
        if range.start > range.end || range.end > count {
            return Err(ReaderError::InvalidTimeRange {
                start: range.start,
                end: range.end,
                sequence_id: key.sequence_id,
                count,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{MemTable, MemTableBuilder};

    #[test]
    fn test_baseline_key_canonical() {
        let key = BaselineKey::new(5, 2, 1, 0);
        assert_eq!(key.antenna1, 2);
        assert_eq!(key.antenna2, 5);
        assert_eq!(key, BaselineKey::new(2, 5, 1, 0));
        assert_eq!(key.baseline_index(8), 21);
    }

    #[test]
    fn test_observation_time_index() {
        let index = ObservationTimeIndex::new(vec![3., 1., 2., 1.]);
        assert_eq!(index.times(), &[1., 2., 3.]);
        assert_eq!(index.index_of(1.), Some(0));
        assert_eq!(index.index_of(3.), Some(2));
        assert_eq!(index.index_of(2.5), None);
    }

    #[test]
    fn test_polarization_codes() {
        for code in 1..=12 {
            assert_eq!(Polarization::from_corr_type(code).corr_type(), code);
        }
        assert_eq!(Polarization::from_corr_type(9), Polarization::XX);
        assert_eq!(Polarization::from_corr_type(42), Polarization::Other(42));
        assert_eq!(format!("{}", Polarization::StokesI), "I");
        assert_eq!(format!("{}", Polarization::YX), "YX");
    }

    #[test]
    fn test_catalog_synthetic() {
        let mut table = MemTable::synthetic("synthetic.ms", 3, 4, 2, 5);
        let meta = MsMetadata::new(&mut table, &TimeInterval::default()).unwrap();
        assert_eq!(meta.num_rows(), 6 * 5);
        assert_eq!(meta.antenna_count(), 3);
        assert_eq!(meta.band_count(), 1);
        assert_eq!(meta.channel_count(0), 4);
        assert_eq!(meta.polarization_count(), 2);
        assert_eq!(meta.sequence_count(), 1);
        assert_eq!(meta.timestep_count(0), 5);
        assert_eq!(meta.baselines().len(), 6);
        assert_eq!(meta.sequences().len(), 6);
        assert_eq!(meta.all_observation_times().len(), 5);
        assert!(meta.contains(&BaselineKey::new(2, 1, 0, 0)));
        assert!(!meta.contains(&BaselineKey::new(1, 2, 0, 1)));
    }

    #[test]
    fn test_catalog_field_changes_start_sequences() {
        let table = MemTableBuilder::new("fields.ms")
            .antennas(2)
            .band(BandInfo::uniform(0, 150e6, 10e3, 2))
            .fields(2)
            .build();
        // field 0 for two times, field 1 for one time, then field 0 again
        for (time, field_id) in [(1., 0), (2., 0), (3., 1), (4., 0)] {
            table.push_synthetic_row(time, 0, 1, field_id, 0);
        }
        let mut table = table;
        let meta = MsMetadata::new(&mut table, &TimeInterval::default()).unwrap();
        assert_eq!(meta.sequence_count(), 3);
        assert_eq!(meta.timestep_count(0), 2);
        assert_eq!(meta.timestep_count(1), 1);
        assert_eq!(meta.timestep_count(2), 1);
        assert_eq!(meta.sequences()[2].field_id, 0);
        assert_eq!(meta.observation_times(2).unwrap().times(), &[4.]);
    }

    #[test]
    fn test_catalog_interval() {
        let mut table = MemTable::synthetic("interval.ms", 2, 1, 1, 5);
        let meta = MsMetadata::new(
            &mut table,
            &TimeInterval {
                start: Some(1),
                end: Some(3),
            },
        )
        .unwrap();
        assert_eq!(meta.timestep_count(0), 2);
        let all = meta.all_observation_times().to_vec();
        assert_eq!(meta.observation_times(0).unwrap().times(), all.as_slice());
        assert_eq!(meta.observation_times_in(1..10).len(), 1);

        let meta = MsMetadata::new(
            &mut table,
            &TimeInterval {
                start: Some(7),
                end: None,
            },
        )
        .unwrap();
        assert_eq!(meta.timestep_count(0), 0);
    }

    #[test]
    fn test_validate() {
        let mut table = MemTable::synthetic("validate.ms", 2, 1, 1, 3);
        let meta = MsMetadata::new(&mut table, &TimeInterval::default()).unwrap();
        let key = BaselineKey::new(0, 1, 0, 0);
        assert!(meta.validate_key(&key).is_ok());
        assert!(meta.validate_range(&key, &(0..3)).is_ok());
        assert!(matches!(
            meta.validate_key(&BaselineKey::new(0, 2, 0, 0)),
            Err(ReaderError::IndexOutOfRange { what: "antenna", .. })
        ));
        assert!(matches!(
            meta.validate_key(&BaselineKey::new(0, 1, 1, 0)),
            Err(ReaderError::IndexOutOfRange { what: "band", .. })
        ));
        assert!(matches!(
            meta.validate_range(&key, &(1..4)),
            Err(ReaderError::InvalidTimeRange { count: 3, .. })
        ));
    }
}
