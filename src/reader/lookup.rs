//! Where each baseline time series lives in the reordered files.

use std::ops::Range;

use log::debug;

use crate::metadata::{BaselineKey, MsMetadata};

/// The contiguous block of samples one time series occupies.
///
/// A sample is one channel of one polarization at one time step; samples are
/// ordered time, then channel, then polarization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    /// The time series stored here
    pub key: BaselineKey,
    /// Index of the first sample
    pub offset: u64,
    /// Number of time steps, which is always the sequence length
    pub timesteps: usize,
    /// Samples per time step, `channels * polarizations`
    pub samples_per_step: usize,
}

impl Region {
    /// The number of samples in the region.
    pub fn len(&self) -> u64 {
        self.timesteps as u64 * self.samples_per_step as u64
    }

    /// Whether the region holds no samples.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The samples of the region.
    pub fn sample_range(&self) -> Range<u64> {
        self.offset..self.offset + self.len()
    }

    /// The samples of time steps `time_range` of the region.
    pub fn samples_of(&self, time_range: &Range<usize>) -> Range<u64> {
        let step = self.samples_per_step as u64;
        self.offset + time_range.start as u64 * step..self.offset + time_range.end as u64 * step
    }
}

/// Maps `(sequence, band, antenna1 * antenna_count + antenna2)` to a
/// [`Region`]. Regions are laid out back to back in catalog order, so they
/// never overlap and exactly cover `0..total_samples()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceIndexLookupTable {
    antenna_count: usize,
    table: Vec<Vec<Vec<Option<usize>>>>,
    regions: Vec<Region>,
    total_samples: u64,
}

impl SequenceIndexLookupTable {
    /// Lay out every sequence of the catalog.
    pub fn new(meta: &MsMetadata) -> Self {
        let antenna_count = meta.antenna_count();
        let pol_count = meta.polarization_count();
        let mut table = vec![vec![Vec::new(); meta.band_count()]; meta.sequence_count()];
        let mut regions = Vec::with_capacity(meta.sequences().len());
        let mut total_samples = 0;
        for sequence in meta.sequences() {
            let key = sequence.key;
            let Some(bands) = table.get_mut(key.sequence_id) else {
                continue;
            };
            let Some(baselines) = bands.get_mut(key.band) else {
                continue;
            };
            if baselines.is_empty() {
                *baselines = vec![None; antenna_count * antenna_count];
            }
            let region = Region {
                key,
                offset: total_samples,
                timesteps: meta.timestep_count(key.sequence_id),
                samples_per_step: meta.channel_count(key.band) * pol_count,
            };
            baselines[key.baseline_index(antenna_count)] = Some(regions.len());
            total_samples += region.len();
            regions.push(region);
        }
        debug!(
            "lookup table: {} regions, {} samples",
            regions.len(),
            total_samples
        );
        Self {
            antenna_count,
            table,
            regions,
            total_samples,
        }
    }

    /// The index of the region of `key` in [`SequenceIndexLookupTable::regions`].
    pub fn region_index(&self, key: &BaselineKey) -> Option<usize> {
        if key.antenna2 >= self.antenna_count {
            return None;
        }
        *self
            .table
            .get(key.sequence_id)?
            .get(key.band)?
            .get(key.baseline_index(self.antenna_count))?
    }

    /// The region of `key`, if the table has any rows for it.
    pub fn get(&self, key: &BaselineKey) -> Option<&Region> {
        self.region_index(key).map(|i| &self.regions[i])
    }

    /// All regions, in file order.
    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// The total number of samples in the reordered files.
    pub fn total_samples(&self) -> u64 {
        self.total_samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        io::{MemTable, MemTableBuilder},
        metadata::{BandInfo, TimeInterval},
    };

    #[test]
    fn test_layout_synthetic() {
        let mut table = MemTable::synthetic("lookup.ms", 3, 4, 2, 5);
        let meta = MsMetadata::new(&mut table, &TimeInterval::default()).unwrap();
        let lookup = SequenceIndexLookupTable::new(&meta);
        assert_eq!(lookup.regions().len(), 6);
        assert_eq!(lookup.total_samples(), 6 * 5 * 4 * 2);
        let region = lookup.get(&BaselineKey::new(1, 0, 0, 0)).unwrap();
        assert_eq!(region.offset, 40);
        assert_eq!(region.samples_of(&(2..3)), 56..64);
        assert!(lookup.get(&BaselineKey::new(0, 1, 0, 1)).is_none());
        assert!(lookup.get(&BaselineKey::new(0, 7, 0, 0)).is_none());
    }

    #[test]
    fn test_regions_tile_the_file() {
        let table = MemTableBuilder::new("tiling.ms")
            .antennas(3)
            .band(BandInfo::uniform(0, 100e6, 1e3, 2))
            .band(BandInfo::uniform(1, 200e6, 1e3, 5))
            .fields(2)
            .build();
        let mut time = 0.;
        for (field_id, steps) in [(0, 3), (1, 2), (0, 4)] {
            for _ in 0..steps {
                time += 1.;
                for (a1, a2, dd) in [(0, 1, 0), (1, 2, 1), (0, 2, 0), (2, 2, 1)] {
                    table.push_synthetic_row(time, a1, a2, field_id, dd);
                }
            }
        }
        let mut table = table;
        let meta = MsMetadata::new(&mut table, &TimeInterval::default()).unwrap();
        let lookup = SequenceIndexLookupTable::new(&meta);
        assert_eq!(lookup.regions().len(), 12);

        let mut ranges: Vec<_> = lookup.regions().iter().map(Region::sample_range).collect();
        ranges.sort_by_key(|r| r.start);
        let mut expected_start = 0;
        for range in &ranges {
            assert_eq!(range.start, expected_start);
            assert!(range.end > range.start);
            expected_start = range.end;
        }
        assert_eq!(expected_start, lookup.total_samples());

        for (index, region) in lookup.regions().iter().enumerate() {
            assert_eq!(lookup.region_index(&region.key), Some(index));
            let per_step = meta.channel_count(region.key.band) * 2;
            assert_eq!(region.samples_per_step, per_step);
        }
    }
}
