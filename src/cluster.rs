use crate::tiling::Region;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Label of a superpixel. Unique in the whole mosaic, `UNASSIGNED` is never a seed.
pub type Label = u32;

pub const UNASSIGNED: Label = 0;

/// SLIC seed/superpixel.
///
/// Fields `x`, `y`, `spectral` and `num_members` are updated by `TileWorker::step()`. Coordinates
/// are in the full image's space.
#[derive(Debug, Clone)]
pub struct Seed {
    pub label: Label,
    /// x position of center (column, fractional)
    pub x: f64,
    /// y position of center
    pub y: f64,
    /// Mean spectral vector of the members.
    pub spectral: Vec<f64>,
    /// Number of pixels assigned in the last iteration.
    pub num_members: u64,
    /// Live seeds see their whole search window inside the tile and follow their members.
    /// Frozen seeds only compete for pixels at the tile's outer edge.
    pub live: bool,
    // Search window in tile-local pixel coordinates (inclusive), refreshed by
    // `Seed::update_coords()` before every assign step.
    pub(crate) top: usize,
    pub(crate) bottom: usize,
    pub(crate) left: usize,
    pub(crate) right: usize,
}

impl Seed {
    pub fn new(label: Label, x: f64, y: f64, spectral: Vec<f64>, live: bool) -> Self {
        Self {
            label,
            x,
            y,
            spectral,
            num_members: 0,
            live,
            top: 0,
            bottom: 0,
            left: 0,
            right: 0,
        }
    }

    /// Clips the search window `center ± radius` to `region` and stores it in local coordinates.
    /// Returns `false` if the window misses the region completely.
    pub(crate) fn update_coords(&mut self, region: &Region, radius: usize) -> bool {
        let radius = radius as f64;
        let left = (self.x - radius).ceil().max(region.x as f64);
        let top = (self.y - radius).ceil().max(region.y as f64);
        let right = (self.x + radius).floor().min((region.right() - 1) as f64);
        let bottom = (self.y + radius).floor().min((region.bottom() - 1) as f64);
        if left > right || top > bottom {
            return false;
        }
        self.left = left as usize - region.x;
        self.right = right as usize - region.x;
        self.top = top as usize - region.y;
        self.bottom = bottom as usize - region.y;
        true
    }

    /// Movement between two states of the same seed: spatial displacement in pixels plus the L2
    /// distance of the spectral means.
    pub fn displacement(&self, x: f64, y: f64, spectral: &[f64]) -> f64 {
        let spatial = (self.x - x).hypot(self.y - y);
        let spectral: f64 = self
            .spectral
            .iter()
            .zip(spectral)
            .map(|(a, b)| (a - b) * (a - b))
            .sum();
        spatial + spectral.sqrt()
    }
}

/// Running aggregates of the pixels assigned to one label. Positions are summed as integers so
/// the centers don't depend on the order in which pixels were added.
#[derive(Debug, Clone, PartialEq)]
pub struct CentroidRecord {
    pub count: u64,
    pub sum_x: u64,
    pub sum_y: u64,
    pub sum_spectral: Vec<f64>,
}

impl CentroidRecord {
    pub fn new(bands: usize) -> Self {
        Self {
            count: 0,
            sum_x: 0,
            sum_y: 0,
            sum_spectral: vec![0.0; bands],
        }
    }

    #[inline(always)]
    pub fn add(&mut self, x: usize, y: usize, pixel: &[f32]) {
        self.count += 1;
        self.sum_x += x as u64;
        self.sum_y += y as u64;
        for (acc, v) in self.sum_spectral.iter_mut().zip(pixel) {
            *acc += *v as f64;
        }
    }

    #[inline(always)]
    pub fn remove(&mut self, x: usize, y: usize, pixel: &[f32]) {
        debug_assert!(self.count > 0, "removing pixel ({x}, {y}) from empty record");
        self.count -= 1;
        self.sum_x -= x as u64;
        self.sum_y -= y as u64;
        for (acc, v) in self.sum_spectral.iter_mut().zip(pixel) {
            *acc -= *v as f64;
        }
    }

    pub fn center(&self) -> Option<(f64, f64)> {
        if self.count == 0 {
            return None;
        }
        let n = self.count as f64;
        Some((self.sum_x as f64 / n, self.sum_y as f64 / n))
    }

    pub fn mean_spectral(&self) -> Option<Vec<f64>> {
        if self.count == 0 {
            return None;
        }
        let n = self.count as f64;
        Some(self.sum_spectral.iter().map(|s| s / n).collect())
    }
}

/// Sparse label -> centroid record map. Labels are global and sparse, a tile only holds records
/// for the seeds it owns.
#[derive(Debug, Clone, Default)]
pub struct CentroidTable {
    records: HashMap<Label, CentroidRecord>,
    bands: usize,
}

impl CentroidTable {
    pub fn new(bands: usize) -> Self {
        Self {
            records: HashMap::new(),
            bands,
        }
    }

    /// Moves the pixel at global (`x`, `y`) from label `from` to label `to`. `UNASSIGNED` on
    /// either side means the pixel enters or leaves the table.
    #[inline(always)]
    pub fn transfer(&mut self, from: Label, to: Label, x: usize, y: usize, pixel: &[f32]) {
        if from == to {
            return;
        }
        if from != UNASSIGNED {
            if let Some(record) = self.records.get_mut(&from) {
                record.remove(x, y, pixel);
            }
        }
        if to != UNASSIGNED {
            let bands = self.bands;
            self.records
                .entry(to)
                .or_insert_with(|| CentroidRecord::new(bands))
                .add(x, y, pixel);
        }
    }

    pub fn get(&self, label: Label) -> Option<&CentroidRecord> {
        self.records.get(&label)
    }

    pub fn count(&self, label: Label) -> u64 {
        self.records.get(&label).map_or(0, |r| r.count)
    }

    /// Drops the record of a retired label.
    pub fn retire(&mut self, label: Label) -> Option<CentroidRecord> {
        self.records.remove(&label)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Persisted form of a seed, one entry of the tile's centroid table file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeedSnapshot {
    pub label: Label,
    pub x: f64,
    pub y: f64,
    pub num_members: u64,
    pub spectral: Vec<f64>,
    pub live: bool,
}

impl From<&Seed> for SeedSnapshot {
    fn from(seed: &Seed) -> Self {
        Self {
            label: seed.label,
            x: seed.x,
            y: seed.y,
            num_members: seed.num_members,
            spectral: seed.spectral.clone(),
            live: seed.live,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CentroidRecord, CentroidTable, Seed, UNASSIGNED};
    use crate::tiling::Region;

    #[test]
    fn record_add_remove_test() {
        let mut record = CentroidRecord::new(2);
        record.add(10, 20, &[1.0, 2.0]);
        record.add(12, 22, &[3.0, 4.0]);
        assert_eq!(record.center(), Some((11.0, 21.0)));
        assert_eq!(record.mean_spectral(), Some(vec![2.0, 3.0]));
        record.remove(10, 20, &[1.0, 2.0]);
        assert_eq!(record.center(), Some((12.0, 22.0)));
        record.remove(12, 22, &[3.0, 4.0]);
        assert_eq!(record.center(), None);
        assert_eq!(record.mean_spectral(), None);
    }

    #[test]
    fn table_transfer_test() {
        let mut table = CentroidTable::new(1);
        table.transfer(UNASSIGNED, 7, 1, 1, &[5.0]);
        table.transfer(UNASSIGNED, 7, 3, 1, &[7.0]);
        table.transfer(UNASSIGNED, 9, 2, 2, &[1.0]);
        assert_eq!(table.len(), 2);
        assert_eq!(table.get(7).unwrap().center(), Some((2.0, 1.0)));
        table.transfer(7, 9, 3, 1, &[7.0]);
        assert_eq!(table.count(7), 1);
        assert_eq!(table.count(9), 2);
        assert_eq!(table.get(9).unwrap().mean_spectral(), Some(vec![4.0]));
        // same label is a no-op
        table.transfer(9, 9, 2, 2, &[1.0]);
        assert_eq!(table.count(9), 2);
        assert!(table.retire(7).is_some());
        assert_eq!(table.count(7), 0);
    }

    #[test]
    fn seed_window_test() {
        let region = Region::new(10, 20, 30, 30);
        let mut seed = Seed::new(1, 12.5, 45.0, vec![0.0], true);
        assert!(seed.update_coords(&region, 4));
        // x: ceil(8.5)=9 -> clipped to 10, floor(16.5)=16
        assert_eq!((seed.left, seed.right), (0, 6));
        // y: 41..=49, bottom clipped to 49
        assert_eq!((seed.top, seed.bottom), (21, 29));
        let mut far = Seed::new(2, 100.0, 100.0, vec![0.0], false);
        assert!(!far.update_coords(&region, 4));
    }

    #[test]
    fn displacement_test() {
        let seed = Seed::new(1, 3.0, 4.0, vec![1.0, 1.0], true);
        let d = seed.displacement(0.0, 0.0, &[1.0, 1.0]);
        assert!((d - 5.0).abs() < 1e-12);
        let d = seed.displacement(3.0, 4.0, &[4.0, 5.0]);
        assert!((d - 5.0).abs() < 1e-12);
    }
}
