use crate::arrays::{Array2D, MultiBandImage};
use crate::assign::assign;
use crate::cluster::{CentroidTable, Label, Seed, SeedSnapshot, UNASSIGNED};
use crate::common::Config;
use crate::conectivity::enforce_connectivity;
use crate::error::{Error, Result};
use crate::tiling::{Region, Tile};
use log::{debug, warn};
use multiversion::multiversion;
use std::collections::HashSet;

/// Lifecycle of a tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TileState {
    Seeding,
    Iterating,
    /// The residual dropped bellow the threshold.
    Converged,
    /// `max_iterations` were done without converging. Not an error, the last labeling is used.
    MaxIterationsReached,
    Finalizing,
    Persisted,
}

/// The regular seed grid of the full image. Seed (gx, gy) starts at
/// `(gx * S + S / 2, gy * S + S / 2)` and carries the label `gy * seeds_x + gx + 1`, so labels
/// are unique across tiles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeedGrid {
    pub image_width: usize,
    pub image_height: usize,
    pub spacing: usize,
    pub seeds_x: usize,
    pub seeds_y: usize,
}

impl SeedGrid {
    pub fn new(image_width: usize, image_height: usize, spacing: usize) -> Self {
        debug_assert!(spacing >= 2 && image_width >= spacing && image_height >= spacing);
        let count = |length: usize| (length - spacing / 2).div_ceil(spacing);
        Self {
            image_width,
            image_height,
            spacing,
            seeds_x: count(image_width),
            seeds_y: count(image_height),
        }
    }

    pub fn len(&self) -> usize {
        self.seeds_x * self.seeds_y
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline(always)]
    pub fn center(&self, gx: usize, gy: usize) -> (usize, usize) {
        (
            gx * self.spacing + self.spacing / 2,
            gy * self.spacing + self.spacing / 2,
        )
    }

    #[inline(always)]
    pub fn label(&self, gx: usize, gy: usize) -> Label {
        (gy * self.seeds_x + gx + 1) as Label
    }

    /// Grid indices along one axis whose window `center ± radius` touches `start..end`.
    fn axis_range(&self, start: usize, end: usize, radius: usize, count: usize) -> std::ops::Range<usize> {
        let half = self.spacing / 2;
        let first = start.saturating_sub(radius + half).div_ceil(self.spacing).min(count);
        let last = ((end - 1 + radius).saturating_sub(half) / self.spacing + 1).min(count);
        first..last.max(first)
    }

    /// Seeds whose search window touches `region`.
    pub fn seeds_reaching(&self, region: &Region, radius: usize) -> Vec<(usize, usize)> {
        let xs = self.axis_range(region.x, region.right(), radius, self.seeds_x);
        let ys = self.axis_range(region.y, region.bottom(), radius, self.seeds_y);
        let mut seeds = Vec::with_capacity(xs.len() * ys.len());
        for gy in ys {
            for gx in xs.clone() {
                let (cx, cy) = self.center(gx, gy);
                let reaches_x = cx + radius >= region.x && cx <= region.right() - 1 + radius;
                let reaches_y = cy + radius >= region.y && cy <= region.bottom() - 1 + radius;
                if reaches_x && reaches_y {
                    seeds.push((gx, gy));
                }
            }
        }
        seeds
    }

    /// Search window of a seed at its initial position, clipped to the image.
    pub fn initial_window(&self, gx: usize, gy: usize, radius: usize) -> Region {
        let (cx, cy) = self.center(gx, gy);
        let x = cx.saturating_sub(radius);
        let y = cy.saturating_sub(radius);
        let right = (cx + radius + 1).min(self.image_width);
        let bottom = (cy + radius + 1).min(self.image_height);
        Region::new(x, y, right - x, bottom - y)
    }
}

/// Output of `TileWorker::finalize()`: the core region's labels, ready to be persisted.
#[derive(Debug)]
pub struct FinalizedTile {
    pub tile_index: usize,
    pub core: Region,
    pub labels: Array2D<Label>,
    pub seeds: Vec<SeedSnapshot>,
    /// `Converged` or `MaxIterationsReached`.
    pub outcome: TileState,
    pub iterations: u32,
    pub residual: f64,
    /// Pixels moved to another label to keep every label connected, margin included.
    pub corrections: usize,
}

impl FinalizedTile {
    pub fn num_labels(&self) -> usize {
        self.labels.data.iter().collect::<HashSet<_>>().len()
    }
}

/// SLIC engine for one tile.
///
/// The worker holds the margin-inclusive region of the tile. It seeds the grid seeds reaching
/// that region, iterates assign/update until the residual drops bellow `Config::threshold` or
/// `Config::max_iterations` is hit, and finally cuts the core region out.
pub struct TileWorker<'a> {
    tile: &'a Tile,
    config: &'a Config,
    image: MultiBandImage,
    seeds: Vec<Seed>,
    table: CentroidTable,
    /// Labels of the last finished iteration.
    labels: Array2D<Label>,
    /// Scratch buffer the assign step writes into.
    next_labels: Array2D<Label>,
    min_distances: Array2D<f64>,
    retired: Vec<Label>,
    state: TileState,
    iterations: u32,
    residual: f64,
}

impl<'a> TileWorker<'a> {
    /// Seeds the tile. `image` must be the tile's margin-inclusive region.
    pub fn new(tile: &'a Tile, config: &'a Config, grid: &SeedGrid, image: MultiBandImage) -> Result<Self> {
        let region = tile.extended;
        if image.width != region.width || image.height != region.height {
            return Err(Error::InputRegion {
                tile: tile.index,
                reason: format!(
                    "expected {}x{} pixels, got {}x{}",
                    region.width, region.height, image.width, image.height
                ),
            });
        }
        let mut worker = Self {
            tile,
            config,
            seeds: Vec::new(),
            table: CentroidTable::new(image.bands),
            labels: Array2D::from_fill(UNASSIGNED, region.width, region.height),
            next_labels: Array2D::from_fill(UNASSIGNED, region.width, region.height),
            min_distances: Array2D::from_fill(f64::INFINITY, region.width, region.height),
            image,
            retired: Vec::new(),
            state: TileState::Seeding,
            iterations: 0,
            residual: f64::INFINITY,
        };
        worker.seed(grid);
        worker.state = TileState::Iterating;
        Ok(worker)
    }

    fn seed(&mut self, grid: &SeedGrid) {
        let region = self.tile.extended;
        let radius = self.config.search_radius();
        for (gx, gy) in grid.seeds_reaching(&region, radius) {
            let (cx, cy) = grid.center(gx, gy);
            // seeds outside of the region take the spectral value of the closest pixel
            let local_x = cx.clamp(region.x, region.right() - 1) - region.x;
            let local_y = cy.clamp(region.y, region.bottom() - 1) - region.y;
            let spectral = self
                .image
                .get_pixel(local_x, local_y)
                .iter()
                .map(|v| *v as f64)
                .collect();
            let live = region.contains_region(&grid.initial_window(gx, gy, radius));
            self.seeds.push(Seed::new(
                grid.label(gx, gy),
                cx as f64,
                cy as f64,
                spectral,
                live,
            ));
        }
        debug!(
            "tile {}: {} seeds ({} live)",
            self.tile.index,
            self.seeds.len(),
            self.seeds.iter().filter(|s| s.live).count()
        );
    }

    /// One assign/update iteration. Returns the residual: the largest displacement of a live
    /// seed.
    pub fn step(&mut self) -> f64 {
        assign(
            &self.image,
            &self.tile.extended,
            self.config,
            &mut self.seeds,
            &self.labels,
            &mut self.next_labels,
            &mut self.min_distances,
        );
        accumulate(
            &self.image,
            &self.tile.extended,
            &self.labels,
            &self.next_labels,
            &mut self.table,
        );
        std::mem::swap(&mut self.labels, &mut self.next_labels);

        let mut residual: f64 = 0.0;
        let mut retired = Vec::new();
        for seed in self.seeds.iter_mut() {
            let record = self.table.get(seed.label);
            seed.num_members = record.map_or(0, |r| r.count);
            if !seed.live {
                continue;
            }
            let (Some((x, y)), Some(spectral)) = (
                record.and_then(|r| r.center()),
                record.and_then(|r| r.mean_spectral()),
            ) else {
                retired.push(seed.label);
                continue;
            };
            residual = residual.max(seed.displacement(x, y, &spectral));
            seed.x = x;
            seed.y = y;
            seed.spectral = spectral;
        }
        if !retired.is_empty() {
            debug!(
                "tile {}: dropping {} empty seeds",
                self.tile.index,
                retired.len()
            );
            self.seeds.retain(|s| !retired.contains(&s.label));
            for label in &retired {
                self.table.retire(*label);
            }
            self.retired.extend(retired);
        }
        self.iterations += 1;
        self.residual = residual;
        residual
    }

    /// Iterates until convergence or `max_iterations`.
    pub fn run(&mut self) -> TileState {
        while self.iterations < self.config.max_iterations {
            let residual = self.step();
            debug!(
                "tile {}: iteration {} residual {residual:.6}",
                self.tile.index, self.iterations
            );
            if residual < self.config.threshold {
                self.state = TileState::Converged;
                return self.state;
            }
        }
        warn!(
            "tile {} did not converge in {} iterations (residual {:.6} >= {})",
            self.tile.index, self.iterations, self.residual, self.config.threshold
        );
        self.state = TileState::MaxIterationsReached;
        self.state
    }

    /// Cuts the core region out and makes every label in it a single connected region.
    ///
    /// Fragments are first repaired over the whole margin-inclusive region, like an untiled run
    /// does, so the core matches it. Only labels the crop itself splits are repaired again inside
    /// the core.
    pub fn finalize(mut self) -> Result<FinalizedTile> {
        let outcome = self.state;
        debug_assert!(
            matches!(outcome, TileState::Converged | TileState::MaxIterationsReached),
            "finalizing tile in state {outcome:?}"
        );
        self.state = TileState::Finalizing;
        let core = self.tile.core;
        let extended = self.tile.extended;
        let fragments = enforce_connectivity(&mut self.labels);
        let mut labels = self.labels.crop(
            core.x - extended.x,
            core.y - extended.y,
            core.width,
            core.height,
        )?;
        let seam = enforce_connectivity(&mut labels);
        if seam > 0 {
            debug!(
                "tile {}: {seam} seam pixels relabeled to keep superpixels connected",
                self.tile.index
            );
        }
        let corrections = fragments + seam;
        Ok(FinalizedTile {
            tile_index: self.tile.index,
            core,
            labels,
            seeds: self.seeds.iter().map(SeedSnapshot::from).collect(),
            outcome,
            iterations: self.iterations,
            residual: self.residual,
            corrections,
        })
    }

    pub fn state(&self) -> TileState {
        self.state
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    pub fn residual(&self) -> f64 {
        self.residual
    }

    pub fn seeds(&self) -> &[Seed] {
        &self.seeds
    }

    pub fn table(&self) -> &CentroidTable {
        &self.table
    }

    /// Labels of the margin-inclusive region after the last iteration.
    pub fn labels(&self) -> &Array2D<Label> {
        &self.labels
    }

    /// Labels dropped because their seed lost all pixels. They are never reused.
    pub fn retired(&self) -> &[Label] {
        &self.retired
    }
}

/// This function does the update step's reduction: pixels whose label changed between
/// `previous` and `next` are moved between centroid records, in raster order.
#[multiversion(targets = "simd")]
fn accumulate(
    image: &MultiBandImage,
    region: &Region,
    previous: &Array2D<Label>,
    next: &Array2D<Label>,
    table: &mut CentroidTable,
) {
    for row in 0..next.height {
        let image_row = image.get_row(row);
        for (column, ((old, new), pixel)) in previous
            .get_row(row)
            .iter()
            .zip(next.get_row(row))
            .zip(image_row.chunks_exact(image.bands))
            .enumerate()
        {
            if old != new {
                table.transfer(*old, *new, region.x + column, region.y + row, pixel);
            }
        }
    }
}
