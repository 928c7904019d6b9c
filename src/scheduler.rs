use crate::common::{split_length_to_ranges, Config, WorkerDistribution};
use crate::error::{Error, Result};
use crate::mosaic::MosaicDescriptor;
use crate::raster::{load_persisted, persist_tile, RasterSource, RunParameters, TileManifest};
use crate::slic::{SeedGrid, TileState, TileWorker};
use crate::tiling::{compute_partition, Partition, Tile};
use log::{debug, info};
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;

/// Summary of one processed tile.
#[derive(Debug, Clone, PartialEq)]
pub struct TileReport {
    pub tile: usize,
    pub converged: bool,
    pub iterations: u32,
    pub num_labels: usize,
    pub corrections: usize,
    /// The persisted result of an earlier run was reused.
    pub resumed: bool,
}

impl TileReport {
    fn new(manifest: &TileManifest, resumed: bool) -> Self {
        Self {
            tile: manifest.tile,
            converged: manifest.converged,
            iterations: manifest.iterations,
            num_labels: manifest.num_labels,
            corrections: manifest.corrections,
            resumed,
        }
    }
}

/// Tile indices handled by each worker.
pub fn distribute(
    num_tiles: usize,
    workers: usize,
    distribution: WorkerDistribution,
) -> Vec<Vec<usize>> {
    let workers = workers.clamp(1, num_tiles.max(1));
    match distribution {
        WorkerDistribution::RoundRobin => (0..workers)
            .map(|w| (w..num_tiles).step_by(workers).collect())
            .collect(),
        WorkerDistribution::Block => split_length_to_ranges(num_tiles, workers)
            .into_iter()
            .map(|r| r.collect())
            .collect(),
    }
}

/// Drives the segmentation of a whole raster: partitions it, runs one `TileWorker` per tile on
/// a pool of `Config::num_workers` workers and assembles the mosaic descriptor.
pub struct TileScheduler<'a, S: RasterSource> {
    config: &'a Config,
    source: &'a S,
}

impl<'a, S: RasterSource> TileScheduler<'a, S> {
    pub fn new(config: &'a Config, source: &'a S) -> Self {
        Self { config, source }
    }

    pub fn compute_partition(&self) -> Result<Partition> {
        compute_partition(
            self.source.width(),
            self.source.height(),
            self.source.bands(),
            self.config,
        )
    }

    /// Processes every tile of `partition` and writes the mosaic descriptor.
    ///
    /// The descriptor is only written after all workers finished. If any tile fails, the error
    /// is returned and no descriptor is written.
    pub fn run(&self, partition: &Partition) -> Result<MosaicDescriptor> {
        let reports = self.run_tiles(partition)?;
        let converged = reports.iter().filter(|r| r.converged).count();
        let resumed = reports.iter().filter(|r| r.resumed).count();
        let corrections: usize = reports.iter().map(|r| r.corrections).sum();
        info!(
            "{} tiles done: {converged} converged, {resumed} reused, {corrections} pixels relabeled for connectivity",
            reports.len()
        );
        let descriptor = MosaicDescriptor::new(&self.config.temp_dir, &self.config.prefix, partition);
        descriptor.write()?;
        Ok(descriptor)
    }

    /// Processes every tile of `partition`, returns the reports ordered by tile index.
    pub fn run_tiles(&self, partition: &Partition) -> Result<Vec<TileReport>> {
        let temp_dir = &self.config.temp_dir;
        std::fs::create_dir_all(temp_dir).map_err(|e| Error::io(temp_dir, e))?;

        let grid = SeedGrid::new(
            partition.image_width,
            partition.image_height,
            self.config.seed_spacing as usize,
        );
        let parameters = RunParameters::new(self.config, &grid);
        let assignments = distribute(
            partition.tiles.len(),
            self.config.workers(),
            self.config.distribution,
        );
        let pool = ThreadPoolBuilder::new()
            .num_threads(assignments.len())
            .thread_name(|i| format!("tile-worker-{i}"))
            .build()
            .map_err(|e| Error::Configuration(format!("unable to start workers: {e}")))?;
        info!(
            "processing {} tiles on {} workers",
            partition.tiles.len(),
            assignments.len()
        );

        // Collecting every worker's result is the only synchronization point.
        let results: Vec<Result<Vec<TileReport>>> = pool.install(|| {
            assignments
                .into_par_iter()
                .map(|tiles| {
                    tiles
                        .into_iter()
                        .map(|i| self.process_tile(&partition.tiles[i], &grid, &parameters))
                        .collect::<Result<Vec<_>>>()
                })
                .collect()
        });

        let mut reports = Vec::with_capacity(partition.tiles.len());
        for result in results {
            reports.extend(result?);
        }
        reports.sort_unstable_by_key(|r| r.tile);
        Ok(reports)
    }

    fn process_tile(
        &self,
        tile: &Tile,
        grid: &SeedGrid,
        parameters: &RunParameters,
    ) -> Result<TileReport> {
        if self.config.resume {
            if let Some(manifest) = load_persisted(tile, parameters) {
                debug!("tile {}: reusing {}", tile.index, tile.artifacts.labels.display());
                return Ok(TileReport::new(&manifest, true));
            }
        }
        let image = self
            .source
            .read_region(&tile.extended)
            .map_err(|e| match e {
                Error::Array(e) => Error::InputRegion {
                    tile: tile.index,
                    reason: e.to_string(),
                },
                other => other,
            })?;
        let mut worker = TileWorker::new(tile, self.config, grid, image)?;
        let outcome = worker.run();
        let finalized = worker.finalize()?;
        let manifest = persist_tile(&tile.artifacts, &finalized, parameters)?;
        debug!(
            "tile {} {:?} after {} iterations, {} labels",
            tile.index, outcome, manifest.iterations, manifest.num_labels
        );
        debug_assert!(matches!(
            outcome,
            TileState::Converged | TileState::MaxIterationsReached
        ));
        Ok(TileReport::new(&manifest, false))
    }
}

#[cfg(test)]
mod tests {
    use super::{distribute, TileScheduler};
    use crate::arrays::{Array2D, MultiBandImage};
    use crate::cluster::Label;
    use crate::common::{Config, TilingMode, WorkerDistribution};
    use crate::conectivity::label_components;
    use crate::conectivity::tests::assert_labels_connected;
    use crate::error::{Error, Result};
    use crate::raster::RasterSource;
    use crate::slic::tests::textured_image;
    use crate::tiling::Region;
    use std::collections::HashSet;
    use std::path::Path;

    fn config(dir: &Path, tiling: TilingMode) -> Config {
        Config {
            seed_spacing: 20,
            threshold: 0.001,
            margin: 1,
            tiling,
            temp_dir: dir.to_path_buf(),
            ..Config::default()
        }
    }

    fn segment<S: RasterSource>(source: &S, config: &Config) -> Result<Vec<u32>> {
        let scheduler = TileScheduler::new(config, source);
        let partition = scheduler.compute_partition()?;
        let descriptor = scheduler.run(&partition)?;
        Ok(descriptor.read_labels()?.data.to_vec())
    }

    #[test]
    fn distribute_test() {
        use WorkerDistribution::{Block, RoundRobin};
        assert_eq!(
            distribute(7, 3, RoundRobin),
            vec![vec![0, 3, 6], vec![1, 4], vec![2, 5]]
        );
        assert_eq!(
            distribute(7, 3, Block),
            vec![vec![0, 1, 2], vec![3, 4], vec![5, 6]]
        );
        assert_eq!(distribute(2, 8, RoundRobin), vec![vec![0], vec![1]]);
        assert_eq!(distribute(5, 1, Block), vec![vec![0, 1, 2, 3, 4]]);
    }

    #[test]
    fn tiled_run_matches_single_tile_test() {
        let image = MultiBandImage::from_fill(128.0, 100, 100, 1);
        let single_dir = tempfile::tempdir().unwrap();
        let tiled_dir = tempfile::tempdir().unwrap();
        let single = segment(
            &image,
            &config(single_dir.path(), TilingMode::Manual { nx: 1, ny: 1 }),
        )
        .unwrap();
        let tiled = segment(
            &image,
            &config(tiled_dir.path(), TilingMode::Manual { nx: 2, ny: 2 }),
        )
        .unwrap();
        assert_eq!(single, tiled);
        assert_eq!(tiled.iter().collect::<HashSet<_>>().len(), 25);
        assert!(tiled_dir.path().join("slic.vrt").exists());
        assert!(tiled_dir.path().join("slic_1_1.raw").exists());
        assert!(tiled_dir.path().join("slic_1_1_seeds.json").exists());
    }

    /// Labels with more than one 8-connected component in `labels`.
    fn split_labels(labels: &Array2D<Label>) -> HashSet<Label> {
        let cc_set = label_components(labels);
        let mut seen = HashSet::new();
        cc_set
            .component_leaders
            .iter()
            .map(|leader| labels.data[*leader as usize])
            .filter(|label| !seen.insert(*label))
            .collect()
    }

    #[test]
    fn wide_margin_matches_single_tile_on_texture_test() {
        let (width, height) = (160, 120);
        let image = textured_image(width, height);
        let params = |dir: &Path, tiling| Config {
            seed_spacing: 8,
            distance_weight: 0.5,
            max_iterations: 3,
            threshold: 0.0,
            margin: 8,
            ..config(dir, tiling)
        };
        let single_dir = tempfile::tempdir().unwrap();
        let single = segment(
            &image,
            &params(single_dir.path(), TilingMode::Manual { nx: 1, ny: 1 }),
        )
        .unwrap();
        let single = Array2D::from_slice(&single, width, height).unwrap();

        let tiled_dir = tempfile::tempdir().unwrap();
        let config = params(tiled_dir.path(), TilingMode::Manual { nx: 2, ny: 2 });
        let scheduler = TileScheduler::new(&config, &image);
        let partition = scheduler.compute_partition().unwrap();
        let tiled = scheduler.run(&partition).unwrap().read_labels().unwrap();

        let mut compared = 0;
        for tile in &partition.tiles {
            let core = tile.core;
            let expected = single
                .crop(core.x, core.y, core.width, core.height)
                .unwrap();
            // superpixels the tile border cuts in two are repaired inside the tile
            let split = split_labels(&expected);
            for y in 0..core.height {
                for x in 0..core.width {
                    let label = expected[(x, y)];
                    if split.contains(&label) {
                        continue;
                    }
                    assert_eq!(
                        tiled[(core.x + x, core.y + y)],
                        label,
                        "tile {} pixel ({x}, {y})",
                        tile.index
                    );
                    compared += 1;
                }
            }
        }
        assert!(compared > width * height / 2, "{compared} pixels compared");
    }

    #[test]
    fn workers_and_distribution_do_not_change_result_test() {
        let image = textured_image(120, 90);
        let mut results = Vec::new();
        for (workers, distribution) in [
            (1, WorkerDistribution::RoundRobin),
            (3, WorkerDistribution::Block),
            (4, WorkerDistribution::RoundRobin),
        ] {
            let dir = tempfile::tempdir().unwrap();
            let config = Config {
                seed_spacing: 8,
                distance_weight: 0.5,
                num_workers: workers,
                distribution,
                ..config(dir.path(), TilingMode::Manual { nx: 3, ny: 2 })
            };
            results.push(segment(&image, &config).unwrap());
        }
        assert_eq!(results[0], results[1]);
        assert_eq!(results[0], results[2]);
        assert!(results[0].iter().all(|l| *l != 0));
    }

    #[test]
    fn labels_are_connected_in_every_tile_test() {
        let dir = tempfile::tempdir().unwrap();
        let image = textured_image(96, 64);
        let config = Config {
            seed_spacing: 6,
            distance_weight: 0.2,
            ..config(dir.path(), TilingMode::Manual { nx: 2, ny: 2 })
        };
        let scheduler = TileScheduler::new(&config, &image);
        let partition = scheduler.compute_partition().unwrap();
        let descriptor = scheduler.run(&partition).unwrap();
        for source in &descriptor.sources {
            let labels = crate::raster::read_labels(
                &source.labels,
                source.region.width,
                source.region.height,
            )
            .unwrap();
            assert_labels_connected(&labels);
        }
    }

    #[test]
    fn auto_tiling_run_test() {
        let dir = tempfile::tempdir().unwrap();
        // 1 MB holds a 226 px core with its 10 px margin
        let image = textured_image(600, 400);
        let config = Config {
            seed_spacing: 10,
            ..config(dir.path(), TilingMode::Auto { ram_mb: 1 })
        };
        let scheduler = TileScheduler::new(&config, &image);
        let partition = scheduler.compute_partition().unwrap();
        assert_eq!((partition.tiles_x, partition.tiles_y), (3, 2));
        let reports = scheduler.run_tiles(&partition).unwrap();
        assert_eq!(reports.len(), partition.tiles.len());
        assert!(reports.iter().enumerate().all(|(i, r)| r.tile == i && !r.resumed));
    }

    #[test]
    fn resume_reuses_tiles_test() {
        let dir = tempfile::tempdir().unwrap();
        let image = textured_image(80, 60);
        let config = Config {
            seed_spacing: 10,
            ..config(dir.path(), TilingMode::Manual { nx: 2, ny: 2 })
        };
        let first = segment(&image, &config).unwrap();

        let config = Config {
            resume: true,
            ..config
        };
        let scheduler = TileScheduler::new(&config, &image);
        let partition = scheduler.compute_partition().unwrap();
        let reports = scheduler.run_tiles(&partition).unwrap();
        assert!(reports.iter().all(|r| r.resumed));
        assert_eq!(segment(&image, &config).unwrap(), first);
    }

    #[test]
    fn resume_recomputes_tiles_of_other_parameters_test() {
        let dir = tempfile::tempdir().unwrap();
        let image = textured_image(80, 60);
        let config = Config {
            seed_spacing: 10,
            ..config(dir.path(), TilingMode::Manual { nx: 2, ny: 2 })
        };
        segment(&image, &config).unwrap();

        let changed = Config {
            seed_spacing: 4,
            distance_weight: 3.0,
            resume: true,
            ..config
        };
        let scheduler = TileScheduler::new(&changed, &image);
        let partition = scheduler.compute_partition().unwrap();
        let reports = scheduler.run_tiles(&partition).unwrap();
        assert!(reports.iter().all(|r| !r.resumed));

        let fresh_dir = tempfile::tempdir().unwrap();
        let fresh = Config {
            resume: false,
            temp_dir: fresh_dir.path().to_path_buf(),
            ..changed.clone()
        };
        assert_eq!(segment(&image, &changed).unwrap(), segment(&image, &fresh).unwrap());
    }

    #[test]
    fn image_smaller_than_seed_spacing_test() {
        let dir = tempfile::tempdir().unwrap();
        let image = MultiBandImage::from_fill(1.0, 10, 10, 1);
        let config = config(dir.path(), TilingMode::Manual { nx: 1, ny: 1 });
        assert!(matches!(
            segment(&image, &config),
            Err(Error::Partition { .. })
        ));
    }

    #[test]
    fn unwritable_temp_dir_test() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not_a_dir");
        std::fs::write(&file, "").unwrap();
        let image = MultiBandImage::from_fill(1.0, 40, 40, 1);
        let config = config(&file.join("tiles"), TilingMode::Manual { nx: 1, ny: 1 });
        let err = segment(&image, &config).unwrap_err();
        assert!(matches!(err, Error::Io { .. }), "{err}");
    }

    struct FailingSource;

    impl RasterSource for FailingSource {
        fn width(&self) -> usize {
            64
        }
        fn height(&self) -> usize {
            64
        }
        fn bands(&self) -> usize {
            1
        }
        fn read_region(&self, region: &Region) -> Result<MultiBandImage> {
            if region.x > 0 {
                return Err(Error::InputRegion {
                    tile: 1,
                    reason: "read failed".to_string(),
                });
            }
            Ok(MultiBandImage::from_fill(0.0, region.width, region.height, 1))
        }
    }

    #[test]
    fn failed_tile_publishes_no_mosaic_test() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path(), TilingMode::Manual { nx: 2, ny: 1 });
        let err = segment(&FailingSource, &config).unwrap_err();
        assert!(err.is_io());
        assert!(!dir.path().join("slic.vrt").exists());
    }
}
