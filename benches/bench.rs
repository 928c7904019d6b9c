use criterion::*;
use std::time::Duration;
use tiled_slic::arrays::{Array2D, MultiBandImage};
use tiled_slic::assign::assign;
use tiled_slic::cluster::{Label, Seed, UNASSIGNED};
use tiled_slic::common::{AssignThreadingStrategy, Config, TilingMode};
use tiled_slic::conectivity::{assign_disjoint_set, enforce_connectivity};
use tiled_slic::slic::{SeedGrid, TileWorker};
use tiled_slic::tiling::{compute_partition, Region};

const WIDTH: usize = 1024;
const HEIGHT: usize = 768;

/// Smooth 4 band test raster with some sharp edges.
fn synthetic_image(width: usize, height: usize) -> MultiBandImage {
    MultiBandImage::from_iter(
        (0..width * height).flat_map(|i| {
            let x = (i % width) as f32;
            let y = (i / width) as f32;
            let field = (x / 37.0).sin() * (y / 23.0).cos() * 80.0;
            let edge = if (x as usize / 90 + y as usize / 70) % 2 == 0 { 60.0 } else { 0.0 };
            [field + 120.0, edge + y * 0.1, (x + y) * 0.05, field * 0.5 + edge]
        }),
        width,
        height,
        4,
    )
    .unwrap()
}

fn grid_seeds(image: &MultiBandImage, config: &Config) -> Vec<Seed> {
    let grid = SeedGrid::new(image.width, image.height, config.seed_spacing as usize);
    (0..grid.seeds_y)
        .flat_map(|gy| (0..grid.seeds_x).map(move |gx| (gx, gy)))
        .map(|(gx, gy)| {
            let (x, y) = grid.center(gx, gy);
            let spectral = image.get_pixel(x, y).iter().map(|v| *v as f64).collect();
            Seed::new(grid.label(gx, gy), x as f64, y as f64, spectral, true)
        })
        .collect()
}

fn bench_assign(c: &mut Criterion) {
    sas::init();
    let image = synthetic_image(WIDTH, HEIGHT);
    let region = Region::new(0, 0, WIDTH, HEIGHT);
    let mut config = Config::default();
    let mut seeds = grid_seeds(&image, &config);
    let previous = Array2D::from_fill(UNASSIGNED, WIDTH, HEIGHT);
    let mut labels = Array2D::from_fill(UNASSIGNED, WIDTH, HEIGHT);
    let mut min_distances = Array2D::from_fill(f64::INFINITY, WIDTH, HEIGHT);
    let mut group = c.benchmark_group("SLIC assign");
    let threading_strategies = [
        AssignThreadingStrategy::SingleThread,
        AssignThreadingStrategy::RowBased,
    ];
    for threading_strategy in threading_strategies {
        group.bench_with_input(
            BenchmarkId::new("assign", format!("{:?}", threading_strategy)),
            &threading_strategy,
            |b, &threading_strategy| {
                config.assign_threading_strategy = threading_strategy;
                b.iter(|| {
                    assign(
                        &image,
                        &region,
                        &config,
                        &mut seeds,
                        &previous,
                        &mut labels,
                        &mut min_distances,
                    );
                    black_box(&labels);
                });
            },
        );
    }
}

fn converged_labels() -> Array2D<Label> {
    let image = synthetic_image(WIDTH, HEIGHT);
    let config = Config {
        tiling: TilingMode::Manual { nx: 1, ny: 1 },
        ..Config::default()
    };
    let partition = compute_partition(WIDTH, HEIGHT, 4, &config).unwrap();
    let grid = SeedGrid::new(WIDTH, HEIGHT, config.seed_spacing as usize);
    let mut worker = TileWorker::new(&partition.tiles[0], &config, &grid, image).unwrap();
    worker.run();
    worker.labels().clone()
}

fn bench_connectivity(c: &mut Criterion) {
    sas::init();
    let labels = converged_labels();
    c.bench_function("enforce_connectivity", |b| {
        b.iter_batched(
            || labels.clone(),
            |mut labels| black_box(enforce_connectivity(&mut labels)),
            BatchSize::LargeInput,
        );
    });
}

fn bench_assign_disjoint_set(c: &mut Criterion) {
    sas::init();
    let labels = converged_labels();
    c.bench_function("assign_disjoint_set_flatten", |b| {
        b.iter(|| {
            let _ = black_box(assign_disjoint_set(&labels).flatten());
        });
    });
}

fn bench_tile(c: &mut Criterion) {
    sas::init();
    let image = synthetic_image(WIDTH, HEIGHT);
    let mut group = c.benchmark_group("SLIC tile");
    for seed_spacing in [10u32, 20, 40] {
        let config = Config {
            seed_spacing,
            tiling: TilingMode::Manual { nx: 1, ny: 1 },
            ..Config::default()
        };
        let partition = compute_partition(WIDTH, HEIGHT, 4, &config).unwrap();
        let grid = SeedGrid::new(WIDTH, HEIGHT, seed_spacing as usize);
        group.bench_with_input(
            BenchmarkId::new("run_and_finalize", format!("S={seed_spacing}")),
            &seed_spacing,
            |b, _| {
                b.iter(|| {
                    let mut worker =
                        TileWorker::new(&partition.tiles[0], &config, &grid, image.clone())
                            .unwrap();
                    worker.run();
                    let _ = black_box(worker.finalize().unwrap());
                });
            },
        );
    }
}

criterion_group!(name = benches;
config = Criterion::default().measurement_time(Duration::from_secs(30)).warm_up_time(Duration::from_secs(10));
targets = bench_assign);
criterion_group!(name = benches1;
config = Criterion::default().measurement_time(Duration::from_secs(30)).warm_up_time(Duration::from_secs(10));
targets = bench_connectivity, bench_assign_disjoint_set);
criterion_group!(name = benches2;
config = Criterion::default().measurement_time(Duration::from_secs(30)).warm_up_time(Duration::from_secs(10));
targets = bench_tile);
criterion_main!(benches, benches1, benches2);
