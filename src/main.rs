// CLI entry for tiled-slic
use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser, ValueEnum, ValueHint};
use log::info;
use std::path::PathBuf;
use tiled_slic::common::{Config, TilingMode, WorkerDistribution};
use tiled_slic::raster::from_dynamic_image;
use tiled_slic::scheduler::TileScheduler;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Tiling {
    Auto,
    Manual,
}

#[derive(Parser, Debug)]
#[command(name = "tiled-slic", version, about = "Tiled SLIC superpixel segmentation")]
struct Cli {
    /// Input image path
    #[arg(long = "in", value_hint = ValueHint::FilePath)]
    input: PathBuf,
    /// Output label image. A `.vrt` path keeps the tile mosaic, anything else is consolidated
    /// into one raw UInt32 file with an ENVI header
    #[arg(long = "out", value_hint = ValueHint::FilePath)]
    output: PathBuf,

    /// JSON config, command line options override it
    #[arg(long = "config", value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Seed spacing in pixels
    #[arg(long = "spw")]
    seed_spacing: Option<u32>,
    /// Weight of the spatial distance
    #[arg(long = "dw")]
    distance_weight: Option<f64>,
    /// Maximum number of iterations per tile
    #[arg(long = "maxit")]
    max_iterations: Option<u32>,
    /// Convergence threshold of the seed displacement
    #[arg(long = "thresh")]
    threshold: Option<f64>,
    /// Tile margin in seed widths
    #[arg(long = "margin")]
    margin: Option<u32>,

    /// Directory of the tile artifacts
    #[arg(long = "tmpdir", value_hint = ValueHint::DirPath)]
    temp_dir: Option<PathBuf>,
    /// Tiling mode
    #[arg(long = "tiling", value_enum)]
    tiling: Option<Tiling>,
    /// Memory budget of one tile in MB (auto tiling)
    #[arg(long = "tiling.auto.ram")]
    ram_mb: Option<u64>,
    /// Number of tiles along X (manual tiling)
    #[arg(long = "tiling.manual.nx")]
    nx: Option<usize>,
    /// Number of tiles along Y (manual tiling)
    #[arg(long = "tiling.manual.ny")]
    ny: Option<usize>,

    /// Number of tile workers, 0 uses every core
    #[arg(long = "workers")]
    workers: Option<usize>,
    /// Hand out contiguous blocks of tiles instead of round-robin
    #[arg(long = "block", action = ArgAction::SetTrue)]
    block: bool,
    /// Remove tile artifacts once consolidated
    #[arg(long = "cleanup", action = ArgAction::SetTrue)]
    cleanup: bool,
    /// Reuse tiles persisted by an earlier run
    #[arg(long = "resume", action = ArgAction::SetTrue)]
    resume: bool,
}

fn build_config(cli: &Cli) -> Result<Config> {
    let mut cfg = match &cli.config {
        Some(path) => Config::from_json_file(path)?,
        None => Config::default(),
    };
    if let Some(v) = cli.seed_spacing { cfg.seed_spacing = v; }
    if let Some(v) = cli.distance_weight { cfg.distance_weight = v; }
    if let Some(v) = cli.max_iterations { cfg.max_iterations = v; }
    if let Some(v) = cli.threshold { cfg.threshold = v; }
    if let Some(v) = cli.margin { cfg.margin = v; }
    if let Some(v) = &cli.temp_dir { cfg.temp_dir = v.clone(); }
    if let Some(v) = cli.workers { cfg.num_workers = v; }
    if cli.block { cfg.distribution = WorkerDistribution::Block; }
    if cli.cleanup { cfg.cleanup = true; }
    if cli.resume { cfg.resume = true; }

    let tiling = cli.tiling.or(match (cli.ram_mb, cli.nx.or(cli.ny)) {
        (Some(_), _) => Some(Tiling::Auto),
        (None, Some(_)) => Some(Tiling::Manual),
        (None, None) => None,
    });
    match tiling {
        Some(Tiling::Auto) => {
            let ram_mb = match (cli.ram_mb, &cfg.tiling) {
                (Some(v), _) => v,
                (None, TilingMode::Auto { ram_mb }) => *ram_mb,
                (None, TilingMode::Manual { .. }) => 256,
            };
            cfg.tiling = TilingMode::Auto { ram_mb };
        }
        Some(Tiling::Manual) => {
            let (nx, ny) = match cfg.tiling {
                TilingMode::Manual { nx, ny } => (nx, ny),
                TilingMode::Auto { .. } => (1, 1),
            };
            cfg.tiling = TilingMode::Manual {
                nx: cli.nx.unwrap_or(nx),
                ny: cli.ny.unwrap_or(ny),
            };
        }
        None => {}
    }
    if cfg.cleanup && is_vrt(&cli.output) {
        bail!("--cleanup would remove the tiles the output mosaic refers to");
    }
    if cli.temp_dir.is_some() && is_vrt(&cli.output) {
        bail!("--tmpdir can't be used with a .vrt output, the tiles are written next to the mosaic");
    }
    cfg.validate()?;
    Ok(cfg)
}

fn is_vrt(path: &std::path::Path) -> bool {
    path.extension()
        .is_some_and(|e| e.eq_ignore_ascii_case("vrt"))
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let mut cfg = build_config(&cli)?;
    if is_vrt(&cli.output) {
        // the mosaic is written where the user asked for it, next to its tiles
        if let Some(dir) = cli.output.parent().filter(|d| !d.as_os_str().is_empty()) {
            cfg.temp_dir = dir.to_path_buf();
        }
        if let Some(stem) = cli.output.file_stem() {
            cfg.prefix = stem.to_string_lossy().into_owned();
        }
    }

    let dimg = image::open(&cli.input)
        .with_context(|| format!("unable to read {}", cli.input.display()))?;
    let image = from_dynamic_image(&dimg)?;
    drop(dimg);
    info!(
        "{}: {}x{} pixels, {} bands",
        cli.input.display(),
        image.width,
        image.height,
        image.bands
    );

    let scheduler = TileScheduler::new(&cfg, &image);
    let partition = scheduler.compute_partition()?;
    let mosaic = scheduler.run(&partition)?;
    if is_vrt(&cli.output) {
        info!("label mosaic written to {}", mosaic.path.display());
    } else {
        mosaic.consolidate(&cli.output)?;
        if cfg.cleanup {
            mosaic.remove_artifacts();
        }
    }
    Ok(())
}
