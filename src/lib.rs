//! Tiled SLIC superpixel segmentation in Rust.
//!
//! This crate clusters the pixels of a multi-band raster into compact, spectrally homogeneous
//! superpixels. Images too big to be processed at once are split into tiles, each tile is
//! processed independently with a margin around it, and the tile label rasters are assembled
//! into a virtual mosaic (GDAL VRT). The margin is sized in multiples of the seed spacing, so
//! seams between tiles don't differ from a run over the whole image.
//!
//! The following example segments a decoded image into ~20 px superpixels in tiles of at most
//! 256 MB:
//!
//! ```no_run
//! use tiled_slic::common::Config;
//! use tiled_slic::raster::from_dynamic_image;
//! use tiled_slic::scheduler::TileScheduler;
//!
//! fn main() -> tiled_slic::error::Result<()> {
//!     let dimg = image::open("aerial.tif").unwrap();
//!     let image = from_dynamic_image(&dimg)?;
//!     // create config with defaults, artifacts go to the system temp dir
//!     let mut config = Config::default();
//!     config.seed_spacing = 20;
//!     let scheduler = TileScheduler::new(&config, &image);
//!     let partition = scheduler.compute_partition()?;
//!     let mosaic = scheduler.run(&partition)?;
//!     // one label image, or `mosaic.consolidate()` for a single raw file
//!     let labels = mosaic.read_labels()?;
//!     println!("{}x{} labels", labels.width, labels.height);
//!     Ok(())
//! }
//! ```
//!
//! A tile can also be processed by hand with `slic::TileWorker`, which gives access to the seeds
//! and centroid table between iterations.
//!
//! It's strongly recommended to use this in release build. The connectivity step uses `assume!`
//! macro to avoid boundary checks in hot-loops in release builds.
//!

pub mod arrays;
pub mod assign;
pub mod cluster;
pub mod common;
pub mod conectivity;
pub mod error;
pub mod mosaic;
pub mod raster;
pub mod scheduler;
pub mod simple_point;
pub mod slic;
pub mod tiling;
