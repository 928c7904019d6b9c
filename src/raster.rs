//! Raster input and the on-disk form of tile results.
//!
//! Tile label rasters are headerless little-endian `u32` files with an ENVI sidecar so GDAL (and
//! the mosaic descriptor) can read them. The centroid table of a tile is stored as JSON next to
//! them.

use crate::arrays::{Array2D, MultiBandImage};
use crate::cluster::{Label, SeedSnapshot};
use crate::common::Config;
use crate::error::{Error, Result};
use crate::slic::{FinalizedTile, SeedGrid, TileState};
use crate::tiling::{Region, Tile, TileArtifacts};
use image::{DynamicImage, ImageBuffer, Pixel};
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

/// ENVI data type code of unsigned 32 bit integers.
const ENVI_UINT32: u32 = 13;

/// Random access to the source raster. Tiles only ever read their margin-inclusive region.
pub trait RasterSource: Sync {
    fn width(&self) -> usize;
    fn height(&self) -> usize;
    fn bands(&self) -> usize;
    /// Band-interleaved pixels of `region`.
    fn read_region(&self, region: &Region) -> Result<MultiBandImage>;
}

impl RasterSource for MultiBandImage {
    fn width(&self) -> usize {
        self.width
    }

    fn height(&self) -> usize {
        self.height
    }

    fn bands(&self) -> usize {
        self.bands
    }

    fn read_region(&self, region: &Region) -> Result<MultiBandImage> {
        Ok(self.window(region.x, region.y, region.width, region.height)?)
    }
}

fn from_buffer<P, S>(buffer: &ImageBuffer<P, Vec<S>>) -> Result<MultiBandImage>
where
    P: Pixel<Subpixel = S>,
    S: Copy + Into<f32>,
{
    Ok(MultiBandImage::from_iter(
        buffer.as_raw().iter().map(|v| (*v).into()),
        buffer.width() as usize,
        buffer.height() as usize,
        P::CHANNEL_COUNT as usize,
    )?)
}

/// Converts a decoded image to a `MultiBandImage`, one band per channel. Sample values are kept
/// as they are (0-255 for 8 bit images), not normalized.
pub fn from_dynamic_image(image: &DynamicImage) -> Result<MultiBandImage> {
    match image {
        DynamicImage::ImageLuma8(b) => from_buffer(b),
        DynamicImage::ImageLumaA8(b) => from_buffer(b),
        DynamicImage::ImageRgb8(b) => from_buffer(b),
        DynamicImage::ImageRgba8(b) => from_buffer(b),
        DynamicImage::ImageLuma16(b) => from_buffer(b),
        DynamicImage::ImageLumaA16(b) => from_buffer(b),
        DynamicImage::ImageRgb16(b) => from_buffer(b),
        DynamicImage::ImageRgba16(b) => from_buffer(b),
        DynamicImage::ImageRgb32F(b) => from_buffer(b),
        DynamicImage::ImageRgba32F(b) => from_buffer(b),
        other => from_buffer(&other.to_rgba32f()),
    }
}

/// Writes `labels` as raw little-endian `u32` values, row major.
pub fn write_labels(path: &Path, labels: &Array2D<Label>) -> Result<()> {
    let file = File::create(path).map_err(|e| Error::io(path, e))?;
    let mut writer = BufWriter::new(file);
    for label in labels.data.iter() {
        writer
            .write_all(&label.to_le_bytes())
            .map_err(|e| Error::io(path, e))?;
    }
    writer.flush().map_err(|e| Error::io(path, e))
}

/// Reads a raw label raster of known shape.
pub fn read_labels(path: &Path, width: usize, height: usize) -> Result<Array2D<Label>> {
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    let mut bytes = Vec::with_capacity(width * height * 4);
    BufReader::new(file)
        .read_to_end(&mut bytes)
        .map_err(|e| Error::io(path, e))?;
    if bytes.len() != width * height * 4 {
        return Err(Error::manifest(
            path,
            format!(
                "expected {} bytes for {width}x{height} labels, found {}",
                width * height * 4,
                bytes.len()
            ),
        ));
    }
    let labels: Vec<Label> = bytes
        .chunks_exact(4)
        .map(|b| Label::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    Ok(Array2D::from_slice(&labels, width, height)?)
}

/// Writes the ENVI header describing a single band `u32` raster.
pub fn write_envi_header(path: &Path, width: usize, height: usize) -> Result<()> {
    let file = File::create(path).map_err(|e| Error::io(path, e))?;
    let mut writer = BufWriter::new(file);
    let contents = format!(
        "ENVI\n\
         samples = {width}\n\
         lines = {height}\n\
         bands = 1\n\
         header offset = 0\n\
         file type = ENVI Standard\n\
         data type = {ENVI_UINT32}\n\
         interleave = bsq\n\
         byte order = 0\n"
    );
    writer
        .write_all(contents.as_bytes())
        .and_then(|_| writer.flush())
        .map_err(|e| Error::io(path, e))
}

/// Returns (samples, lines) of an ENVI header written by `write_envi_header()`.
pub fn read_envi_header(path: &Path) -> Result<(usize, usize)> {
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    let mut lines = BufReader::new(file).lines();
    match lines.next() {
        Some(Ok(magic)) if magic.trim() == "ENVI" => {}
        Some(Err(e)) => return Err(Error::io(path, e)),
        _ => return Err(Error::manifest(path, "missing ENVI magic")),
    }
    let (mut samples, mut rows, mut data_type) = (None, None, None);
    for line in lines {
        let line = line.map_err(|e| Error::io(path, e))?;
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let parse = |v: &str| {
            v.trim()
                .parse::<usize>()
                .map_err(|e| Error::manifest(path, format!("{}: {e}", key.trim())))
        };
        match key.trim() {
            "samples" => samples = Some(parse(value)?),
            "lines" => rows = Some(parse(value)?),
            "data type" => data_type = Some(parse(value)?),
            _ => {}
        }
    }
    if data_type != Some(ENVI_UINT32 as usize) {
        return Err(Error::manifest(path, "labels are not stored as UInt32"));
    }
    match (samples, rows) {
        (Some(samples), Some(rows)) => Ok((samples, rows)),
        _ => Err(Error::manifest(path, "samples or lines missing")),
    }
}

/// Parameters the labels of a tile depend on. Persisted tiles are only reused by a run with the
/// same ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunParameters {
    pub image_width: usize,
    pub image_height: usize,
    pub seed_spacing: u32,
    pub distance_weight: f64,
    pub max_iterations: u32,
    pub threshold: f64,
    pub margin: u32,
}

impl RunParameters {
    pub fn new(config: &Config, grid: &SeedGrid) -> Self {
        Self {
            image_width: grid.image_width,
            image_height: grid.image_height,
            seed_spacing: config.seed_spacing,
            distance_weight: config.distance_weight,
            max_iterations: config.max_iterations,
            threshold: config.threshold,
            margin: config.margin,
        }
    }

    /// Equality that tolerates the last bit lost by the JSON round trip of the floats.
    pub fn matches(&self, other: &RunParameters) -> bool {
        let close = |a: f64, b: f64| (a - b).abs() <= f64::EPSILON * a.abs().max(b.abs());
        self.image_width == other.image_width
            && self.image_height == other.image_height
            && self.seed_spacing == other.seed_spacing
            && self.max_iterations == other.max_iterations
            && self.margin == other.margin
            && close(self.distance_weight, other.distance_weight)
            && close(self.threshold, other.threshold)
    }
}

/// Persisted centroid table and run summary of one tile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileManifest {
    pub tile: usize,
    pub core: Region,
    pub parameters: RunParameters,
    pub converged: bool,
    pub iterations: u32,
    pub residual: f64,
    pub corrections: usize,
    pub num_labels: usize,
    pub seeds: Vec<SeedSnapshot>,
}

impl TileManifest {
    pub fn new(finalized: &FinalizedTile, parameters: &RunParameters) -> Self {
        Self {
            tile: finalized.tile_index,
            core: finalized.core,
            parameters: parameters.clone(),
            converged: finalized.outcome == TileState::Converged,
            iterations: finalized.iterations,
            // JSON has no infinity
            residual: if finalized.residual.is_finite() {
                finalized.residual
            } else {
                f64::MAX
            },
            corrections: finalized.corrections,
            num_labels: finalized.num_labels(),
            seeds: finalized.seeds.clone(),
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let file = File::create(path).map_err(|e| Error::io(path, e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self)
            .map_err(|e| Error::manifest(path, e.to_string()))?;
        writer.flush().map_err(|e| Error::io(path, e))
    }

    pub fn read(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io(path, e))?;
        serde_json::from_reader(BufReader::new(file))
            .map_err(|e| Error::manifest(path, e.to_string()))
    }
}

/// Sibling of `path` a file is written to before it's renamed into place.
fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".part");
    PathBuf::from(name)
}

fn commit(staged: &Path, path: &Path) -> Result<()> {
    std::fs::rename(staged, path).map_err(|e| Error::io(path, e))
}

/// Writes the label raster, its header and the centroid table of a finalized tile.
///
/// The manifest of a previous run is removed first and the new one is renamed into place last,
/// so an interrupted write never leaves a raster next to a manifest it doesn't belong to.
pub fn persist_tile(
    artifacts: &TileArtifacts,
    finalized: &FinalizedTile,
    parameters: &RunParameters,
) -> Result<TileManifest> {
    match std::fs::remove_file(&artifacts.seeds) {
        Err(e) if e.kind() != ErrorKind::NotFound => return Err(Error::io(&artifacts.seeds, e)),
        _ => {}
    }
    let labels = staging_path(&artifacts.labels);
    let header = staging_path(&artifacts.header);
    let seeds = staging_path(&artifacts.seeds);
    write_labels(&labels, &finalized.labels)?;
    write_envi_header(&header, finalized.labels.width, finalized.labels.height)?;
    let manifest = TileManifest::new(finalized, parameters);
    manifest.write(&seeds)?;
    commit(&labels, &artifacts.labels)?;
    commit(&header, &artifacts.header)?;
    commit(&seeds, &artifacts.seeds)?;
    debug!(
        "tile {} persisted to {}",
        finalized.tile_index,
        artifacts.labels.display()
    );
    Ok(manifest)
}

/// Manifest of a tile whose artifacts are already on disk with the shape of its core region and
/// were computed with `parameters`. `None` when the tile has to be computed.
pub fn load_persisted(tile: &Tile, parameters: &RunParameters) -> Option<TileManifest> {
    let artifacts = &tile.artifacts;
    let manifest = TileManifest::read(&artifacts.seeds).ok()?;
    if manifest.core != tile.core {
        return None;
    }
    if !manifest.parameters.matches(parameters) {
        debug!(
            "tile {}: persisted with {:?}, recomputing",
            tile.index, manifest.parameters
        );
        return None;
    }
    let shape = read_envi_header(&artifacts.header).ok()?;
    if shape != (tile.core.width, tile.core.height) {
        return None;
    }
    let size = std::fs::metadata(&artifacts.labels).ok()?.len();
    (size == (tile.core.area() * 4) as u64).then_some(manifest)
}
