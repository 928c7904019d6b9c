use crate::common::{Config, TilingMode};
use crate::error::{Error, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Axis aligned rectangle in full image coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Region {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

impl Region {
    pub fn new(x: usize, y: usize, width: usize, height: usize) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Exclusive right edge.
    #[inline(always)]
    pub fn right(&self) -> usize {
        self.x + self.width
    }

    /// Exclusive bottom edge.
    #[inline(always)]
    pub fn bottom(&self) -> usize {
        self.y + self.height
    }

    pub fn area(&self) -> usize {
        self.width * self.height
    }

    pub fn contains_region(&self, other: &Region) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.right() <= self.right()
            && other.bottom() <= self.bottom()
    }

    pub fn intersects(&self, other: &Region) -> bool {
        self.x < other.right()
            && other.x < self.right()
            && self.y < other.bottom()
            && other.y < self.bottom()
    }

    /// Grows the region by `amount` on every side, clipped to `width` x `height`.
    pub fn expand(&self, amount: usize, width: usize, height: usize) -> Region {
        let x = self.x.saturating_sub(amount);
        let y = self.y.saturating_sub(amount);
        let right = (self.right() + amount).min(width);
        let bottom = (self.bottom() + amount).min(height);
        Region::new(x, y, right - x, bottom - y)
    }
}

/// Direction of an adjacent tile, in the order of `Tile::neighbors`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    N,
    NE,
    E,
    SE,
    S,
    SW,
    W,
    NW,
}

impl Direction {
    pub const ALL: [Direction; 8] = [
        Direction::N,
        Direction::NE,
        Direction::E,
        Direction::SE,
        Direction::S,
        Direction::SW,
        Direction::W,
        Direction::NW,
    ];

    /// Column and row step towards the neighbor.
    pub fn offset(self) -> (isize, isize) {
        match self {
            Direction::N => (0, -1),
            Direction::NE => (1, -1),
            Direction::E => (1, 0),
            Direction::SE => (1, 1),
            Direction::S => (0, 1),
            Direction::SW => (-1, 1),
            Direction::W => (-1, 0),
            Direction::NW => (-1, -1),
        }
    }
}

/// Which sides of the core region carry a margin. Sides on the image boundary never do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Margins {
    pub top: bool,
    pub right: bool,
    pub bottom: bool,
    pub left: bool,
}

/// Files a tile persists. Names derive from the run prefix and the tile's grid position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TileArtifacts {
    /// Raw little-endian `u32` labels of the core region.
    pub labels: PathBuf,
    /// ENVI header describing `labels`.
    pub header: PathBuf,
    /// Centroid table (JSON).
    pub seeds: PathBuf,
}

impl TileArtifacts {
    pub fn new(dir: &Path, prefix: &str, row: usize, column: usize) -> Self {
        Self {
            labels: dir.join(format!("{prefix}_{row}_{column}.raw")),
            header: dir.join(format!("{prefix}_{row}_{column}.hdr")),
            seeds: dir.join(format!("{prefix}_{row}_{column}_seeds.json")),
        }
    }
}

/// One unit of the partition. Tiles live in `Partition::tiles` and refer to each other by index.
#[derive(Debug, Clone)]
pub struct Tile {
    pub index: usize,
    pub row: usize,
    pub column: usize,
    /// Region the tile is authoritative for.
    pub core: Region,
    /// Core plus margin, clipped to the image. This is what the tile reads.
    pub extended: Region,
    /// Adjacent tiles, `None` on the image boundary. Ordered as `Direction::ALL`.
    pub neighbors: [Option<usize>; 8],
    pub margins: Margins,
    pub artifacts: TileArtifacts,
}

/// Result of `compute_partition()`.
#[derive(Debug, Clone)]
pub struct Partition {
    pub image_width: usize,
    pub image_height: usize,
    pub tiles_x: usize,
    pub tiles_y: usize,
    pub margin: usize,
    pub tiles: Vec<Tile>,
}

/// Bytes of one centroid record plus its seed, including the hash map entry.
pub(crate) fn centroid_record_bytes(bands: usize) -> usize {
    96 + 16 * bands
}

/// Per pixel working set of the reading side: the band-interleaved `f32` buffer.
fn reading_bytes_per_pixel(bands: usize) -> f64 {
    (bands * std::mem::size_of::<f32>()) as f64
}

/// Per pixel working set of the algorithm: label, previous label, best distance and the
/// centroid table spread over the `S x S` cell of its seed.
fn algorithm_bytes_per_pixel(bands: usize, seed_spacing: usize) -> f64 {
    (2 * std::mem::size_of::<u32>() + std::mem::size_of::<f64>()) as f64
        + centroid_record_bytes(bands) as f64 / (seed_spacing * seed_spacing) as f64
}

/// Largest square core side whose margin-inclusive working set fits `budget` bytes.
fn max_tile_side(budget: f64, bytes_per_pixel: f64, margin: usize) -> Option<usize> {
    let side = (budget / bytes_per_pixel).sqrt().floor() as usize;
    side.checked_sub(2 * margin).filter(|s| *s > 0)
}

/// Number of tiles per axis for the automatic mode.
fn auto_tile_counts(
    width: usize,
    height: usize,
    bands: usize,
    ram_mb: u64,
    config: &Config,
) -> Result<(usize, usize)> {
    let budget = ram_mb as f64 * 1024.0 * 1024.0;
    let seed_spacing = config.seed_spacing as usize;
    let margin = config.margin_pixels();
    let too_small = |what: &str| Error::Partition {
        width,
        height,
        reason: format!(
            "memory budget of {ram_mb} MB can't hold a tile of {seed_spacing} px with a margin of {margin} px ({what})"
        ),
    };
    let read_side = max_tile_side(budget, reading_bytes_per_pixel(bands), margin)
        .filter(|s| *s >= seed_spacing)
        .ok_or_else(|| too_small("reading"))?;
    let algo_side = max_tile_side(
        budget,
        algorithm_bytes_per_pixel(bands, seed_spacing),
        margin,
    )
    .filter(|s| *s >= seed_spacing)
    .ok_or_else(|| too_small("clustering"))?;

    let read_counts = (width.div_ceil(read_side), height.div_ceil(read_side));
    let algo_counts = (width.div_ceil(algo_side), height.div_ceil(algo_side));
    Ok((
        read_counts.0.max(algo_counts.0),
        read_counts.1.max(algo_counts.1),
    ))
}

/// Splits `length` into `count` parts, the last one takes the remainder.
fn split_axis(length: usize, count: usize) -> Vec<(usize, usize)> {
    let size = length / count;
    (0..count)
        .map(|i| {
            let start = i * size;
            let len = if i + 1 == count { length - start } else { size };
            (start, len)
        })
        .collect()
}

/// Computes the tiles of a `width` x `height` image with `bands` bands.
pub fn compute_partition(
    width: usize,
    height: usize,
    bands: usize,
    config: &Config,
) -> Result<Partition> {
    config.validate()?;
    let seed_spacing = config.seed_spacing as usize;
    if width < seed_spacing || height < seed_spacing {
        return Err(Error::Partition {
            width,
            height,
            reason: format!("image is smaller than the seed spacing of {seed_spacing} px"),
        });
    }
    if bands == 0 {
        return Err(Error::Partition {
            width,
            height,
            reason: "image has no bands".to_string(),
        });
    }

    let (tiles_x, tiles_y) = match config.tiling {
        TilingMode::Manual { nx, ny } => {
            if width / nx == 0 || height / ny == 0 {
                return Err(Error::Configuration(format!(
                    "{nx}x{ny} tiles on a {width}x{height} image produce empty tiles"
                )));
            }
            (nx, ny)
        }
        TilingMode::Auto { ram_mb } => auto_tile_counts(width, height, bands, ram_mb, config)?,
    };

    let margin = config.margin_pixels();
    let columns = split_axis(width, tiles_x);
    let rows = split_axis(height, tiles_y);
    let mut tiles = Vec::with_capacity(tiles_x * tiles_y);
    for (row, &(y, tile_height)) in rows.iter().enumerate() {
        for (column, &(x, tile_width)) in columns.iter().enumerate() {
            let core = Region::new(x, y, tile_width, tile_height);
            let mut neighbors = [None; 8];
            for (slot, direction) in neighbors.iter_mut().zip(Direction::ALL) {
                let (dx, dy) = direction.offset();
                let c = column as isize + dx;
                let r = row as isize + dy;
                if c >= 0 && r >= 0 && (c as usize) < tiles_x && (r as usize) < tiles_y {
                    *slot = Some(r as usize * tiles_x + c as usize);
                }
            }
            let margins = Margins {
                top: margin > 0 && y > 0,
                right: margin > 0 && core.right() < width,
                bottom: margin > 0 && core.bottom() < height,
                left: margin > 0 && x > 0,
            };
            tiles.push(Tile {
                index: row * tiles_x + column,
                row,
                column,
                core,
                extended: core.expand(margin, width, height),
                neighbors,
                margins,
                artifacts: TileArtifacts::new(&config.temp_dir, &config.prefix, row, column),
            });
        }
    }
    info!(
        "partitioned {width}x{height} image into {tiles_x}x{tiles_y} tiles with a margin of {margin} px"
    );
    Ok(Partition {
        image_width: width,
        image_height: height,
        tiles_x,
        tiles_y,
        margin,
        tiles,
    })
}

#[cfg(test)]
mod tests {
    use super::{compute_partition, Region};
    use crate::common::{Config, TilingMode};
    use crate::error::Error;

    fn manual(nx: usize, ny: usize, seed_spacing: u32, margin: u32) -> Config {
        Config {
            seed_spacing,
            margin,
            tiling: TilingMode::Manual { nx, ny },
            ..Config::default()
        }
    }

    #[test]
    fn partition_coverage_test() {
        for (width, height) in [(100, 100), (101, 37), (64, 250), (9, 9)] {
            for (nx, ny) in [(1, 1), (2, 2), (3, 1), (4, 3)] {
                let config = manual(nx, ny, 3, 1);
                let partition = compute_partition(width, height, 1, &config).unwrap();
                assert_eq!(partition.tiles.len(), nx * ny);
                let mut cover = vec![0u8; width * height];
                for tile in &partition.tiles {
                    assert!(tile.extended.contains_region(&tile.core));
                    for y in tile.core.y..tile.core.bottom() {
                        for x in tile.core.x..tile.core.right() {
                            cover[y * width + x] += 1;
                        }
                    }
                }
                assert!(
                    cover.iter().all(|c| *c == 1),
                    "{width}x{height} with {nx}x{ny} tiles"
                );
            }
        }
    }

    #[test]
    fn remainder_to_edge_tiles_test() {
        let partition = compute_partition(103, 50, 1, &manual(2, 2, 5, 0)).unwrap();
        assert_eq!(partition.tiles[0].core, Region::new(0, 0, 51, 25));
        assert_eq!(partition.tiles[1].core, Region::new(51, 0, 52, 25));
        assert_eq!(partition.tiles[3].core, Region::new(51, 25, 52, 25));
    }

    #[test]
    fn margins_and_neighbors_test() {
        let partition = compute_partition(90, 90, 1, &manual(3, 3, 10, 1)).unwrap();
        let corner = &partition.tiles[0];
        assert_eq!(corner.extended, Region::new(0, 0, 40, 40));
        assert!(!corner.margins.top && !corner.margins.left);
        assert!(corner.margins.right && corner.margins.bottom);
        assert_eq!(
            corner.neighbors,
            [None, None, Some(1), Some(4), Some(3), None, None, None]
        );

        let center = &partition.tiles[4];
        assert_eq!(center.extended, Region::new(20, 20, 50, 50));
        assert_eq!(
            center.neighbors,
            [Some(1), Some(2), Some(5), Some(8), Some(7), Some(6), Some(3), Some(0)]
        );
        assert!(center.artifacts.labels.ends_with("slic_1_1.raw"));
        assert!(center.artifacts.seeds.ends_with("slic_1_1_seeds.json"));
    }

    #[test]
    fn auto_partition_test() {
        // 1 MB budget, 4 bands: reading side = sqrt(1Mi / 16) = 256 - 2 * 8
        let config = Config {
            seed_spacing: 8,
            margin: 1,
            tiling: TilingMode::Auto { ram_mb: 1 },
            ..Config::default()
        };
        let partition = compute_partition(1000, 500, 4, &config).unwrap();
        assert_eq!(partition.tiles_x, 5);
        assert_eq!(partition.tiles_y, 3);
        for tile in &partition.tiles {
            assert!(tile.extended.area() * 16 <= 1024 * 1024 + 1000 * 16);
        }
        // a single tile when everything fits
        let partition = compute_partition(100, 100, 1, &config).unwrap();
        assert_eq!(partition.tiles.len(), 1);
        assert_eq!(partition.tiles[0].extended, Region::new(0, 0, 100, 100));
        assert_eq!(partition.tiles[0].neighbors, [None; 8]);
    }

    #[test]
    fn partition_errors_test() {
        assert!(matches!(
            compute_partition(10, 100, 1, &manual(1, 1, 20, 1)),
            Err(Error::Partition { .. })
        ));
        assert!(matches!(
            compute_partition(100, 100, 1, &manual(200, 1, 2, 1)),
            Err(Error::Configuration(_))
        ));
        assert!(matches!(
            compute_partition(100, 100, 1, &manual(2, 2, 1, 1)),
            Err(Error::Configuration(_))
        ));
        // margin larger than the budget allows
        let config = Config {
            seed_spacing: 100,
            margin: 10,
            tiling: TilingMode::Auto { ram_mb: 1 },
            ..Config::default()
        };
        assert!(matches!(
            compute_partition(5000, 5000, 3, &config),
            Err(Error::Partition { .. })
        ));
    }
}
