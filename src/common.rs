use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::path::{Path, PathBuf};

/// How the image is split into tiles.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TilingMode {
    /// Solve for the smallest number of tiles whose working set fits `ram_mb` megabytes.
    Auto { ram_mb: u64 },
    /// Explicit number of tiles along X (`nx`) and Y (`ny`).
    Manual { nx: usize, ny: usize },
}

/// How tiles are handed out to workers. The result doesn't depend on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerDistribution {
    /// Tile `i` goes to worker `i % workers`.
    RoundRobin,
    /// Worker `w` gets a contiguous block of tile indices.
    Block,
}

/// Parallelization of the assign step inside one tile.
#[derive(Clone, PartialEq, Debug, Copy, Serialize, Deserialize)]
pub enum AssignThreadingStrategy {
    /// No threading - used for correctness checks and very small tiles.
    SingleThread,
    /// Split the tile into `rayon::current_num_threads()` bands of rows. Every band sweeps the
    /// seeds overlapping it, so no synchronization is needed in the assign step.
    RowBased,
}

/// Main config for the processing.
///
/// The defaults follow the usual SLIC setup: ~20 px superpixels, 10 iterations and a one seed
/// wide margin around tiles.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Spacing of the initial seed grid in pixels (_S_). Must be at least 2.
    pub seed_spacing: u32,
    /// Weight of the spatial term in the combined distance
    /// _d = d_spectral + distance_weight * d_spatial / S_.
    ///
    /// Higher means more compact superpixels.
    pub distance_weight: f64,
    /// Upper bound of assign/update iterations per tile.
    pub max_iterations: u32,
    /// The tile converged once the largest seed displacement of an iteration drops bellow this.
    pub threshold: f64,
    /// Margin around tiles in multiples of `seed_spacing`.
    pub margin: u32,
    pub tiling: TilingMode,
    /// Number of workers processing tiles concurrently. 0 means `rayon::current_num_threads()`.
    pub num_workers: usize,
    pub distribution: WorkerDistribution,
    pub assign_threading_strategy: AssignThreadingStrategy,
    /// Directory where tile rasters, centroid tables and the mosaic descriptor are written.
    pub temp_dir: PathBuf,
    /// File name prefix of every persisted artifact.
    pub prefix: String,
    /// Remove tile artifacts after they were consolidated into one file.
    pub cleanup: bool,
    /// Skip tiles whose label raster is already persisted with the expected shape.
    pub resume: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            seed_spacing: 20,
            distance_weight: 1.0,
            max_iterations: 10,
            threshold: 0.01,
            margin: 1,
            tiling: TilingMode::Auto { ram_mb: 256 },
            num_workers: 0,
            distribution: WorkerDistribution::RoundRobin,
            assign_threading_strategy: AssignThreadingStrategy::RowBased,
            temp_dir: std::env::temp_dir(),
            prefix: "slic".to_string(),
            cleanup: false,
            resume: false,
        }
    }
}

impl Config {
    /// Loads a config from a JSON file. Missing keys keep their default values.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let config: Config = serde_json::from_str(&contents)
            .map_err(|e| Error::Configuration(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.seed_spacing < 2 {
            return Err(Error::Configuration(format!(
                "seed spacing must be at least 2, got {}",
                self.seed_spacing
            )));
        }
        if !self.distance_weight.is_finite() || self.distance_weight < 0.0 {
            return Err(Error::Configuration(format!(
                "distance weight must be a non-negative number, got {}",
                self.distance_weight
            )));
        }
        if self.max_iterations == 0 {
            return Err(Error::Configuration(
                "at least one iteration is needed".to_string(),
            ));
        }
        if !self.threshold.is_finite() || self.threshold < 0.0 {
            return Err(Error::Configuration(format!(
                "threshold must be a non-negative number, got {}",
                self.threshold
            )));
        }
        match self.tiling {
            TilingMode::Auto { ram_mb: 0 } => {
                return Err(Error::Configuration(
                    "memory budget must be non-zero".to_string(),
                ))
            }
            TilingMode::Manual { nx, ny } if nx == 0 || ny == 0 => {
                return Err(Error::Configuration(format!(
                    "tile counts must be non-zero, got {nx}x{ny}"
                )))
            }
            _ => {}
        }
        // the prefix ends up in file names and, unescaped, in the VRT mosaic
        if self.prefix.is_empty()
            || self.prefix.contains(std::path::is_separator)
            || self.prefix.contains(['&', '<', '>', '"', '\''])
        {
            return Err(Error::Configuration(format!(
                "invalid artifact prefix {:?}",
                self.prefix
            )));
        }
        Ok(())
    }

    /// Margin width in pixels.
    pub fn margin_pixels(&self) -> usize {
        self.margin as usize * self.seed_spacing as usize
    }

    /// Chebyshev radius in which a seed competes for pixels.
    pub fn search_radius(&self) -> usize {
        2 * self.seed_spacing as usize
    }

    pub fn workers(&self) -> usize {
        if self.num_workers == 0 {
            rayon::current_num_threads()
        } else {
            self.num_workers
        }
    }
}

pub(crate) fn split_length_to_ranges(length: usize, splits: usize) -> Vec<Range<usize>> {
    let splits = splits.clamp(1, length.max(1));
    let chunk_size = length / splits;
    let rem = length % splits;
    (0..splits)
        .scan((rem, 0usize), |(r, acc), _split| {
            let mut size = chunk_size;
            if *r > 0 {
                *r -= 1;
                size += 1;
            }
            let out = (*acc, *acc + size);
            *acc += size;
            Some(out.0..out.1)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{split_length_to_ranges, Config, TilingMode};
    use crate::error::Error;

    #[test]
    fn split_ranges_test() {
        let ranges = split_length_to_ranges(10, 3);
        assert_eq!(ranges, vec![0..4, 4..7, 7..10]);
        // never more bands than rows
        assert_eq!(split_length_to_ranges(2, 8), vec![0..1, 1..2]);
        assert_eq!(split_length_to_ranges(5, 0), vec![0..5]);
    }

    #[test]
    fn validate_test() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.margin_pixels(), 20);
        assert_eq!(config.search_radius(), 40);

        let invalid = [
            Config {
                seed_spacing: 1,
                ..Config::default()
            },
            Config {
                max_iterations: 0,
                ..Config::default()
            },
            Config {
                distance_weight: -1.0,
                ..Config::default()
            },
            Config {
                threshold: f64::NAN,
                ..Config::default()
            },
            Config {
                tiling: TilingMode::Manual { nx: 0, ny: 2 },
                ..Config::default()
            },
            Config {
                tiling: TilingMode::Auto { ram_mb: 0 },
                ..Config::default()
            },
            Config {
                prefix: "a/b".to_string(),
                ..Config::default()
            },
            Config {
                prefix: "fields&roads".to_string(),
                ..Config::default()
            },
            Config {
                prefix: "<tiles>".to_string(),
                ..Config::default()
            },
        ];
        for config in invalid {
            assert!(matches!(config.validate(), Err(Error::Configuration(_))));
        }
    }

    #[test]
    fn from_json_test() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("params.json");
        std::fs::write(
            &path,
            r#"{"seed_spacing": 8, "tiling": {"manual": {"nx": 2, "ny": 3}}, "prefix": "run"}"#,
        )
        .unwrap();
        let config = Config::from_json_file(&path).unwrap();
        assert_eq!(config.seed_spacing, 8);
        assert_eq!(config.tiling, TilingMode::Manual { nx: 2, ny: 3 });
        assert_eq!(config.prefix, "run");
        assert_eq!(config.max_iterations, 10);

        std::fs::write(&path, r#"{"seed_spacing": 1}"#).unwrap();
        assert!(matches!(
            Config::from_json_file(&path),
            Err(Error::Configuration(_))
        ));
    }
}
