use crate::arrays::ArrayError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors of a segmentation run.
///
/// Configuration and partition errors are raised before any tile is touched. Everything else is
/// fatal for the tile it happened in and therefore for the whole run, because the mosaic would
/// be incomplete.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid parameter combination.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// The image can't be split into tiles holding at least one seed.
    #[error("cannot partition {width}x{height} image: {reason}")]
    Partition {
        width: usize,
        height: usize,
        reason: String,
    },

    /// Reading or writing a file failed.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The source raster returned nothing usable for a tile.
    #[error("input region of tile {tile} is unusable: {reason}")]
    InputRegion { tile: usize, reason: String },

    /// A persisted centroid table or mosaic descriptor can't be parsed.
    #[error("malformed manifest {}: {reason}", path.display())]
    Manifest { path: PathBuf, reason: String },

    #[error(transparent)]
    Array(#[from] ArrayError),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn manifest(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::Manifest {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// True for failures of the I/O class (reading the source, persisting or re-reading
    /// artifacts).
    pub fn is_io(&self) -> bool {
        matches!(
            self,
            Error::Io { .. } | Error::InputRegion { .. } | Error::Manifest { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
