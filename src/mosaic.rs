use crate::arrays::Array2D;
use crate::cluster::{Label, UNASSIGNED};
use crate::error::{Error, Result};
use crate::raster::{read_labels, write_envi_header, write_labels};
use crate::tiling::{Partition, Region};
use log::{info, warn};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

/// One tile raster of the mosaic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MosaicSource {
    /// Label raster of the tile.
    pub labels: PathBuf,
    /// Placement of the tile in the full image.
    pub region: Region,
}

impl MosaicSource {
    /// Every file the tile persisted: label raster, ENVI header and centroid table.
    pub fn artifacts(&self) -> Vec<PathBuf> {
        let mut files = vec![self.labels.clone(), self.labels.with_extension("hdr")];
        if let Some(stem) = self.labels.file_stem() {
            files.push(
                self.labels
                    .with_file_name(format!("{}_seeds.json", stem.to_string_lossy())),
            );
        }
        files
    }
}

/// Virtual mosaic of the tile label rasters, persisted as a GDAL VRT file.
///
/// Tile cores are disjoint and cover the image, so the descriptor is one image without copying
/// any pixel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MosaicDescriptor {
    pub path: PathBuf,
    pub width: usize,
    pub height: usize,
    pub sources: Vec<MosaicSource>,
}

impl MosaicDescriptor {
    /// Descriptor at `{temp_dir}/{prefix}.vrt` listing every tile of `partition`.
    pub fn new(temp_dir: &Path, prefix: &str, partition: &Partition) -> Self {
        Self {
            path: temp_dir.join(format!("{prefix}.vrt")),
            width: partition.image_width,
            height: partition.image_height,
            sources: partition
                .tiles
                .iter()
                .map(|tile| MosaicSource {
                    labels: tile.artifacts.labels.clone(),
                    region: tile.core,
                })
                .collect(),
        }
    }

    fn vrt(&self) -> String {
        let mut vrt = format!(
            "<VRTDataset rasterXSize=\"{}\" rasterYSize=\"{}\">\n",
            self.width, self.height
        );
        vrt.push_str("\t<VRTRasterBand dataType=\"UInt32\" band=\"1\">\n");
        vrt.push_str("\t\t<ColorInterp>Gray</ColorInterp>\n");
        for source in &self.sources {
            let name = source
                .labels
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let Region {
                x,
                y,
                width,
                height,
            } = source.region;
            vrt.push_str("\t\t<SimpleSource>\n");
            vrt.push_str(&format!(
                "\t\t\t<SourceFilename relativeToVRT=\"1\">{name}</SourceFilename>\n"
            ));
            vrt.push_str("\t\t\t<SourceBand>1</SourceBand>\n");
            vrt.push_str(&format!(
                "\t\t\t<SrcRect xOff=\"0\" yOff=\"0\" xSize=\"{width}\" ySize=\"{height}\"/>\n"
            ));
            vrt.push_str(&format!(
                "\t\t\t<DstRect xOff=\"{x}\" yOff=\"{y}\" xSize=\"{width}\" ySize=\"{height}\"/>\n"
            ));
            vrt.push_str("\t\t</SimpleSource>\n");
        }
        vrt.push_str("\t</VRTRasterBand>\n</VRTDataset>\n");
        vrt
    }

    /// Writes the VRT file.
    pub fn write(&self) -> Result<()> {
        let file = File::create(&self.path).map_err(|e| Error::io(&self.path, e))?;
        let mut writer = BufWriter::new(file);
        writer
            .write_all(self.vrt().as_bytes())
            .and_then(|_| writer.flush())
            .map_err(|e| Error::io(&self.path, e))?;
        info!(
            "mosaic of {} tiles written to {}",
            self.sources.len(),
            self.path.display()
        );
        Ok(())
    }

    /// Reads a descriptor written by `write()`. Source file names are resolved against the
    /// directory of the VRT file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        let dir = path.parent().unwrap_or_else(|| Path::new(""));
        let missing = |what: &str| Error::manifest(path, format!("missing {what}"));

        let dataset = contents
            .lines()
            .find(|l| l.trim_start().starts_with("<VRTDataset"))
            .ok_or_else(|| missing("VRTDataset"))?;
        let width = attribute(dataset, "rasterXSize").ok_or_else(|| missing("rasterXSize"))?;
        let height = attribute(dataset, "rasterYSize").ok_or_else(|| missing("rasterYSize"))?;

        let mut sources = Vec::new();
        let mut file_name = None;
        for line in contents.lines().map(str::trim) {
            if let Some(rest) = line.strip_prefix("<SourceFilename") {
                let name = rest
                    .split_once('>')
                    .and_then(|(_, rest)| rest.split_once("</SourceFilename>"))
                    .map(|(name, _)| name.to_string())
                    .ok_or_else(|| missing("SourceFilename"))?;
                file_name = Some(name);
            } else if line.starts_with("<DstRect") {
                let rect = (
                    attribute(line, "xOff"),
                    attribute(line, "yOff"),
                    attribute(line, "xSize"),
                    attribute(line, "ySize"),
                );
                let (Some(x), Some(y), Some(w), Some(h)) = rect else {
                    return Err(missing("DstRect attributes"));
                };
                let name = file_name.take().ok_or_else(|| missing("SourceFilename"))?;
                sources.push(MosaicSource {
                    labels: dir.join(name),
                    region: Region::new(x, y, w, h),
                });
            }
        }
        let descriptor = Self {
            path: path.to_path_buf(),
            width,
            height,
            sources,
        };
        descriptor.check_coverage()?;
        Ok(descriptor)
    }

    /// Tile regions must be inside the image and must not overlap.
    fn check_coverage(&self) -> Result<()> {
        let image = Region::new(0, 0, self.width, self.height);
        for (i, source) in self.sources.iter().enumerate() {
            if !image.contains_region(&source.region) {
                return Err(Error::manifest(
                    &self.path,
                    format!("tile {} lies outside of the image", source.labels.display()),
                ));
            }
            if self.sources[..i]
                .iter()
                .any(|other| other.region.intersects(&source.region))
            {
                return Err(Error::manifest(
                    &self.path,
                    format!("tile {} overlaps another tile", source.labels.display()),
                ));
            }
        }
        let covered: usize = self.sources.iter().map(|s| s.region.area()).sum();
        if covered != image.area() {
            return Err(Error::manifest(
                &self.path,
                format!("tiles cover {covered} of {} pixels", image.area()),
            ));
        }
        Ok(())
    }

    /// Assembles the full label image from the tile rasters.
    pub fn read_labels(&self) -> Result<Array2D<Label>> {
        let mut labels = Array2D::from_fill(UNASSIGNED, self.width, self.height);
        for source in &self.sources {
            let region = source.region;
            let tile = read_labels(&source.labels, region.width, region.height)?;
            for row in 0..region.height {
                labels.get_row_mut(region.y + row)[region.x..region.right()]
                    .copy_from_slice(tile.get_row(row));
            }
        }
        Ok(labels)
    }

    /// Writes the whole label image to `output` as one raw `u32` file with an ENVI header next
    /// to it.
    pub fn consolidate(&self, output: &Path) -> Result<()> {
        let labels = self.read_labels()?;
        write_labels(output, &labels)?;
        write_envi_header(&output.with_extension("hdr"), self.width, self.height)?;
        info!(
            "consolidated {} tiles into {}",
            self.sources.len(),
            output.display()
        );
        Ok(())
    }

    /// Removes the tile artifacts and the VRT file. Failures are only logged.
    pub fn remove_artifacts(&self) {
        let files = self
            .sources
            .iter()
            .flat_map(MosaicSource::artifacts)
            .chain(std::iter::once(self.path.clone()));
        for file in files {
            if let Err(e) = std::fs::remove_file(&file) {
                warn!("unable to remove {}: {e}", file.display());
            }
        }
    }
}

/// Value of `name="..."` in an XML tag line.
fn attribute(line: &str, name: &str) -> Option<usize> {
    let pattern = format!(" {name}=\"");
    let start = line.find(&pattern)? + pattern.len();
    let end = line[start..].find('"')? + start;
    line[start..end].parse().ok()
}
