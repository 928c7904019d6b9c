use crate::arrays::{Array2D, MultiBandImage};
use crate::cluster::{Label, Seed, UNASSIGNED};
use crate::common::{split_length_to_ranges, AssignThreadingStrategy, Config};
use crate::tiling::Region;
use multiversion::multiversion;
use rayon::current_num_threads;
use rayon::prelude::*;
use std::ops::Range;

/// This function implements the assign step of SLIC for one tile.
///
/// Every pixel of `image` (placed at `region` in the full image) gets the label of the seed
/// minimizing `d_spectral + distance_weight * d_spatial / S` among the seeds whose search window
/// covers it. `previous` is only read: on exact ties the pixel keeps its previous label, other
/// ties go to the lowest label. Pixels no seed reaches keep their previous label.
///
/// The result only depends on the seeds and `previous`, so the row bands can be processed in
/// any order.
pub fn assign(
    image: &MultiBandImage,
    region: &Region,
    config: &Config,
    seeds: &mut [Seed],
    previous: &Array2D<Label>,
    labels: &mut Array2D<Label>,
    min_distances: &mut Array2D<f64>,
) {
    debug_assert_eq!((image.width, image.height), (region.width, region.height));
    debug_assert_eq!((labels.width, labels.height), (region.width, region.height));
    let search_radius = config.search_radius();
    let spatial_coef = config.distance_weight / config.seed_spacing as f64;

    let reachable: Vec<bool> = seeds
        .iter_mut()
        .map(|seed| seed.update_coords(region, search_radius))
        .collect();
    let mut candidates: Vec<&Seed> = seeds
        .iter()
        .zip(&reachable)
        .filter(|(_, reachable)| **reachable)
        .map(|(seed, _)| seed)
        .collect();
    candidates.sort_unstable_by_key(|s| s.label);

    labels.fill(UNASSIGNED);
    min_distances.fill(f64::INFINITY);

    let num_threads = match config.assign_threading_strategy {
        AssignThreadingStrategy::SingleThread => 1,
        AssignThreadingStrategy::RowBased => current_num_threads(),
    };
    let ranges = split_length_to_ranges(image.height, num_threads);

    let row_bands: Vec<_> = labels
        .split_rows_mut(ranges.clone())
        .into_iter()
        .zip(min_distances.split_rows_mut(ranges))
        .map(|((rows, labels_band), (_, distances_band))| (rows, labels_band, distances_band))
        .collect();

    row_bands
        .into_par_iter()
        .for_each(|(rows, labels_band, distances_band)| {
            let band_seeds: Vec<&Seed> = candidates
                .iter()
                .filter(|s| s.bottom >= rows.start && s.top < rows.end)
                .copied()
                .collect();
            assign_band(
                image,
                region,
                rows,
                labels_band,
                distances_band,
                previous,
                &band_seeds,
                spatial_coef,
            );
        });
}

#[multiversion(targets = "simd")]
#[allow(clippy::too_many_arguments)]
fn assign_band(
    image: &MultiBandImage,
    region: &Region,
    rows: Range<usize>,
    labels_band: &mut [Label],
    distances_band: &mut [f64],
    previous: &Array2D<Label>,
    band_seeds: &[&Seed],
    spatial_coef: f64,
) {
    let width = image.width;
    let bands = image.bands;
    for seed in band_seeds {
        let top = seed.top.max(rows.start);
        let bottom = seed.bottom.min(rows.end - 1);
        for row in top..=bottom {
            let local_row = row - rows.start;
            let image_row = &image.get_row(row)[seed.left * bands..(seed.right + 1) * bands];
            let previous_row = previous.get_row_part(row, seed.left, seed.right);
            let labels_row =
                &mut labels_band[local_row * width + seed.left..=local_row * width + seed.right];
            let distances_row =
                &mut distances_band[local_row * width + seed.left..=local_row * width + seed.right];
            assign_row(
                image_row,
                bands,
                seed,
                (region.x + seed.left) as f64,
                (region.y + row) as f64,
                spatial_coef,
                previous_row,
                distances_row,
                labels_row,
            );
        }
    }
    // pixels out of reach of every seed
    for (i, label) in labels_band.iter_mut().enumerate() {
        if *label == UNASSIGNED {
            *label = previous.data[rows.start * width + i];
        }
    }
}

#[inline(always)]
#[allow(clippy::too_many_arguments)]
fn assign_row(
    image_row: &[f32],
    bands: usize,
    seed: &Seed,
    x0: f64,
    y: f64,
    spatial_coef: f64,
    previous_row: &[Label],
    min_dist_row: &mut [f64],
    labels_row: &mut [Label],
) {
    let dy = y - seed.y;
    let dy2 = dy * dy;
    for (i, ((pixel, prev), (min_dist, assign))) in image_row
        .chunks_exact(bands)
        .zip(previous_row)
        .zip(min_dist_row.iter_mut().zip(labels_row.iter_mut()))
        .enumerate()
    {
        let spectral: f64 = pixel
            .iter()
            .zip(&seed.spectral)
            .map(|(p, s)| {
                let d = *p as f64 - s;
                d * d
            })
            .sum();
        let dx = x0 + i as f64 - seed.x;
        let dist = spectral.sqrt() + spatial_coef * (dx * dx + dy2).sqrt();
        if dist < *min_dist || (dist == *min_dist && seed.label == *prev) {
            *min_dist = dist;
            *assign = seed.label;
        }
    }
}
