use nalgebra::DMatrix;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::data::dimension::{AxisUnits, DimensionSet};
use crate::data::frame::{MaskedPlane, Volume};
use crate::error::ReconError;
use crate::surface::filters::{gaussian_blur, masked_gaussian_smooth, median3x3, otsu_threshold};

/// Samples that must stay above the confirmation level after a candidate
/// surface crossing. Calibrated against real tissue data; adaptively
/// reduced by at most one when no qualifying run exists.
pub const CONFIRMATIONS_REQUIRED: usize = 12;

/// Sigma of the 2-D Gaussian used to smooth the detected surface.
pub const SMOOTHING_SIGMA: f64 = 1.5;

/// Depth-axis length above which the deeper start index is used.
pub const Z_START_SIZE_THRESHOLD: usize = 600;

/// Start depth for long axes: skips the strong near-surface reference
/// reflections of deep scans.
pub const HIGH_Z_START: usize = 100;

/// Start depth for short axes.
pub const LOW_Z_START: usize = 10;

/// Columns on each side of a tile center used for threshold estimation.
pub const REGION_HALF_WIDTH: usize = 10;

/// Confirmation offset as a fraction of the threshold region's dynamic
/// range: confirmations only need to stay above `threshold - offset`.
pub const CONFIRMATION_OFFSET_FRACTION: f64 = 0.25;

/// Sigma of the denoising blur applied to each y slice before detection.
const DENOISE_SIGMA: f64 = 1.0;

/// Options of the surface estimator, validated once per run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SurfaceEstimatorConfig {
    /// Fixed intensity threshold; bypasses per-tile Otsu detection.
    pub fixed_threshold: Option<f64>,
    /// Lateral field-of-view width of one tile, in the same units as the
    /// volume's x axis. Enables tile-local thresholding when brightness
    /// differs between stitched tiles.
    pub tile_fov_width: Option<f64>,
    /// Confirmation run length; see [`CONFIRMATIONS_REQUIRED`].
    pub confirmations_required: usize,
}

impl Default for SurfaceEstimatorConfig {
    fn default() -> Self {
        SurfaceEstimatorConfig {
            fixed_threshold: None,
            tile_fov_width: None,
            confirmations_required: CONFIRMATIONS_REQUIRED,
        }
    }
}

/// Estimated tissue-interface depth per lateral position, in millimeters.
#[derive(Clone, Debug)]
pub struct SurfaceMap {
    /// Surface depth, rows indexed by y and columns by x. Undefined where
    /// no surface was found anywhere near.
    pub surface_mm: MaskedPlane,
    pub x_mm: Vec<f64>,
    pub y_mm: Vec<f64>,
}

/// Estimates the tissue-interface depth at every lateral position of a
/// reconstructed log-amplitude volume.
///
/// The dimension set must carry physical coordinates; it is converted to
/// millimeters internally so the output units never depend on the input
/// units. Each y slice is denoised (median then Gaussian), thresholded
/// per lateral tile with Otsu, and scanned depth-wise for the first
/// confirmed crossing; the resulting index map is smoothed against its
/// validity mask and mapped to physical depth.
pub fn estimate_surface(
    volume: &Volume,
    dims: &DimensionSet,
    config: &SurfaceEstimatorConfig,
) -> Result<SurfaceMap, ReconError> {
    dims.require_physical()?;
    let dims_mm = dims.to_units(AxisUnits::Millimeters);
    if dims_mm.z.len() != volume.n_z || dims_mm.x.len() != volume.n_x || dims_mm.y.len() != volume.n_y
    {
        return Err(ReconError::InvalidDimension(format!(
            "dimension set {} does not match volume ({}, {}, {})",
            dims_mm, volume.n_z, volume.n_x, volume.n_y
        )));
    }

    let start_z = if volume.n_z > Z_START_SIZE_THRESHOLD {
        HIGH_Z_START
    } else {
        LOW_Z_START
    };
    if start_z >= volume.n_z {
        return Err(ReconError::InvalidDimension(format!(
            "volume too shallow for surface detection: {} depth pixels",
            volume.n_z
        )));
    }

    // The fov width option arrives in the input's x units; compare in mm.
    let tile_fov_mm = config
        .tile_fov_width
        .map(|w| w * dims.x.units.to_mm_factor());
    let tile_ranges = tile_column_ranges(&dims_mm, volume.n_x, tile_fov_mm);

    // Slices are independent; the denoising filters dominate the cost
    let detected: Vec<Vec<Option<usize>>> = (0..volume.n_y)
        .into_par_iter()
        .map(|i_y| {
            let slice = denoised_slice(volume, i_y);
            let mut row = vec![None; volume.n_x];
            for range in &tile_ranges {
                let threshold_region = region_around_center(&slice, range, start_z);
                let (threshold, offset) = match config.fixed_threshold {
                    Some(t) => (t, 0.0),
                    None => {
                        let threshold = otsu_threshold(threshold_region.as_slice());
                        let min = threshold_region
                            .iter()
                            .cloned()
                            .fold(f64::INFINITY, f64::min);
                        let max = threshold_region
                            .iter()
                            .cloned()
                            .fold(f64::NEG_INFINITY, f64::max);
                        (threshold, CONFIRMATION_OFFSET_FRACTION * (max - min))
                    }
                };

                for i_x in range.0..range.1 {
                    row[i_x] = detect_column(
                        &slice,
                        i_x,
                        start_z,
                        threshold,
                        offset,
                        config.confirmations_required,
                    );
                }
            }
            row
        })
        .collect();

    let mut surface_px = MaskedPlane::undefined(volume.n_y, volume.n_x);
    for (i_y, row) in detected.iter().enumerate() {
        for (i_x, found) in row.iter().enumerate() {
            if let Some(i_z) = found {
                surface_px.set(i_y, i_x, *i_z as f64);
            }
        }
    }

    Ok(finalize_surface(surface_px, &dims_mm))
}

/// Column ranges `[start, end)` of the lateral tiles. Without a fov width
/// the whole x extent is one tile. The final tile absorbs the remainder,
/// so a partial edge tile keeps its own (narrower or wider) region.
fn tile_column_ranges(
    dims_mm: &DimensionSet,
    n_x: usize,
    tile_fov_mm: Option<f64>,
) -> Vec<(usize, usize)> {
    let n_tiles = match tile_fov_mm {
        Some(fov) if fov > 0.0 => {
            let extent = dims_mm.x.max() - dims_mm.x.min();
            ((extent / fov).round() as usize).clamp(1, n_x)
        }
        _ => 1,
    };
    let base = n_x / n_tiles;
    (0..n_tiles)
        .map(|t| {
            let start = t * base;
            let end = if t + 1 == n_tiles { n_x } else { start + base };
            (start, end)
        })
        .collect()
}

/// One y slice as a (z, x) matrix, median-filtered then Gaussian-blurred.
fn denoised_slice(volume: &Volume, i_y: usize) -> DMatrix<f64> {
    let slice = DMatrix::from_fn(volume.n_z, volume.n_x, |i_z, i_x| volume.at(i_z, i_x, i_y));
    gaussian_blur(&median3x3(&slice), DENOISE_SIGMA)
}

/// Intensities of the small region around the tile's center column, from
/// the start depth downwards, used for threshold estimation.
fn region_around_center(slice: &DMatrix<f64>, range: &(usize, usize), start_z: usize) -> Vec<f64> {
    let center = (range.0 + range.1) / 2;
    let col_lo = center.saturating_sub(REGION_HALF_WIDTH).max(range.0);
    let col_hi = (center + REGION_HALF_WIDTH + 1).min(range.1);
    let mut region = Vec::with_capacity((slice.nrows() - start_z) * (col_hi - col_lo));
    for c in col_lo..col_hi {
        for r in start_z..slice.nrows() {
            region.push(slice[(r, c)]);
        }
    }
    region
}

/// First depth at or below `start_z` where the column crosses `threshold`
/// and the following confirmation run stays above `threshold - offset`.
/// A run cut off by the volume bottom is unconfirmed. When no run
/// qualifies the requirement relaxes by one before giving up.
fn detect_column(
    slice: &DMatrix<f64>,
    i_x: usize,
    start_z: usize,
    threshold: f64,
    offset: f64,
    confirmations: usize,
) -> Option<usize> {
    let n_z = slice.nrows();
    for required in [confirmations, confirmations.saturating_sub(1)] {
        for i_z in start_z..n_z {
            if slice[(i_z, i_x)] <= threshold {
                continue;
            }
            // A run truncated by the volume bottom cannot confirm anything
            if i_z + 1 + required > n_z {
                break;
            }
            let confirmed =
                (i_z + 1..i_z + 1 + required).all(|r| slice[(r, i_x)] > threshold - offset);
            if confirmed {
                return Some(i_z);
            }
        }
    }
    None
}

/// Smooths the pixel-index surface against its validity mask and converts
/// indices to physical millimeters through the z axis.
fn finalize_surface(surface_px: MaskedPlane, dims_mm: &DimensionSet) -> SurfaceMap {
    let rows = surface_px.rows;
    let cols = surface_px.cols;
    let values = DMatrix::from_fn(rows, cols, |r, c| surface_px.get(r, c).unwrap_or(0.0));
    let mask = DMatrix::from_fn(rows, cols, |r, c| {
        if surface_px.get(r, c).is_some() {
            1.0
        } else {
            0.0
        }
    });
    let (smoothed, weight) = masked_gaussian_smooth(&values, &mask, SMOOTHING_SIGMA);

    let mut surface_mm = MaskedPlane::undefined(rows, cols);
    for r in 0..rows {
        for c in 0..cols {
            if weight[(r, c)] > 0.0 {
                surface_mm.set(r, c, dims_mm.z.value_at(smoothed[(r, c)]));
            }
        }
    }

    SurfaceMap {
        surface_mm,
        x_mm: dims_mm.x.values.clone(),
        y_mm: dims_mm.y.values.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::dimension::DimensionAxis;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use statrs::distribution::Normal;
    use rand::distributions::Distribution;

    fn index_dims(n_z: usize, n_x: usize, n_y: usize, units: AxisUnits) -> DimensionSet {
        let axis = |n: usize, origin: &str| {
            DimensionAxis::new((0..n).map(|i| i as f64).collect(), units, origin)
        };
        DimensionSet::new(axis(n_x, "x"), axis(n_y, "y"), axis(n_z, "sample top"))
    }

    /// Synthetic volume: dim background above the surface, speckle-bright
    /// tissue below it.
    fn speckle_volume(n_z: usize, n_x: usize, n_y: usize, surface_z: usize, seed: u64) -> Volume {
        let mut rng = StdRng::seed_from_u64(seed);
        let normal = Normal::new(0.0, 1.0).unwrap();
        let mut volume = Volume::zeros(n_z, n_x, n_y);
        for i_y in 0..n_y {
            for i_x in 0..n_x {
                for i_z in 0..n_z {
                    let v = if i_z < surface_z {
                        10.0
                    } else {
                        10.0 + 990.0 * normal.sample(&mut rng).abs()
                    };
                    volume.set(i_z, i_x, i_y, v);
                }
            }
        }
        volume
    }

    #[test]
    fn test_surface_detection_accuracy_and_unit_invariance() {
        let (n_z, n_x, n_y) = (1024, 100, 200);
        let volume = speckle_volume(n_z, n_x, n_y, 500, 7);

        let microns = estimate_surface(
            &volume,
            &index_dims(n_z, n_x, n_y, AxisUnits::Microns),
            &SurfaceEstimatorConfig::default(),
        )
        .unwrap();
        let millimeters = estimate_surface(
            &volume,
            &index_dims(n_z, n_x, n_y, AxisUnits::Millimeters),
            &SurfaceEstimatorConfig::default(),
        )
        .unwrap();

        // Mean error within 2 pixels of the true surface. The micron axes
        // put one pixel at 1e-3 mm.
        let mut total_err = 0.0;
        let mut count = 0;
        for r in 0..n_y {
            for c in 0..n_x {
                let est = microns.surface_mm.get(r, c).expect("surface defined");
                total_err += (est * 1e3 - 500.0).abs();
                count += 1;
            }
        }
        let mean_err = total_err / count as f64;
        assert!(mean_err < 2.0, "mean surface error {} px", mean_err);

        // Identical result regardless of the input units; mm axes put one
        // pixel at 1 mm.
        for r in 0..n_y {
            for c in 0..n_x {
                let um = microns.surface_mm.get(r, c).unwrap() * 1e3;
                let mm = millimeters.surface_mm.get(r, c).unwrap();
                assert!((um - mm).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn test_fixed_threshold_step_volume() {
        let (n_z, n_x, n_y) = (60, 12, 6);
        let mut volume = Volume::zeros(n_z, n_x, n_y);
        for i_y in 0..n_y {
            for i_x in 0..n_x {
                for i_z in 0..n_z {
                    let v = if i_z < 30 { 0.0 } else { 100.0 };
                    volume.set(i_z, i_x, i_y, v);
                }
            }
        }
        let config = SurfaceEstimatorConfig {
            fixed_threshold: Some(50.0),
            ..SurfaceEstimatorConfig::default()
        };
        let map = estimate_surface(
            &volume,
            &index_dims(n_z, n_x, n_y, AxisUnits::Millimeters),
            &config,
        )
        .unwrap();
        for r in 0..n_y {
            for c in 0..n_x {
                let est = map.surface_mm.get(r, c).expect("surface defined");
                // Denoising spreads the step by a pixel or two
                assert!((est - 30.0).abs() <= 2.0, "estimate {}", est);
            }
        }
    }

    #[test]
    fn test_missing_physical_dims_is_hard_error() {
        let volume = Volume::zeros(60, 4, 4);
        let mut dims = index_dims(60, 4, 4, AxisUnits::Millimeters);
        dims.z.values[3] = f64::NAN;
        let result = estimate_surface(&volume, &dims, &SurfaceEstimatorConfig::default());
        assert!(matches!(result, Err(ReconError::InvalidDimension(_))));
    }

    #[test]
    fn test_all_dark_volume_yields_undefined_surface() {
        let volume = Volume::zeros(60, 8, 4);
        let config = SurfaceEstimatorConfig {
            fixed_threshold: Some(50.0),
            ..SurfaceEstimatorConfig::default()
        };
        let map = estimate_surface(
            &volume,
            &index_dims(60, 8, 4, AxisUnits::Millimeters),
            &config,
        )
        .unwrap();
        assert_eq!(map.surface_mm.defined_count(), 0);
    }

    #[test]
    fn test_bottom_artifact_is_not_a_surface() {
        // Bright slab only in the last few depth rows: too shallow for a
        // full confirmation run, so no surface anywhere
        let (n_z, n_x, n_y) = (60, 8, 4);
        let mut volume = Volume::zeros(n_z, n_x, n_y);
        for i_y in 0..n_y {
            for i_x in 0..n_x {
                for i_z in 55..n_z {
                    volume.set(i_z, i_x, i_y, 100.0);
                }
            }
        }
        let config = SurfaceEstimatorConfig {
            fixed_threshold: Some(50.0),
            ..SurfaceEstimatorConfig::default()
        };
        let map = estimate_surface(
            &volume,
            &index_dims(n_z, n_x, n_y, AxisUnits::Millimeters),
            &config,
        )
        .unwrap();
        assert_eq!(map.surface_mm.defined_count(), 0);
    }

    #[test]
    fn test_per_tile_thresholding_with_uneven_brightness() {
        // Three tiles of different brightness; the last tile is a partial
        // edge tile (its columns are the division remainder).
        let (n_z, n_x, n_y) = (80, 50, 4);
        let mut volume = Volume::zeros(n_z, n_x, n_y);
        let brightness = [1000.0, 100.0, 2500.0];
        for i_y in 0..n_y {
            for i_x in 0..n_x {
                let tile = (i_x / 16).min(2);
                for i_z in 0..n_z {
                    let v = if i_z < 40 { 10.0 } else { brightness[tile] };
                    volume.set(i_z, i_x, i_y, v);
                }
            }
        }
        // x axis spans 49 mm; a 16 mm fov yields 3 tiles
        let config = SurfaceEstimatorConfig {
            tile_fov_width: Some(16.0),
            ..SurfaceEstimatorConfig::default()
        };
        let map = estimate_surface(
            &volume,
            &index_dims(n_z, n_x, n_y, AxisUnits::Millimeters),
            &config,
        )
        .unwrap();
        for r in 0..n_y {
            for c in 0..n_x {
                let est = map.surface_mm.get(r, c).expect("surface defined");
                assert!((est - 40.0).abs() <= 2.0, "col {} estimate {}", c, est);
            }
        }
    }
}
