use std::sync::atomic::{AtomicUsize, Ordering};

use rayon::prelude::*;
use rayon::ThreadPoolBuilder;

use octcore::data::frame::MaskedPlane;
use octcore::error::ReconError;
use octcore::transform::focus::{focus_weights, min_total_weight};
use octcore::transform::spectral::SpectralTransform;

use crate::scan::config::ScanConfig;
use crate::scan::frame::{TileFrameBuilder, TileFrames};
use crate::scan::grid::{ScanGrid, Tile};
use crate::stitch::loader::{OpticalPathCorrector, RawFrameLoader};
use crate::stitch::sink::VolumeSink;

/// Read-only state shared by every row worker: the grid, both coordinate
/// lattices and the spectral transform. Built once per run, never mutated.
pub struct StitchContext {
    pub config: ScanConfig,
    pub grid: ScanGrid,
    pub transform: SpectralTransform,
    pub frames: TileFrames,
}

impl StitchContext {
    pub fn new(
        config: ScanConfig,
        grid: ScanGrid,
        transform: SpectralTransform,
    ) -> Result<Self, ReconError> {
        config.validate()?;
        let frames = TileFrameBuilder::new(&config).build(transform.depth_axis())?;
        Ok(StitchContext {
            config,
            grid,
            transform,
            frames,
        })
    }

    /// Output rows this run will produce.
    pub fn output_rows(&self) -> usize {
        self.frames.dim_output.y.len()
    }
}

/// Stitches the whole acquisition into `sink`, one output y row at a time.
///
/// Rows are independent and run on a bounded worker pool; no state is
/// shared between them beyond the read-only context. The first failing
/// row aborts the run with its index and cause; rows already written stay
/// in the sink for diagnosis. After the last row the sink's own row count
/// is checked against the lattice and the writer's count.
pub fn stitch_volume(
    ctx: &StitchContext,
    loader: &dyn RawFrameLoader,
    corrector: Option<&dyn OpticalPathCorrector>,
    sink: &dyn VolumeSink,
) -> Result<(), ReconError> {
    let n_rows = ctx.output_rows();
    if sink.expected_rows() != n_rows {
        return Err(ReconError::Config(format!(
            "sink sized for {} rows but the output lattice has {}",
            sink.expected_rows(),
            n_rows
        )));
    }

    let pool = ThreadPoolBuilder::new()
        .num_threads(ctx.config.workers)
        .build()
        .map_err(|e| ReconError::Config(format!("worker pool: {}", e)))?;

    let written = AtomicUsize::new(0);
    pool.install(|| {
        (0..n_rows).into_par_iter().try_for_each(|y_index| {
            let row = process_row(ctx, loader, corrector, y_index).map_err(|e| ReconError::Row {
                row: y_index,
                source: Box::new(e),
            })?;
            sink.write_row(y_index, &row).map_err(|e| ReconError::Row {
                row: y_index,
                source: Box::new(e),
            })?;
            written.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
    })?;

    let reported = sink.completed_rows();
    let written = written.load(Ordering::Relaxed);
    if reported != n_rows {
        return Err(ReconError::RowCountMismatch {
            expected: n_rows,
            reported,
            written,
        });
    }
    sink.finalize(&ctx.frames.dim_output)
}

/// Accumulates every contributing tile into one output row and converts
/// the weighted mean to the log scale.
fn process_row(
    ctx: &StitchContext,
    loader: &dyn RawFrameLoader,
    corrector: Option<&dyn OpticalPathCorrector>,
    y_index: usize,
) -> Result<MaskedPlane, ReconError> {
    let local = &ctx.frames.dim_one_tile;
    let out = &ctx.frames.dim_output;
    let n_z_out = out.z.len();
    let n_x_out = out.x.len();
    let y_value = out.y.values[y_index];

    // Row-private accumulator; never shared across rows
    let mut weighted_sum = vec![0.0; n_z_out * n_x_out];
    let mut weight_total = vec![0.0; n_z_out * n_x_out];

    let half_dy = local.y.spacing().abs() / 2.0;
    let n_avg = ctx.config.a_scan_averages * ctx.config.b_scan_averages;

    for tile in &ctx.grid.tiles {
        let y_local = y_value - tile.y_center_mm;
        if y_local < local.y.min() - half_dy - 1e-9 || y_local > local.y.max() + half_dy + 1e-9 {
            continue;
        }
        let y_frame = local.y.nearest_index(y_local);

        let loaded = loader.load(
            tile,
            ctx.transform.n_lambda(),
            local.x.len(),
            n_avg,
            y_frame,
        );
        if !loaded.valid {
            eprintln!(
                "Warning: raw frame {} (y frame {}) unreadable, stitched with zero weight",
                tile.raw_ref, y_frame
            );
            continue;
        }

        let profile = ctx.transform.transform_frame(&loaded.frame)?;
        let (profile, valid) = match corrector {
            Some(c) => c.correct(&profile, &local.z.values),
            None => {
                let n = profile.values.len();
                (profile, vec![true; n])
            }
        };

        let n_z_t = profile.n_z;
        let n_x_t = profile.n_x;
        let z_weights = focus_weights(n_z_t, ctx.config.focus_pixel, ctx.config.focus_sigma_px);

        // (z, x) planes of amplitude*weight and weight, z contiguous
        let mut weighted = vec![0.0; n_z_t * n_x_t];
        let mut weights = vec![0.0; n_z_t * n_x_t];
        for i_x in 0..n_x_t {
            for i_z in 0..n_z_t {
                let i = i_x * n_z_t + i_z;
                if valid[i] {
                    let w = z_weights[i_z];
                    weighted[i] = profile.values[i].norm() * w;
                    weights[i] = w;
                }
            }
        }

        accumulate_tile(
            &mut weighted_sum,
            &mut weight_total,
            &weighted,
            &weights,
            n_z_t,
            n_x_t,
            local.x.values[0] + tile.x_center_mm,
            local.x.spacing(),
            local.z.values[0] + tile.z_depth_mm,
            local.z.spacing(),
            &out.x.values,
            &out.z.values,
        );
    }

    let mut row = MaskedPlane::undefined(n_z_out, n_x_out);
    let floor = min_total_weight();
    for i_z in 0..n_z_out {
        for i_x in 0..n_x_out {
            let i = i_z * n_x_out + i_x;
            let total = weight_total[i];
            if total < floor {
                continue;
            }
            let amplitude = weighted_sum[i] / total;
            if amplitude > 0.0 {
                // mag2db
                row.set(i_z, i_x, 20.0 * amplitude.log10());
            }
        }
    }
    Ok(row)
}

/// Bilinear resampling of one tile's weighted amplitude and weight map
/// from its local uniform grid onto the shared output grid; samples
/// outside the tile fill with zero (they simply contribute nothing).
#[allow(clippy::too_many_arguments)]
fn accumulate_tile(
    weighted_sum: &mut [f64],
    weight_total: &mut [f64],
    weighted: &[f64],
    weights: &[f64],
    n_z_t: usize,
    n_x_t: usize,
    x0: f64,
    dx: f64,
    z0: f64,
    dz: f64,
    out_x: &[f64],
    out_z: &[f64],
) {
    let n_x_out = out_x.len();
    for (i_x_out, &xq) in out_x.iter().enumerate() {
        let fx = match fractional_index(xq, x0, dx, n_x_t) {
            Some(f) => f,
            None => continue,
        };
        let (ix0, tx) = split_index(fx, n_x_t);
        for (i_z_out, &zq) in out_z.iter().enumerate() {
            let fz = match fractional_index(zq, z0, dz, n_z_t) {
                Some(f) => f,
                None => continue,
            };
            let (iz0, tz) = split_index(fz, n_z_t);

            // Upper taps carry zero weight on a length-1 axis; clamp them
            // in bounds instead of reading past the tile plane
            let ix1 = (ix0 + 1).min(n_x_t - 1);
            let iz1 = (iz0 + 1).min(n_z_t - 1);
            let sample = |data: &[f64]| {
                let c00 = data[ix0 * n_z_t + iz0];
                let c01 = data[ix0 * n_z_t + iz1];
                let c10 = data[ix1 * n_z_t + iz0];
                let c11 = data[ix1 * n_z_t + iz1];
                c00 * (1.0 - tx) * (1.0 - tz)
                    + c01 * (1.0 - tx) * tz
                    + c10 * tx * (1.0 - tz)
                    + c11 * tx * tz
            };

            let i = i_z_out * n_x_out + i_x_out;
            weighted_sum[i] += sample(weighted);
            weight_total[i] += sample(weights);
        }
    }
}

/// Fractional index of `value` on the uniform grid starting at `v0` with
/// step `dv`, or `None` when it falls outside the grid.
fn fractional_index(value: f64, v0: f64, dv: f64, n: usize) -> Option<f64> {
    if n == 1 {
        return if (value - v0).abs() < 1e-9 { Some(0.0) } else { None };
    }
    if dv == 0.0 {
        return None;
    }
    let f = (value - v0) / dv;
    let last = (n - 1) as f64;
    if f < -1e-9 || f > last + 1e-9 {
        return None;
    }
    Some(f.clamp(0.0, last))
}

/// Splits a fractional index into a base cell and an interpolation
/// fraction. On a length-1 axis the fraction is zero and the caller
/// clamps the upper tap.
fn split_index(f: f64, n: usize) -> (usize, f64) {
    if n < 2 {
        return (0, 0.0);
    }
    let base = (f.floor() as usize).min(n - 2);
    (base, f - base as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use octcore::data::dimension::{AxisUnits, DimensionAxis};
    use octcore::data::frame::ComplexDepthProfile;
    use octcore::transform::spectral::{SpectralTransformConfig, DEFAULT_REFRACTIVE_INDEX};
    use std::f64::consts::PI;

    use crate::stitch::loader::SyntheticFrameSource;
    use crate::stitch::sink::MemoryVolumeSink;

    fn uniform_k_lambda(n: usize) -> DimensionAxis {
        let k_hi = 2.0 * PI / 800.0;
        let k_lo = 2.0 * PI / 900.0;
        let step = (k_lo - k_hi) / (n - 1) as f64;
        let values: Vec<f64> = (0..n).map(|i| 2.0 * PI / (k_hi + i as f64 * step)).collect();
        DimensionAxis::new(values, AxisUnits::Nanometers, "spectrometer")
    }

    fn test_transform(lambda: &DimensionAxis) -> SpectralTransform {
        let config = SpectralTransformConfig {
            dispersion_nm2_per_rad: Some(0.0),
            ..SpectralTransformConfig::default()
        };
        SpectralTransform::new(lambda, &config).unwrap()
    }

    fn single_tile_config() -> ScanConfig {
        ScanConfig {
            tile_pixels_x: 8,
            tile_pixels_y: 4,
            tile_extent_x_mm: 0.7,
            tile_extent_y_mm: 0.3,
            ..ScanConfig::default()
        }
    }

    fn run(
        ctx: &StitchContext,
        loader: &dyn RawFrameLoader,
        corrector: Option<&dyn OpticalPathCorrector>,
    ) -> MemoryVolumeSink {
        let sink = MemoryVolumeSink::new(ctx.output_rows());
        stitch_volume(ctx, loader, corrector, &sink).unwrap();
        sink
    }

    #[test]
    fn test_single_tile_identity() {
        let lambda = uniform_k_lambda(64);
        let source = SyntheticFrameSource::new(&lambda, 0.05, DEFAULT_REFRACTIVE_INDEX);
        let config = single_tile_config();
        let grid = ScanGrid::from_config(&config, &[]).unwrap();
        let ctx = StitchContext::new(config, grid, test_transform(&lambda)).unwrap();

        let sink = run(&ctx, &source, None);

        // Expected row: the tile's own transformed amplitude in dB
        let tile = &ctx.grid.tiles[0];
        let loaded = source.load(tile, 64, 8, 1, 0);
        let profile = ctx.transform.transform_frame(&loaded.frame).unwrap();

        let row = sink.row(0).unwrap();
        assert_eq!(row.rows, ctx.frames.dim_output.z.len());
        for i_z in 0..row.rows {
            for i_x in 0..row.cols {
                let amplitude = profile.at(i_z, i_x).norm();
                match row.get(i_z, i_x) {
                    Some(db) => {
                        assert!((db - 20.0 * amplitude.log10()).abs() < 1e-9);
                    }
                    None => assert!(amplitude <= 0.0),
                }
            }
        }
    }

    #[test]
    fn test_overlap_of_identical_tiles_averages_to_single() {
        let lambda = uniform_k_lambda(64);
        let source = SyntheticFrameSource::new(&lambda, 0.05, DEFAULT_REFRACTIVE_INDEX);
        let config = single_tile_config();

        let single_grid = ScanGrid::from_config(&config, &[]).unwrap();
        let mut doubled_tiles = single_grid.tiles.clone();
        doubled_tiles.extend(single_grid.tiles.clone());
        let doubled_grid = ScanGrid {
            tiles: doubled_tiles,
        };

        let ctx_single =
            StitchContext::new(config.clone(), single_grid, test_transform(&lambda)).unwrap();
        let ctx_double =
            StitchContext::new(config, doubled_grid, test_transform(&lambda)).unwrap();

        let sink_single = run(&ctx_single, &source, None);
        let sink_double = run(&ctx_double, &source, None);

        for y in 0..ctx_single.output_rows() {
            let a = sink_single.row(y).unwrap();
            let b = sink_double.row(y).unwrap();
            for i in 0..a.values.len() {
                assert_eq!(a.defined[i], b.defined[i]);
                if a.defined[i] {
                    assert!((a.values[i] - b.values[i]).abs() < 1e-9);
                }
            }
        }
    }

    #[test]
    fn test_invalid_frames_leave_rows_undefined_but_complete() {
        struct BrokenLoader;
        impl RawFrameLoader for BrokenLoader {
            fn load(
                &self,
                _tile: &Tile,
                n_lambda: usize,
                n_x: usize,
                n_avg: usize,
                _y_index: usize,
            ) -> crate::stitch::loader::LoadedFrame {
                crate::stitch::loader::LoadedFrame::invalid(n_lambda, n_x, n_avg)
            }
        }

        let lambda = uniform_k_lambda(64);
        let config = single_tile_config();
        let grid = ScanGrid::from_config(&config, &[]).unwrap();
        let ctx = StitchContext::new(config, grid, test_transform(&lambda)).unwrap();

        let sink = run(&ctx, &BrokenLoader, None);
        assert_eq!(sink.completed_rows(), ctx.output_rows());
        for y in 0..ctx.output_rows() {
            assert_eq!(sink.row(y).unwrap().defined_count(), 0);
        }
    }

    #[test]
    fn test_corrector_invalid_samples_get_zero_weight() {
        struct HalfDepthCorrector;
        impl OpticalPathCorrector for HalfDepthCorrector {
            fn correct(
                &self,
                profile: &ComplexDepthProfile,
                _z_axis_mm: &[f64],
            ) -> (ComplexDepthProfile, Vec<bool>) {
                let mut valid = vec![true; profile.values.len()];
                for i_x in 0..profile.n_x {
                    for i_z in profile.n_z / 2..profile.n_z {
                        valid[i_x * profile.n_z + i_z] = false;
                    }
                }
                (profile.clone(), valid)
            }
        }

        let lambda = uniform_k_lambda(64);
        let source = SyntheticFrameSource::new(&lambda, 0.05, DEFAULT_REFRACTIVE_INDEX);
        let config = single_tile_config();
        let grid = ScanGrid::from_config(&config, &[]).unwrap();
        let ctx = StitchContext::new(config, grid, test_transform(&lambda)).unwrap();

        let sink = run(&ctx, &source, Some(&HalfDepthCorrector));
        let row = sink.row(0).unwrap();
        let n_z = row.rows;
        for i_x in 0..row.cols {
            for i_z in n_z / 2..n_z {
                assert_eq!(row.get(i_z, i_x), None);
            }
        }
        // The shallow half still carries data somewhere
        assert!(row.defined_count() > 0);
    }

    #[test]
    fn test_row_count_mismatch_is_hard_error() {
        /// Sink that loses every write silently.
        struct LossySink {
            inner: MemoryVolumeSink,
        }
        impl VolumeSink for LossySink {
            fn expected_rows(&self) -> usize {
                self.inner.expected_rows()
            }
            fn write_row(&self, _y_index: usize, _row: &MaskedPlane) -> Result<(), ReconError> {
                Ok(())
            }
            fn finalize(&self, dims: &octcore::data::dimension::DimensionSet) -> Result<(), ReconError> {
                self.inner.finalize(dims)
            }
            fn completed_rows(&self) -> usize {
                self.inner.completed_rows()
            }
        }

        let lambda = uniform_k_lambda(64);
        let source = SyntheticFrameSource::new(&lambda, 0.05, DEFAULT_REFRACTIVE_INDEX);
        let config = single_tile_config();
        let grid = ScanGrid::from_config(&config, &[]).unwrap();
        let ctx = StitchContext::new(config, grid, test_transform(&lambda)).unwrap();

        let sink = LossySink {
            inner: MemoryVolumeSink::new(ctx.output_rows()),
        };
        let result = stitch_volume(&ctx, &source, None, &sink);
        match result {
            Err(ReconError::RowCountMismatch {
                expected,
                reported,
                written,
            }) => {
                assert_eq!(expected, ctx.output_rows());
                assert_eq!(reported, 0);
                assert_eq!(written, ctx.output_rows());
            }
            other => panic!("expected RowCountMismatch, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_missing_depth_zero_fails_before_any_row() {
        let config = ScanConfig {
            z_depths_mm: vec![0.5],
            ..single_tile_config()
        };
        assert!(matches!(
            ScanGrid::from_config(&config, &[]),
            Err(ReconError::Config(_))
        ));
    }

    #[test]
    fn test_wrongly_sized_sink_rejected_before_processing() {
        let lambda = uniform_k_lambda(64);
        let source = SyntheticFrameSource::new(&lambda, 0.05, DEFAULT_REFRACTIVE_INDEX);
        let config = single_tile_config();
        let grid = ScanGrid::from_config(&config, &[]).unwrap();
        let ctx = StitchContext::new(config, grid, test_transform(&lambda)).unwrap();

        let sink = MemoryVolumeSink::new(ctx.output_rows() + 3);
        let result = stitch_volume(&ctx, &source, None, &sink);
        assert!(matches!(result, Err(ReconError::Config(_))));
    }

    #[test]
    fn test_single_column_tile_uses_nearest_sample() {
        let lambda = uniform_k_lambda(64);
        let source = SyntheticFrameSource::new(&lambda, 0.05, DEFAULT_REFRACTIVE_INDEX);
        let config = ScanConfig {
            tile_pixels_x: 1,
            ..single_tile_config()
        };
        // A one-column tile is a valid geometry and must stitch, not panic
        config.validate().unwrap();
        let grid = ScanGrid::from_config(&config, &[]).unwrap();
        let ctx = StitchContext::new(config, grid, test_transform(&lambda)).unwrap();

        let sink = run(&ctx, &source, None);
        assert_eq!(sink.completed_rows(), ctx.output_rows());
        let row = sink.row(0).unwrap();
        assert_eq!(row.cols, 1);
        let reflector_z = ctx.frames.dim_one_tile.z.nearest_index(0.05);
        assert!(row.get(reflector_z, 0).is_some());
    }

    #[test]
    fn test_two_lateral_tiles_cover_union_lattice() {
        let lambda = uniform_k_lambda(64);
        let source = SyntheticFrameSource::new(&lambda, 0.05, DEFAULT_REFRACTIVE_INDEX);
        let config = ScanConfig {
            x_centers_mm: vec![0.0, 0.5],
            ..single_tile_config()
        };
        let grid = ScanGrid::from_config(&config, &[]).unwrap();
        let ctx = StitchContext::new(config, grid, test_transform(&lambda)).unwrap();

        let sink = run(&ctx, &source, None);
        // Output x spans -0.35 .. 0.85 at the native 0.1 mm spacing
        assert_eq!(ctx.frames.dim_output.x.len(), 13);
        // Every row written, and the bright reflector visible across the
        // full lateral span
        assert_eq!(sink.completed_rows(), ctx.output_rows());
        let row = sink.row(0).unwrap();
        let reflector_z = ctx.frames.dim_one_tile.z.nearest_index(0.05);
        for i_x in 0..row.cols {
            assert!(row.get(reflector_z, i_x).is_some());
        }
    }
}
