use octcore::data::dimension::{AxisUnits, DimensionAxis, DimensionSet};
use octcore::error::ReconError;

use crate::scan::config::ScanConfig;

/// Largest distance, in mm, the single-sample fallback of the z crop may
/// sit from the requested range before the build fails.
const CROP_FALLBACK_TOLERANCE_MM: f64 = 1e-3;

/// The two coordinate lattices of one run: the local frame of a single
/// tile and the output lattice spanning the whole acquisition.
#[derive(Clone, Debug)]
pub struct TileFrames {
    /// Local `(x, y, z)` axes of one tile; x/y centered on 0, z shifted so
    /// the designated focus pixel sits at depth 0 (when supplied).
    pub dim_one_tile: DimensionSet,
    /// The union lattice spanning all tile centers and focus depths.
    pub dim_output: DimensionSet,
}

/// Computes the physical coordinate lattices from the acquisition
/// configuration and one probed depth axis.
pub struct TileFrameBuilder<'a> {
    config: &'a ScanConfig,
}

impl<'a> TileFrameBuilder<'a> {
    pub fn new(config: &'a ScanConfig) -> Self {
        TileFrameBuilder { config }
    }

    /// Builds both lattices. `probe_depth_axis` is the per-pixel depth
    /// axis obtained from a lightweight transform of a reference tile.
    pub fn build(&self, probe_depth_axis: &DimensionAxis) -> Result<TileFrames, ReconError> {
        self.config.validate()?;
        probe_depth_axis.require_physical("z probe")?;

        let config = self.config;
        let local_x = DimensionAxis::centered_linspace(
            0.0,
            config.tile_extent_x_mm,
            config.tile_pixels_x,
            AxisUnits::Millimeters,
            "tile center",
        );
        let local_y = DimensionAxis::centered_linspace(
            0.0,
            config.tile_extent_y_mm,
            config.tile_pixels_y,
            AxisUnits::Millimeters,
            "tile center",
        );

        let probe_mm = probe_depth_axis.to_units(AxisUnits::Millimeters);
        let local_z = match config.focus_pixel {
            Some(f) => {
                let mut axis = probe_mm.shifted(-probe_mm.value_at(f));
                axis.origin = "focus plane".to_string();
                axis
            }
            None => {
                let mut axis = probe_mm;
                axis.origin = "tissue interface".to_string();
                axis
            }
        };

        let span = |centers: &[f64], local: &DimensionAxis| {
            let c_min = centers.iter().cloned().fold(f64::INFINITY, f64::min);
            let c_max = centers.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            (c_min + local.min(), c_max + local.max())
        };

        let (x_lo, x_hi) = span(&config.x_centers_mm, &local_x);
        let (y_lo, y_hi) = span(&config.y_centers_mm, &local_y);
        let (z_lo, z_hi) = span(&config.z_depths_mm, &local_z);

        let step_x = config.output_pixel_size_mm.unwrap_or_else(|| local_x.spacing());
        let step_y = config.output_pixel_size_mm.unwrap_or_else(|| local_y.spacing());
        let step_z = config.output_pixel_size_mm.unwrap_or_else(|| local_z.spacing());

        let out_x = DimensionAxis::new(arange(x_lo, x_hi, step_x), AxisUnits::Millimeters, "scan center");
        let out_y = DimensionAxis::new(arange(y_lo, y_hi, step_y), AxisUnits::Millimeters, "scan center");
        let mut out_z = DimensionAxis::new(
            arange(z_lo, z_hi, step_z),
            AxisUnits::Millimeters,
            "tissue interface",
        );

        if config.crop_z_around_focus {
            out_z = crop_depth_axis(out_z, &config.z_depths_mm)?;
        }

        let mut dim_one_tile = DimensionSet::new(local_x, local_y, local_z);
        dim_one_tile.a_scan_averages = config.a_scan_averages;
        dim_one_tile.b_scan_averages = config.b_scan_averages;

        let mut dim_output = DimensionSet::new(out_x, out_y, out_z);
        dim_output.a_scan_averages = config.a_scan_averages;
        dim_output.b_scan_averages = config.b_scan_averages;

        Ok(TileFrames {
            dim_one_tile,
            dim_output,
        })
    }
}

/// Inclusive arange with a relative end tolerance.
fn arange(lo: f64, hi: f64, step: f64) -> Vec<f64> {
    if step <= 0.0 || hi < lo {
        return vec![lo];
    }
    let n = ((hi - lo) / step + 1e-9).floor() as usize + 1;
    (0..n).map(|i| lo + i as f64 * step).collect()
}

/// Truncates the output z axis to the focus band `[min(depths), max(depths)]`
/// (local focus depth is 0 after the focus shift). An empty truncation
/// falls back to the single nearest sample, which must sit within
/// [`CROP_FALLBACK_TOLERANCE_MM`] of the requested range.
fn crop_depth_axis(axis: DimensionAxis, depths_mm: &[f64]) -> Result<DimensionAxis, ReconError> {
    let lo = depths_mm.iter().cloned().fold(f64::INFINITY, f64::min);
    let hi = depths_mm.iter().cloned().fold(f64::NEG_INFINITY, f64::max);

    let kept: Vec<f64> = axis
        .values
        .iter()
        .cloned()
        .filter(|z| *z >= lo - 1e-9 && *z <= hi + 1e-9)
        .collect();
    if !kept.is_empty() {
        return Ok(DimensionAxis::new(kept, axis.units, &axis.origin));
    }

    let mid = (lo + hi) / 2.0;
    let nearest = axis.nearest_index(mid);
    let value = axis.values[nearest];
    let distance = if value < lo {
        lo - value
    } else {
        value - hi
    };
    if distance > CROP_FALLBACK_TOLERANCE_MM {
        return Err(ReconError::Config(format!(
            "cropped z range [{}, {}] mm contains no depth sample and the \
            nearest sample at {} mm is {} mm away (tolerance {} mm)",
            lo, hi, value, distance, CROP_FALLBACK_TOLERANCE_MM
        )));
    }
    Ok(DimensionAxis::new(vec![value], axis.units, &axis.origin))
}
