use std::f64::consts::PI;

use octcore::data::dimension::{AxisUnits, DimensionAxis};
use octcore::data::frame::{ComplexDepthProfile, RawFrame};

use crate::scan::grid::Tile;

/// One raw frame as delivered by a loader. Corrupt or missing data comes
/// back as an all-zero frame of the expected shape with `valid == false`
/// rather than an error, so the caller decides whether to proceed; an
/// isolated bad frame must not abort a large acquisition.
#[derive(Clone, Debug)]
pub struct LoadedFrame {
    pub frame: RawFrame,
    pub valid: bool,
}

impl LoadedFrame {
    /// The substitute for unreadable data: expected shape, zero weight.
    pub fn invalid(n_lambda: usize, n_x: usize, n_avg: usize) -> Self {
        LoadedFrame {
            frame: RawFrame::zeros(n_lambda, n_x, n_avg),
            valid: false,
        }
    }
}

/// Source of raw interferogram frames, resolved per tile and B-scan.
/// Implementations wrap the vendor file decoding, which stays outside
/// this crate.
pub trait RawFrameLoader: Send + Sync {
    /// Loads the B-scan at `y_index` of `tile` with the given shape.
    fn load(&self, tile: &Tile, n_lambda: usize, n_x: usize, n_avg: usize, y_index: usize) -> LoadedFrame;
}

/// Optional optical-path correction applied to transformed profiles.
/// Returns the corrected profile plus a per-pixel validity mask; samples
/// extrapolated out of range are marked invalid and stitched with zero
/// weight.
pub trait OpticalPathCorrector: Send + Sync {
    fn correct(&self, profile: &ComplexDepthProfile, z_axis_mm: &[f64]) -> (ComplexDepthProfile, Vec<bool>);
}

/// Deterministic synthetic frame source: every A-scan carries the fringe
/// of a single reflector at a fixed tile-local depth. Used by tests and
/// dry runs; the fringe amplitude is constant so transformed tiles are
/// directly comparable.
pub struct SyntheticFrameSource {
    lambda_nm: Vec<f64>,
    /// Reflector depth below the tile surface, mm.
    pub reflector_depth_mm: f64,
    pub refractive_index: f64,
}

impl SyntheticFrameSource {
    pub fn new(lambda: &DimensionAxis, reflector_depth_mm: f64, refractive_index: f64) -> Self {
        SyntheticFrameSource {
            lambda_nm: lambda.to_units(AxisUnits::Nanometers).values,
            reflector_depth_mm,
            refractive_index,
        }
    }

    fn spectrum(&self) -> Vec<f64> {
        let opd_nm = 2.0 * self.refractive_index * self.reflector_depth_mm * 1e6;
        self.lambda_nm
            .iter()
            .map(|l| 1.0 + (2.0 * PI / l * opd_nm).cos())
            .collect()
    }
}

impl RawFrameLoader for SyntheticFrameSource {
    fn load(&self, _tile: &Tile, n_lambda: usize, n_x: usize, n_avg: usize, _y_index: usize) -> LoadedFrame {
        let spectrum = self.spectrum();
        assert_eq!(spectrum.len(), n_lambda);
        let mut frame = RawFrame::zeros(n_lambda, n_x, n_avg);
        for i_x in 0..n_x {
            for i_avg in 0..n_avg {
                frame.spectrum_mut(i_x, i_avg).copy_from_slice(&spectrum);
            }
        }
        LoadedFrame { frame, valid: true }
    }
}
