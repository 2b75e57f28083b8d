use serde::{Deserialize, Serialize};

use octcore::error::ReconError;

/// Relative tolerance when comparing the native x and y pixel sizes for
/// isotropic output resampling.
const PIXEL_SIZE_MATCH_TOLERANCE: f64 = 1e-9;

/// The acquisition configuration record: tile centers, depth sweep, tile
/// geometry and focus parameters. Read once at startup, validated before
/// any processing starts, immutable afterwards.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanConfig {
    /// Lateral tile center positions, mm.
    pub x_centers_mm: Vec<f64>,
    pub y_centers_mm: Vec<f64>,
    /// Focus depth sweep, mm. Must include the reference scan at depth 0.
    pub z_depths_mm: Vec<f64>,
    /// A-scans per B-scan within one tile.
    pub tile_pixels_x: usize,
    /// B-scans per tile.
    pub tile_pixels_y: usize,
    /// Physical extent of one tile along x, mm.
    pub tile_extent_x_mm: f64,
    pub tile_extent_y_mm: f64,
    /// Depth pixel the optics hold sharpest; `None` disables focus gating.
    pub focus_pixel: Option<f64>,
    /// Gaussian falloff width of the focus weight, in depth pixels.
    pub focus_sigma_px: f64,
    /// Optional isotropic output pixel size, mm. Requires equal native x
    /// and y pixel sizes.
    pub output_pixel_size_mm: Option<f64>,
    /// Truncate the output z axis to the depth range actually swept.
    pub crop_z_around_focus: bool,
    /// Repeated A-scan acquisitions averaged per lateral position.
    pub a_scan_averages: usize,
    /// Repeated B-scan acquisitions averaged per y position.
    pub b_scan_averages: usize,
    /// Worker threads for row-parallel stitching; 0 uses all cores.
    pub workers: usize,
}

impl ScanConfig {
    /// Native lateral pixel size along x, mm.
    pub fn pixel_size_x_mm(&self) -> f64 {
        if self.tile_pixels_x < 2 {
            return 0.0;
        }
        self.tile_extent_x_mm / (self.tile_pixels_x - 1) as f64
    }

    /// Native lateral pixel size along y, mm.
    pub fn pixel_size_y_mm(&self) -> f64 {
        if self.tile_pixels_y < 2 {
            return 0.0;
        }
        self.tile_extent_y_mm / (self.tile_pixels_y - 1) as f64
    }

    /// Checks the whole record once; every violation is a configuration
    /// error raised before any row processing starts.
    pub fn validate(&self) -> Result<(), ReconError> {
        if self.x_centers_mm.is_empty() || self.y_centers_mm.is_empty() {
            return Err(ReconError::Config(
                "scan grid needs at least one x and one y tile center".to_string(),
            ));
        }
        if self.z_depths_mm.is_empty() {
            return Err(ReconError::Config(
                "scan grid needs at least one focus depth".to_string(),
            ));
        }
        if self.tile_pixels_x == 0 || self.tile_pixels_y == 0 {
            return Err(ReconError::Config(format!(
                "tile pixel counts must be positive, got {} x {}",
                self.tile_pixels_x, self.tile_pixels_y
            )));
        }
        if self.tile_extent_x_mm <= 0.0 || self.tile_extent_y_mm <= 0.0 {
            return Err(ReconError::Config(format!(
                "tile extents must be positive, got {} mm x {} mm",
                self.tile_extent_x_mm, self.tile_extent_y_mm
            )));
        }
        if self.focus_sigma_px <= 0.0 {
            return Err(ReconError::Config(format!(
                "focus sigma must be positive, got {} px",
                self.focus_sigma_px
            )));
        }
        if self.a_scan_averages == 0 || self.b_scan_averages == 0 {
            return Err(ReconError::Config(
                "averaging counts must be at least 1".to_string(),
            ));
        }
        if let Some(px) = self.output_pixel_size_mm {
            if px <= 0.0 {
                return Err(ReconError::Config(format!(
                    "output pixel size must be positive, got {} mm",
                    px
                )));
            }
            let px_x = self.pixel_size_x_mm();
            let px_y = self.pixel_size_y_mm();
            let scale = px_x.abs().max(px_y.abs()).max(f64::MIN_POSITIVE);
            if (px_x - px_y).abs() / scale > PIXEL_SIZE_MATCH_TOLERANCE {
                // Anisotropic input cannot be silently rescaled to an
                // isotropic output.
                return Err(ReconError::Config(format!(
                    "isotropic output requested but native pixel sizes differ: \
                    x {} mm vs y {} mm",
                    px_x, px_y
                )));
            }
        }
        Ok(())
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        ScanConfig {
            x_centers_mm: vec![0.0],
            y_centers_mm: vec![0.0],
            z_depths_mm: vec![0.0],
            tile_pixels_x: 100,
            tile_pixels_y: 100,
            tile_extent_x_mm: 1.0,
            tile_extent_y_mm: 1.0,
            focus_pixel: None,
            focus_sigma_px: 20.0,
            output_pixel_size_mm: None,
            crop_z_around_focus: false,
            a_scan_averages: 1,
            b_scan_averages: 1,
            workers: 0,
        }
    }
}
