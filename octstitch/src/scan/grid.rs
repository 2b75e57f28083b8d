use itertools::iproduct;
use serde::{Deserialize, Serialize};

use octcore::error::ReconError;

use crate::scan::config::ScanConfig;

/// The reference scan must sit within 1 micron of depth zero; it anchors
/// every tile to the tissue interface.
pub const Z_ZERO_TOLERANCE_MM: f64 = 1e-3;

/// One physical acquisition: a lateral position scanned at one focus depth.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Tile {
    pub x_center_mm: f64,
    pub y_center_mm: f64,
    pub z_depth_mm: f64,
    /// Reference to the tile's raw data folder, resolved by the loader.
    pub raw_ref: String,
}

/// All tiles of one acquisition: the cross product of X centers, Y centers
/// and Z depths, minus geometry-disabled cells. Built once, read-only
/// afterwards.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanGrid {
    pub tiles: Vec<Tile>,
}

impl ScanGrid {
    /// Builds the grid from the validated configuration.
    ///
    /// `disabled` lists `(x, y, z)` index triplets excluded by the scan
    /// geometry (for example corner tiles of a circular sample).
    pub fn from_config(config: &ScanConfig, disabled: &[(usize, usize, usize)]) -> Result<ScanGrid, ReconError> {
        let has_reference = config
            .z_depths_mm
            .iter()
            .any(|z| z.abs() <= Z_ZERO_TOLERANCE_MM);
        if !has_reference {
            return Err(ReconError::Config(format!(
                "depth sweep {:?} mm contains no reference scan at depth 0 \
                (tolerance {} mm); the tissue-interface anchor is required",
                config.z_depths_mm, Z_ZERO_TOLERANCE_MM
            )));
        }

        let tiles = iproduct!(
            config.z_depths_mm.iter().enumerate(),
            config.y_centers_mm.iter().enumerate(),
            config.x_centers_mm.iter().enumerate()
        )
        .filter(|((zi, _), (yi, _), (xi, _))| !disabled.contains(&(*xi, *yi, *zi)))
        .map(|((zi, &z), (yi, &y), (xi, &x))| Tile {
            x_center_mm: x,
            y_center_mm: y,
            z_depth_mm: z,
            raw_ref: format!("Data_X{:02}_Y{:02}_Z{:02}", xi, yi, zi),
        })
        .collect();
        Ok(ScanGrid { tiles })
    }

    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }
}
