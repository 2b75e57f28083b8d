use std::fmt;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::error::ReconError;

/// Physical units of a coordinate axis.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum AxisUnits {
    Nanometers,
    Microns,
    Millimeters,
}

impl AxisUnits {
    /// Multiplicative factor converting a value in these units to millimeters.
    pub fn to_mm_factor(&self) -> f64 {
        match self {
            AxisUnits::Nanometers => 1e-6,
            AxisUnits::Microns => 1e-3,
            AxisUnits::Millimeters => 1.0,
        }
    }

    /// Multiplicative factor converting a value in these units to `target` units.
    pub fn factor_to(&self, target: AxisUnits) -> f64 {
        self.to_mm_factor() / target.to_mm_factor()
    }
}

impl Display for AxisUnits {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            AxisUnits::Nanometers => write!(f, "nm"),
            AxisUnits::Microns => write!(f, "microns"),
            AxisUnits::Millimeters => write!(f, "mm"),
        }
    }
}

/// One coordinate axis: the physical coordinate of every pixel index,
/// its units and a free-text description of where its origin is anchored.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DimensionAxis {
    pub values: Vec<f64>,
    pub units: AxisUnits,
    pub origin: String,
}

impl DimensionAxis {
    pub fn new(values: Vec<f64>, units: AxisUnits, origin: &str) -> Self {
        DimensionAxis {
            values,
            units,
            origin: origin.to_string(),
        }
    }

    /// Builds an axis of `n` equally spaced samples centered on `center`
    /// spanning `extent` (first sample at `center - extent/2`, last at
    /// `center + extent/2`).
    pub fn centered_linspace(center: f64, extent: f64, n: usize, units: AxisUnits, origin: &str) -> Self {
        let values = match n {
            0 => Vec::new(),
            1 => vec![center],
            _ => {
                let step = extent / (n - 1) as f64;
                (0..n).map(|i| center - extent / 2.0 + i as f64 * step).collect()
            }
        };
        DimensionAxis::new(values, units, origin)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn min(&self) -> f64 {
        self.values.iter().cloned().fold(f64::INFINITY, f64::min)
    }

    pub fn max(&self) -> f64 {
        self.values.iter().cloned().fold(f64::NEG_INFINITY, f64::max)
    }

    /// Mean step between consecutive samples. Zero for axes shorter than 2.
    pub fn spacing(&self) -> f64 {
        if self.values.len() < 2 {
            return 0.0;
        }
        (self.values[self.values.len() - 1] - self.values[0]) / (self.values.len() - 1) as f64
    }

    /// Returns a copy of the axis expressed in `target` units.
    pub fn to_units(&self, target: AxisUnits) -> DimensionAxis {
        let factor = self.units.factor_to(target);
        DimensionAxis {
            values: self.values.iter().map(|v| v * factor).collect(),
            units: target,
            origin: self.origin.clone(),
        }
    }

    /// Returns a copy of the axis with `offset` added to every value.
    pub fn shifted(&self, offset: f64) -> DimensionAxis {
        DimensionAxis {
            values: self.values.iter().map(|v| v + offset).collect(),
            units: self.units,
            origin: self.origin.clone(),
        }
    }

    /// Index of the sample closest to `value`.
    pub fn nearest_index(&self, value: f64) -> usize {
        let mut best = 0;
        let mut best_dist = f64::INFINITY;
        for (i, v) in self.values.iter().enumerate() {
            let d = (v - value).abs();
            if d < best_dist {
                best_dist = d;
                best = i;
            }
        }
        best
    }

    /// Axis value at a fractional pixel index, linearly interpolated and
    /// clamped to the axis range.
    pub fn value_at(&self, pixel: f64) -> f64 {
        if self.values.is_empty() {
            return f64::NAN;
        }
        let last = self.values.len() - 1;
        if pixel <= 0.0 {
            return self.values[0];
        }
        if pixel >= last as f64 {
            return self.values[last];
        }
        let i = pixel.floor() as usize;
        let frac = pixel - i as f64;
        self.values[i] + frac * (self.values[i + 1] - self.values[i])
    }

    /// Fails unless every sample is a finite number.
    pub fn require_physical(&self, name: &str) -> Result<(), ReconError> {
        if self.values.is_empty() {
            return Err(ReconError::InvalidDimension(format!(
                "axis '{}' has no physical values", name
            )));
        }
        if self.values.iter().any(|v| !v.is_finite()) {
            return Err(ReconError::InvalidDimension(format!(
                "axis '{}' contains non-finite values", name
            )));
        }
        Ok(())
    }
}

/// Named collection of the axes describing one acquisition or volume,
/// plus the scan-geometry averaging counts.
///
/// Axis ordering is fixed: volumes are indexed `(z, x, y)` and raw frames
/// `(lambda, x)`, so any two sets describing the same modality agree.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DimensionSet {
    /// Spectral axis of the raw interferogram; absent for reconstructed volumes.
    pub lambda: Option<DimensionAxis>,
    pub x: DimensionAxis,
    pub y: DimensionAxis,
    pub z: DimensionAxis,
    /// Number of repeated A-scans averaged per lateral position.
    pub a_scan_averages: usize,
    /// Number of repeated B-scans averaged per y position.
    pub b_scan_averages: usize,
}

impl DimensionSet {
    pub fn new(x: DimensionAxis, y: DimensionAxis, z: DimensionAxis) -> Self {
        DimensionSet {
            lambda: None,
            x,
            y,
            z,
            a_scan_averages: 1,
            b_scan_averages: 1,
        }
    }

    /// Returns a copy with the spatial axes expressed in `target` units.
    /// The spectral axis keeps its own units.
    pub fn to_units(&self, target: AxisUnits) -> DimensionSet {
        DimensionSet {
            lambda: self.lambda.clone(),
            x: self.x.to_units(target),
            y: self.y.to_units(target),
            z: self.z.to_units(target),
            a_scan_averages: self.a_scan_averages,
            b_scan_averages: self.b_scan_averages,
        }
    }

    /// Fails unless all three spatial axes carry finite physical values.
    pub fn require_physical(&self) -> Result<(), ReconError> {
        self.x.require_physical("x")?;
        self.y.require_physical("y")?;
        self.z.require_physical("z")?;
        Ok(())
    }
}

impl Display for DimensionSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DimensionSet(x: {} px, y: {} px, z: {} px, lambda: {})",
            self.x.len(),
            self.y.len(),
            self.z.len(),
            self.lambda.as_ref().map_or(0, |l| l.len())
        )
    }
}
