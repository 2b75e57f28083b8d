use rustfft::num_complex::Complex64;

/// One raw interferogram frame: spectra for every lateral (x) position of a
/// single B-scan, with optional repeated acquisitions kept for averaging.
///
/// Layout is `(x, average, lambda)` with the spectral index fastest, so each
/// A-scan is a contiguous slice.
#[derive(Clone, Debug)]
pub struct RawFrame {
    pub data: Vec<f64>,
    pub n_lambda: usize,
    pub n_x: usize,
    pub n_avg: usize,
}

impl RawFrame {
    pub fn new(data: Vec<f64>, n_lambda: usize, n_x: usize, n_avg: usize) -> Self {
        assert_eq!(data.len(), n_lambda * n_x * n_avg);
        RawFrame {
            data,
            n_lambda,
            n_x,
            n_avg,
        }
    }

    /// Frame of the given shape filled with zeros.
    pub fn zeros(n_lambda: usize, n_x: usize, n_avg: usize) -> Self {
        RawFrame {
            data: vec![0.0; n_lambda * n_x * n_avg],
            n_lambda,
            n_x,
            n_avg,
        }
    }

    /// One spectral sample array.
    pub fn spectrum(&self, i_x: usize, i_avg: usize) -> &[f64] {
        let start = (i_x * self.n_avg + i_avg) * self.n_lambda;
        &self.data[start..start + self.n_lambda]
    }

    pub fn spectrum_mut(&mut self, i_x: usize, i_avg: usize) -> &mut [f64] {
        let start = (i_x * self.n_avg + i_avg) * self.n_lambda;
        &mut self.data[start..start + self.n_lambda]
    }

    /// Mean spectrum over the averaging axis for one lateral position.
    pub fn mean_spectrum(&self, i_x: usize) -> Vec<f64> {
        let mut acc = vec![0.0; self.n_lambda];
        for i_avg in 0..self.n_avg {
            for (a, v) in acc.iter_mut().zip(self.spectrum(i_x, i_avg)) {
                *a += v;
            }
        }
        let scale = 1.0 / self.n_avg as f64;
        for a in acc.iter_mut() {
            *a *= scale;
        }
        acc
    }
}

/// Complex depth profile of one B-scan: output of the spectral transform,
/// indexed `(z, x)` with z contiguous per column.
#[derive(Clone, Debug)]
pub struct ComplexDepthProfile {
    pub values: Vec<Complex64>,
    pub n_z: usize,
    pub n_x: usize,
}

impl ComplexDepthProfile {
    pub fn new(values: Vec<Complex64>, n_z: usize, n_x: usize) -> Self {
        assert_eq!(values.len(), n_z * n_x);
        ComplexDepthProfile { values, n_z, n_x }
    }

    pub fn at(&self, i_z: usize, i_x: usize) -> Complex64 {
        self.values[i_x * self.n_z + i_z]
    }

    pub fn column(&self, i_x: usize) -> &[Complex64] {
        &self.values[i_x * self.n_z..(i_x + 1) * self.n_z]
    }

    /// Per-pixel magnitudes in the same `(z, x)` layout.
    pub fn amplitude(&self) -> Vec<f64> {
        self.values.iter().map(|c| c.norm()).collect()
    }
}

/// A 2-D plane of values with an explicit validity bitmap.
///
/// Pixels can be "undefined" (no data, low confidence) without relying on
/// NaN sentinels propagating through arithmetic.
#[derive(Clone, Debug, PartialEq)]
pub struct MaskedPlane {
    pub values: Vec<f64>,
    pub defined: Vec<bool>,
    pub rows: usize,
    pub cols: usize,
}

impl MaskedPlane {
    /// Plane of the given shape with every pixel undefined.
    pub fn undefined(rows: usize, cols: usize) -> Self {
        MaskedPlane {
            values: vec![0.0; rows * cols],
            defined: vec![false; rows * cols],
            rows,
            cols,
        }
    }

    #[inline]
    pub fn idx(&self, row: usize, col: usize) -> usize {
        row * self.cols + col
    }

    /// Value at a pixel, or `None` when the pixel is undefined.
    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        let i = self.idx(row, col);
        if self.defined[i] {
            Some(self.values[i])
        } else {
            None
        }
    }

    pub fn set(&mut self, row: usize, col: usize, value: f64) {
        let i = self.idx(row, col);
        self.values[i] = value;
        self.defined[i] = true;
    }

    pub fn clear(&mut self, row: usize, col: usize) {
        let i = self.idx(row, col);
        self.values[i] = 0.0;
        self.defined[i] = false;
    }

    pub fn defined_count(&self) -> usize {
        self.defined.iter().filter(|d| **d).count()
    }
}

/// Dense reconstructed volume indexed `(z, x, y)`, z fastest.
#[derive(Clone, Debug)]
pub struct Volume {
    pub values: Vec<f64>,
    pub n_z: usize,
    pub n_x: usize,
    pub n_y: usize,
}

impl Volume {
    pub fn new(values: Vec<f64>, n_z: usize, n_x: usize, n_y: usize) -> Self {
        assert_eq!(values.len(), n_z * n_x * n_y);
        Volume {
            values,
            n_z,
            n_x,
            n_y,
        }
    }

    pub fn zeros(n_z: usize, n_x: usize, n_y: usize) -> Self {
        Volume {
            values: vec![0.0; n_z * n_x * n_y],
            n_z,
            n_x,
            n_y,
        }
    }

    #[inline]
    pub fn at(&self, i_z: usize, i_x: usize, i_y: usize) -> f64 {
        self.values[(i_y * self.n_x + i_x) * self.n_z + i_z]
    }

    #[inline]
    pub fn set(&mut self, i_z: usize, i_x: usize, i_y: usize, value: f64) {
        self.values[(i_y * self.n_x + i_x) * self.n_z + i_z] = value;
    }

    /// One depth column.
    pub fn column(&self, i_x: usize, i_y: usize) -> &[f64] {
        let start = (i_y * self.n_x + i_x) * self.n_z;
        &self.values[start..start + self.n_z]
    }
}
