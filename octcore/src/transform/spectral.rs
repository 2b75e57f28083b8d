use std::f64::consts::PI;
use std::sync::Arc;

use itertools::izip;
use rustfft::{num_complex::Complex64, Fft, FftPlanner};
use serde::{Deserialize, Serialize};

use crate::data::dimension::{AxisUnits, DimensionAxis};
use crate::data::frame::{ComplexDepthProfile, RawFrame};
use crate::error::ReconError;

/// Default tissue refractive index used for the depth scale.
pub const DEFAULT_REFRACTIVE_INDEX: f64 = 1.33;

/// A wavelength axis already equi-spaced in wavenumber to this relative
/// tolerance is used as-is; otherwise it is resampled first.
const K_UNIFORMITY_TOLERANCE: f64 = 1e-10;

/// Half-width (in samples) of the windowed-sinc resampling kernel.
const SINC_HALF_WIDTH: usize = 4;

/// Interpolation kernel used when resampling onto an equi-spaced
/// wavenumber grid.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub enum ResampleKernel {
    Linear,
    Sinc,
}

/// Validated configuration of the spectral transform. Every recognized
/// option and its default is enumerated here; validation happens once at
/// construction.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SpectralTransformConfig {
    /// Quadratic dispersion-correction coefficient in nm^2/rad. Required:
    /// there is no physically sensible silent default.
    pub dispersion_nm2_per_rad: Option<f64>,
    /// Optional spectral sub-band `[min, max]` in nm. Clamped to the data
    /// range with a warning when it extends beyond it.
    pub band_nm: Option<(f64, f64)>,
    /// Tissue refractive index entering the depth scale.
    pub refractive_index: f64,
    /// Interpolation kernel for the wavenumber resampling step.
    pub kernel: ResampleKernel,
    /// Zero-padding exponent: the spectral axis is padded to
    /// `n_lambda * 2^zero_pad` samples before the inverse transform.
    pub zero_pad: u32,
}

impl Default for SpectralTransformConfig {
    fn default() -> Self {
        SpectralTransformConfig {
            dispersion_nm2_per_rad: None,
            band_nm: None,
            refractive_index: DEFAULT_REFRACTIVE_INDEX,
            kernel: ResampleKernel::Linear,
            zero_pad: 0,
        }
    }
}

/// Precomputed interpolation onto an equi-spaced wavenumber grid.
/// Each target sample is a weighted sum over a few source samples.
struct ResamplePlan {
    taps: Vec<Vec<(usize, f64)>>,
}

impl ResamplePlan {
    fn build(k_src: &[f64], k_dst: &[f64], kernel: ResampleKernel) -> ResamplePlan {
        let n = k_src.len();
        let descending = k_src[n - 1] < k_src[0];
        let before = |a: f64, b: f64| if descending { a > b } else { a < b };

        let mut taps = Vec::with_capacity(k_dst.len());
        let mut j = 0usize;
        for &kt in k_dst {
            while j + 2 < n && before(k_src[j + 1], kt) {
                j += 1;
            }
            let denom = k_src[j + 1] - k_src[j];
            let t = if denom != 0.0 {
                ((kt - k_src[j]) / denom).clamp(0.0, 1.0)
            } else {
                0.0
            };
            match kernel {
                ResampleKernel::Linear => {
                    taps.push(vec![(j, 1.0 - t), (j + 1, t)]);
                }
                ResampleKernel::Sinc => {
                    // Windowed sinc evaluated at fractional index positions;
                    // the source grid is near-uniform so index-space
                    // evaluation is accurate.
                    let p = j as f64 + t;
                    let lo = (p.floor() as isize - (SINC_HALF_WIDTH as isize - 1)).max(0) as usize;
                    let hi = ((p.floor() as isize + SINC_HALF_WIDTH as isize) as usize).min(n - 1);
                    let mut entry = Vec::with_capacity(hi - lo + 1);
                    let mut sum = 0.0;
                    for m in lo..=hi {
                        let d = p - m as f64;
                        let w = sinc(d) * hann_taper(d / SINC_HALF_WIDTH as f64);
                        sum += w;
                        entry.push((m, w));
                    }
                    if sum != 0.0 {
                        for (_, w) in entry.iter_mut() {
                            *w /= sum;
                        }
                    }
                    taps.push(entry);
                }
            }
        }
        ResamplePlan { taps }
    }

    fn apply(&self, src: &[f64]) -> Vec<f64> {
        self.taps
            .iter()
            .map(|entry| entry.iter().map(|&(i, w)| src[i] * w).sum())
            .collect()
    }
}

fn sinc(x: f64) -> f64 {
    if x.abs() < 1e-12 {
        1.0
    } else {
        (PI * x).sin() / (PI * x)
    }
}

/// Hann taper on [-1, 1], zero outside.
fn hann_taper(u: f64) -> f64 {
    if u.abs() >= 1.0 {
        0.0
    } else {
        0.5 * (1.0 + (PI * u).cos())
    }
}

/// Converts spectral interferograms into complex depth profiles.
///
/// All per-axis state (resampling plan, spectral window, dispersion phase,
/// FFT plan, depth axis) is derived once at construction and reused for
/// every A-scan, so the transform can be shared read-only across row
/// workers.
pub struct SpectralTransform {
    n_lambda: usize,
    padded_len: usize,
    n_z: usize,
    resample: Option<ResamplePlan>,
    window: Vec<f64>,
    phase: Vec<Complex64>,
    ifft: Arc<dyn Fft<f64>>,
    depth_axis: DimensionAxis,
}

impl SpectralTransform {
    /// Builds the transform for one wavelength axis.
    ///
    /// # Arguments
    ///
    /// * `lambda` - the spectral axis of the raw interferograms.
    /// * `config` - validated transform options; a missing dispersion
    ///   coefficient is a configuration error, never defaulted.
    pub fn new(lambda: &DimensionAxis, config: &SpectralTransformConfig) -> Result<Self, ReconError> {
        let dispersion = config.dispersion_nm2_per_rad.ok_or_else(|| {
            ReconError::Config(
                "dispersion coefficient (nm^2/rad) is required and has no default".to_string(),
            )
        })?;
        if config.refractive_index <= 0.0 {
            return Err(ReconError::Config(format!(
                "refractive index must be positive, got {}",
                config.refractive_index
            )));
        }

        let lambda_nm = lambda.to_units(AxisUnits::Nanometers).values;
        let n_lambda = lambda_nm.len();
        if n_lambda < 4 {
            return Err(ReconError::InvalidDimension(format!(
                "spectral axis needs at least 4 samples, got {}",
                n_lambda
            )));
        }
        if lambda_nm.iter().any(|l| *l <= 0.0 || !l.is_finite()) {
            return Err(ReconError::InvalidDimension(
                "spectral axis must hold finite positive wavelengths".to_string(),
            ));
        }

        // Wavenumber axis, rad/nm
        let k_raw: Vec<f64> = lambda_nm.iter().map(|l| 2.0 * PI / l).collect();

        // Resample unless already equi-spaced in k
        let (k, resample) = if k_is_uniform(&k_raw) {
            (k_raw, None)
        } else {
            let first = k_raw[0];
            let last = k_raw[n_lambda - 1];
            let step = (last - first) / (n_lambda - 1) as f64;
            let k_dst: Vec<f64> = (0..n_lambda).map(|i| first + i as f64 * step).collect();
            let plan = ResamplePlan::build(&k_raw, &k_dst, config.kernel);
            (k_dst, Some(plan))
        };

        // Effective wavelength per resampled sample, for the band window
        let lambda_eff: Vec<f64> = k.iter().map(|ki| 2.0 * PI / ki).collect();
        let data_min = lambda_eff.iter().cloned().fold(f64::INFINITY, f64::min);
        let data_max = lambda_eff.iter().cloned().fold(f64::NEG_INFINITY, f64::max);

        let (band_min, band_max) = match config.band_nm {
            None => (data_min, data_max),
            Some((lo, hi)) => {
                if lo >= hi {
                    return Err(ReconError::Config(format!(
                        "spectral band [{}, {}] nm is empty",
                        lo, hi
                    )));
                }
                let clamped = (lo.max(data_min), hi.min(data_max));
                if clamped != (lo, hi) {
                    eprintln!(
                        "Warning: spectral band [{:.1}, {:.1}] nm clamped to data range [{:.1}, {:.1}] nm",
                        lo, hi, data_min, data_max
                    );
                }
                clamped
            }
        };

        let window = band_window(&lambda_eff, band_min, band_max)?;

        // Mean-centered dispersion phase; centering on mean(k) rather than
        // k[0] keeps a change of coefficient from translating the profile.
        let k_mean = k.iter().sum::<f64>() / n_lambda as f64;
        let phase: Vec<Complex64> = k
            .iter()
            .map(|ki| {
                let dk = ki - k_mean;
                Complex64::from_polar(1.0, -dispersion * dk * dk)
            })
            .collect();

        let padded_len = n_lambda << config.zero_pad;
        let n_z = padded_len / 2;
        let mut planner = FftPlanner::new();
        let ifft = planner.plan_fft_inverse(padded_len);

        // Depth scale: z[i] = i * (lambda0^2 / (2 * d_lambda)) / n over the
        // unpadded half length; zero-padding subdivides the same range.
        let lambda0 = (band_min + band_max) / 2.0;
        let d_lambda = band_max - band_min;
        let step_nm = lambda0 * lambda0 / (2.0 * d_lambda) / config.refractive_index
            * (n_lambda as f64 / padded_len as f64);
        let depth_values: Vec<f64> = (0..n_z).map(|i| i as f64 * step_nm * 1e-6).collect();
        let depth_axis = DimensionAxis::new(
            depth_values,
            AxisUnits::Millimeters,
            "zero optical path delay",
        );

        Ok(SpectralTransform {
            n_lambda,
            padded_len,
            n_z,
            resample,
            window,
            phase,
            ifft,
            depth_axis,
        })
    }

    /// Number of depth pixels per A-scan.
    pub fn n_z(&self) -> usize {
        self.n_z
    }

    /// Expected spectral samples per A-scan.
    pub fn n_lambda(&self) -> usize {
        self.n_lambda
    }

    /// Physical depth per pixel, in millimeters. Usable without transforming
    /// any data, which lets the frame builder probe a reference tile cheaply.
    pub fn depth_axis(&self) -> &DimensionAxis {
        &self.depth_axis
    }

    /// Transforms one spectral sample array into a complex depth profile of
    /// `n_z()` samples (the positive-depth half of the inverse transform).
    pub fn transform_ascan(&self, spectrum: &[f64]) -> Result<Vec<Complex64>, ReconError> {
        if spectrum.len() != self.n_lambda {
            return Err(ReconError::Processing(format!(
                "A-scan has {} spectral samples, transform expects {}",
                spectrum.len(),
                self.n_lambda
            )));
        }

        let resampled;
        let samples: &[f64] = match &self.resample {
            Some(plan) => {
                resampled = plan.apply(spectrum);
                &resampled
            }
            None => spectrum,
        };

        let mut buffer: Vec<Complex64> = izip!(samples, &self.window, &self.phase)
            .map(|(s, w, p)| p * (s * w))
            .collect();
        buffer.resize(self.padded_len, Complex64::new(0.0, 0.0));

        self.ifft.process(&mut buffer);
        let scale = 1.0 / self.padded_len as f64;
        buffer.truncate(self.n_z);
        for v in buffer.iter_mut() {
            *v *= scale;
        }
        Ok(buffer)
    }

    /// Transforms a whole raw frame, reducing the averaging axis by mean
    /// before the transform (the transform is linear, so averaging spectra
    /// equals averaging profiles).
    pub fn transform_frame(&self, frame: &RawFrame) -> Result<ComplexDepthProfile, ReconError> {
        let mut values = Vec::with_capacity(self.n_z * frame.n_x);
        for i_x in 0..frame.n_x {
            let spectrum = frame.mean_spectrum(i_x);
            values.extend(self.transform_ascan(&spectrum)?);
        }
        Ok(ComplexDepthProfile::new(values, self.n_z, frame.n_x))
    }
}

/// Relative uniformity test of consecutive wavenumber steps.
fn k_is_uniform(k: &[f64]) -> bool {
    let steps: Vec<f64> = k.windows(2).map(|w| (w[1] - w[0]).abs()).collect();
    let max_step = steps.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let min_step = steps.iter().cloned().fold(f64::INFINITY, f64::min);
    let k_max = k.iter().cloned().fold(f64::NEG_INFINITY, |a, b| a.max(b.abs()));
    (max_step - min_step) / k_max < K_UNIFORMITY_TOLERANCE
}

/// Hann window over the in-band samples, zero outside, normalized so its RMS
/// over the full spectral length is 1 (keeps the intensity scale independent
/// of band width).
fn band_window(lambda_eff: &[f64], band_min: f64, band_max: f64) -> Result<Vec<f64>, ReconError> {
    let n = lambda_eff.len();
    let in_band: Vec<usize> = (0..n)
        .filter(|&i| lambda_eff[i] >= band_min && lambda_eff[i] <= band_max)
        .collect();
    let (i0, i1) = match (in_band.first(), in_band.last()) {
        (Some(&a), Some(&b)) => (a, b),
        _ => {
            return Err(ReconError::Config(format!(
                "no spectral samples inside band [{}, {}] nm",
                band_min, band_max
            )))
        }
    };

    let mut window = vec![0.0; n];
    let span = i1 - i0;
    for i in i0..=i1 {
        window[i] = if span == 0 {
            1.0
        } else {
            let t = (i - i0) as f64 / span as f64;
            0.5 * (1.0 - (2.0 * PI * t).cos())
        };
    }

    let rms = (window.iter().map(|w| w * w).sum::<f64>() / n as f64).sqrt();
    if rms == 0.0 {
        return Err(ReconError::Config(
            "spectral window is identically zero".to_string(),
        ));
    }
    for w in window.iter_mut() {
        *w /= rms;
    }
    Ok(window)
}
