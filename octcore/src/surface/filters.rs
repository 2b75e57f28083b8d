use nalgebra::DMatrix;

/// 3x3 median filter with edge replication.
pub fn median3x3(img: &DMatrix<f64>) -> DMatrix<f64> {
    let (rows, cols) = img.shape();
    let mut out = DMatrix::zeros(rows, cols);
    let mut window = [0.0f64; 9];
    for r in 0..rows {
        for c in 0..cols {
            let mut n = 0;
            for dr in -1i64..=1 {
                for dc in -1i64..=1 {
                    let rr = (r as i64 + dr).clamp(0, rows as i64 - 1) as usize;
                    let cc = (c as i64 + dc).clamp(0, cols as i64 - 1) as usize;
                    window[n] = img[(rr, cc)];
                    n += 1;
                }
            }
            window.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            out[(r, c)] = window[4];
        }
    }
    out
}

/// Normalized 1-D Gaussian kernel with radius `ceil(3 * sigma)`.
pub fn gaussian_kernel(sigma: f64) -> Vec<f64> {
    let radius = (3.0 * sigma).ceil().max(1.0) as i64;
    let mut kernel: Vec<f64> = (-radius..=radius)
        .map(|i| (-(i * i) as f64 / (2.0 * sigma * sigma)).exp())
        .collect();
    let sum: f64 = kernel.iter().sum();
    for k in kernel.iter_mut() {
        *k /= sum;
    }
    kernel
}

/// Separable Gaussian blur with edge replication.
pub fn gaussian_blur(img: &DMatrix<f64>, sigma: f64) -> DMatrix<f64> {
    let kernel = gaussian_kernel(sigma);
    let radius = (kernel.len() / 2) as i64;
    let (rows, cols) = img.shape();

    // Along rows
    let mut pass1 = DMatrix::zeros(rows, cols);
    for r in 0..rows {
        for c in 0..cols {
            let mut acc = 0.0;
            for (ki, k) in kernel.iter().enumerate() {
                let rr = (r as i64 + ki as i64 - radius).clamp(0, rows as i64 - 1) as usize;
                acc += img[(rr, c)] * k;
            }
            pass1[(r, c)] = acc;
        }
    }

    // Along columns
    let mut out = DMatrix::zeros(rows, cols);
    for r in 0..rows {
        for c in 0..cols {
            let mut acc = 0.0;
            for (ki, k) in kernel.iter().enumerate() {
                let cc = (c as i64 + ki as i64 - radius).clamp(0, cols as i64 - 1) as usize;
                acc += pass1[(r, cc)] * k;
            }
            out[(r, c)] = acc;
        }
    }
    out
}

/// Number of histogram bins used by the Otsu threshold.
const OTSU_BINS: usize = 256;

/// Otsu threshold over the normalized intensity range of `values`:
/// the cutoff maximizing between-class variance of the two populations.
/// Returns the threshold in the original value units.
pub fn otsu_threshold(values: &[f64]) -> f64 {
    let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if !(max > min) {
        return min;
    }

    let mut histogram = [0usize; OTSU_BINS];
    let scale = (OTSU_BINS - 1) as f64 / (max - min);
    for v in values {
        let bin = ((v - min) * scale).round() as usize;
        histogram[bin.min(OTSU_BINS - 1)] += 1;
    }

    let total = values.len() as f64;
    let total_mean: f64 = histogram
        .iter()
        .enumerate()
        .map(|(i, &c)| i as f64 * c as f64)
        .sum::<f64>()
        / total;

    let mut best_bin = 0;
    let mut best_variance = -1.0;
    let mut weight_bg = 0.0;
    let mut sum_bg = 0.0;
    for (i, &count) in histogram.iter().enumerate() {
        weight_bg += count as f64 / total;
        sum_bg += i as f64 * count as f64 / total;
        let weight_fg = 1.0 - weight_bg;
        if weight_bg == 0.0 || weight_fg <= 0.0 {
            continue;
        }
        let mean_bg = sum_bg / weight_bg;
        let mean_fg = (total_mean - sum_bg) / weight_fg;
        let variance = weight_bg * weight_fg * (mean_bg - mean_fg) * (mean_bg - mean_fg);
        if variance > best_variance {
            best_variance = variance;
            best_bin = i;
        }
    }

    min + (best_bin as f64 + 0.5) / scale
}

/// Weight-normalized Gaussian smoothing against a validity mask.
///
/// Both `values * mask` and `mask` are convolved with the same normalized
/// 2-D Gaussian; the ratio is the smoothed value, so undefined regions do
/// not bias the average. Returns the smoothed values together with the
/// convolved mask weight (zero weight means no defined data in reach).
pub fn masked_gaussian_smooth(
    values: &DMatrix<f64>,
    mask: &DMatrix<f64>,
    sigma: f64,
) -> (DMatrix<f64>, DMatrix<f64>) {
    let weighted: DMatrix<f64> = values.component_mul(mask);
    let num = gaussian_blur(&weighted, sigma);
    let den = gaussian_blur(mask, sigma);

    let (rows, cols) = values.shape();
    let mut out = DMatrix::zeros(rows, cols);
    for r in 0..rows {
        for c in 0..cols {
            if den[(r, c)] > 0.0 {
                out[(r, c)] = num[(r, c)] / den[(r, c)];
            }
        }
    }
    (out, den)
}
