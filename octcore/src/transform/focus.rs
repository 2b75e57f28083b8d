/// Cutoff constant shared between the focus weight floor and the
/// accumulator's low-confidence mask. Calibrated, do not tune casually.
pub const CUTOFF_SIGMA: f64 = 3.0;

/// Smallest total weight a stitched pixel may carry before it is masked as
/// undefined: `exp(-CUTOFF_SIGMA^2 / 2) ~= 0.011`.
pub fn min_total_weight() -> f64 {
    (-CUTOFF_SIGMA * CUTOFF_SIGMA / 2.0).exp()
}

/// Weight of a depth pixel given its distance from the focus pixel.
///
/// The falloff is a Gaussian `exp(-(z - f)^2 / (2 sigma^2))`, deliberately
/// asymmetric: pixels deeper than focus keep a small floor weight
/// (`exp(-4.5)`) so below-focus signal is never fully discarded, while
/// above-focus signal decays to zero.
///
/// A tile without a defined focus pixel is not focus-gated at all: the
/// weight is uniformly 1.
pub fn focus_weight(z_pixel: f64, focus_pixel: Option<f64>, sigma: f64) -> f64 {
    let focus = match focus_pixel {
        Some(f) => f,
        None => return 1.0,
    };
    let d = z_pixel - focus;
    let gaussian = (-d * d / (2.0 * sigma * sigma)).exp();
    if z_pixel > focus {
        gaussian + min_total_weight()
    } else {
        gaussian
    }
}

/// Focus weights for every depth pixel of a profile of length `n_z`.
pub fn focus_weights(n_z: usize, focus_pixel: Option<f64>, sigma: f64) -> Vec<f64> {
    (0..n_z)
        .map(|i| focus_weight(i as f64, focus_pixel, sigma))
        .collect()
}
