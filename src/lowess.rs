//! Locally weighted scatterplot smoothing (Cleveland, 1979).
//!
//! A standalone numerical routine on `(x, y)` pairs: every input point gets a
//! fitted value from a weighted linear regression over its `k` nearest
//! neighbours, where `k = floor(frac * n)` (at least two). Neighbour weights
//! follow the tricube kernel; optional robustifying passes multiply them by
//! bisquare weights of the previous residuals. Only observed `x` values are
//! used as support points, nothing is interpolated.

use nalgebra::{Matrix2, Vector2};

use crate::error::{PulseError, Result};
use crate::options::SmoothingOptions;

/// Parameters of a single LOWESS fit.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LowessOptions {
    /// Fraction of the points used in each local regression.
    pub frac: f64,
    /// Robustifying passes after the initial fit.
    pub iterations: usize,
}

impl Default for LowessOptions {
    fn default() -> Self {
        Self {
            frac: 2.0 / 3.0,
            iterations: 3,
        }
    }
}

impl From<&SmoothingOptions> for LowessOptions {
    fn from(options: &SmoothingOptions) -> Self {
        Self {
            frac: options.span,
            iterations: options.robustness_iterations,
        }
    }
}

/// Fits LOWESS and returns one fitted value per input point, in input order.
pub fn lowess(x: &[f64], y: &[f64], options: &LowessOptions) -> Result<Vec<f64>> {
    if x.len() != y.len() {
        return Err(PulseError::NumericalError {
            context: "lowess input lengths",
        });
    }
    if !(options.frac > 0.0 && options.frac <= 1.0) {
        return Err(PulseError::NumericalError {
            context: "lowess span",
        });
    }
    if x.iter().chain(y).any(|v| !v.is_finite()) {
        return Err(PulseError::NumericalError {
            context: "lowess input values",
        });
    }
    let n = x.len();
    if n < 2 {
        return Ok(y.to_vec());
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|a, b| x[*a].total_cmp(&x[*b]));
    let xs: Vec<f64> = order.iter().map(|i| x[*i]).collect();
    let ys: Vec<f64> = order.iter().map(|i| y[*i]).collect();

    let k = neighbourhood_size(n, options.frac);
    let mut robustness = vec![1.0; n];
    let mut fitted = vec![0.0; n];

    for iteration in 0..=options.iterations {
        for i in 0..n {
            fitted[i] = local_fit(&xs, &ys, &robustness, i, k);
            if !fitted[i].is_finite() {
                return Err(PulseError::NumericalError {
                    context: "lowess local regression",
                });
            }
        }
        if iteration == options.iterations {
            break;
        }

        let residuals: Vec<f64> = ys.iter().zip(&fitted).map(|(y, f)| y - f).collect();
        let scale = 6.0 * median_abs(&residuals);
        let magnitude = ys.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
        if scale <= 1e-12 * (1.0 + magnitude) {
            break;
        }
        for (weight, residual) in robustness.iter_mut().zip(&residuals) {
            *weight = bisquare(residual / scale);
        }
    }

    let mut result = vec![0.0; n];
    for (sorted_index, original_index) in order.into_iter().enumerate() {
        result[original_index] = fitted[sorted_index];
    }
    Ok(result)
}

fn neighbourhood_size(n: usize, frac: f64) -> usize {
    ((frac * n as f64 + 1e-10).floor() as usize).clamp(2, n)
}

/// Inclusive index range of the `k` points nearest to `xs[i]` (`xs` sorted).
fn neighbourhood(xs: &[f64], i: usize, k: usize) -> (usize, usize) {
    let (mut lo, mut hi) = (i, i);
    while hi - lo + 1 < k {
        let can_left = lo > 0;
        let can_right = hi + 1 < xs.len();
        let go_left = match (can_left, can_right) {
            (true, true) => xs[i] - xs[lo - 1] <= xs[hi + 1] - xs[i],
            (left, _) => left,
        };
        if go_left {
            lo -= 1;
        } else {
            hi += 1;
        }
    }
    (lo, hi)
}

fn local_fit(xs: &[f64], ys: &[f64], robustness: &[f64], i: usize, k: usize) -> f64 {
    let (lo, hi) = neighbourhood(xs, i, k);
    let x0 = xs[i];
    let radius = (x0 - xs[lo]).max(xs[hi] - x0);

    let mut xtwx = Matrix2::<f64>::zeros();
    let mut xtwy = Vector2::<f64>::zeros();
    let mut weight_sum = 0.0;
    let mut weighted_y = 0.0;
    for j in lo..=hi {
        let kernel = if radius > 0.0 {
            tricube((xs[j] - x0).abs() / radius)
        } else {
            1.0
        };
        let w = kernel * robustness[j];
        if w <= 0.0 {
            continue;
        }
        let row = Vector2::new(1.0, xs[j] - x0);
        xtwx += w * row * row.transpose();
        xtwy += w * ys[j] * row;
        weight_sum += w;
        weighted_y += w * ys[j];
    }

    if weight_sum <= 0.0 {
        return ys[i];
    }
    let mean = weighted_y / weight_sum;

    // Weighted spread of x around its weighted mean; zero means every
    // supporting point shares one x and only a local constant is identified.
    let x_mean = xtwx[(0, 1)] / weight_sum;
    let spread = xtwx[(1, 1)] / weight_sum - x_mean * x_mean;
    if spread <= 1e-12 * radius.max(1.0).powi(2) {
        return mean;
    }

    match xtwx.cholesky() {
        Some(cholesky) => cholesky.solve(&xtwy)[0],
        None => mean,
    }
}

fn tricube(u: f64) -> f64 {
    if u >= 1.0 {
        0.0
    } else {
        (1.0 - u.powi(3)).powi(3)
    }
}

fn bisquare(u: f64) -> f64 {
    if u.abs() >= 1.0 {
        0.0
    } else {
        (1.0 - u * u).powi(2)
    }
}

fn median_abs(values: &[f64]) -> f64 {
    let mut magnitudes: Vec<f64> = values.iter().map(|v| v.abs()).collect();
    magnitudes.sort_by(f64::total_cmp);
    let n = magnitudes.len();
    if n == 0 {
        0.0
    } else if n % 2 == 1 {
        magnitudes[n / 2]
    } else {
        0.5 * (magnitudes[n / 2 - 1] + magnitudes[n / 2])
    }
}
