//! Per-basis activation priors
//!
//! The regularised encoder biases test-time activations toward the values
//! each basis took during training. The bias is a penalty term derived from
//! a distribution fitted, once per basis, to the corresponding row of the
//! training activation matrix:
//!
//! - gamma: maximum-likelihood shape `a_k` and scale `b_k`, penalty
//!   `lambda * ((1 - a_k) / H(k,t) + 1 / b_k)`
//! - exponential: rate `r_k = 1 / mean(H_train[k, :])`, penalty
//!   `lambda * r_k`
//!
//! Degenerate rows (all zero, constant, non-finite) are rejected instead of
//! producing NaN or infinite parameters.

use log::debug;
use ndarray::{Array2, ArrayView1};
use statrs::function::gamma::digamma;
use thiserror::Error;

use crate::encoder::Algorithm;
use crate::error::{EnhanceError, Result};
use crate::utils::{floor_epsilon, EPSILON};

// ============================================================================
// Constants
// ============================================================================

/// Newton iteration bound for the gamma shape estimate
pub const MAX_SHAPE_ITERATIONS: usize = 100;

/// Relative step size at which the shape estimate is accepted
pub const SHAPE_TOLERANCE: f64 = 1e-10;

// ============================================================================
// Error Types
// ============================================================================

/// Reasons a distribution fit can fail
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitError {
    #[error("no samples to fit")]
    Empty,

    #[error("sample {index} is negative or non-finite ({value})")]
    InvalidSample { index: usize, value: f64 },

    #[error("all samples are zero")]
    AllZero,

    #[error("samples have no spread")]
    ZeroVariance,

    #[error("shape estimate did not converge after {iterations} iterations")]
    NotConverged { iterations: usize },
}

// ============================================================================
// Gamma Fit
// ============================================================================

/// Fitted gamma distribution parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GammaFit {
    /// Shape parameter (alpha)
    pub shape: f64,

    /// Location parameter; activations live on [0, inf) so this is 0
    pub loc: f64,

    /// Scale parameter (beta)
    pub scale: f64,
}

impl GammaFit {
    /// Mean of the fitted distribution
    #[inline]
    pub fn mean(&self) -> f64 {
        self.loc + self.shape * self.scale
    }
}

fn check_samples(samples: &ArrayView1<f64>) -> std::result::Result<f64, FitError> {
    if samples.is_empty() {
        return Err(FitError::Empty);
    }

    let mut sum = 0.0;
    for (index, &value) in samples.iter().enumerate() {
        if !value.is_finite() || value < 0.0 {
            return Err(FitError::InvalidSample { index, value });
        }
        sum += value;
    }

    if sum == 0.0 {
        return Err(FitError::AllZero);
    }

    Ok(sum)
}

/// Trigamma function via recurrence up to x >= 10 and the asymptotic series
fn trigamma(x: f64) -> f64 {
    let mut x = x;
    let mut acc = 0.0;
    while x < 10.0 {
        acc += 1.0 / (x * x);
        x += 1.0;
    }
    let t = 1.0 / x;
    let t2 = t * t;
    acc + t + t2 / 2.0 + t * t2 * (1.0 / 6.0 - t2 * (1.0 / 30.0 - t2 * (1.0 / 42.0 - t2 * (1.0 / 30.0 - t2 * 5.0 / 66.0))))
}

/// Maximum-likelihood gamma fit with the location pinned at zero.
///
/// Solves `ln a - digamma(a) = ln(mean) - mean(ln x)` for the shape by
/// Newton iteration from Minka's closed-form starting point; the scale is
/// then `mean / a`. Zero samples are floored at [`EPSILON`] before the
/// logarithm.
pub fn fit_gamma(samples: ArrayView1<f64>) -> std::result::Result<GammaFit, FitError> {
    check_samples(&samples)?;

    let n = samples.len() as f64;
    let (min, max) = samples
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &x| (lo.min(x), hi.max(x)));
    if max - min <= 0.0 {
        return Err(FitError::ZeroVariance);
    }

    let mean = samples.iter().map(|&x| floor_epsilon(x)).sum::<f64>() / n;
    let mean_ln = samples.iter().map(|&x| floor_epsilon(x).ln()).sum::<f64>() / n;
    let s = mean.ln() - mean_ln;
    if !(s.is_finite() && s > 0.0) {
        return Err(FitError::ZeroVariance);
    }

    let mut shape = (3.0 - s + ((s - 3.0) * (s - 3.0) + 24.0 * s).sqrt()) / (12.0 * s);

    for _ in 0..MAX_SHAPE_ITERATIONS {
        let f = shape.ln() - digamma(shape) - s;
        let df = 1.0 / shape - trigamma(shape);
        let mut next = shape - f / df;
        if next <= 0.0 {
            next = shape / 2.0;
        }
        if !next.is_finite() {
            break;
        }

        let converged = (next - shape).abs() <= SHAPE_TOLERANCE * shape;
        shape = next;
        if converged {
            return Ok(GammaFit {
                shape,
                loc: 0.0,
                scale: mean / shape,
            });
        }
    }

    Err(FitError::NotConverged {
        iterations: MAX_SHAPE_ITERATIONS,
    })
}

// ============================================================================
// Exponential Fit
// ============================================================================

/// Rate of an exponential distribution: the reciprocal of the sample mean
pub fn fit_exponential_rate(samples: ArrayView1<f64>) -> std::result::Result<f64, FitError> {
    let sum = check_samples(&samples)?;
    Ok(1.0 / (sum / samples.len() as f64))
}

// ============================================================================
// Prior
// ============================================================================

/// Fitted per-basis prior, one entry per row of the training activations
#[derive(Debug, Clone, PartialEq)]
pub enum Prior {
    /// No regularisation
    None,
    /// Gamma fit per basis
    Gamma(Vec<GammaFit>),
    /// Exponential rate per basis
    Exponential(Vec<f64>),
}

impl Prior {
    /// Fit the prior required by `algorithm` from the rows of `h_train`
    pub fn fit(algorithm: Algorithm, h_train: &Array2<f64>) -> Result<Self> {
        let wrap = |basis: usize| move |source: FitError| EnhanceError::Fitting { basis, source };

        match algorithm {
            Algorithm::Plain => Ok(Prior::None),
            Algorithm::Gamma => {
                let fits = h_train
                    .outer_iter()
                    .enumerate()
                    .map(|(k, row)| {
                        let fit = fit_gamma(row).map_err(wrap(k))?;
                        debug!("gamma prior basis {}: shape {}, scale {}", k, fit.shape, fit.scale);
                        Ok(fit)
                    })
                    .collect::<Result<Vec<_>>>()?;
                Ok(Prior::Gamma(fits))
            }
            Algorithm::Exponential => {
                let rates = h_train
                    .outer_iter()
                    .enumerate()
                    .map(|(k, row)| fit_exponential_rate(row).map_err(wrap(k)))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Prior::Exponential(rates))
            }
        }
    }

    /// Number of fitted bases, `None` for the unregularised prior
    pub fn num_basis(&self) -> Option<usize> {
        match self {
            Prior::None => None,
            Prior::Gamma(fits) => Some(fits.len()),
            Prior::Exponential(rates) => Some(rates.len()),
        }
    }

    /// Penalty added to the update denominator for `H(basis, t) = activation`.
    ///
    /// For the gamma prior the term is negative whenever `shape > 1` and the
    /// activation is small enough.
    #[inline]
    pub fn penalty_term(&self, basis: usize, activation: f64, weight: f64) -> f64 {
        match self {
            Prior::None => 0.0,
            Prior::Gamma(fits) => {
                let fit = &fits[basis];
                weight * ((1.0 - fit.shape) / activation.max(EPSILON) + 1.0 / fit.scale)
            }
            Prior::Exponential(rates) => weight * rates[basis],
        }
    }
}
