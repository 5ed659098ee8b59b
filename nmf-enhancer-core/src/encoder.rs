//! Activation inference against a fixed, trained basis
//!
//! Given a trained basis `W` and a new magnitude spectrogram `V`, only the
//! activation matrix `H` is updated. Three update regimes share one loop:
//!
//! - [`Algorithm::Plain`]: the training-time activation update,
//!   `H <- H * (W^T V) / (W^T W H)`
//! - [`Algorithm::Gamma`] and [`Algorithm::Exponential`]: a MAP step under a
//!   per-basis prior fitted from the training activations,
//!   `H <- H * (W^T (V / (W H + eps))) / (W^T 1 + penalty_term)`
//!
//! The prior is fitted once when the encoder is built and reused for every
//! observation encoded against the same model.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use log::info;
use ndarray::{Array1, Array2, Axis, Zip};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::convergence::{ConvergenceMonitor, FitReport};
use crate::error::{EnhanceError, Result};
use crate::factorizer::update_activations;
use crate::prior::Prior;
use crate::utils::{
    all_finite, ensure_dim, ensure_non_negative, ensure_not_empty,
    random_nonnegative, EPSILON,
};

// ============================================================================
// Constants
// ============================================================================

/// Default iteration bound for encoding
pub const DEFAULT_ENCODE_ITERATIONS: usize = 30;

/// Default convergence threshold on the KL cost
pub const DEFAULT_EPSILON: f64 = 0.5;

/// Default regularisation weight
pub const DEFAULT_PENALTY: f64 = 0.005;

// ============================================================================
// Algorithm
// ============================================================================

/// Activation update regime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    /// Unregularised multiplicative update
    Plain,
    /// Gamma prior per basis
    Gamma,
    /// Exponential prior per basis
    #[default]
    Exponential,
}

impl Algorithm {
    pub fn name(&self) -> &'static str {
        match self {
            Algorithm::Plain => "plain",
            Algorithm::Gamma => "gamma",
            Algorithm::Exponential => "exponential",
        }
    }
}

impl FromStr for Algorithm {
    type Err = EnhanceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "plain" | "nmf" | "standard" => Ok(Algorithm::Plain),
            "gamma" | "nmf_g" => Ok(Algorithm::Gamma),
            "exponential" | "exp" | "nmf_e" => Ok(Algorithm::Exponential),
            _ => Err(EnhanceError::InvalidAlgorithm(s.to_string())),
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for activation inference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodeConfig {
    /// Iteration bound
    pub max_iter: usize,

    /// Stop once the cost falls below this
    pub epsilon: f64,

    /// Regularisation weight (lambda), ignored by [`Algorithm::Plain`]
    pub penalty: f64,

    /// Update regime
    pub algorithm: Algorithm,
}

impl Default for EncodeConfig {
    fn default() -> Self {
        Self {
            max_iter: DEFAULT_ENCODE_ITERATIONS,
            epsilon: DEFAULT_EPSILON,
            penalty: DEFAULT_PENALTY,
            algorithm: Algorithm::default(),
        }
    }
}

impl EncodeConfig {
    /// Validate configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.max_iter == 0 {
            return Err(EnhanceError::InvalidConfiguration(
                "max_iter must be positive".to_string(),
            ));
        }

        if !(self.epsilon.is_finite() && self.epsilon > 0.0) {
            return Err(EnhanceError::InvalidConfiguration(format!(
                "epsilon {} must be a positive finite number",
                self.epsilon
            )));
        }

        if !(self.penalty.is_finite() && self.penalty >= 0.0) {
            return Err(EnhanceError::InvalidConfiguration(format!(
                "penalty {} must be a non-negative finite number",
                self.penalty
            )));
        }

        Ok(())
    }
}

// ============================================================================
// Result
// ============================================================================

/// Activations inferred for one observation
#[derive(Debug, Clone, PartialEq)]
pub struct Encoding {
    /// Activation matrix H, K x T
    pub activations: Array2<f64>,

    /// Convergence trace of the run
    pub report: FitReport,
}

// ============================================================================
// Regularized Encoder
// ============================================================================

/// Infers activations for new observations against a trained basis
#[derive(Debug, Clone)]
pub struct RegularizedEncoder {
    basis: Arc<Array2<f64>>,
    // W^T 1: column sums of the basis, identical for every frame
    basis_sums: Array1<f64>,
    prior: Prior,
    config: EncodeConfig,
}

impl RegularizedEncoder {
    /// Build an encoder for `basis` (F x K), fitting the prior required by
    /// `config.algorithm` from `training_activations` (K x T_train).
    pub fn new(
        basis: Arc<Array2<f64>>,
        training_activations: &Array2<f64>,
        config: EncodeConfig,
    ) -> Result<Self> {
        config.validate()?;
        ensure_not_empty(&basis, "basis")?;
        ensure_non_negative(&basis, "basis")?;
        ensure_dim("basis count", basis.ncols(), training_activations.nrows())?;

        let prior = Prior::fit(config.algorithm, training_activations)?;
        let basis_sums = basis.sum_axis(Axis(0));

        Ok(Self {
            basis,
            basis_sums,
            prior,
            config,
        })
    }

    pub fn config(&self) -> &EncodeConfig {
        &self.config
    }

    pub fn prior(&self) -> &Prior {
        &self.prior
    }

    pub fn basis(&self) -> &Array2<f64> {
        &self.basis
    }

    #[inline]
    pub fn num_basis(&self) -> usize {
        self.basis.ncols()
    }

    /// MAP update `H * (W^T (V / (W H + eps))) / (W^T 1 + penalty_term)`.
    /// A denominator at or below [`EPSILON`] (a gamma prior with shape > 1
    /// at a small activation) would yield a non-positive ratio; such entries
    /// are clamped to 0.
    fn regularized_step(&self, v: &Array2<f64>, h: &Array2<f64>) -> Array2<f64> {
        let w = self.basis.as_ref();
        let mut wh = w.dot(h);
        wh.mapv_inplace(|x| x + EPSILON);
        let numerator = h * &w.t().dot(&(v / &wh));

        let weight = self.config.penalty;
        let mut next = Array2::zeros(h.raw_dim());
        Zip::indexed(&mut next)
            .and(&numerator)
            .and(h)
            .for_each(|(k, _), out, &top, &activation| {
                let bottom = self.basis_sums[k] + self.prior.penalty_term(k, activation, weight);
                *out = if bottom > EPSILON { top / bottom } else { 0.0 };
            });
        next
    }

    fn step(&self, v: &Array2<f64>, h: &Array2<f64>) -> Array2<f64> {
        match self.config.algorithm {
            Algorithm::Plain => update_activations(v, &self.basis, h),
            Algorithm::Gamma | Algorithm::Exponential => self.regularized_step(v, h),
        }
    }

    /// Infer activations for `v` (F x T) from a fresh random start
    pub fn encode<R: Rng + ?Sized>(&self, v: &Array2<f64>, rng: &mut R) -> Result<Encoding> {
        ensure_not_empty(v, "observation")?;
        ensure_non_negative(v, "observation")?;
        ensure_dim("frequency bins", self.basis.nrows(), v.nrows())?;

        let mut h = random_nonnegative(self.num_basis(), v.ncols(), rng);
        let monitor = ConvergenceMonitor::new("encode", self.config.max_iter, self.config.epsilon);

        let report = monitor.run(v, |iteration| {
            h = self.step(v, &h);
            if !all_finite(&h) {
                return Err(EnhanceError::NonFinite {
                    stage: "encode",
                    iteration: iteration + 1,
                });
            }
            Ok(self.basis.dot(&h))
        })?;

        info!(
            "encoded {} frames with {}: {} iterations, cost {}, converged: {}",
            v.ncols(),
            self.config.algorithm,
            report.iterations,
            report.final_cost,
            report.converged
        );

        Ok(Encoding {
            activations: h,
            report,
        })
    }

    /// Encode independent observations in parallel. Observation `i` is
    /// initialised from `SmallRng::seed_from_u64(seed + i)`.
    pub fn encode_batch(&self, inputs: &[Array2<f64>], seed: u64) -> Vec<Result<Encoding>> {
        inputs
            .par_iter()
            .enumerate()
            .map(|(i, v)| {
                let mut rng = SmallRng::seed_from_u64(seed.wrapping_add(i as u64));
                self.encode(v, &mut rng)
            })
            .collect()
    }
}

/// Infer activations for `v` against `w_train`, fitting the prior from
/// `h_train`. Prefer [`RegularizedEncoder`] when encoding many inputs
/// against one model.
pub fn encode<R: Rng + ?Sized>(
    v: &Array2<f64>,
    w_train: &Array2<f64>,
    h_train: &Array2<f64>,
    config: &EncodeConfig,
    rng: &mut R,
) -> Result<Encoding> {
    RegularizedEncoder::new(Arc::new(w_train.clone()), h_train, config.clone())?.encode(v, rng)
}
