//! Basis learning by multiplicative-update NMF
//!
//! Jointly learns a basis matrix `W` (F x K) and activation matrix `H`
//! (K x T) such that `V ~= W H` for a fixed training magnitude spectrogram.
//! Each iteration updates `W` first and then `H` using the freshly updated
//! `W`:
//!
//! ```text
//! W <- W * (V H^T) / (W H H^T)
//! H <- H * (W^T V) / (W^T W H)
//! ```
//!
//! Denominators are floored at [`EPSILON`](crate::utils::EPSILON), so with
//! non-negative inputs both factors stay non-negative.

use log::info;
use ndarray::Array2;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::convergence::{ConvergenceMonitor, FitReport};
use crate::error::{EnhanceError, Result};
use crate::utils::{ensure_non_negative, ensure_not_empty, floor_in_place, random_nonnegative};

// ============================================================================
// Constants
// ============================================================================

/// Default iteration bound for training
pub const DEFAULT_TRAIN_ITERATIONS: usize = 100;

/// Default convergence threshold on the KL cost
pub const DEFAULT_EPSILON: f64 = 0.5;

/// Default total basis count (speech + noise)
pub const DEFAULT_NUM_BASIS: usize = 256;

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for basis training
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Iteration bound
    pub max_iter: usize,

    /// Stop once the cost falls below this
    pub epsilon: f64,

    /// Number of basis vectors K
    pub num_basis: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            max_iter: DEFAULT_TRAIN_ITERATIONS,
            epsilon: DEFAULT_EPSILON,
            num_basis: DEFAULT_NUM_BASIS,
        }
    }
}

impl TrainConfig {
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

        if self.num_basis == 0 {
            return Err(EnhanceError::InvalidConfiguration(
                "num_basis must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

// ============================================================================
// Result
// ============================================================================

/// A trained factorisation `V ~= basis . activations`
#[derive(Debug, Clone, PartialEq)]
pub struct Factorization {
    /// Basis matrix W, F x K
    pub basis: Array2<f64>,

    /// Activation matrix H, K x T
    pub activations: Array2<f64>,

    /// Convergence trace of the run
    pub report: FitReport,
}

impl Factorization {
    /// Reconstruction `W H`
    pub fn reconstruction(&self) -> Array2<f64> {
        self.basis.dot(&self.activations)
    }

    #[inline]
    pub fn num_basis(&self) -> usize {
        self.basis.ncols()
    }
}

// ============================================================================
// Update Rules
// ============================================================================

/// `W * (V H^T) / (W H H^T)`
pub(crate) fn update_basis(v: &Array2<f64>, w: &Array2<f64>, h: &Array2<f64>) -> Array2<f64> {
    let ht = h.t();
    let numerator = v.dot(&ht);
    let mut denominator = w.dot(&h.dot(&ht));
    floor_in_place(&mut denominator);
    w * &(numerator / &denominator)
}

/// `H * (W^T V) / (W^T W H)`
pub(crate) fn update_activations(v: &Array2<f64>, w: &Array2<f64>, h: &Array2<f64>) -> Array2<f64> {
    let wt = w.t();
    let numerator = wt.dot(v);
    let mut denominator = wt.dot(w).dot(h);
    floor_in_place(&mut denominator);
    h * &(numerator / &denominator)
}

/// Random starting point for a `rows x cols` observation with `num_basis`
/// bases. `W` is drawn before `H`, so replaying the same seed reproduces
/// the pair `train` starts from.
pub fn initialize<R: Rng + ?Sized>(
    rows: usize,
    cols: usize,
    num_basis: usize,
    rng: &mut R,
) -> (Array2<f64>, Array2<f64>) {
    let w = random_nonnegative(rows, num_basis, rng);
    let h = random_nonnegative(num_basis, cols, rng);
    (w, h)
}

// ============================================================================
// Basis Factorizer
// ============================================================================

/// Learns a basis/activation pair from a training spectrogram
#[derive(Debug, Clone)]
pub struct BasisFactorizer {
    config: TrainConfig,
}

impl BasisFactorizer {
    /// Create a factorizer with a validated configuration
    pub fn new(config: TrainConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &TrainConfig {
        &self.config
    }

    /// Factorise `v`. Returns the matrices from the last completed iteration
    /// whether or not the cost threshold was reached.
    pub fn train<R: Rng + ?Sized>(&self, v: &Array2<f64>, rng: &mut R) -> Result<Factorization> {
        ensure_not_empty(v, "training spectrogram")?;
        ensure_non_negative(v, "training spectrogram")?;

        let (rows, cols) = v.dim();
        info!(
            "[Start] training NMF: {}x{} spectrogram, {} bases, max {} iterations",
            rows, cols, self.config.num_basis, self.config.max_iter
        );

        let (mut w, mut h) = initialize(rows, cols, self.config.num_basis, rng);
        let monitor = ConvergenceMonitor::new("train", self.config.max_iter, self.config.epsilon);

        let report = monitor.run(v, |_| {
            w = update_basis(v, &w, &h);
            h = update_activations(v, &w, &h);
            Ok(w.dot(&h))
        })?;

        info!(
            "[End] training NMF: {} iterations, cost {}, converged: {}",
            report.iterations, report.final_cost, report.converged
        );

        Ok(Factorization {
            basis: w,
            activations: h,
            report,
        })
    }
}

/// Train a basis of `num_basis` vectors on `v`
pub fn train<R: Rng + ?Sized>(
    v: &Array2<f64>,
    max_iter: usize,
    epsilon: f64,
    num_basis: usize,
    rng: &mut R,
) -> Result<Factorization> {
    BasisFactorizer::new(TrainConfig {
        max_iter,
        epsilon,
        num_basis,
    })?
    .train(v, rng)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convergence::kl_cost;
    use ndarray::array;
    use proptest::prelude::*;
    use rand::rngs::SmallRng;
    use rand::{Rng, SeedableRng};
    use test_strategy::proptest;

    const EPS: f64 = 1e-12;

    fn low_rank(rows: usize, cols: usize, rank: usize, seed: u64) -> Array2<f64> {
        let mut rng = SmallRng::seed_from_u64(seed);
        let w = random_nonnegative(rows, rank, &mut rng);
        let h = random_nonnegative(rank, cols, &mut rng);
        w.dot(&h)
    }

    #[test]
    fn test_config_validation() {
        let mut config = TrainConfig::default();
        assert!(config.validate().is_ok());

        config.max_iter = 0;
        assert!(config.validate().is_err());
        config.max_iter = 10;

        config.epsilon = 0.0;
        assert!(config.validate().is_err());
        config.epsilon = f64::NAN;
        assert!(config.validate().is_err());
        config.epsilon = 1e-3;

        config.num_basis = 0;
        assert!(config.validate().is_err());
        config.num_basis = 4;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_update_basis_single_entry() {
        // W = 1 * (4 * 2) / (1 * 2 * 2) = 2
        let v = array![[4.0]];
        let w = array![[1.0]];
        let h = array![[2.0]];
        let w_next = update_basis(&v, &w, &h);
        assert!((w_next[[0, 0]] - 2.0).abs() < EPS);
    }

    #[test]
    fn test_update_order_uses_new_basis() {
        // W updated first: W' = 2, then H' = 2 * (2 * 4) / (2 * 2 * 2) = 2,
        // giving an exact fit in one step.
        let v = array![[4.0]];
        let w = update_basis(&v, &array![[1.0]], &array![[2.0]]);
        let h = update_activations(&v, &w, &array![[2.0]]);
        assert!((w.dot(&h)[[0, 0]] - 4.0).abs() < EPS);

        // Using the stale W for H would give H' = 2 * 4 / (1 * 1 * 2) = 4
        let h_stale = update_activations(&v, &array![[1.0]], &array![[2.0]]);
        assert!((h_stale[[0, 0]] - 4.0).abs() < EPS);
    }

    #[test]
    fn test_update_with_zero_row_stays_finite() {
        let v = array![[0.0, 0.0], [1.0, 2.0]];
        let w = array![[0.5], [0.5]];
        let h = array![[1.0, 1.0]];
        let w_next = update_basis(&v, &w, &h);
        assert_eq!(w_next[[0, 0]], 0.0);

        let h_next = update_activations(&v, &w_next, &h);
        assert!(h_next.iter().all(|x| x.is_finite() && *x >= 0.0));
    }

    #[test]
    fn test_train_shapes() {
        let v = low_rank(12, 30, 3, 1);
        let mut rng = SmallRng::seed_from_u64(2);
        let result = train(&v, 15, 1e-6, 4, &mut rng).unwrap();

        assert_eq!(result.basis.dim(), (12, 4));
        assert_eq!(result.activations.dim(), (4, 30));
        assert_eq!(result.num_basis(), 4);
        assert_eq!(result.report.iterations, 15);
        assert!(!result.report.converged);
    }

    #[test]
    fn test_train_is_deterministic_for_seed() {
        let v = low_rank(8, 16, 2, 3);
        let a = train(&v, 10, 1e-6, 3, &mut SmallRng::seed_from_u64(9)).unwrap();
        let b = train(&v, 10, 1e-6, 3, &mut SmallRng::seed_from_u64(9)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_train_early_stop() {
        let v = low_rank(8, 16, 2, 4);
        let mut rng = SmallRng::seed_from_u64(5);
        // A threshold no cost can miss stops after the first iteration
        let result = train(&v, 50, f64::MAX, 3, &mut rng).unwrap();
        assert_eq!(result.report.iterations, 1);
        assert!(result.report.converged);
    }

    #[test]
    fn test_train_reduces_cost_on_low_rank_input() {
        let v = low_rank(20, 40, 3, 6);
        let (w0, h0) = initialize(20, 40, 3, &mut SmallRng::seed_from_u64(11));
        let initial_cost = kl_cost(&v, &w0.dot(&h0)).unwrap();

        let result = train(&v, 200, 1e-9, 3, &mut SmallRng::seed_from_u64(11)).unwrap();
        let final_cost = kl_cost(&v, &result.reconstruction()).unwrap();

        assert!(final_cost < initial_cost);
        assert!((final_cost - result.report.final_cost).abs() < EPS);

        // Average of the last ten costs below the average of the first ten
        let costs = &result.report.costs;
        let head: f64 = costs[..10].iter().sum::<f64>() / 10.0;
        let tail: f64 = costs[costs.len() - 10..].iter().sum::<f64>() / 10.0;
        assert!(tail <= head);
    }

    #[test]
    fn test_train_rejects_bad_input() {
        let mut rng = SmallRng::seed_from_u64(0);
        let negative = array![[1.0, -0.5], [0.0, 2.0]];
        assert!(matches!(
            train(&negative, 5, 1e-3, 2, &mut rng),
            Err(EnhanceError::NegativeInput { .. })
        ));

        let empty = Array2::<f64>::zeros((0, 4));
        assert!(matches!(
            train(&empty, 5, 1e-3, 2, &mut rng),
            Err(EnhanceError::InvalidConfiguration(_))
        ));

        let v = array![[1.0]];
        assert!(train(&v, 5, 1e-3, 0, &mut rng).is_err());
    }

    #[proptest(ProptestConfig { cases: 64, ..ProptestConfig::default() })]
    fn test_train_keeps_factors_non_negative(
        #[strategy(1..10usize)] rows: usize,
        #[strategy(1..10usize)] cols: usize,
        #[strategy(1..5usize)] num_basis: usize,
        seed: u64,
    ) {
        let mut rng = SmallRng::seed_from_u64(seed);
        let v = Array2::from_shape_simple_fn((rows, cols), || {
            if rng.gen_bool(0.2) { 0.0 } else { rng.gen::<f64>() * 10.0 }
        });

        let result = train(&v, 10, 1e-12, num_basis, &mut rng).unwrap();
        prop_assert!(result.basis.iter().all(|x| x.is_finite() && *x >= 0.0));
        prop_assert!(result.activations.iter().all(|x| x.is_finite() && *x >= 0.0));
    }
}
