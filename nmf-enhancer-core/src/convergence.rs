//! Convergence checking for the multiplicative-update loops
//!
//! Both training and encoding stop on the same criterion: the Frobenius
//! norm of the elementwise generalised KL residual between the observation
//! and its reconstruction,
//!
//! ```text
//! cost = || V * ln(V / V_hat) - V + V_hat ||_F
//! ```
//!
//! The cost is recomputed from scratch every iteration. Reaching the
//! iteration bound without falling below the threshold is not an error;
//! the caller keeps the last iterate and the report says so.

use log::debug;
use ndarray::{Array2, Zip};

use crate::error::{EnhanceError, Result};
use crate::utils::{ensure_dim, floor_epsilon};

// ============================================================================
// Cost
// ============================================================================

/// Generalised KL-divergence cost between `v` and `v_hat`.
///
/// Both inputs are floored at [`EPSILON`](crate::utils::EPSILON) entrywise
/// before the logarithm, so zero entries contribute a finite term.
pub fn kl_cost(v: &Array2<f64>, v_hat: &Array2<f64>) -> Result<f64> {
    ensure_dim("cost rows", v.nrows(), v_hat.nrows())?;
    ensure_dim("cost columns", v.ncols(), v_hat.ncols())?;

    let mut sum_squares = 0.0;
    Zip::from(v).and(v_hat).for_each(|&x, &y| {
        let x = floor_epsilon(x);
        let y = floor_epsilon(y);
        let r = x * (x / y).ln() - x + y;
        sum_squares += r * r;
    });

    Ok(sum_squares.sqrt())
}

// ============================================================================
// Report
// ============================================================================

/// Outcome of one training or encoding run
#[derive(Debug, Clone, PartialEq)]
pub struct FitReport {
    /// Completed iterations
    pub iterations: usize,

    /// Cost after the last completed iteration
    pub final_cost: f64,

    /// True when the run stopped because `cost < epsilon`
    pub converged: bool,

    /// Cost after each iteration, in order
    pub costs: Vec<f64>,
}

impl FitReport {
    fn empty() -> Self {
        Self {
            iterations: 0,
            final_cost: f64::INFINITY,
            converged: false,
            costs: Vec::new(),
        }
    }
}

// ============================================================================
// Monitor
// ============================================================================

/// Drives an update loop until `cost < epsilon` or `max_iter` iterations
#[derive(Debug, Clone, Copy)]
pub struct ConvergenceMonitor {
    stage: &'static str,
    max_iter: usize,
    epsilon: f64,
}

impl ConvergenceMonitor {
    /// Create a monitor. `stage` only labels log lines and errors.
    pub fn new(stage: &'static str, max_iter: usize, epsilon: f64) -> Self {
        Self { stage, max_iter, epsilon }
    }

    /// Whether a cost satisfies the stopping criterion
    #[inline]
    pub fn is_converged(&self, cost: f64) -> bool {
        cost < self.epsilon
    }

    /// Run `step` until convergence.
    ///
    /// `step` receives the zero-based iteration index, performs one full
    /// update of the factors and returns the new reconstruction `V_hat`.
    pub fn run<F>(&self, v: &Array2<f64>, mut step: F) -> Result<FitReport>
    where
        F: FnMut(usize) -> Result<Array2<f64>>,
    {
        let mut report = FitReport::empty();

        for iteration in 0..self.max_iter {
            let v_hat = step(iteration)?;
            let cost = kl_cost(v, &v_hat)?;
            if !cost.is_finite() {
                return Err(EnhanceError::NonFinite {
                    stage: self.stage,
                    iteration: iteration + 1,
                });
            }

            debug!("[{}] Iteration: {:03}, cost: {}", self.stage, iteration + 1, cost);

            report.iterations = iteration + 1;
            report.final_cost = cost;
            report.costs.push(cost);

            if self.is_converged(cost) {
                report.converged = true;
                break;
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    const EPS: f64 = 1e-12;

    #[test]
    fn test_cost_of_identical_is_zero() {
        let v = array![[0.5, 1.0, 2.0], [3.0, 0.25, 7.5]];
        assert_eq!(kl_cost(&v, &v).unwrap(), 0.0);
    }

    #[test]
    fn test_cost_known_value() {
        // Single entry: 1 * ln(1/2) - 1 + 2 = 1 - ln 2
        let v = array![[1.0]];
        let v_hat = array![[2.0]];
        let expected = 1.0 - 2.0_f64.ln();
        assert!((kl_cost(&v, &v_hat).unwrap() - expected).abs() < EPS);
    }

    #[test]
    fn test_cost_is_frobenius_norm_of_residual() {
        let v = array![[1.0, 4.0]];
        let v_hat = array![[2.0, 1.0]];
        let r0 = 1.0 * (0.5_f64).ln() - 1.0 + 2.0;
        let r1 = 4.0 * (4.0_f64).ln() - 4.0 + 1.0;
        let expected = (r0 * r0 + r1 * r1).sqrt();
        assert!((kl_cost(&v, &v_hat).unwrap() - expected).abs() < EPS);
    }

    #[test]
    fn test_cost_handles_zero_entries() {
        let v = array![[0.0, 1.0]];
        let v_hat = array![[1.0, 0.0]];
        let cost = kl_cost(&v, &v_hat).unwrap();
        assert!(cost.is_finite());
        assert!(cost > 0.0);
    }

    #[test]
    fn test_cost_shape_mismatch() {
        let v = Array2::<f64>::ones((2, 3));
        let v_hat = Array2::<f64>::ones((3, 2));
        assert!(matches!(
            kl_cost(&v, &v_hat),
            Err(EnhanceError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_monitor_stops_early() {
        let v = array![[1.0, 2.0]];
        let monitor = ConvergenceMonitor::new("test", 50, 1e-3);
        let mut calls = 0;
        let report = monitor
            .run(&v, |_| {
                calls += 1;
                Ok(v.clone())
            })
            .unwrap();

        assert_eq!(calls, 1);
        assert_eq!(report.iterations, 1);
        assert!(report.converged);
        assert_eq!(report.final_cost, 0.0);
    }

    #[test]
    fn test_monitor_exhausts_iterations() {
        let v = array![[1.0, 2.0]];
        let far = array![[10.0, 20.0]];
        let monitor = ConvergenceMonitor::new("test", 7, 1e-3);
        let report = monitor.run(&v, |_| Ok(far.clone())).unwrap();

        assert_eq!(report.iterations, 7);
        assert_eq!(report.costs.len(), 7);
        assert!(!report.converged);
        assert!(report.final_cost > 1e-3);
    }

    #[test]
    fn test_monitor_rejects_non_finite_cost() {
        let v = array![[1.0]];
        let monitor = ConvergenceMonitor::new("test", 3, 1e-3);
        let result = monitor.run(&v, |_| Ok(array![[f64::INFINITY]]));
        assert_eq!(
            result,
            Err(EnhanceError::NonFinite { stage: "test", iteration: 1 })
        );
    }

    #[test]
    fn test_monitor_propagates_step_error() {
        let v = array![[1.0]];
        let monitor = ConvergenceMonitor::new("test", 3, 1e-3);
        let result = monitor.run(&v, |_| Err(EnhanceError::NotTrained));
        assert_eq!(result, Err(EnhanceError::NotTrained));
    }
}
