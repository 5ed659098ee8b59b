use ndarray::Array2;
use rand::Rng;

use crate::error::{EnhanceError, Result};

// Configuration constants
/// Floor applied wherever a spectrogram or product entry ends up in a
/// denominator or a logarithm. Matches the machine epsilon of `f64`.
pub const EPSILON: f64 = f64::EPSILON;

// ============================================================================
// Numerical Floors
// ============================================================================

/// Lift a value to at least [`EPSILON`]
#[inline]
pub fn floor_epsilon(x: f64) -> f64 {
    x.max(EPSILON)
}

/// Lift every entry of a matrix to at least [`EPSILON`] (in place)
#[inline]
pub fn floor_in_place(matrix: &mut Array2<f64>) {
    matrix.mapv_inplace(floor_epsilon);
}

// ============================================================================
// Initialisation
// ============================================================================

/// Draw a `rows x cols` matrix from U[0, 1) offset by [`EPSILON`] so no
/// entry is exactly zero.
pub fn random_nonnegative<R: Rng + ?Sized>(rows: usize, cols: usize, rng: &mut R) -> Array2<f64> {
    Array2::from_shape_simple_fn((rows, cols), || rng.gen::<f64>() + EPSILON)
}

// ============================================================================
// Input Checks
// ============================================================================

/// Fail unless every entry is finite and `>= 0`
pub fn ensure_non_negative(matrix: &Array2<f64>, what: &'static str) -> Result<()> {
    if matrix.iter().all(|&x| x.is_finite() && x >= 0.0) {
        Ok(())
    } else {
        Err(EnhanceError::NegativeInput { what })
    }
}

/// Fail unless `actual == expected`
#[inline]
pub fn ensure_dim(what: &'static str, expected: usize, actual: usize) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(EnhanceError::DimensionMismatch { what, expected, actual })
    }
}

/// Fail on an empty matrix
pub fn ensure_not_empty(matrix: &Array2<f64>, what: &'static str) -> Result<()> {
    if matrix.is_empty() {
        Err(EnhanceError::InvalidConfiguration(format!("{} is empty", what)))
    } else {
        Ok(())
    }
}

/// Whether every entry of a matrix is finite
#[inline]
pub fn all_finite(matrix: &Array2<f64>) -> bool {
    matrix.iter().all(|x| x.is_finite())
}
