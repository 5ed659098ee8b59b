//! Wiener-style reconstruction from a speech/noise factorisation
//!
//! The basis columns and activation rows are split at `num_basis_speech`:
//! the leading part models speech, the rest models noise. Each part is
//! multiplied out to a magnitude estimate and the two estimates form a
//! soft mask
//!
//! ```text
//! gain = S^p / (S^p + N^p)
//! ```
//!
//! which is applied to the noisy magnitude spectrogram. Larger `p` pushes
//! the mask toward a binary one.

use ndarray::{s, Array2, ArrayView2, Zip};

use crate::error::{EnhanceError, Result};
use crate::utils::{ensure_dim, ensure_non_negative};

/// Default exponent of the Wiener gain
pub const DEFAULT_WIENER_POWER: u32 = 2;

// ============================================================================
// Splitting
// ============================================================================

/// Split a basis (F x K) into its speech (F x n) and noise (F x (K - n)) columns
pub fn split_basis(
    basis: &Array2<f64>,
    num_basis_speech: usize,
) -> Result<(ArrayView2<'_, f64>, ArrayView2<'_, f64>)> {
    check_split(basis.ncols(), num_basis_speech)?;
    Ok((
        basis.slice(s![.., ..num_basis_speech]),
        basis.slice(s![.., num_basis_speech..]),
    ))
}

/// Split activations (K x T) into their speech (n x T) and noise rows
pub fn split_activations(
    activations: &Array2<f64>,
    num_basis_speech: usize,
) -> Result<(ArrayView2<'_, f64>, ArrayView2<'_, f64>)> {
    check_split(activations.nrows(), num_basis_speech)?;
    Ok((
        activations.slice(s![..num_basis_speech, ..]),
        activations.slice(s![num_basis_speech.., ..]),
    ))
}

fn check_split(total: usize, num_basis_speech: usize) -> Result<()> {
    if num_basis_speech > total {
        return Err(EnhanceError::InvalidConfiguration(format!(
            "num_basis_speech {} exceeds basis count {}",
            num_basis_speech, total
        )));
    }
    Ok(())
}

// ============================================================================
// Gain
// ============================================================================

fn exponent(p: u32) -> Result<i32> {
    match i32::try_from(p) {
        Ok(p) if p > 0 => Ok(p),
        _ => Err(EnhanceError::InvalidConfiguration(format!(
            "Wiener power {} must be a positive integer",
            p
        ))),
    }
}

/// Gain for one bin. Evaluated as `1 / (1 + (N/S)^p)` so large magnitudes
/// or powers cannot overflow into `inf / inf`. A bin with no speech
/// estimate gets gain 0.
#[inline]
fn bin_gain(speech: f64, noise: f64, p: i32) -> f64 {
    if speech <= 0.0 {
        0.0
    } else {
        1.0 / (1.0 + (noise / speech).powi(p))
    }
}

/// Soft mask `S^p / (S^p + N^p)`, entrywise in [0, 1]
pub fn wiener_gain(speech_hat: &Array2<f64>, noise_hat: &Array2<f64>, p: u32) -> Result<Array2<f64>> {
    let p = exponent(p)?;
    ensure_dim("gain rows", speech_hat.nrows(), noise_hat.nrows())?;
    ensure_dim("gain columns", speech_hat.ncols(), noise_hat.ncols())?;

    Ok(Zip::from(speech_hat)
        .and(noise_hat)
        .map_collect(|&s, &n| bin_gain(s, n, p)))
}

// ============================================================================
// Reconstruction
// ============================================================================

/// Speech and noise magnitude estimates `W_s H_s` and `W_n H_n`
pub fn separate(
    basis: &Array2<f64>,
    activations: &Array2<f64>,
    num_basis_speech: usize,
) -> Result<(Array2<f64>, Array2<f64>)> {
    ensure_dim("basis count", basis.ncols(), activations.nrows())?;
    let (w_speech, w_noise) = split_basis(basis, num_basis_speech)?;
    let (h_speech, h_noise) = split_activations(activations, num_basis_speech)?;
    Ok((w_speech.dot(&h_speech), w_noise.dot(&h_noise)))
}

/// Enhanced magnitude spectrogram `gain * V_noisy`
pub fn reconstruct(
    noisy: &Array2<f64>,
    basis: &Array2<f64>,
    activations: &Array2<f64>,
    num_basis_speech: usize,
    p: u32,
) -> Result<Array2<f64>> {
    ensure_non_negative(noisy, "noisy spectrogram")?;
    ensure_dim("frequency bins", basis.nrows(), noisy.nrows())?;
    ensure_dim("frames", activations.ncols(), noisy.ncols())?;

    let (speech_hat, noise_hat) = separate(basis, activations, num_basis_speech)?;
    let gain = wiener_gain(&speech_hat, &noise_hat, p)?;
    Ok(gain * noisy)
}
