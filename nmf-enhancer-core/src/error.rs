//! Error types shared by the factorisation core and the pipeline

use thiserror::Error;

use crate::prior::FitError;
use crate::stft::TransformError;

/// Result type for enhancement operations
pub type Result<T> = std::result::Result<T, EnhanceError>;

/// Errors that can occur while training, encoding or reconstructing
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EnhanceError {
    /// Two matrices that must share a dimension do not
    #[error("Dimension mismatch in {what}: expected {expected}, got {actual}")]
    DimensionMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    /// A parameter is out of its valid range
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Unrecognised encoder algorithm selector
    #[error("Unknown algorithm '{0}': expected one of plain, gamma, exponential")]
    InvalidAlgorithm(String),

    /// A magnitude spectrogram contained a negative or non-finite entry
    #[error("{what} must be finite and non-negative")]
    NegativeInput { what: &'static str },

    /// Per-basis distribution fit failed
    #[error("Prior fit failed for basis {basis}: {source}")]
    Fitting {
        basis: usize,
        #[source]
        source: FitError,
    },

    /// An iterate stopped being finite
    #[error("Non-finite values in {stage} at iteration {iteration}")]
    NonFinite {
        stage: &'static str,
        iteration: usize,
    },

    /// Forward or inverse spectral transform failed
    #[error(transparent)]
    Transform(#[from] TransformError),

    /// `enhance` called before a model was trained
    #[error("No trained model: call train first")]
    NotTrained,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_messages() {
        let err = EnhanceError::DimensionMismatch {
            what: "basis count",
            expected: 8,
            actual: 6,
        };
        assert_eq!(err.to_string(), "Dimension mismatch in basis count: expected 8, got 6");

        let err = EnhanceError::Fitting {
            basis: 3,
            source: FitError::AllZero,
        };
        assert!(err.to_string().starts_with("Prior fit failed for basis 3"));
    }

    #[test]
    fn test_transform_error_is_transparent() {
        let inner = TransformError::SignalTooShort { len: 3, needed: 64 };
        let err: EnhanceError = inner.clone().into();
        assert_eq!(err.to_string(), inner.to_string());
        assert_eq!(err, EnhanceError::Transform(inner));
    }
}
