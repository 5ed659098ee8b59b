//! Short-time Fourier analysis and synthesis
//!
//! Forward transform of a waveform into a complex spectrogram (frequency
//! bins x frames) and weighted overlap-add synthesis back to a waveform.
//! Frames are optionally centred by zero-padding half an FFT on both sides,
//! and synthesis divides by the summed squared window so that analysis
//! followed by synthesis reproduces the input.

use std::f64::consts::TAU;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use ndarray::{Array2, Zip};
use num_complex::Complex64;
use rustfft::{Fft, FftPlanner};
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Constants
// ============================================================================

/// Minimum FFT size supported
pub const MIN_FFT_SIZE: usize = 16;

/// Maximum FFT size supported
pub const MAX_FFT_SIZE: usize = 8192;

/// Default FFT size
pub const DEFAULT_FFT_SIZE: usize = 512;

/// Default window length, zero-padded to the FFT size
pub const DEFAULT_WIN_SIZE: usize = 256;

/// Default hop: a 256-sample window with 192 samples of overlap
pub const DEFAULT_HOP_SIZE: usize = 64;

/// Summed squared window values below this are left unnormalised
const WINDOW_SUM_FLOOR: f64 = 1e-10;

// ============================================================================
// Error Types
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransformError {
    #[error("Invalid FFT size: {size}. Must be power of 2 between {MIN_FFT_SIZE} and {MAX_FFT_SIZE}")]
    InvalidSize { size: usize },

    #[error("Invalid window size {win_size} for FFT size {fft_size}")]
    InvalidWindow { win_size: usize, fft_size: usize },

    #[error("Invalid hop size {hop} for window size {win_size}")]
    InvalidHop { hop: usize, win_size: usize },

    #[error("Signal of {len} samples is shorter than one frame ({needed})")]
    SignalTooShort { len: usize, needed: usize },

    #[error("Spectrogram shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: (usize, usize),
        actual: (usize, usize),
    },

    #[error("Unknown window type '{0}'")]
    UnknownWindow(String),
}

// ============================================================================
// Window Function Types
// ============================================================================

/// Supported analysis/synthesis windows (periodic form)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowType {
    /// Hann window
    Hann,
    /// Hamming window
    #[default]
    Hamming,
    /// Blackman window
    Blackman,
    /// Rectangular (boxcar) window
    Rectangular,
    /// Triangular window
    Bartlett,
}

impl WindowType {
    /// Generate periodic window coefficients for the given size
    pub fn generate(&self, size: usize) -> Vec<f64> {
        if size == 0 {
            return Vec::new();
        }
        let n = size as f64;
        (0..size)
            .map(|i| {
                let t = TAU * i as f64 / n;
                match self {
                    WindowType::Hann => 0.5 - 0.5 * t.cos(),
                    WindowType::Hamming => 0.54 - 0.46 * t.cos(),
                    WindowType::Blackman => 0.42 - 0.5 * t.cos() + 0.08 * (2.0 * t).cos(),
                    WindowType::Rectangular => 1.0,
                    WindowType::Bartlett => 1.0 - (2.0 * i as f64 / n - 1.0).abs(),
                }
            })
            .collect()
    }

    pub fn name(&self) -> &'static str {
        match self {
            WindowType::Hann => "hann",
            WindowType::Hamming => "hamming",
            WindowType::Blackman => "blackman",
            WindowType::Rectangular => "boxcar",
            WindowType::Bartlett => "bartlett",
        }
    }
}

impl FromStr for WindowType {
    type Err = TransformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "hann" | "hanning" => Ok(WindowType::Hann),
            "hamming" => Ok(WindowType::Hamming),
            "blackman" => Ok(WindowType::Blackman),
            "boxcar" | "rectangular" | "rect" => Ok(WindowType::Rectangular),
            "bartlett" | "triang" | "triangular" => Ok(WindowType::Bartlett),
            _ => Err(TransformError::UnknownWindow(s.to_string())),
        }
    }
}

impl fmt::Display for WindowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Configuration of the transform pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StftConfig {
    /// FFT length in samples
    pub fft_size: usize,

    /// Window length, centred and zero-padded to `fft_size`
    pub win_size: usize,

    /// Samples between successive frames
    pub hop_size: usize,

    /// Window applied on analysis and synthesis
    pub window: WindowType,

    /// Zero-pad half an FFT on both ends so frame t is centred on t * hop
    pub center: bool,
}

impl Default for StftConfig {
    fn default() -> Self {
        Self {
            fft_size: DEFAULT_FFT_SIZE,
            win_size: DEFAULT_WIN_SIZE,
            hop_size: DEFAULT_HOP_SIZE,
            window: WindowType::default(),
            center: true,
        }
    }
}

impl StftConfig {
    /// Validate configuration parameters
    pub fn validate(&self) -> Result<(), TransformError> {
        if !(MIN_FFT_SIZE..=MAX_FFT_SIZE).contains(&self.fft_size) || !self.fft_size.is_power_of_two() {
            return Err(TransformError::InvalidSize { size: self.fft_size });
        }

        if self.win_size == 0 || self.win_size > self.fft_size {
            return Err(TransformError::InvalidWindow {
                win_size: self.win_size,
                fft_size: self.fft_size,
            });
        }

        // Gaps between windows could not be synthesised
        if self.hop_size == 0 || self.hop_size > self.win_size {
            return Err(TransformError::InvalidHop {
                hop: self.hop_size,
                win_size: self.win_size,
            });
        }

        Ok(())
    }

    /// Number of non-negative frequency bins
    #[inline]
    pub fn num_bins(&self) -> usize {
        self.fft_size / 2 + 1
    }

    /// Analysis window of `win_size` taps centred in `fft_size` samples
    pub fn padded_window(&self) -> Vec<f64> {
        let mut padded = vec![0.0; self.fft_size];
        let offset = self.fft_size.saturating_sub(self.win_size) / 2;
        for (dst, w) in padded[offset..].iter_mut().zip(self.window.generate(self.win_size)) {
            *dst = w;
        }
        padded
    }
}

// ============================================================================
// Spectrogram
// ============================================================================

/// Complex spectrogram, rows are frequency bins and columns are frames
#[derive(Debug, Clone, PartialEq)]
pub struct Spectrogram {
    data: Array2<Complex64>,
}

impl Spectrogram {
    pub fn new(data: Array2<Complex64>) -> Self {
        Self { data }
    }

    /// Rebuild a spectrogram from polar components of equal shape
    pub fn from_magnitude_phase(
        magnitude: &Array2<f64>,
        phase: &Array2<f64>,
    ) -> Result<Self, TransformError> {
        if magnitude.dim() != phase.dim() {
            return Err(TransformError::ShapeMismatch {
                expected: magnitude.dim(),
                actual: phase.dim(),
            });
        }
        let data = Zip::from(magnitude)
            .and(phase)
            .map_collect(|&m, &p| Complex64::from_polar(m, p));
        Ok(Self { data })
    }

    #[inline]
    pub fn bins(&self) -> usize {
        self.data.nrows()
    }

    #[inline]
    pub fn frames(&self) -> usize {
        self.data.ncols()
    }

    pub fn as_array(&self) -> &Array2<Complex64> {
        &self.data
    }

    /// Magnitude spectrogram `|X|`
    pub fn magnitude(&self) -> Array2<f64> {
        self.data.mapv(|c| c.norm())
    }

    /// Phase spectrogram `arg X`
    pub fn phase(&self) -> Array2<f64> {
        self.data.mapv(|c| c.arg())
    }
}

// ============================================================================
// Spectral Transform
// ============================================================================

/// Forward/inverse STFT pair with a fixed configuration
pub struct SpectralTransform {
    config: StftConfig,
    window: Vec<f64>,
    fft_forward: Arc<dyn Fft<f64>>,
    fft_inverse: Arc<dyn Fft<f64>>,
}

impl fmt::Debug for SpectralTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpectralTransform")
            .field("config", &self.config)
            .finish()
    }
}

impl SpectralTransform {
    /// Plan FFTs for a validated configuration
    pub fn new(config: StftConfig) -> Result<Self, TransformError> {
        config.validate()?;

        let mut planner = FftPlanner::new();
        let fft_forward = planner.plan_fft_forward(config.fft_size);
        let fft_inverse = planner.plan_fft_inverse(config.fft_size);
        let window = config.padded_window();

        Ok(Self {
            config,
            window,
            fft_forward,
            fft_inverse,
        })
    }

    pub fn config(&self) -> &StftConfig {
        &self.config
    }

    #[inline]
    pub fn num_bins(&self) -> usize {
        self.config.num_bins()
    }

    #[inline]
    fn pad(&self) -> usize {
        if self.config.center {
            self.config.fft_size / 2
        } else {
            0
        }
    }

    /// Analyse `samples` into a `num_bins x frames` complex spectrogram
    pub fn forward(&self, samples: &[f32]) -> Result<Spectrogram, TransformError> {
        let n = self.config.fft_size;
        let hop = self.config.hop_size;
        let pad = self.pad();

        let padded_len = samples.len() + 2 * pad;
        if samples.is_empty() || padded_len < n {
            return Err(TransformError::SignalTooShort {
                len: samples.len(),
                needed: n - 2 * pad,
            });
        }

        let mut padded = vec![0.0f64; padded_len];
        for (dst, &src) in padded[pad..pad + samples.len()].iter_mut().zip(samples) {
            *dst = src as f64;
        }

        let frames = 1 + (padded_len - n) / hop;
        let mut data = Array2::zeros((self.num_bins(), frames));
        let mut buffer = vec![Complex64::new(0.0, 0.0); n];

        for t in 0..frames {
            let frame = &padded[t * hop..t * hop + n];
            for ((slot, &x), &w) in buffer.iter_mut().zip(frame).zip(&self.window) {
                *slot = Complex64::new(x * w, 0.0);
            }
            self.fft_forward.process(&mut buffer);
            for (k, value) in buffer.iter().take(self.num_bins()).enumerate() {
                data[[k, t]] = *value;
            }
        }

        Ok(Spectrogram { data })
    }

    /// Synthesise a waveform of `length` samples from `spectrogram`
    pub fn inverse(&self, spectrogram: &Spectrogram, length: usize) -> Result<Vec<f32>, TransformError> {
        let n = self.config.fft_size;
        let hop = self.config.hop_size;
        let bins = self.num_bins();

        if spectrogram.bins() != bins {
            return Err(TransformError::ShapeMismatch {
                expected: (bins, spectrogram.frames()),
                actual: (spectrogram.bins(), spectrogram.frames()),
            });
        }

        let frames = spectrogram.frames();
        if frames == 0 {
            return Ok(vec![0.0; length]);
        }

        let total = n + hop * (frames - 1);
        let mut output = vec![0.0f64; total];
        let mut window_sum = vec![0.0f64; total];
        let mut buffer = vec![Complex64::new(0.0, 0.0); n];
        let scale = 1.0 / n as f64;

        for t in 0..frames {
            // Hermitian extension of the non-negative bins
            for k in 0..bins {
                buffer[k] = spectrogram.data[[k, t]];
            }
            for k in 1..n - bins + 1 {
                buffer[n - k] = spectrogram.data[[k, t]].conj();
            }
            self.fft_inverse.process(&mut buffer);

            let offset = t * hop;
            for (i, (&w, value)) in self.window.iter().zip(&buffer).enumerate() {
                output[offset + i] += value.re * scale * w;
                window_sum[offset + i] += w * w;
            }
        }

        for (y, &ws) in output.iter_mut().zip(&window_sum) {
            if ws > WINDOW_SUM_FLOOR {
                *y /= ws;
            }
        }

        let start = self.pad();
        Ok((0..length)
            .map(|i| output.get(start + i).copied().unwrap_or(0.0) as f32)
            .collect())
    }
}
