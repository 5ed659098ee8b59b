//! Speech enhancement pipeline
//!
//! Training factorises the joint magnitude spectrogram `[V_speech | V_noise]`
//! into `num_basis_speech + num_basis_noise` bases. Enhancement infers
//! activations for a noisy spectrogram against that fixed basis, applies the
//! Wiener-style mask and resynthesises with the noisy phase.

use std::sync::Arc;

use log::{debug, info};
use ndarray::{concatenate, Array2, Axis};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::convergence::FitReport;
use crate::encoder::{Algorithm, EncodeConfig, RegularizedEncoder};
use crate::error::{EnhanceError, Result};
use crate::factorizer::{BasisFactorizer, TrainConfig};
use crate::mixing::equalize_rms;
use crate::reconstructor::{reconstruct, DEFAULT_WIENER_POWER};
use crate::stft::{SpectralTransform, Spectrogram, StftConfig};

// ============================================================================
// Constants
// ============================================================================

/// Default sample rate in Hz
pub const DEFAULT_SAMPLE_RATE: u32 = 16_000;

/// Default number of speech bases
pub const DEFAULT_NUM_BASIS_SPEECH: usize = 128;

/// Default number of noise bases
pub const DEFAULT_NUM_BASIS_NOISE: usize = 128;

/// Default seed for hosts that do not supply a random source
pub const DEFAULT_SEED: u64 = 12345;

// ============================================================================
// Configuration
// ============================================================================

/// Configuration of the full train/enhance pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnhancerConfig {
    /// Sample rate of every waveform passed in, Hz
    pub sample_rate: u32,

    /// Spectral transform
    pub stft: StftConfig,

    /// Basis training; `num_basis` must equal speech + noise bases
    pub train: TrainConfig,

    /// Activation inference for noisy input
    pub encode: EncodeConfig,

    /// Leading basis columns that model speech
    pub num_basis_speech: usize,

    /// Trailing basis columns that model noise
    pub num_basis_noise: usize,

    /// Exponent of the Wiener gain
    pub wiener_power: u32,

    /// Rescale training noise to the RMS of the training speech
    pub equalize_noise: bool,

    /// Base seed for batch enhancement
    pub seed: u64,
}

impl Default for EnhancerConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            stft: StftConfig::default(),
            train: TrainConfig {
                num_basis: DEFAULT_NUM_BASIS_SPEECH + DEFAULT_NUM_BASIS_NOISE,
                ..TrainConfig::default()
            },
            encode: EncodeConfig::default(),
            num_basis_speech: DEFAULT_NUM_BASIS_SPEECH,
            num_basis_noise: DEFAULT_NUM_BASIS_NOISE,
            wiener_power: DEFAULT_WIENER_POWER,
            equalize_noise: true,
            seed: DEFAULT_SEED,
        }
    }
}

impl EnhancerConfig {
    /// Create config with specific sample rate
    pub fn with_sample_rate(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            ..Self::default()
        }
    }

    /// Builder method for the spectral transform
    pub fn with_stft(mut self, stft: StftConfig) -> Self {
        self.stft = stft;
        self
    }

    /// Builder method for basis counts, keeps the training size in step
    pub fn with_basis_counts(mut self, speech: usize, noise: usize) -> Self {
        self.num_basis_speech = speech;
        self.num_basis_noise = noise;
        self.train.num_basis = speech + noise;
        self
    }

    /// Builder method for iteration bounds
    pub fn with_iterations(mut self, train: usize, test: usize) -> Self {
        self.train.max_iter = train;
        self.encode.max_iter = test;
        self
    }

    /// Builder method for the convergence threshold of both stages
    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.train.epsilon = epsilon;
        self.encode.epsilon = epsilon;
        self
    }

    /// Builder method for the encoder regime and its weight
    pub fn with_algorithm(mut self, algorithm: Algorithm, penalty: f64) -> Self {
        self.encode.algorithm = algorithm;
        self.encode.penalty = penalty;
        self
    }

    /// Builder method for the Wiener exponent
    pub fn with_wiener_power(mut self, p: u32) -> Self {
        self.wiener_power = p;
        self
    }

    /// Builder method for the batch seed
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(EnhanceError::InvalidConfiguration(
                "sample_rate must be positive".to_string(),
            ));
        }

        self.stft.validate()?;
        self.train.validate()?;
        self.encode.validate()?;

        if self.num_basis_speech == 0 || self.num_basis_noise == 0 {
            return Err(EnhanceError::InvalidConfiguration(format!(
                "basis counts must be positive, got {} speech and {} noise",
                self.num_basis_speech, self.num_basis_noise
            )));
        }

        if self.train.num_basis != self.num_basis_speech + self.num_basis_noise {
            return Err(EnhanceError::InvalidConfiguration(format!(
                "train.num_basis {} must equal {} speech + {} noise bases",
                self.train.num_basis, self.num_basis_speech, self.num_basis_noise
            )));
        }

        if self.wiener_power == 0 {
            return Err(EnhanceError::InvalidConfiguration(
                "wiener_power must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

// ============================================================================
// Trained Model
// ============================================================================

/// Basis and training activations learned from speech and noise
#[derive(Debug, Clone, PartialEq)]
pub struct TrainedModel {
    /// W_train, F x K, speech columns first
    pub basis: Arc<Array2<f64>>,

    /// H_train, K x (T_speech + T_noise)
    pub activations: Array2<f64>,

    /// Convergence trace of training
    pub report: FitReport,
}

impl TrainedModel {
    #[inline]
    pub fn num_basis(&self) -> usize {
        self.basis.ncols()
    }
}

// ============================================================================
// Speech Enhancer
// ============================================================================

/// Trains a speech/noise basis and enhances noisy recordings with it
#[derive(Debug)]
pub struct SpeechEnhancer {
    config: EnhancerConfig,
    transform: SpectralTransform,
    model: Option<TrainedModel>,
    encoder: Option<RegularizedEncoder>,
}

impl SpeechEnhancer {
    /// Create an untrained enhancer
    pub fn new(config: EnhancerConfig) -> Result<Self> {
        config.validate()?;
        let transform = SpectralTransform::new(config.stft.clone())?;
        Ok(Self {
            config,
            transform,
            model: None,
            encoder: None,
        })
    }

    pub fn config(&self) -> &EnhancerConfig {
        &self.config
    }

    pub fn model(&self) -> Option<&TrainedModel> {
        self.model.as_ref()
    }

    #[inline]
    pub fn is_trained(&self) -> bool {
        self.encoder.is_some()
    }

    /// Magnitude spectrogram of a waveform
    pub fn magnitude(&self, samples: &[f32]) -> Result<Array2<f64>> {
        Ok(self.transform.forward(samples)?.magnitude())
    }

    /// Learn the joint basis from clean speech and noise recordings
    pub fn train<R: Rng + ?Sized>(
        &mut self,
        speech: &[f32],
        noise: &[f32],
        rng: &mut R,
    ) -> Result<&TrainedModel> {
        let noise = if self.config.equalize_noise {
            equalize_rms(speech, noise)
        } else {
            noise.to_vec()
        };

        let v_speech = self.magnitude(speech)?;
        let v_noise = self.magnitude(&noise)?;
        let v = concatenate(Axis(1), &[v_speech.view(), v_noise.view()]).map_err(|_| {
            EnhanceError::DimensionMismatch {
                what: "frequency bins",
                expected: v_speech.nrows(),
                actual: v_noise.nrows(),
            }
        })?;

        info!(
            "[Start] training on {} speech + {} noise frames",
            v_speech.ncols(),
            v_noise.ncols()
        );

        let factorization = BasisFactorizer::new(self.config.train.clone())?.train(&v, rng)?;
        let basis = Arc::new(factorization.basis);
        let encoder = RegularizedEncoder::new(
            Arc::clone(&basis),
            &factorization.activations,
            self.config.encode.clone(),
        )?;

        info!("[End] training: {} bases", basis.ncols());

        self.encoder = Some(encoder);
        Ok(self.model.insert(TrainedModel {
            basis,
            activations: factorization.activations,
            report: factorization.report,
        }))
    }

    /// Replace the encoder configuration, refitting the prior against the
    /// trained model. The previous configuration stays in place on error.
    pub fn set_encode_config(&mut self, encode: EncodeConfig) -> Result<()> {
        encode.validate()?;
        if let Some(model) = &self.model {
            let encoder = RegularizedEncoder::new(Arc::clone(&model.basis), &model.activations, encode.clone())?;
            self.encoder = Some(encoder);
        }
        self.config.encode = encode;
        Ok(())
    }

    /// Enhanced magnitude spectrogram for a noisy magnitude spectrogram
    pub fn enhance_magnitude<R: Rng + ?Sized>(&self, noisy: &Array2<f64>, rng: &mut R) -> Result<Array2<f64>> {
        let encoder = self.encoder.as_ref().ok_or(EnhanceError::NotTrained)?;
        let encoding = encoder.encode(noisy, rng)?;
        reconstruct(
            noisy,
            encoder.basis(),
            &encoding.activations,
            self.config.num_basis_speech,
            self.config.wiener_power,
        )
    }

    /// Enhance a noisy waveform; the output has the input's length
    pub fn enhance<R: Rng + ?Sized>(&self, noisy: &[f32], rng: &mut R) -> Result<Vec<f32>> {
        if !self.is_trained() {
            return Err(EnhanceError::NotTrained);
        }

        let spectrogram = self.transform.forward(noisy)?;
        let enhanced = self.enhance_magnitude(&spectrogram.magnitude(), rng)?;
        let output = Spectrogram::from_magnitude_phase(&enhanced, &spectrogram.phase())?;

        debug!("enhanced {} samples ({} frames)", noisy.len(), spectrogram.frames());
        Ok(self.transform.inverse(&output, noisy.len())?)
    }

    /// Enhance independent recordings in parallel. Recording `i` is
    /// initialised from `SmallRng::seed_from_u64(seed + i)`.
    pub fn enhance_batch(&self, inputs: &[Vec<f32>]) -> Vec<Result<Vec<f32>>> {
        let seed = self.config.seed;
        inputs
            .par_iter()
            .enumerate()
            .map(|(i, noisy)| {
                let mut rng = SmallRng::seed_from_u64(seed.wrapping_add(i as u64));
                self.enhance(noisy, &mut rng)
            })
            .collect()
    }
}
