//! NMF-based single-channel speech enhancement
//!
//! A magnitude spectrogram is modelled as `V ~= W H` with non-negative
//! factors. A basis `W` is trained on clean speech and noise, activations
//! for noisy input are inferred against it (optionally regularised by a
//! gamma or exponential prior fitted to the training activations), and a
//! Wiener-style mask built from the speech and noise parts of the model is
//! applied to the noisy spectrogram.

use log::{info, warn};
use rand::rngs::SmallRng;
use rand::SeedableRng;
use wasm_bindgen::prelude::*;

/// Error types
pub mod error;
/// Epsilon floor, random initialisation and input checks
pub mod utils;
/// KL cost and the iteration driver
pub mod convergence;
/// Basis training
pub mod factorizer;
/// Per-basis activation priors
pub mod prior;
/// Activation inference against a fixed basis
pub mod encoder;
/// Wiener-style masking
pub mod reconstructor;
/// Short-time Fourier transform
pub mod stft;
/// Level matching and mixing of waveforms
pub mod mixing;
/// Train/enhance orchestration
pub mod pipeline;

pub use convergence::{kl_cost, ConvergenceMonitor, FitReport};
pub use encoder::{encode, Algorithm, EncodeConfig, Encoding, RegularizedEncoder};
pub use error::{EnhanceError, Result};
pub use factorizer::{train, BasisFactorizer, Factorization, TrainConfig};
pub use pipeline::{EnhancerConfig, SpeechEnhancer, TrainedModel};
pub use reconstructor::{reconstruct, wiener_gain};
pub use stft::{SpectralTransform, Spectrogram, StftConfig, WindowType};

/// WebAssembly-compatible speech enhancer
/// Learns a speech/noise model from example recordings and denoises with it
#[wasm_bindgen]
pub struct NmfDenoiser {
    sample_rate: u32,
    enhancer: SpeechEnhancer,
    rng: SmallRng,
    bypass: bool,
}

#[wasm_bindgen]
impl NmfDenoiser {
    /// Creates an untrained denoiser with default settings
    #[wasm_bindgen(constructor)]
    pub fn new(sample_rate: u32) -> std::result::Result<NmfDenoiser, JsValue> {
        Self::with_config(EnhancerConfig::with_sample_rate(sample_rate))
            .map_err(|e| JsValue::from_str(&e.to_string()))
    }

    /// Trains the model on clean speech and noise-only recordings.
    /// Returns false if training failed; the previous model stays active.
    #[wasm_bindgen]
    pub fn learn(&mut self, speech: &[f32], noise: &[f32]) -> bool {
        match self.enhancer.train(speech, noise, &mut self.rng) {
            Ok(model) => {
                info!(
                    "model trained: {} bases, cost {}",
                    model.num_basis(),
                    model.report.final_cost
                );
                true
            }
            Err(e) => {
                warn!("training failed: {}", e);
                false
            }
        }
    }

    /// Processes an audio buffer and returns the enhanced output.
    /// Input passes through unchanged when bypassed, untrained or on error.
    #[wasm_bindgen]
    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        if self.bypass || !self.enhancer.is_trained() {
            return input.to_vec();
        }

        match self.enhancer.enhance(input, &mut self.rng) {
            Ok(output) => output,
            Err(e) => {
                warn!("enhancement failed, passing input through: {}", e);
                input.to_vec()
            }
        }
    }

    /// Selects the encoder regime by name (plain, gamma, exponential)
    #[wasm_bindgen]
    pub fn set_algorithm(&mut self, name: &str) -> bool {
        let algorithm = match name.parse::<Algorithm>() {
            Ok(algorithm) => algorithm,
            Err(e) => {
                warn!("{}", e);
                return false;
            }
        };
        let mut encode = self.enhancer.config().encode.clone();
        encode.algorithm = algorithm;
        self.apply_encode(encode)
    }

    /// Sets the regularisation weight of the prior
    #[wasm_bindgen]
    pub fn set_penalty(&mut self, penalty: f64) -> bool {
        let mut encode = self.enhancer.config().encode.clone();
        encode.penalty = penalty;
        self.apply_encode(encode)
    }

    /// Enables or disables bypass mode
    #[wasm_bindgen]
    pub fn set_bypass(&mut self, bypass: bool) {
        self.bypass = bypass;
    }

    /// Restarts the random source so processing is reproducible
    #[wasm_bindgen]
    pub fn reset(&mut self) {
        self.rng = SmallRng::seed_from_u64(self.enhancer.config().seed);
    }

    /// Whether a model has been learned
    #[wasm_bindgen(getter)]
    pub fn trained(&self) -> bool {
        self.enhancer.is_trained()
    }

    /// Name of the active encoder regime
    #[wasm_bindgen(getter)]
    pub fn algorithm(&self) -> String {
        self.enhancer.config().encode.algorithm.to_string()
    }

    /// Returns the FFT size used for processing
    #[wasm_bindgen(getter)]
    pub fn fft_size(&self) -> usize {
        self.enhancer.config().stft.fft_size
    }

    /// Returns the current sample rate
    #[wasm_bindgen(getter)]
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

impl NmfDenoiser {
    /// Creates an untrained denoiser from a full configuration
    pub fn with_config(config: EnhancerConfig) -> Result<Self> {
        let sample_rate = config.sample_rate;
        let rng = SmallRng::seed_from_u64(config.seed);
        let enhancer = SpeechEnhancer::new(config)?;

        Ok(NmfDenoiser {
            sample_rate,
            enhancer,
            rng,
            bypass: false,
        })
    }

    fn apply_encode(&mut self, encode: EncodeConfig) -> bool {
        match self.enhancer.set_encode_config(encode) {
            Ok(()) => true,
            Err(e) => {
                warn!("encoder settings rejected: {}", e);
                false
            }
        }
    }
}
