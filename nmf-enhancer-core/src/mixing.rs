//! Waveform level matching and mixing
//!
//! Training noise is rescaled to the loudness of the training speech before
//! the two are factorised together, and test mixtures are built at a given
//! signal-to-noise ratio.

fn energy(samples: &[f32]) -> f64 {
    samples.iter().map(|&x| (x as f64) * (x as f64)).sum()
}

/// Root mean square level, 0 for an empty slice
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    (energy(samples) / samples.len() as f64).sqrt() as f32
}

/// Scale `target` so that its RMS matches `reference`.
/// A silent `target` is returned unchanged.
pub fn equalize_rms(reference: &[f32], target: &[f32]) -> Vec<f32> {
    let target_rms = rms(target) as f64;
    if target_rms <= 0.0 {
        return target.to_vec();
    }
    let gain = rms(reference) as f64 / target_rms;
    target.iter().map(|&x| (x as f64 * gain) as f32).collect()
}

/// Add `noise` to `speech` at `snr_db`. Both are truncated to the shorter
/// length first; silent noise yields the truncated speech.
pub fn mix_at_snr(speech: &[f32], noise: &[f32], snr_db: f64) -> Vec<f32> {
    let len = speech.len().min(noise.len());
    let (speech, noise) = (&speech[..len], &noise[..len]);

    let noise_energy = energy(noise);
    if noise_energy <= 0.0 {
        return speech.to_vec();
    }
    let gain = (energy(speech) / (noise_energy * 10f64.powf(snr_db * 0.1))).sqrt();

    speech
        .iter()
        .zip(noise)
        .map(|(&s, &n)| (s as f64 + gain * n as f64) as f32)
        .collect()
}
