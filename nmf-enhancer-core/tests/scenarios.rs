use ndarray::Array2;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use nmf_enhancer_core::factorizer::initialize;
use nmf_enhancer_core::mixing::mix_at_snr;
use nmf_enhancer_core::prior::Prior;
use nmf_enhancer_core::{
    encode, kl_cost, train, Algorithm, EncodeConfig, EnhancerConfig, SpeechEnhancer, StftConfig, WindowType,
};

fn uniform(rows: usize, cols: usize, seed: u64) -> Array2<f64> {
    let mut rng = SmallRng::seed_from_u64(seed);
    Array2::from_shape_simple_fn((rows, cols), || rng.gen::<f64>())
}

#[test]
fn train_random_matrix_improves_on_initial_pair() {
    let v = uniform(64, 200, 42);
    let seed = 7;

    let (w0, h0) = initialize(64, 200, 8, &mut SmallRng::seed_from_u64(seed));
    let initial_cost = kl_cost(&v, &w0.dot(&h0)).unwrap();

    let fit = train(&v, 20, 1e-3, 8, &mut SmallRng::seed_from_u64(seed)).unwrap();

    assert_eq!(fit.basis.dim(), (64, 8));
    assert_eq!(fit.activations.dim(), (8, 200));
    assert!(fit.basis.iter().all(|&x| x >= 0.0));
    assert!(fit.activations.iter().all(|&x| x >= 0.0));

    let final_cost = kl_cost(&v, &fit.reconstruction()).unwrap();
    assert!(final_cost <= initial_cost, "{} > {}", final_cost, initial_cost);
    assert!((final_cost - fit.report.final_cost).abs() < 1e-9);
}

#[test]
fn train_cost_trends_down_on_low_rank_input() {
    let v = uniform(40, 3, 1).dot(&uniform(3, 120, 2));
    let fit = train(&v, 50, 1e-12, 3, &mut SmallRng::seed_from_u64(3)).unwrap();

    let costs = &fit.report.costs;
    let half = costs.len() / 2;
    let early: f64 = costs[..half].iter().sum::<f64>() / half as f64;
    let late: f64 = costs[half..].iter().sum::<f64>() / (costs.len() - half) as f64;
    assert!(late < early);
}

#[test]
fn plain_encode_converges_on_synthetic_mixture() {
    // Each basis owns a disjoint band of 8 bins
    let mut rng = SmallRng::seed_from_u64(11);
    let w_train = Array2::from_shape_fn((40, 5), |(f, k)| {
        if f / 8 == k {
            0.2 + rng.gen::<f64>()
        } else {
            0.0
        }
    });
    let h_true = uniform(5, 60, 12).mapv(|x| x + 0.1);
    let v = w_train.dot(&h_true);

    let config = EncodeConfig {
        max_iter: 30,
        epsilon: 1e-6,
        penalty: 0.0,
        algorithm: Algorithm::Plain,
    };
    let encoding = encode(&v, &w_train, &h_true, &config, &mut SmallRng::seed_from_u64(13)).unwrap();

    assert!(encoding.report.converged);
    assert!(encoding.report.iterations <= 30);
    assert!(encoding.report.final_cost < config.epsilon);
    for (a, b) in encoding.activations.iter().zip(h_true.iter()) {
        assert!((a - b).abs() < 1e-9);
    }
}

#[test]
fn cost_of_identical_positive_matrices_is_zero() {
    let v = uniform(17, 23, 5).mapv(|x| x + 0.01);
    assert_eq!(kl_cost(&v, &v).unwrap(), 0.0);
}

#[test]
fn exponential_rate_of_constant_row_is_exact() {
    let h_train = Array2::from_elem((3, 64), 0.25);
    match Prior::fit(Algorithm::Exponential, &h_train).unwrap() {
        Prior::Exponential(rates) => {
            assert_eq!(rates.len(), 3);
            assert!(rates.iter().all(|&rate| rate == 4.0));
        }
        other => panic!("unexpected prior {:?}", other),
    }
}

#[test]
fn pipeline_runs_for_every_algorithm() {
    let speech: Vec<f32> = (0..3000)
        .map(|i| 0.4 * (i as f32 * 0.09).sin() * (1.0 + 0.5 * (i as f32 * 0.003).sin()))
        .collect();
    let mut rng = SmallRng::seed_from_u64(21);
    let noise: Vec<f32> = (0..3000).map(|_| rng.gen_range(-0.1f32..0.1)).collect();
    let noisy = mix_at_snr(&speech, &noise, 0.0);

    for algorithm in [Algorithm::Plain, Algorithm::Gamma, Algorithm::Exponential] {
        let config = EnhancerConfig::with_sample_rate(8000)
            .with_stft(StftConfig {
                fft_size: 128,
                win_size: 64,
                hop_size: 16,
                window: WindowType::Hamming,
                center: true,
            })
            .with_basis_counts(6, 6)
            .with_iterations(30, 15)
            .with_algorithm(algorithm, 0.005);

        let mut enhancer = SpeechEnhancer::new(config).unwrap();
        let mut rng = SmallRng::seed_from_u64(22);
        enhancer.train(&speech, &noise, &mut rng).unwrap();

        let output = enhancer.enhance(&noisy, &mut rng).unwrap();
        assert_eq!(output.len(), noisy.len(), "{}", algorithm);
        assert!(output.iter().all(|x| x.is_finite()), "{}", algorithm);
    }
}
