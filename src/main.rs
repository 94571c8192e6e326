use std::{env, fs, sync::Arc};

use anyhow::Context;
use log::info;
use parking_lot::RwLock;
use rand::{Rng, SeedableRng, rngs::StdRng};

use sphere_hierarchy::{
    Averaging, EpochDriver, Hierarchy, HierarchySpec, Optimizer, ProcessErr, Trainer, Tuning,
    training::IndexSource,
};

const FEATURES: usize = 16;
const SAMPLES: usize = 8192;
const BATCH_SIZE: usize = 32;
const DEFAULT_EPOCHS: usize = 20;
const DEFAULT_LEARNING_RATE: f32 = 0.05;
const SEED: u64 = 42;

/// Mean squared error of a linear model over a synthetic dataset.
struct LinearRegression {
    xs: Vec<f32>,
    ys: Vec<f32>,
    weights: Arc<RwLock<Vec<f32>>>,
}

impl LinearRegression {
    fn synthetic(rng: &mut StdRng, weights: Arc<RwLock<Vec<f32>>>) -> Self {
        let truth: Vec<f32> = (0..=FEATURES).map(|_| rng.random_range(-1.0..1.0)).collect();
        let xs: Vec<f32> = (0..SAMPLES * FEATURES)
            .map(|_| rng.random_range(-1.0..1.0))
            .collect();

        let ys = xs
            .chunks_exact(FEATURES)
            .map(|x| {
                let noise: f32 = rng.random_range(-0.01..0.01);
                dot(&truth[..FEATURES], x) + truth[FEATURES] + noise
            })
            .collect();

        Self { xs, ys, weights }
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(a, b)| a * b).sum()
}

impl Trainer for LinearRegression {
    type Item = usize;

    fn process(&self, batch: &usize, grads: &mut [f32]) -> Result<f32, ProcessErr> {
        let start = batch * BATCH_SIZE;
        let end = (start + BATCH_SIZE).min(self.ys.len());
        if start >= end {
            return Err(ProcessErr::new(format!("batch {batch} is out of range")));
        }

        let weights = self.weights.read();
        let scale = 1. / (end - start) as f32;
        let mut loss = 0.;

        for (x, y) in self.xs[start * FEATURES..end * FEATURES]
            .chunks_exact(FEATURES)
            .zip(&self.ys[start..end])
        {
            let err = dot(&weights[..FEATURES], x) + weights[FEATURES] - y;
            loss += err * err * scale;

            for (g, xi) in grads.iter_mut().zip(x) {
                *g += 2. * err * xi * scale;
            }
            grads[FEATURES] += 2. * err * scale;
        }

        Ok(loss)
    }
}

/// Plain gradient descent over the weights shared with the trainer.
struct Sgd {
    weights: Arc<RwLock<Vec<f32>>>,
    learning_rate: f32,
}

impl Optimizer for Sgd {
    fn step(&mut self, grads: &[f32]) {
        let mut weights = self.weights.write();
        for (w, g) in weights.iter_mut().zip(grads) {
            *w -= self.learning_rate * g;
        }
    }
}

fn load_spec() -> anyhow::Result<HierarchySpec> {
    let Some(path) = env::args().nth(1) else {
        let tuning = Tuning {
            averaging: Averaging::Items,
            ..Tuning::default()
        };

        return Ok(HierarchySpec::for_host(FEATURES + 1).with_tuning(tuning));
    };

    let raw =
        fs::read_to_string(&path).with_context(|| format!("failed to read spec file {path}"))?;
    let spec: HierarchySpec =
        serde_json::from_str(&raw).with_context(|| format!("invalid spec file {path}"))?;

    anyhow::ensure!(
        spec.gradient_size == FEATURES + 1,
        "the demo model has {} parameters, spec asks for {}",
        FEATURES + 1,
        spec.gradient_size
    );

    Ok(spec)
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(value) => value.parse().with_context(|| format!("invalid {key}: {value}")),
        Err(_) => Ok(default),
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::init();

    let spec = load_spec()?;
    let epochs = env_or("EPOCHS", DEFAULT_EPOCHS)?;
    let learning_rate = env_or("LEARNING_RATE", DEFAULT_LEARNING_RATE)?;

    let mut rng = StdRng::seed_from_u64(SEED);
    let weights = Arc::new(RwLock::new(vec![0.; FEATURES + 1]));
    let trainer = LinearRegression::synthetic(&mut rng, Arc::clone(&weights));

    let mut hierarchy = Hierarchy::create(spec, trainer)?;
    let source = IndexSource::new(SAMPLES.div_ceil(BATCH_SIZE));
    let optimizer = Sgd {
        weights: Arc::clone(&weights),
        learning_rate,
    };
    let mut driver = EpochDriver::new(source, optimizer).with_clip_norm(10.);

    hierarchy.start()?;
    for _ in 0..epochs {
        driver.run_epoch(&mut hierarchy)?;
    }
    hierarchy.stop()?;

    hierarchy.log_stats();
    info!("learned weights {:?}", weights.read());
    println!("{}", serde_json::to_string_pretty(&hierarchy.stats())?);

    Ok(())
}
