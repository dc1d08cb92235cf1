//! Synthetic label-noise injection.
//!
//! Noise is applied once, when a dataset is built, from a dedicated seeded
//! RNG. The clean label is kept next to the observed one for diagnostics.

use noisy_core::{Error, NoiseProcess, Result};
use rand::distributions::WeightedIndex;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

/// Standard deviation of per-sample flip rates in instance-dependent noise
const INSTANCE_RATE_STD: f64 = 0.1;

/// What a sample looks like to the noise process
pub struct NoiseInput<'a> {
    pub label: usize,
    /// Low-dimensional summary of the input (instance-dependent noise only)
    pub features: Option<&'a [f32]>,
    /// Per-class annotator counts (human-derived noise only)
    pub annotations: Option<&'a [f32]>,
}

/// Seeded label corrupter for one noise process
pub struct LabelNoise {
    process: NoiseProcess,
    num_classes: usize,
    rng: ChaCha8Rng,
}

impl LabelNoise {
    pub fn new(process: NoiseProcess, num_classes: usize, seed: u64) -> Self {
        Self {
            process,
            num_classes,
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    pub fn needs_features(&self) -> bool {
        matches!(self.process, NoiseProcess::InstanceDependent { .. })
    }

    /// Produces one observed label per input.
    pub fn corrupt(&mut self, inputs: &[NoiseInput<'_>]) -> Result<Vec<usize>> {
        if let Some(bad) = inputs.iter().find(|i| i.label >= self.num_classes) {
            return Err(Error::Dataset(format!(
                "label {} out of range for {} classes",
                bad.label, self.num_classes
            )));
        }

        match self.process {
            NoiseProcess::None => Ok(inputs.iter().map(|i| i.label).collect()),
            NoiseProcess::Symmetric { rate } => Ok(inputs
                .iter()
                .map(|i| self.symmetric_flip(i.label, rate))
                .collect()),
            NoiseProcess::InstanceDependent { rate } => self.instance_dependent(inputs, rate),
            NoiseProcess::HumanDerived { temperature } => inputs
                .iter()
                .enumerate()
                .map(|(n, i)| self.human_derived(n, i.annotations, temperature))
                .collect(),
        }
    }

    fn symmetric_flip(&mut self, label: usize, rate: f64) -> usize {
        if self.num_classes < 2 || !self.rng.gen_bool(rate.clamp(0.0, 1.0)) {
            return label;
        }
        // Uniform over the other classes.
        let offset = self.rng.gen_range(1..self.num_classes);
        (label + offset) % self.num_classes
    }

    /// Per-sample flip probability q ~ N(rate, 0.1²) clipped to [0, 1]; the
    /// flip target follows a softmax over seeded random projections of the
    /// sample's features, with the clean class excluded.
    fn instance_dependent(&mut self, inputs: &[NoiseInput<'_>], rate: f64) -> Result<Vec<usize>> {
        let dim = match inputs.first().and_then(|i| i.features) {
            Some(features) => features.len(),
            None if inputs.is_empty() => return Ok(Vec::new()),
            None => {
                return Err(Error::Dataset(
                    "instance-dependent noise needs per-sample features".to_string(),
                ))
            }
        };

        let k = self.num_classes;
        let weight_dist = Normal::new(0.0f32, 1.0)
            .map_err(|e| Error::Dataset(format!("invalid projection distribution: {e}")))?;
        // projections[true_class][feature][target_class]
        let projections: Vec<f32> = (0..k * dim * k)
            .map(|_| weight_dist.sample(&mut self.rng))
            .collect();
        let rate_dist = Normal::new(rate, INSTANCE_RATE_STD)
            .map_err(|e| Error::Dataset(format!("invalid flip-rate distribution: {e}")))?;

        let mut observed = Vec::with_capacity(inputs.len());
        for (n, input) in inputs.iter().enumerate() {
            let features = input.features.filter(|f| f.len() == dim).ok_or_else(|| {
                Error::Dataset(format!("sample {n}: missing or mis-sized features"))
            })?;
            let q = rate_dist.sample(&mut self.rng).clamp(0.0, 1.0);
            let y = input.label;

            let mut logits = vec![f32::NEG_INFINITY; k];
            for (target, logit) in logits.iter_mut().enumerate() {
                if target == y {
                    continue;
                }
                *logit = features
                    .iter()
                    .enumerate()
                    .map(|(d, x)| x * projections[(y * dim + d) * k + target])
                    .sum();
            }
            let max = logits.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
            let exp: Vec<f64> = logits.iter().map(|z| ((z - max) as f64).exp()).collect();
            let total: f64 = exp.iter().sum();

            let mut probs: Vec<f64> = exp.iter().map(|e| q * e / total).collect();
            probs[y] = 1.0 - q;
            observed.push(self.sample_class(&probs, n)?);
        }
        Ok(observed)
    }

    /// Samples from annotator counts raised to `1 / temperature`.
    fn human_derived(
        &mut self,
        sample: usize,
        annotations: Option<&[f32]>,
        temperature: f64,
    ) -> Result<usize> {
        let counts = annotations.ok_or_else(|| {
            Error::Dataset(format!(
                "sample {sample}: human-derived noise needs an annotations column"
            ))
        })?;
        if counts.len() != self.num_classes {
            return Err(Error::Dataset(format!(
                "sample {sample}: {} annotation counts for {} classes",
                counts.len(),
                self.num_classes
            )));
        }
        let weights: Vec<f64> = counts
            .iter()
            .map(|c| (*c as f64).max(0.0).powf(1.0 / temperature))
            .collect();
        self.sample_class(&weights, sample)
    }

    fn sample_class(&mut self, weights: &[f64], sample: usize) -> Result<usize> {
        let dist = WeightedIndex::new(weights).map_err(|e| {
            Error::Dataset(format!("sample {sample}: cannot sample label ({e})"))
        })?;
        Ok(dist.sample(&mut self.rng))
    }
}

/// Fraction of samples whose observed label differs from the clean one
pub fn realised_noise_rate(observed: &[usize], clean: &[usize]) -> f64 {
    if observed.is_empty() {
        return 0.0;
    }
    let flipped = observed
        .iter()
        .zip(clean)
        .filter(|(o, c)| o != c)
        .count();
    flipped as f64 / observed.len() as f64
}
