//! Noisy-label dataset: immutable samples with observed and clean labels.

use std::path::PathBuf;
use std::sync::Arc;

use burn::data::dataset::Dataset;
use image::{DynamicImage, ImageBuffer, Rgb};
use noisy_core::{
    AugmentationConfig, DatasetSource, Error, ImageDimensions, NoiseProcess, Result,
    TrainingRunConfig,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{info, warn};

use crate::augmentation::AugmentationPipeline;
use crate::loader::{read_manifest, ImageLoader, ManifestEntry};
use crate::noise::{realised_noise_rate, LabelNoise, NoiseInput};

/// Side of the pooled grid used as instance-dependent noise features
const NOISE_FEATURE_GRID: usize = 4;

/// One training sample as seen by a training step
#[derive(Clone, Debug)]
pub struct NoisySample {
    /// Position in the dataset, stable for the whole run
    pub index: usize,
    /// Image data as flattened CHW float array
    pub image: Vec<f32>,
    /// Label used by the training objective
    pub observed_label: usize,
    /// Clean label, for diagnostics only
    pub true_label: Option<usize>,
}

impl NoisySample {
    /// `Some(true)` when the observed label is known to be wrong
    pub fn is_noisy(&self) -> Option<bool> {
        self.true_label.map(|t| t != self.observed_label)
    }
}

/// Where a sample's pixels come from
#[derive(Clone, Debug)]
pub enum SampleInput {
    File(PathBuf),
    Image(Arc<DynamicImage>),
}

/// A sample after noise injection; never modified afterwards
#[derive(Clone, Debug)]
pub struct DatasetEntry {
    pub input: SampleInput,
    pub observed_label: usize,
    pub true_label: Option<usize>,
}

/// Indexable source of samples, one augmented view per (index, epoch)
pub trait SampleSource: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn num_classes(&self) -> usize;

    fn sample(&self, index: usize, epoch: usize) -> Result<NoisySample>;
}

/// Image dataset with optional synthetic label noise
pub struct NoisyLabelDataset {
    entries: Vec<DatasetEntry>,
    loader: ImageLoader,
    pipeline: AugmentationPipeline,
    num_classes: usize,
    seed: u64,
}

impl NoisyLabelDataset {
    /// Builds the training dataset described by a run configuration.
    pub fn from_config(config: &TrainingRunConfig) -> Result<Self> {
        let dataset_config = &config.dataset;
        let dims = dataset_config.image_size;
        let num_classes = config.model.num_classes;
        let pipeline = AugmentationPipeline::new(config.augmentation.clone(), dims);

        let (root, raw) = match &dataset_config.source {
            DatasetSource::Csv {
                manifest,
                root_dir,
                split,
            } => {
                let root = root_dir.clone().unwrap_or_else(|| {
                    manifest.parent().map(PathBuf::from).unwrap_or_default()
                });
                (root, read_manifest(manifest, *split)?)
            }
            DatasetSource::Folder { root_dir } => {
                let loader = ImageLoader::new(root_dir.clone());
                let (classes, entries) = loader.scan_class_folders()?;
                if classes.len() != num_classes {
                    return Err(Error::Dataset(format!(
                        "found {} class folders but model expects {} classes",
                        classes.len(),
                        num_classes
                    )));
                }
                (root_dir.clone(), entries)
            }
            DatasetSource::Synthetic { num_samples } => {
                return Self::synthetic(
                    *num_samples,
                    num_classes,
                    dims,
                    dataset_config.noise,
                    config.augmentation.clone(),
                    config.seed,
                );
            }
        };

        Self::from_manifest(
            raw,
            ImageLoader::new(root),
            pipeline,
            num_classes,
            dataset_config.noise,
            config.seed,
        )
    }

    /// Builds a dataset from manifest rows, applying `noise` to the given labels.
    pub fn from_manifest(
        raw: Vec<ManifestEntry>,
        loader: ImageLoader,
        pipeline: AugmentationPipeline,
        num_classes: usize,
        noise: NoiseProcess,
        seed: u64,
    ) -> Result<Self> {
        if raw.is_empty() {
            return Err(Error::Dataset("dataset has no samples".to_string()));
        }

        let features = if matches!(noise, NoiseProcess::InstanceDependent { .. }) {
            let eval = AugmentationPipeline::evaluation(pipeline.dims());
            let mut features = Vec::with_capacity(raw.len());
            for entry in &raw {
                let img = loader.load_image(&entry.path)?;
                let data = eval.apply(img, &mut AugmentationPipeline::sample_rng(seed, 0, 0));
                features.push(pooled_features(&data, pipeline.dims()));
            }
            Some(features)
        } else {
            None
        };

        let labels: Vec<usize> = raw.iter().map(|e| e.label).collect();
        let observed = corrupt_labels(
            &labels,
            features.as_deref(),
            &raw.iter().map(|e| e.annotations.as_deref()).collect::<Vec<_>>(),
            noise,
            num_classes,
            seed,
        )?;

        let entries = raw
            .into_iter()
            .zip(observed)
            .map(|(entry, observed_label)| {
                let true_label = match noise {
                    // The manifest label is the clean one; noise comes from us.
                    NoiseProcess::None => entry.true_label,
                    _ => Some(entry.label),
                };
                DatasetEntry {
                    input: SampleInput::File(entry.path),
                    observed_label,
                    true_label,
                }
            })
            .collect();

        let dataset = Self {
            entries,
            loader,
            pipeline,
            num_classes,
            seed,
        };
        dataset.log_summary(noise);
        Ok(dataset)
    }

    /// Seeded class-conditional images: a class colour plus a class-specific
    /// stripe period, blurred by per-pixel jitter.
    pub fn synthetic(
        num_samples: usize,
        num_classes: usize,
        dims: ImageDimensions,
        noise: NoiseProcess,
        augmentation: AugmentationConfig,
        seed: u64,
    ) -> Result<Self> {
        if num_samples == 0 || num_classes == 0 {
            return Err(Error::Dataset("synthetic dataset needs samples and classes".to_string()));
        }

        let mut rng = ChaCha8Rng::seed_from_u64(seed ^ 0x5EED_DA7A);
        let (w, h) = (dims.width as u32, dims.height as u32);
        let mut images = Vec::with_capacity(num_samples);
        let mut labels = Vec::with_capacity(num_samples);

        for i in 0..num_samples {
            let label = i % num_classes;
            let hue = label as f32 / num_classes as f32;
            let base = [
                128.0 + 100.0 * (hue * std::f32::consts::TAU).cos(),
                128.0 + 100.0 * (hue * std::f32::consts::TAU + 2.1).cos(),
                128.0 + 100.0 * (hue * std::f32::consts::TAU + 4.2).cos(),
            ];
            let period = 2 + label as u32 % 4;
            let pixels: Vec<u8> = (0..w * h)
                .flat_map(|p| {
                    let stripe = if (p % w / period) % 2 == 0 { 20.0 } else { -20.0 };
                    base.map(|b| (b + stripe + rng.gen_range(-25.0f32..25.0)).clamp(0.0, 255.0) as u8)
                })
                .collect();
            let img = ImageBuffer::<Rgb<u8>, _>::from_raw(w, h, pixels)
                .ok_or_else(|| Error::Image("synthetic buffer size mismatch".to_string()))?;
            images.push(DynamicImage::ImageRgb8(img));
            labels.push(label);
        }

        let pipeline = AugmentationPipeline::new(augmentation, dims);
        let features = if matches!(noise, NoiseProcess::InstanceDependent { .. }) {
            let eval = AugmentationPipeline::evaluation(dims);
            Some(
                images
                    .iter()
                    .map(|img| {
                        let data = eval.apply(img.clone(), &mut AugmentationPipeline::sample_rng(seed, 0, 0));
                        pooled_features(&data, dims)
                    })
                    .collect::<Vec<_>>(),
            )
        } else {
            None
        };
        let observed = corrupt_labels(
            &labels,
            features.as_deref(),
            &vec![None; labels.len()],
            noise,
            num_classes,
            seed,
        )?;

        let entries = images
            .into_iter()
            .zip(labels.into_iter().zip(observed))
            .map(|(img, (label, observed_label))| DatasetEntry {
                input: SampleInput::Image(Arc::new(img)),
                observed_label,
                true_label: Some(label),
            })
            .collect();

        let dataset = Self {
            entries,
            loader: ImageLoader::new(PathBuf::new()),
            pipeline,
            num_classes,
            seed,
        };
        dataset.log_summary(noise);
        Ok(dataset)
    }

    pub fn entries(&self) -> &[DatasetEntry] {
        &self.entries
    }

    pub fn observed_labels(&self) -> Vec<usize> {
        self.entries.iter().map(|e| e.observed_label).collect()
    }

    /// Clean labels, when every entry has one
    pub fn true_labels(&self) -> Option<Vec<usize>> {
        self.entries.iter().map(|e| e.true_label).collect()
    }

    fn log_summary(&self, noise: NoiseProcess) {
        let observed = self.observed_labels();
        match self.true_labels() {
            Some(clean) => info!(
                "Dataset: {} samples, {} classes, noise {} (realised rate {:.3})",
                self.entries.len(),
                self.num_classes,
                noise,
                realised_noise_rate(&observed, &clean)
            ),
            None => info!(
                "Dataset: {} samples, {} classes, noise {}",
                self.entries.len(),
                self.num_classes,
                noise
            ),
        }
    }

    fn load_entry_image(&self, entry: &DatasetEntry) -> Result<DynamicImage> {
        match &entry.input {
            SampleInput::File(path) => self.loader.load_image(path),
            SampleInput::Image(img) => Ok(img.as_ref().clone()),
        }
    }
}

impl SampleSource for NoisyLabelDataset {
    fn len(&self) -> usize {
        self.entries.len()
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }

    fn sample(&self, index: usize, epoch: usize) -> Result<NoisySample> {
        let entry = self.entries.get(index).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "sample index {index} out of range ({} samples)",
                self.entries.len()
            ))
        })?;
        let img = self.load_entry_image(entry)?;
        let mut rng = AugmentationPipeline::sample_rng(self.seed, epoch, index);

        Ok(NoisySample {
            index,
            image: self.pipeline.apply(img, &mut rng),
            observed_label: entry.observed_label,
            true_label: entry.true_label,
        })
    }
}

impl Dataset<NoisySample> for NoisyLabelDataset {
    fn get(&self, index: usize) -> Option<NoisySample> {
        if index >= self.entries.len() {
            return None;
        }
        match self.sample(index, 0) {
            Ok(sample) => Some(sample),
            Err(e) => {
                warn!("Failed to load sample {}: {}", index, e);
                None
            }
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

fn corrupt_labels(
    labels: &[usize],
    features: Option<&[Vec<f32>]>,
    annotations: &[Option<&[f32]>],
    noise: NoiseProcess,
    num_classes: usize,
    seed: u64,
) -> Result<Vec<usize>> {
    let inputs: Vec<NoiseInput<'_>> = labels
        .iter()
        .enumerate()
        .map(|(i, &label)| NoiseInput {
            label,
            features: features.map(|f| f[i].as_slice()),
            annotations: annotations.get(i).copied().flatten(),
        })
        .collect();
    LabelNoise::new(noise, num_classes, seed).corrupt(&inputs)
}

/// Average-pools each channel of a CHW image onto a small grid.
fn pooled_features(data: &[f32], dims: ImageDimensions) -> Vec<f32> {
    let grid = NOISE_FEATURE_GRID;
    let (h, w) = (dims.height, dims.width);
    let mut features = vec![0.0f32; dims.channels * grid * grid];
    let mut counts = vec![0usize; features.len()];

    for c in 0..dims.channels {
        for y in 0..h {
            for x in 0..w {
                let cell = c * grid * grid + (y * grid / h) * grid + (x * grid / w);
                features[cell] += data[c * h * w + y * w + x];
                counts[cell] += 1;
            }
        }
    }
    for (f, n) in features.iter_mut().zip(counts) {
        if n > 0 {
            *f /= n as f32;
        }
    }
    features
}
