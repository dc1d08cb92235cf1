//! Noisy-label image datasets.
//!
//! Samples carry an observed (possibly corrupted) label and, when known, the
//! clean label. Augmented views are seeded per sample and epoch, and batches
//! are produced by a background thread ahead of the training step.

pub mod augmentation;
pub mod batcher;
pub mod dataset;
pub mod graph;
pub mod loader;
pub mod noise;
pub mod prefetch;
pub mod statistics;

pub use augmentation::AugmentationPipeline;
pub use batcher::{NoisyBatcher, TrainingBatch};
pub use dataset::{DatasetEntry, NoisyLabelDataset, NoisySample, SampleInput, SampleSource};
pub use graph::{LabelAgreementGraph, TrustGraph};
pub use loader::{read_manifest, ImageLoader, ManifestEntry};
pub use noise::{realised_noise_rate, LabelNoise, NoiseInput};
pub use prefetch::{epoch_order, BatchPrefetcher};
pub use statistics::DatasetStatistics;
