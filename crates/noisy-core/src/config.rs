//! Configuration structures for noisy-label training runs.
//!
//! A [`TrainingRunConfig`] is resolved once (file + CLI overrides), validated,
//! and then handed to every component as an immutable value.

use crate::error::{Error, Result};
use crate::types::{DataSplit, ImageDimensions, ModelArchitecture, SslType};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Complete configuration of one training run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingRunConfig {
    /// Random seed for reproducibility
    pub seed: u64,
    /// Dataset and label-noise configuration
    pub dataset: DatasetConfig,
    /// Model configuration
    pub model: ModelConfig,
    /// Optimizer, schedule and loop settings
    pub training: TrainingParams,
    /// Augmentation pipeline
    pub augmentation: AugmentationConfig,
    /// Noise-mitigation strategy
    pub noise_mitigation: NoiseMitigationConfig,
    /// Where run artifacts go
    pub output: OutputConfig,
}

impl Default for TrainingRunConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            dataset: DatasetConfig::default(),
            model: ModelConfig::default(),
            training: TrainingParams::default(),
            augmentation: AugmentationConfig::default(),
            noise_mitigation: NoiseMitigationConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

impl TrainingRunConfig {
    /// Checks every option that can be checked without touching data or devices.
    pub fn validate(&self) -> Result<()> {
        self.dataset.validate()?;
        self.model.validate()?;
        self.training.validate()?;
        self.augmentation.validate()?;
        self.noise_mitigation.validate(self.model.architecture)?;

        if self.noise_mitigation.co_teaching_use_graph
            && self.noise_mitigation.strategy() != StrategyKind::Baseline
            && self.dataset.neighbour_graph.is_none()
        {
            return Err(Error::Config(
                "co_teaching_use_graph requires dataset.neighbour_graph".to_string(),
            ));
        }
        Ok(())
    }

    /// Writes the resolved configuration next to the run artifacts.
    ///
    /// The file is staged under a hidden `.tmp-` sibling and renamed into place.
    pub fn save_json(&self, path: &Path) -> Result<()> {
        crate::json::write_json_atomic(path, self)
    }
}

/// Where samples come from
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DatasetSource {
    /// CSV manifest with `image`, `label` and optional `split`, `true_label`, `annotations` columns
    Csv {
        manifest: PathBuf,
        /// Directory image paths are relative to (defaults to the manifest's directory)
        root_dir: Option<PathBuf>,
        split: Option<DataSplit>,
    },
    /// One subdirectory per class, sorted by name
    Folder { root_dir: PathBuf },
    /// Seeded class-conditional blobs, for smoke runs without image data
    Synthetic { num_samples: usize },
}

/// Label-noise process applied once at dataset construction
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NoiseProcess {
    /// Observed labels are the true labels
    None,
    /// Flip to a uniformly chosen other class with probability `rate`
    Symmetric { rate: f64 },
    /// Per-sample flip probability around `rate`, flip target driven by the input
    InstanceDependent { rate: f64 },
    /// Sample from annotator counts sharpened or flattened by `temperature`
    HumanDerived { temperature: f64 },
}

impl Default for NoiseProcess {
    fn default() -> Self {
        NoiseProcess::None
    }
}

impl std::fmt::Display for NoiseProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NoiseProcess::None => write!(f, "none"),
            NoiseProcess::Symmetric { rate } => write!(f, "symmetric({rate})"),
            NoiseProcess::InstanceDependent { rate } => write!(f, "instance_dependent({rate})"),
            NoiseProcess::HumanDerived { temperature } => {
                write!(f, "human_derived(T={temperature})")
            }
        }
    }
}

/// Dataset configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    /// Sample source
    pub source: DatasetSource,
    /// Network input size
    pub image_size: ImageDimensions,
    /// Label-noise process
    pub noise: NoiseProcess,
    /// Precomputed neighbour lists used by graph-filtered selection
    pub neighbour_graph: Option<PathBuf>,
    /// Shuffle sample order every epoch
    pub shuffle: bool,
    /// Batches buffered ahead of the training step
    pub prefetch_batches: usize,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            source: DatasetSource::Synthetic { num_samples: 512 },
            image_size: ImageDimensions::cifar(),
            noise: NoiseProcess::None,
            neighbour_graph: None,
            shuffle: true,
            prefetch_batches: 4,
        }
    }
}

impl DatasetConfig {
    pub fn validate(&self) -> Result<()> {
        match self.noise {
            NoiseProcess::Symmetric { rate } | NoiseProcess::InstanceDependent { rate } => {
                if !(0.0..=1.0).contains(&rate) {
                    return Err(Error::Config(format!(
                        "noise rate must be in [0, 1], got {rate}"
                    )));
                }
            }
            NoiseProcess::HumanDerived { temperature } => {
                if !(temperature > 0.0) {
                    return Err(Error::Config(format!(
                        "noise temperature must be positive, got {temperature}"
                    )));
                }
            }
            NoiseProcess::None => {}
        }
        if let DatasetSource::Synthetic { num_samples: 0 } = self.source {
            return Err(Error::Config("synthetic dataset needs at least one sample".to_string()));
        }
        if self.image_size.num_elements() == 0 {
            return Err(Error::Config("image_size must be non-zero".to_string()));
        }
        if self.prefetch_batches == 0 {
            return Err(Error::Config("prefetch_batches must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Backbone architecture
    pub architecture: ModelArchitecture,
    /// Number of output classes
    pub num_classes: usize,
    /// Channels of the first backbone stage; later stages double it
    pub base_width: usize,
    /// Dropout before the classification head
    pub dropout: f64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            architecture: ModelArchitecture::ResNet18,
            num_classes: 10,
            base_width: 64,
            dropout: 0.0,
        }
    }
}

impl ModelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_classes < 2 {
            return Err(Error::Config(format!(
                "num_classes must be at least 2, got {}",
                self.num_classes
            )));
        }
        if self.base_width == 0 {
            return Err(Error::Config("base_width must be at least 1".to_string()));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::Config(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        Ok(())
    }
}

/// Optimizer type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerType {
    Adam,
    AdamW,
    Sgd,
}

impl std::fmt::Display for OptimizerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OptimizerType::Adam => write!(f, "adam"),
            OptimizerType::AdamW => write!(f, "adamw"),
            OptimizerType::Sgd => write!(f, "sgd"),
        }
    }
}

/// Learning rate schedule type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LrScheduleType {
    Constant,
    Step,
    Exponential,
    Cosine,
    WarmupCosine,
}

/// Learning rate schedule, applied at epoch boundaries
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LrScheduleConfig {
    pub schedule_type: LrScheduleType,
    /// Epochs between decays for `step`
    pub step_size: usize,
    /// Decay factor for `step` and `exponential`
    pub gamma: f64,
    /// Floor for cosine schedules
    pub min_lr: f64,
    /// Linear warmup length for `warmup_cosine`
    pub warmup_epochs: usize,
}

impl Default for LrScheduleConfig {
    fn default() -> Self {
        Self {
            schedule_type: LrScheduleType::Constant,
            step_size: 30,
            gamma: 0.1,
            min_lr: 1e-6,
            warmup_epochs: 5,
        }
    }
}

/// Training hyperparameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingParams {
    /// Number of training epochs
    pub num_epochs: usize,
    /// Batch size
    pub batch_size: usize,
    /// Learning rate
    pub learning_rate: f64,
    /// Optimizer type
    pub optimizer: OptimizerType,
    /// Momentum for SGD
    pub momentum: f64,
    /// Weight decay (L2 regularization)
    pub weight_decay: f64,
    /// Learning rate schedule
    pub lr_schedule: LrScheduleConfig,
    /// Stop after this many epochs without training-loss improvement
    pub early_stopping_patience: Option<usize>,
    /// Save a checkpoint every N epochs
    pub checkpoint_period: usize,
    /// Log step metrics every N steps
    pub log_period: usize,
    /// Number of epoch checkpoints to retain
    pub keep_last_checkpoints: usize,
}

impl Default for TrainingParams {
    fn default() -> Self {
        Self {
            num_epochs: 120,
            batch_size: 128,
            learning_rate: 1e-3,
            optimizer: OptimizerType::Adam,
            momentum: 0.9,
            weight_decay: 1e-4,
            lr_schedule: LrScheduleConfig::default(),
            early_stopping_patience: None,
            checkpoint_period: 10,
            log_period: 50,
            keep_last_checkpoints: 3,
        }
    }
}

impl TrainingParams {
    pub fn validate(&self) -> Result<()> {
        if self.num_epochs == 0 {
            return Err(Error::Config("num_epochs must be greater than 0".to_string()));
        }
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be greater than 0".to_string()));
        }
        if !(self.learning_rate > 0.0) {
            return Err(Error::Config(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if self.weight_decay < 0.0 {
            return Err(Error::Config("weight_decay must be non-negative".to_string()));
        }
        if self.checkpoint_period == 0 || self.log_period == 0 {
            return Err(Error::Config(
                "checkpoint_period and log_period must be at least 1".to_string(),
            ));
        }
        if self.lr_schedule.schedule_type == LrScheduleType::Step && self.lr_schedule.step_size == 0
        {
            return Err(Error::Config("step schedule needs step_size > 0".to_string()));
        }
        Ok(())
    }
}

/// Augmentation pipeline configuration.
///
/// Transforms run in a fixed order: affine, crop/resize, flip, gamma,
/// colour jitter, then tensor-space erasing and noise.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentationConfig {
    /// Master switch; when off only resize and centre crop are applied
    pub enabled: bool,
    pub random_affine: Option<AffineConfig>,
    /// Scale range for random resized crop; plain resize when absent
    pub random_resized_crop_scale: Option<(f32, f32)>,
    pub horizontal_flip_prob: f32,
    /// Gamma range, sampled uniformly
    pub random_gamma: Option<(f32, f32)>,
    pub color_jitter: Option<ColorJitterConfig>,
    /// Resize the shorter side to this length, then centre-crop to the input size
    pub resize_shorter_side: Option<u32>,
    pub random_erasing: Option<RandomErasingConfig>,
    pub gaussian_noise: Option<GaussianNoiseConfig>,
    /// Replicate single-channel inputs to the configured channel count
    pub expand_channels: bool,
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            random_affine: None,
            random_resized_crop_scale: None,
            horizontal_flip_prob: 0.5,
            random_gamma: None,
            color_jitter: None,
            resize_shorter_side: None,
            random_erasing: None,
            gaussian_noise: None,
            expand_channels: false,
        }
    }
}

impl AugmentationConfig {
    pub fn validate(&self) -> Result<()> {
        let prob_ok = |p: f32| (0.0..=1.0).contains(&p);
        if !prob_ok(self.horizontal_flip_prob) {
            return Err(Error::Config("horizontal_flip_prob must be in [0, 1]".to_string()));
        }
        if let Some((lo, hi)) = self.random_resized_crop_scale {
            if !(lo > 0.0 && lo <= hi && hi <= 1.0) {
                return Err(Error::Config(format!(
                    "random_resized_crop_scale must satisfy 0 < lo <= hi <= 1, got ({lo}, {hi})"
                )));
            }
        }
        if let Some((lo, hi)) = self.random_gamma {
            if !(lo > 0.0 && lo <= hi) {
                return Err(Error::Config("random_gamma must satisfy 0 < lo <= hi".to_string()));
            }
        }
        if let Some(erasing) = &self.random_erasing {
            if !prob_ok(erasing.probability) {
                return Err(Error::Config("random_erasing.probability must be in [0, 1]".to_string()));
            }
        }
        if let Some(noise) = &self.gaussian_noise {
            if !prob_ok(noise.probability) || noise.std < 0.0 {
                return Err(Error::Config("gaussian_noise needs probability in [0, 1] and std >= 0".to_string()));
            }
        }
        Ok(())
    }
}

/// Random affine transform parameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AffineConfig {
    /// Maximum absolute rotation in degrees
    pub max_angle: f32,
    /// Maximum translation as a fraction of width/height
    pub max_translation: f32,
    /// Maximum horizontal shear in degrees
    pub max_shear: f32,
}

/// Colour jitter strengths; each factor is sampled from [1 - s, 1 + s]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ColorJitterConfig {
    pub brightness: f32,
    pub contrast: f32,
    pub saturation: f32,
}

/// Random erasing of a rectangular patch
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RandomErasingConfig {
    pub probability: f32,
    /// Erased area as a fraction of the image
    pub scale: (f32, f32),
}

/// Additive Gaussian noise in normalized tensor space
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GaussianNoiseConfig {
    pub probability: f32,
    pub std: f32,
}

/// Trainer strategy selected once from the noise-mitigation flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StrategyKind {
    Baseline,
    CoTeaching,
    TeacherStudent,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrategyKind::Baseline => write!(f, "baseline"),
            StrategyKind::CoTeaching => write!(f, "co-teaching"),
            StrategyKind::TeacherStudent => write!(f, "teacher-student"),
        }
    }
}

/// Noise-mitigation options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NoiseMitigationConfig {
    /// Train two peers that select samples for each other
    pub use_co_teaching: bool,
    /// Final fraction of each batch excluded from a peer's update
    pub co_teaching_forget_rate: f64,
    /// Epochs over which the forget rate ramps up
    pub co_teaching_num_gradual: i64,
    /// Epochs of full-batch training before the ramp starts
    pub co_teaching_num_warmup: i64,
    /// Filter selections through the neighbour-agreement mask
    pub co_teaching_use_graph: bool,
    /// Penalize peer disagreement on excluded samples
    pub co_teaching_consistency_loss: bool,
    /// Weight of the consistency term
    pub consistency_weight: f64,
    /// Neighbour agreement needed for a sample to count as trusted
    pub graph_min_agreement: f64,
    /// Second peer is an EMA copy of the first instead of a twin
    pub use_teacher_model: bool,
    /// EMA decay of the teacher weights
    pub teacher_ema_decay: f64,
    /// Weight of the tanh logit regulariser (0 disables)
    pub tanh_regularisation: f64,
    /// Label smoothing factor (0 disables)
    pub label_smoothing: f64,
    /// Warm-start the backbone from self-supervised checkpoints
    pub use_self_supervision: bool,
    pub self_supervision: SelfSupervisionConfig,
}

impl Default for NoiseMitigationConfig {
    fn default() -> Self {
        Self {
            use_co_teaching: false,
            co_teaching_forget_rate: 0.2,
            co_teaching_num_gradual: 10,
            co_teaching_num_warmup: 0,
            co_teaching_use_graph: false,
            co_teaching_consistency_loss: false,
            consistency_weight: 1.0,
            graph_min_agreement: 0.5,
            use_teacher_model: false,
            teacher_ema_decay: 0.99,
            tanh_regularisation: 0.0,
            label_smoothing: 0.0,
            use_self_supervision: false,
            self_supervision: SelfSupervisionConfig::default(),
        }
    }
}

impl NoiseMitigationConfig {
    /// Strategy implied by the flags; the teacher variant takes precedence.
    pub fn strategy(&self) -> StrategyKind {
        if self.use_teacher_model {
            StrategyKind::TeacherStudent
        } else if self.use_co_teaching {
            StrategyKind::CoTeaching
        } else {
            StrategyKind::Baseline
        }
    }

    /// Ramp length in epochs; only meaningful after [`Self::validate`].
    pub fn num_gradual(&self) -> usize {
        usize::try_from(self.co_teaching_num_gradual).unwrap_or(0)
    }

    /// Warmup length in epochs; only meaningful after [`Self::validate`].
    pub fn num_warmup(&self) -> usize {
        usize::try_from(self.co_teaching_num_warmup).unwrap_or(0)
    }

    pub fn validate(&self, architecture: ModelArchitecture) -> Result<()> {
        if !(0.0..=1.0).contains(&self.co_teaching_forget_rate) {
            return Err(Error::Config(format!(
                "co_teaching_forget_rate must be in [0, 1], got {}",
                self.co_teaching_forget_rate
            )));
        }
        if self.co_teaching_num_gradual < 0 {
            return Err(Error::Config(format!(
                "co_teaching_num_gradual must be non-negative, got {}",
                self.co_teaching_num_gradual
            )));
        }
        if self.co_teaching_num_warmup < 0 {
            return Err(Error::Config(format!(
                "co_teaching_num_warmup must be non-negative, got {}",
                self.co_teaching_num_warmup
            )));
        }
        if self.co_teaching_use_graph && self.co_teaching_consistency_loss && self.use_teacher_model
        {
            return Err(Error::Config(
                "co_teaching_use_graph, co_teaching_consistency_loss and use_teacher_model \
                 have no defined combined semantics; disable at least one"
                    .to_string(),
            ));
        }
        if self.consistency_weight < 0.0 {
            return Err(Error::Config("consistency_weight must be non-negative".to_string()));
        }
        if !(0.0..=1.0).contains(&self.graph_min_agreement) {
            return Err(Error::Config("graph_min_agreement must be in [0, 1]".to_string()));
        }
        if !(0.0..1.0).contains(&self.teacher_ema_decay) {
            return Err(Error::Config(format!(
                "teacher_ema_decay must be in [0, 1), got {}",
                self.teacher_ema_decay
            )));
        }
        if self.tanh_regularisation < 0.0 {
            return Err(Error::Config(format!(
                "tanh_regularisation must be non-negative, got {}",
                self.tanh_regularisation
            )));
        }
        if !(0.0..1.0).contains(&self.label_smoothing) {
            return Err(Error::Config(format!(
                "label_smoothing must be in [0, 1), got {}",
                self.label_smoothing
            )));
        }
        if self.use_self_supervision {
            self.self_supervision.validate(architecture)?;
        }
        Ok(())
    }
}

/// Self-supervised warm-start configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelfSupervisionConfig {
    /// Checkpoint references (paths or `file://` URLs); peer i uses entry i mod len
    pub checkpoints: Vec<String>,
    /// Objective the encoder was pretrained with
    #[serde(rename = "type")]
    pub ssl_type: SslType,
    /// Backbone architecture the checkpoints must contain
    pub encoder_name: String,
    /// Keep the injected backbone frozen for this many initial epochs
    pub freeze_encoder_epochs: usize,
}

impl Default for SelfSupervisionConfig {
    fn default() -> Self {
        Self {
            checkpoints: Vec::new(),
            ssl_type: SslType::SimClr,
            encoder_name: ModelArchitecture::ResNet18.name().to_string(),
            freeze_encoder_epochs: 0,
        }
    }
}

impl SelfSupervisionConfig {
    pub fn validate(&self, architecture: ModelArchitecture) -> Result<()> {
        if self.checkpoints.is_empty() {
            return Err(Error::Config(
                "use_self_supervision is set but self_supervision.checkpoints is empty".to_string(),
            ));
        }
        let encoder = ModelArchitecture::from_name(&self.encoder_name).ok_or_else(|| {
            Error::Config(format!("unknown encoder_name '{}'", self.encoder_name))
        })?;
        if encoder != architecture {
            return Err(Error::Config(format!(
                "backbone mismatch: self-supervised encoder is '{}' but model is '{}'",
                encoder, architecture
            )));
        }
        Ok(())
    }
}

/// Run output configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Directory for checkpoints, metrics and logs
    pub dir: PathBuf,
    /// Resume from the latest checkpoint in `dir` when one exists
    pub resume: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("output/run"),
            resume: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn co_teaching_config() -> TrainingRunConfig {
        let mut config = TrainingRunConfig::default();
        config.noise_mitigation.use_co_teaching = true;
        config
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = TrainingRunConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.noise_mitigation.strategy(), StrategyKind::Baseline);
    }

    #[test]
    fn test_forget_rate_out_of_range() {
        let mut config = co_teaching_config();
        config.noise_mitigation.co_teaching_forget_rate = 1.5;
        assert!(config.validate().unwrap_err().is_config());

        config.noise_mitigation.co_teaching_forget_rate = -0.1;
        assert!(config.validate().unwrap_err().is_config());

        config.noise_mitigation.co_teaching_forget_rate = 1.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_negative_schedule_lengths_rejected() {
        let mut config = co_teaching_config();
        config.noise_mitigation.co_teaching_num_gradual = -1;
        assert!(config.validate().unwrap_err().is_config());

        let mut config = co_teaching_config();
        config.noise_mitigation.co_teaching_num_warmup = -3;
        assert!(config.validate().unwrap_err().is_config());
    }

    #[test]
    fn test_empty_checkpoint_list_rejected() {
        let mut config = TrainingRunConfig::default();
        config.noise_mitigation.use_self_supervision = true;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("checkpoints is empty"));
    }

    #[test]
    fn test_backbone_mismatch_rejected() {
        let mut config = TrainingRunConfig::default();
        config.model.architecture = ModelArchitecture::ResNet34;
        config.noise_mitigation.use_self_supervision = true;
        config.noise_mitigation.self_supervision.checkpoints = vec!["encoder.json".to_string()];
        config.noise_mitigation.self_supervision.encoder_name = "resnet18".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("backbone mismatch"));
    }

    #[test]
    fn test_graph_consistency_teacher_combination_rejected() {
        let mut config = co_teaching_config();
        config.dataset.neighbour_graph = Some(PathBuf::from("graph.json"));
        config.noise_mitigation.co_teaching_use_graph = true;
        config.noise_mitigation.co_teaching_consistency_loss = true;
        assert!(config.validate().is_ok());

        config.noise_mitigation.use_teacher_model = true;
        assert!(config.validate().unwrap_err().is_config());
    }

    #[test]
    fn test_graph_requires_neighbour_file() {
        let mut config = co_teaching_config();
        config.noise_mitigation.co_teaching_use_graph = true;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_strategy_selection() {
        let mut mitigation = NoiseMitigationConfig::default();
        assert_eq!(mitigation.strategy(), StrategyKind::Baseline);
        mitigation.use_co_teaching = true;
        assert_eq!(mitigation.strategy(), StrategyKind::CoTeaching);
        mitigation.use_teacher_model = true;
        assert_eq!(mitigation.strategy(), StrategyKind::TeacherStudent);
    }

    #[test]
    fn test_loss_options_validated() {
        let mut config = TrainingRunConfig::default();
        config.noise_mitigation.label_smoothing = 1.0;
        assert!(config.validate().is_err());

        let mut config = TrainingRunConfig::default();
        config.noise_mitigation.tanh_regularisation = -0.5;
        assert!(config.validate().is_err());

        let mut config = TrainingRunConfig::default();
        config.training.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_roundtrip_with_flat_option_names() {
        let text = r#"
            seed = 7

            [model]
            architecture = "simple_cnn"
            num_classes = 10

            [dataset.source]
            kind = "synthetic"
            num_samples = 64

            [dataset.noise]
            kind = "symmetric"
            rate = 0.4

            [noise_mitigation]
            use_co_teaching = true
            co_teaching_forget_rate = 0.4
            co_teaching_num_gradual = 10
            co_teaching_num_warmup = 1
            tanh_regularisation = 0.1

            [noise_mitigation.self_supervision]
            checkpoints = ["file:///tmp/simclr.json"]
            type = "byol"
            encoder_name = "simple_cnn"
        "#;
        let config: TrainingRunConfig = toml::from_str(text).unwrap();
        assert_eq!(config.seed, 7);
        assert_eq!(config.model.architecture, ModelArchitecture::SimpleCnn);
        assert_eq!(config.dataset.noise, NoiseProcess::Symmetric { rate: 0.4 });
        assert_eq!(config.noise_mitigation.num_gradual(), 10);
        assert_eq!(config.noise_mitigation.num_warmup(), 1);
        assert_eq!(config.noise_mitigation.self_supervision.ssl_type, SslType::Byol);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_json_replaces_previous_copy() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let path = temp_dir.path().join("run").join("config.json");
        let mut config = co_teaching_config();
        config.save_json(&path).unwrap();
        config.seed = 7;
        config.save_json(&path).unwrap();

        let saved: TrainingRunConfig = crate::json::read_json(&path).unwrap();
        assert_eq!(saved.seed, 7);
        assert_eq!(saved.noise_mitigation.strategy(), StrategyKind::CoTeaching);
        let names: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(names, [std::ffi::OsString::from("config.json")]);
    }

    #[test]
    fn test_shipped_configs_validate() {
        let shipped = [
            include_str!("../../../configs/baseline.toml"),
            include_str!("../../../configs/co_teaching.toml"),
            include_str!("../../../configs/teacher_student.toml"),
            include_str!("../../../configs/warm_start.toml"),
        ];
        let strategies: Vec<StrategyKind> = shipped
            .iter()
            .map(|text| {
                let config: TrainingRunConfig = toml::from_str(text).unwrap();
                config.validate().unwrap();
                config.noise_mitigation.strategy()
            })
            .collect();
        assert_eq!(
            strategies,
            vec![
                StrategyKind::Baseline,
                StrategyKind::CoTeaching,
                StrategyKind::TeacherStudent,
                StrategyKind::CoTeaching
            ]
        );
    }
}
