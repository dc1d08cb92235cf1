//! Noise-robust training for image classification.
//!
//! This crate provides:
//! - Classifier backbones with named-parameter access
//! - Forget-rate schedule and small-loss sample selection
//! - Single-model and co-teaching trainers behind one strategy type
//! - Warm-starting backbones from self-supervised encoder checkpoints
//! - Learning rate scheduling and atomic checkpoints

pub mod checkpoint;
pub mod co_teaching;
pub mod encoder;
pub mod forget_rate;
pub mod loss;
pub mod lr_schedule;
pub mod model;
pub mod peer;
pub mod selection;
pub mod strategy;
pub mod trainer;

pub use checkpoint::{CheckpointManager, TrainingState};
pub use co_teaching::{CoTeachingOptions, CoTeachingTrainer};
pub use encoder::{warm_start, EncoderCheckpoint, EncoderProvider};
pub use forget_rate::ForgetRateSchedule;
pub use loss::LossConfig;
pub use lr_schedule::LearningRateScheduler;
pub use model::{NoisyClassifier, NoisyClassifierConfig, ParameterSet};
pub use peer::{BatchView, BurnPeer, OptimizerFactory, Peer};
pub use strategy::TrainingStrategy;
pub use trainer::{PeerStepReport, SingleModelTrainer, StepResult};

/// Re-export commonly used types
pub mod prelude {
    pub use super::co_teaching::CoTeachingTrainer;
    pub use super::encoder::EncoderProvider;
    pub use super::forget_rate::ForgetRateSchedule;
    pub use super::model::{NoisyClassifier, NoisyClassifierConfig};
    pub use super::peer::{BurnPeer, Peer};
    pub use super::strategy::TrainingStrategy;
    pub use super::trainer::StepResult;
}
