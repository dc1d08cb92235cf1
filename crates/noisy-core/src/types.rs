//! Core type definitions shared across the workspace.

use serde::{Deserialize, Serialize};

/// Backbone architecture of a classifier
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ModelArchitecture {
    /// Four-block convolutional network, cheap enough for CPU runs
    #[serde(rename = "simple_cnn")]
    SimpleCnn,
    /// ResNet-18 (basic blocks, [2, 2, 2, 2])
    #[serde(rename = "resnet18")]
    ResNet18,
    /// ResNet-34 (basic blocks, [3, 4, 6, 3])
    #[serde(rename = "resnet34")]
    ResNet34,
}

impl ModelArchitecture {
    /// Canonical name, as written into encoder checkpoints.
    pub fn name(&self) -> &'static str {
        match self {
            ModelArchitecture::SimpleCnn => "simple_cnn",
            ModelArchitecture::ResNet18 => "resnet18",
            ModelArchitecture::ResNet34 => "resnet34",
        }
    }

    /// Parses a canonical name back into an architecture.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "simple_cnn" => Some(ModelArchitecture::SimpleCnn),
            "resnet18" => Some(ModelArchitecture::ResNet18),
            "resnet34" => Some(ModelArchitecture::ResNet34),
            _ => None,
        }
    }
}

impl std::fmt::Display for ModelArchitecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Self-supervised objective an encoder checkpoint was trained with
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SslType {
    SimClr,
    Byol,
}

impl SslType {
    /// Tensor-name prefix under which the backbone lives in a checkpoint.
    ///
    /// BYOL checkpoints carry an online and a target network; only the
    /// online encoder is used for warm-starting.
    pub fn backbone_prefix(&self) -> &'static str {
        match self {
            SslType::SimClr => "encoder.",
            SslType::Byol => "online_network.encoder.",
        }
    }
}

impl std::fmt::Display for SslType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SslType::SimClr => write!(f, "simclr"),
            SslType::Byol => write!(f, "byol"),
        }
    }
}

/// Data split type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DataSplit {
    Train,
    Validation,
    Test,
}

impl DataSplit {
    /// Value used in the `split` column of dataset manifests.
    pub fn as_str(&self) -> &'static str {
        match self {
            DataSplit::Train => "train",
            DataSplit::Validation => "val",
            DataSplit::Test => "test",
        }
    }
}

impl std::fmt::Display for DataSplit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Image dimensions (channels, height, width)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageDimensions {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
}

impl ImageDimensions {
    pub fn new(channels: usize, height: usize, width: usize) -> Self {
        Self {
            channels,
            height,
            width,
        }
    }

    /// 32x32 RGB, the CIFAR resolution
    pub fn cifar() -> Self {
        Self::new(3, 32, 32)
    }

    /// Total number of values per image
    pub fn num_elements(&self) -> usize {
        self.channels * self.height * self.width
    }
}

impl Default for ImageDimensions {
    fn default() -> Self {
        Self::cifar()
    }
}
