//! Self-supervised encoder checkpoints and backbone warm-start.
//!
//! An encoder checkpoint is a JSON file of named tensors written by a
//! SimCLR or BYOL pretraining run. Only the encoder namespace is used; the
//! projection/prediction heads and the BYOL target network are dropped, and
//! the encoder prefix is rewritten to the classifier's `backbone.` namespace.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use burn::tensor::backend::Backend;
use noisy_core::{Error, ModelArchitecture, Result, SelfSupervisionConfig, SslType};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::checkpoint::{read_json, write_json_atomic};
use crate::model::{NoisyClassifier, ParameterSet, BACKBONE_PREFIX};

pub const ENCODER_FORMAT_VERSION: u32 = 1;

/// Named tensors of a pretrained encoder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncoderCheckpoint {
    pub format_version: u32,
    pub ssl_type: SslType,
    /// Backbone architecture, e.g. `resnet18`
    pub encoder_name: String,
    pub tensors: ParameterSet,
}

/// Local path of a checkpoint reference (`/path` or `file:///path`).
pub fn resolve_reference(reference: &str) -> Result<PathBuf> {
    if let Some(path) = reference.strip_prefix("file://") {
        if path.is_empty() {
            return Err(Error::Config(format!("empty file URL '{reference}'")));
        }
        return Ok(PathBuf::from(path));
    }
    if let Some((scheme, _)) = reference.split_once("://") {
        return Err(Error::Config(format!(
            "unsupported checkpoint scheme '{scheme}' in '{reference}'"
        )));
    }
    if reference.is_empty() {
        return Err(Error::Config("empty checkpoint reference".to_string()));
    }
    Ok(PathBuf::from(reference))
}

impl EncoderCheckpoint {
    /// Resolves and reads a checkpoint reference.
    pub fn load(reference: &str) -> Result<Self> {
        let path = resolve_reference(reference)?;
        if !path.is_file() {
            return Err(Error::NotFound(format!("encoder checkpoint {:?}", path)));
        }
        let checkpoint: EncoderCheckpoint = read_json(&path)?;
        if checkpoint.format_version != ENCODER_FORMAT_VERSION {
            return Err(Error::CheckpointLoad {
                tensor: String::new(),
                reason: format!(
                    "{:?} has format version {}, expected {}",
                    path, checkpoint.format_version, ENCODER_FORMAT_VERSION
                ),
            });
        }
        debug!(path = ?path, tensors = checkpoint.tensors.len(), "Encoder checkpoint read");
        Ok(checkpoint)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        write_json_atomic(path, self)
    }

    pub fn architecture(&self) -> Result<ModelArchitecture> {
        ModelArchitecture::from_name(&self.encoder_name).ok_or_else(|| {
            Error::Config(format!("checkpoint has unknown encoder '{}'", self.encoder_name))
        })
    }

    /// Encoder tensors renamed into the `backbone.` namespace.
    pub fn backbone_tensors(&self) -> ParameterSet {
        let prefix = self.ssl_type.backbone_prefix();
        self.tensors
            .iter()
            .filter_map(|(name, tensor)| {
                let local = name.strip_prefix(prefix)?;
                Some((format!("{BACKBONE_PREFIX}{local}"), tensor.clone()))
            })
            .collect()
    }
}

/// Injects a checkpoint's encoder into `model`'s backbone.
///
/// Fails with a configuration error when the checkpoint's SSL type or
/// architecture differ from what was asked for, and with `CheckpointLoad`
/// naming the tensor when a backbone tensor is missing or has another
/// shape. All checks run before anything is written, so a failure leaves
/// the model as it was.
pub fn warm_start<B: Backend>(
    model: NoisyClassifier<B>,
    checkpoint: &EncoderCheckpoint,
    expected_ssl: SslType,
) -> Result<NoisyClassifier<B>> {
    if checkpoint.ssl_type != expected_ssl {
        return Err(Error::Config(format!(
            "checkpoint was pretrained with {}, config expects {}",
            checkpoint.ssl_type, expected_ssl
        )));
    }
    let architecture = checkpoint.architecture()?;
    if architecture != model.architecture() {
        return Err(Error::Config(format!(
            "backbone mismatch: checkpoint encoder is '{}' but model is '{}'",
            architecture,
            model.architecture()
        )));
    }

    let available = checkpoint.backbone_tensors();
    let shapes = model.parameter_shapes()?;
    let mut injected = ParameterSet::new();

    for (name, shape) in shapes.iter().filter(|(name, _)| name.starts_with(BACKBONE_PREFIX)) {
        let tensor = available.get(name).ok_or_else(|| Error::CheckpointLoad {
            tensor: name.clone(),
            reason: "missing from encoder checkpoint".to_string(),
        })?;
        if &tensor.shape != shape {
            return Err(Error::CheckpointLoad {
                tensor: name.clone(),
                reason: format!(
                    "checkpoint shape {:?} does not match model shape {:?}",
                    tensor.shape, shape
                ),
            });
        }
        injected.insert(name.clone(), tensor.clone());
    }

    let ignored = available.len() - injected.len();
    info!(
        encoder = %checkpoint.encoder_name,
        ssl = %checkpoint.ssl_type,
        injected = injected.len(),
        ignored,
        "Backbone warm-started from encoder checkpoint"
    );
    model.import_parameters(&injected)
}

/// Checkpoints resolved once at run start, shared out to peers.
#[derive(Debug, Clone)]
pub struct EncoderProvider {
    ssl_type: SslType,
    checkpoints: Vec<EncoderCheckpoint>,
    freeze_epochs: usize,
}

impl EncoderProvider {
    /// Loads every configured checkpoint and checks it against `architecture`.
    pub fn from_config(config: &SelfSupervisionConfig, architecture: ModelArchitecture) -> Result<Self> {
        config.validate(architecture)?;

        let mut checkpoints = Vec::with_capacity(config.checkpoints.len());
        for reference in &config.checkpoints {
            let checkpoint = EncoderCheckpoint::load(reference)?;
            if checkpoint.architecture()? != architecture {
                return Err(Error::Config(format!(
                    "backbone mismatch: '{}' holds a '{}' encoder, model is '{}'",
                    reference, checkpoint.encoder_name, architecture
                )));
            }
            if checkpoint.ssl_type != config.ssl_type {
                return Err(Error::Config(format!(
                    "'{}' was pretrained with {}, config expects {}",
                    reference, checkpoint.ssl_type, config.ssl_type
                )));
            }
            checkpoints.push(checkpoint);
        }

        Ok(Self {
            ssl_type: config.ssl_type,
            checkpoints,
            freeze_epochs: config.freeze_encoder_epochs,
        })
    }

    /// Checkpoint used by peer `peer_index` (entries are reused cyclically)
    pub fn checkpoint_for(&self, peer_index: usize) -> Option<&EncoderCheckpoint> {
        if self.checkpoints.is_empty() {
            return None;
        }
        self.checkpoints.get(peer_index % self.checkpoints.len())
    }

    pub fn warm_start<B: Backend>(
        &self,
        model: NoisyClassifier<B>,
        peer_index: usize,
    ) -> Result<NoisyClassifier<B>> {
        let checkpoint = self
            .checkpoint_for(peer_index)
            .ok_or_else(|| Error::Config("no encoder checkpoints configured".to_string()))?;
        warm_start(model, checkpoint, self.ssl_type)
    }

    /// Epochs the injected backbone stays frozen
    pub fn freeze_epochs(&self) -> usize {
        self.freeze_epochs
    }

    /// Whether the backbone is frozen during `epoch`
    pub fn is_frozen_at(&self, epoch: usize) -> bool {
        epoch < self.freeze_epochs
    }
}

impl<B: Backend> NoisyClassifier<B> {
    /// The backbone as an encoder checkpoint of `ssl_type`.
    pub fn encoder_checkpoint(&self, ssl_type: SslType) -> Result<EncoderCheckpoint> {
        let prefix = ssl_type.backbone_prefix();
        let tensors: BTreeMap<_, _> = self
            .export_parameters()?
            .into_iter()
            .filter_map(|(name, tensor)| {
                let local = name.strip_prefix(BACKBONE_PREFIX)?;
                Some((format!("{prefix}{local}"), tensor))
            })
            .collect();

        Ok(EncoderCheckpoint {
            format_version: ENCODER_FORMAT_VERSION,
            ssl_type,
            encoder_name: self.architecture().name().to_string(),
            tensors,
        })
    }

    /// Writes the backbone as an encoder checkpoint, atomically.
    pub fn export_encoder_checkpoint(&self, path: &Path, ssl_type: SslType) -> Result<()> {
        self.encoder_checkpoint(ssl_type)?.save(path)?;
        info!("Encoder checkpoint exported to {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NamedTensor, NoisyClassifierConfig};
    use burn_ndarray::NdArray;
    use tempfile::TempDir;

    type TestBackend = NdArray<f32>;

    fn model(architecture: ModelArchitecture, num_classes: usize) -> NoisyClassifier<TestBackend> {
        NoisyClassifierConfig::new(architecture, num_classes)
            .with_base_width(2)
            .init(&Default::default())
            .unwrap()
    }

    fn backbone(model: &NoisyClassifier<TestBackend>) -> ParameterSet {
        model
            .export_parameters()
            .unwrap()
            .into_iter()
            .filter(|(name, _)| name.starts_with(BACKBONE_PREFIX))
            .collect()
    }

    /// BYOL-style checkpoint from a pretrained model, with heads and a
    /// target network that must be ignored.
    fn byol_checkpoint(source: &NoisyClassifier<TestBackend>) -> EncoderCheckpoint {
        let mut checkpoint = source.encoder_checkpoint(SslType::Byol).unwrap();
        let extra = NamedTensor {
            shape: vec![2],
            values: vec![1.0, 2.0],
        };
        for name in [
            "online_network.projector.weight",
            "online_network.predictor.weight",
            "target_network.encoder.conv1.conv.weight",
        ] {
            checkpoint.tensors.insert(name.to_string(), extra.clone());
        }
        checkpoint
    }

    #[test]
    fn test_resolve_reference() {
        assert_eq!(resolve_reference("/tmp/enc.json").unwrap(), PathBuf::from("/tmp/enc.json"));
        assert_eq!(
            resolve_reference("file:///tmp/enc.json").unwrap(),
            PathBuf::from("/tmp/enc.json")
        );
        assert!(matches!(resolve_reference("s3://bucket/enc.json"), Err(Error::Config(_))));
        assert!(matches!(resolve_reference(""), Err(Error::Config(_))));
    }

    #[test]
    fn test_simclr_prefix_is_rewritten() {
        let source = model(ModelArchitecture::SimpleCnn, 4);
        let checkpoint = source.encoder_checkpoint(SslType::SimClr).unwrap();
        assert!(checkpoint.tensors.keys().all(|name| name.starts_with("encoder.")));
        assert_eq!(checkpoint.backbone_tensors(), backbone(&source));
    }

    #[test]
    fn test_warm_start_copies_backbone_only() {
        let pretrained = model(ModelArchitecture::SimpleCnn, 7);
        let target = model(ModelArchitecture::SimpleCnn, 3);
        let head_before = target.export_parameters().unwrap()["head.weight"].clone();

        let warmed = warm_start(target, &byol_checkpoint(&pretrained), SslType::Byol).unwrap();

        assert_eq!(backbone(&warmed), backbone(&pretrained));
        assert_eq!(warmed.export_parameters().unwrap()["head.weight"], head_before);
    }

    #[test]
    fn test_injection_is_idempotent() {
        let checkpoint = byol_checkpoint(&model(ModelArchitecture::SimpleCnn, 3));
        let first = warm_start(model(ModelArchitecture::SimpleCnn, 3), &checkpoint, SslType::Byol)
            .unwrap();
        let second = warm_start(model(ModelArchitecture::SimpleCnn, 3), &checkpoint, SslType::Byol)
            .unwrap();
        assert_eq!(backbone(&first), backbone(&second));

        let twice = warm_start(first.clone(), &checkpoint, SslType::Byol).unwrap();
        assert_eq!(backbone(&twice), backbone(&first));
    }

    #[test]
    fn test_architecture_mismatch_is_config_error() {
        let checkpoint = model(ModelArchitecture::ResNet18, 3)
            .encoder_checkpoint(SslType::SimClr)
            .unwrap();
        let target = model(ModelArchitecture::SimpleCnn, 3);
        let before = target.export_parameters().unwrap();

        let result = warm_start(target.clone(), &checkpoint, SslType::SimClr);
        assert!(matches!(result, Err(Error::Config(_))));
        assert_eq!(target.export_parameters().unwrap(), before);
    }

    #[test]
    fn test_ssl_type_mismatch_is_config_error() {
        let checkpoint = model(ModelArchitecture::SimpleCnn, 3)
            .encoder_checkpoint(SslType::SimClr)
            .unwrap();
        let result = warm_start(model(ModelArchitecture::SimpleCnn, 3), &checkpoint, SslType::Byol);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_shape_mismatch_names_tensor() {
        let mut checkpoint = model(ModelArchitecture::SimpleCnn, 3)
            .encoder_checkpoint(SslType::SimClr)
            .unwrap();
        checkpoint.tensors.insert(
            "encoder.conv2.bn.gamma".to_string(),
            NamedTensor {
                shape: vec![3],
                values: vec![1.0; 3],
            },
        );

        match warm_start(model(ModelArchitecture::SimpleCnn, 3), &checkpoint, SslType::SimClr) {
            Err(Error::CheckpointLoad { tensor, .. }) => {
                assert_eq!(tensor, "backbone.conv2.bn.gamma")
            }
            other => panic!("expected CheckpointLoad, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_missing_tensor_names_tensor() {
        let mut checkpoint = model(ModelArchitecture::SimpleCnn, 3)
            .encoder_checkpoint(SslType::SimClr)
            .unwrap();
        checkpoint.tensors.remove("encoder.conv4.conv.weight");

        let err = warm_start(model(ModelArchitecture::SimpleCnn, 3), &checkpoint, SslType::SimClr)
            .map(|_| ())
            .unwrap_err();
        assert!(matches!(err, Error::CheckpointLoad { ref tensor, .. } if tensor == "backbone.conv4.conv.weight"));
    }

    #[test]
    fn test_provider_cycles_checkpoints() {
        let dir = TempDir::new().unwrap();
        let first = model(ModelArchitecture::SimpleCnn, 3);
        let second = model(ModelArchitecture::SimpleCnn, 3);
        let path_a = dir.path().join("a.json");
        let path_b = dir.path().join("b.json");
        first.export_encoder_checkpoint(&path_a, SslType::SimClr).unwrap();
        second.export_encoder_checkpoint(&path_b, SslType::SimClr).unwrap();

        let config = SelfSupervisionConfig {
            checkpoints: vec![
                path_a.display().to_string(),
                format!("file://{}", path_b.display()),
            ],
            ssl_type: SslType::SimClr,
            encoder_name: "simple_cnn".to_string(),
            freeze_encoder_epochs: 2,
        };
        let provider = EncoderProvider::from_config(&config, ModelArchitecture::SimpleCnn).unwrap();

        let peer_0 = provider.warm_start(model(ModelArchitecture::SimpleCnn, 3), 0).unwrap();
        let peer_1 = provider.warm_start(model(ModelArchitecture::SimpleCnn, 3), 1).unwrap();
        let peer_2 = provider.warm_start(model(ModelArchitecture::SimpleCnn, 3), 2).unwrap();
        assert_eq!(backbone(&peer_0), backbone(&first));
        assert_eq!(backbone(&peer_1), backbone(&second));
        assert_eq!(backbone(&peer_2), backbone(&first));

        assert!(provider.is_frozen_at(1));
        assert!(!provider.is_frozen_at(2));
    }

    #[test]
    fn test_provider_rejects_other_backbone() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("resnet.json");
        model(ModelArchitecture::ResNet18, 3)
            .export_encoder_checkpoint(&path, SslType::SimClr)
            .unwrap();

        let config = SelfSupervisionConfig {
            checkpoints: vec![path.display().to_string()],
            ssl_type: SslType::SimClr,
            encoder_name: "simple_cnn".to_string(),
            freeze_encoder_epochs: 0,
        };
        let result = EncoderProvider::from_config(&config, ModelArchitecture::SimpleCnn);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_missing_file_and_version() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("enc.json");
        assert!(matches!(
            EncoderCheckpoint::load(&path.display().to_string()),
            Err(Error::NotFound(_))
        ));

        let mut checkpoint = model(ModelArchitecture::SimpleCnn, 3)
            .encoder_checkpoint(SslType::SimClr)
            .unwrap();
        checkpoint.format_version = 99;
        checkpoint.save(&path).unwrap();
        assert!(matches!(
            EncoderCheckpoint::load(&path.display().to_string()),
            Err(Error::CheckpointLoad { .. })
        ));
    }
}
