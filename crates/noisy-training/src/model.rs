//! Classifier backbones with named-parameter access.
//!
//! Every model is a backbone followed by global pooling and a linear head.
//! Parameters are addressed by dotted names (`backbone.stem.conv.weight`,
//! `head.bias`, ...) so encoder warm-start, freezing and EMA tracking can
//! work on the backbone namespace without knowing the concrete layout.

use std::collections::BTreeMap;

use burn::{
    config::Config,
    module::{Module, Param, RunningState},
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d,
        Relu,
    },
    tensor::{backend::Backend, Tensor, TensorData},
};
use noisy_core::{Error, ModelArchitecture};
use serde::{Deserialize, Serialize};

/// Namespace of all backbone parameters
pub const BACKBONE_PREFIX: &str = "backbone.";

/// Host copy of one named tensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedTensor {
    pub shape: Vec<usize>,
    pub values: Vec<f32>,
}

/// Named tensors, ordered by name
pub type ParameterSet = BTreeMap<String, NamedTensor>;

/// Visits every learnable parameter and running statistic of a model.
pub trait ParamVisitor<B: Backend> {
    fn param<const D: usize>(&mut self, name: &str, param: Param<Tensor<B, D>>)
        -> Param<Tensor<B, D>>;

    fn buffer<const D: usize>(
        &mut self,
        _name: &str,
        buffer: RunningState<Tensor<B, D>>,
    ) -> RunningState<Tensor<B, D>> {
        buffer
    }
}

fn visit_conv<B: Backend, V: ParamVisitor<B>>(
    mut conv: Conv2d<B>,
    prefix: &str,
    visitor: &mut V,
) -> Conv2d<B> {
    conv.weight = visitor.param(&format!("{prefix}.weight"), conv.weight);
    conv.bias = conv
        .bias
        .map(|bias| visitor.param(&format!("{prefix}.bias"), bias));
    conv
}

fn visit_batch_norm<B: Backend, V: ParamVisitor<B>>(
    mut bn: BatchNorm<B, 2>,
    prefix: &str,
    visitor: &mut V,
) -> BatchNorm<B, 2> {
    bn.gamma = visitor.param(&format!("{prefix}.gamma"), bn.gamma);
    bn.beta = visitor.param(&format!("{prefix}.beta"), bn.beta);
    bn.running_mean = visitor.buffer(&format!("{prefix}.running_mean"), bn.running_mean);
    bn.running_var = visitor.buffer(&format!("{prefix}.running_var"), bn.running_var);
    bn
}

fn visit_linear<B: Backend, V: ParamVisitor<B>>(
    mut linear: Linear<B>,
    prefix: &str,
    visitor: &mut V,
) -> Linear<B> {
    linear.weight = visitor.param(&format!("{prefix}.weight"), linear.weight);
    linear.bias = linear
        .bias
        .map(|bias| visitor.param(&format!("{prefix}.bias"), bias));
    linear
}

/// Conv2d, BatchNorm, ReLU and optional max-pooling
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    pub conv: Conv2d<B>,
    pub bn: BatchNorm<B, 2>,
    pub relu: Relu,
    pub pool: Option<MaxPool2d>,
}

impl<B: Backend> ConvBlock<B> {
    pub fn new(in_channels: usize, out_channels: usize, with_pool: bool, device: &B::Device) -> Self {
        let conv = Conv2dConfig::new([in_channels, out_channels], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device);
        let bn = BatchNormConfig::new(out_channels).init(device);
        let pool = with_pool.then(|| MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init());

        Self {
            conv,
            bn,
            relu: Relu::new(),
            pool,
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.bn.forward(x);
        let x = self.relu.forward(x);

        match &self.pool {
            Some(pool) => pool.forward(x),
            None => x,
        }
    }

    fn visit<V: ParamVisitor<B>>(mut self, prefix: &str, visitor: &mut V) -> Self {
        self.conv = visit_conv(self.conv, &format!("{prefix}.conv"), visitor);
        self.bn = visit_batch_norm(self.bn, &format!("{prefix}.bn"), visitor);
        self
    }
}

/// Four conv blocks, the first three followed by 2x2 max-pooling
#[derive(Module, Debug)]
pub struct SimpleCnn<B: Backend> {
    pub conv1: ConvBlock<B>,
    pub conv2: ConvBlock<B>,
    pub conv3: ConvBlock<B>,
    pub conv4: ConvBlock<B>,
}

impl<B: Backend> SimpleCnn<B> {
    pub fn new(in_channels: usize, base_width: usize, device: &B::Device) -> Self {
        Self {
            conv1: ConvBlock::new(in_channels, base_width, true, device),
            conv2: ConvBlock::new(base_width, base_width * 2, true, device),
            conv3: ConvBlock::new(base_width * 2, base_width * 4, true, device),
            conv4: ConvBlock::new(base_width * 4, base_width * 8, false, device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv1.forward(x);
        let x = self.conv2.forward(x);
        let x = self.conv3.forward(x);
        self.conv4.forward(x)
    }

    fn visit<V: ParamVisitor<B>>(mut self, prefix: &str, visitor: &mut V) -> Self {
        self.conv1 = self.conv1.visit(&format!("{prefix}.conv1"), visitor);
        self.conv2 = self.conv2.visit(&format!("{prefix}.conv2"), visitor);
        self.conv3 = self.conv3.visit(&format!("{prefix}.conv3"), visitor);
        self.conv4 = self.conv4.visit(&format!("{prefix}.conv4"), visitor);
        self
    }
}

/// 1x1 projection used when a residual block changes shape
#[derive(Module, Debug)]
pub struct Shortcut<B: Backend> {
    pub conv: Conv2d<B>,
    pub bn: BatchNorm<B, 2>,
}

/// Two 3x3 convolutions with an identity or projected skip connection
#[derive(Module, Debug)]
pub struct ResidualBlock<B: Backend> {
    pub conv1: Conv2d<B>,
    pub bn1: BatchNorm<B, 2>,
    pub conv2: Conv2d<B>,
    pub bn2: BatchNorm<B, 2>,
    pub shortcut: Option<Shortcut<B>>,
    pub relu: Relu,
}

impl<B: Backend> ResidualBlock<B> {
    pub fn new(in_channels: usize, out_channels: usize, stride: usize, device: &B::Device) -> Self {
        let conv1 = Conv2dConfig::new([in_channels, out_channels], [3, 3])
            .with_stride([stride, stride])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device);
        let conv2 = Conv2dConfig::new([out_channels, out_channels], [3, 3])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init(device);

        let shortcut = (stride != 1 || in_channels != out_channels).then(|| Shortcut {
            conv: Conv2dConfig::new([in_channels, out_channels], [1, 1])
                .with_stride([stride, stride])
                .init(device),
            bn: BatchNormConfig::new(out_channels).init(device),
        });

        Self {
            conv1,
            bn1: BatchNormConfig::new(out_channels).init(device),
            conv2,
            bn2: BatchNormConfig::new(out_channels).init(device),
            shortcut,
            relu: Relu::new(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = match &self.shortcut {
            Some(shortcut) => shortcut.bn.forward(shortcut.conv.forward(x.clone())),
            None => x.clone(),
        };

        let x = self.conv1.forward(x);
        let x = self.bn1.forward(x);
        let x = self.relu.forward(x);
        let x = self.conv2.forward(x);
        let x = self.bn2.forward(x);
        self.relu.forward(x.add(identity))
    }

    fn visit<V: ParamVisitor<B>>(mut self, prefix: &str, visitor: &mut V) -> Self {
        self.conv1 = visit_conv(self.conv1, &format!("{prefix}.conv1"), visitor);
        self.bn1 = visit_batch_norm(self.bn1, &format!("{prefix}.bn1"), visitor);
        self.conv2 = visit_conv(self.conv2, &format!("{prefix}.conv2"), visitor);
        self.bn2 = visit_batch_norm(self.bn2, &format!("{prefix}.bn2"), visitor);
        self.shortcut = self.shortcut.map(|mut shortcut| {
            shortcut.conv = visit_conv(shortcut.conv, &format!("{prefix}.shortcut.conv"), visitor);
            shortcut.bn = visit_batch_norm(shortcut.bn, &format!("{prefix}.shortcut.bn"), visitor);
            shortcut
        });
        self
    }
}

/// ResNet-18/34 layout with a 3x3 stem for small inputs
#[derive(Module, Debug)]
pub struct ResNet<B: Backend> {
    pub stem: ConvBlock<B>,
    pub blocks: Vec<ResidualBlock<B>>,
    depth: usize,
}

impl<B: Backend> ResNet<B> {
    /// `depth` is 18 or 34; anything else is rejected.
    pub fn new(
        depth: usize,
        in_channels: usize,
        base_width: usize,
        device: &B::Device,
    ) -> noisy_core::Result<Self> {
        let blocks_per_stage: [usize; 4] = match depth {
            18 => [2, 2, 2, 2],
            34 => [3, 4, 6, 3],
            other => {
                return Err(Error::Model(format!("unsupported ResNet depth {other}")));
            }
        };

        let stem = ConvBlock::new(in_channels, base_width, false, device);
        let mut blocks = Vec::new();
        let mut channels = base_width;
        for (stage, count) in blocks_per_stage.iter().enumerate() {
            let out_channels = base_width << stage;
            for i in 0..*count {
                let stride = if stage > 0 && i == 0 { 2 } else { 1 };
                blocks.push(ResidualBlock::new(channels, out_channels, stride, device));
                channels = out_channels;
            }
        }

        Ok(Self {
            stem,
            blocks,
            depth,
        })
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let mut x = self.stem.forward(x);
        for block in &self.blocks {
            x = block.forward(x);
        }
        x
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    fn visit<V: ParamVisitor<B>>(mut self, prefix: &str, visitor: &mut V) -> Self {
        self.stem = self.stem.visit(&format!("{prefix}.stem"), visitor);
        self.blocks = self
            .blocks
            .into_iter()
            .enumerate()
            .map(|(i, block)| block.visit(&format!("{prefix}.blocks.{i}"), visitor))
            .collect();
        self
    }
}

/// Feature extractor in front of the classification head
#[derive(Module, Debug)]
pub enum Backbone<B: Backend> {
    Simple(SimpleCnn<B>),
    Residual(ResNet<B>),
}

impl<B: Backend> Backbone<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            Backbone::Simple(model) => model.forward(x),
            Backbone::Residual(model) => model.forward(x),
        }
    }

    pub fn architecture(&self) -> ModelArchitecture {
        match self {
            Backbone::Simple(_) => ModelArchitecture::SimpleCnn,
            Backbone::Residual(model) if model.depth() == 34 => ModelArchitecture::ResNet34,
            Backbone::Residual(_) => ModelArchitecture::ResNet18,
        }
    }

    fn visit<V: ParamVisitor<B>>(self, prefix: &str, visitor: &mut V) -> Self {
        match self {
            Backbone::Simple(model) => Backbone::Simple(model.visit(prefix, visitor)),
            Backbone::Residual(model) => Backbone::Residual(model.visit(prefix, visitor)),
        }
    }
}

/// Configuration for [`NoisyClassifier`]
#[derive(Config, Debug)]
pub struct NoisyClassifierConfig {
    pub architecture: ModelArchitecture,
    pub num_classes: usize,

    /// Number of input channels
    #[config(default = "3")]
    pub in_channels: usize,

    /// Width of the first stage; later stages double it
    #[config(default = "64")]
    pub base_width: usize,

    #[config(default = "0.0")]
    pub dropout: f64,
}

impl NoisyClassifierConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> noisy_core::Result<NoisyClassifier<B>> {
        if self.num_classes < 2 {
            return Err(Error::Model(format!(
                "a classifier needs at least 2 classes, got {}",
                self.num_classes
            )));
        }
        let base = self.base_width;

        let (backbone, features) = match self.architecture {
            ModelArchitecture::SimpleCnn => (
                Backbone::Simple(SimpleCnn::new(self.in_channels, base, device)),
                base * 8,
            ),
            ModelArchitecture::ResNet18 => (
                Backbone::Residual(ResNet::new(18, self.in_channels, base, device)?),
                base * 8,
            ),
            ModelArchitecture::ResNet34 => (
                Backbone::Residual(ResNet::new(34, self.in_channels, base, device)?),
                base * 8,
            ),
        };

        Ok(NoisyClassifier {
            backbone,
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            dropout: DropoutConfig::new(self.dropout).init(),
            head: LinearConfig::new(features, self.num_classes).init(device),
            num_classes: self.num_classes,
        })
    }
}

/// Backbone, global average pooling and a linear head
#[derive(Module, Debug)]
pub struct NoisyClassifier<B: Backend> {
    pub backbone: Backbone<B>,
    pub pool: AdaptiveAvgPool2d,
    pub dropout: Dropout,
    pub head: Linear<B>,
    num_classes: usize,
}

impl<B: Backend> NoisyClassifier<B> {
    /// Logits of shape [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.backbone.forward(images);
        let x = self.pool.forward(x);
        let [batch_size, channels, _, _] = x.dims();
        let x = x.reshape([batch_size, channels]);
        let x = self.dropout.forward(x);
        self.head.forward(x)
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn architecture(&self) -> ModelArchitecture {
        self.backbone.architecture()
    }

    /// Applies `visitor` to every parameter and buffer, in a stable order.
    pub fn visit_parameters<V: ParamVisitor<B>>(mut self, visitor: &mut V) -> Self {
        self.backbone = self.backbone.visit("backbone", visitor);
        self.head = visit_linear(self.head, "head", visitor);
        self
    }

    /// Host copy of every named tensor
    pub fn export_parameters(&self) -> noisy_core::Result<ParameterSet> {
        let mut exporter = Exporter::default();
        let _ = self.clone().visit_parameters(&mut exporter);
        match exporter.error {
            Some(err) => Err(err),
            None => Ok(exporter.tensors),
        }
    }

    /// Overwrites the named tensors found in `tensors`.
    ///
    /// Every entry must name an existing tensor of the same shape; this is
    /// checked before anything is replaced.
    pub fn import_parameters(self, tensors: &ParameterSet) -> noisy_core::Result<Self> {
        let shapes = self.parameter_shapes()?;
        for (name, tensor) in tensors {
            match shapes.get(name) {
                None => {
                    return Err(Error::CheckpointLoad {
                        tensor: name.clone(),
                        reason: "no parameter with this name in the model".to_string(),
                    })
                }
                Some(shape) => check_tensor(name, shape, tensor)?,
            }
        }

        let mut importer = Importer { source: tensors };
        Ok(self.visit_parameters(&mut importer))
    }

    /// Moves every named tensor towards `source`: `self = d*self + (1-d)*source`.
    pub fn blend_parameters(self, source: &ParameterSet, decay: f64) -> noisy_core::Result<Self> {
        let shapes = self.parameter_shapes()?;
        for (name, shape) in &shapes {
            let tensor = source.get(name).ok_or_else(|| Error::CheckpointLoad {
                tensor: name.clone(),
                reason: "missing from EMA source".to_string(),
            })?;
            check_tensor(name, shape, tensor)?;
        }

        let mut blender = Blender {
            source,
            decay: decay as f32,
        };
        Ok(self.visit_parameters(&mut blender))
    }

    /// Marks backbone parameters as (non-)trainable; the head is untouched.
    pub fn with_backbone_trainable(self, trainable: bool) -> Self {
        let mut visitor = Trainability {
            prefix: BACKBONE_PREFIX,
            trainable,
        };
        self.visit_parameters(&mut visitor)
    }

    /// Marks every parameter as (non-)trainable.
    pub fn with_trainable(self, trainable: bool) -> Self {
        let mut visitor = Trainability {
            prefix: "",
            trainable,
        };
        self.visit_parameters(&mut visitor)
    }

    /// Names and shapes of every tensor
    pub fn parameter_shapes(&self) -> noisy_core::Result<BTreeMap<String, Vec<usize>>> {
        Ok(self
            .export_parameters()?
            .into_iter()
            .map(|(name, tensor)| (name, tensor.shape))
            .collect())
    }
}

fn check_tensor(name: &str, expected: &[usize], tensor: &NamedTensor) -> noisy_core::Result<()> {
    if tensor.shape != expected {
        return Err(Error::CheckpointLoad {
            tensor: name.to_string(),
            reason: format!("shape {:?} does not match model shape {:?}", tensor.shape, expected),
        });
    }
    let numel: usize = tensor.shape.iter().product();
    if tensor.values.len() != numel {
        return Err(Error::CheckpointLoad {
            tensor: name.to_string(),
            reason: format!("{} values for shape {:?}", tensor.values.len(), tensor.shape),
        });
    }
    Ok(())
}

fn host_tensor<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> std::result::Result<NamedTensor, String> {
    let data = tensor.into_data().convert::<f32>();
    let shape = data.shape.clone();
    let values = data.to_vec::<f32>().map_err(|e| format!("{e:?}"))?;
    Ok(NamedTensor { shape, values })
}

fn device_tensor<B: Backend, const D: usize>(tensor: &NamedTensor, device: &B::Device) -> Tensor<B, D> {
    Tensor::from_data(
        TensorData::new(tensor.values.clone(), tensor.shape.clone()),
        device,
    )
}

#[derive(Default)]
struct Exporter {
    tensors: ParameterSet,
    error: Option<Error>,
}

impl Exporter {
    fn record<B: Backend, const D: usize>(&mut self, name: &str, tensor: Tensor<B, D>) {
        match host_tensor(tensor) {
            Ok(tensor) => {
                self.tensors.insert(name.to_string(), tensor);
            }
            Err(e) => {
                self.error
                    .get_or_insert_with(|| Error::Model(format!("cannot read tensor '{name}': {e}")));
            }
        }
    }
}

impl<B: Backend> ParamVisitor<B> for Exporter {
    fn param<const D: usize>(&mut self, name: &str, param: Param<Tensor<B, D>>) -> Param<Tensor<B, D>> {
        self.record(name, param.val());
        param
    }

    fn buffer<const D: usize>(
        &mut self,
        name: &str,
        buffer: RunningState<Tensor<B, D>>,
    ) -> RunningState<Tensor<B, D>> {
        self.record(name, buffer.value());
        buffer
    }
}

struct Importer<'a> {
    source: &'a ParameterSet,
}

impl<B: Backend> ParamVisitor<B> for Importer<'_> {
    fn param<const D: usize>(&mut self, name: &str, param: Param<Tensor<B, D>>) -> Param<Tensor<B, D>> {
        let Some(tensor) = self.source.get(name) else {
            return param;
        };
        let current = param.val();
        let require_grad = current.is_require_grad();
        let value = device_tensor::<B, D>(tensor, &current.device());
        Param::initialized(param.id, value.set_require_grad(require_grad))
    }

    fn buffer<const D: usize>(
        &mut self,
        name: &str,
        buffer: RunningState<Tensor<B, D>>,
    ) -> RunningState<Tensor<B, D>> {
        match self.source.get(name) {
            Some(tensor) => {
                let device = buffer.value().device();
                RunningState::new(device_tensor::<B, D>(tensor, &device))
            }
            None => buffer,
        }
    }
}

struct Blender<'a> {
    source: &'a ParameterSet,
    decay: f32,
}

impl Blender<'_> {
    fn blend<B: Backend, const D: usize>(&self, name: &str, current: Tensor<B, D>) -> Tensor<B, D> {
        match self.source.get(name) {
            Some(source) => {
                let source = device_tensor::<B, D>(source, &current.device());
                current
                    .detach()
                    .mul_scalar(self.decay)
                    .add(source.mul_scalar(1.0 - self.decay))
            }
            None => current,
        }
    }
}

impl<B: Backend> ParamVisitor<B> for Blender<'_> {
    fn param<const D: usize>(&mut self, name: &str, param: Param<Tensor<B, D>>) -> Param<Tensor<B, D>> {
        let current = param.val();
        let require_grad = current.is_require_grad();
        let value = self.blend(name, current);
        Param::initialized(param.id, value.set_require_grad(require_grad))
    }

    fn buffer<const D: usize>(
        &mut self,
        name: &str,
        buffer: RunningState<Tensor<B, D>>,
    ) -> RunningState<Tensor<B, D>> {
        RunningState::new(self.blend(name, buffer.value()))
    }
}

struct Trainability {
    prefix: &'static str,
    trainable: bool,
}

impl<B: Backend> ParamVisitor<B> for Trainability {
    fn param<const D: usize>(&mut self, name: &str, param: Param<Tensor<B, D>>) -> Param<Tensor<B, D>> {
        if name.starts_with(self.prefix) {
            param.set_require_grad(self.trainable)
        } else {
            param
        }
    }
}
