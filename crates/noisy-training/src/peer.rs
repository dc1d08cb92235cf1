//! Peers: one model and its optimizer, seen through the operations the
//! trainers need.
//!
//! The trainers only talk to [`Peer`]; [`BurnPeer`] is the burn-backed
//! implementation used by the `train` tool.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use burn::{
    module::Module,
    optim::{GradientsParams, Optimizer},
    record::{CompactRecorder, Recorder},
    tensor::{activation::softmax, backend::AutodiffBackend, ElementConversion, Tensor},
};
use noisy_core::{Error, Result};
use noisy_dataset::TrainingBatch;
use tracing::debug;

use crate::loss::{consistency_penalty, host_values, index_tensor, per_sample_objective, LossConfig};
use crate::model::{NoisyClassifier, ParameterSet};

/// Host-side view of a batch
pub trait BatchView {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dataset index of each batch position
    fn sample_indices(&self) -> &[usize];

    fn observed_labels(&self) -> &[usize];

    /// Clean labels, for diagnostics only
    fn true_labels(&self) -> &[Option<usize>];
}

impl<B: burn::tensor::backend::Backend> BatchView for TrainingBatch<B> {
    fn len(&self) -> usize {
        self.indices.len()
    }

    fn sample_indices(&self) -> &[usize] {
        &self.indices
    }

    fn observed_labels(&self) -> &[usize] {
        &self.observed_labels
    }

    fn true_labels(&self) -> &[Option<usize>] {
        &self.true_labels
    }
}

/// Result of a peer's forward pass over a full batch
pub struct PeerForward<F> {
    /// Per-sample objective, parallel to the batch
    pub losses: Vec<f32>,
    /// Whatever the peer needs to run the backward pass later
    pub state: F,
}

impl<F> PeerForward<F> {
    pub fn is_finite(&self) -> bool {
        self.losses.iter().all(|l| l.is_finite())
    }

    /// Mean of the finite per-sample losses
    pub fn mean_loss(&self) -> Option<f32> {
        let finite: Vec<f32> = self.losses.iter().copied().filter(|l| l.is_finite()).collect();
        (!finite.is_empty()).then(|| finite.iter().sum::<f32>() / finite.len() as f32)
    }
}

/// Consistency term for the positions a peer does not train on
#[derive(Debug, Clone, PartialEq)]
pub struct ConsistencyTarget {
    pub weight: f64,
    pub positions: Vec<usize>,
    /// Partner probabilities for `positions`, treated as constants
    pub probabilities: Vec<Vec<f32>>,
}

/// What a peer trains on in one step
#[derive(Debug, Clone, PartialEq)]
pub struct PeerUpdate {
    /// Batch positions that feed the loss
    pub positions: Vec<usize>,
    pub consistency: Option<ConsistencyTarget>,
}

impl PeerUpdate {
    pub fn positions(positions: Vec<usize>) -> Self {
        Self {
            positions,
            consistency: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UpdateOutcome {
    /// Optimizer stepped on a finite loss
    Applied { loss: f32 },
    /// Loss was not finite; parameters are unchanged
    NonFinite { loss: f32 },
}

/// One trainable model as the trainers see it
pub trait Peer {
    type Batch: BatchView;
    type Forward;

    fn name(&self) -> &str;

    /// Per-sample objective over the whole batch, no parameter change.
    fn forward(&self, batch: &Self::Batch) -> Result<PeerForward<Self::Forward>>;

    /// Predicted class probabilities at `positions`.
    fn probabilities(&self, forward: &Self::Forward, positions: &[usize]) -> Result<Vec<Vec<f32>>>;

    /// Backward pass and optimizer step on `update.positions`.
    fn apply_update(
        &mut self,
        forward: Self::Forward,
        update: &PeerUpdate,
        learning_rate: f64,
    ) -> Result<UpdateOutcome>;

    /// Untrainable copy of this peer under a new name, to be tracked with
    /// [`Peer::track_ema`].
    fn teacher_copy(&self, name: &str) -> Result<Self>
    where
        Self: Sized;

    /// `self = decay * self + (1 - decay) * source`
    fn track_ema(&mut self, source: &Self, decay: f64) -> Result<()>;

    /// Freezes or unfreezes the backbone; unfreezing rebuilds optimizer state.
    fn set_backbone_frozen(&mut self, frozen: bool) -> Result<()>;

    fn parameters(&self) -> Result<ParameterSet>;

    /// Writes model and optimizer state under `dir`.
    fn save(&self, dir: &Path) -> Result<()>;

    /// Restores state written by [`Peer::save`].
    fn load(&mut self, dir: &Path) -> Result<()>;
}

/// Forward state kept between selection and the backward pass
pub struct BurnForward<B: AutodiffBackend> {
    logits: Tensor<B, 2>,
    objective: Tensor<B, 1>,
}

/// Builds a fresh optimizer for a peer
pub type OptimizerFactory<O> = Arc<dyn Fn() -> O + Send + Sync>;

/// Burn model plus optimizer
pub struct BurnPeer<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<NoisyClassifier<B>, B>,
{
    name: String,
    model: NoisyClassifier<B>,
    optimizer: O,
    optimizer_factory: OptimizerFactory<O>,
    loss: LossConfig,
    frozen: bool,
    /// False for EMA teachers, which never receive gradients
    trainable: bool,
    device: B::Device,
}

impl<B, O> BurnPeer<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<NoisyClassifier<B>, B>,
{
    pub fn new(
        name: impl Into<String>,
        model: NoisyClassifier<B>,
        optimizer_factory: OptimizerFactory<O>,
        loss: LossConfig,
        device: B::Device,
    ) -> Self {
        let optimizer = optimizer_factory();
        Self {
            name: name.into(),
            model,
            optimizer,
            optimizer_factory,
            loss,
            frozen: false,
            trainable: true,
            device,
        }
    }

    /// Copy of this peer's model that never receives gradients, used as an
    /// EMA teacher.
    pub fn ema_copy(&self, name: impl Into<String>) -> Self {
        let mut teacher = Self::new(
            name,
            self.model.clone().with_trainable(false),
            self.optimizer_factory.clone(),
            self.loss,
            self.device.clone(),
        );
        teacher.trainable = false;
        teacher
    }

    pub fn model(&self) -> &NoisyClassifier<B> {
        &self.model
    }

    /// Replaces the model, e.g. after encoder injection.
    pub fn set_model(&mut self, model: NoisyClassifier<B>) {
        self.model = model;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    fn model_path(&self, dir: &Path) -> PathBuf {
        dir.join(format!("{}_model", self.name))
    }

    fn optimizer_path(&self, dir: &Path) -> PathBuf {
        dir.join(format!("{}_optimizer", self.name))
    }
}

impl<B, O> Peer for BurnPeer<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<NoisyClassifier<B>, B>,
{
    type Batch = TrainingBatch<B>;
    type Forward = BurnForward<B>;

    fn name(&self) -> &str {
        &self.name
    }

    fn forward(&self, batch: &TrainingBatch<B>) -> Result<PeerForward<BurnForward<B>>> {
        let logits = self.model.forward(batch.images.clone());
        let objective = per_sample_objective(logits.clone(), batch.targets.clone(), &self.loss);
        let losses = host_values(objective.clone().detach())?;

        Ok(PeerForward {
            losses,
            state: BurnForward { logits, objective },
        })
    }

    fn probabilities(&self, forward: &BurnForward<B>, positions: &[usize]) -> Result<Vec<Vec<f32>>> {
        if positions.is_empty() {
            return Ok(Vec::new());
        }
        let [_, num_classes] = forward.logits.dims();
        let selected = forward
            .logits
            .clone()
            .detach()
            .select(0, index_tensor::<B>(positions, &self.device));
        let values = host_values(softmax(selected, 1))?;
        Ok(values.chunks(num_classes).map(|row| row.to_vec()).collect())
    }

    fn apply_update(
        &mut self,
        forward: BurnForward<B>,
        update: &PeerUpdate,
        learning_rate: f64,
    ) -> Result<UpdateOutcome> {
        if update.positions.is_empty() {
            return Err(Error::Training(format!("{}: empty update selection", self.name)));
        }

        let kept = forward
            .objective
            .select(0, index_tensor::<B>(&update.positions, &self.device));
        let mut loss = kept.mean();

        if let Some(target) = &update.consistency {
            if !target.positions.is_empty() && target.weight > 0.0 {
                let penalty = consistency_penalty(
                    forward.logits,
                    &target.positions,
                    &target.probabilities,
                    target.weight,
                )?;
                loss = loss.add(penalty);
            }
        }

        let value: f32 = loss.clone().into_scalar().elem();
        if !value.is_finite() {
            return Ok(UpdateOutcome::NonFinite { loss: value });
        }

        let grads = loss.backward();
        let grads = GradientsParams::from_grads(grads, &self.model);
        self.model = self.optimizer.step(learning_rate, self.model.clone(), grads);

        Ok(UpdateOutcome::Applied { loss: value })
    }

    fn teacher_copy(&self, name: &str) -> Result<Self> {
        Ok(self.ema_copy(name))
    }

    fn track_ema(&mut self, source: &Self, decay: f64) -> Result<()> {
        let parameters = source.model.export_parameters()?;
        self.model = self.model.clone().blend_parameters(&parameters, decay)?;
        Ok(())
    }

    fn set_backbone_frozen(&mut self, frozen: bool) -> Result<()> {
        if self.frozen == frozen {
            return Ok(());
        }
        self.model = self.model.clone().with_backbone_trainable(!frozen);
        self.frozen = frozen;
        if !frozen {
            // Moment estimates from the frozen phase cover the head only.
            self.optimizer = (self.optimizer_factory)();
        }
        debug!(peer = %self.name, frozen, "Backbone trainability changed");
        Ok(())
    }

    fn parameters(&self) -> Result<ParameterSet> {
        self.model.export_parameters()
    }

    fn save(&self, dir: &Path) -> Result<()> {
        let recorder = CompactRecorder::new();
        self.model
            .clone()
            .save_file(self.model_path(dir), &recorder)
            .map_err(|e| Error::Model(format!("Failed to save model {}: {:?}", self.name, e)))?;
        recorder
            .record(self.optimizer.to_record(), self.optimizer_path(dir))
            .map_err(|e| Error::Model(format!("Failed to save optimizer {}: {:?}", self.name, e)))?;
        Ok(())
    }

    fn load(&mut self, dir: &Path) -> Result<()> {
        let recorder = CompactRecorder::new();
        let record = recorder
            .load(self.model_path(dir), &self.device)
            .map_err(|e| Error::Model(format!("Failed to load model {}: {:?}", self.name, e)))?;
        let model = self.model.clone().load_record(record);
        // Records carry values only; reapply the gradient flags.
        self.model = if !self.trainable {
            model.with_trainable(false)
        } else if self.frozen {
            model.with_backbone_trainable(false)
        } else {
            model
        };

        let record = recorder
            .load(self.optimizer_path(dir), &self.device)
            .map_err(|e| Error::Model(format!("Failed to load optimizer {}: {:?}", self.name, e)))?;
        self.optimizer = (self.optimizer_factory)().load_record(record);
        Ok(())
    }
}
