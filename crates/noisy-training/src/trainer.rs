//! Single-model training step and the step bookkeeping shared with
//! co-teaching.

use noisy_core::{EpochMetrics, Error, Result};
use tracing::warn;

use crate::peer::{BatchView, Peer, PeerForward, PeerUpdate, UpdateOutcome};
use crate::selection::label_precision;

/// Consecutive non-finite steps after which a peer aborts the run
pub const MAX_CONSECUTIVE_FAILURES: usize = 3;

/// Counts consecutive skipped updates of one peer
#[derive(Debug, Clone, Default)]
pub struct FailureTracker {
    consecutive: usize,
}

impl FailureTracker {
    pub fn consecutive(&self) -> usize {
        self.consecutive
    }

    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    /// Errors once the peer has failed [`MAX_CONSECUTIVE_FAILURES`] times in a row.
    pub fn record_failure(&mut self, peer: &str) -> Result<()> {
        self.consecutive += 1;
        if self.consecutive >= MAX_CONSECUTIVE_FAILURES {
            return Err(Error::NumericalInstability {
                peer: peer.to_string(),
                consecutive: self.consecutive,
            });
        }
        Ok(())
    }
}

/// What one peer did in one step
#[derive(Debug, Clone, PartialEq)]
pub struct PeerStepReport {
    pub name: String,
    /// Loss of the applied update, or the mean forward loss when the peer
    /// does not train itself
    pub loss: Option<f32>,
    /// The peer's own small-loss selection (batch positions)
    pub selected: Vec<usize>,
    /// Positions the peer's update actually used
    pub trained_on: Vec<usize>,
    /// Update skipped because of a non-finite loss
    pub skipped: bool,
    pub label_precision: Option<f64>,
}

/// Diagnostics of one optimization step
#[derive(Debug, Clone, PartialEq)]
pub struct StepResult {
    pub epoch: usize,
    pub batch_len: usize,
    pub forget_rate: f64,
    pub keep_count: usize,
    /// Fraction of the batch both peers selected
    pub agreed_clean_fraction: Option<f64>,
    pub peers: Vec<PeerStepReport>,
}

impl StepResult {
    /// Adds this step to the running epoch aggregates.
    pub fn accumulate_into(&self, metrics: &mut EpochMetrics) {
        metrics.steps += 1;
        if let Some(agreed) = self.agreed_clean_fraction {
            metrics.agreed_clean_fraction.push(agreed);
        }
        for report in &self.peers {
            let Some(peer) = metrics.peers.iter_mut().find(|p| p.name == report.name) else {
                continue;
            };
            if report.skipped {
                peer.skipped_updates += 1;
                continue;
            }
            if let Some(loss) = report.loss {
                peer.loss.push(loss as f64);
            }
            if self.batch_len > 0 {
                peer.kept_fraction
                    .push(report.trained_on.len() as f64 / self.batch_len as f64);
            }
            if let Some(precision) = report.label_precision {
                peer.label_precision.push(precision);
            }
        }
    }
}

/// Runs one peer's update on `positions` of the batch it forwarded.
///
/// A non-finite forward or update loss skips the update, logs a warning and
/// counts against the peer's failure budget.
pub fn train_on_selection<P: Peer>(
    peer: &mut P,
    forward: PeerForward<P::Forward>,
    update: PeerUpdate,
    learning_rate: f64,
    tracker: &mut FailureTracker,
    batch: &P::Batch,
    epoch: usize,
) -> Result<PeerStepReport> {
    let precision = label_precision(&update.positions, batch.observed_labels(), batch.true_labels());
    let mut report = PeerStepReport {
        name: peer.name().to_string(),
        loss: None,
        selected: Vec::new(),
        trained_on: update.positions.clone(),
        skipped: false,
        label_precision: precision,
    };

    if !forward.is_finite() {
        warn!(peer = %peer.name(), epoch, "Non-finite forward loss, skipping update");
        report.skipped = true;
        tracker.record_failure(peer.name())?;
        return Ok(report);
    }

    match peer.apply_update(forward.state, &update, learning_rate)? {
        UpdateOutcome::Applied { loss } => {
            tracker.record_success();
            report.loss = Some(loss);
        }
        UpdateOutcome::NonFinite { loss } => {
            warn!(peer = %peer.name(), epoch, loss, "Non-finite update loss, skipping update");
            report.skipped = true;
            tracker.record_failure(peer.name())?;
        }
    }
    Ok(report)
}

/// Plain supervised training of one peer on every sample of each batch
pub struct SingleModelTrainer<P: Peer> {
    peer: P,
    tracker: FailureTracker,
    learning_rate: f64,
}

impl<P: Peer> SingleModelTrainer<P> {
    pub fn new(peer: P, learning_rate: f64) -> Self {
        Self {
            peer,
            tracker: FailureTracker::default(),
            learning_rate,
        }
    }

    pub fn run_step(&mut self, batch: &P::Batch, epoch: usize) -> Result<StepResult> {
        let batch_len = batch.len();
        if batch_len == 0 {
            return Err(Error::InvalidArgument("empty batch".to_string()));
        }

        let forward = self.peer.forward(batch)?;
        let all: Vec<usize> = (0..batch_len).collect();
        let mut report = train_on_selection(
            &mut self.peer,
            forward,
            PeerUpdate::positions(all.clone()),
            self.learning_rate,
            &mut self.tracker,
            batch,
            epoch,
        )?;
        report.selected = all;

        Ok(StepResult {
            epoch,
            batch_len,
            forget_rate: 0.0,
            keep_count: batch_len,
            agreed_clean_fraction: None,
            peers: vec![report],
        })
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn set_learning_rate(&mut self, learning_rate: f64) {
        self.learning_rate = learning_rate;
    }

    pub fn peer(&self) -> &P {
        &self.peer
    }

    pub fn peer_mut(&mut self) -> &mut P {
        &mut self.peer
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted peer for deterministic trainer tests.

    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;
    use std::path::Path;

    use noisy_core::Result;

    use crate::model::{NamedTensor, ParameterSet};
    use crate::peer::{BatchView, Peer, PeerForward, PeerUpdate, UpdateOutcome};

    pub struct ScriptedBatch {
        pub indices: Vec<usize>,
        pub observed: Vec<usize>,
        pub clean: Vec<Option<usize>>,
    }

    impl ScriptedBatch {
        pub fn new(len: usize) -> Self {
            Self {
                indices: (0..len).collect(),
                observed: vec![0; len],
                clean: vec![None; len],
            }
        }
    }

    impl BatchView for ScriptedBatch {
        fn len(&self) -> usize {
            self.indices.len()
        }

        fn sample_indices(&self) -> &[usize] {
            &self.indices
        }

        fn observed_labels(&self) -> &[usize] {
            &self.observed
        }

        fn true_labels(&self) -> &[Option<usize>] {
            &self.clean
        }
    }

    /// Returns queued per-sample losses (then the defaults) and records
    /// every update.
    ///
    /// Its single "parameter" counts applied updates, so an unchanged
    /// parameter set means the peer was not stepped.
    pub struct ScriptedPeer {
        pub name: String,
        pub losses: RefCell<VecDeque<Vec<f32>>>,
        pub default_losses: Vec<f32>,
        pub updates: Vec<PeerUpdate>,
        pub applied: usize,
        pub ema_calls: Vec<f64>,
        pub frozen: bool,
        pub probabilities: Vec<f32>,
        pub probability_calls: Cell<usize>,
    }

    impl ScriptedPeer {
        pub fn new(name: &str, default_losses: Vec<f32>) -> Self {
            Self {
                name: name.to_string(),
                losses: RefCell::new(VecDeque::new()),
                default_losses,
                updates: Vec::new(),
                applied: 0,
                ema_calls: Vec::new(),
                frozen: false,
                probabilities: vec![0.5, 0.5],
                probability_calls: Cell::new(0),
            }
        }

        pub fn then(self, losses: Vec<f32>) -> Self {
            self.losses.borrow_mut().push_back(losses);
            self
        }
    }

    impl Peer for ScriptedPeer {
        type Batch = ScriptedBatch;
        type Forward = Vec<f32>;

        fn name(&self) -> &str {
            &self.name
        }

        fn forward(&self, batch: &ScriptedBatch) -> Result<PeerForward<Vec<f32>>> {
            let mut losses = self
                .losses
                .borrow_mut()
                .pop_front()
                .unwrap_or_else(|| self.default_losses.clone());
            losses.resize(batch.len(), 1.0);
            Ok(PeerForward {
                losses: losses.clone(),
                state: losses,
            })
        }

        fn probabilities(&self, _forward: &Vec<f32>, positions: &[usize]) -> Result<Vec<Vec<f32>>> {
            self.probability_calls.set(self.probability_calls.get() + 1);
            Ok(positions.iter().map(|_| self.probabilities.clone()).collect())
        }

        fn apply_update(
            &mut self,
            forward: Vec<f32>,
            update: &PeerUpdate,
            _learning_rate: f64,
        ) -> Result<UpdateOutcome> {
            self.updates.push(update.clone());
            let loss = update.positions.iter().map(|&p| forward[p]).sum::<f32>()
                / update.positions.len() as f32;
            if loss.is_finite() {
                self.applied += 1;
                Ok(UpdateOutcome::Applied { loss })
            } else {
                Ok(UpdateOutcome::NonFinite { loss })
            }
        }

        fn teacher_copy(&self, name: &str) -> Result<Self> {
            Ok(ScriptedPeer::new(name, self.default_losses.clone()))
        }

        fn track_ema(&mut self, _source: &Self, decay: f64) -> Result<()> {
            self.ema_calls.push(decay);
            Ok(())
        }

        fn set_backbone_frozen(&mut self, frozen: bool) -> Result<()> {
            self.frozen = frozen;
            Ok(())
        }

        fn parameters(&self) -> Result<ParameterSet> {
            let mut params = ParameterSet::new();
            params.insert(
                "backbone.steps".to_string(),
                NamedTensor {
                    shape: vec![1],
                    values: vec![self.applied as f32],
                },
            );
            Ok(params)
        }

        fn save(&self, dir: &Path) -> Result<()> {
            std::fs::write(dir.join(&self.name), self.applied.to_string())?;
            Ok(())
        }

        fn load(&mut self, dir: &Path) -> Result<()> {
            let content = std::fs::read_to_string(dir.join(&self.name))?;
            self.applied = content.trim().parse().unwrap_or(0);
            Ok(())
        }
    }
}
