//! Co-teaching: two peers pick small-loss samples for each other.
//!
//! One step runs `ForwardBoth -> SelectSamples -> CrossUpdate -> Done`.
//! Peers never share parameters; the only thing crossing between them is
//! the immutable list of positions each one selected.

use std::sync::Arc;

use noisy_core::{Error, NoiseMitigationConfig, Result};
use noisy_dataset::TrustGraph;
use tracing::{debug, warn};

use crate::forget_rate::ForgetRateSchedule;
use crate::peer::{BatchView, ConsistencyTarget, Peer, PeerForward, PeerUpdate};
use crate::selection::{agreement_fraction, excluded_positions, filter_trusted, small_loss_selection};
use crate::trainer::{train_on_selection, FailureTracker, PeerStepReport, StepResult};

/// Selection options of a co-teaching run
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoTeachingOptions {
    pub schedule: ForgetRateSchedule,
    /// Weight of the disagreement penalty on excluded samples, if enabled
    pub consistency_weight: Option<f64>,
}

impl CoTeachingOptions {
    pub fn from_config(config: &NoiseMitigationConfig) -> Self {
        Self {
            schedule: ForgetRateSchedule::from_config(config),
            consistency_weight: config
                .co_teaching_consistency_loss
                .then_some(config.consistency_weight),
        }
    }
}

/// How the second peer is trained
#[derive(Debug, Clone, Copy, PartialEq)]
enum SecondPeer {
    /// Independently optimized twin
    Twin,
    /// EMA copy of the first peer with this decay
    Teacher { decay: f64 },
}

/// Two-peer trainer with cross-selected updates
pub struct CoTeachingTrainer<P: Peer> {
    peers: [P; 2],
    trackers: [FailureTracker; 2],
    options: CoTeachingOptions,
    second: SecondPeer,
    graph: Option<Arc<dyn TrustGraph>>,
    learning_rate: f64,
}

impl<P: Peer> CoTeachingTrainer<P> {
    /// Two independently optimized peers.
    pub fn new(peer_a: P, peer_b: P, options: CoTeachingOptions, learning_rate: f64) -> Self {
        Self {
            peers: [peer_a, peer_b],
            trackers: Default::default(),
            options,
            second: SecondPeer::Twin,
            graph: None,
            learning_rate,
        }
    }

    /// A student and its EMA teacher; only the student has an optimizer step.
    pub fn with_teacher(
        student: P,
        teacher: P,
        options: CoTeachingOptions,
        ema_decay: f64,
        learning_rate: f64,
    ) -> Self {
        Self {
            second: SecondPeer::Teacher { decay: ema_decay },
            ..Self::new(student, teacher, options, learning_rate)
        }
    }

    /// Filters every selection through `graph`'s trust mask.
    pub fn with_graph(mut self, graph: Arc<dyn TrustGraph>) -> Self {
        self.graph = Some(graph);
        self
    }

    pub fn is_teacher_student(&self) -> bool {
        matches!(self.second, SecondPeer::Teacher { .. })
    }

    pub fn schedule(&self) -> &ForgetRateSchedule {
        &self.options.schedule
    }

    pub fn peers(&self) -> &[P; 2] {
        &self.peers
    }

    pub fn peers_mut(&mut self) -> &mut [P; 2] {
        &mut self.peers
    }

    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    pub fn set_learning_rate(&mut self, learning_rate: f64) {
        self.learning_rate = learning_rate;
    }

    pub fn run_step(&mut self, batch: &P::Batch, epoch: usize) -> Result<StepResult> {
        let batch_len = batch.len();
        if batch_len == 0 {
            return Err(Error::InvalidArgument("empty batch".to_string()));
        }
        let forget_rate = self.options.schedule.rate(epoch);
        let keep_count = self.options.schedule.keep_count(batch_len, epoch);

        let forwards = self.forward_both(batch)?;
        let selections = self.select_samples(&forwards, batch, keep_count);
        let updates = self.plan_cross_update(&forwards, &selections, batch_len)?;
        let mut reports = self.cross_update(forwards, updates, batch, epoch)?;

        for (report, selection) in reports.iter_mut().zip(&selections) {
            report.selected = selection.clone();
        }
        let agreed = agreement_fraction(batch_len, &selections[0], &selections[1]);
        debug!(epoch, keep_count, agreed, "Co-teaching step done");

        Ok(StepResult {
            epoch,
            batch_len,
            forget_rate,
            keep_count,
            agreed_clean_fraction: Some(agreed),
            peers: reports.into(),
        })
    }

    /// Per-sample losses of both peers over the full batch.
    fn forward_both(&self, batch: &P::Batch) -> Result<[PeerForward<P::Forward>; 2]> {
        let a = self.peers[0].forward(batch)?;
        let b = self.peers[1].forward(batch)?;
        Ok([a, b])
    }

    /// Each peer's small-loss selection, optionally graph-filtered.
    fn select_samples(
        &self,
        forwards: &[PeerForward<P::Forward>; 2],
        batch: &P::Batch,
        keep_count: usize,
    ) -> [Vec<usize>; 2] {
        let select = |forward: &PeerForward<P::Forward>| {
            let selection = small_loss_selection(&forward.losses, keep_count);
            match &self.graph {
                Some(graph) => filter_trusted(&selection, batch.sample_indices(), graph.as_ref()),
                None => selection,
            }
        };
        [select(&forwards[0]), select(&forwards[1])]
    }

    /// Each peer trains on its partner's selection. A partner whose losses
    /// are not finite cannot select, so the peer falls back to its own.
    fn plan_cross_update(
        &self,
        forwards: &[PeerForward<P::Forward>; 2],
        selections: &[Vec<usize>; 2],
        batch_len: usize,
    ) -> Result<[PeerUpdate; 2]> {
        let plan = |me: usize| -> Result<PeerUpdate> {
            let partner = 1 - me;
            let partner_finite = forwards[partner].is_finite();
            let positions = if partner_finite {
                selections[partner].clone()
            } else {
                warn!(
                    peer = %self.peers[me].name(),
                    partner = %self.peers[partner].name(),
                    "Partner losses not finite, using own selection"
                );
                selections[me].clone()
            };

            // The teacher never steps, so it needs no consistency target.
            let trains = me == 0 || self.second == SecondPeer::Twin;
            let consistency = match self.options.consistency_weight {
                Some(weight) if partner_finite && trains => {
                    let excluded = excluded_positions(batch_len, &positions);
                    let probabilities = self.peers[partner]
                        .probabilities(&forwards[partner].state, &excluded)?;
                    Some(ConsistencyTarget {
                        weight,
                        positions: excluded,
                        probabilities,
                    })
                }
                _ => None,
            };

            Ok(PeerUpdate {
                positions,
                consistency,
            })
        };

        Ok([plan(0)?, plan(1)?])
    }

    /// Steps each trainable peer independently, then tracks the teacher.
    fn cross_update(
        &mut self,
        forwards: [PeerForward<P::Forward>; 2],
        updates: [PeerUpdate; 2],
        batch: &P::Batch,
        epoch: usize,
    ) -> Result<[PeerStepReport; 2]> {
        let [forward_a, forward_b] = forwards;
        let [update_a, update_b] = updates;
        let [peer_a, peer_b] = &mut self.peers;
        let [tracker_a, tracker_b] = &mut self.trackers;
        let learning_rate = self.learning_rate;

        let report_a = train_on_selection(
            peer_a,
            forward_a,
            update_a,
            learning_rate,
            tracker_a,
            batch,
            epoch,
        )?;

        let report_b = match self.second {
            SecondPeer::Twin => train_on_selection(
                peer_b,
                forward_b,
                update_b,
                learning_rate,
                tracker_b,
                batch,
                epoch,
            )?,
            SecondPeer::Teacher { decay } => {
                let finite = forward_b.is_finite();
                if finite {
                    tracker_b.record_success();
                } else {
                    warn!(peer = %peer_b.name(), epoch, "Non-finite teacher loss");
                    tracker_b.record_failure(peer_b.name())?;
                }
                if !report_a.skipped {
                    peer_b.track_ema(peer_a, decay)?;
                }
                PeerStepReport {
                    name: peer_b.name().to_string(),
                    loss: forward_b.mean_loss(),
                    selected: Vec::new(),
                    trained_on: Vec::new(),
                    skipped: !finite,
                    label_precision: None,
                }
            }
        };

        Ok([report_a, report_b])
    }
}
