//! Trainer strategy chosen once per run.

use std::path::Path;
use std::sync::Arc;

use noisy_core::{Error, NoiseMitigationConfig, Result, StrategyKind};
use noisy_dataset::TrustGraph;
use tracing::info;

use crate::co_teaching::{CoTeachingOptions, CoTeachingTrainer};
use crate::peer::Peer;
use crate::trainer::{SingleModelTrainer, StepResult};

pub const BASELINE_PEER: &str = "model";
pub const CO_TEACHING_PEERS: [&str; 2] = ["peer_a", "peer_b"];
pub const TEACHER_STUDENT_PEERS: [&str; 2] = ["student", "teacher"];

/// All trainer variants behind one step interface
pub enum TrainingStrategy<P: Peer> {
    Baseline(SingleModelTrainer<P>),
    CoTeaching(CoTeachingTrainer<P>),
    TeacherStudent(CoTeachingTrainer<P>),
}

impl<P: Peer> TrainingStrategy<P> {
    /// Builds the variant the noise-mitigation flags select.
    ///
    /// `make_peer(i, name)` creates trainable peer `i`; the teacher of the
    /// teacher-student variant is a copy of the student, not a new peer.
    pub fn from_config<F>(
        config: &NoiseMitigationConfig,
        learning_rate: f64,
        graph: Option<Arc<dyn TrustGraph>>,
        mut make_peer: F,
    ) -> Result<Self>
    where
        F: FnMut(usize, &str) -> Result<P>,
    {
        let kind = config.strategy();
        if kind != StrategyKind::Baseline && config.co_teaching_use_graph && graph.is_none() {
            return Err(Error::Config(
                "co_teaching_use_graph is set but no neighbour graph was provided".to_string(),
            ));
        }
        let options = CoTeachingOptions::from_config(config);
        let graph = graph.filter(|_| config.co_teaching_use_graph);

        let strategy = match kind {
            StrategyKind::Baseline => {
                let peer = make_peer(0, BASELINE_PEER)?;
                TrainingStrategy::Baseline(SingleModelTrainer::new(peer, learning_rate))
            }
            StrategyKind::CoTeaching => {
                let [name_a, name_b] = CO_TEACHING_PEERS;
                let peer_a = make_peer(0, name_a)?;
                let peer_b = make_peer(1, name_b)?;
                let trainer = CoTeachingTrainer::new(peer_a, peer_b, options, learning_rate);
                TrainingStrategy::CoTeaching(with_graph(trainer, graph))
            }
            StrategyKind::TeacherStudent => {
                let [student_name, teacher_name] = TEACHER_STUDENT_PEERS;
                let student = make_peer(0, student_name)?;
                let teacher = student.teacher_copy(teacher_name)?;
                let trainer = CoTeachingTrainer::with_teacher(
                    student,
                    teacher,
                    options,
                    config.teacher_ema_decay,
                    learning_rate,
                );
                TrainingStrategy::TeacherStudent(with_graph(trainer, graph))
            }
        };

        info!(strategy = %kind, peers = ?strategy.peer_names(), "Training strategy ready");
        Ok(strategy)
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            TrainingStrategy::Baseline(_) => StrategyKind::Baseline,
            TrainingStrategy::CoTeaching(_) => StrategyKind::CoTeaching,
            TrainingStrategy::TeacherStudent(_) => StrategyKind::TeacherStudent,
        }
    }

    pub fn run_step(&mut self, batch: &P::Batch, epoch: usize) -> Result<StepResult> {
        match self {
            TrainingStrategy::Baseline(trainer) => trainer.run_step(batch, epoch),
            TrainingStrategy::CoTeaching(trainer) | TrainingStrategy::TeacherStudent(trainer) => {
                trainer.run_step(batch, epoch)
            }
        }
    }

    /// Forget rate applied at `epoch`; always 0 for the baseline.
    pub fn forget_rate(&self, epoch: usize) -> f64 {
        match self {
            TrainingStrategy::Baseline(_) => 0.0,
            TrainingStrategy::CoTeaching(trainer) | TrainingStrategy::TeacherStudent(trainer) => {
                trainer.schedule().rate(epoch)
            }
        }
    }

    pub fn learning_rate(&self) -> f64 {
        match self {
            TrainingStrategy::Baseline(trainer) => trainer.learning_rate(),
            TrainingStrategy::CoTeaching(trainer) | TrainingStrategy::TeacherStudent(trainer) => {
                trainer.learning_rate()
            }
        }
    }

    pub fn set_learning_rate(&mut self, learning_rate: f64) {
        match self {
            TrainingStrategy::Baseline(trainer) => trainer.set_learning_rate(learning_rate),
            TrainingStrategy::CoTeaching(trainer) | TrainingStrategy::TeacherStudent(trainer) => {
                trainer.set_learning_rate(learning_rate)
            }
        }
    }

    pub fn peers(&self) -> Vec<&P> {
        match self {
            TrainingStrategy::Baseline(trainer) => vec![trainer.peer()],
            TrainingStrategy::CoTeaching(trainer) | TrainingStrategy::TeacherStudent(trainer) => {
                trainer.peers().iter().collect()
            }
        }
    }

    pub fn peers_mut(&mut self) -> Vec<&mut P> {
        match self {
            TrainingStrategy::Baseline(trainer) => vec![trainer.peer_mut()],
            TrainingStrategy::CoTeaching(trainer) | TrainingStrategy::TeacherStudent(trainer) => {
                trainer.peers_mut().iter_mut().collect()
            }
        }
    }

    pub fn peer_names(&self) -> Vec<&str> {
        self.peers().into_iter().map(|peer| peer.name()).collect()
    }

    /// Freezes or unfreezes the backbone of every optimized peer. The EMA
    /// teacher has no optimizer and is left alone.
    pub fn set_backbone_frozen(&mut self, frozen: bool) -> Result<()> {
        match self {
            TrainingStrategy::Baseline(trainer) => trainer.peer_mut().set_backbone_frozen(frozen),
            TrainingStrategy::CoTeaching(trainer) => {
                for peer in trainer.peers_mut() {
                    peer.set_backbone_frozen(frozen)?;
                }
                Ok(())
            }
            TrainingStrategy::TeacherStudent(trainer) => {
                trainer.peers_mut()[0].set_backbone_frozen(frozen)
            }
        }
    }

    /// Writes every peer's state under `dir`.
    pub fn save(&self, dir: &Path) -> Result<()> {
        for peer in self.peers() {
            peer.save(dir)?;
        }
        Ok(())
    }

    pub fn load(&mut self, dir: &Path) -> Result<()> {
        for peer in self.peers_mut() {
            peer.load(dir)?;
        }
        Ok(())
    }
}

fn with_graph<P: Peer>(
    trainer: CoTeachingTrainer<P>,
    graph: Option<Arc<dyn TrustGraph>>,
) -> CoTeachingTrainer<P> {
    match graph {
        Some(graph) => trainer.with_graph(graph),
        None => trainer,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trainer::testing::{ScriptedBatch, ScriptedPeer};
    use tempfile::TempDir;

    fn make(index: usize, name: &str) -> Result<ScriptedPeer> {
        let losses = if index == 0 {
            vec![0.1, 0.9, 0.2, 0.8]
        } else {
            vec![0.7, 0.3, 0.9, 0.1]
        };
        Ok(ScriptedPeer::new(name, losses))
    }

    fn co_teaching_config() -> NoiseMitigationConfig {
        NoiseMitigationConfig {
            use_co_teaching: true,
            co_teaching_forget_rate: 0.5,
            co_teaching_num_gradual: 0,
            co_teaching_num_warmup: 0,
            ..Default::default()
        }
    }

    struct TrustAll;

    impl TrustGraph for TrustAll {
        fn trusted_mask(&self, indices: &[usize]) -> Vec<bool> {
            vec![true; indices.len()]
        }
    }

    #[test]
    fn test_baseline_by_default() {
        let strategy =
            TrainingStrategy::from_config(&NoiseMitigationConfig::default(), 0.1, None, make)
                .unwrap();
        assert_eq!(strategy.kind(), StrategyKind::Baseline);
        assert_eq!(strategy.peer_names(), vec!["model"]);
        assert_eq!(strategy.forget_rate(10), 0.0);
    }

    #[test]
    fn test_co_teaching_variant() {
        let mut strategy =
            TrainingStrategy::from_config(&co_teaching_config(), 0.1, None, make).unwrap();
        assert_eq!(strategy.kind(), StrategyKind::CoTeaching);
        assert_eq!(strategy.peer_names(), vec!["peer_a", "peer_b"]);

        let result = strategy.run_step(&ScriptedBatch::new(4), 0).unwrap();
        assert_eq!(result.peers[0].trained_on, vec![3, 1]);
        assert_eq!(result.peers[1].trained_on, vec![0, 2]);
    }

    #[test]
    fn test_teacher_variant_copies_student() {
        let config = NoiseMitigationConfig {
            use_teacher_model: true,
            ..co_teaching_config()
        };
        let mut calls = Vec::new();
        let strategy = TrainingStrategy::from_config(&config, 0.1, None, |i, name| {
            calls.push(name.to_string());
            make(i, name)
        })
        .unwrap();

        assert_eq!(strategy.kind(), StrategyKind::TeacherStudent);
        assert_eq!(strategy.peer_names(), vec!["student", "teacher"]);
        assert_eq!(calls, vec!["student"]);
    }

    #[test]
    fn test_graph_required_when_enabled() {
        let config = NoiseMitigationConfig {
            co_teaching_use_graph: true,
            ..co_teaching_config()
        };
        assert!(matches!(
            TrainingStrategy::from_config(&config, 0.1, None, make),
            Err(Error::Config(_))
        ));
        assert!(TrainingStrategy::from_config(&config, 0.1, Some(Arc::new(TrustAll)), make).is_ok());
    }

    #[test]
    fn test_learning_rate_reaches_trainer() {
        let mut strategy =
            TrainingStrategy::from_config(&co_teaching_config(), 0.1, None, make).unwrap();
        strategy.set_learning_rate(0.05);
        assert_eq!(strategy.learning_rate(), 0.05);
    }

    #[test]
    fn test_freezing_skips_teacher() {
        let config = NoiseMitigationConfig {
            use_teacher_model: true,
            ..co_teaching_config()
        };
        let mut strategy = TrainingStrategy::from_config(&config, 0.1, None, make).unwrap();
        strategy.set_backbone_frozen(true).unwrap();

        let peers = strategy.peers();
        assert!(peers[0].frozen);
        assert!(!peers[1].frozen);
    }

    #[test]
    fn test_save_and_load_every_peer() {
        let dir = TempDir::new().unwrap();
        let mut strategy =
            TrainingStrategy::from_config(&co_teaching_config(), 0.1, None, make).unwrap();
        strategy.run_step(&ScriptedBatch::new(4), 0).unwrap();
        strategy.save(dir.path()).unwrap();

        let mut restored =
            TrainingStrategy::from_config(&co_teaching_config(), 0.1, None, make).unwrap();
        restored.load(dir.path()).unwrap();
        for peer in restored.peers() {
            assert_eq!(peer.applied, 1);
        }
    }
}
