//! Atomic training checkpoints.
//!
//! A checkpoint is a directory `checkpoint_epoch_NNNNN/` holding every
//! peer's model and optimizer records plus `state.json`. It is written under
//! a hidden `.tmp-` name and renamed into place once complete, so a crash
//! mid-write never leaves a directory that [`CheckpointManager::load_latest`]
//! would pick up.

use std::fs;
use std::path::{Path, PathBuf};

use noisy_core::json::TMP_PREFIX;
use noisy_core::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub use noisy_core::json::{read_json, write_json_atomic};

const STATE_FILE: &str = "state.json";
const CHECKPOINT_PREFIX: &str = "checkpoint_epoch_";

/// Loop state needed to resume a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingState {
    /// Last completed epoch
    pub epoch: usize,
    pub learning_rate: f64,
    /// Best mean training loss so far
    pub best_loss: Option<f64>,
    pub epochs_without_improvement: usize,
    pub strategy: String,
    pub peers: Vec<String>,
    pub timestamp: String,
}

impl TrainingState {
    pub fn new(epoch: usize, learning_rate: f64, strategy: impl Into<String>, peers: Vec<String>) -> Self {
        use chrono::Utc;

        Self {
            epoch,
            learning_rate,
            best_loss: None,
            epochs_without_improvement: 0,
            strategy: strategy.into(),
            peers,
            timestamp: Utc::now().to_rfc3339(),
        }
    }

    /// Marks `epoch` as completed at `learning_rate`.
    pub fn complete_epoch(&mut self, epoch: usize, learning_rate: f64) {
        self.epoch = epoch;
        self.learning_rate = learning_rate;
        self.timestamp = chrono::Utc::now().to_rfc3339();
    }

    /// Records an epoch's mean loss; returns true when it is a new best.
    pub fn observe_loss(&mut self, loss: f64) -> bool {
        let improved = self.best_loss.map_or(true, |best| loss < best);
        if improved {
            self.best_loss = Some(loss);
            self.epochs_without_improvement = 0;
        } else {
            self.epochs_without_improvement += 1;
        }
        improved
    }
}

/// Manager for the checkpoint directories of one run
pub struct CheckpointManager {
    checkpoint_dir: PathBuf,
    keep_last_n: Option<usize>,
}

impl CheckpointManager {
    pub fn new(checkpoint_dir: PathBuf) -> Self {
        Self {
            checkpoint_dir,
            keep_last_n: Some(3),
        }
    }

    /// Configure how many recent checkpoints to keep
    pub fn keep_last_n(mut self, n: Option<usize>) -> Self {
        self.keep_last_n = n;
        self
    }

    pub fn checkpoint_dir(&self) -> &Path {
        &self.checkpoint_dir
    }

    /// Writes a checkpoint for `state.epoch`.
    ///
    /// `write_payload` fills the temporary directory with model and optimizer
    /// records; nothing becomes visible unless it succeeds.
    pub fn save<F>(&self, state: &TrainingState, write_payload: F) -> Result<PathBuf>
    where
        F: FnOnce(&Path) -> Result<()>,
    {
        fs::create_dir_all(&self.checkpoint_dir)?;

        let name = checkpoint_dir_name(state.epoch);
        let final_dir = self.checkpoint_dir.join(&name);
        let tmp_dir = self.checkpoint_dir.join(format!("{TMP_PREFIX}{name}"));

        if tmp_dir.exists() {
            fs::remove_dir_all(&tmp_dir)?;
        }
        fs::create_dir_all(&tmp_dir)?;

        if let Err(err) = write_payload(&tmp_dir)
            .and_then(|()| write_json_atomic(&tmp_dir.join(STATE_FILE), state))
        {
            if let Err(cleanup) = fs::remove_dir_all(&tmp_dir) {
                warn!("Failed to remove partial checkpoint {:?}: {}", tmp_dir, cleanup);
            }
            return Err(err);
        }

        if final_dir.exists() {
            fs::remove_dir_all(&final_dir)?;
        }
        fs::rename(&tmp_dir, &final_dir)?;
        info!("Checkpoint saved to {:?}", final_dir);

        if let Some(keep_n) = self.keep_last_n {
            self.cleanup_old_checkpoints(keep_n)?;
        }
        Ok(final_dir)
    }

    /// Completed checkpoints, oldest first
    pub fn list_checkpoints(&self) -> Result<Vec<(usize, PathBuf)>> {
        if !self.checkpoint_dir.exists() {
            return Ok(Vec::new());
        }

        let mut checkpoints = Vec::new();
        for entry in fs::read_dir(&self.checkpoint_dir)? {
            let path = entry?.path();
            if !path.is_dir() || !path.join(STATE_FILE).is_file() {
                continue;
            }
            let epoch = path
                .file_name()
                .and_then(|s| s.to_str())
                .and_then(extract_epoch_from_dirname);
            if let Some(epoch) = epoch {
                checkpoints.push((epoch, path));
            }
        }
        checkpoints.sort();
        Ok(checkpoints)
    }

    /// Most recent completed checkpoint, if any
    pub fn load_latest(&self) -> Result<Option<(TrainingState, PathBuf)>> {
        let Some((_, path)) = self.list_checkpoints()?.pop() else {
            return Ok(None);
        };
        let state: TrainingState = read_json(&path.join(STATE_FILE))?;
        info!("Checkpoint loaded from {:?}", path);
        Ok(Some((state, path)))
    }

    fn cleanup_old_checkpoints(&self, keep_n: usize) -> Result<()> {
        let checkpoints = self.list_checkpoints()?;
        if checkpoints.len() <= keep_n {
            return Ok(());
        }

        let to_remove = checkpoints.len() - keep_n;
        for (_, path) in checkpoints.iter().take(to_remove) {
            match fs::remove_dir_all(path) {
                Ok(()) => debug!("Removed old checkpoint: {:?}", path),
                Err(e) => warn!("Failed to remove old checkpoint {:?}: {}", path, e),
            }
        }
        Ok(())
    }
}

fn checkpoint_dir_name(epoch: usize) -> String {
    format!("{CHECKPOINT_PREFIX}{epoch:05}")
}

/// Epoch of a `checkpoint_epoch_NNNNN` directory name
pub fn extract_epoch_from_dirname(name: &str) -> Option<usize> {
    name.strip_prefix(CHECKPOINT_PREFIX)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use noisy_core::Error;
    use tempfile::TempDir;

    fn state(epoch: usize) -> TrainingState {
        TrainingState::new(epoch, 0.01, "co-teaching", vec!["peer_a".into(), "peer_b".into()])
    }

    fn payload(dir: &Path) -> Result<()> {
        fs::write(dir.join("peer_a_model.mpk"), b"weights")?;
        Ok(())
    }

    #[test]
    fn test_save_and_load_latest() -> Result<()> {
        let temp_dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(temp_dir.path().to_path_buf());

        let path = manager.save(&state(3), payload)?;
        assert!(path.join("peer_a_model.mpk").exists());

        let (loaded, loaded_path) = manager.load_latest()?.unwrap();
        assert_eq!(loaded.epoch, 3);
        assert_eq!(loaded.peers, vec!["peer_a", "peer_b"]);
        assert_eq!(loaded.strategy, "co-teaching");
        assert_eq!(loaded_path, path);
        Ok(())
    }

    #[test]
    fn test_keeps_last_n() -> Result<()> {
        let temp_dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(temp_dir.path().to_path_buf()).keep_last_n(Some(2));

        for epoch in 0..5 {
            manager.save(&state(epoch), payload)?;
        }

        let epochs: Vec<usize> = manager.list_checkpoints()?.into_iter().map(|(e, _)| e).collect();
        assert_eq!(epochs, vec![3, 4]);
        assert_eq!(manager.load_latest()?.unwrap().0.epoch, 4);
        Ok(())
    }

    #[test]
    fn test_leftover_temporary_dir_is_ignored() -> Result<()> {
        let temp_dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(temp_dir.path().to_path_buf());
        manager.save(&state(1), payload)?;

        // Crash while writing epoch 2: state.json present, never renamed.
        let partial = temp_dir.path().join(".tmp-checkpoint_epoch_00002");
        fs::create_dir_all(&partial)?;
        write_json_atomic(&partial.join(STATE_FILE), &state(2))?;

        assert_eq!(manager.load_latest()?.unwrap().0.epoch, 1);
        Ok(())
    }

    #[test]
    fn test_failed_payload_leaves_nothing_behind() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(temp_dir.path().to_path_buf());

        let result = manager.save(&state(0), |_| Err(Error::Model("disk full".into())));
        assert!(result.is_err());
        assert!(manager.load_latest().unwrap().is_none());
        assert_eq!(fs::read_dir(temp_dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_no_checkpoint_dir() {
        let temp_dir = TempDir::new().unwrap();
        let manager = CheckpointManager::new(temp_dir.path().join("missing"));
        assert!(manager.load_latest().unwrap().is_none());
    }

    #[test]
    fn test_observe_loss_tracks_best() {
        let mut state = state(0);
        assert!(state.observe_loss(1.0));
        assert!(!state.observe_loss(1.2));
        assert_eq!(state.epochs_without_improvement, 1);
        assert!(state.observe_loss(0.5));
        assert_eq!(state.best_loss, Some(0.5));
        assert_eq!(state.epochs_without_improvement, 0);
    }

    #[test]
    fn test_extract_epoch_from_dirname() {
        assert_eq!(extract_epoch_from_dirname("checkpoint_epoch_00005"), Some(5));
        assert_eq!(extract_epoch_from_dirname(".tmp-checkpoint_epoch_00005"), None);
        assert_eq!(extract_epoch_from_dirname("latest"), None);
    }
}
