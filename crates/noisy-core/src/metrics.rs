//! Training diagnostics for noisy-label runs.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Streaming mean over step values
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct RunningMean {
    sum: f64,
    count: usize,
}

impl RunningMean {
    pub fn push(&mut self, value: f64) {
        self.sum += value;
        self.count += 1;
    }

    pub fn count(&self) -> usize {
        self.count
    }

    /// Mean of the pushed values, `None` when nothing was pushed
    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

/// Per-peer aggregates for one epoch
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerEpochMetrics {
    /// Peer name (e.g. "peer_a", "student")
    pub name: String,
    /// Mean training loss over applied updates
    pub loss: RunningMean,
    /// Mean fraction of each batch used for the update
    pub kept_fraction: RunningMean,
    /// Mean fraction of the update subset whose observed label is correct
    pub label_precision: RunningMean,
    /// Updates skipped because of non-finite loss
    pub skipped_updates: usize,
}

impl PeerEpochMetrics {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Epoch-level summary of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub learning_rate: f64,
    pub forget_rate: f64,
    pub peers: Vec<PeerEpochMetrics>,
    /// Mean fraction of a batch that both peers selected
    pub agreed_clean_fraction: RunningMean,
    pub steps: usize,
    pub duration_secs: f64,
}

impl EpochMetrics {
    pub fn new(epoch: usize, learning_rate: f64, forget_rate: f64, peer_names: &[&str]) -> Self {
        Self {
            epoch,
            learning_rate,
            forget_rate,
            peers: peer_names.iter().map(|n| PeerEpochMetrics::new(*n)).collect(),
            agreed_clean_fraction: RunningMean::default(),
            steps: 0,
            duration_secs: 0.0,
        }
    }

    /// Mean loss across peers that applied at least one update
    pub fn mean_loss(&self) -> Option<f64> {
        let losses: Vec<f64> = self.peers.iter().filter_map(|p| p.loss.mean()).collect();
        if losses.is_empty() {
            None
        } else {
            Some(losses.iter().sum::<f64>() / losses.len() as f64)
        }
    }
}

#[derive(Serialize)]
struct EpochCsvRow<'a> {
    epoch: usize,
    peer: &'a str,
    learning_rate: f64,
    forget_rate: f64,
    loss: Option<f64>,
    kept_fraction: Option<f64>,
    label_precision: Option<f64>,
    agreed_clean_fraction: Option<f64>,
    skipped_updates: usize,
    steps: usize,
    duration_secs: f64,
}

/// Epoch history of a run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsHistory {
    pub epochs: Vec<EpochMetrics>,
}

impl MetricsHistory {
    pub fn push(&mut self, metrics: EpochMetrics) {
        self.epochs.push(metrics);
    }

    pub fn last(&self) -> Option<&EpochMetrics> {
        self.epochs.last()
    }

    /// Writes one row per (epoch, peer).
    pub fn export_csv(&self, path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for epoch in &self.epochs {
            for peer in &epoch.peers {
                writer.serialize(EpochCsvRow {
                    epoch: epoch.epoch,
                    peer: &peer.name,
                    learning_rate: epoch.learning_rate,
                    forget_rate: epoch.forget_rate,
                    loss: peer.loss.mean(),
                    kept_fraction: peer.kept_fraction.mean(),
                    label_precision: peer.label_precision.mean(),
                    agreed_clean_fraction: epoch.agreed_clean_fraction.mean(),
                    skipped_updates: peer.skipped_updates,
                    steps: epoch.steps,
                    duration_secs: epoch.duration_secs,
                })?;
            }
        }
        writer.flush()?;
        Ok(())
    }
}
