//! Neighbour-agreement trust masks for graph-filtered sample selection.
//!
//! The neighbour lists come from outside (e.g. a k-NN search over
//! self-supervised embeddings); this module only turns them into a boolean
//! "trusted" flag per sample.

use std::path::Path;

use noisy_core::{Error, Result};
use serde::{Deserialize, Serialize};

/// Source of per-sample trust flags, indexed by dataset sample index
pub trait TrustGraph: Send + Sync {
    fn trusted_mask(&self, sample_indices: &[usize]) -> Vec<bool>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct NeighbourFile {
    neighbours: Vec<Vec<usize>>,
}

/// Trusts a sample when enough of its neighbours carry the same observed label
#[derive(Debug, Clone)]
pub struct LabelAgreementGraph {
    neighbours: Vec<Vec<usize>>,
    observed_labels: Vec<usize>,
    min_agreement: f64,
}

impl LabelAgreementGraph {
    pub fn new(
        neighbours: Vec<Vec<usize>>,
        observed_labels: Vec<usize>,
        min_agreement: f64,
    ) -> Result<Self> {
        if neighbours.len() != observed_labels.len() {
            return Err(Error::Dataset(format!(
                "neighbour graph covers {} samples, dataset has {}",
                neighbours.len(),
                observed_labels.len()
            )));
        }
        if let Some(bad) = neighbours.iter().flatten().find(|&&n| n >= observed_labels.len()) {
            return Err(Error::Dataset(format!("neighbour index {bad} out of range")));
        }
        Ok(Self {
            neighbours,
            observed_labels,
            min_agreement,
        })
    }

    /// Loads `{"neighbours": [[...], ...]}` from a JSON file.
    pub fn load(path: &Path, observed_labels: Vec<usize>, min_agreement: f64) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let file: NeighbourFile = serde_json::from_str(&content)?;
        Self::new(file.neighbours, observed_labels, min_agreement)
    }

    /// Fraction of a sample's neighbours sharing its observed label.
    pub fn agreement(&self, index: usize) -> Option<f64> {
        let neighbours = self.neighbours.get(index)?;
        if neighbours.is_empty() {
            return None;
        }
        let label = self.observed_labels[index];
        let agreeing = neighbours
            .iter()
            .filter(|&&n| self.observed_labels[n] == label)
            .count();
        Some(agreeing as f64 / neighbours.len() as f64)
    }
}

impl TrustGraph for LabelAgreementGraph {
    /// Samples without neighbours are trusted; unknown indices are not.
    fn trusted_mask(&self, sample_indices: &[usize]) -> Vec<bool> {
        sample_indices
            .iter()
            .map(|&i| {
                if i >= self.neighbours.len() {
                    return false;
                }
                self.agreement(i).map_or(true, |a| a >= self.min_agreement)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn graph() -> LabelAgreementGraph {
        // 0,1,2 agree on class 0; 3 is labelled 1 but surrounded by class 0.
        LabelAgreementGraph::new(
            vec![vec![1, 2], vec![0, 2], vec![0, 1], vec![0, 1, 2], vec![]],
            vec![0, 0, 0, 1, 1],
            0.5,
        )
        .unwrap()
    }

    #[test]
    fn test_trusted_mask() {
        let g = graph();
        assert_eq!(g.trusted_mask(&[0, 3, 4, 99]), vec![true, false, true, false]);
        assert_eq!(g.agreement(3), Some(0.0));
    }

    #[test]
    fn test_rejects_mismatched_sizes() {
        assert!(LabelAgreementGraph::new(vec![vec![]], vec![0, 1], 0.5).is_err());
        assert!(LabelAgreementGraph::new(vec![vec![5], vec![]], vec![0, 1], 0.5).is_err());
    }

    #[test]
    fn test_load_from_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("graph.json");
        std::fs::write(&path, r#"{"neighbours": [[1], [0]]}"#).unwrap();
        let g = LabelAgreementGraph::load(&path, vec![1, 1], 1.0).unwrap();
        assert_eq!(g.trusted_mask(&[0, 1]), vec![true, true]);
    }
}
