//! Dataset statistics computation.

use crate::dataset::NoisyLabelDataset;
use crate::noise::realised_noise_rate;
use serde::{Deserialize, Serialize};

/// Label statistics of a dataset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetStatistics {
    pub num_samples: usize,
    pub num_classes: usize,
    /// Observed-label count per class
    pub class_counts: Vec<usize>,
    /// Fraction of observed labels that differ from the clean ones, when known
    pub noise_rate: Option<f64>,
}

impl DatasetStatistics {
    pub fn from_labels(observed: &[usize], clean: Option<&[usize]>, num_classes: usize) -> Self {
        let mut class_counts = vec![0usize; num_classes];
        for &label in observed {
            if label < num_classes {
                class_counts[label] += 1;
            }
        }
        Self {
            num_samples: observed.len(),
            num_classes,
            class_counts,
            noise_rate: clean.map(|c| realised_noise_rate(observed, c)),
        }
    }

    pub fn from_dataset(dataset: &NoisyLabelDataset, num_classes: usize) -> Self {
        let clean = dataset.true_labels();
        Self::from_labels(&dataset.observed_labels(), clean.as_deref(), num_classes)
    }

    /// Balanced class weights `n / (k * count_c)`; empty classes get weight 0.
    pub fn class_weights(&self) -> Vec<f64> {
        let n = self.num_samples as f64;
        let k = self.num_classes as f64;
        self.class_counts
            .iter()
            .map(|&count| if count == 0 { 0.0 } else { n / (k * count as f64) })
            .collect()
    }
}
