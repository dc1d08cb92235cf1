//! Per-sample training objective and the peer consistency penalty.

use burn::tensor::{
    activation::{log_softmax, softmax},
    backend::Backend,
    Int, Tensor, TensorData,
};
use noisy_core::{Error, NoiseMitigationConfig, Result};

/// Loss options shared by every peer of a run
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LossConfig {
    /// Label smoothing factor, 0 disables
    pub label_smoothing: f64,
    /// Weight of the tanh logit regulariser, 0 disables
    pub tanh_regularisation: f64,
}

impl LossConfig {
    pub fn from_config(config: &NoiseMitigationConfig) -> Self {
        Self {
            label_smoothing: config.label_smoothing,
            tanh_regularisation: config.tanh_regularisation,
        }
    }
}

/// Objective of every sample in the batch, shape [batch_size].
///
/// `ce_i = -(1-e) log p[y] - e mean_c log p[c]`, plus
/// `lambda mean_c tanh(z_c)^2` when the regulariser is on.
pub fn per_sample_objective<B: Backend>(
    logits: Tensor<B, 2>,
    targets: Tensor<B, 1, Int>,
    config: &LossConfig,
) -> Tensor<B, 1> {
    let [batch_size, _] = logits.dims();
    let log_probs = log_softmax(logits.clone(), 1);

    let nll = log_probs
        .clone()
        .gather(1, targets.reshape([batch_size, 1]))
        .neg()
        .reshape([batch_size]);

    let smoothing = config.label_smoothing;
    let mut loss = if smoothing > 0.0 {
        let uniform = log_probs.mean_dim(1).neg().reshape([batch_size]);
        nll.mul_scalar(1.0 - smoothing).add(uniform.mul_scalar(smoothing))
    } else {
        nll
    };

    if config.tanh_regularisation > 0.0 {
        let squashed = logits.tanh();
        let penalty = squashed
            .clone()
            .mul(squashed)
            .mean_dim(1)
            .reshape([batch_size])
            .mul_scalar(config.tanh_regularisation);
        loss = loss.add(penalty);
    }

    loss
}

/// `weight * mean_i ||softmax(z_i) - p_i||^2` over `positions`.
///
/// `target_probs` are the partner's probabilities for the same positions and
/// enter as constants. Returns a tensor of shape [1].
pub fn consistency_penalty<B: Backend>(
    logits: Tensor<B, 2>,
    positions: &[usize],
    target_probs: &[Vec<f32>],
    weight: f64,
) -> Result<Tensor<B, 1>> {
    let [_, num_classes] = logits.dims();
    if positions.len() != target_probs.len() {
        return Err(Error::Training(format!(
            "{} consistency targets for {} positions",
            target_probs.len(),
            positions.len()
        )));
    }
    if let Some(bad) = target_probs.iter().find(|p| p.len() != num_classes) {
        return Err(Error::Training(format!(
            "consistency target has {} classes, model has {}",
            bad.len(),
            num_classes
        )));
    }

    let device = logits.device();
    let rows = positions.len();
    let selected = logits.select(0, index_tensor::<B>(positions, &device));
    let probs = softmax(selected, 1);

    let flat: Vec<f32> = target_probs.iter().flatten().copied().collect();
    let target = Tensor::<B, 2>::from_data(TensorData::new(flat, [rows, num_classes]), &device);

    let diff = probs.sub(target);
    Ok(diff.clone().mul(diff).sum_dim(1).mean().mul_scalar(weight))
}

/// Int tensor of batch positions
pub fn index_tensor<B: Backend>(positions: &[usize], device: &B::Device) -> Tensor<B, 1, Int> {
    let data: Vec<i64> = positions.iter().map(|&p| p as i64).collect();
    Tensor::from_data(TensorData::new(data, [positions.len()]), device)
}

/// Host copy of a float tensor's values
pub fn host_values<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| Error::Training(format!("cannot read tensor values: {e:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn logits(values: Vec<f32>, rows: usize, cols: usize) -> Tensor<TestBackend, 2> {
        Tensor::from_data(TensorData::new(values, [rows, cols]), &Default::default())
    }

    fn targets(values: Vec<i64>) -> Tensor<TestBackend, 1, Int> {
        let len = values.len();
        Tensor::from_data(TensorData::new(values, [len]), &Default::default())
    }

    fn manual_log_softmax(row: &[f32]) -> Vec<f32> {
        let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let sum: f32 = row.iter().map(|z| (z - max).exp()).sum();
        row.iter().map(|z| z - max - sum.ln()).collect()
    }

    #[test]
    fn test_cross_entropy_matches_manual() {
        let rows = vec![vec![2.0, 0.5, -1.0], vec![0.0, 0.0, 3.0]];
        let labels = vec![0i64, 1];
        let loss = per_sample_objective(
            logits(rows.concat(), 2, 3),
            targets(labels.clone()),
            &LossConfig::default(),
        );
        let values = host_values(loss).unwrap();

        for (i, row) in rows.iter().enumerate() {
            let expected = -manual_log_softmax(row)[labels[i] as usize];
            assert!((values[i] - expected).abs() < 1e-5);
        }
    }

    #[test]
    fn test_label_smoothing_mixes_uniform_term() {
        let row = vec![1.0, 2.0, 0.0, -1.0];
        let eps = 0.2;
        let config = LossConfig {
            label_smoothing: eps,
            ..Default::default()
        };
        let values = host_values(per_sample_objective(
            logits(row.clone(), 1, 4),
            targets(vec![2]),
            &config,
        ))
        .unwrap();

        let log_p = manual_log_softmax(&row);
        let mean_log_p: f32 = log_p.iter().sum::<f32>() / 4.0;
        let expected = -(1.0 - eps as f32) * log_p[2] - eps as f32 * mean_log_p;
        assert!((values[0] - expected).abs() < 1e-5);
    }

    #[test]
    fn test_tanh_regulariser_adds_penalty() {
        let row = vec![3.0, -2.0];
        let plain = host_values(per_sample_objective(
            logits(row.clone(), 1, 2),
            targets(vec![0]),
            &LossConfig::default(),
        ))
        .unwrap();
        let config = LossConfig {
            tanh_regularisation: 0.5,
            ..Default::default()
        };
        let regularised = host_values(per_sample_objective(
            logits(row.clone(), 1, 2),
            targets(vec![0]),
            &config,
        ))
        .unwrap();

        let penalty = 0.5 * (3.0f32.tanh().powi(2) + 2.0f32.tanh().powi(2)) / 2.0;
        assert!((regularised[0] - plain[0] - penalty).abs() < 1e-5);
    }

    #[test]
    fn test_consistency_zero_for_identical_predictions() {
        let values = vec![1.0, 0.0, 0.5, 0.5, -1.0, 2.0];
        let own = logits(values.clone(), 3, 2);
        let probs: Vec<Vec<f32>> = values
            .chunks(2)
            .map(|row| manual_log_softmax(row).iter().map(|l| l.exp()).collect())
            .collect();

        let penalty = consistency_penalty(own, &[0, 2], &[probs[0].clone(), probs[2].clone()], 1.0)
            .unwrap();
        assert!(host_values(penalty).unwrap()[0].abs() < 1e-6);
    }

    #[test]
    fn test_consistency_penalty_value() {
        // softmax([0, 0]) = [0.5, 0.5]; target [1, 0] -> squared distance 0.5
        let own = logits(vec![0.0, 0.0], 1, 2);
        let penalty = consistency_penalty(own, &[0], &[vec![1.0, 0.0]], 2.0).unwrap();
        assert!((host_values(penalty).unwrap()[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_consistency_rejects_mismatched_targets() {
        let own = logits(vec![0.0, 0.0], 1, 2);
        assert!(consistency_penalty(own, &[0], &[], 1.0).is_err());
    }
}
