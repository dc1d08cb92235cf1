//! Burn batching for noisy-label samples.

use burn::data::dataloader::batcher::Batcher;
use burn::prelude::*;
use noisy_core::ImageDimensions;
use std::marker::PhantomData;

use crate::dataset::NoisySample;

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// One training step's batch; owned by that step only
#[derive(Clone, Debug)]
pub struct TrainingBatch<B: Backend> {
    /// Normalized images with shape [batch_size, channels, height, width]
    pub images: Tensor<B, 4>,
    /// Observed labels with shape [batch_size]
    pub targets: Tensor<B, 1, Int>,
    /// Observed labels on the host, parallel to `indices`
    pub observed_labels: Vec<usize>,
    /// Clean labels for diagnostics; never part of the objective
    pub true_labels: Vec<Option<usize>>,
    /// Dataset index of each row
    pub indices: Vec<usize>,
}

impl<B: Backend> TrainingBatch<B> {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Stacks samples into tensors and normalizes per channel
#[derive(Clone, Debug)]
pub struct NoisyBatcher<B: Backend> {
    dims: ImageDimensions,
    mean: Vec<f32>,
    std: Vec<f32>,
    _backend: PhantomData<B>,
}

impl<B: Backend> NoisyBatcher<B> {
    /// ImageNet statistics for RGB inputs, 0.5/0.5 otherwise.
    pub fn new(dims: ImageDimensions) -> Self {
        let (mean, std) = if dims.channels == 3 {
            (IMAGENET_MEAN.to_vec(), IMAGENET_STD.to_vec())
        } else {
            (vec![0.5; dims.channels], vec![0.5; dims.channels])
        };
        Self {
            dims,
            mean,
            std,
            _backend: PhantomData,
        }
    }
}

impl<B: Backend> Batcher<B, NoisySample, TrainingBatch<B>> for NoisyBatcher<B> {
    fn batch(&self, items: Vec<NoisySample>, device: &B::Device) -> TrainingBatch<B> {
        let batch_size = items.len();
        let ImageDimensions {
            channels,
            height,
            width,
        } = self.dims;

        let images_data: Vec<f32> = items.iter().flat_map(|item| item.image.iter().copied()).collect();
        let images = Tensor::<B, 4>::from_floats(
            TensorData::new(images_data, [batch_size, channels, height, width]),
            device,
        );

        let mean = Tensor::<B, 4>::from_floats(
            TensorData::new(self.mean.clone(), [1, channels, 1, 1]),
            device,
        );
        let std = Tensor::<B, 4>::from_floats(
            TensorData::new(self.std.clone(), [1, channels, 1, 1]),
            device,
        );
        let images = (images - mean) / std;

        let targets_data: Vec<i64> = items.iter().map(|item| item.observed_label as i64).collect();
        let targets = Tensor::<B, 1, Int>::from_data(
            TensorData::new(targets_data, [batch_size]),
            device,
        );

        TrainingBatch {
            images,
            targets,
            observed_labels: items.iter().map(|item| item.observed_label).collect(),
            true_labels: items.iter().map(|item| item.true_label).collect(),
            indices: items.iter().map(|item| item.index).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_batch_shapes_and_metadata() {
        let dims = ImageDimensions::new(3, 2, 2);
        let batcher = NoisyBatcher::<TestBackend>::new(dims);
        let items = vec![
            NoisySample {
                index: 7,
                image: vec![0.5; 12],
                observed_label: 1,
                true_label: Some(0),
            },
            NoisySample {
                index: 3,
                image: vec![0.25; 12],
                observed_label: 2,
                true_label: None,
            },
        ];

        let batch = batcher.batch(items, &Default::default());
        assert_eq!(batch.images.dims(), [2, 3, 2, 2]);
        assert_eq!(batch.targets.dims(), [2]);
        assert_eq!(batch.indices, vec![7, 3]);
        assert_eq!(batch.observed_labels, vec![1, 2]);
        assert_eq!(batch.true_labels, vec![Some(0), None]);
        assert_eq!(batch.len(), 2);
    }
}
