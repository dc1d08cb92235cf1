//! Background batch production.
//!
//! A producer thread loads and augments samples for one epoch and hands
//! complete batches to the training loop through a bounded channel.

use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;
use std::thread;

use noisy_core::Result;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::debug;

use crate::dataset::{NoisySample, SampleSource};

/// Sample order for one epoch; shuffled from `(seed, epoch)` when requested.
pub fn epoch_order(len: usize, epoch: usize, seed: u64, shuffle: bool) -> Vec<usize> {
    let mut order: Vec<usize> = (0..len).collect();
    if shuffle {
        let mut rng = ChaCha8Rng::seed_from_u64(seed.wrapping_add(epoch as u64));
        order.shuffle(&mut rng);
    }
    order
}

/// Iterator over one epoch's host batches, filled by a producer thread
pub struct BatchPrefetcher {
    receiver: Receiver<Result<Vec<NoisySample>>>,
}

impl BatchPrefetcher {
    /// Spawns the producer. At most `buffer_size` batches wait in the channel.
    ///
    /// The producer stops after the first load error (which is delivered) or
    /// as soon as the consumer drops the prefetcher.
    pub fn spawn(
        source: Arc<dyn SampleSource>,
        order: Vec<usize>,
        batch_size: usize,
        epoch: usize,
        buffer_size: usize,
    ) -> Self {
        let (sender, receiver): (
            SyncSender<Result<Vec<NoisySample>>>,
            Receiver<Result<Vec<NoisySample>>>,
        ) = sync_channel(buffer_size.max(1));
        let batch_size = batch_size.max(1);

        thread::spawn(move || {
            for chunk in order.chunks(batch_size) {
                let batch: Result<Vec<NoisySample>> = chunk
                    .iter()
                    .map(|&index| source.sample(index, epoch))
                    .collect();
                let failed = batch.is_err();
                if sender.send(batch).is_err() {
                    debug!("Batch consumer dropped, stopping producer for epoch {}", epoch);
                    return;
                }
                if failed {
                    return;
                }
            }
        });

        Self { receiver }
    }
}

impl Iterator for BatchPrefetcher {
    type Item = Result<Vec<NoisySample>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.receiver.recv().ok()
    }
}
