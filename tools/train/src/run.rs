//! Epoch loop of one training run.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use burn::{
    backend::{ndarray::NdArrayDevice, Autodiff, NdArray},
    data::dataloader::batcher::Batcher,
    optim::{
        decay::WeightDecayConfig, momentum::MomentumConfig, AdamConfig, AdamWConfig, Optimizer,
        SgdConfig,
    },
};
use indicatif::{ProgressBar, ProgressStyle};
use noisy_core::{EpochMetrics, MetricsHistory, OptimizerType, TrainingRunConfig};
use noisy_dataset::{
    epoch_order, BatchPrefetcher, DatasetStatistics, LabelAgreementGraph, NoisyBatcher,
    NoisyLabelDataset, SampleSource, TrustGraph,
};
use noisy_training::checkpoint::{read_json, write_json_atomic};
use noisy_training::{
    BurnPeer, CheckpointManager, EncoderProvider, LearningRateScheduler, LossConfig,
    NoisyClassifier, NoisyClassifierConfig, OptimizerFactory, TrainingState, TrainingStrategy,
};
use tracing::{debug, info, warn};

pub type TrainBackend = Autodiff<NdArray<f32>>;

/// Outcome of [`run_training`]
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub epochs_completed: usize,
    pub best_loss: Option<f64>,
    pub cancelled: bool,
    pub stopped_early: bool,
}

/// Trains with the optimizer the configuration names.
pub fn run_training(config: Arc<TrainingRunConfig>, cancel: Arc<AtomicBool>) -> Result<RunSummary> {
    let params = &config.training;
    let weight_decay = params.weight_decay as f32;

    match params.optimizer {
        OptimizerType::Adam => {
            let optim = AdamConfig::new().with_weight_decay(
                (weight_decay > 0.0).then(|| WeightDecayConfig::new(weight_decay)),
            );
            let factory: OptimizerFactory<_> = Arc::new(move || {
                optim.init::<TrainBackend, NoisyClassifier<TrainBackend>>()
            });
            train_with(config, factory, cancel)
        }
        OptimizerType::AdamW => {
            let optim = AdamWConfig::new().with_weight_decay(weight_decay);
            let factory: OptimizerFactory<_> = Arc::new(move || {
                optim.init::<TrainBackend, NoisyClassifier<TrainBackend>>()
            });
            train_with(config, factory, cancel)
        }
        OptimizerType::Sgd => {
            let optim = SgdConfig::new()
                .with_momentum(Some(MomentumConfig::new().with_momentum(params.momentum)))
                .with_weight_decay((weight_decay > 0.0).then(|| WeightDecayConfig::new(weight_decay)));
            let factory: OptimizerFactory<_> = Arc::new(move || {
                optim.init::<TrainBackend, NoisyClassifier<TrainBackend>>()
            });
            train_with(config, factory, cancel)
        }
    }
}

fn train_with<O>(
    config: Arc<TrainingRunConfig>,
    optimizer_factory: OptimizerFactory<O>,
    cancel: Arc<AtomicBool>,
) -> Result<RunSummary>
where
    O: Optimizer<NoisyClassifier<TrainBackend>, TrainBackend> + 'static,
{
    let device = NdArrayDevice::Cpu;
    let params = &config.training;
    let noise = &config.noise_mitigation;
    let output_dir = config.output.dir.clone();

    // Data
    let dataset = NoisyLabelDataset::from_config(&config).context("Failed to build dataset")?;
    let stats = DatasetStatistics::from_dataset(&dataset, config.model.num_classes);
    info!("Dataset: {} samples, {} classes", stats.num_samples, stats.num_classes);
    info!("  Class counts: {:?}", stats.class_counts);
    if let Some(rate) = stats.noise_rate {
        info!("  Realised label noise: {:.2}%", rate * 100.0);
    }

    let graph: Option<Arc<dyn TrustGraph>> = match &config.dataset.neighbour_graph {
        Some(path) if noise.co_teaching_use_graph => {
            let graph = LabelAgreementGraph::load(
                path,
                dataset.observed_labels(),
                noise.graph_min_agreement,
            )
            .with_context(|| format!("Failed to load neighbour graph {}", path.display()))?;
            Some(Arc::new(graph) as Arc<dyn TrustGraph>)
        }
        _ => None,
    };
    let source: Arc<dyn SampleSource> = Arc::new(dataset);
    if source.is_empty() {
        bail!("Dataset is empty");
    }

    // Models
    let encoder = if noise.use_self_supervision {
        Some(
            EncoderProvider::from_config(&noise.self_supervision, config.model.architecture)
                .context("Failed to load encoder checkpoints")?,
        )
    } else {
        None
    };

    let model_config = NoisyClassifierConfig::new(config.model.architecture, config.model.num_classes)
        .with_in_channels(config.dataset.image_size.channels)
        .with_base_width(config.model.base_width)
        .with_dropout(config.model.dropout);
    let loss = LossConfig::from_config(noise);

    let mut strategy = TrainingStrategy::from_config(noise, params.learning_rate, graph, |index, name| {
        let model = model_config.init::<TrainBackend>(&device)?;
        let model = match &encoder {
            Some(provider) => provider.warm_start(model, index)?,
            None => model,
        };
        Ok(BurnPeer::new(name, model, optimizer_factory.clone(), loss, device.clone()))
    })?;

    // Resume
    let checkpoints = CheckpointManager::new(output_dir.join("checkpoints"))
        .keep_last_n((params.keep_last_checkpoints > 0).then_some(params.keep_last_checkpoints));
    let metrics_path = output_dir.join("metrics.json");
    let mut history = MetricsHistory::default();
    let mut state = TrainingState::new(
        0,
        params.learning_rate,
        strategy.kind().to_string(),
        strategy.peer_names().iter().map(|name| name.to_string()).collect(),
    );
    let mut start_epoch = 0;

    if config.output.resume {
        match checkpoints.load_latest()? {
            Some((saved, path)) => {
                if saved.strategy != state.strategy || saved.peers != state.peers {
                    bail!(
                        "Checkpoint {} was written by strategy '{}' ({:?}), run uses '{}' ({:?})",
                        path.display(),
                        saved.strategy,
                        saved.peers,
                        state.strategy,
                        state.peers
                    );
                }
                strategy
                    .load(&path)
                    .with_context(|| format!("Failed to restore peers from {}", path.display()))?;
                if metrics_path.exists() {
                    history = read_json(&metrics_path)?;
                    history.epochs.retain(|m| m.epoch <= saved.epoch);
                }
                start_epoch = saved.epoch + 1;
                state = saved;
                info!("Resuming from epoch {}", start_epoch + 1);
            }
            None => info!("No checkpoint found in {}, starting fresh", checkpoints.checkpoint_dir().display()),
        }
    }

    let mut scheduler =
        LearningRateScheduler::new(params.lr_schedule.clone(), params.learning_rate, params.num_epochs);
    let batcher = NoisyBatcher::<TrainBackend>::new(config.dataset.image_size);
    let steps_per_epoch = source.len().div_ceil(params.batch_size);
    let log_period = params.log_period.max(1);

    let mut summary = RunSummary {
        epochs_completed: start_epoch,
        best_loss: state.best_loss,
        cancelled: false,
        stopped_early: false,
    };

    info!("Starting training for {} epochs...", params.num_epochs);
    info!("  Steps per epoch: {}", steps_per_epoch);

    let epoch_bar = ProgressBar::new(params.num_epochs as u64);
    epoch_bar.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} epochs ({eta})")
            .context("Invalid progress template")?
            .progress_chars("=>-"),
    );
    epoch_bar.set_position(start_epoch as u64);

    'epochs: for epoch in start_epoch..params.num_epochs {
        let epoch_start = Instant::now();
        scheduler.set_epoch(epoch);
        let lr = scheduler.get_lr();
        strategy.set_learning_rate(lr);
        if let Some(provider) = &encoder {
            strategy.set_backbone_frozen(provider.is_frozen_at(epoch))?;
        }

        let forget_rate = strategy.forget_rate(epoch);
        let peer_names = strategy.peer_names();
        let mut metrics = EpochMetrics::new(epoch, lr, forget_rate, &peer_names);

        let order = epoch_order(source.len(), epoch, config.seed, config.dataset.shuffle);
        let prefetcher = BatchPrefetcher::spawn(
            source.clone(),
            order,
            params.batch_size,
            epoch,
            config.dataset.prefetch_batches,
        );

        for (step, samples) in prefetcher.enumerate() {
            if cancel.load(Ordering::SeqCst) {
                warn!("Cancelled during epoch {}, step {}", epoch + 1, step);
                summary.cancelled = true;
                break 'epochs;
            }

            let samples = samples.with_context(|| format!("Failed to load batch {step} of epoch {}", epoch + 1))?;
            let batch = batcher.batch(samples, &device);
            let result = strategy
                .run_step(&batch, epoch)
                .with_context(|| format!("Step {step} of epoch {} failed", epoch + 1))?;
            result.accumulate_into(&mut metrics);

            if (step + 1) % log_period == 0 {
                let losses: Vec<String> = result
                    .peers
                    .iter()
                    .map(|p| match p.loss {
                        Some(loss) => format!("{}={:.4}", p.name, loss),
                        None => format!("{}=skipped", p.name),
                    })
                    .collect();
                debug!(
                    "Epoch {} step {}/{}: keep {}/{} {}",
                    epoch + 1,
                    step + 1,
                    steps_per_epoch,
                    result.keep_count,
                    result.batch_len,
                    losses.join(" ")
                );
            }
        }

        metrics.duration_secs = epoch_start.elapsed().as_secs_f64();
        log_epoch(&metrics, params.num_epochs);

        let improved = match metrics.mean_loss() {
            Some(loss) => state.observe_loss(loss),
            None => {
                warn!("Epoch {} applied no updates", epoch + 1);
                state.epochs_without_improvement += 1;
                false
            }
        };
        if improved {
            debug!("New best training loss");
        }
        state.complete_epoch(epoch, lr);
        summary.epochs_completed = epoch + 1;
        summary.best_loss = state.best_loss;

        history.push(metrics);
        write_json_atomic(&metrics_path, &history)?;
        history
            .export_csv(&output_dir.join("metrics.csv"))
            .context("Failed to export metrics")?;

        let stop_early = params
            .early_stopping_patience
            .is_some_and(|patience| state.epochs_without_improvement >= patience);
        let is_last = epoch + 1 == params.num_epochs;
        if stop_early || is_last || (epoch + 1) % params.checkpoint_period.max(1) == 0 {
            save_checkpoint(&checkpoints, &state, &strategy)?;
        }
        epoch_bar.inc(1);

        if stop_early {
            info!(
                "Early stopping: no improvement for {} epochs",
                state.epochs_without_improvement
            );
            summary.stopped_early = true;
            break;
        }
    }

    epoch_bar.finish_with_message("Training complete");
    Ok(summary)
}

fn save_checkpoint<O>(
    checkpoints: &CheckpointManager,
    state: &TrainingState,
    strategy: &TrainingStrategy<BurnPeer<TrainBackend, O>>,
) -> Result<()>
where
    O: Optimizer<NoisyClassifier<TrainBackend>, TrainBackend>,
{
    checkpoints
        .save(state, |dir: &Path| strategy.save(dir))
        .with_context(|| format!("Failed to save checkpoint for epoch {}", state.epoch + 1))?;
    Ok(())
}

fn log_epoch(metrics: &EpochMetrics, num_epochs: usize) {
    info!(
        "Epoch {}/{} - lr: {:.2e}, forget rate: {:.3}, {} steps in {:.1}s",
        metrics.epoch + 1,
        num_epochs,
        metrics.learning_rate,
        metrics.forget_rate,
        metrics.steps,
        metrics.duration_secs
    );
    for peer in &metrics.peers {
        let loss = peer.loss.mean().map_or("n/a".to_string(), |l| format!("{l:.4}"));
        let kept = peer.kept_fraction.mean().map_or("n/a".to_string(), |k| format!("{:.1}%", k * 100.0));
        match peer.label_precision.mean() {
            Some(precision) => info!(
                "  {}: loss {}, kept {}, label precision {:.1}%, skipped {}",
                peer.name,
                loss,
                kept,
                precision * 100.0,
                peer.skipped_updates
            ),
            None => info!(
                "  {}: loss {}, kept {}, skipped {}",
                peer.name, loss, kept, peer.skipped_updates
            ),
        }
    }
    if let Some(agreed) = metrics.agreed_clean_fraction.mean() {
        info!("  Agreed clean fraction: {:.1}%", agreed * 100.0);
    }
}
