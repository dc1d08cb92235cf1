//! Training CLI Tool
//!
//! Runs one noise-robust training experiment described by a TOML file:
//! baseline, co-teaching or teacher-student, optionally warm-started from
//! self-supervised encoder checkpoints.

mod run;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use noisy_core::{load_toml_config, setup_cli_logging, TrainingRunConfig};
use tracing::{info, warn};

/// File whose appearance in the output directory stops the run after the current step
const STOP_FILE: &str = "STOP";

/// Noise-robust image classification training
#[derive(Parser, Debug)]
#[command(
    name = "train",
    about = "Train image classifiers on noisy labels",
    long_about = "Train image classifiers on noisy labels with co-teaching, an EMA teacher, \
                  label smoothing or self-supervised warm-start, as configured in a TOML file. \
                  Create a file named STOP in the output directory to end the run cleanly."
)]
struct Args {
    /// Path to training configuration file (TOML)
    #[arg(short, long, value_name = "FILE")]
    config: PathBuf,

    /// Override output directory
    #[arg(short, long, value_name = "DIR")]
    output: Option<PathBuf>,

    /// Override number of epochs
    #[arg(short, long, value_name = "N")]
    epochs: Option<usize>,

    /// Override learning rate
    #[arg(short, long, value_name = "LR")]
    lr: Option<f64>,

    /// Override batch size
    #[arg(short, long, value_name = "SIZE")]
    batch_size: Option<usize>,

    /// Override random seed
    #[arg(short, long, value_name = "SEED")]
    seed: Option<u64>,

    /// Resume from the latest checkpoint in the output directory
    #[arg(short, long)]
    resume: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Dry run (validate config without training)
    #[arg(long)]
    dry_run: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config: TrainingRunConfig =
        load_toml_config(&args.config).context("Failed to load configuration file")?;
    apply_overrides(&mut config, &args);
    config.validate().context("Invalid configuration")?;
    let config = Arc::new(config);

    if args.dry_run {
        setup_cli_logging(args.verbose, None)?;
        info!("Configuration validated successfully (dry run)");
        print_config_summary(&config);
        return Ok(());
    }

    let output_dir = config.output.dir.clone();
    fs::create_dir_all(&output_dir).context("Failed to create output directory")?;
    setup_cli_logging(args.verbose, Some(&output_dir.join("train.log")))?;

    info!("Noise-robust training");
    info!("=====================");

    let config_path = output_dir.join("config.json");
    config
        .save_json(&config_path)
        .context("Failed to save configuration")?;
    info!("Configuration saved to: {}", config_path.display());
    print_config_summary(&config);

    let cancel = Arc::new(AtomicBool::new(false));
    watch_stop_file(&output_dir.join(STOP_FILE), cancel.clone())?;

    let summary = run::run_training(config, cancel)?;

    info!("");
    info!("Training Summary:");
    info!("  Epochs completed: {}", summary.epochs_completed);
    if let Some(loss) = summary.best_loss {
        info!("  Best training loss: {:.4}", loss);
    }
    if summary.stopped_early {
        info!("  Stopped early: no improvement within patience");
    }
    if summary.cancelled {
        warn!("  Run was cancelled; resume with --resume");
    } else {
        info!("Training completed successfully!");
    }

    Ok(())
}

fn apply_overrides(config: &mut TrainingRunConfig, args: &Args) {
    if let Some(epochs) = args.epochs {
        config.training.num_epochs = epochs;
    }
    if let Some(lr) = args.lr {
        config.training.learning_rate = lr;
    }
    if let Some(batch_size) = args.batch_size {
        config.training.batch_size = batch_size;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    if let Some(ref output) = args.output {
        config.output.dir = output.clone();
    }
    if args.resume {
        config.output.resume = true;
    }
}

/// Sets `cancel` once `path` exists. A stale stop file is removed first.
fn watch_stop_file(path: &Path, cancel: Arc<AtomicBool>) -> Result<()> {
    if path.exists() {
        fs::remove_file(path)
            .with_context(|| format!("Failed to remove stale stop file {}", path.display()))?;
    }
    let path = path.to_path_buf();
    thread::spawn(move || loop {
        if path.exists() {
            warn!("Stop file {} found, stopping after the current step", path.display());
            cancel.store(true, Ordering::SeqCst);
            return;
        }
        thread::sleep(Duration::from_secs(1));
    });
    Ok(())
}

fn print_config_summary(config: &TrainingRunConfig) {
    let noise = &config.noise_mitigation;
    info!("");
    info!("Configuration Summary:");
    info!("  Strategy: {}", noise.strategy());
    info!("  Model: {} ({} classes)", config.model.architecture, config.model.num_classes);
    info!("  Epochs: {}", config.training.num_epochs);
    info!("  Batch size: {}", config.training.batch_size);
    info!("  Optimizer: {}", config.training.optimizer);
    info!("  Learning rate: {}", config.training.learning_rate);
    info!("  Label noise: {}", config.dataset.noise);
    if noise.strategy() != noisy_core::StrategyKind::Baseline {
        info!(
            "  Forget rate: {} (warmup {}, ramp {})",
            noise.co_teaching_forget_rate,
            noise.num_warmup(),
            noise.num_gradual()
        );
    }
    if noise.use_self_supervision {
        info!(
            "  Warm start: {} {} x{} (frozen {} epochs)",
            noise.self_supervision.ssl_type,
            noise.self_supervision.encoder_name,
            noise.self_supervision.checkpoints.len(),
            noise.self_supervision.freeze_encoder_epochs
        );
    }
    info!("  Output dir: {}", config.output.dir.display());
    info!("");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["train", "--config", "run.toml"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn test_overrides_applied_before_validation() {
        let mut config = TrainingRunConfig::default();
        apply_overrides(
            &mut config,
            &args(&["--epochs", "0", "--lr", "0.5", "--seed", "7", "--output", "/tmp/x"]),
        );

        assert_eq!(config.training.num_epochs, 0);
        assert_eq!(config.training.learning_rate, 0.5);
        assert_eq!(config.seed, 7);
        assert_eq!(config.output.dir, PathBuf::from("/tmp/x"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_no_overrides_keeps_file_values() {
        let mut config = TrainingRunConfig::default();
        let before = config.training.batch_size;
        apply_overrides(&mut config, &args(&[]));
        assert_eq!(config.training.batch_size, before);
        assert!(!config.output.resume);

        apply_overrides(&mut config, &args(&["--resume", "-b", "16"]));
        assert!(config.output.resume);
        assert_eq!(config.training.batch_size, 16);
    }

    #[test]
    fn test_stop_file_sets_flag() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join(STOP_FILE);
        fs::write(&path, "").unwrap();

        let cancel = Arc::new(AtomicBool::new(false));
        watch_stop_file(&path, cancel.clone()).unwrap();
        assert!(!path.exists());
        assert!(!cancel.load(Ordering::SeqCst));

        fs::write(&path, "").unwrap();
        for _ in 0..50 {
            if cancel.load(Ordering::SeqCst) {
                break;
            }
            thread::sleep(Duration::from_millis(100));
        }
        assert!(cancel.load(Ordering::SeqCst));
    }
}
