//! Command-line entry point

use std::path::PathBuf;

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use tessitura::cluster::ClusterContext;
use tessitura::config::RunConfig;
use tessitura::data::{AudioDataset, Batch, InMemoryDataset, TrackEntry};
use tessitura::training::Orchestrator;

#[derive(Parser)]
#[command(name = "tessitura")]
#[command(about = "Contrastive audio representation learning")]
#[command(version)]
struct Cli {
    /// Log level filter (overridden by RUST_LOG)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a training pipeline from a configuration file
    Train {
        /// Run configuration (YAML or JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// This process's rank within the run
        #[arg(long, default_value_t = 0, env = "TESSITURA_RANK")]
        rank: usize,

        /// Batches of synthetic audio per epoch (dataset loading is a
        /// separate concern; this exercises the full pipeline end to end)
        #[arg(long, default_value_t = 8)]
        synthetic_batches: usize,
    },
    /// Evaluate a saved checkpoint and write the prediction artifacts
    Export {
        /// Run configuration (YAML or JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Checkpoint epoch to export (defaults to the run's epoch budget)
        #[arg(long)]
        epoch: Option<usize>,
    },
    /// Validate a configuration file and print the resolved values
    Config {
        /// Run configuration (YAML or JSON)
        #[arg(short, long)]
        config: PathBuf,
    },
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn select_device() -> Device {
    #[cfg(feature = "cuda")]
    if let Ok(device) = Device::new_cuda(0) {
        return device;
    }
    #[cfg(feature = "metal")]
    if let Ok(device) = Device::new_metal(0) {
        return device;
    }
    Device::Cpu
}

fn synthetic_batch(config: &RunConfig, device: &Device, seed: usize) -> Result<Batch> {
    let shape = (config.batch_size, config.audio_length);
    let view_a = Tensor::rand(-1.0f32, 1.0, shape, device)?;
    let view_b = Tensor::rand(-1.0f32, 1.0, shape, device)?;
    let labels = if config.supervised {
        let mut values = vec![0.0f32; config.batch_size * config.n_classes];
        for row in 0..config.batch_size {
            values[row * config.n_classes + (seed + row) % config.n_classes] = 1.0;
        }
        Some(Tensor::from_vec(
            values,
            (config.batch_size, config.n_classes),
            device,
        )?)
    } else {
        None
    };
    let ids = (0..config.batch_size)
        .map(|row| format!("clip_{seed}_{row}"))
        .collect();
    Ok(Batch {
        view_a,
        view_b,
        labels,
        ids,
    })
}

fn synthetic_dataset(
    config: &RunConfig,
    device: &Device,
    num_batches: usize,
) -> Result<InMemoryDataset> {
    let batches = (0..num_batches)
        .map(|i| synthetic_batch(config, device, i))
        .collect::<Result<Vec<_>>>()?;
    let tags: Vec<String> = (0..config.n_classes).map(|i| format!("tag_{i}")).collect();

    let n_tracks = 8;
    let tracks = (0..n_tracks)
        .map(|i| {
            let mut label = vec![0.0f32; config.n_classes];
            label[i % config.n_classes] = 1.0;
            TrackEntry {
                track_id: format!("track_{i}"),
                clip_id: format!("track_{i}_clip_0"),
                segment: 0,
                path: format!("synthetic/track_{i}.wav"),
                label,
            }
        })
        .collect();
    let segments = (0..n_tracks)
        .map(|_| Ok(Tensor::rand(-1.0f32, 1.0, (2, config.audio_length), device)?))
        .collect::<Result<Vec<_>>>()?;

    Ok(InMemoryDataset::new(batches, tags).with_tracks(tracks, segments))
}

fn train(config_path: &PathBuf, rank: usize, synthetic_batches: usize) -> Result<()> {
    let config = RunConfig::from_file(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let device = select_device();
    info!(
        id = %config.id,
        supervised = config.supervised,
        optimizer = %config.optimizer,
        ?device,
        "starting run"
    );

    let train_data = synthetic_dataset(&config, &device, synthetic_batches)?;
    let validation = synthetic_dataset(&config, &device, synthetic_batches.div_ceil(2))?;
    let test = synthetic_dataset(&config, &device, 1)?;

    let cluster = ClusterContext::new(&config, rank, device)?;
    let mut orchestrator = Orchestrator::new(config, cluster)?;
    let report = orchestrator.run(&train_data, &validation, Some(&test))?;

    info!(
        stages = report.stages_completed,
        epochs = report.epochs_completed,
        best_validation_loss = report.best_validation_loss,
        "run finished"
    );
    if let Some((auc, ap)) = report.final_metrics {
        info!(mean_roc_auc = auc, mean_pr_auc = ap, "final evaluation");
    }
    Ok(())
}

fn export(config_path: &PathBuf, epoch: Option<usize>) -> Result<()> {
    use tessitura::export;
    use tessitura::training::{build_optimizer, CheckpointManager, CheckpointTag, Solver};
    use tessitura::{build_model, Model};

    let config = RunConfig::from_file(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let device = select_device();
    let epoch = epoch.unwrap_or(config.epochs);

    let checkpoints = CheckpointManager::new(config.run_dir(), &config.model_name)?;
    let handle = checkpoints
        .existing(CheckpointTag::Epoch(epoch))
        .with_context(|| format!("no checkpoint for epoch {epoch} in {}", config.run_dir().display()))?;

    let model = build_model(&config, &device)?;
    let mut optimizer = build_optimizer(&config, model.var_map())?;
    let mut var_map = model.var_map();
    checkpoints.load(&handle, &mut var_map, optimizer.as_mut())?;
    info!(epoch, "checkpoint loaded");

    let test = synthetic_dataset(&config, &device, 1)?;
    let mut solver = Solver::new(&config, model, optimizer);
    let eval = solver.test_tracks(&test)?;

    let run_dir = config.run_dir();
    let results = export::write_results(&run_dir, &config, test.tags(), &eval)?;
    info!(path = %results.display(), "results written");
    if let Some(index) = test.track_index() {
        let predictions =
            export::write_web_predictions(&run_dir, &config, test.tags(), index, &eval)?;
        info!(path = %predictions.display(), "predictions written");
    }
    info!(
        mean_roc_auc = eval.mean_auc,
        mean_pr_auc = eval.mean_ap,
        "export complete"
    );
    Ok(())
}

fn resolve(config_path: &PathBuf) -> Result<()> {
    let config = RunConfig::from_file(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    println!("{}", serde_yaml::to_string(&config)?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    match &cli.command {
        Commands::Train {
            config,
            rank,
            synthetic_batches,
        } => train(config, *rank, *synthetic_batches),
        Commands::Export { config, epoch } => export(config, *epoch),
        Commands::Config { config } => resolve(config),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_exposes_train_export_config() {
        let cli = Cli::try_parse_from(["tessitura", "train", "--config", "run.yaml"]).unwrap();
        assert!(matches!(cli.command, Commands::Train { rank: 0, .. }));

        let cli = Cli::try_parse_from([
            "tessitura", "export", "--config", "run.yaml", "--epoch", "30",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Export {
                epoch: Some(30),
                ..
            }
        ));

        let cli = Cli::try_parse_from(["tessitura", "config", "--config", "run.yaml"]).unwrap();
        assert!(matches!(cli.command, Commands::Config { .. }));

        assert!(Cli::try_parse_from(["tessitura", "check", "--config", "run.yaml"]).is_err());
    }
}
