//! bertgcn - hybrid text/graph trainer
//!
//! Trains a text encoder jointly with a GCN/GAT over a document/word graph.

use std::fs::File;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Mutex;

use anyhow::{Context, Result};
use bertgcn::data::{build_graph, load_tokenizer, DatasetFile};
use bertgcn::training::TrainingContext;
use bertgcn::{Config, DeviceKind};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "bertgcn")]
#[command(about = "Hybrid text encoder + graph propagation trainer")]
struct Cli {
    /// YAML config file (defaults to ./config.yaml when present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full training schedule
    Train {
        /// Dataset JSON (overrides config)
        #[arg(short, long)]
        dataset: Option<PathBuf>,

        /// Number of epochs (overrides config)
        #[arg(short, long)]
        epochs: Option<usize>,

        /// Directory for the checkpoint and training.log (overrides config)
        #[arg(long)]
        checkpoint_dir: Option<PathBuf>,

        /// Compute device (overrides config)
        #[arg(long, value_enum)]
        device: Option<DeviceKind>,
    },

    /// Load a dataset and print the graph summary without training
    Inspect {
        /// Dataset JSON (overrides config)
        #[arg(short, long)]
        dataset: Option<PathBuf>,
    },
}

fn main() -> ExitCode {
    // Load .env file
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if tracing::dispatcher::has_been_set() {
                tracing::error!("Fatal: {:#}", e);
            } else {
                eprintln!("Fatal: {:#}", e);
            }
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut config =
        Config::from_yaml_and_env(cli.config.as_deref()).context("Failed to load configuration")?;

    match cli.command {
        Commands::Train {
            dataset,
            epochs,
            checkpoint_dir,
            device,
        } => {
            if let Some(path) = dataset {
                config.data.dataset_path = path;
            }
            if let Some(epochs) = epochs {
                config.training.epochs = epochs;
            }
            if let Some(dir) = checkpoint_dir {
                config.checkpoint_dir = dir;
            }
            if let Some(device) = device {
                config.training.device = device;
            }
            config.validate().context("Invalid configuration")?;
            init_tracing(Some(&config.checkpoint_dir))?;
            run_train(&config)
        }
        Commands::Inspect { dataset } => {
            if let Some(path) = dataset {
                config.data.dataset_path = path;
            }
            init_tracing(None)?;
            run_inspect(&config)
        }
    }
}

/// Stdout always; `<dir>/training.log` without ANSI colours when a directory is given.
fn init_tracing(log_dir: Option<&PathBuf>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,bertgcn=debug".into());

    let file_layer = match log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
            let path = dir.join("training.log");
            let file = File::create(&path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer)
        .init();
    Ok(())
}

fn run_train(config: &Config) -> Result<()> {
    tracing::info!(
        propagation = %config.model.propagation,
        dataset = %config.data.dataset_path.display(),
        epochs = config.training.epochs,
        batch_size = config.training.batch_size,
        max_length = config.data.max_length,
        "Arguments"
    );
    tracing::info!(
        "Checkpoints will be saved in {}",
        config.checkpoint_dir.display()
    );

    let mut ctx = TrainingContext::from_config(config).context("Failed to set up training")?;
    let summary = ctx.run().context("Training aborted")?;

    tracing::info!(
        "Done: {} epochs, best val acc {:.4}, {} checkpoints written",
        summary.epochs,
        summary.best_val_acc,
        summary.checkpoints_written
    );
    Ok(())
}

fn run_inspect(config: &Config) -> Result<()> {
    let dataset = DatasetFile::load(&config.data.dataset_path).context("Failed to load dataset")?;
    let tokenizer = load_tokenizer(&config.data, &dataset)?;
    let device = config.training.device.device()?;
    let graph = build_graph(&dataset, tokenizer.as_ref(), config.data.max_length, &device)
        .context("Failed to build graph")?;

    let counts = graph.split_counts();
    println!("{}", graph);
    println!("  train:      {}", counts.train);
    println!("  validation: {}", counts.validation);
    println!("  test:       {}", counts.test);
    println!("  words:      {}", counts.structural);
    println!("  vocab size: {}", tokenizer.vocab_size());
    Ok(())
}
