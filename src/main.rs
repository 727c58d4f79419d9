use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use mmwave_mtl::config::{DeviceType, MotionPattern, SampleCount, Scenario, Snr, Velocity};
use mmwave_mtl::training::metrics::Phase;
use mmwave_mtl::training::{CorrelationMeasure, PositionTarget};
use mmwave_mtl::{logging, Config, ModelVariant, MultiTaskTrainer, ResultStore, WeightingMethod};
use tracing::info;

#[derive(Parser)]
#[command(name = "mmwave-mtl")]
#[command(about = "Multi-task BS selection, beam tracking and UE positioning trainer", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Emit JSON log lines on stdout
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the multi-task training experiment
    Train(TrainArgs),

    /// Validate configuration file
    Config {
        /// Configuration file to validate
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Summarise a persisted result store
    Results {
        /// Result store written by a training run
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Show system information
    Info,
}

/// Every flag overrides the value from `--config` (or the default)
#[derive(Args, Debug)]
struct TrainArgs {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// mmWave network scenario
    #[arg(long = "mmWave-network-scenarios", alias = "scenario")]
    scenario: Option<Scenario>,

    /// UE velocity
    #[arg(long = "UE-velocity", alias = "velocity")]
    velocity: Option<Velocity>,

    /// UE motion pattern
    #[arg(long = "move-form", alias = "motion")]
    motion: Option<MotionPattern>,

    /// Beam-training SNR
    #[arg(long = "SNR", alias = "snr")]
    snr: Option<Snr>,

    /// Number of training samples
    #[arg(long = "training-samples-number", alias = "samples")]
    training_samples: Option<SampleCount>,

    /// Multi-task model variant
    #[arg(long = "multi-task-model-name", alias = "model")]
    model: Option<ModelVariant>,

    /// Dropout between cascaded LSTM stages
    #[arg(long = "dropout-value", alias = "dropout")]
    dropout: Option<f64>,

    /// Task weighting method
    #[arg(long = "training-method", alias = "method")]
    method: Option<WeightingMethod>,

    /// Softmax temperature over descending rates
    #[arg(long)]
    beta: Option<f64>,

    /// EMA smoothing constant of the loss history
    #[arg(long)]
    mu: Option<f64>,

    /// Run the gradient correlation analyzer on every training batch (yes/no)
    #[arg(long, action = clap::ArgAction::Set, value_parser = clap::builder::BoolishValueParser::new())]
    grad_calculate: Option<bool>,

    /// Task correlation measure
    #[arg(long = "task-correlations-measure-method", alias = "measure")]
    measure: Option<CorrelationMeasure>,

    /// Denominator guard of the correlation measures
    #[arg(long)]
    eps: Option<f64>,

    /// Timestep the positioning target is read from
    #[arg(long)]
    position_target: Option<PositionTarget>,

    /// Root the dataset layout is resolved against
    #[arg(long)]
    data_root: Option<PathBuf>,

    /// Explicit training split
    #[arg(long)]
    train_data: Option<PathBuf>,

    /// Explicit evaluation split
    #[arg(long)]
    eval_data: Option<PathBuf>,

    /// Directory for the result store and checkpoints
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Device to use
    #[arg(long)]
    device: Option<DeviceType>,

    /// Independent training repetitions
    #[arg(long)]
    repetitions: Option<usize>,

    /// Epochs per repetition
    #[arg(short, long)]
    epochs: Option<usize>,

    /// Training batch size
    #[arg(short, long)]
    batch_size: Option<usize>,

    /// Initial learning rate
    #[arg(long)]
    lr: Option<f64>,

    /// Learning-rate floor of the plateau decay
    #[arg(long)]
    min_lr: Option<f64>,

    /// Epochs of uniform weighting before adaptation
    #[arg(long)]
    warmup_epochs: Option<usize>,

    /// Shuffling seed
    #[arg(long)]
    seed: Option<u64>,

    /// Plain-text copy of the log, truncated at startup
    #[arg(long, default_value = "logfile.txt")]
    log_file: PathBuf,
}

impl TrainArgs {
    fn build_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)
                .with_context(|| format!("Failed to load configuration file {}", path.display()))?,
            None => Config::default(),
        };

        let run = &mut config.run;
        override_with(&mut run.scenario, self.scenario);
        override_with(&mut run.velocity, self.velocity);
        override_with(&mut run.motion, self.motion);
        override_with(&mut run.snr, self.snr);
        override_with(&mut run.training_samples, self.training_samples);
        override_with(&mut run.model, self.model);
        override_with(&mut run.dropout, self.dropout);
        override_with(&mut run.device, self.device);
        override_with(&mut run.data_root, self.data_root.clone());
        override_with(&mut run.output_dir, self.output_dir.clone());
        if self.train_data.is_some() {
            run.train_data = self.train_data.clone();
        }
        if self.eval_data.is_some() {
            run.eval_data = self.eval_data.clone();
        }

        let training = &mut config.training;
        override_with(&mut training.repetitions, self.repetitions);
        override_with(&mut training.epochs, self.epochs);
        override_with(&mut training.batch_size, self.batch_size);
        override_with(&mut training.optimizer.learning_rate, self.lr);
        override_with(&mut training.scheduler.min_lr, self.min_lr);
        override_with(&mut training.weighting.method, self.method);
        override_with(&mut training.weighting.beta, self.beta);
        override_with(&mut training.weighting.mu, self.mu);
        override_with(&mut training.weighting.warmup_epochs, self.warmup_epochs);
        override_with(&mut training.gradient_analysis.measure, self.measure);
        override_with(&mut training.gradient_analysis.eps, self.eps);
        override_with(&mut training.position_target, self.position_target);
        override_with(&mut training.seed, self.seed);
        override_with(&mut training.gradient_analysis.enabled, self.grad_calculate);

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

fn override_with<T>(slot: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *slot = value;
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_file = match &cli.command {
        Commands::Train(args) => Some(args.log_file.as_path()),
        _ => None,
    };
    logging::init_logging(cli.verbose, cli.json, log_file).context("Failed to initialise logging")?;

    match &cli.command {
        Commands::Train(args) => train(args)?,
        Commands::Config { file } => validate_config(file)?,
        Commands::Results { file } => show_results(file)?,
        Commands::Info => show_system_info(),
    }

    Ok(())
}

fn train(args: &TrainArgs) -> Result<()> {
    let config = args.build_config()?;
    std::fs::create_dir_all(&config.run.output_dir).with_context(|| {
        format!(
            "Failed to create output directory {}",
            config.run.output_dir.display()
        )
    })?;

    let mut trainer =
        MultiTaskTrainer::from_config(config).context("Failed to set up the training run")?;
    let result = trainer.train().context("Training failed")?;

    info!("Results written to {}", result.results_path.display());
    for (repetition, (best, loss)) in result
        .best_checkpoints
        .iter()
        .zip(&result.min_eval_losses)
        .enumerate()
    {
        match best {
            Some(path) => info!(
                "Repetition {}: best eval loss {:.6}, checkpoint {}",
                repetition,
                loss,
                path.display()
            ),
            None => info!("Repetition {}: no checkpoint written", repetition),
        }
    }
    info!(
        "{} optimizer steps in {:.1}s",
        result.total_steps,
        result.training_duration.as_secs_f64()
    );
    Ok(())
}

fn validate_config(path: &Path) -> Result<()> {
    info!("Validating configuration file: {}", path.display());

    let config = Config::from_file(path).context("Failed to load configuration file")?;
    let system = config.run.system();

    println!("Configuration is valid");
    println!("  run name:       {}", config.run_name());
    println!("  model:          {}", config.run.model);
    println!("  BS / beams:     {} / {}", system.bs_num, system.beam_num);
    println!("  history / pred: {} / {}", system.his_len, system.pre_len);
    println!("  train split:    {}", config.run.train_data_path().display());
    println!("  eval split:     {}", config.run.eval_data_path().display());
    println!(
        "  schedule:       {} repetitions x {} epochs, batch {}",
        config.training.repetitions, config.training.epochs, config.training.batch_size
    );
    Ok(())
}

fn show_results(path: &Path) -> Result<()> {
    let store = ResultStore::load(path)
        .with_context(|| format!("Failed to load result store {}", path.display()))?;

    for repetition in 0..store.repetitions() {
        let completed = store.completed_epochs(repetition);
        if completed == 0 {
            println!("repetition {}: no epochs recorded", repetition);
            continue;
        }
        let epoch = completed - 1;
        let [w_bs, w_bt, w_up] = store.weights(repetition, epoch).as_array();

        println!("repetition {} ({} / {} epochs)", repetition, completed, store.epochs());
        println!("  train: {}", store.metrics(Phase::Train, repetition, epoch));
        println!("  eval:  {}", store.metrics(Phase::Eval, repetition, epoch));
        println!(
            "  lr {:e}, weights {:.3} {:.3} {:.3}",
            store.learning_rate(repetition, epoch),
            w_bs,
            w_bt,
            w_up
        );
    }
    Ok(())
}

fn show_system_info() {
    println!("mmwave-mtl {}", mmwave_mtl::VERSION);
    println!();
    println!("Hardware support:");

    #[cfg(feature = "cuda")]
    println!("  CUDA GPU acceleration");
    #[cfg(not(feature = "cuda"))]
    println!("  CUDA support (not compiled)");

    #[cfg(feature = "metal")]
    println!("  Apple Metal GPU acceleration");
    #[cfg(not(feature = "metal"))]
    println!("  Metal support (not compiled)");

    #[cfg(feature = "accelerate")]
    println!("  Apple Accelerate framework");
    #[cfg(not(feature = "accelerate"))]
    println!("  Accelerate support (not compiled)");

    println!("  CPU");
    println!();
    println!("Usage:");
    println!("  mmwave-mtl train --multi-task-model-name Dual_Cascaded --SNR 5dB");
    println!("  mmwave-mtl config -f config.json   # Validate configuration");
    println!("  mmwave-mtl results -f MTL_ldr_lr0.001.safetensors");
    println!("  mmwave-mtl info                    # Show this information");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn train_args(args: &[&str]) -> TrainArgs {
        let cli = Cli::try_parse_from([&["mmwave-mtl", "train"][..], args].concat()).unwrap();
        match cli.command {
            Commands::Train(args) => args,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_grad_calculate_switches_both_ways() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        let mut config = Config::default();
        config.training.gradient_analysis.enabled = true;
        config.save(&path).unwrap();
        let path = path.to_str().unwrap();

        let kept = train_args(&["--config", path]).build_config().unwrap();
        assert!(kept.training.gradient_analysis.enabled);

        let disabled = train_args(&["--config", path, "--grad-calculate", "no"]).build_config().unwrap();
        assert!(!disabled.training.gradient_analysis.enabled);

        let enabled = train_args(&["--grad-calculate", "yes"]).build_config().unwrap();
        assert!(enabled.training.gradient_analysis.enabled);
    }

    #[test]
    fn test_grad_calculate_requires_a_value() {
        assert!(Cli::try_parse_from(["mmwave-mtl", "train", "--grad-calculate"]).is_err());
    }
}
