//! Multi-task training loop
//!
//! [`MultiTaskTrainer`] runs `repetitions` independent trainings of a fresh
//! model. Each epoch of a repetition:
//!
//! 1. records the learning rate in effect and derives the task weights from
//!    the loss histories
//! 2. runs a training pass: forward, task losses, optional gradient
//!    correlation analysis, weighted backward, optimizer step
//! 3. feeds the mean training task losses into the histories
//! 4. runs an evaluation pass with dropout off and the same weights
//! 5. steps the plateau scheduler on the evaluation combined loss
//! 6. records and persists the result store, and checkpoints on a new minimum

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{Config, SystemParams};
use crate::error::{Error, Result};
use crate::models::{create_model, Mode, MultiTaskModel};
use crate::training::checkpoints::CheckpointManager;
use crate::training::data::{BatchTargets, DataSource, ShardDataLoader};
use crate::training::loss::{
    GradientCorrelationAnalyzer, TaskHistories, TaskLosses, TaskWeights, WeightController,
};
use crate::training::metrics::{BatchMetrics, EpochMetrics, EpochRecord, MetricAccumulator, ResultStore};
use crate::training::optimizers::{create_optimizer, create_scheduler, Optimizer, Scheduler};
use crate::training::task::NUM_TASKS;

/// Driver of the full train/eval schedule
pub struct MultiTaskTrainer {
    /// Run configuration
    config: Config,

    /// Measurement and network dimensions
    system: SystemParams,

    /// Device the model is built on
    device: Device,

    /// Training split, shuffled per pass
    train_source: Box<dyn DataSource>,

    /// Evaluation split
    eval_source: Box<dyn DataSource>,

    /// Per-epoch task weights
    controller: WeightController,

    /// Smoothed training losses of the current repetition
    histories: TaskHistories,

    /// Run-wide result arrays
    results: ResultStore,

    /// Where the result store is persisted
    results_path: PathBuf,

    /// Checkpoint-on-improvement
    checkpoints: CheckpointManager,

    /// Progress
    state: TrainingState,
}

/// Training state tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingState {
    /// Current repetition
    pub repetition: usize,

    /// Current epoch within the repetition
    pub epoch: usize,

    /// Optimizer steps across all repetitions
    pub global_step: usize,

    /// Training start time
    pub start_time: DateTime<Utc>,

    /// Training status
    pub status: TrainingStatus,

    /// Learning rate of the current epoch
    pub current_lr: f64,
}

/// Training status enumeration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum TrainingStatus {
    NotStarted,
    Running,
    Completed,
    Failed { error: String },
}

/// Summary of a finished run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingResult {
    /// Persisted result store
    pub results_path: PathBuf,

    /// Best checkpoint of every repetition, if one was written
    pub best_checkpoints: Vec<Option<PathBuf>>,

    /// Lowest evaluation loss of every repetition
    pub min_eval_losses: Vec<f64>,

    /// Training state at completion
    pub final_state: TrainingState,

    /// Wall-clock duration of the run
    pub training_duration: Duration,

    /// Total optimizer steps
    pub total_steps: usize,
}

/// What the training pass mutates beyond the metrics
struct PassUpdate<'a> {
    optimizer: &'a mut dyn Optimizer,
    analyzer: Option<&'a GradientCorrelationAnalyzer>,
}

/// Means over one pass
#[derive(Debug, Clone, Copy)]
struct PassOutcome {
    metrics: EpochMetrics,
    batches: usize,
    /// Seconds spent in forward, analysis, backward and step
    training_duration: f64,
    correlation_measure: f64,
    grad_norms: [f64; NUM_TASKS],
}

impl MultiTaskTrainer {
    /// Create a trainer over already opened data sources
    pub fn new(
        config: Config,
        train_source: Box<dyn DataSource>,
        eval_source: Box<dyn DataSource>,
        device: Device,
    ) -> Result<Self> {
        config.validate()?;

        let system = config.run.system();
        let training = &config.training;
        let results = ResultStore::new(training.repetitions, training.epochs);
        let results_path = config
            .run
            .output_dir
            .join(ResultStore::file_name(&config.run_name()));
        let checkpoints = CheckpointManager::for_config(&config)?;

        Ok(Self {
            controller: WeightController::new(&training.weighting),
            histories: TaskHistories::new(training.weighting.mu),
            results,
            results_path,
            checkpoints,
            state: TrainingState::new(training.optimizer.learning_rate),
            system,
            device,
            train_source,
            eval_source,
            config,
        })
    }

    /// Open the configured dataset splits and create a trainer over them
    pub fn from_config(config: Config) -> Result<Self> {
        config.validate()?;
        let device = config.run.device.to_device()?;
        let system = config.run.system();
        let training = &config.training;

        let train = ShardDataLoader::open(
            config.run.train_data_path(),
            &system,
            training.batch_size,
            true,
            training.seed,
            &device,
        )?;
        let eval = ShardDataLoader::open(
            config.run.eval_data_path(),
            &system,
            training.batch_size,
            false,
            training.seed,
            &device,
        )?;
        info!(
            "Training split: {} batches, evaluation split: {} batches",
            train.num_batches(),
            eval.num_batches()
        );

        Self::new(config, Box::new(train), Box::new(eval), device)
    }

    /// Override the network dimensions derived from the scenario
    pub fn with_system(mut self, system: SystemParams) -> Self {
        self.system = system;
        self
    }

    /// Run every repetition to completion
    pub fn train(&mut self) -> Result<TrainingResult> {
        let start = Instant::now();
        info!("Starting multi-task training: {}", self.config.run_name());
        self.config.log_values();

        self.state.start_time = Utc::now();
        self.state.status = TrainingStatus::Running;

        let repetitions = self.config.training.repetitions;
        let mut best_checkpoints = Vec::with_capacity(repetitions);
        let mut min_eval_losses = Vec::with_capacity(repetitions);

        for repetition in 0..repetitions {
            match self.run_repetition(repetition) {
                Ok(best) => {
                    best_checkpoints.push(best);
                    min_eval_losses.push(self.checkpoints.min_eval_loss());
                }
                Err(e) => {
                    self.state.status = TrainingStatus::Failed {
                        error: e.to_string(),
                    };
                    return Err(e);
                }
            }
        }

        self.state.status = TrainingStatus::Completed;
        let result = TrainingResult {
            results_path: self.results_path.clone(),
            best_checkpoints,
            min_eval_losses,
            final_state: self.state.clone(),
            training_duration: start.elapsed(),
            total_steps: self.state.global_step,
        };

        info!("Training completed in {:?}", result.training_duration);
        Ok(result)
    }

    fn run_repetition(&mut self, repetition: usize) -> Result<Option<PathBuf>> {
        info!("Training repetition {}/{}", repetition + 1, self.config.training.repetitions);
        self.state.repetition = repetition;

        let training = self.config.training.clone();
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &self.device);
        let mut model = create_model(self.config.run.model, &self.system, self.config.run.dropout, vb)?;
        log_parameters(model.name(), &var_map)?;

        let mut optimizer = create_optimizer(&training.optimizer, &var_map)?;
        let mut scheduler = create_scheduler(&training.scheduler, training.optimizer.learning_rate);
        info!(
            "Optimizer {} (lr {:e}), scheduler {}",
            optimizer.name(),
            optimizer.learning_rate(),
            scheduler.name()
        );
        let steps_before = self.state.global_step;
        let analyzer = training.gradient_analysis.enabled.then(|| {
            GradientCorrelationAnalyzer::new(&training.gradient_analysis, training.optimizer.learning_rate)
        });

        self.histories.reset();
        self.checkpoints.begin_repetition(repetition);

        let mut best = None;
        for epoch in 0..training.epochs {
            let epoch_start = Instant::now();
            self.state.epoch = epoch;
            self.state.current_lr = optimizer.learning_rate();

            let weights = self.controller.compute_weights(epoch, &self.histories);
            let (record, saved) = self.run_epoch(
                model.as_mut(),
                &var_map,
                &mut optimizer,
                &mut scheduler,
                analyzer.as_ref(),
                weights,
            )?;

            self.state.global_step = steps_before + optimizer.step_count();
            if saved.is_some() {
                best = saved;
            }
            info!(
                "Repetition {} epoch {}/{} took {:.1}s (lr {:e}, next lr {:e})",
                repetition,
                epoch + 1,
                training.epochs,
                epoch_start.elapsed().as_secs_f64(),
                record.learning_rate,
                optimizer.learning_rate()
            );
        }

        info!(
            "Repetition {} finished: {} {} steps",
            repetition,
            optimizer.step_count(),
            optimizer.name()
        );
        Ok(best)
    }

    fn run_epoch(
        &mut self,
        model: &mut dyn MultiTaskModel,
        var_map: &VarMap,
        optimizer: &mut dyn Optimizer,
        scheduler: &mut dyn Scheduler,
        analyzer: Option<&GradientCorrelationAnalyzer>,
        weights: TaskWeights,
    ) -> Result<(EpochRecord, Option<PathBuf>)> {
        let his_len = self.system.his_len;
        let position_index = self.config.training.position_target.index(his_len);
        let learning_rate = self.state.current_lr;

        model.set_mode(Mode::Train);
        let train = run_pass(
            self.train_source.as_mut(),
            model,
            &weights,
            his_len,
            position_index,
            Some(PassUpdate {
                optimizer: &mut *optimizer,
                analyzer,
            }),
        )?;
        self.histories.update_all(train.metrics.task_losses);

        model.set_mode(Mode::Eval);
        let eval = run_pass(
            self.eval_source.as_mut(),
            model,
            &weights,
            his_len,
            position_index,
            None,
        )?;
        model.set_mode(Mode::Train);

        scheduler.step(Some(eval.metrics.combined_loss));
        optimizer.set_learning_rate(scheduler.get_lr());

        info!("Training: {}", train.metrics);
        info!("Evaluation: {}", eval.metrics);
        let [w_bs, w_bt, w_up] = weights.as_array();
        info!("Weights: Bs {:.3}, bt {:.3}, Up {:.3}", w_bs, w_bt, w_up);
        info!("Training duration: {:.3}s", train.training_duration);
        if analyzer.is_some() {
            let [g_bs, g_bt, g_up] = train.grad_norms;
            info!(
                "Task correlations measure: {:.5}, grad norms Bs {:.5} bt {:.5} Up {:.5}",
                train.correlation_measure, g_bs, g_bt, g_up
            );
        }

        let record = EpochRecord {
            repetition: self.state.repetition,
            epoch: self.state.epoch,
            train: train.metrics,
            eval: eval.metrics,
            learning_rate,
            weights,
            training_duration: train.training_duration,
            correlation_measure: train.correlation_measure,
            grad_norms: train.grad_norms,
        };
        self.results.record(&record)?;
        self.results.persist(&self.results_path)?;

        let saved = self.checkpoints.save_if_improved(
            self.state.epoch,
            eval.metrics.combined_loss,
            var_map,
            &self.config,
        )?;

        Ok((record, saved))
    }

    /// Current state
    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    /// Results recorded so far
    pub fn results(&self) -> &ResultStore {
        &self.results
    }

    /// File the result store is persisted to
    pub fn results_path(&self) -> &Path {
        &self.results_path
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Current loss histories
    pub fn histories(&self) -> &TaskHistories {
        &self.histories
    }
}

impl TrainingState {
    pub fn new(learning_rate: f64) -> Self {
        Self {
            repetition: 0,
            epoch: 0,
            global_step: 0,
            start_time: Utc::now(),
            status: TrainingStatus::NotStarted,
            current_lr: learning_rate,
        }
    }
}

/// One pass over `source`; updates the model when `update` is given
fn run_pass(
    source: &mut dyn DataSource,
    model: &dyn MultiTaskModel,
    weights: &TaskWeights,
    his_len: usize,
    position_index: usize,
    mut update: Option<PassUpdate<'_>>,
) -> Result<PassOutcome> {
    source.reset()?;

    let mut accumulator = MetricAccumulator::new();
    let mut training_duration = Duration::ZERO;
    let mut correlation_measure = 0.0;
    let mut grad_norms = [0.0; NUM_TASKS];

    while let Some(raw) = source.next_batch()? {
        let targets = BatchTargets::from_raw(&raw, his_len, position_index)?;

        let step_start = Instant::now();
        let outputs = model.forward(&targets.channel_history)?;
        let losses = TaskLosses::compute(&outputs, &targets)?;

        if let Some(update) = update.as_mut() {
            if let Some(analyzer) = update.analyzer {
                let report = analyzer.analyze(&losses.weighted(weights)?, model.shared_layer_weight())?;
                correlation_measure += report.measure;
                for (sum, norm) in grad_norms.iter_mut().zip(report.grad_norms) {
                    *sum += norm;
                }
            }

            let grads = losses.combined(weights)?.backward()?;
            update.optimizer.step(&grads)?;
            training_duration += step_start.elapsed();
        }

        let task_losses = losses.values()?;
        let metrics = BatchMetrics::compute(&outputs, &targets, task_losses, weights.combine(task_losses))?;
        debug!("Batch {}: {}", accumulator.batches(), metrics);
        accumulator.accumulate(&metrics);
    }

    let batches = accumulator.batches();
    if batches == 0 {
        return Err(Error::data("Data source yielded no full batch"));
    }
    let scale = 1.0 / batches as f64;

    Ok(PassOutcome {
        metrics: accumulator.finalize(batches),
        batches,
        training_duration: training_duration.as_secs_f64(),
        correlation_measure: correlation_measure * scale,
        grad_norms: grad_norms.map(|g| g * scale),
    })
}

/// Log the name and shape of every variable, returning the scalar count
fn log_parameters(model_name: &str, var_map: &VarMap) -> Result<usize> {
    let data = var_map
        .data()
        .lock()
        .map_err(|e| Error::internal(format!("Variable map lock poisoned: {}", e)))?;

    let mut names: Vec<&String> = data.keys().collect();
    names.sort();

    let mut total = 0;
    for name in names {
        let var = &data[name];
        info!("{}: {:?}", name, var.dims());
        total += var.elem_count();
    }
    info!("{} parameters: {}", model_name, total);
    Ok(total)
}
