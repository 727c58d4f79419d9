//! Run-wide result arrays, persisted after every epoch
//!
//! All arrays are indexed `[repetition, (row,) epoch]`. The store is written as
//! a single safetensors container (`f64` tensors keyed by array name) via a
//! temporary file and a rename, so a crash never leaves a truncated file.
//!
//! Keys, each with a `_train` and `_eval` form where a phase applies:
//!
//! | key | shape |
//! |-----|-------|
//! | `loss_{phase}` | `(R, 4, E)`: combined, BS, beam, position |
//! | `BS_acur_{phase}` | `(R, E)` |
//! | `beam_acur_{phase}` | `(R, E)` |
//! | `beam_norm_gain_{phase}` | `(R, E)` |
//! | `dis_{phase}` | `(R, E)` |
//! | `now_lr` | `(R, E)` |
//! | `omega_list` | `(R, 3, E)` |
//! | `training_duration_list` | `(R, E)` |
//! | `task_correlations_measure_list` | `(R, E)` |
//! | `gn_list` | `(R, 3, E)` |
//! | `completed_epochs` | `(R)`, `u32` |

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use ndarray::{Array2, Array3, ArrayD, Dimension, IxDyn};
use tracing::debug;

use crate::error::{Error, Result};
use crate::training::loss::TaskWeights;
use crate::training::task::NUM_TASKS;

use super::EpochMetrics;

/// Which pass a metric belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Train,
    Eval,
}

/// Everything the driver records for one finished epoch
#[derive(Debug, Clone)]
pub struct EpochRecord {
    pub repetition: usize,
    pub epoch: usize,
    pub train: EpochMetrics,
    pub eval: EpochMetrics,
    /// Learning rate in effect when the epoch started
    pub learning_rate: f64,
    pub weights: TaskWeights,
    /// Seconds spent in forward, backward and optimizer steps
    pub training_duration: f64,
    /// Correlation measure averaged over the epoch's training batches
    pub correlation_measure: f64,
    /// Per-task gradient norms on the shared layer, averaged likewise
    pub grad_norms: [f64; NUM_TASKS],
}

/// Metric arrays of one phase
#[derive(Debug, Clone, PartialEq)]
struct PhaseArrays {
    /// (R, 4, E): combined, BS, beam, position
    loss: Array3<f64>,
    bs_accuracy: Array2<f64>,
    beam_accuracy: Array2<f64>,
    beam_gain: Array2<f64>,
    distance_error: Array2<f64>,
}

impl PhaseArrays {
    fn zeros(repetitions: usize, epochs: usize) -> Self {
        Self {
            loss: Array3::zeros((repetitions, NUM_TASKS + 1, epochs)),
            bs_accuracy: Array2::zeros((repetitions, epochs)),
            beam_accuracy: Array2::zeros((repetitions, epochs)),
            beam_gain: Array2::zeros((repetitions, epochs)),
            distance_error: Array2::zeros((repetitions, epochs)),
        }
    }

    fn record(&mut self, rep: usize, epoch: usize, metrics: &EpochMetrics) {
        for (row, value) in metrics.losses().into_iter().enumerate() {
            self.loss[[rep, row, epoch]] = value;
        }
        self.bs_accuracy[[rep, epoch]] = metrics.bs_accuracy;
        self.beam_accuracy[[rep, epoch]] = metrics.beam_accuracy;
        self.beam_gain[[rep, epoch]] = metrics.beam_gain;
        self.distance_error[[rep, epoch]] = metrics.distance_error;
    }

    fn metrics(&self, rep: usize, epoch: usize) -> EpochMetrics {
        EpochMetrics {
            combined_loss: self.loss[[rep, 0, epoch]],
            task_losses: [
                self.loss[[rep, 1, epoch]],
                self.loss[[rep, 2, epoch]],
                self.loss[[rep, 3, epoch]],
            ],
            bs_accuracy: self.bs_accuracy[[rep, epoch]],
            beam_accuracy: self.beam_accuracy[[rep, epoch]],
            beam_gain: self.beam_gain[[rep, epoch]],
            distance_error: self.distance_error[[rep, epoch]],
        }
    }
}

/// Accumulating result arrays for a whole run
#[derive(Debug, Clone, PartialEq)]
pub struct ResultStore {
    repetitions: usize,
    epochs: usize,
    train: PhaseArrays,
    eval: PhaseArrays,
    now_lr: Array2<f64>,
    /// (R, 3, E) task weights
    omega: Array3<f64>,
    training_duration: Array2<f64>,
    correlation_measure: Array2<f64>,
    /// (R, 3, E) shared-layer gradient norms
    grad_norms: Array3<f64>,
    /// Epochs recorded per repetition
    completed: Vec<usize>,
}

impl ResultStore {
    /// Zero-filled store for `repetitions x epochs`
    pub fn new(repetitions: usize, epochs: usize) -> Self {
        Self {
            repetitions,
            epochs,
            train: PhaseArrays::zeros(repetitions, epochs),
            eval: PhaseArrays::zeros(repetitions, epochs),
            now_lr: Array2::zeros((repetitions, epochs)),
            omega: Array3::zeros((repetitions, NUM_TASKS, epochs)),
            training_duration: Array2::zeros((repetitions, epochs)),
            correlation_measure: Array2::zeros((repetitions, epochs)),
            grad_norms: Array3::zeros((repetitions, NUM_TASKS, epochs)),
            completed: vec![0; repetitions],
        }
    }

    /// File name of the store for a run
    pub fn file_name(run_name: &str) -> String {
        format!("{}.safetensors", run_name)
    }

    pub fn repetitions(&self) -> usize {
        self.repetitions
    }

    pub fn epochs(&self) -> usize {
        self.epochs
    }

    /// Number of epochs recorded for a repetition
    pub fn completed_epochs(&self, repetition: usize) -> usize {
        self.completed.get(repetition).copied().unwrap_or(0)
    }

    /// Write one epoch's scalars into every array
    pub fn record(&mut self, record: &EpochRecord) -> Result<()> {
        let (rep, epoch) = (record.repetition, record.epoch);
        if rep >= self.repetitions || epoch >= self.epochs {
            return Err(Error::invalid_input(format!(
                "Epoch record ({}, {}) outside result store ({}, {})",
                rep, epoch, self.repetitions, self.epochs
            )));
        }

        self.train.record(rep, epoch, &record.train);
        self.eval.record(rep, epoch, &record.eval);
        self.now_lr[[rep, epoch]] = record.learning_rate;
        self.training_duration[[rep, epoch]] = record.training_duration;
        self.correlation_measure[[rep, epoch]] = record.correlation_measure;
        for (task, weight) in record.weights.as_array().into_iter().enumerate() {
            self.omega[[rep, task, epoch]] = weight;
            self.grad_norms[[rep, task, epoch]] = record.grad_norms[task];
        }
        self.completed[rep] = self.completed[rep].max(epoch + 1);
        Ok(())
    }

    /// Recorded metrics of one phase
    pub fn metrics(&self, phase: Phase, repetition: usize, epoch: usize) -> EpochMetrics {
        match phase {
            Phase::Train => self.train.metrics(repetition, epoch),
            Phase::Eval => self.eval.metrics(repetition, epoch),
        }
    }

    /// Learning rate in effect at the start of an epoch
    pub fn learning_rate(&self, repetition: usize, epoch: usize) -> f64 {
        self.now_lr[[repetition, epoch]]
    }

    /// Task weights used during an epoch
    pub fn weights(&self, repetition: usize, epoch: usize) -> TaskWeights {
        TaskWeights::new(std::array::from_fn(|task| self.omega[[repetition, task, epoch]]))
    }

    pub fn training_duration(&self, repetition: usize, epoch: usize) -> f64 {
        self.training_duration[[repetition, epoch]]
    }

    pub fn correlation_measure(&self, repetition: usize, epoch: usize) -> f64 {
        self.correlation_measure[[repetition, epoch]]
    }

    pub fn grad_norms(&self, repetition: usize, epoch: usize) -> [f64; NUM_TASKS] {
        std::array::from_fn(|task| self.grad_norms[[repetition, task, epoch]])
    }

    /// Overwrite `path` with the full store
    pub fn persist(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let device = Device::Cpu;

        let mut tensors = HashMap::new();
        for (name, array) in self.named_arrays() {
            tensors.insert(name.to_string(), array_to_tensor(array, &device)?);
        }
        let completed: Vec<u32> = self.completed.iter().map(|&n| n as u32).collect();
        tensors.insert(
            "completed_epochs".to_string(),
            Tensor::from_vec(completed, self.repetitions, &device)?,
        );

        let tmp_path = temporary_path(path);
        candle_core::safetensors::save(&tensors, &tmp_path)?;
        std::fs::rename(&tmp_path, path)?;

        debug!("Persisted result store to {}", path.display());
        Ok(())
    }

    /// Read a store written by [`ResultStore::persist`]
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let mut tensors = candle_core::safetensors::load(path.as_ref(), &Device::Cpu)?;

        let completed = take(&mut tensors, "completed_epochs")?.to_vec1::<u32>()?;
        let omega = take_array::<ndarray::Ix3>(&mut tensors, "omega_list")?;
        let (repetitions, _, epochs) = omega.dim();
        if completed.len() != repetitions {
            return Err(Error::shape(repetitions, completed.len()));
        }

        let mut phase = |suffix: &str| -> Result<PhaseArrays> {
            Ok(PhaseArrays {
                loss: take_array(&mut tensors, &format!("loss_{}", suffix))?,
                bs_accuracy: take_array(&mut tensors, &format!("BS_acur_{}", suffix))?,
                beam_accuracy: take_array(&mut tensors, &format!("beam_acur_{}", suffix))?,
                beam_gain: take_array(&mut tensors, &format!("beam_norm_gain_{}", suffix))?,
                distance_error: take_array(&mut tensors, &format!("dis_{}", suffix))?,
            })
        };
        let train = phase("train")?;
        let eval = phase("eval")?;

        let store = Self {
            repetitions,
            epochs,
            train,
            eval,
            now_lr: take_array(&mut tensors, "now_lr")?,
            omega,
            training_duration: take_array(&mut tensors, "training_duration_list")?,
            correlation_measure: take_array(&mut tensors, "task_correlations_measure_list")?,
            grad_norms: take_array(&mut tensors, "gn_list")?,
            completed: completed.into_iter().map(|n| n as usize).collect(),
        };

        if store.now_lr.dim() != (repetitions, epochs) {
            return Err(Error::shape((repetitions, epochs), store.now_lr.dim()));
        }
        Ok(store)
    }

    fn named_arrays(&self) -> Vec<(&'static str, ArrayD<f64>)> {
        vec![
            ("loss_train", self.train.loss.clone().into_dyn()),
            ("loss_eval", self.eval.loss.clone().into_dyn()),
            ("BS_acur_train", self.train.bs_accuracy.clone().into_dyn()),
            ("BS_acur_eval", self.eval.bs_accuracy.clone().into_dyn()),
            ("beam_acur_train", self.train.beam_accuracy.clone().into_dyn()),
            ("beam_acur_eval", self.eval.beam_accuracy.clone().into_dyn()),
            ("beam_norm_gain_train", self.train.beam_gain.clone().into_dyn()),
            ("beam_norm_gain_eval", self.eval.beam_gain.clone().into_dyn()),
            ("dis_train", self.train.distance_error.clone().into_dyn()),
            ("dis_eval", self.eval.distance_error.clone().into_dyn()),
            ("now_lr", self.now_lr.clone().into_dyn()),
            ("omega_list", self.omega.clone().into_dyn()),
            ("training_duration_list", self.training_duration.clone().into_dyn()),
            (
                "task_correlations_measure_list",
                self.correlation_measure.clone().into_dyn(),
            ),
            ("gn_list", self.grad_norms.clone().into_dyn()),
        ]
    }
}

fn temporary_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn array_to_tensor(array: ArrayD<f64>, device: &Device) -> Result<Tensor> {
    let shape = array.shape().to_vec();
    let data: Vec<f64> = array.iter().copied().collect();
    Ok(Tensor::from_vec(data, shape, device)?)
}

fn take(tensors: &mut HashMap<String, Tensor>, name: &str) -> Result<Tensor> {
    tensors
        .remove(name)
        .ok_or_else(|| Error::data(format!("Result store is missing '{}'", name)))
}

fn take_array<D: Dimension>(tensors: &mut HashMap<String, Tensor>, name: &str) -> Result<ndarray::Array<f64, D>> {
    let tensor = take(tensors, name)?;
    let dims = tensor.dims().to_vec();
    let data = tensor.flatten_all()?.to_vec1::<f64>()?;
    ArrayD::from_shape_vec(IxDyn(&dims), data)
        .and_then(|array| array.into_dimensionality::<D>())
        .map_err(|e| Error::data(format!("Result array '{}' has an unexpected shape: {}", name, e)))
}
