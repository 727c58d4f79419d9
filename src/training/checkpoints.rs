//! Checkpoint-on-improvement
//!
//! One checkpoint file per repetition, overwritten whenever the evaluation
//! loss reaches a new strict minimum within that repetition. The model
//! variables go into a safetensors file; a JSON sidecar records when and why
//! the checkpoint was written.

use std::path::{Path, PathBuf};

use candle_nn::VarMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::{Config, ModelVariant};
use crate::error::{Error, Result};

/// Sidecar written next to every checkpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Model variant the variables belong to
    pub model: ModelVariant,

    /// Training repetition
    pub repetition: usize,

    /// Epoch after which the checkpoint was taken
    pub epoch: usize,

    /// Evaluation combined loss at that epoch
    pub eval_loss: f64,

    /// Number of scalar parameters
    pub num_parameters: usize,

    /// Crate version that wrote the checkpoint
    pub framework_version: String,

    /// Wall-clock time of the save
    pub timestamp: DateTime<Utc>,

    /// Full run configuration
    pub config: Config,
}

/// Tracks the best evaluation loss of the current repetition
#[derive(Debug)]
pub struct CheckpointManager {
    dir: PathBuf,
    base_name: String,
    repetition: usize,
    min_eval_loss: f64,
}

impl CheckpointManager {
    /// Create a manager writing `<dir>/<base_name>_tt<rep>.safetensors`
    pub fn new(dir: impl AsRef<Path>, base_name: impl Into<String>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            base_name: base_name.into(),
            repetition: 0,
            min_eval_loss: f64::INFINITY,
        })
    }

    /// Manager named after the run's method, learning rate, velocity and SNR
    pub fn for_config(config: &Config) -> Result<Self> {
        let base_name = format!(
            "{}_v{}_snr{}",
            config.run_name(),
            config.run.velocity,
            config.run.snr
        );
        Self::new(&config.run.output_dir, base_name)
    }

    /// Start tracking a new repetition with `min_eval_loss = +inf`
    pub fn begin_repetition(&mut self, repetition: usize) {
        self.repetition = repetition;
        self.min_eval_loss = f64::INFINITY;
    }

    /// Lowest evaluation loss seen in the current repetition
    pub fn min_eval_loss(&self) -> f64 {
        self.min_eval_loss
    }

    /// Strictly below the current minimum
    pub fn is_improvement(&self, eval_loss: f64) -> bool {
        eval_loss < self.min_eval_loss
    }

    /// Checkpoint file of a repetition
    pub fn checkpoint_path(&self, repetition: usize) -> PathBuf {
        self.dir
            .join(format!("{}_tt{}.safetensors", self.base_name, repetition))
    }

    /// Sidecar file of a checkpoint
    pub fn metadata_path(checkpoint: &Path) -> PathBuf {
        checkpoint.with_extension("json")
    }

    /// Save the model if `eval_loss` is a new minimum for this repetition
    ///
    /// Returns the checkpoint path when a save happened.
    pub fn save_if_improved(
        &mut self,
        epoch: usize,
        eval_loss: f64,
        var_map: &VarMap,
        config: &Config,
    ) -> Result<Option<PathBuf>> {
        if !self.is_improvement(eval_loss) {
            return Ok(None);
        }
        self.min_eval_loss = eval_loss;

        let path = self.checkpoint_path(self.repetition);
        var_map.save(&path)?;

        let metadata = CheckpointMetadata {
            model: config.run.model,
            repetition: self.repetition,
            epoch,
            eval_loss,
            num_parameters: var_map.all_vars().iter().map(|v| v.elem_count()).sum(),
            framework_version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: Utc::now(),
            config: config.clone(),
        };
        let content = serde_json::to_string_pretty(&metadata)?;
        std::fs::write(Self::metadata_path(&path), content)?;

        info!(
            "Saved checkpoint {} (epoch {}, eval loss {:.6})",
            path.display(),
            epoch,
            eval_loss
        );
        Ok(Some(path))
    }

    /// Load checkpointed variables into an existing `VarMap`
    pub fn load(path: impl AsRef<Path>, var_map: &mut VarMap) -> Result<CheckpointMetadata> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(Error::invalid_input(format!(
                "Checkpoint {} does not exist",
                path.display()
            )));
        }
        var_map.load(path)?;
        Self::read_metadata(path)
    }

    /// Read the sidecar of a checkpoint
    pub fn read_metadata(path: impl AsRef<Path>) -> Result<CheckpointMetadata> {
        let content = std::fs::read_to_string(Self::metadata_path(path.as_ref()))?;
        Ok(serde_json::from_str(&content)?)
    }
}
