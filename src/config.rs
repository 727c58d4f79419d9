//! Configuration structures for the mmWave multi-task trainer
//!
//! The experiment surface (scenario, velocity, SNR, model variant, ...) lives in
//! [`RunConfig`]; the loop, optimizer and weighting knobs live in
//! [`TrainingConfig`]. Both are plain immutable values built once at startup and
//! passed by reference to every component that needs them.

use std::fmt;
use std::path::{Path, PathBuf};

use candle_core::Device;
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::training::config::TrainingConfig;

/// Main configuration for a training run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Experiment surface
    #[serde(default)]
    pub run: RunConfig,
    /// Training loop configuration
    #[serde(default)]
    pub training: TrainingConfig,
}

impl Config {
    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration as pretty JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate both halves of the configuration
    pub fn validate(&self) -> Result<()> {
        self.run.validate()?;
        self.training.validate()?;
        Ok(())
    }

    /// Name shared by the result store and checkpoints of this run
    pub fn run_name(&self) -> String {
        format!(
            "MTL_{}_lr{}",
            self.training.weighting.method.short_name(),
            self.training.optimizer.learning_rate
        )
    }

    /// Log every configuration value, one `key = value` line each
    pub fn log_values(&self) {
        let run = &self.run;
        info!("mmWave_network_scenarios = {}", run.scenario);
        info!("UE_velocity = {}", run.velocity);
        info!("move_form = {}", run.motion);
        info!("SNR = {}", run.snr);
        info!("training_samples_number = {}", run.training_samples);
        info!("multi_task_model_name = {}", run.model);
        info!("dropout_value = {}", run.dropout);
        info!("device = {}", run.device);
        info!("train_data = {}", run.train_data_path().display());
        info!("eval_data = {}", run.eval_data_path().display());
        info!("output_dir = {}", run.output_dir.display());

        let training = &self.training;
        info!("training_repetitions = {}", training.repetitions);
        info!("epochs = {}", training.epochs);
        info!("batch_size = {}", training.batch_size);
        info!(
            "lr and min_lr = ({:e}, {:e})",
            training.optimizer.learning_rate, training.scheduler.min_lr
        );
        info!("training_method = {}", training.weighting.method);
        info!("warmup_epochs = {}", training.weighting.warmup_epochs);
        info!("beta = {}", training.weighting.beta);
        info!("mu = {}", training.weighting.mu);
        info!("grad_calculate = {}", training.gradient_analysis.enabled);
        info!(
            "task_correlations_measure_method = {}",
            training.gradient_analysis.measure
        );
        info!("eps = {}", training.gradient_analysis.eps);
        info!("position_target = {:?}", training.position_target);
        info!("seed = {}", training.seed);
    }
}

/// Experiment surface: which dataset, which model
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Network scenario
    pub scenario: Scenario,
    /// UE velocity
    pub velocity: Velocity,
    /// UE motion pattern
    pub motion: MotionPattern,
    /// Beam-training SNR
    pub snr: Snr,
    /// Number of training samples
    pub training_samples: SampleCount,
    /// Multi-task model variant
    pub model: ModelVariant,
    /// Dropout between cascaded LSTM stages
    pub dropout: f64,
    /// Compute device
    pub device: DeviceType,
    /// Root directory the dataset layout is resolved against
    pub data_root: PathBuf,
    /// Explicit training split, overrides the derived path
    pub train_data: Option<PathBuf>,
    /// Explicit evaluation split, overrides the derived path
    pub eval_data: Option<PathBuf>,
    /// Directory for result stores and checkpoints
    pub output_dir: PathBuf,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            scenario: Scenario::O1,
            velocity: Velocity::V10ms,
            motion: MotionPattern::Rectilinear,
            snr: Snr::Db5,
            training_samples: SampleCount::Mats400,
            model: ModelVariant::DualCascaded,
            dropout: 0.5,
            device: DeviceType::Cpu,
            data_root: PathBuf::from("data-generation"),
            train_data: None,
            eval_data: None,
            output_dir: PathBuf::from("."),
        }
    }
}

impl RunConfig {
    /// Validate the experiment surface
    pub fn validate(&self) -> Result<()> {
        if self.motion == MotionPattern::Spiral && self.scenario != Scenario::O1 {
            return Err(Error::config(format!(
                "{} is not supported for scenario {}",
                self.motion, self.scenario
            )));
        }

        if !(0.0..1.0).contains(&self.dropout) {
            return Err(Error::config("Dropout must be in [0.0, 1.0)"));
        }

        Ok(())
    }

    /// Dimensions derived from the scenario
    pub fn system(&self) -> SystemParams {
        SystemParams {
            bs_num: self.scenario.bs_num(),
            ..SystemParams::default()
        }
    }

    /// Directory holding this experiment's dataset splits
    fn dataset_dir(&self) -> PathBuf {
        match (self.motion, self.scenario) {
            (MotionPattern::Rectilinear, Scenario::O1) => self
                .data_root
                .join("MTL_BS1-10-14-17_Row1400-1650_dataset")
                .join(format!("v{}_snr{}", self.velocity, self.snr)),
            (MotionPattern::Rectilinear, Scenario::O1Blockage) => self
                .data_root
                .join("O1_28B_BS2-3-6_Row875-1125_MTLdataset")
                .join(format!("v{}_snr{}", self.velocity, self.snr)),
            (MotionPattern::Spiral, _) => self
                .data_root
                .join("Spiral2D_BS1-10-14-17_Row1400-1650_MTLdataset")
                .join(format!("snr{}", self.snr)),
        }
    }

    /// The O1 rectilinear splits carry a `_new` suffix
    fn split_suffix(&self) -> &'static str {
        match (self.motion, self.scenario) {
            (MotionPattern::Rectilinear, Scenario::O1) => "_new",
            _ => "",
        }
    }

    /// Training split location
    pub fn train_data_path(&self) -> PathBuf {
        match &self.train_data {
            Some(path) => path.clone(),
            None => self.dataset_dir().join(format!(
                "train_{}{}",
                self.training_samples,
                self.split_suffix()
            )),
        }
    }

    /// Evaluation split location
    pub fn eval_data_path(&self) -> PathBuf {
        match &self.eval_data {
            Some(path) => path.clone(),
            None => self
                .dataset_dir()
                .join(format!("test_50mats{}", self.split_suffix())),
        }
    }
}

/// Fixed dimensions of the beam-training measurements
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemParams {
    /// Number of candidate base stations
    pub bs_num: usize,
    /// Number of beams per base station
    pub beam_num: usize,
    /// Length of the historical window fed to the model
    pub his_len: usize,
    /// Number of predicted steps
    pub pre_len: usize,
    /// CNN feature width
    pub cnn_feature_num: usize,
    /// LSTM feature width
    pub lstm_feature_num: usize,
}

impl SystemParams {
    /// Total sequence length stored per sample
    pub fn seq_len(&self) -> usize {
        self.his_len + self.pre_len
    }
}

impl Default for SystemParams {
    fn default() -> Self {
        Self {
            bs_num: 4,
            beam_num: 32,
            his_len: 9,
            pre_len: 1,
            cnn_feature_num: 64,
            lstm_feature_num: 512,
        }
    }
}

macro_rules! choice_display {
    ($ty:ty) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let value = self
                    .to_possible_value()
                    .map(|v| v.get_name().to_string())
                    .unwrap_or_default();
                f.write_str(&value)
            }
        }
    };
}

/// mmWave network scenario
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum Scenario {
    /// DeepMIMO O1, four base stations
    #[value(name = "O1")]
    #[serde(rename = "O1")]
    O1,
    /// DeepMIMO O1 with blockage, three base stations
    #[value(name = "O1_Blockage")]
    #[serde(rename = "O1_Blockage")]
    O1Blockage,
}

impl Scenario {
    /// Number of candidate base stations in this scenario
    pub fn bs_num(&self) -> usize {
        match self {
            Scenario::O1 => 4,
            Scenario::O1Blockage => 3,
        }
    }
}

/// UE velocity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum Velocity {
    #[value(name = "5ms")]
    #[serde(rename = "5ms")]
    V5ms,
    #[value(name = "10ms")]
    #[serde(rename = "10ms")]
    V10ms,
    #[value(name = "15ms")]
    #[serde(rename = "15ms")]
    V15ms,
    #[value(name = "20ms")]
    #[serde(rename = "20ms")]
    V20ms,
}

/// UE motion pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum MotionPattern {
    #[value(name = "rectilinear_motion")]
    #[serde(rename = "rectilinear_motion")]
    Rectilinear,
    #[value(name = "spiral_motion")]
    #[serde(rename = "spiral_motion")]
    Spiral,
}

/// Beam-training SNR
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum Snr {
    #[value(name = "0dB")]
    #[serde(rename = "0dB")]
    Db0,
    #[value(name = "5dB")]
    #[serde(rename = "5dB")]
    Db5,
    #[value(name = "10dB")]
    #[serde(rename = "10dB")]
    Db10,
    #[value(name = "15dB")]
    #[serde(rename = "15dB")]
    Db15,
}

/// Training set size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum SampleCount {
    #[value(name = "100mats")]
    #[serde(rename = "100mats")]
    Mats100,
    #[value(name = "200mats")]
    #[serde(rename = "200mats")]
    Mats200,
    #[value(name = "300mats")]
    #[serde(rename = "300mats")]
    Mats300,
    #[value(name = "400mats")]
    #[serde(rename = "400mats")]
    Mats400,
    #[value(name = "500mats")]
    #[serde(rename = "500mats")]
    Mats500,
}

/// Multi-task model variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
pub enum ModelVariant {
    /// Shared encoder and LSTM, independent heads
    #[value(name = "Vanilla")]
    #[serde(rename = "Vanilla")]
    Vanilla,
    /// BS selection feeds beam tracking feeds positioning
    #[value(name = "Bs2bt2Up")]
    #[serde(rename = "Bs2bt2Up")]
    Bs2bt2Up,
    /// Positioning feeds beam tracking feeds BS selection
    #[value(name = "Up2bt2Bs")]
    #[serde(rename = "Up2bt2Bs")]
    Up2bt2Bs,
    /// BS selection and positioning both feed beam tracking
    #[value(name = "Dual_Cascaded")]
    #[serde(rename = "Dual_Cascaded")]
    DualCascaded,
}

/// Compute device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Cpu,
    Cuda,
    Metal,
}

impl DeviceType {
    /// Open the candle device, failing if the backend is not compiled in
    pub fn to_device(&self) -> Result<Device> {
        match self {
            DeviceType::Cpu => Ok(Device::Cpu),
            DeviceType::Cuda => Device::new_cuda(0)
                .map_err(|e| Error::config(format!("CUDA device unavailable: {}", e))),
            DeviceType::Metal => Device::new_metal(0)
                .map_err(|e| Error::config(format!("Metal device unavailable: {}", e))),
        }
    }
}

choice_display!(Scenario);
choice_display!(Velocity);
choice_display!(MotionPattern);
choice_display!(Snr);
choice_display!(SampleCount);
choice_display!(ModelVariant);
choice_display!(DeviceType);

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use test_case::test_case;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.run.system().bs_num, 4);
        assert_eq!(config.run.system().seq_len(), 10);
    }

    #[test_case(Scenario::O1, 4)]
    #[test_case(Scenario::O1Blockage, 3)]
    fn test_bs_num_per_scenario(scenario: Scenario, expected: usize) {
        let run = RunConfig {
            scenario,
            ..RunConfig::default()
        };
        assert_eq!(run.system().bs_num, expected);
    }

    #[test]
    fn test_spiral_blockage_rejected() {
        let run = RunConfig {
            scenario: Scenario::O1Blockage,
            motion: MotionPattern::Spiral,
            ..RunConfig::default()
        };
        assert!(matches!(run.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_dropout_range() {
        let run = RunConfig {
            dropout: 1.0,
            ..RunConfig::default()
        };
        assert!(run.validate().is_err());
    }

    #[test]
    fn test_derived_paths() {
        let run = RunConfig {
            data_root: PathBuf::from("/data"),
            ..RunConfig::default()
        };
        assert_eq!(
            run.train_data_path(),
            PathBuf::from("/data/MTL_BS1-10-14-17_Row1400-1650_dataset/v10ms_snr5dB/train_400mats_new")
        );
        assert_eq!(
            run.eval_data_path(),
            PathBuf::from("/data/MTL_BS1-10-14-17_Row1400-1650_dataset/v10ms_snr5dB/test_50mats_new")
        );

        let spiral = RunConfig {
            motion: MotionPattern::Spiral,
            snr: Snr::Db15,
            training_samples: SampleCount::Mats100,
            ..run.clone()
        };
        assert_eq!(
            spiral.train_data_path(),
            PathBuf::from("/data/Spiral2D_BS1-10-14-17_Row1400-1650_MTLdataset/snr15dB/train_100mats")
        );

        let explicit = RunConfig {
            eval_data: Some(PathBuf::from("/elsewhere/eval")),
            ..run
        };
        assert_eq!(explicit.eval_data_path(), PathBuf::from("/elsewhere/eval"));
    }

    #[test_case("O1_Blockage", Scenario::O1Blockage)]
    #[test_case("O1", Scenario::O1)]
    fn test_scenario_parsing(raw: &str, expected: Scenario) {
        assert_eq!(Scenario::from_str(raw, false).unwrap(), expected);
        assert_eq!(expected.to_string(), raw);
    }

    #[test]
    fn test_unknown_choice_rejected() {
        assert!(Scenario::from_str("O2", false).is_err());
        assert!(ModelVariant::from_str("Transformer", false).is_err());
        assert!(serde_json::from_str::<ModelVariant>("\"Transformer\"").is_err());
    }

    #[test]
    fn test_config_file_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");

        let mut config = Config::default();
        config.run.model = ModelVariant::Bs2bt2Up;
        config.training.epochs = 7;
        config.save(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.run.model, ModelVariant::Bs2bt2Up);
        assert_eq!(loaded.training.epochs, 7);
    }

    #[test]
    fn test_partial_config_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"run": {"scenario": "O1_Blockage"}}"#).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.run.scenario, Scenario::O1Blockage);
        assert_eq!(loaded.training.batch_size, 64);
    }

    #[test]
    fn test_run_name() {
        let config = Config::default();
        assert_eq!(config.run_name(), "MTL_ldr_lr0.001");
    }
}
