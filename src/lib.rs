//! mmWave multi-task learning
//!
//! Trains one network to jointly predict, from a window of mmWave
//! beam-training measurements, the serving base station, the optimal beam and
//! the user's position relative to the base stations. The three task losses
//! are reweighted every epoch by their loss-descending rates, and an optional
//! analyzer measures how the tasks' gradients line up on a shared layer.
//!
//! ```rust,ignore
//! use mmwave_mtl::{Config, MultiTaskTrainer};
//!
//! let mut trainer = MultiTaskTrainer::from_config(Config::default())?;
//! let result = trainer.train()?;
//! println!("results written to {}", result.results_path.display());
//! ```

#![warn(rustdoc::broken_intra_doc_links)]

pub mod config;
pub mod error;
pub mod logging;
pub mod models;
pub mod training;

// Re-exports
pub use config::{Config, ModelVariant, RunConfig, SystemParams};
pub use error::{Error, Result};
pub use models::{create_model, Mode, MultiTaskModel, TaskOutputs};
pub use training::{
    MultiTaskTrainer, ResultStore, Task, TrainingConfig, TrainingResult, WeightingMethod,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
