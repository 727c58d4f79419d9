//! Plateau-triggered learning-rate decay
//!
//! Monitors a metric that should decrease (the evaluation loss). When it has
//! not improved by a relative `threshold` for more than `patience` steps, the
//! learning rate is multiplied by `factor`, floored at `min_lr`. Reductions
//! smaller than `eps` are skipped, and `cooldown` steps after a reduction are
//! not counted as bad.

use std::collections::HashMap;

use tracing::{info, warn};

use super::{Scheduler, SchedulerStateDict};
use crate::error::{Error, Result};
use crate::training::config::PlateauConfig;

const SCHEDULER_TYPE: &str = "reduce_on_plateau";

/// Reduce-on-plateau scheduler in `min` mode with relative threshold
#[derive(Debug, Clone)]
pub struct ReduceOnPlateauScheduler {
    /// Base learning rate
    base_lr: f64,

    /// Current learning rate
    current_lr: f64,

    factor: f64,
    patience: usize,
    threshold: f64,
    cooldown: usize,
    min_lr: f64,
    eps: f64,

    /// Best metric seen so far
    best: f64,

    /// Consecutive steps without improvement
    num_bad_epochs: usize,

    /// Steps left before bad epochs are counted again
    cooldown_counter: usize,

    /// Steps taken
    step_count: usize,
}

impl ReduceOnPlateauScheduler {
    /// Create a new scheduler starting at `base_lr`
    pub fn new(config: &PlateauConfig, base_lr: f64) -> Self {
        Self {
            base_lr,
            current_lr: base_lr,
            factor: config.factor,
            patience: config.patience,
            threshold: config.threshold,
            cooldown: config.cooldown,
            min_lr: config.min_lr,
            eps: config.eps,
            best: f64::INFINITY,
            num_bad_epochs: 0,
            cooldown_counter: 0,
            step_count: 0,
        }
    }

    /// Best monitored value so far
    pub fn best(&self) -> f64 {
        self.best
    }

    /// Consecutive steps without improvement
    pub fn num_bad_epochs(&self) -> usize {
        self.num_bad_epochs
    }

    fn is_better(&self, current: f64) -> bool {
        current < self.best * (1.0 - self.threshold)
    }

    fn in_cooldown(&self) -> bool {
        self.cooldown_counter > 0
    }

    fn reduce_lr(&mut self) {
        let new_lr = (self.current_lr * self.factor).max(self.min_lr);
        if self.current_lr - new_lr > self.eps {
            info!(
                "Reducing learning rate from {:e} to {:e}",
                self.current_lr, new_lr
            );
            self.current_lr = new_lr;
        }
    }
}

impl Scheduler for ReduceOnPlateauScheduler {
    fn name(&self) -> &str {
        SCHEDULER_TYPE
    }

    fn step(&mut self, metric: Option<f64>) {
        let Some(current) = metric else {
            warn!("{} stepped without a metric, ignoring", SCHEDULER_TYPE);
            return;
        };
        self.step_count += 1;

        if self.is_better(current) {
            self.best = current;
            self.num_bad_epochs = 0;
        } else {
            self.num_bad_epochs += 1;
        }

        if self.in_cooldown() {
            self.cooldown_counter -= 1;
            self.num_bad_epochs = 0;
        }

        if self.num_bad_epochs > self.patience {
            self.reduce_lr();
            self.cooldown_counter = self.cooldown;
            self.num_bad_epochs = 0;
        }
    }

    fn get_lr(&self) -> f64 {
        self.current_lr
    }

    fn state_dict(&self) -> SchedulerStateDict {
        let mut state = HashMap::new();
        state.insert("best".to_string(), self.best);
        state.insert("num_bad_epochs".to_string(), self.num_bad_epochs as f64);
        state.insert("cooldown_counter".to_string(), self.cooldown_counter as f64);

        let mut hyperparameters = HashMap::new();
        hyperparameters.insert("factor".to_string(), self.factor);
        hyperparameters.insert("patience".to_string(), self.patience as f64);
        hyperparameters.insert("threshold".to_string(), self.threshold);
        hyperparameters.insert("cooldown".to_string(), self.cooldown as f64);
        hyperparameters.insert("min_lr".to_string(), self.min_lr);
        hyperparameters.insert("eps".to_string(), self.eps);

        SchedulerStateDict {
            scheduler_type: SCHEDULER_TYPE.to_string(),
            step_count: self.step_count,
            current_lr: self.current_lr,
            base_lr: self.base_lr,
            state,
            hyperparameters,
        }
    }

    fn load_state_dict(&mut self, state_dict: &SchedulerStateDict) -> Result<()> {
        if state_dict.scheduler_type != SCHEDULER_TYPE {
            return Err(Error::invalid_input(format!(
                "Cannot load '{}' state into {}",
                state_dict.scheduler_type, SCHEDULER_TYPE
            )));
        }

        self.step_count = state_dict.step_count;
        self.current_lr = state_dict.current_lr;
        self.base_lr = state_dict.base_lr;

        if let Some(&best) = state_dict.state.get("best") {
            self.best = best;
        }
        if let Some(&bad) = state_dict.state.get("num_bad_epochs") {
            self.num_bad_epochs = bad as usize;
        }
        if let Some(&counter) = state_dict.state.get("cooldown_counter") {
            self.cooldown_counter = counter as usize;
        }

        Ok(())
    }

    fn reset(&mut self) {
        self.current_lr = self.base_lr;
        self.best = f64::INFINITY;
        self.num_bad_epochs = 0;
        self.cooldown_counter = 0;
        self.step_count = 0;
    }
}
