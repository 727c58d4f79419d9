//! Two-step loss history used to measure how fast each task is still improving
//!
//! Each task keeps an exponential moving average of its epoch-mean training
//! loss together with the value it had one epoch earlier. The ratio of the
//! older to the newer value is the task's loss-descending rate.

use serde::{Deserialize, Serialize};

use crate::training::task::{Task, NUM_TASKS};

/// EMA of one task's loss: `[L(t-1), L(t-2)]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LossHistory {
    slots: [f64; 2],
}

impl LossHistory {
    /// Value both slots start from
    pub const INITIAL: f64 = 1.0;

    /// Fresh history at `[1.0, 1.0]`
    pub fn new() -> Self {
        Self {
            slots: [Self::INITIAL; 2],
        }
    }

    /// Build a history from explicit `[latest, previous]` values
    pub fn from_slots(latest: f64, previous: f64) -> Self {
        Self {
            slots: [latest, previous],
        }
    }

    /// Shift the newest EMA into the older slot and blend in `new_loss`
    ///
    /// `slot[1] <- slot[0]`, `slot[0] <- mu * new_loss + (1 - mu) * slot[0]`.
    pub fn push(self, new_loss: f64, mu: f64) -> Self {
        let latest = self.slots[0];
        Self {
            slots: [mu * new_loss + (1.0 - mu) * latest, latest],
        }
    }

    /// Most recent EMA, `L(t-1)`
    pub fn latest(&self) -> f64 {
        self.slots[0]
    }

    /// EMA one epoch earlier, `L(t-2)`
    pub fn previous(&self) -> f64 {
        self.slots[1]
    }

    /// Both slots, newest first
    pub fn slots(&self) -> [f64; 2] {
        self.slots
    }

    /// `L(t-2) / L(t-1)`; above 1 while the loss keeps falling
    pub fn descending_rate(&self) -> f64 {
        self.slots[1] / self.slots[0]
    }
}

impl Default for LossHistory {
    fn default() -> Self {
        Self::new()
    }
}

/// One [`LossHistory`] per task plus the shared smoothing constant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskHistories {
    histories: [LossHistory; NUM_TASKS],
    mu: f64,
}

impl TaskHistories {
    /// All tasks at their initial state
    pub fn new(mu: f64) -> Self {
        Self {
            histories: [LossHistory::new(); NUM_TASKS],
            mu,
        }
    }

    /// Build from explicit per-task histories
    pub fn from_histories(histories: [LossHistory; NUM_TASKS], mu: f64) -> Self {
        Self { histories, mu }
    }

    /// Return every task to `[1.0, 1.0]`
    pub fn reset(&mut self) {
        self.histories = [LossHistory::new(); NUM_TASKS];
    }

    /// Record one task's epoch-mean training loss
    pub fn update(&mut self, task: Task, new_loss: f64) {
        let slot = &mut self.histories[task.index()];
        *slot = slot.push(new_loss, self.mu);
    }

    /// Record all three epoch-mean training losses, in task order
    pub fn update_all(&mut self, losses: [f64; NUM_TASKS]) {
        for task in Task::ALL {
            self.update(task, losses[task.index()]);
        }
    }

    /// History of a single task
    pub fn get(&self, task: Task) -> &LossHistory {
        &self.histories[task.index()]
    }

    /// Descending rate of every task, in task order
    pub fn descending_rates(&self) -> [f64; NUM_TASKS] {
        self.histories.map(|h| h.descending_rate())
    }

    /// Smoothing constant
    pub fn mu(&self) -> f64 {
        self.mu
    }
}
