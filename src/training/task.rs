//! The three jointly trained tasks

use std::fmt;

use serde::{Deserialize, Serialize};

/// Number of tasks trained jointly
pub const NUM_TASKS: usize = 3;

/// One of the three tasks, addressed by a fixed index throughout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Task {
    /// Serving base-station classification
    BsSelection,
    /// Transmit beam classification
    BeamTracking,
    /// Relative UE position regression
    UePositioning,
}

impl Task {
    /// All tasks in index order
    pub const ALL: [Task; NUM_TASKS] = [Task::BsSelection, Task::BeamTracking, Task::UePositioning];

    /// Fixed index of the task
    pub fn index(&self) -> usize {
        match self {
            Task::BsSelection => 0,
            Task::BeamTracking => 1,
            Task::UePositioning => 2,
        }
    }

    /// Short tag used in logs
    pub fn tag(&self) -> &'static str {
        match self {
            Task::BsSelection => "Bs",
            Task::BeamTracking => "bt",
            Task::UePositioning => "Up",
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::BsSelection => f.write_str("BS-selection"),
            Task::BeamTracking => f.write_str("beam-tracking"),
            Task::UePositioning => f.write_str("UE-positioning"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indices_follow_order() {
        for (i, task) in Task::ALL.iter().enumerate() {
            assert_eq!(task.index(), i);
        }
    }
}
