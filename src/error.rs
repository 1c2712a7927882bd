#![forbid(unsafe_code)]

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::robot::model::RobotStatus;
use crate::task::model::TaskState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Task,
    Robot,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Task => f.write_str("task"),
            Self::Robot => f.write_str("robot"),
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: String },

    #[error("invalid transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: TaskState,
        to: TaskState,
    },

    #[error("invalid task type '{0}' (expected ordering|delivery|collection|payment|charging)")]
    InvalidTaskType(String),

    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("robot {robot_id} is unavailable ({status})")]
    RobotUnavailable {
        robot_id: String,
        status: RobotStatus,
    },

    #[error("robot {0} has no assigned task")]
    RobotNotAssigned(String),

    #[error("task {task_id}: step {step} is out of range ({total} waypoints)")]
    StepOutOfRange {
        task_id: String,
        step: usize,
        total: usize,
    },

    #[error("no charging slot available for robot {robot_id} ({active}/{max} in use)")]
    NoChargingSlotAvailable {
        robot_id: String,
        active: usize,
        max: usize,
    },

    #[error("{kind} {id} is busy, retry later")]
    RetryLater { kind: EntityKind, id: String },

    #[error("invalid robot command '{0}' (expected RETURN_TO_BASE|START_CHARGING)")]
    InvalidCommand(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("invalid config key '{0}'")]
    InvalidConfigKey(String),

    #[error("invalid config value for '{key}': {msg}")]
    InvalidConfigValue { key: String, msg: String },

    #[error("io error at {path}: {source}")]
    IoPath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl DispatchError {
    pub(crate) fn storage(err: &anyhow::Error) -> Self {
        Self::Storage(format!("{err:#}"))
    }

    /// Errors caused by the request itself. Never retried and nothing was mutated.
    #[must_use]
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. }
                | Self::InvalidTransition { .. }
                | Self::InvalidTaskType(_)
                | Self::InvalidTask(_)
                | Self::StepOutOfRange { .. }
                | Self::InvalidCommand(_)
        )
    }

    /// Expected outcomes of a busy fleet; callers try again later and must not
    /// report them as failures.
    #[must_use]
    pub fn is_steady_state(&self) -> bool {
        matches!(
            self,
            Self::RobotUnavailable { .. } | Self::NoChargingSlotAvailable { .. }
        )
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RetryLater { .. })
    }
}
