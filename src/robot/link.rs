#![forbid(unsafe_code)]

use std::fmt::{self, Debug};

use parking_lot::Mutex;
use serde::Serialize;

/// Instruction sent to a physical robot after the dispatcher committed a change.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LinkMessage {
    Dispatch { task_id: String, destination: String },
    Hold { task_id: String },
    Resume { task_id: String },
    Abort { task_id: String },
    StartCharging { station: String },
    ReturnToBase { home: String },
}

impl fmt::Display for LinkMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dispatch {
                task_id,
                destination,
            } => write!(f, "dispatch {task_id} to {destination}"),
            Self::Hold { task_id } => write!(f, "hold position ({task_id})"),
            Self::Resume { task_id } => write!(f, "resume {task_id}"),
            Self::Abort { task_id } => write!(f, "abort {task_id}"),
            Self::StartCharging { station } => write!(f, "charge at {station}"),
            Self::ReturnToBase { home } => write!(f, "return to {home}"),
        }
    }
}

/// Outbound channel to the fleet. Delivery is fire-and-forget; robot state only
/// changes through telemetry and dispatcher operations.
pub trait RobotLink: Send + Sync + Debug {
    fn send(&self, robot_id: &str, message: &LinkMessage);
}

/// Writes every message to the log. Used when no fleet bridge is attached.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLink;

impl RobotLink for TracingLink {
    fn send(&self, robot_id: &str, message: &LinkMessage) {
        tracing::info!(robot = robot_id, %message, "robot command");
    }
}

/// Keeps every message in memory.
#[derive(Debug, Default)]
pub struct RecordingLink {
    sent: Mutex<Vec<(String, LinkMessage)>>,
}

impl RecordingLink {
    #[must_use]
    pub fn sent(&self) -> Vec<(String, LinkMessage)> {
        self.sent.lock().clone()
    }

    #[must_use]
    pub fn sent_to(&self, robot_id: &str) -> Vec<LinkMessage> {
        self.sent
            .lock()
            .iter()
            .filter(|(id, _)| id == robot_id)
            .map(|(_, m)| m.clone())
            .collect()
    }
}

impl RobotLink for RecordingLink {
    fn send(&self, robot_id: &str, message: &LinkMessage) {
        self.sent.lock().push((robot_id.to_owned(), message.clone()));
    }
}
