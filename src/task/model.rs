#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::DispatchError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    Ordering,
    Delivery,
    Collection,
    Payment,
    Charging,
}

impl TaskType {
    pub const ALL: [Self; 5] = [
        Self::Ordering,
        Self::Delivery,
        Self::Collection,
        Self::Payment,
        Self::Charging,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ordering => "ordering",
            Self::Delivery => "delivery",
            Self::Collection => "collection",
            Self::Payment => "payment",
            Self::Charging => "charging",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let want = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == want)
            .ok_or_else(|| DispatchError::InvalidTaskType(s.to_owned()))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskState {
    Waiting,
    Ready,
    Claimed,
    Running,
    Paused,
    Done,
    Failed,
}

impl TaskState {
    pub const ALL: [Self; 7] = [
        Self::Waiting,
        Self::Ready,
        Self::Claimed,
        Self::Running,
        Self::Paused,
        Self::Done,
        Self::Failed,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "WAITING",
            Self::Ready => "READY",
            Self::Claimed => "CLAIMED",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Done => "DONE",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let want = s.trim().to_ascii_uppercase();
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == want)
            .ok_or_else(|| format!("unknown task state '{s}'"))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OverrideSource {
    Operator,
    Critical,
    Cleared,
}

/// One operator priority change. Kept forever, clearing appends a zero entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OverrideRecord {
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
    pub delta: i64,
    pub source: OverrideSource,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub base_priority: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub release_time: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub deadline: Option<OffsetDateTime>,
    #[serde(default)]
    pub operator_override: i64,
    #[serde(default)]
    pub override_history: Vec<OverrideRecord>,
    pub waypoints: Vec<String>,
    #[serde(default)]
    pub start_location: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,

    pub state: TaskState,
    pub assigned_robot: Option<String>,
    #[serde(default)]
    pub current_step: usize,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub last_robot: Option<String>,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Task {
    #[must_use]
    pub fn new_id() -> String {
        let id = Uuid::new_v4().simple().to_string();
        let short: String = id.chars().take(6).collect();
        format!("T-{short}")
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// The location a robot has to reach first.
    #[must_use]
    pub fn pickup_location(&self) -> Option<&str> {
        self.start_location
            .as_deref()
            .or_else(|| self.waypoints.first().map(String::as_str))
    }

    #[must_use]
    pub fn all_steps_confirmed(&self) -> bool {
        self.current_step >= self.waypoints.len()
    }
}

/// Creation request as it arrives from the transport layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewTask {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub task_type: String,
    pub waypoints: Vec<String>,
    pub base_priority: i64,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub deadline: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub release_time: Option<OffsetDateTime>,
    #[serde(default)]
    pub start_location: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl NewTask {
    #[must_use]
    pub fn new(task_type: &str, waypoints: &[&str], base_priority: i64) -> Self {
        Self {
            task_type: task_type.to_owned(),
            waypoints: waypoints.iter().map(|w| (*w).to_owned()).collect(),
            base_priority,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.to_owned());
        self
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: OffsetDateTime) -> Self {
        self.deadline = Some(deadline);
        self
    }

    #[must_use]
    pub fn with_release_time(mut self, release_time: OffsetDateTime) -> Self {
        self.release_time = Some(release_time);
        self
    }

    #[must_use]
    pub fn with_start_location(mut self, location: &str) -> Self {
        self.start_location = Some(location.to_owned());
        self
    }

    #[must_use]
    pub fn with_dependency(mut self, task_id: &str) -> Self {
        self.depends_on.push(task_id.to_owned());
        self
    }
}

/// A task together with its effective priority at a given instant.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TaskView {
    #[serde(flatten)]
    pub task: Task,
    pub effective_priority: i64,
}

#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub state: Option<TaskState>,
    pub task_type: Option<TaskType>,
    pub robot_id: Option<String>,
    pub min_priority: Option<i64>,
    pub include_terminal: bool,
}

impl TaskFilter {
    #[must_use]
    pub fn all() -> Self {
        Self {
            include_terminal: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn in_state(state: TaskState) -> Self {
        Self {
            state: Some(state),
            include_terminal: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn matches(&self, view: &TaskView) -> bool {
        let task = &view.task;
        if !self.include_terminal && self.state.is_none() && task.is_terminal() {
            return false;
        }
        if self.state.is_some_and(|s| s != task.state) {
            return false;
        }
        if self.task_type.is_some_and(|t| t != task.task_type) {
            return false;
        }
        if let Some(robot) = self.robot_id.as_deref()
            && task.assigned_robot.as_deref() != Some(robot)
            && task.last_robot.as_deref() != Some(robot)
        {
            return false;
        }
        if self
            .min_priority
            .is_some_and(|min| view.effective_priority < min)
        {
            return false;
        }
        true
    }
}

/// Progress through the waypoint list.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StepInfo {
    pub task_id: String,
    pub step: usize,
    pub total: usize,
    pub next_waypoint: Option<String>,
}

impl StepInfo {
    #[must_use]
    pub fn of(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            step: task.current_step,
            total: task.waypoints.len(),
            next_waypoint: task.waypoints.get(task.current_step).cloned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_task_types_case_insensitively() {
        assert_eq!("Delivery".parse::<TaskType>().unwrap(), TaskType::Delivery);
        assert_eq!(" payment ".parse::<TaskType>().unwrap(), TaskType::Payment);
        let err = "cleaning".parse::<TaskType>().unwrap_err();
        assert!(matches!(err, DispatchError::InvalidTaskType(ref t) if t == "cleaning"));
    }

    #[test]
    fn task_serializes_type_and_uppercase_state() {
        let now = OffsetDateTime::UNIX_EPOCH;
        let task = Task {
            id: "T-101".to_owned(),
            task_type: TaskType::Delivery,
            base_priority: 100,
            release_time: now,
            deadline: None,
            operator_override: 0,
            override_history: Vec::new(),
            waypoints: vec!["Kitchen".to_owned(), "Table 5".to_owned()],
            start_location: None,
            depends_on: Vec::new(),
            state: TaskState::Ready,
            assigned_robot: None,
            current_step: 0,
            created_at: now,
            completed_at: None,
            last_robot: None,
            last_error: None,
        };
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["type"], "delivery");
        assert_eq!(json["state"], "READY");
        assert_eq!(task.pickup_location(), Some("Kitchen"));

        let back: Task = serde_json::from_value(json).unwrap();
        assert_eq!(back, task);
    }

    #[test]
    fn new_ids_are_short_and_prefixed() {
        let id = Task::new_id();
        assert!(id.starts_with("T-"));
        assert_eq!(id.len(), 8);
    }
}
