#![forbid(unsafe_code)]

use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::core::audit::AssignmentLog;
use crate::robot::model::Robot;
use crate::store::{Store, validate_id};
use crate::task::model::Task;

/// One pretty-printed JSON file per task and robot, plus an append-only JSONL
/// assignment log.
///
/// ```text
/// <dir>/tasks/task-<id>.json
/// <dir>/robots/robot-<id>.json
/// <dir>/assignments.jsonl
/// ```
#[derive(Debug, Clone)]
pub struct JsonStore {
    dir: PathBuf,
}

impl JsonStore {
    #[must_use]
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn tasks_dir(&self) -> PathBuf {
        self.dir.join("tasks")
    }

    #[must_use]
    pub fn robots_dir(&self) -> PathBuf {
        self.dir.join("robots")
    }

    #[must_use]
    pub fn log_path(&self) -> PathBuf {
        self.dir.join("assignments.jsonl")
    }

    fn task_path(&self, id: &str) -> anyhow::Result<PathBuf> {
        validate_id(id)?;
        Ok(self.tasks_dir().join(format!("task-{id}.json")))
    }

    fn robot_path(&self, id: &str) -> anyhow::Result<PathBuf> {
        validate_id(id)?;
        Ok(self.robots_dir().join(format!("robot-{id}.json")))
    }
}

impl Store for JsonStore {
    fn load_tasks(&self) -> anyhow::Result<Vec<Task>> {
        let mut tasks: Vec<Task> = read_all(&self.tasks_dir())?;
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tasks)
    }

    fn save_task(&self, task: &Task) -> anyhow::Result<()> {
        write_atomic(&self.task_path(&task.id)?, task)
    }

    fn load_robots(&self) -> anyhow::Result<Vec<Robot>> {
        let mut robots: Vec<Robot> = read_all(&self.robots_dir())?;
        robots.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(robots)
    }

    fn save_robot(&self, robot: &Robot) -> anyhow::Result<()> {
        write_atomic(&self.robot_path(&robot.id)?, robot)
    }

    fn append_log(&self, entry: &AssignmentLog) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        let path = self.log_path();
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        file.write_all(&line)
            .with_context(|| format!("failed to append to {}", path.display()))?;
        Ok(())
    }

    fn load_log(&self) -> anyhow::Result<Vec<AssignmentLog>> {
        let path = self.log_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let data = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut entries = Vec::new();
        for (n, line) in data.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let entry: AssignmentLog = serde_json::from_str(line)
                .with_context(|| format!("failed to parse {} line {}", path.display(), n + 1))?;
            entries.push(entry);
        }
        Ok(entries)
    }
}

fn write_atomic<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let tmp = path.with_extension("json.tmp");
    let data = serde_json::to_vec_pretty(value)?;
    std::fs::write(&tmp, &data).with_context(|| format!("failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to rename {} -> {}", tmp.display(), path.display()))?;
    Ok(())
}

fn read_all<T: DeserializeOwned>(dir: &Path) -> anyhow::Result<Vec<T>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))?
    {
        let path = entry?.path();
        if path.extension().and_then(|s| s.to_str()) != Some("json") {
            continue;
        }
        let data =
            std::fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
        let value = serde_json::from_slice(&data)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        out.push(value);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use time::OffsetDateTime;

    use super::*;
    use crate::robot::model::RobotStatus;

    #[test]
    fn robots_round_trip_through_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonStore::new(dir.path().to_path_buf());

        let mut r = Robot::new("R1", "Kitchen", 85, OffsetDateTime::UNIX_EPOCH);
        store.save_robot(&r).unwrap();
        r.status = RobotStatus::Charging;
        store.save_robot(&r).unwrap();

        let loaded = store.load_robots().unwrap();
        assert_eq!(loaded, vec![r]);
        assert!(dir.path().join("robots").join("robot-R1.json").exists());
        assert!(!dir.path().join("robots").join("robot-R1.json.tmp").exists());
    }

    #[test]
    fn log_is_appended_line_by_line() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonStore::new(dir.path().to_path_buf());
        for seq in 1..=2 {
            store
                .append_log(&AssignmentLog {
                    seq,
                    task_id: format!("T-{seq}"),
                    robot_id: "R1".to_owned(),
                    timestamp: OffsetDateTime::UNIX_EPOCH,
                    score: 50.0,
                    reason: "test".to_owned(),
                    effective_priority: 50,
                })
                .unwrap();
        }
        let raw = std::fs::read_to_string(store.log_path()).unwrap();
        assert_eq!(raw.lines().count(), 2);
        assert_eq!(store.load_log().unwrap()[1].task_id, "T-2");
    }

    #[test]
    fn rejects_ids_that_escape_the_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = JsonStore::new(dir.path().to_path_buf());
        let r = Robot::new("../R1", "Kitchen", 85, OffsetDateTime::UNIX_EPOCH);
        assert!(store.save_robot(&r).is_err());
    }
}
