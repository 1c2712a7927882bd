#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::core::audit::AssignmentLog;
use crate::robot::model::Robot;
use crate::store::Store;
use crate::task::model::Task;

#[derive(Debug, Default)]
pub struct MemoryStore {
    tasks: Mutex<BTreeMap<String, Task>>,
    robots: Mutex<BTreeMap<String, Robot>>,
    log: Mutex<Vec<AssignmentLog>>,
}

impl Store for MemoryStore {
    fn load_tasks(&self) -> anyhow::Result<Vec<Task>> {
        Ok(self.tasks.lock().values().cloned().collect())
    }

    fn save_task(&self, task: &Task) -> anyhow::Result<()> {
        self.tasks.lock().insert(task.id.clone(), task.clone());
        Ok(())
    }

    fn load_robots(&self) -> anyhow::Result<Vec<Robot>> {
        Ok(self.robots.lock().values().cloned().collect())
    }

    fn save_robot(&self, robot: &Robot) -> anyhow::Result<()> {
        self.robots.lock().insert(robot.id.clone(), robot.clone());
        Ok(())
    }

    fn append_log(&self, entry: &AssignmentLog) -> anyhow::Result<()> {
        self.log.lock().push(entry.clone());
        Ok(())
    }

    fn load_log(&self) -> anyhow::Result<Vec<AssignmentLog>> {
        Ok(self.log.lock().clone())
    }
}
