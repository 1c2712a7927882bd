#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use crate::core::entity::EntityTable;
use crate::error::{DispatchError, EntityKind};
use crate::store::Store;
use crate::task::model::Task;

/// All tasks known to the dispatcher, terminal ones included.
#[derive(Debug)]
pub struct TaskBoard {
    tasks: EntityTable<Task>,
    store: Arc<dyn Store>,
}

impl TaskBoard {
    pub fn load(store: Arc<dyn Store>, lock_timeout: Duration) -> Result<Self, DispatchError> {
        let tasks = EntityTable::new(EntityKind::Task, lock_timeout);
        for task in store.load_tasks().map_err(|e| DispatchError::storage(&e))? {
            let id = task.id.clone();
            tasks.insert(&id, task)?;
        }
        Ok(Self { tasks, store })
    }

    pub fn insert(&self, task: Task) -> Result<(), DispatchError> {
        if self.tasks.contains(&task.id) {
            return Err(DispatchError::InvalidTask(format!(
                "task id already exists: {}",
                task.id
            )));
        }
        self.store
            .save_task(&task)
            .map_err(|e| DispatchError::storage(&e))?;
        let id = task.id.clone();
        if !self.tasks.insert(&id, task)? {
            return Err(DispatchError::InvalidTask(format!(
                "task id already exists: {id}"
            )));
        }
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Task, DispatchError> {
        self.tasks.get(id)
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.tasks.contains(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn snapshot(&self) -> Result<Vec<Task>, DispatchError> {
        self.tasks.snapshot()
    }

    /// Runs `f` under the task's lock and writes the result through to the
    /// store before committing it.
    pub(crate) fn modify<R>(
        &self,
        task_id: &str,
        f: impl FnOnce(&mut Task) -> Result<R, DispatchError>,
    ) -> Result<R, DispatchError> {
        self.tasks.update(task_id, |task| {
            let out = f(task)?;
            self.store
                .save_task(task)
                .map_err(|e| DispatchError::storage(&e))?;
            Ok(out)
        })
    }

    pub(crate) fn table(&self) -> &EntityTable<Task> {
        &self.tasks
    }
}
