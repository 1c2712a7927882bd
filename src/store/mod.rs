#![forbid(unsafe_code)]

//! Persistence seam for the dispatcher. The engine only sees [`Store`].

pub mod json;
pub mod memory;

use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;

use crate::config::{StorageBackend, StorageConfig};
use crate::core::audit::AssignmentLog;
use crate::robot::model::Robot;
use crate::task::model::Task;

pub trait Store: Send + Sync + Debug {
    fn load_tasks(&self) -> anyhow::Result<Vec<Task>>;
    fn save_task(&self, task: &Task) -> anyhow::Result<()>;

    fn load_robots(&self) -> anyhow::Result<Vec<Robot>>;
    fn save_robot(&self, robot: &Robot) -> anyhow::Result<()>;

    fn append_log(&self, entry: &AssignmentLog) -> anyhow::Result<()>;
    fn load_log(&self) -> anyhow::Result<Vec<AssignmentLog>>;
}

pub fn open(cfg: &StorageConfig, dir: &Path) -> Arc<dyn Store> {
    match cfg.backend {
        StorageBackend::Memory => Arc::new(memory::MemoryStore::default()),
        StorageBackend::Json => Arc::new(json::JsonStore::new(dir.to_path_buf())),
    }
}

pub(crate) fn validate_id(id: &str) -> anyhow::Result<()> {
    if id.trim().is_empty() {
        anyhow::bail!("ID is required");
    }
    if id.contains('/') || id.contains('\\') {
        anyhow::bail!("invalid ID '{id}': must not contain path separators");
    }
    if id.contains("..") {
        anyhow::bail!("invalid ID '{id}': must not contain '..'");
    }
    Ok(())
}
