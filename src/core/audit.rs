#![forbid(unsafe_code)]

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::DispatchError;
use crate::store::Store;

/// One task-to-robot assignment. Never changed once written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssignmentLog {
    pub seq: u64,
    pub task_id: String,
    pub robot_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub score: f64,
    pub reason: String,
    pub effective_priority: i64,
}

#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub task_id: Option<String>,
    pub robot_id: Option<String>,
    pub since: Option<OffsetDateTime>,
    /// Keep only the most recent N entries.
    pub limit: Option<usize>,
}

impl LogFilter {
    #[must_use]
    pub fn matches(&self, entry: &AssignmentLog) -> bool {
        self.task_id.as_deref().is_none_or(|t| entry.task_id == t)
            && self.robot_id.as_deref().is_none_or(|r| entry.robot_id == r)
            && self.since.is_none_or(|s| entry.timestamp >= s)
    }
}

/// Append-only audit trail, persisted through the store before it becomes visible.
#[derive(Debug)]
pub struct AuditLog {
    entries: Mutex<Vec<AssignmentLog>>,
    store: Arc<dyn Store>,
}

impl AuditLog {
    pub fn load(store: Arc<dyn Store>) -> Result<Self, DispatchError> {
        let mut entries = store.load_log().map_err(|e| DispatchError::storage(&e))?;
        entries.sort_by_key(|e| e.seq);
        Ok(Self {
            entries: Mutex::new(entries),
            store,
        })
    }

    pub(crate) fn append(
        &self,
        task_id: &str,
        robot_id: &str,
        timestamp: OffsetDateTime,
        score: f64,
        reason: String,
        effective_priority: i64,
    ) -> Result<AssignmentLog, DispatchError> {
        let mut entries = self.entries.lock();
        let seq = entries.last().map_or(1, |e| e.seq + 1);
        let entry = AssignmentLog {
            seq,
            task_id: task_id.to_owned(),
            robot_id: robot_id.to_owned(),
            timestamp,
            score,
            reason,
            effective_priority,
        };
        self.store
            .append_log(&entry)
            .map_err(|e| DispatchError::storage(&e))?;
        entries.push(entry.clone());
        Ok(entry)
    }

    #[must_use]
    pub fn query(&self, filter: &LogFilter) -> Vec<AssignmentLog> {
        let entries = self.entries.lock();
        let mut out: Vec<AssignmentLog> = entries
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        if let Some(limit) = filter.limit
            && out.len() > limit
        {
            out.drain(..out.len() - limit);
        }
        out
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    #[test]
    fn appends_in_sequence_and_filters() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::default());
        let log = AuditLog::load(Arc::clone(&store)).unwrap();
        let t0 = OffsetDateTime::UNIX_EPOCH;
        log.append("T-1", "R1", t0, 50.0, "first".to_owned(), 50)
            .unwrap();
        log.append("T-2", "R2", t0, 70.0, "second".to_owned(), 70)
            .unwrap();
        log.append("T-3", "R1", t0, 40.0, "third".to_owned(), 40)
            .unwrap();

        let all = log.query(&LogFilter::default());
        let seqs: Vec<u64> = all.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, [1, 2, 3]);

        let r1 = log.query(&LogFilter {
            robot_id: Some("R1".to_owned()),
            ..LogFilter::default()
        });
        assert_eq!(r1.len(), 2);

        let last = log.query(&LogFilter {
            limit: Some(1),
            ..LogFilter::default()
        });
        assert_eq!(last[0].task_id, "T-3");

        let reloaded = AuditLog::load(store).unwrap();
        assert_eq!(reloaded.len(), 3);
    }
}
