#![forbid(unsafe_code)]

//! Background scheduling loop.
//!
//! The worker reopens the dispatcher from the store before every tick, so
//! changes written by other processes are picked up.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::core::dispatcher::{Dispatcher, Stats, TickReport};
use crate::error::DispatchError;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub state_dir: PathBuf,
    pub tick_interval: Duration,
    /// Keep ticking after every task reached a terminal state.
    pub wait: bool,
    pub max_ticks: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerLock {
    pub pid: u32,
    pub started_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatusReport {
    pub running: bool,
    pub pid: Option<u32>,
    pub started_at: Option<String>,
    pub stop_requested: bool,
    pub counts: BTreeMap<String, usize>,
}

#[must_use]
pub fn lock_path(state_dir: &Path) -> PathBuf {
    state_dir.join("worker.lock")
}

#[must_use]
pub fn stop_path(state_dir: &Path) -> PathBuf {
    state_dir.join("worker.stop")
}

pub fn load_worker_lock(state_dir: &Path) -> anyhow::Result<Option<WorkerLock>> {
    let path = lock_path(state_dir);
    if !path.exists() {
        return Ok(None);
    }
    let data =
        std::fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
    let lock: WorkerLock = serde_json::from_slice(&data)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(lock))
}

pub fn worker_status(state_dir: &Path, stats: &Stats) -> anyhow::Result<WorkerStatusReport> {
    let lock = load_worker_lock(state_dir)?;
    Ok(WorkerStatusReport {
        running: lock.is_some(),
        pid: lock.as_ref().map(|l| l.pid),
        started_at: lock.as_ref().map(|l| l.started_at.clone()),
        stop_requested: stop_path(state_dir).exists(),
        counts: stats
            .tasks_by_state
            .iter()
            .filter(|(_, n)| **n > 0)
            .map(|(state, n)| (state.to_lowercase(), *n))
            .collect(),
    })
}

pub async fn request_stop(state_dir: &Path, timeout: Duration) -> anyhow::Result<bool> {
    if load_worker_lock(state_dir)?.is_none() {
        return Ok(false);
    }
    let stop = stop_path(state_dir);
    std::fs::write(&stop, b"stop\n")
        .with_context(|| format!("failed to write {}", stop.display()))?;

    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if !lock_path(state_dir).exists() {
            return Ok(true);
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    Ok(false)
}

type Opener = dyn Fn() -> anyhow::Result<Dispatcher> + Send + Sync;

/// Runs ticks until Ctrl-C, a stop file, `max_ticks`, or (without `wait`) two
/// consecutive ticks with no open task.
pub async fn run_worker<F>(cfg: WorkerConfig, open: F) -> anyhow::Result<u64>
where
    F: Fn() -> anyhow::Result<Dispatcher> + Send + Sync + 'static,
{
    std::fs::create_dir_all(&cfg.state_dir)
        .with_context(|| format!("failed to create {}", cfg.state_dir.display()))?;

    let lock_file = lock_path(&cfg.state_dir);
    if lock_file.exists() {
        anyhow::bail!("worker already running ({} exists)", lock_file.display());
    }
    let lock = WorkerLock {
        pid: std::process::id(),
        started_at: now_rfc3339(),
    };
    std::fs::write(&lock_file, serde_json::to_vec_pretty(&lock)?)
        .with_context(|| format!("failed to write {}", lock_file.display()))?;

    let stop_file = stop_path(&cfg.state_dir);
    let _guard = WorkerGuard {
        lock_file: lock_file.clone(),
        stop_file: stop_file.clone(),
    };

    let open: Arc<Opener> = Arc::new(open);
    {
        let open = Arc::clone(&open);
        let repaired = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<String>> {
            Ok(open()?.repair_bindings(OffsetDateTime::now_utc())?)
        })
        .await
        .context("startup repair panicked")??;
        if !repaired.is_empty() {
            tracing::warn!(?repaired, "repaired stale bindings on startup");
        }
    }

    tracing::info!(
        pid = lock.pid,
        interval_ms = u64::try_from(cfg.tick_interval.as_millis()).unwrap_or(u64::MAX),
        "worker started"
    );

    let mut ticker = tokio::time::interval(cfg.tick_interval);
    let mut ticks = 0u64;
    let mut empty_polls = 0u32;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            }
            _ = ticker.tick() => {}
        }

        if stop_file.exists() {
            tracing::info!("stop requested");
            break;
        }

        let open = Arc::clone(&open);
        let res = tokio::task::spawn_blocking(move || -> anyhow::Result<(TickReport, usize)> {
            let dispatcher = open()?;
            let report = dispatcher.run_tick(OffsetDateTime::now_utc())?;
            Ok((report, dispatcher.stats()?.open_tasks))
        })
        .await
        .context("tick panicked")?;
        ticks += 1;

        let open_tasks = match res {
            Ok((report, open_tasks)) => {
                for entry in &report.assignments {
                    tracing::debug!(task = %entry.task_id, robot = %entry.robot_id, "assigned");
                }
                open_tasks
            }
            Err(e) if is_retryable(&e) => {
                tracing::debug!(error = %e, "tick hit a busy entity, retrying next cycle");
                continue;
            }
            Err(e) => {
                tracing::warn!(error = %format!("{e:#}"), "tick failed");
                continue;
            }
        };

        if cfg.max_ticks.is_some_and(|max| ticks >= max) {
            break;
        }
        if open_tasks == 0 {
            empty_polls += 1;
            if !cfg.wait && empty_polls >= 2 {
                tracing::info!("no open tasks, worker exiting");
                break;
            }
        } else {
            empty_polls = 0;
        }
    }
    Ok(ticks)
}

fn is_retryable(err: &anyhow::Error) -> bool {
    err.downcast_ref::<DispatchError>()
        .is_some_and(DispatchError::is_retryable)
}

pub fn parse_duration(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        anyhow::bail!("empty duration");
    }

    let (num, unit) = s
        .chars()
        .position(|c| !c.is_ascii_digit())
        .map_or((s, ""), |i| s.split_at(i));
    let n: u64 = num
        .parse()
        .with_context(|| format!("invalid duration: {s}"))?;

    Ok(match unit {
        "ms" => Duration::from_millis(n),
        "s" | "" => Duration::from_secs(n),
        "m" => Duration::from_secs(n * 60),
        "h" => Duration::from_secs(n * 60 * 60),
        _ => anyhow::bail!("unsupported duration unit in '{s}' (use ms|s|m|h)"),
    })
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "unknown".to_owned())
}

struct WorkerGuard {
    lock_file: PathBuf,
    stop_file: PathBuf,
}

impl Drop for WorkerGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.lock_file);
        let _ = std::fs::remove_file(&self.stop_file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_durations() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2s").unwrap(), Duration::from_secs(2));
        assert_eq!(parse_duration("3").unwrap(), Duration::from_secs(3));
        assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("2d").is_err());
    }

    #[test]
    fn status_without_lock_is_not_running() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut stats = Stats::default();
        stats.tasks_by_state.insert("READY".to_owned(), 2);
        stats.tasks_by_state.insert("DONE".to_owned(), 0);
        let report = worker_status(dir.path(), &stats).unwrap();
        assert!(!report.running);
        assert_eq!(report.counts.get("ready"), Some(&2));
        assert!(!report.counts.contains_key("done"));
    }
}
