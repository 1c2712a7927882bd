#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;

use robodispatch::config::Config;
use robodispatch::core::dispatcher::Dispatcher;
use robodispatch::core::worker::{self, WorkerConfig};
use robodispatch::robot::link::TracingLink;
use robodispatch::site::SiteMap;
use robodispatch::store::json::JsonStore;
use robodispatch::task::model::{NewTask, TaskState};

fn open(dir: &Path) -> anyhow::Result<Dispatcher> {
    let cfg = Config::default();
    Ok(Dispatcher::open(
        &cfg,
        Arc::new(JsonStore::new(dir.to_path_buf())),
        Arc::new(SiteMap::new(&[], cfg.engine.unknown_travel_cost)),
        Arc::new(TracingLink),
    )?)
}

fn worker_cfg(dir: PathBuf, wait: bool, max_ticks: Option<u64>) -> WorkerConfig {
    WorkerConfig {
        state_dir: dir,
        tick_interval: Duration::from_millis(10),
        wait,
        max_ticks,
    }
}

#[tokio::test]
async fn worker_assigns_pending_work_and_cleans_up() {
    let dir = tempfile::tempdir().expect("tempdir");
    let now = OffsetDateTime::now_utc();
    {
        let d = open(dir.path()).unwrap();
        d.register_robot("R1", "Kitchen", 90, now).unwrap();
        d.create_task(NewTask::new("delivery", &["Kitchen", "Table 4"], 50).with_id("T-1"), now)
            .unwrap();
    }

    let state_dir = dir.path().to_path_buf();
    let ticks = worker::run_worker(worker_cfg(state_dir.clone(), true, Some(2)), move || {
        open(&state_dir)
    })
    .await
    .unwrap();
    assert_eq!(ticks, 2);

    let d = open(dir.path()).unwrap();
    let task = d.get_task("T-1").unwrap();
    assert_eq!(task.state, TaskState::Claimed);
    assert_eq!(task.assigned_robot.as_deref(), Some("R1"));
    assert!(!worker::lock_path(dir.path()).exists());
    assert!(!worker::stop_path(dir.path()).exists());
}

#[tokio::test]
async fn worker_exits_when_nothing_is_open() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state_dir = dir.path().to_path_buf();
    let ticks = worker::run_worker(worker_cfg(state_dir.clone(), false, Some(50)), move || {
        open(&state_dir)
    })
    .await
    .unwrap();
    assert_eq!(ticks, 2);
}

#[tokio::test]
async fn second_worker_is_refused() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(
        worker::lock_path(dir.path()),
        br#"{"pid":1,"started_at":"2025-01-01T00:00:00Z"}"#,
    )
    .unwrap();
    let state_dir = dir.path().to_path_buf();
    let err = worker::run_worker(worker_cfg(state_dir.clone(), true, Some(1)), move || {
        open(&state_dir)
    })
    .await
    .unwrap_err();
    assert!(err.to_string().contains("already running"));

    let lock = worker::load_worker_lock(dir.path()).unwrap().unwrap();
    assert_eq!(lock.pid, 1);
}

#[tokio::test]
async fn stop_without_worker_reports_nothing_to_stop() {
    let dir = tempfile::tempdir().expect("tempdir");
    let stopped = worker::request_stop(dir.path(), Duration::from_millis(50))
        .await
        .unwrap();
    assert!(!stopped);
}
