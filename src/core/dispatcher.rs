#![forbid(unsafe_code)]

//! The dispatcher is the only mutation path into task and robot state.
//!
//! Locks are always taken robot first, then task. A change that touches both
//! is written to the store while both locks are held and committed in memory
//! only after both writes succeeded.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;

use crate::config::Config;
use crate::core::assignment::{AssignmentPolicy, Candidate};
use crate::core::audit::{AssignmentLog, AuditLog, LogFilter};
use crate::core::charging::{
    ChargingDecision, ChargingPolicy, ChargingReport, ChargingSlots, ChargingStatus,
};
use crate::core::entity::RetryPolicy;
use crate::error::{DispatchError, EntityKind};
use crate::robot::link::{LinkMessage, RobotLink};
use crate::robot::model::{Robot, RobotCommand, RobotStatus, RobotView};
use crate::robot::registry::RobotRegistry;
use crate::site::{FleetEntry, TravelCost};
use crate::store::Store;
use crate::task::board::TaskBoard;
use crate::task::model::{
    NewTask, OverrideRecord, OverrideSource, StepInfo, Task, TaskFilter, TaskState, TaskType,
    TaskView,
};
use crate::task::priority::{PriorityPolicy, queue_order};
use crate::task::state::Readiness;

/// Everything one scheduling tick changed.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TickReport {
    pub promoted: Vec<String>,
    pub failed: Vec<String>,
    pub assignments: Vec<AssignmentLog>,
    pub charging: ChargingReport,
}

impl TickReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.promoted.is_empty()
            && self.failed.is_empty()
            && self.assignments.is_empty()
            && self.charging.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct Stats {
    pub tasks_by_state: BTreeMap<String, usize>,
    pub tasks_by_type: BTreeMap<String, usize>,
    pub robots_by_status: BTreeMap<String, usize>,
    pub open_tasks: usize,
    pub assignments: usize,
    pub charging_slots_in_use: usize,
    pub charging_slots: usize,
}

pub struct Dispatcher {
    tasks: TaskBoard,
    robots: RobotRegistry,
    audit: AuditLog,
    slots: ChargingSlots,
    priority: PriorityPolicy,
    assignment: AssignmentPolicy,
    charging: ChargingPolicy,
    retry: RetryPolicy,
    home_location: String,
    store: Arc<dyn Store>,
    travel: Arc<dyn TravelCost>,
    link: Arc<dyn RobotLink>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("tasks", &self.tasks.len())
            .field("robots", &self.robots.len())
            .field("assignments", &self.audit.len())
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn open(
        cfg: &Config,
        store: Arc<dyn Store>,
        travel: Arc<dyn TravelCost>,
        link: Arc<dyn RobotLink>,
    ) -> Result<Self, DispatchError> {
        cfg.validate()?;
        let lock_timeout = cfg.engine.lock_timeout();
        let tasks = TaskBoard::load(Arc::clone(&store), lock_timeout)?;
        let robots = RobotRegistry::load(Arc::clone(&store), lock_timeout)?;
        let audit = AuditLog::load(Arc::clone(&store))?;
        let slots = ChargingSlots::new(cfg.charging.max_concurrent_charging, &robots.snapshot()?);
        tracing::debug!(
            tasks = tasks.len(),
            robots = robots.len(),
            assignments = audit.len(),
            "dispatcher state loaded"
        );
        Ok(Self {
            tasks,
            robots,
            audit,
            slots,
            priority: PriorityPolicy::from_config(&cfg.priority),
            assignment: AssignmentPolicy::from_config(cfg),
            charging: ChargingPolicy::from_config(&cfg.charging),
            retry: RetryPolicy {
                attempts: cfg.engine.retry_attempts,
                backoff: cfg.engine.retry_backoff(),
            },
            home_location: cfg.fleet.home_location.clone(),
            store,
            travel,
            link,
        })
    }

    #[must_use]
    pub fn priority_policy(&self) -> &PriorityPolicy {
        &self.priority
    }

    // ---- fleet -------------------------------------------------------------

    /// Returns false when the id is already registered; its state is kept.
    pub fn register_robot(
        &self,
        id: &str,
        location: &str,
        battery: u8,
        now: OffsetDateTime,
    ) -> Result<bool, DispatchError> {
        crate::store::validate_id(id).map_err(|e| DispatchError::InvalidCommand(e.to_string()))?;
        let created = self.robots.register(Robot::new(id, location, battery, now))?;
        if created {
            tracing::info!(robot = id, location, battery, "robot registered");
        }
        Ok(created)
    }

    /// Registers every entry and returns how many were new.
    pub fn register_fleet(
        &self,
        fleet: &[FleetEntry],
        now: OffsetDateTime,
    ) -> Result<usize, DispatchError> {
        let mut created = 0;
        for entry in fleet {
            if self.register_robot(&entry.id, &entry.location, entry.battery, now)? {
                created += 1;
            }
        }
        Ok(created)
    }

    pub fn get_robot(&self, id: &str) -> Result<Robot, DispatchError> {
        self.retry.run(|| self.robots.get(id))
    }

    pub fn list_robots(&self) -> Result<Vec<Robot>, DispatchError> {
        self.retry.run(|| self.robots.snapshot())
    }

    pub fn robot_views(&self) -> Result<Vec<RobotView>, DispatchError> {
        let threshold = self.assignment.min_battery_threshold;
        Ok(self
            .list_robots()?
            .into_iter()
            .map(|robot| RobotView {
                available: robot.is_available(threshold),
                needs_charge: robot.needs_charge(threshold),
                robot,
            })
            .collect())
    }

    pub fn list_available(&self) -> Result<Vec<Robot>, DispatchError> {
        self.retry
            .run(|| self.robots.list_available(self.assignment.min_battery_threshold))
    }

    pub fn update_telemetry(
        &self,
        robot_id: &str,
        location: Option<&str>,
        battery: Option<u8>,
        now: OffsetDateTime,
    ) -> Result<Robot, DispatchError> {
        let robot = self
            .retry
            .run(|| self.robots.update_telemetry(robot_id, location, battery, now))?;
        tracing::debug!(
            robot = robot_id,
            location = %robot.current_location,
            battery = robot.battery_level,
            "telemetry"
        );
        Ok(robot)
    }

    pub fn send_robot_command(
        &self,
        robot_id: &str,
        command: RobotCommand,
        now: OffsetDateTime,
    ) -> Result<Robot, DispatchError> {
        match command {
            RobotCommand::StartCharging => self.request_charging(robot_id, now),
            RobotCommand::ReturnToBase => self.return_to_base(robot_id, now),
        }
    }

    /// Manual charging request. Skips the queue but still needs a free slot.
    pub fn request_charging(
        &self,
        robot_id: &str,
        now: OffsetDateTime,
    ) -> Result<Robot, DispatchError> {
        let robot = self.get_robot(robot_id)?;
        if robot.status == RobotStatus::Charging {
            return Ok(robot);
        }
        if !robot.is_idle() {
            return Err(robot.unavailable());
        }
        match self.retry.run(|| self.start_charging(robot_id, now, true)) {
            Ok(_) => {}
            Err(e) if e.is_steady_state() => {
                tracing::debug!(robot = robot_id, reason = %e, "manual charging refused");
                return Err(e);
            }
            Err(e) => return Err(e),
        }
        self.get_robot(robot_id)
    }

    fn return_to_base(&self, robot_id: &str, now: OffsetDateTime) -> Result<Robot, DispatchError> {
        let (robot, was_charging) = self.retry.run(|| {
            self.robots.modify(robot_id, |robot| {
                if robot.current_task_id.is_some() {
                    return Err(robot.unavailable());
                }
                let was_charging = robot.status == RobotStatus::Charging;
                robot.status = RobotStatus::Idle;
                robot.current_location.clone_from(&self.home_location);
                robot.last_error = None;
                robot.last_active = now;
                Ok((robot.clone(), was_charging))
            })
        })?;
        if was_charging {
            self.slots.release(robot_id);
        }
        self.link.send(
            robot_id,
            &LinkMessage::ReturnToBase {
                home: self.home_location.clone(),
            },
        );
        tracing::info!(robot = robot_id, home = %self.home_location, "robot returning to base");
        Ok(robot)
    }

    /// Puts the robot into ERROR and fails the task it was working on.
    pub fn report_robot_error(
        &self,
        robot_id: &str,
        reason: &str,
        now: OffsetDateTime,
    ) -> Result<Robot, DispatchError> {
        let (robot, failed_task, was_charging) =
            self.update_robot_and_task(robot_id, |robot, task| {
                let mut failed_task = None;
                if let Some(task) = task {
                    task.fail(&format!("robot {} error: {reason}", robot.id), now)?;
                    robot.release()?;
                    failed_task = Some(task.id.clone());
                }
                let was_charging = robot.status == RobotStatus::Charging;
                robot.status = RobotStatus::Error;
                robot.last_error = Some(reason.to_owned());
                robot.last_active = now;
                Ok((robot.clone(), failed_task, was_charging))
            })?;
        if was_charging {
            self.slots.release(robot_id);
        }
        tracing::warn!(robot = robot_id, task = ?failed_task, reason, "robot reported an error");
        Ok(robot)
    }

    // ---- tasks -------------------------------------------------------------

    pub fn create_task(&self, req: NewTask, now: OffsetDateTime) -> Result<Task, DispatchError> {
        let task_type: TaskType = req.task_type.parse()?;
        let waypoints: Vec<String> = req
            .waypoints
            .iter()
            .map(|w| w.trim().to_owned())
            .collect();
        if waypoints.is_empty() || waypoints.iter().any(String::is_empty) {
            return Err(DispatchError::InvalidTask(
                "at least one non-empty waypoint is required".to_owned(),
            ));
        }
        let id = req.id.clone().unwrap_or_else(Task::new_id);
        crate::store::validate_id(&id).map_err(|e| DispatchError::InvalidTask(e.to_string()))?;
        if req.depends_on.iter().any(|d| d == &id) {
            return Err(DispatchError::InvalidTask(format!(
                "task {id} cannot depend on itself"
            )));
        }

        let mut task = Task {
            id,
            task_type,
            base_priority: req.base_priority,
            release_time: req.release_time.unwrap_or(now),
            deadline: req.deadline,
            operator_override: 0,
            override_history: Vec::new(),
            waypoints,
            start_location: req.start_location.filter(|s| !s.trim().is_empty()),
            depends_on: req.depends_on,
            state: TaskState::Waiting,
            assigned_robot: None,
            current_step: 0,
            created_at: now,
            completed_at: None,
            last_robot: None,
            last_error: None,
        };
        if task.readiness(now, |dep| self.tasks.get(dep).ok().map(|t| t.state))
            == Readiness::Ready
        {
            task.state = TaskState::Ready;
        }
        self.tasks.insert(task.clone())?;
        tracing::info!(
            task = %task.id,
            kind = %task.task_type,
            state = %task.state,
            base_priority = task.base_priority,
            "task created"
        );
        Ok(task)
    }

    pub fn get_task(&self, id: &str) -> Result<Task, DispatchError> {
        self.retry.run(|| self.tasks.get(id))
    }

    pub fn task_view(&self, id: &str, now: OffsetDateTime) -> Result<TaskView, DispatchError> {
        Ok(self.priority.view(self.get_task(id)?, now))
    }

    /// Matching tasks in scheduling order.
    pub fn list_tasks(
        &self,
        filter: &TaskFilter,
        now: OffsetDateTime,
    ) -> Result<Vec<TaskView>, DispatchError> {
        let mut views: Vec<TaskView> = self
            .retry
            .run(|| self.tasks.snapshot())?
            .into_iter()
            .map(|t| self.priority.view(t, now))
            .filter(|v| filter.matches(v))
            .collect();
        views.sort_by(queue_order);
        Ok(views)
    }

    pub fn set_operator_override(
        &self,
        task_id: &str,
        delta: i64,
        now: OffsetDateTime,
    ) -> Result<TaskView, DispatchError> {
        let view = self.retry.run(|| {
            self.tasks.modify(task_id, |task| {
                apply_override(task, delta, OverrideSource::Operator, now);
                Ok(self.priority.view(task.clone(), now))
            })
        })?;
        tracing::info!(
            task = task_id,
            delta,
            effective_priority = view.effective_priority,
            "operator override set"
        );
        Ok(view)
    }

    pub fn clear_override(
        &self,
        task_id: &str,
        now: OffsetDateTime,
    ) -> Result<TaskView, DispatchError> {
        let view = self.retry.run(|| {
            self.tasks.modify(task_id, |task| {
                apply_override(task, 0, OverrideSource::Cleared, now);
                Ok(self.priority.view(task.clone(), now))
            })
        })?;
        tracing::info!(task = task_id, "operator override cleared");
        Ok(view)
    }

    /// Sets the critical override and releases a WAITING task immediately.
    pub fn mark_critical(
        &self,
        task_id: &str,
        now: OffsetDateTime,
    ) -> Result<TaskView, DispatchError> {
        let boost = self.priority.critical_boost;
        let view = self.retry.run(|| {
            self.tasks.modify(task_id, |task| {
                if task.is_terminal() {
                    return Err(task.invalid(TaskState::Ready));
                }
                if task.state == TaskState::Waiting {
                    task.transition(TaskState::Ready)?;
                }
                apply_override(task, boost, OverrideSource::Critical, now);
                Ok(self.priority.view(task.clone(), now))
            })
        })?;
        tracing::info!(
            task = task_id,
            state = %view.task.state,
            effective_priority = view.effective_priority,
            "task marked critical"
        );
        Ok(view)
    }

    /// CLAIMED -> RUNNING once the robot departs.
    pub fn start_task(&self, task_id: &str) -> Result<Task, DispatchError> {
        let task = self.retry.run(|| {
            self.tasks.modify(task_id, |task| {
                task.transition(TaskState::Running)?;
                Ok(task.clone())
            })
        })?;
        self.notify_next_waypoint(&task);
        Ok(task)
    }

    /// RUNNING -> PAUSED. The robot holds its position.
    pub fn pause_task(&self, task_id: &str) -> Result<Task, DispatchError> {
        let task = self.retry.run(|| {
            self.tasks.modify(task_id, |task| {
                task.transition(TaskState::Paused)?;
                Ok(task.clone())
            })
        })?;
        if let Some(robot) = task.assigned_robot.as_deref() {
            self.link.send(
                robot,
                &LinkMessage::Hold {
                    task_id: task.id.clone(),
                },
            );
        }
        tracing::info!(task = task_id, "task paused");
        Ok(task)
    }

    pub fn resume_task(&self, task_id: &str) -> Result<Task, DispatchError> {
        let task = self.retry.run(|| {
            self.tasks.modify(task_id, |task| {
                task.transition(TaskState::Running)?;
                Ok(task.clone())
            })
        })?;
        if let Some(robot) = task.assigned_robot.as_deref() {
            self.link.send(
                robot,
                &LinkMessage::Resume {
                    task_id: task.id.clone(),
                },
            );
        }
        tracing::info!(task = task_id, "task resumed");
        Ok(task)
    }

    /// Confirms the current waypoint; the state stays RUNNING.
    pub fn confirm_step(&self, task_id: &str) -> Result<StepInfo, DispatchError> {
        let task = self.retry.run(|| {
            self.tasks.modify(task_id, |task| {
                task.confirm_step()?;
                Ok(task.clone())
            })
        })?;
        self.notify_next_waypoint(&task);
        let info = StepInfo::of(&task);
        tracing::debug!(task = task_id, step = info.step, total = info.total, "step confirmed");
        Ok(info)
    }

    pub fn current_step(&self, task_id: &str) -> Result<StepInfo, DispatchError> {
        Ok(StepInfo::of(&self.get_task(task_id)?))
    }

    /// RUNNING -> DONE after the last waypoint. Frees the robot.
    pub fn complete_task(&self, task_id: &str, now: OffsetDateTime) -> Result<Task, DispatchError> {
        let task = self.update_task_and_robot(task_id, |task, robot| {
            task.finish(now)?;
            if let Some(robot) = robot {
                robot.release()?;
                robot.last_active = now;
            }
            Ok(task.clone())
        })?;
        tracing::info!(task = task_id, robot = ?task.last_robot, "task done");
        Ok(task)
    }

    /// Any non-terminal state -> FAILED. Frees the robot if one is bound.
    pub fn fail_task(
        &self,
        task_id: &str,
        reason: &str,
        now: OffsetDateTime,
    ) -> Result<Task, DispatchError> {
        let task = self.update_task_and_robot(task_id, |task, robot| {
            task.fail(reason, now)?;
            if let Some(robot) = robot {
                robot.release()?;
                robot.last_active = now;
            }
            Ok(task.clone())
        })?;
        if let Some(robot) = task.last_robot.as_deref() {
            self.link.send(
                robot,
                &LinkMessage::Abort {
                    task_id: task.id.clone(),
                },
            );
        }
        tracing::warn!(task = task_id, reason, "task failed");
        Ok(task)
    }

    // ---- scheduling --------------------------------------------------------

    /// One tick: release WAITING tasks, match READY tasks to robots, then run
    /// the charging pass. Returns the assignments made.
    pub fn run_scheduling_tick(
        &self,
        now: OffsetDateTime,
    ) -> Result<Vec<AssignmentLog>, DispatchError> {
        Ok(self.run_tick(now)?.assignments)
    }

    pub fn run_tick(&self, now: OffsetDateTime) -> Result<TickReport, DispatchError> {
        let mut report = TickReport::default();
        self.promote_waiting(now, &mut report)?;
        report.assignments = self.assign(now)?;
        report.charging = self.run_charging(now)?;
        if !report.is_empty() {
            tracing::info!(
                promoted = report.promoted.len(),
                failed = report.failed.len(),
                assigned = report.assignments.len(),
                charging = report.charging.decisions.len(),
                "tick"
            );
        }
        Ok(report)
    }

    fn promote_waiting(
        &self,
        now: OffsetDateTime,
        report: &mut TickReport,
    ) -> Result<(), DispatchError> {
        let tasks = self.retry.run(|| self.tasks.snapshot())?;
        let states: BTreeMap<&str, TaskState> =
            tasks.iter().map(|t| (t.id.as_str(), t.state)).collect();

        for task in tasks.iter().filter(|t| t.state == TaskState::Waiting) {
            let res = match task.readiness(now, |dep| states.get(dep).copied()) {
                Readiness::Blocked => continue,
                Readiness::Ready => self
                    .tasks
                    .modify(&task.id, |t| t.transition(TaskState::Ready))
                    .map(|()| report.promoted.push(task.id.clone())),
                Readiness::DependencyFailed(dep) => self
                    .tasks
                    .modify(&task.id, |t| {
                        t.fail(&format!("dependency failed: {dep}"), now)
                    })
                    .map(|()| report.failed.push(task.id.clone())),
            };
            match res {
                Ok(()) => {}
                Err(e) if e.is_retryable() || e.is_caller_error() => {
                    tracing::debug!(task = %task.id, reason = %e, "task changed since snapshot");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn assign(&self, now: OffsetDateTime) -> Result<Vec<AssignmentLog>, DispatchError> {
        let tasks = self.retry.run(|| self.tasks.snapshot())?;
        let robots = self.retry.run(|| self.robots.snapshot())?;
        let ranked = self.assignment.rank(&self.priority, tasks, now);

        let mut taken: BTreeSet<String> = BTreeSet::new();
        let mut out = Vec::new();
        for view in &ranked {
            loop {
                let Some(candidate) =
                    self.assignment
                        .select(view, &robots, &taken, self.travel.as_ref())
                else {
                    tracing::debug!(task = %view.task.id, "no eligible robot, task stays READY");
                    break;
                };
                match self.claim(view, &candidate, now) {
                    Ok(entry) => {
                        taken.insert(candidate.robot_id.clone());
                        out.push(entry);
                        break;
                    }
                    Err(e) if e.is_steady_state() => {
                        tracing::debug!(robot = %candidate.robot_id, reason = %e, "robot changed since snapshot");
                        taken.insert(candidate.robot_id);
                    }
                    Err(DispatchError::RetryLater {
                        kind: EntityKind::Robot,
                        ..
                    }) => {
                        tracing::debug!(robot = %candidate.robot_id, "robot busy, skipped this tick");
                        taken.insert(candidate.robot_id);
                    }
                    Err(e) if e.is_retryable() || e.is_caller_error() => {
                        tracing::debug!(task = %view.task.id, reason = %e, "task skipped this tick");
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(out)
    }

    /// READY -> CLAIMED and IDLE -> MOVING as one unit, logged before commit.
    fn claim(
        &self,
        view: &TaskView,
        candidate: &Candidate,
        now: OffsetDateTime,
    ) -> Result<AssignmentLog, DispatchError> {
        let entry = self.robots.table().update(&candidate.robot_id, |robot| {
            if !self.assignment.still_eligible(robot, candidate.fallback) {
                return Err(robot.unavailable());
            }
            let robot_before = robot.clone();
            robot.reserve(&view.task.id)?;
            robot.last_active = now;
            self.tasks.table().update(&view.task.id, |task| {
                let task_before = task.clone();
                task.claim(&robot.id)?;
                let fresh = self.priority.view(task.clone(), now);
                self.persist(Some(&*robot), Some(&*task))?;
                let score = self.assignment.score(fresh.effective_priority, candidate.cost);
                self.audit
                    .append(
                        &task.id,
                        &robot.id,
                        now,
                        score,
                        self.assignment.reason(&fresh, candidate),
                        fresh.effective_priority,
                    )
                    .inspect_err(|e| {
                        // The claim is already on disk; put the pre-claim pair back.
                        tracing::warn!(task = %task.id, robot = %robot.id, reason = %e, "assignment log append failed, undoing claim");
                        if let Err(undo) = self.persist(Some(&robot_before), Some(&task_before)) {
                            tracing::error!(task = %task.id, robot = %robot.id, reason = %undo, "could not undo claim in store");
                        }
                    })
            })
        })?;
        let destination = view
            .task
            .pickup_location()
            .unwrap_or(&self.home_location)
            .to_owned();
        self.link.send(
            &entry.robot_id,
            &LinkMessage::Dispatch {
                task_id: entry.task_id.clone(),
                destination,
            },
        );
        tracing::info!(
            task = %entry.task_id,
            robot = %entry.robot_id,
            score = entry.score,
            effective_priority = entry.effective_priority,
            fallback = candidate.fallback,
            "task assigned"
        );
        Ok(entry)
    }

    fn run_charging(&self, now: OffsetDateTime) -> Result<ChargingReport, DispatchError> {
        let robots = self.retry.run(|| self.robots.snapshot())?;
        let plan = self.charging.plan(&robots, |task_id| {
            self.tasks
                .get(task_id)
                .ok()
                .map(|t| self.priority.effective_priority(&t, now))
        });
        let mut report = ChargingReport::default();

        for robot_id in plan.finish {
            let res = self.robots.modify(&robot_id, |robot| {
                if robot.status != RobotStatus::Charging
                    || robot.battery_level < self.charging.resume_level
                {
                    return Ok(None);
                }
                robot.status = RobotStatus::Idle;
                robot.last_active = now;
                Ok(Some(robot.battery_level))
            });
            match res {
                Ok(Some(battery)) => {
                    self.slots.release(&robot_id);
                    tracing::info!(robot = %robot_id, battery, "charging finished");
                    report
                        .decisions
                        .push(ChargingDecision::Finished { robot_id, battery });
                }
                Ok(None) => {}
                Err(e) if e.is_retryable() => {
                    tracing::debug!(robot = %robot_id, "robot busy, charging check skipped");
                }
                Err(e) => return Err(e),
            }
        }

        let mut position = 0;
        for (robot_id, battery) in plan.candidates {
            match self.start_charging(&robot_id, now, false) {
                Ok(true) => {
                    report
                        .decisions
                        .push(ChargingDecision::Started { robot_id, battery });
                }
                Ok(false) => {}
                Err(e) if e.is_steady_state() => {
                    position += 1;
                    tracing::debug!(robot = %robot_id, battery, position, "waiting for a charging slot");
                    report.decisions.push(ChargingDecision::Queued {
                        robot_id,
                        battery,
                        position,
                    });
                }
                Err(e) if e.is_retryable() => {
                    tracing::debug!(robot = %robot_id, "robot busy, charging check skipped");
                }
                Err(e) => return Err(e),
            }
        }

        for (robot_id, task_id, critical) in plan.defer {
            tracing::debug!(robot = %robot_id, task = %task_id, critical, "charging deferred until task ends");
            report.decisions.push(ChargingDecision::Deferred {
                robot_id,
                task_id,
                critical,
            });
        }
        Ok(report)
    }

    /// Takes a slot and moves the robot to CHARGING. Returns false when an
    /// automatic start no longer applies to the robot.
    fn start_charging(
        &self,
        robot_id: &str,
        now: OffsetDateTime,
        manual: bool,
    ) -> Result<bool, DispatchError> {
        let took_slot = self.slots.try_acquire(robot_id)?;
        let res = self.robots.modify(robot_id, |robot| {
            let eligible = robot.is_idle()
                && (manual || robot.needs_charge(self.charging.min_battery_threshold));
            if !eligible {
                return if manual {
                    Err(robot.unavailable())
                } else {
                    Ok(false)
                };
            }
            robot.status = RobotStatus::Charging;
            robot
                .current_location
                .clone_from(&self.charging.station);
            robot.last_active = now;
            Ok(true)
        });
        match res {
            Ok(true) => {
                self.link.send(
                    robot_id,
                    &LinkMessage::StartCharging {
                        station: self.charging.station.clone(),
                    },
                );
                tracing::info!(robot = robot_id, manual, "charging started");
                Ok(true)
            }
            other => {
                if took_slot {
                    self.slots.release(robot_id);
                }
                other
            }
        }
    }

    /// Undoes task/robot bindings that only one side still records, as left by
    /// a process that stopped between its two writes. Robots are released,
    /// tasks are failed. Returns the ids that were touched.
    pub fn repair_bindings(&self, now: OffsetDateTime) -> Result<Vec<String>, DispatchError> {
        let tasks = self.retry.run(|| self.tasks.snapshot())?;
        let robots = self.retry.run(|| self.robots.snapshot())?;
        let mut repaired = Vec::new();

        for robot in &robots {
            let Some(task_id) = robot.current_task_id.as_deref() else {
                continue;
            };
            let consistent = tasks.iter().any(|t| {
                t.id == task_id
                    && t.state.holds_robot()
                    && t.assigned_robot.as_deref() == Some(robot.id.as_str())
            });
            if consistent {
                continue;
            }
            self.robots.modify(&robot.id, |r| {
                if r.current_task_id.as_deref() == Some(task_id) {
                    r.release()?;
                }
                Ok(())
            })?;
            tracing::warn!(robot = %robot.id, task = task_id, "released robot with a stale task binding");
            repaired.push(robot.id.clone());
        }

        for task in &tasks {
            let Some(robot_id) = task.assigned_robot.as_deref() else {
                continue;
            };
            let consistent = robots
                .iter()
                .any(|r| r.id == robot_id && r.current_task_id.as_deref() == Some(task.id.as_str()));
            if consistent {
                continue;
            }
            self.tasks.modify(&task.id, |t| {
                if t.assigned_robot.as_deref() == Some(robot_id) {
                    t.fail(&format!("lost binding to robot {robot_id}"), now)?;
                }
                Ok(())
            })?;
            tracing::warn!(task = %task.id, robot = robot_id, "failed task with a stale robot binding");
            repaired.push(task.id.clone());
        }
        Ok(repaired)
    }

    // ---- reporting ---------------------------------------------------------

    #[must_use]
    pub fn get_assignment_log(&self, filter: &LogFilter) -> Vec<AssignmentLog> {
        self.audit.query(filter)
    }

    pub fn charging_status(&self) -> Result<ChargingStatus, DispatchError> {
        let robots = self.list_robots()?;
        let charging = robots
            .iter()
            .filter(|r| r.status == RobotStatus::Charging)
            .map(|r| (r.id.clone(), r.battery_level))
            .collect();
        let queue = self.charging.plan(&robots, |_| None).candidates;
        Ok(ChargingStatus {
            max_concurrent: self.slots.max(),
            charging,
            queue,
            auto_enabled: self.charging.auto_enabled,
        })
    }

    pub fn stats(&self) -> Result<Stats, DispatchError> {
        let mut stats = Stats {
            assignments: self.audit.len(),
            charging_slots_in_use: self.slots.active(),
            charging_slots: self.slots.max(),
            ..Stats::default()
        };
        for state in TaskState::ALL {
            stats.tasks_by_state.insert(state.as_str().to_owned(), 0);
        }
        for task in self.retry.run(|| self.tasks.snapshot())? {
            *stats
                .tasks_by_state
                .entry(task.state.as_str().to_owned())
                .or_insert(0) += 1;
            *stats
                .tasks_by_type
                .entry(task.task_type.as_str().to_owned())
                .or_insert(0) += 1;
            if !task.is_terminal() {
                stats.open_tasks += 1;
            }
        }
        for status in RobotStatus::ALL {
            stats.robots_by_status.insert(status.as_str().to_owned(), 0);
        }
        for robot in self.list_robots()? {
            *stats
                .robots_by_status
                .entry(robot.status.as_str().to_owned())
                .or_insert(0) += 1;
        }
        Ok(stats)
    }

    // ---- plumbing ----------------------------------------------------------

    fn notify_next_waypoint(&self, task: &Task) {
        if task.state != TaskState::Running {
            return;
        }
        if let (Some(robot), Some(destination)) = (
            task.assigned_robot.as_deref(),
            task.waypoints.get(task.current_step),
        ) {
            self.link.send(
                robot,
                &LinkMessage::Dispatch {
                    task_id: task.id.clone(),
                    destination: destination.clone(),
                },
            );
        }
    }

    fn persist(&self, robot: Option<&Robot>, task: Option<&Task>) -> Result<(), DispatchError> {
        if let Some(robot) = robot {
            self.store
                .save_robot(robot)
                .map_err(|e| DispatchError::storage(&e))?;
        }
        if let Some(task) = task {
            self.store
                .save_task(task)
                .map_err(|e| DispatchError::storage(&e))?;
        }
        Ok(())
    }

    /// Locks the task and, if it holds one, its robot (robot first). If the
    /// binding moves between the lookup and the lock the attempt is retried.
    fn update_task_and_robot<R>(
        &self,
        task_id: &str,
        mut f: impl FnMut(&mut Task, Option<&mut Robot>) -> Result<R, DispatchError>,
    ) -> Result<R, DispatchError> {
        let moved = || DispatchError::RetryLater {
            kind: EntityKind::Task,
            id: task_id.to_owned(),
        };
        self.retry.run(|| match self.tasks.get(task_id)?.assigned_robot {
            None => self.tasks.modify(task_id, |task| {
                if task.assigned_robot.is_some() {
                    return Err(moved());
                }
                f(task, None)
            }),
            Some(robot_id) => self.robots.table().update(&robot_id, |robot| {
                self.tasks.table().update(task_id, |task| {
                    if task.assigned_robot.as_deref() != Some(robot_id.as_str()) {
                        return Err(moved());
                    }
                    let out = f(task, Some(&mut *robot))?;
                    self.persist(Some(&*robot), Some(&*task))?;
                    Ok(out)
                })
            }),
        })
    }

    /// Locks the robot and, if it holds one, its task.
    fn update_robot_and_task<R>(
        &self,
        robot_id: &str,
        mut f: impl FnMut(&mut Robot, Option<&mut Task>) -> Result<R, DispatchError>,
    ) -> Result<R, DispatchError> {
        self.retry.run(|| {
            self.robots.table().update(robot_id, |robot| {
                match robot.current_task_id.clone() {
                    None => {
                        let out = f(&mut *robot, None)?;
                        self.persist(Some(&*robot), None)?;
                        Ok(out)
                    }
                    Some(task_id) => self.tasks.table().update(&task_id, |task| {
                        let out = f(&mut *robot, Some(task))?;
                        self.persist(Some(&*robot), Some(&*task))?;
                        Ok(out)
                    }),
                }
            })
        })
    }
}

fn apply_override(task: &mut Task, delta: i64, source: OverrideSource, at: OffsetDateTime) {
    task.operator_override = delta;
    task.override_history.push(OverrideRecord { at, delta, source });
}

#[cfg(test)]
mod tests {
    use time::Duration;

    use super::*;
    use crate::robot::link::RecordingLink;
    use crate::site::{Location, SiteMap};
    use crate::store::memory::MemoryStore;

    fn t0() -> OffsetDateTime {
        OffsetDateTime::UNIX_EPOCH + Duration::days(20_000)
    }

    fn dispatcher() -> (Dispatcher, Arc<RecordingLink>) {
        let site = SiteMap::new(
            &[
                Location {
                    id: "Kitchen".to_owned(),
                    x: 50.0,
                    y: 50.0,
                    kind: None,
                },
                Location {
                    id: "Table 1".to_owned(),
                    x: 100.0,
                    y: 200.0,
                    kind: None,
                },
            ],
            1000.0,
        );
        let link = Arc::new(RecordingLink::default());
        let d = Dispatcher::open(
            &Config::default(),
            Arc::new(MemoryStore::default()),
            Arc::new(site),
            Arc::clone(&link) as Arc<dyn RobotLink>,
        )
        .unwrap();
        (d, link)
    }

    fn running_task(d: &Dispatcher) -> Task {
        d.register_robot("R1", "Kitchen", 90, t0()).unwrap();
        d.create_task(
            NewTask::new("delivery", &["Kitchen", "Table 1"], 50).with_id("T-1"),
            t0(),
        )
        .unwrap();
        d.run_scheduling_tick(t0()).unwrap();
        d.start_task("T-1").unwrap()
    }

    #[test]
    fn create_rejects_bad_input() {
        let (d, _) = dispatcher();
        assert!(matches!(
            d.create_task(NewTask::new("teleport", &["Kitchen"], 50), t0()),
            Err(DispatchError::InvalidTaskType(_))
        ));
        assert!(matches!(
            d.create_task(NewTask::new("delivery", &[], 50), t0()),
            Err(DispatchError::InvalidTask(_))
        ));
        d.create_task(NewTask::new("delivery", &["Kitchen"], 50).with_id("T-1"), t0())
            .unwrap();
        assert!(matches!(
            d.create_task(NewTask::new("delivery", &["Kitchen"], 50).with_id("T-1"), t0()),
            Err(DispatchError::InvalidTask(_))
        ));
    }

    #[test]
    fn future_release_starts_waiting_and_is_promoted() {
        let (d, _) = dispatcher();
        let later = t0() + Duration::minutes(10);
        let t = d
            .create_task(
                NewTask::new("collection", &["Table 1"], 50).with_release_time(later),
                t0(),
            )
            .unwrap();
        assert_eq!(t.state, TaskState::Waiting);

        let report = d.run_tick(t0()).unwrap();
        assert!(report.promoted.is_empty());
        let report = d.run_tick(later).unwrap();
        assert_eq!(report.promoted, [t.id.clone()]);
        assert_eq!(d.get_task(&t.id).unwrap().state, TaskState::Ready);
    }

    #[test]
    fn failed_dependency_fails_dependent() {
        let (d, _) = dispatcher();
        d.create_task(NewTask::new("ordering", &["Table 1"], 50).with_id("T-a"), t0())
            .unwrap();
        d.create_task(
            NewTask::new("delivery", &["Kitchen"], 50)
                .with_id("T-b")
                .with_dependency("T-a"),
            t0(),
        )
        .unwrap();
        d.fail_task("T-a", "customer left", t0()).unwrap();
        let report = d.run_tick(t0()).unwrap();
        assert_eq!(report.failed, ["T-b"]);
        assert_eq!(
            d.get_task("T-b").unwrap().last_error.as_deref(),
            Some("dependency failed: T-a")
        );
    }

    #[test]
    fn full_lifecycle_frees_the_robot() {
        let (d, link) = dispatcher();
        let task = running_task(&d);
        assert_eq!(task.state, TaskState::Running);

        assert!(matches!(
            d.complete_task("T-1", t0()),
            Err(DispatchError::InvalidTransition { .. })
        ));
        d.pause_task("T-1").unwrap();
        assert!(matches!(
            d.confirm_step("T-1"),
            Err(DispatchError::InvalidTransition { .. })
        ));
        d.resume_task("T-1").unwrap();
        assert_eq!(d.confirm_step("T-1").unwrap().step, 1);
        let info = d.confirm_step("T-1").unwrap();
        assert_eq!((info.step, info.total, info.next_waypoint), (2, 2, None));
        assert!(matches!(
            d.confirm_step("T-1"),
            Err(DispatchError::StepOutOfRange { .. })
        ));

        let done = d.complete_task("T-1", t0()).unwrap();
        assert_eq!(done.state, TaskState::Done);
        let robot = d.get_robot("R1").unwrap();
        assert!(robot.is_idle());

        let sent = link.sent_to("R1");
        assert!(sent.contains(&LinkMessage::Hold {
            task_id: "T-1".to_owned()
        }));
        assert!(matches!(sent.first(), Some(LinkMessage::Dispatch { .. })));
    }

    #[test]
    fn robot_error_fails_its_task() {
        let (d, _) = dispatcher();
        running_task(&d);
        let robot = d.report_robot_error("R1", "wheel jammed", t0()).unwrap();
        assert_eq!(robot.status, RobotStatus::Error);
        assert_eq!(robot.current_task_id, None);

        let task = d.get_task("T-1").unwrap();
        assert_eq!(task.state, TaskState::Failed);
        assert_eq!(task.last_robot.as_deref(), Some("R1"));

        let robot = d
            .send_robot_command("R1", RobotCommand::ReturnToBase, t0())
            .unwrap();
        assert_eq!(robot.status, RobotStatus::Idle);
        assert_eq!(robot.current_location, "Kitchen");
    }

    #[test]
    fn return_to_base_refuses_busy_robot() {
        let (d, _) = dispatcher();
        running_task(&d);
        assert!(matches!(
            d.send_robot_command("R1", RobotCommand::ReturnToBase, t0()),
            Err(DispatchError::RobotUnavailable { .. })
        ));
    }

    #[test]
    fn manual_charging_needs_a_free_slot() {
        let (d, link) = dispatcher();
        d.register_robot("R1", "Kitchen", 80, t0()).unwrap();
        d.register_robot("R2", "Kitchen", 70, t0()).unwrap();

        let r1 = d
            .send_robot_command("R1", RobotCommand::StartCharging, t0())
            .unwrap();
        assert_eq!(r1.status, RobotStatus::Charging);
        assert_eq!(r1.current_location, "Charging Station");
        assert!(matches!(
            d.send_robot_command("R2", RobotCommand::StartCharging, t0()),
            Err(DispatchError::NoChargingSlotAvailable { active: 1, max: 1, .. })
        ));
        assert_eq!(d.get_robot("R2").unwrap().status, RobotStatus::Idle);
        assert_eq!(link.sent_to("R1").len(), 1);

        d.update_telemetry("R1", None, Some(95), t0()).unwrap();
        let report = d.run_tick(t0()).unwrap();
        assert!(matches!(
            report.charging.decisions.as_slice(),
            [ChargingDecision::Finished { .. }]
        ));
        d.send_robot_command("R2", RobotCommand::StartCharging, t0())
            .unwrap();
    }

    #[test]
    fn critical_task_takes_queued_robot_and_defers_charging() {
        let (d, _) = dispatcher();
        d.register_robot("R1", "Kitchen", 20, t0()).unwrap();
        d.register_robot("R2", "Kitchen", 25, t0()).unwrap();
        d.send_robot_command("R1", RobotCommand::StartCharging, t0())
            .unwrap();

        d.create_task(NewTask::new("payment", &["Table 1"], 80).with_id("T-1"), t0())
            .unwrap();
        let report = d.run_tick(t0()).unwrap();
        assert!(report.assignments.is_empty());
        assert_eq!(report.charging.queued(), ["R2"]);

        d.mark_critical("T-1", t0()).unwrap();
        let report = d.run_tick(t0()).unwrap();
        assert_eq!(report.assignments.len(), 1);
        assert_eq!(report.assignments[0].robot_id, "R2");
        assert_eq!(report.assignments[0].effective_priority, 130);
        assert!(report.charging.decisions.contains(&ChargingDecision::Deferred {
            robot_id: "R2".to_owned(),
            task_id: "T-1".to_owned(),
            critical: true,
        }));
    }

    #[test]
    fn repeated_charging_start_keeps_the_held_slot() {
        let (d, _) = dispatcher();
        d.register_robot("R1", "Kitchen", 15, t0()).unwrap();
        d.register_robot("R2", "Kitchen", 12, t0()).unwrap();
        assert!(d.start_charging("R1", t0(), false).unwrap());
        assert!(!d.start_charging("R1", t0(), false).unwrap());
        assert_eq!(d.slots.holders(), ["R1"]);
        assert!(matches!(
            d.start_charging("R2", t0(), false),
            Err(DispatchError::NoChargingSlotAvailable { active: 1, max: 1, .. })
        ));
        assert_eq!(d.get_robot("R2").unwrap().status, RobotStatus::Idle);
    }

    #[derive(Debug, Default)]
    struct LogFailingStore {
        inner: MemoryStore,
    }

    impl Store for LogFailingStore {
        fn load_tasks(&self) -> anyhow::Result<Vec<Task>> {
            self.inner.load_tasks()
        }
        fn save_task(&self, task: &Task) -> anyhow::Result<()> {
            self.inner.save_task(task)
        }
        fn load_robots(&self) -> anyhow::Result<Vec<Robot>> {
            self.inner.load_robots()
        }
        fn save_robot(&self, robot: &Robot) -> anyhow::Result<()> {
            self.inner.save_robot(robot)
        }
        fn append_log(&self, _entry: &AssignmentLog) -> anyhow::Result<()> {
            anyhow::bail!("log disk full")
        }
        fn load_log(&self) -> anyhow::Result<Vec<AssignmentLog>> {
            self.inner.load_log()
        }
    }

    #[test]
    fn failed_log_append_leaves_the_stored_claim_undone() {
        let store = Arc::new(LogFailingStore::default());
        let d = Dispatcher::open(
            &Config::default(),
            Arc::clone(&store) as Arc<dyn Store>,
            Arc::new(SiteMap::new(&[], 1000.0)),
            Arc::new(RecordingLink::default()),
        )
        .unwrap();
        d.register_robot("R1", "Kitchen", 90, t0()).unwrap();
        d.create_task(
            NewTask::new("delivery", &["Kitchen", "Table 1"], 50).with_id("T-1"),
            t0(),
        )
        .unwrap();

        assert!(matches!(
            d.run_scheduling_tick(t0()),
            Err(DispatchError::Storage(_))
        ));
        assert_eq!(d.get_task("T-1").unwrap().state, TaskState::Ready);

        let stored = store.inner.load_tasks().unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].state, TaskState::Ready);
        assert_eq!(stored[0].assigned_robot, None);
        let robots = store.inner.load_robots().unwrap();
        assert!(robots[0].is_idle());
        assert_eq!(robots[0].current_task_id, None);
    }

    #[test]
    fn stats_count_everything() {
        let (d, _) = dispatcher();
        running_task(&d);
        d.create_task(NewTask::new("ordering", &["Table 1"], 50), t0())
            .unwrap();
        let stats = d.stats().unwrap();
        assert_eq!(stats.tasks_by_state["RUNNING"], 1);
        assert_eq!(stats.tasks_by_state["READY"], 1);
        assert_eq!(stats.tasks_by_state["DONE"], 0);
        assert_eq!(stats.tasks_by_type["delivery"], 1);
        assert_eq!(stats.robots_by_status["MOVING"], 1);
        assert_eq!(stats.open_tasks, 2);
        assert_eq!(stats.assignments, 1);
    }
}
