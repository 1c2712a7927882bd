#![forbid(unsafe_code)]

//! Matching of READY tasks to robots. This module only decides; the
//! dispatcher applies each decision under the robot and task locks.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use time::OffsetDateTime;

use crate::config::Config;
use crate::robot::model::Robot;
use crate::site::TravelCost;
use crate::task::model::{Task, TaskState, TaskView};
use crate::task::priority::{PriorityPolicy, queue_order};

#[derive(Debug, Clone, PartialEq)]
pub struct AssignmentPolicy {
    pub min_battery_threshold: u8,
    /// Tasks above this effective priority may take a low-battery robot.
    pub critical_cutoff: i64,
    pub critical_min_battery: u8,
    pub travel_cost_weight: f64,
}

impl Default for AssignmentPolicy {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// The robot chosen for one task.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub robot_id: String,
    pub location: String,
    pub battery: u8,
    pub cost: f64,
    /// Picked from the low-battery queue for a critical task.
    pub fallback: bool,
}

impl AssignmentPolicy {
    #[must_use]
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            min_battery_threshold: cfg.charging.min_battery_threshold,
            critical_cutoff: cfg.charging.critical_cutoff,
            critical_min_battery: cfg.charging.critical_min_battery,
            travel_cost_weight: cfg.engine.travel_cost_weight,
        }
    }

    /// READY tasks in scheduling order.
    #[must_use]
    pub fn rank(
        &self,
        priority: &PriorityPolicy,
        tasks: Vec<Task>,
        now: OffsetDateTime,
    ) -> Vec<TaskView> {
        let mut ready: Vec<TaskView> = tasks
            .into_iter()
            .filter(|t| t.state == TaskState::Ready)
            .map(|t| priority.view(t, now))
            .collect();
        ready.sort_by(queue_order);
        ready
    }

    /// Cheapest eligible robot for `view`, skipping ids in `taken`. Ties go to
    /// the higher battery, then the lower id.
    #[must_use]
    pub fn select(
        &self,
        view: &TaskView,
        robots: &[Robot],
        taken: &BTreeSet<String>,
        travel: &dyn TravelCost,
    ) -> Option<Candidate> {
        let normal = self.best(view, robots, taken, travel, |r| {
            r.is_available(self.min_battery_threshold)
        });
        if normal.is_some() || view.effective_priority <= self.critical_cutoff {
            return normal;
        }
        self.best(view, robots, taken, travel, |r| self.fallback_eligible(r))
            .map(|c| Candidate {
                fallback: true,
                ..c
            })
    }

    /// Whether `robot` may still be bound to `task` at claim time.
    #[must_use]
    pub fn still_eligible(&self, robot: &Robot, fallback: bool) -> bool {
        if fallback {
            self.fallback_eligible(robot)
        } else {
            robot.is_available(self.min_battery_threshold)
        }
    }

    #[must_use]
    pub fn score(&self, effective_priority: i64, cost: f64) -> f64 {
        #[allow(clippy::cast_precision_loss)]
        let eff = effective_priority as f64;
        eff - self.travel_cost_weight * cost
    }

    #[must_use]
    pub fn reason(&self, view: &TaskView, candidate: &Candidate) -> String {
        let target = view.task.pickup_location().unwrap_or("?");
        let mut reason = format!(
            "priority {} {}; {} at {} (battery {}%) is {:.1} from {}",
            view.effective_priority,
            view.task.task_type,
            candidate.robot_id,
            candidate.location,
            candidate.battery,
            candidate.cost,
            target
        );
        if candidate.fallback {
            reason.push_str("; critical task took a low-battery robot, charging deferred");
        }
        reason
    }

    fn fallback_eligible(&self, robot: &Robot) -> bool {
        robot.is_idle()
            && robot.needs_charge(self.min_battery_threshold)
            && robot.battery_level >= self.critical_min_battery
    }

    fn best(
        &self,
        view: &TaskView,
        robots: &[Robot],
        taken: &BTreeSet<String>,
        travel: &dyn TravelCost,
        eligible: impl Fn(&Robot) -> bool,
    ) -> Option<Candidate> {
        let task = &view.task;
        let target = task.pickup_location()?;
        robots
            .iter()
            .filter(|r| !taken.contains(&r.id) && eligible(r))
            .filter(|r| {
                task.start_location
                    .as_deref()
                    .is_none_or(|start| travel.reachable(&r.current_location, start))
            })
            .map(|r| Candidate {
                robot_id: r.id.clone(),
                location: r.current_location.clone(),
                battery: r.battery_level,
                cost: travel.estimate(&r.current_location, target),
                fallback: false,
            })
            .min_by(preference)
    }
}

fn preference(a: &Candidate, b: &Candidate) -> Ordering {
    a.cost
        .total_cmp(&b.cost)
        .then_with(|| b.battery.cmp(&a.battery))
        .then_with(|| a.robot_id.cmp(&b.robot_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::site::{Location, SiteMap};
    use crate::task::model::TaskType;

    fn site() -> SiteMap {
        let loc = |id: &str, x: f64, y: f64| Location {
            id: id.to_owned(),
            x,
            y,
            kind: None,
        };
        SiteMap::new(
            &[
                loc("Kitchen", 50.0, 50.0),
                loc("Reception", 300.0, 50.0),
                loc("Table 1", 100.0, 200.0),
            ],
            1000.0,
        )
    }

    fn robot(id: &str, at: &str, battery: u8) -> Robot {
        Robot::new(id, at, battery, OffsetDateTime::UNIX_EPOCH)
    }

    fn view(id: &str, eff: i64, waypoints: &[&str]) -> TaskView {
        let t0 = OffsetDateTime::UNIX_EPOCH;
        TaskView {
            task: Task {
                id: id.to_owned(),
                task_type: TaskType::Delivery,
                base_priority: eff,
                release_time: t0,
                deadline: None,
                operator_override: 0,
                override_history: Vec::new(),
                waypoints: waypoints.iter().map(|w| (*w).to_owned()).collect(),
                start_location: None,
                depends_on: Vec::new(),
                state: TaskState::Ready,
                assigned_robot: None,
                current_step: 0,
                created_at: t0,
                completed_at: None,
                last_robot: None,
                last_error: None,
            },
            effective_priority: eff,
        }
    }

    #[test]
    fn picks_the_closest_robot() {
        let policy = AssignmentPolicy::default();
        let robots = [robot("R1", "Reception", 90), robot("R2", "Kitchen", 60)];
        let c = policy
            .select(&view("T-1", 50, &["Kitchen"]), &robots, &BTreeSet::new(), &site())
            .unwrap();
        assert_eq!(c.robot_id, "R2");
        assert!(c.cost.abs() < f64::EPSILON);
        assert!(!c.fallback);
    }

    #[test]
    fn cost_ties_prefer_battery_then_id() {
        let policy = AssignmentPolicy::default();
        let robots = [
            robot("R3", "Kitchen", 70),
            robot("R2", "Kitchen", 90),
            robot("R1", "Kitchen", 90),
        ];
        let c = policy
            .select(&view("T-1", 50, &["Table 1"]), &robots, &BTreeSet::new(), &site())
            .unwrap();
        assert_eq!(c.robot_id, "R1");
    }

    #[test]
    fn taken_and_low_battery_robots_are_skipped() {
        let policy = AssignmentPolicy::default();
        let robots = [robot("R1", "Kitchen", 90), robot("R2", "Kitchen", 25)];
        let taken = BTreeSet::from(["R1".to_owned()]);
        assert!(
            policy
                .select(&view("T-1", 50, &["Kitchen"]), &robots, &taken, &site())
                .is_none()
        );
    }

    #[test]
    fn critical_task_falls_back_to_queued_robot() {
        let policy = AssignmentPolicy::default();
        let robots = [robot("R1", "Kitchen", 25), robot("R2", "Kitchen", 5)];
        let none = policy.select(
            &view("T-1", 100, &["Kitchen"]),
            &robots,
            &BTreeSet::new(),
            &site(),
        );
        assert!(none.is_none(), "cutoff is exclusive");

        let c = policy
            .select(&view("T-2", 101, &["Kitchen"]), &robots, &BTreeSet::new(), &site())
            .unwrap();
        assert_eq!(c.robot_id, "R1");
        assert!(c.fallback);
        assert!(policy.reason(&view("T-2", 101, &["Kitchen"]), &c).contains("deferred"));
    }

    #[test]
    fn start_location_must_be_reachable() {
        let policy = AssignmentPolicy::default();
        let robots = [robot("R1", "Patio", 90)];
        let mut v = view("T-1", 50, &["Table 1"]);
        v.task.start_location = Some("Kitchen".to_owned());
        assert!(
            policy
                .select(&v, &robots, &BTreeSet::new(), &site())
                .is_none()
        );

        let robots = [robot("R1", "Reception", 90)];
        assert!(
            policy
                .select(&v, &robots, &BTreeSet::new(), &site())
                .is_some()
        );
    }

    #[test]
    fn rank_orders_ready_tasks_only() {
        let policy = AssignmentPolicy::default();
        let mut waiting = view("T-0", 90, &["Kitchen"]).task;
        waiting.state = TaskState::Waiting;
        let tasks = vec![
            view("T-b", 50, &["Kitchen"]).task,
            waiting,
            view("T-c", 70, &["Kitchen"]).task,
            view("T-a", 50, &["Kitchen"]).task,
        ];
        let ids: Vec<String> = policy
            .rank(&PriorityPolicy::default(), tasks, OffsetDateTime::UNIX_EPOCH)
            .into_iter()
            .map(|v| v.task.id)
            .collect();
        assert_eq!(ids, ["T-c", "T-a", "T-b"]);
    }

    #[test]
    fn score_subtracts_weighted_travel() {
        let policy = AssignmentPolicy::default();
        assert!((policy.score(50, 100.0) - 40.0).abs() < 1e-9);
    }
}
