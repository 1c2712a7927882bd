#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use parking_lot::Mutex;
use serde::Serialize;

use crate::config::ChargingConfig;
use crate::error::DispatchError;
use crate::robot::model::{Robot, RobotStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChargingPolicy {
    pub min_battery_threshold: u8,
    pub max_concurrent: usize,
    pub resume_level: u8,
    pub critical_cutoff: i64,
    pub auto_enabled: bool,
    pub station: String,
}

impl Default for ChargingPolicy {
    fn default() -> Self {
        Self::from_config(&ChargingConfig::default())
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ChargingDecision {
    Started { robot_id: String, battery: u8 },
    Queued { robot_id: String, battery: u8, position: usize },
    Deferred { robot_id: String, task_id: String, critical: bool },
    Finished { robot_id: String, battery: u8 },
}

impl ChargingDecision {
    #[must_use]
    pub fn robot_id(&self) -> &str {
        match self {
            Self::Started { robot_id, .. }
            | Self::Queued { robot_id, .. }
            | Self::Deferred { robot_id, .. }
            | Self::Finished { robot_id, .. } => robot_id,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ChargingReport {
    pub decisions: Vec<ChargingDecision>,
}

impl ChargingReport {
    #[must_use]
    pub fn started(&self) -> Vec<&str> {
        self.decisions
            .iter()
            .filter(|d| matches!(d, ChargingDecision::Started { .. }))
            .map(ChargingDecision::robot_id)
            .collect()
    }

    #[must_use]
    pub fn queued(&self) -> Vec<&str> {
        self.decisions
            .iter()
            .filter(|d| matches!(d, ChargingDecision::Queued { .. }))
            .map(ChargingDecision::robot_id)
            .collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.decisions.is_empty()
    }
}

/// What one charging pass intends to do, before any lock is taken.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChargingPlan {
    pub finish: Vec<String>,
    /// Low-battery IDLE robots, lowest battery first.
    pub candidates: Vec<(String, u8)>,
    pub defer: Vec<(String, String, bool)>,
}

impl ChargingPolicy {
    #[must_use]
    pub fn from_config(cfg: &ChargingConfig) -> Self {
        Self {
            min_battery_threshold: cfg.min_battery_threshold,
            max_concurrent: cfg.max_concurrent_charging,
            resume_level: cfg.resume_battery_level,
            critical_cutoff: cfg.critical_cutoff,
            auto_enabled: cfg.auto_charging_enabled,
            station: cfg.charging_location.clone(),
        }
    }

    /// `task_priority` resolves the effective priority of the task a robot is
    /// bound to.
    #[must_use]
    pub fn plan(&self, robots: &[Robot], task_priority: impl Fn(&str) -> Option<i64>) -> ChargingPlan {
        let mut plan = ChargingPlan::default();
        for robot in robots {
            if robot.status == RobotStatus::Charging {
                if robot.battery_level >= self.resume_level {
                    plan.finish.push(robot.id.clone());
                }
                continue;
            }
            if !self.auto_enabled || !robot.needs_charge(self.min_battery_threshold) {
                continue;
            }
            if robot.is_idle() {
                plan.candidates.push((robot.id.clone(), robot.battery_level));
            } else if let Some(task_id) = robot.current_task_id.as_deref() {
                let critical =
                    task_priority(task_id).is_some_and(|eff| eff > self.critical_cutoff);
                plan.defer
                    .push((robot.id.clone(), task_id.to_owned(), critical));
            }
        }
        plan.candidates
            .sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        plan
    }
}

/// Charging slots currently held, keyed by robot id.
#[derive(Debug)]
pub struct ChargingSlots {
    max: usize,
    held: Mutex<BTreeSet<String>>,
}

impl ChargingSlots {
    #[must_use]
    pub fn new(max: usize, robots: &[Robot]) -> Self {
        let held = robots
            .iter()
            .filter(|r| r.status == RobotStatus::Charging)
            .map(|r| r.id.clone())
            .collect();
        Self {
            max,
            held: Mutex::new(held),
        }
    }

    /// Takes a slot for `robot_id`. Returns `false` when the robot already held one,
    /// so only the caller that saw `true` may release it on failure.
    pub fn try_acquire(&self, robot_id: &str) -> Result<bool, DispatchError> {
        let mut held = self.held.lock();
        if held.contains(robot_id) {
            return Ok(false);
        }
        if held.len() >= self.max {
            return Err(DispatchError::NoChargingSlotAvailable {
                robot_id: robot_id.to_owned(),
                active: held.len(),
                max: self.max,
            });
        }
        held.insert(robot_id.to_owned());
        Ok(true)
    }

    pub fn release(&self, robot_id: &str) {
        self.held.lock().remove(robot_id);
    }

    #[must_use]
    pub fn holders(&self) -> Vec<String> {
        self.held.lock().iter().cloned().collect()
    }

    #[must_use]
    pub fn active(&self) -> usize {
        self.held.lock().len()
    }

    #[must_use]
    pub fn max(&self) -> usize {
        self.max
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ChargingStatus {
    pub max_concurrent: usize,
    pub charging: Vec<(String, u8)>,
    pub queue: Vec<(String, u8)>,
    pub auto_enabled: bool,
}
