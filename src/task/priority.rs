#![forbid(unsafe_code)]

//! Effective priority: `base_priority + operator_override + urgency_bonus`.
//!
//! All arithmetic is integral (milliseconds), so the same task and the same
//! `now` always produce the same value.

use std::cmp::Ordering;

use time::{Duration, OffsetDateTime};

use crate::config::PriorityConfig;
use crate::task::model::{Task, TaskView};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriorityPolicy {
    /// Lead time before the deadline in which the bonus starts ramping up.
    pub urgency_window: Duration,
    /// Bonus reached just before the deadline.
    pub urgency_max_bonus: i64,
    /// Flat bonus once the deadline has passed.
    pub overdue_bonus: i64,
    /// Override applied by "mark critical". Also the ceiling for any urgency bonus.
    pub critical_boost: i64,
    /// Zero disables aging.
    pub aging_interval: Duration,
    pub aging_bonus: i64,
}

impl Default for PriorityPolicy {
    fn default() -> Self {
        Self::from_config(&PriorityConfig::default())
    }
}

impl PriorityPolicy {
    #[must_use]
    pub fn from_config(cfg: &PriorityConfig) -> Self {
        Self {
            urgency_window: secs(cfg.urgency_window_secs),
            urgency_max_bonus: cfg.urgency_max_bonus,
            overdue_bonus: cfg.overdue_bonus,
            critical_boost: cfg.critical_boost,
            aging_interval: secs(cfg.aging_interval_secs),
            aging_bonus: cfg.aging_bonus,
        }
    }

    #[must_use]
    pub fn urgency_bonus(&self, task: &Task, now: OffsetDateTime) -> i64 {
        let deadline_part = task
            .deadline
            .map_or(0, |deadline| self.deadline_bonus(deadline - now));
        let aging_part = self.aging(now - task.release_time);
        deadline_part
            .saturating_add(aging_part)
            .clamp(0, self.critical_boost.max(0))
    }

    #[must_use]
    pub fn effective_priority(&self, task: &Task, now: OffsetDateTime) -> i64 {
        task.base_priority
            .saturating_add(task.operator_override)
            .saturating_add(self.urgency_bonus(task, now))
    }

    #[must_use]
    pub fn view(&self, task: Task, now: OffsetDateTime) -> TaskView {
        let effective_priority = self.effective_priority(&task, now);
        TaskView {
            task,
            effective_priority,
        }
    }

    fn deadline_bonus(&self, remaining: Duration) -> i64 {
        if remaining <= Duration::ZERO {
            return self.overdue_bonus;
        }
        let window = self.urgency_window.whole_milliseconds();
        let remaining = remaining.whole_milliseconds();
        if window <= 0 || remaining >= window {
            return 0;
        }
        let ramp = i128::from(self.urgency_max_bonus) * (window - remaining) / window;
        i64::try_from(ramp).unwrap_or(self.urgency_max_bonus)
    }

    fn aging(&self, age: Duration) -> i64 {
        let interval = self.aging_interval.whole_milliseconds();
        if interval <= 0 || self.aging_bonus == 0 || age <= Duration::ZERO {
            return 0;
        }
        let steps = age.whole_milliseconds() / interval;
        let bonus = i128::from(self.aging_bonus).saturating_mul(steps);
        i64::try_from(bonus).unwrap_or(i64::MAX)
    }
}

/// Scheduling order: higher effective priority first, then earlier release, then id.
#[must_use]
pub fn queue_order(a: &TaskView, b: &TaskView) -> Ordering {
    b.effective_priority
        .cmp(&a.effective_priority)
        .then_with(|| a.task.release_time.cmp(&b.task.release_time))
        .then_with(|| a.task.id.cmp(&b.task.id))
}

/// Named levels accepted by the CLI in place of a number.
pub fn parse_priority(s: &str) -> Result<i64, String> {
    match s.trim().to_ascii_lowercase().as_str() {
        "low" => Ok(50),
        "medium" => Ok(70),
        "high" => Ok(100),
        other => other
            .parse::<i64>()
            .map_err(|_| format!("expected an integer or low|medium|high, got '{s}'")),
    }
}

fn secs(n: u64) -> Duration {
    Duration::seconds(i64::try_from(n).unwrap_or(i64::MAX))
}
