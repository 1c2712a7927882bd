#![forbid(unsafe_code)]

//! Task lifecycle. Every state change goes through [`Task::transition`], which
//! checks the edge against [`TaskState::can_transition_to`] before writing.

use time::OffsetDateTime;

use crate::error::DispatchError;
use crate::task::model::{Task, TaskState};

/// Whether a WAITING task may move on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Blocked,
    DependencyFailed(String),
}

impl TaskState {
    #[must_use]
    pub fn can_transition_to(self, to: Self) -> bool {
        use TaskState::{Claimed, Done, Failed, Paused, Ready, Running, Waiting};
        matches!(
            (self, to),
            (Waiting, Ready)
                | (Ready, Claimed)
                | (Claimed, Running)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Done)
                | (Waiting | Ready | Claimed | Running | Paused, Failed)
        )
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// States in which the task holds a robot.
    #[must_use]
    pub fn holds_robot(self) -> bool {
        matches!(self, Self::Claimed | Self::Running | Self::Paused)
    }
}

impl Task {
    /// Moves the task along one edge of the lifecycle. On error nothing changes.
    pub fn transition(&mut self, to: TaskState) -> Result<(), DispatchError> {
        if !self.state.can_transition_to(to) {
            return Err(self.invalid(to));
        }
        self.state = to;
        Ok(())
    }

    /// Released and every dependency DONE. A FAILED dependency wins over the
    /// release time. Unknown dependency ids block.
    pub fn readiness(
        &self,
        now: OffsetDateTime,
        state_of: impl Fn(&str) -> Option<TaskState>,
    ) -> Readiness {
        let mut blocked = self.release_time > now;
        for dep in &self.depends_on {
            match state_of(dep) {
                Some(TaskState::Failed) => return Readiness::DependencyFailed(dep.clone()),
                Some(TaskState::Done) => {}
                _ => blocked = true,
            }
        }
        if blocked {
            Readiness::Blocked
        } else {
            Readiness::Ready
        }
    }

    pub(crate) fn invalid(&self, to: TaskState) -> DispatchError {
        DispatchError::InvalidTransition {
            task_id: self.id.clone(),
            from: self.state,
            to,
        }
    }

    /// READY -> CLAIMED, binding the robot.
    pub(crate) fn claim(&mut self, robot_id: &str) -> Result<(), DispatchError> {
        self.transition(TaskState::Claimed)?;
        self.assigned_robot = Some(robot_id.to_owned());
        self.current_step = 0;
        Ok(())
    }

    /// Advances the waypoint counter while RUNNING.
    pub(crate) fn confirm_step(&mut self) -> Result<usize, DispatchError> {
        if self.state != TaskState::Running {
            return Err(self.invalid(TaskState::Running));
        }
        if self.all_steps_confirmed() {
            return Err(DispatchError::StepOutOfRange {
                task_id: self.id.clone(),
                step: self.current_step + 1,
                total: self.waypoints.len(),
            });
        }
        self.current_step += 1;
        Ok(self.current_step)
    }

    /// RUNNING -> DONE once the final waypoint has been confirmed.
    pub(crate) fn finish(&mut self, at: OffsetDateTime) -> Result<(), DispatchError> {
        if self.state != TaskState::Running || !self.all_steps_confirmed() {
            return Err(self.invalid(TaskState::Done));
        }
        self.transition(TaskState::Done)?;
        self.unbind(at);
        Ok(())
    }

    /// Any non-terminal state -> FAILED.
    pub(crate) fn fail(
        &mut self,
        reason: &str,
        at: OffsetDateTime,
    ) -> Result<(), DispatchError> {
        self.transition(TaskState::Failed)?;
        self.last_error = Some(reason.to_owned());
        self.unbind(at);
        Ok(())
    }

    fn unbind(&mut self, at: OffsetDateTime) {
        if let Some(robot) = self.assigned_robot.take() {
            self.last_robot = Some(robot);
        }
        self.completed_at = Some(at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::model::TaskType;

    fn task(state: TaskState) -> Task {
        let now = OffsetDateTime::UNIX_EPOCH;
        Task {
            id: "T-1".to_owned(),
            task_type: TaskType::Delivery,
            base_priority: 50,
            release_time: now,
            deadline: None,
            operator_override: 0,
            override_history: Vec::new(),
            waypoints: vec!["Kitchen".to_owned(), "Table 2".to_owned()],
            start_location: None,
            depends_on: Vec::new(),
            state,
            assigned_robot: None,
            current_step: 0,
            created_at: now,
            completed_at: None,
            last_robot: None,
            last_error: None,
        }
    }

    #[test]
    fn only_table_edges_are_legal() {
        let legal = [
            (TaskState::Waiting, TaskState::Ready),
            (TaskState::Ready, TaskState::Claimed),
            (TaskState::Claimed, TaskState::Running),
            (TaskState::Running, TaskState::Paused),
            (TaskState::Paused, TaskState::Running),
            (TaskState::Running, TaskState::Done),
            (TaskState::Waiting, TaskState::Failed),
            (TaskState::Ready, TaskState::Failed),
            (TaskState::Claimed, TaskState::Failed),
            (TaskState::Running, TaskState::Failed),
            (TaskState::Paused, TaskState::Failed),
        ];
        for from in TaskState::ALL {
            for to in TaskState::ALL {
                let expected = legal.contains(&(from, to));
                assert_eq!(from.can_transition_to(to), expected, "{from} -> {to}");
            }
        }
    }

    #[test]
    fn illegal_transition_leaves_state_untouched() {
        for from in TaskState::ALL {
            for to in TaskState::ALL {
                if from.can_transition_to(to) {
                    continue;
                }
                let mut t = task(from);
                let before = t.clone();
                let err = t.transition(to).unwrap_err();
                assert!(matches!(err, DispatchError::InvalidTransition { .. }));
                assert_eq!(t, before);
            }
        }
    }

    #[test]
    fn confirm_step_stops_at_last_waypoint() {
        let mut t = task(TaskState::Running);
        assert_eq!(t.confirm_step().unwrap(), 1);
        assert_eq!(t.confirm_step().unwrap(), 2);
        let err = t.confirm_step().unwrap_err();
        assert!(matches!(
            err,
            DispatchError::StepOutOfRange { step: 3, total: 2, .. }
        ));
        assert_eq!(t.current_step, 2);
        assert_eq!(t.state, TaskState::Running);
    }

    #[test]
    fn confirm_step_requires_running() {
        let mut t = task(TaskState::Paused);
        assert!(matches!(
            t.confirm_step(),
            Err(DispatchError::InvalidTransition { .. })
        ));
        assert_eq!(t.current_step, 0);
    }

    #[test]
    fn finish_requires_every_waypoint() {
        let mut t = task(TaskState::Running);
        t.assigned_robot = Some("R1".to_owned());
        assert!(t.finish(OffsetDateTime::UNIX_EPOCH).is_err());
        assert_eq!(t.state, TaskState::Running);

        t.current_step = 2;
        t.finish(OffsetDateTime::UNIX_EPOCH).unwrap();
        assert_eq!(t.state, TaskState::Done);
        assert_eq!(t.assigned_robot, None);
        assert_eq!(t.last_robot.as_deref(), Some("R1"));
    }

    #[test]
    fn readiness_follows_release_and_dependencies() {
        let t0 = OffsetDateTime::UNIX_EPOCH;
        let mut t = task(TaskState::Waiting);
        t.release_time = t0 + time::Duration::minutes(5);
        assert_eq!(t.readiness(t0, |_| None), Readiness::Blocked);
        assert_eq!(
            t.readiness(t0 + time::Duration::minutes(5), |_| None),
            Readiness::Ready
        );

        t.depends_on = vec!["T-0".to_owned(), "T-9".to_owned()];
        let later = t0 + time::Duration::hours(1);
        let states = |id: &str| match id {
            "T-0" => Some(TaskState::Done),
            _ => None,
        };
        assert_eq!(t.readiness(later, states), Readiness::Blocked);

        let states = |id: &str| match id {
            "T-0" => Some(TaskState::Done),
            _ => Some(TaskState::Failed),
        };
        assert_eq!(
            t.readiness(t0, states),
            Readiness::DependencyFailed("T-9".to_owned())
        );
    }

    #[test]
    fn terminal_tasks_cannot_fail_again() {
        let mut t = task(TaskState::Done);
        assert!(t.fail("late error", OffsetDateTime::UNIX_EPOCH).is_err());
        assert_eq!(t.last_error, None);
    }
}
