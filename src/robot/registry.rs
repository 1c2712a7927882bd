#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;

use crate::core::entity::EntityTable;
use crate::error::{DispatchError, EntityKind};
use crate::robot::model::Robot;
use crate::store::Store;

#[derive(Debug)]
pub struct RobotRegistry {
    robots: EntityTable<Robot>,
    store: Arc<dyn Store>,
}

impl RobotRegistry {
    pub fn load(store: Arc<dyn Store>, lock_timeout: Duration) -> Result<Self, DispatchError> {
        let robots = EntityTable::new(EntityKind::Robot, lock_timeout);
        for robot in store.load_robots().map_err(|e| DispatchError::storage(&e))? {
            let id = robot.id.clone();
            robots.insert(&id, robot)?;
        }
        Ok(Self { robots, store })
    }

    /// Adds a robot to the fleet. An id that is already registered keeps its
    /// current state and `false` is returned.
    pub fn register(&self, robot: Robot) -> Result<bool, DispatchError> {
        if self.robots.contains(&robot.id) {
            return Ok(false);
        }
        self.store
            .save_robot(&robot)
            .map_err(|e| DispatchError::storage(&e))?;
        let id = robot.id.clone();
        self.robots.insert(&id, robot)
    }

    pub fn get(&self, id: &str) -> Result<Robot, DispatchError> {
        self.robots.get(id)
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.robots.contains(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.robots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.robots.is_empty()
    }

    /// Every robot, ordered by id.
    pub fn snapshot(&self) -> Result<Vec<Robot>, DispatchError> {
        self.robots.snapshot()
    }

    /// IDLE robots with battery above `threshold`.
    pub fn list_available(&self, threshold: u8) -> Result<Vec<Robot>, DispatchError> {
        Ok(self
            .snapshot()?
            .into_iter()
            .filter(|r| r.is_available(threshold))
            .collect())
    }

    /// IDLE -> MOVING bound to `task_id`.
    pub fn reserve(&self, robot_id: &str, task_id: &str) -> Result<Robot, DispatchError> {
        self.modify(robot_id, |robot| {
            robot.reserve(task_id)?;
            Ok(robot.clone())
        })
    }

    /// Clears the task binding and returns the id that was held.
    pub fn release(&self, robot_id: &str) -> Result<String, DispatchError> {
        self.modify(robot_id, Robot::release)
    }

    /// Applies a telemetry sample. Battery readings above 100 are clamped.
    pub fn update_telemetry(
        &self,
        robot_id: &str,
        location: Option<&str>,
        battery: Option<u8>,
        at: OffsetDateTime,
    ) -> Result<Robot, DispatchError> {
        self.modify(robot_id, |robot| {
            if let Some(location) = location {
                location.clone_into(&mut robot.current_location);
            }
            if let Some(battery) = battery {
                robot.battery_level = battery.min(100);
            }
            robot.last_active = at;
            Ok(robot.clone())
        })
    }

    /// Runs `f` under the robot's lock and writes the result through to the
    /// store before committing it.
    pub(crate) fn modify<R>(
        &self,
        robot_id: &str,
        f: impl FnOnce(&mut Robot) -> Result<R, DispatchError>,
    ) -> Result<R, DispatchError> {
        self.robots.update(robot_id, |robot| {
            let out = f(robot)?;
            self.store
                .save_robot(robot)
                .map_err(|e| DispatchError::storage(&e))?;
            Ok(out)
        })
    }

    pub(crate) fn table(&self) -> &EntityTable<Robot> {
        &self.robots
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::thread;

    use super::*;
    use crate::robot::model::RobotStatus;
    use crate::store::memory::MemoryStore;

    fn registry() -> RobotRegistry {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::default());
        let reg = RobotRegistry::load(store, Duration::from_millis(50)).unwrap();
        let t0 = OffsetDateTime::UNIX_EPOCH;
        reg.register(Robot::new("R1", "Kitchen", 85, t0)).unwrap();
        reg.register(Robot::new("R2", "Kitchen", 25, t0)).unwrap();
        reg
    }

    #[test]
    fn low_battery_robots_are_not_available() {
        let reg = registry();
        let ids: Vec<String> = reg
            .list_available(30)
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, ["R1"]);
    }

    #[test]
    fn register_keeps_existing_state() {
        let reg = registry();
        reg.reserve("R1", "T-1").unwrap();
        let again = reg
            .register(Robot::new("R1", "Reception", 100, OffsetDateTime::UNIX_EPOCH))
            .unwrap();
        assert!(!again);
        assert_eq!(reg.get("R1").unwrap().status, RobotStatus::Moving);
    }

    #[test]
    fn telemetry_clamps_battery_and_always_applies() {
        let reg = registry();
        reg.reserve("R1", "T-1").unwrap();
        let r = reg
            .update_telemetry("R1", Some("Table 2"), Some(140), OffsetDateTime::UNIX_EPOCH)
            .unwrap();
        assert_eq!(r.battery_level, 100);
        assert_eq!(r.current_location, "Table 2");
        assert_eq!(r.current_task_id.as_deref(), Some("T-1"));
    }

    #[test]
    fn release_twice_is_not_assigned() {
        let reg = registry();
        reg.reserve("R1", "T-1").unwrap();
        assert_eq!(reg.release("R1").unwrap(), "T-1");
        assert!(matches!(
            reg.release("R1"),
            Err(DispatchError::RobotNotAssigned(_))
        ));
    }

    #[test]
    fn concurrent_reserve_has_one_winner() {
        let reg = Arc::new(registry());
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|n| {
                let reg = Arc::clone(&reg);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    loop {
                        match reg.reserve("R1", &format!("T-{n}")) {
                            Err(e) if e.is_retryable() => continue,
                            other => return other.is_ok(),
                        }
                    }
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }
}
