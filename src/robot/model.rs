#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::DispatchError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum RobotStatus {
    Idle,
    Moving,
    Charging,
    Error,
}

impl RobotStatus {
    pub const ALL: [Self; 4] = [Self::Idle, Self::Moving, Self::Charging, Self::Error];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Moving => "MOVING",
            Self::Charging => "CHARGING",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for RobotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RobotCommand {
    ReturnToBase,
    StartCharging,
}

impl RobotCommand {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReturnToBase => "RETURN_TO_BASE",
            Self::StartCharging => "START_CHARGING",
        }
    }
}

impl fmt::Display for RobotCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RobotCommand {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "RETURN_TO_BASE" => Ok(Self::ReturnToBase),
            "START_CHARGING" => Ok(Self::StartCharging),
            _ => Err(DispatchError::InvalidCommand(s.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Robot {
    pub id: String,
    pub current_location: String,
    pub battery_level: u8,
    pub status: RobotStatus,
    pub current_task_id: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub last_active: OffsetDateTime,
    #[serde(default)]
    pub last_error: Option<String>,
}

impl Robot {
    #[must_use]
    pub fn new(id: &str, location: &str, battery: u8, at: OffsetDateTime) -> Self {
        Self {
            id: id.to_owned(),
            current_location: location.to_owned(),
            battery_level: battery.min(100),
            status: RobotStatus::Idle,
            current_task_id: None,
            last_active: at,
            last_error: None,
        }
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.status == RobotStatus::Idle && self.current_task_id.is_none()
    }

    #[must_use]
    pub fn needs_charge(&self, threshold: u8) -> bool {
        self.battery_level <= threshold
    }

    /// Idle with battery above the charging threshold.
    #[must_use]
    pub fn is_available(&self, threshold: u8) -> bool {
        self.is_idle() && !self.needs_charge(threshold)
    }

    pub(crate) fn reserve(&mut self, task_id: &str) -> Result<(), DispatchError> {
        if !self.is_idle() {
            return Err(self.unavailable());
        }
        self.status = RobotStatus::Moving;
        self.current_task_id = Some(task_id.to_owned());
        Ok(())
    }

    pub(crate) fn release(&mut self) -> Result<String, DispatchError> {
        let task_id = self
            .current_task_id
            .take()
            .ok_or_else(|| DispatchError::RobotNotAssigned(self.id.clone()))?;
        if self.status == RobotStatus::Moving {
            self.status = RobotStatus::Idle;
        }
        Ok(task_id)
    }

    pub(crate) fn unavailable(&self) -> DispatchError {
        DispatchError::RobotUnavailable {
            robot_id: self.id.clone(),
            status: self.status,
        }
    }
}

/// Robot row with its charging view, for listings.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RobotView {
    #[serde(flatten)]
    pub robot: Robot,
    pub available: bool,
    pub needs_charge: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn robot() -> Robot {
        Robot::new("R1", "Kitchen", 85, OffsetDateTime::UNIX_EPOCH)
    }

    #[test]
    fn reserve_only_from_idle() {
        let mut r = robot();
        r.reserve("T-1").unwrap();
        assert_eq!(r.status, RobotStatus::Moving);
        assert_eq!(r.current_task_id.as_deref(), Some("T-1"));

        let err = r.reserve("T-2").unwrap_err();
        assert!(matches!(err, DispatchError::RobotUnavailable { .. }));
        assert_eq!(r.current_task_id.as_deref(), Some("T-1"));
    }

    #[test]
    fn release_requires_assignment() {
        let mut r = robot();
        assert!(matches!(
            r.release(),
            Err(DispatchError::RobotNotAssigned(_))
        ));
        r.reserve("T-1").unwrap();
        assert_eq!(r.release().unwrap(), "T-1");
        assert!(r.is_idle());
    }

    #[test]
    fn availability_respects_threshold() {
        let mut r = robot();
        assert!(r.is_available(30));
        r.battery_level = 30;
        assert!(!r.is_available(30));
        assert!(r.needs_charge(30));
    }

    #[test]
    fn parses_commands() {
        assert_eq!(
            "return-to-base".parse::<RobotCommand>().unwrap(),
            RobotCommand::ReturnToBase
        );
        assert_eq!(
            "START_CHARGING".parse::<RobotCommand>().unwrap(),
            RobotCommand::StartCharging
        );
        assert!("DANCE".parse::<RobotCommand>().is_err());
    }
}
