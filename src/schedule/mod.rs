// dbbackup/src/schedule/mod.rs
pub(crate) mod next_run;
pub(crate) mod registry;

use chrono::{DateTime, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::{BackupError, Result};

pub use next_run::compute_next_run;
pub use registry::SchedulerRegistry;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Cadence {
    Daily,
    Weekly,
    Monthly,
}

/// Outcome of the most recent run of a schedule.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LastRunStatus {
    #[serde(rename = "none")]
    #[strum(serialize = "none")]
    NotRun,
    Success,
    Failed,
    InProgress,
}

/// Local wall-clock time, minute precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay(NaiveTime);

impl TimeOfDay {
    pub fn new(hour: u32, minute: u32) -> Result<Self> {
        NaiveTime::from_hms_opt(hour, minute, 0)
            .map(TimeOfDay)
            .ok_or_else(|| {
                BackupError::ScheduleConfig(format!(
                    "time_of_day {:02}:{:02} is not a valid wall-clock time",
                    hour, minute
                ))
            })
    }

    pub fn hour(&self) -> u32 {
        self.0.hour()
    }

    pub fn minute(&self) -> u32 {
        self.0.minute()
    }

    pub fn as_naive(&self) -> NaiveTime {
        self.0
    }
}

impl FromStr for TimeOfDay {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || {
            BackupError::ScheduleConfig(format!("time_of_day must be formatted HH:MM, got '{}'", s))
        };
        let (hour, minute) = s.trim().split_once(':').ok_or_else(invalid)?;
        if hour.is_empty() || hour.len() > 2 || minute.len() != 2 {
            return Err(invalid());
        }
        let hour: u32 = hour.parse().map_err(|_| invalid())?;
        let minute: u32 = minute.parse().map_err(|_| invalid())?;
        TimeOfDay::new(hour, minute)
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour(), self.minute())
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = BackupError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<TimeOfDay> for String {
    fn from(value: TimeOfDay) -> Self {
        value.to_string()
    }
}

/// Cadence together with the field that is meaningful for it.
/// `day_of_week` counts from Sunday = 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "cadence", rename_all = "snake_case")]
pub enum Recurrence {
    Daily,
    Weekly { day_of_week: u8 },
    Monthly { day_of_month: u8 },
}

impl Recurrence {
    pub fn cadence(&self) -> Cadence {
        match self {
            Recurrence::Daily => Cadence::Daily,
            Recurrence::Weekly { .. } => Cadence::Weekly,
            Recurrence::Monthly { .. } => Cadence::Monthly,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ScheduleRule {
    #[serde(flatten)]
    pub recurrence: Recurrence,
    pub time_of_day: TimeOfDay,
}

impl ScheduleRule {
    /// Validates the cadence-specific fields. Fields that do not apply to the
    /// cadence are ignored.
    pub fn new(
        cadence: Cadence,
        time_of_day: TimeOfDay,
        day_of_week: Option<i64>,
        day_of_month: Option<i64>,
    ) -> Result<Self> {
        let recurrence = match cadence {
            Cadence::Daily => Recurrence::Daily,
            Cadence::Weekly => match day_of_week {
                Some(day) if (0..=6).contains(&day) => Recurrence::Weekly {
                    day_of_week: day as u8,
                },
                Some(day) => {
                    return Err(BackupError::ScheduleConfig(format!(
                        "day_of_week must be between 0 and 6, got {}",
                        day
                    )));
                }
                None => {
                    return Err(BackupError::ScheduleConfig(
                        "weekly schedules require day_of_week (0-6)".to_string(),
                    ));
                }
            },
            Cadence::Monthly => match day_of_month {
                Some(day) if (1..=28).contains(&day) => Recurrence::Monthly {
                    day_of_month: day as u8,
                },
                Some(day) => {
                    return Err(BackupError::ScheduleConfig(format!(
                        "day_of_month must be between 1 and 28, got {}",
                        day
                    )));
                }
                None => {
                    return Err(BackupError::ScheduleConfig(
                        "monthly schedules require day_of_month (1-28)".to_string(),
                    ));
                }
            },
        };
        Ok(ScheduleRule {
            recurrence,
            time_of_day,
        })
    }

    pub fn day_of_week(&self) -> Option<u8> {
        match self.recurrence {
            Recurrence::Weekly { day_of_week } => Some(day_of_week),
            _ => None,
        }
    }

    pub fn day_of_month(&self) -> Option<u8> {
        match self.recurrence {
            Recurrence::Monthly { day_of_month } => Some(day_of_month),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackupSchedule {
    pub owner: String,
    #[serde(flatten)]
    pub rule: ScheduleRule,
    pub enabled: bool,
    pub remote_folder_ref: Option<String>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_run_status: LastRunStatus,
    pub last_run_error: Option<String>,
    pub next_run_at: Option<DateTime<Utc>>,
}

impl BackupSchedule {
    pub fn new(owner: impl Into<String>, rule: ScheduleRule) -> Self {
        BackupSchedule {
            owner: owner.into(),
            rule,
            enabled: true,
            remote_folder_ref: None,
            last_run_at: None,
            last_run_status: LastRunStatus::NotRun,
            last_run_error: None,
            next_run_at: None,
        }
    }

    /// True when the timer-relevant configuration differs.
    pub fn timer_config_differs(&self, other: &BackupSchedule) -> bool {
        self.rule != other.rule || self.enabled != other.enabled
    }
}

/// Create/update payload for a schedule, as sent by the web UI.
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleRequest {
    pub owner: String,
    pub cadence: Cadence,
    pub time_of_day: String,
    pub day_of_week: Option<i64>,
    pub day_of_month: Option<i64>,
    pub enabled: bool,
    pub remote_folder_ref: Option<String>,
}

impl ScheduleRequest {
    pub fn validate(&self) -> Result<BackupSchedule> {
        let owner = self.owner.trim();
        if owner.is_empty() {
            return Err(BackupError::ScheduleConfig(
                "owner must not be empty".to_string(),
            ));
        }
        let time_of_day: TimeOfDay = self.time_of_day.parse()?;
        let rule = ScheduleRule::new(
            self.cadence,
            time_of_day,
            self.day_of_week,
            self.day_of_month,
        )?;
        let mut schedule = BackupSchedule::new(owner, rule);
        schedule.enabled = self.enabled;
        schedule.remote_folder_ref = self
            .remote_folder_ref
            .as_ref()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        Ok(schedule)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(cadence: Cadence, dow: Option<i64>, dom: Option<i64>) -> ScheduleRequest {
        ScheduleRequest {
            owner: "acme".to_string(),
            cadence,
            time_of_day: "02:00".to_string(),
            day_of_week: dow,
            day_of_month: dom,
            enabled: true,
            remote_folder_ref: None,
        }
    }

    #[test]
    fn time_of_day_parses_and_formats() {
        let t: TimeOfDay = "2:05".parse().unwrap();
        assert_eq!((t.hour(), t.minute()), (2, 5));
        assert_eq!(t.to_string(), "02:05");
        assert!("24:00".parse::<TimeOfDay>().is_err());
        assert!("12:60".parse::<TimeOfDay>().is_err());
        assert!("1200".parse::<TimeOfDay>().is_err());
        assert!("12:5".parse::<TimeOfDay>().is_err());
    }

    #[test]
    fn weekly_requires_day_of_week_in_range() {
        assert!(request(Cadence::Weekly, Some(0), None).validate().is_ok());
        assert!(request(Cadence::Weekly, Some(6), None).validate().is_ok());
        for bad in [request(Cadence::Weekly, Some(7), None), request(Cadence::Weekly, None, None)] {
            let err = bad.validate().unwrap_err();
            assert!(matches!(err, BackupError::ScheduleConfig(_)), "{err}");
        }
    }

    #[test]
    fn monthly_requires_day_of_month_in_range() {
        assert!(request(Cadence::Monthly, None, Some(1)).validate().is_ok());
        assert!(request(Cadence::Monthly, None, Some(28)).validate().is_ok());
        assert!(request(Cadence::Monthly, None, Some(29)).validate().is_err());
        assert!(request(Cadence::Monthly, None, Some(0)).validate().is_err());
        assert!(request(Cadence::Monthly, Some(3), None).validate().is_err());
    }

    #[test]
    fn daily_ignores_unrelated_fields() {
        let schedule = request(Cadence::Daily, Some(42), Some(99)).validate().unwrap();
        assert_eq!(schedule.rule.recurrence, Recurrence::Daily);
        assert_eq!(schedule.rule.day_of_week(), None);
        assert_eq!(schedule.rule.day_of_month(), None);
    }

    #[test]
    fn blank_owner_and_folder_are_normalized() {
        let mut req = request(Cadence::Daily, None, None);
        req.remote_folder_ref = Some("  ".to_string());
        assert_eq!(req.validate().unwrap().remote_folder_ref, None);

        req.owner = "   ".to_string();
        assert!(matches!(req.validate(), Err(BackupError::ScheduleConfig(_))));
    }

    #[test]
    fn schedule_serializes_flat() {
        let schedule = request(Cadence::Weekly, Some(0), None).validate().unwrap();
        let json = serde_json::to_value(&schedule).unwrap();
        assert_eq!(json["cadence"], "weekly");
        assert_eq!(json["day_of_week"], 0);
        assert_eq!(json["time_of_day"], "02:00");
        assert_eq!(json["last_run_status"], "none");
    }

    #[test]
    fn status_strings_round_trip_through_strum() {
        assert_eq!(LastRunStatus::NotRun.to_string(), "none");
        assert_eq!(LastRunStatus::InProgress.to_string(), "in_progress");
        assert_eq!("failed".parse::<LastRunStatus>().unwrap(), LastRunStatus::Failed);
        assert_eq!("monthly".parse::<Cadence>().unwrap(), Cadence::Monthly);
    }
}
