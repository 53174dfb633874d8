use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const SECONDS_PER_DAY: i64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WateringSchedule {
    pub duration_secs: u64,
    pub delay_interval_secs: i64,
    pub next_fire_time: i64,
}

impl WateringSchedule {
    pub fn starting_at(now: i64, duration_secs: u64, delay_interval_secs: i64) -> Self {
        Self {
            duration_secs,
            delay_interval_secs,
            next_fire_time: now.saturating_add(delay_interval_secs),
        }
    }

    pub fn last_fire_time(&self) -> i64 {
        self.next_fire_time.saturating_sub(self.delay_interval_secs)
    }

    pub fn time_remaining(&self, now: i64) -> i64 {
        self.next_fire_time.saturating_sub(now).max(0)
    }

    pub fn delay_days(&self) -> f64 {
        self.delay_interval_secs as f64 / SECONDS_PER_DAY as f64
    }

    pub fn is_due(&self, now: i64) -> bool {
        now >= self.next_fire_time
    }
}

// Older firmware stored only the next fire time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedRecord {
    pub next_fire_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_interval_secs: Option<i64>,
}

impl From<&WateringSchedule> for PersistedRecord {
    fn from(schedule: &WateringSchedule) -> Self {
        Self {
            next_fire_time: schedule.next_fire_time,
            duration_secs: Some(schedule.duration_secs),
            delay_interval_secs: Some(schedule.delay_interval_secs),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Forward,
    Reverse,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Forward => "forward",
            Self::Reverse => "reverse",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActuatorState {
    Idle,
    Running {
        direction: Direction,
        elapsed: Duration,
    },
}

impl ActuatorState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running { direction, .. } => direction.as_str(),
        }
    }

    pub fn is_running(self) -> bool {
        matches!(self, Self::Running { .. })
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct WateringInfo {
    pub duration: u64,
    pub delay: f64,
    pub time_remaining: i64,
    pub time_remaining_human: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ScheduleUpdate {
    pub duration: u64,
    pub delay: f64,
    pub current_time: i64,
    pub next_watering: i64,
    pub time_remaining: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MotorStatus {
    pub state: &'static str,
    pub fault: Option<String>,
}

pub fn format_countdown(seconds: i64) -> String {
    let seconds = seconds.max(0);
    let days = seconds / SECONDS_PER_DAY;
    let rem = seconds % SECONDS_PER_DAY;
    format!(
        "{} days, {:02}:{:02}:{:02}",
        days,
        rem / 3_600,
        (rem % 3_600) / 60,
        rem % 60
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_fire_is_one_delay_before_next() {
        let schedule = WateringSchedule::starting_at(1_000, 5, 86_400);
        assert_eq!(schedule.next_fire_time, 87_400);
        assert_eq!(schedule.last_fire_time(), 1_000);
    }

    #[test]
    fn time_remaining_never_negative() {
        let schedule = WateringSchedule::starting_at(0, 5, 60);
        assert_eq!(schedule.time_remaining(30), 30);
        assert_eq!(schedule.time_remaining(600), 0);
    }

    #[test]
    fn countdown_formats_days_and_clock() {
        assert_eq!(format_countdown(0), "0 days, 00:00:00");
        assert_eq!(format_countdown(129_600), "1 days, 12:00:00");
        assert_eq!(format_countdown(90_061), "1 days, 01:01:01");
        assert_eq!(format_countdown(-5), "0 days, 00:00:00");
    }

    #[test]
    fn legacy_record_without_schedule_fields_parses() {
        let record: PersistedRecord = serde_json::from_str(r#"{"next_fire_time": 42}"#).unwrap();
        assert_eq!(record.next_fire_time, 42);
        assert_eq!(record.duration_secs, None);
        assert_eq!(record.delay_interval_secs, None);
    }
}
