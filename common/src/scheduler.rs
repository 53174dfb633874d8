use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use log::{info, warn};

use crate::{
    actuator::{Actuator, ActuatorError, RunOutcome},
    config::{ControllerConfig, MAX_DELAY_SECS, MAX_DURATION_SECS},
    store::ScheduleStore,
    types::{
        format_countdown, PersistedRecord, ScheduleUpdate, WateringInfo, WateringSchedule,
        SECONDS_PER_DAY,
    },
};

pub fn clamp_duration(duration_secs: f64) -> u64 {
    if duration_secs.is_nan() {
        return 1;
    }
    duration_secs.clamp(1.0, MAX_DURATION_SECS as f64) as u64
}

pub fn clamp_delay_secs(delay_days: f64) -> i64 {
    if delay_days.is_nan() {
        return 1;
    }
    // Day fractions rarely multiply back to whole seconds exactly.
    let secs = (delay_days * SECONDS_PER_DAY as f64 * 1e6).round() / 1e6;
    secs.clamp(1.0, MAX_DELAY_SECS as f64) as i64
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FireReport {
    pub fired_at: i64,
    pub next_fire_time: i64,
    pub persisted: bool,
    pub run: Result<RunOutcome, ActuatorError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    NotDue { time_remaining: i64 },
    Fired(FireReport),
}

// The lock is never held while the motor runs.
pub struct Scheduler {
    schedule: Mutex<WateringSchedule>,
    actuator: Arc<dyn Actuator>,
    store: Arc<dyn ScheduleStore>,
    reverse_flush: Duration,
}

impl Scheduler {
    pub fn new(
        schedule: WateringSchedule,
        actuator: Arc<dyn Actuator>,
        store: Arc<dyn ScheduleStore>,
        reverse_flush: Duration,
    ) -> Self {
        Self {
            schedule: Mutex::new(schedule),
            actuator,
            store,
            reverse_flush,
        }
    }

    // A past next fire is skipped unless catch-up is on; one further than a
    // full delay away is pulled back to now + delay.
    pub fn restore(
        config: &ControllerConfig,
        actuator: Arc<dyn Actuator>,
        store: Arc<dyn ScheduleStore>,
        now: i64,
    ) -> Self {
        let loaded = store.load();
        let schedule = match loaded {
            Some(record) => {
                let duration_secs = record
                    .duration_secs
                    .filter(|secs| (1..=MAX_DURATION_SECS).contains(secs))
                    .unwrap_or(config.default_duration_secs);
                let delay_interval_secs = record
                    .delay_interval_secs
                    .filter(|secs| (1..=MAX_DELAY_SECS).contains(secs))
                    .unwrap_or(config.default_delay_secs);
                let mut schedule = WateringSchedule {
                    duration_secs,
                    delay_interval_secs,
                    next_fire_time: record.next_fire_time,
                };

                let horizon = now.saturating_add(delay_interval_secs);
                if schedule.is_due(now) && !config.catch_up_missed_fire {
                    info!(
                        "watering due at {} was missed while offline; next watering at {horizon}",
                        schedule.next_fire_time
                    );
                    schedule.next_fire_time = horizon;
                } else if schedule.next_fire_time > horizon {
                    warn!(
                        "stored next watering {} is beyond one delay from now; clamping to {horizon}",
                        schedule.next_fire_time
                    );
                    schedule.next_fire_time = horizon;
                }
                schedule
            }
            None => WateringSchedule::starting_at(
                now,
                config.default_duration_secs,
                config.default_delay_secs,
            ),
        };

        info!(
            "schedule restored: duration={}s delay={}s next={} ({} remaining)",
            schedule.duration_secs,
            schedule.delay_interval_secs,
            schedule.next_fire_time,
            format_countdown(schedule.time_remaining(now))
        );

        let scheduler = Self::new(
            schedule,
            actuator,
            store,
            Duration::from_secs(config.reverse_flush_secs),
        );
        if loaded != Some(PersistedRecord::from(&schedule)) {
            scheduler.persist(&schedule);
        }
        scheduler
    }

    fn lock(&self) -> MutexGuard<'_, WateringSchedule> {
        self.schedule.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, schedule: &WateringSchedule) -> bool {
        match self.store.save(&PersistedRecord::from(schedule)) {
            Ok(()) => true,
            Err(err) => {
                warn!("failed to persist schedule, keeping in-memory value: {err}");
                false
            }
        }
    }

    pub fn snapshot(&self) -> WateringSchedule {
        *self.lock()
    }

    pub fn status(&self, now: i64) -> WateringInfo {
        let schedule = self.snapshot();
        let time_remaining = schedule.time_remaining(now);
        WateringInfo {
            duration: schedule.duration_secs,
            delay: schedule.delay_days(),
            time_remaining,
            time_remaining_human: format_countdown(time_remaining),
        }
    }

    /// Fires when due. The next fire is advanced and persisted before the
    /// motor runs, so a repeated tick at the same instant is a no-op and a
    /// reboot mid-run does not water twice.
    pub fn tick(&self, now: i64) -> TickOutcome {
        let (fired, persisted) = {
            let mut schedule = self.lock();
            if !schedule.is_due(now) {
                return TickOutcome::NotDue {
                    time_remaining: schedule.time_remaining(now),
                };
            }
            schedule.next_fire_time = now.saturating_add(schedule.delay_interval_secs);
            let fired = *schedule;
            (fired, self.persist(&fired))
        };

        info!(
            "watering for {}s, next watering at {}",
            fired.duration_secs, fired.next_fire_time
        );
        let run = self
            .actuator
            .run_cycle(Duration::from_secs(fired.duration_secs), self.reverse_flush);
        match &run {
            Ok(RunOutcome::Completed { ran }) => info!("watering finished after {ran:?}"),
            Ok(RunOutcome::Stopped { ran }) => info!("watering stopped after {ran:?}"),
            Err(ActuatorError::Busy) => {
                warn!("motor busy with a manual run; scheduled watering skipped")
            }
            Err(err) => warn!("scheduled watering aborted: {err}"),
        }

        TickOutcome::Fired(FireReport {
            fired_at: now,
            next_fire_time: fired.next_fire_time,
            persisted,
            run,
        })
    }

    pub fn update_schedule(&self, duration_secs: f64, delay_days: f64, now: i64) -> ScheduleUpdate {
        let duration_secs = clamp_duration(duration_secs);
        let delay_interval_secs = clamp_delay_secs(delay_days);

        let mut schedule = self.lock();
        let last_fire = schedule.last_fire_time();
        let elapsed = now.saturating_sub(last_fire);
        let next_fire_time = if elapsed >= delay_interval_secs {
            now
        } else {
            // Bounded by one delay from now in case the clock stepped back.
            last_fire
                .saturating_add(delay_interval_secs)
                .min(now.saturating_add(delay_interval_secs))
        };

        *schedule = WateringSchedule {
            duration_secs,
            delay_interval_secs,
            next_fire_time,
        };
        self.persist(&schedule);

        info!(
            "schedule updated: duration={duration_secs}s delay={delay_interval_secs}s next={next_fire_time}"
        );
        ScheduleUpdate {
            duration: duration_secs,
            delay: schedule.delay_days(),
            current_time: now,
            next_watering: next_fire_time,
            time_remaining: schedule.time_remaining(now),
        }
    }
}
