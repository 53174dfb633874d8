use std::{
    io,
    sync::{Arc, Condvar, Mutex, PoisonError},
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{debug, info, warn};

use crate::{
    clock::{Clock, TimeSync, TimeSyncTracker},
    scheduler::{Scheduler, TickOutcome},
};

const SCHEDULE_LOOP_STACK_BYTES: usize = 32 * 1024;

#[derive(Debug, Default)]
pub struct ShutdownSignal {
    triggered: Mutex<bool>,
    wake: Condvar,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        *self.triggered.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.wake.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *self.triggered.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let triggered = self.triggered.lock().unwrap_or_else(PoisonError::into_inner);
        let (triggered, _) = self
            .wake
            .wait_timeout_while(triggered, timeout, |triggered| !*triggered)
            .unwrap_or_else(PoisonError::into_inner);
        *triggered
    }
}

pub struct ScheduleWorker {
    scheduler: Arc<Scheduler>,
    clock: Arc<dyn Clock>,
    time_sync: Box<dyn TimeSync>,
    tracker: TimeSyncTracker,
    poll_interval: Duration,
}

impl ScheduleWorker {
    pub fn new(
        scheduler: Arc<Scheduler>,
        clock: Arc<dyn Clock>,
        time_sync: Box<dyn TimeSync>,
        time_sync_interval_secs: u64,
        poll_interval: Duration,
    ) -> Self {
        Self {
            scheduler,
            clock,
            time_sync,
            tracker: TimeSyncTracker::new(time_sync_interval_secs),
            poll_interval,
        }
    }

    pub fn synced_at(mut self, now: i64) -> Self {
        self.tracker.record_attempt(now);
        self
    }

    pub fn step(&mut self) -> TickOutcome {
        let now = self.clock.now_epoch();
        if self.tracker.is_due(now) {
            match self.time_sync.sync() {
                Ok(()) => debug!("time sync completed"),
                Err(err) => warn!("time sync failed, continuing on local clock: {err}"),
            }
            // Measured after the sync so a corrected clock is the new baseline.
            self.tracker.record_attempt(self.clock.now_epoch());
        }

        self.scheduler.tick(self.clock.now_epoch())
    }

    pub fn run(mut self, shutdown: &ShutdownSignal) {
        info!("schedule loop started");
        while !shutdown.is_triggered() {
            self.step();
            if shutdown.wait_timeout(self.poll_interval) {
                break;
            }
        }
        info!("schedule loop stopped");
    }

    pub fn spawn(self, shutdown: Arc<ShutdownSignal>) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("schedule-loop".into())
            .stack_size(SCHEDULE_LOOP_STACK_BYTES)
            .spawn(move || self.run(&shutdown))
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Instant,
    };

    use super::*;
    use crate::{
        actuator::{
            Actuator, ActuatorError, LineSnapshot, MotorActuator, RecordingActuator,
            SimulatedMotor,
        },
        scheduler::FireReport,
        clock::{ManualClock, TimeSyncError},
        store::MemoryStore,
        types::WateringSchedule,
    };

    struct CountingSync {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    impl TimeSync for CountingSync {
        fn sync(&mut self) -> Result<(), TimeSyncError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(TimeSyncError::Unavailable("no route to pool.ntp.org".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn worker(
        fail_sync: bool,
    ) -> (
        ScheduleWorker,
        Arc<ManualClock>,
        Arc<RecordingActuator>,
        Arc<AtomicUsize>,
    ) {
        let clock = Arc::new(ManualClock::new(0));
        let actuator = Arc::new(RecordingActuator::default());
        let scheduler = Arc::new(Scheduler::new(
            WateringSchedule::starting_at(0, 5, 60),
            actuator.clone(),
            Arc::new(MemoryStore::default()),
            Duration::ZERO,
        ));
        let calls = Arc::new(AtomicUsize::new(0));
        let worker = ScheduleWorker::new(
            scheduler,
            clock.clone(),
            Box::new(CountingSync {
                calls: calls.clone(),
                fail: fail_sync,
            }),
            3_600,
            Duration::from_millis(5),
        );
        (worker, clock, actuator, calls)
    }

    #[test]
    fn signal_wakes_waiter_early() {
        let signal = Arc::new(ShutdownSignal::new());
        let waiter = {
            let signal = signal.clone();
            thread::spawn(move || {
                let started = Instant::now();
                let triggered = signal.wait_timeout(Duration::from_secs(30));
                (triggered, started.elapsed())
            })
        };

        thread::sleep(Duration::from_millis(20));
        signal.trigger();
        let (triggered, waited) = waiter.join().unwrap();

        assert!(triggered);
        assert!(waited < Duration::from_secs(5));
        assert!(!ShutdownSignal::new().wait_timeout(Duration::from_millis(1)));
    }

    #[test]
    fn step_syncs_at_boot_and_once_per_interval() {
        let (mut worker, clock, _, calls) = worker(false);

        worker.step();
        clock.advance(10);
        worker.step();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        clock.advance(3_600);
        worker.step();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn boot_sync_defers_first_loop_sync() {
        let (worker, clock, _, calls) = worker(false);
        let mut worker = worker.synced_at(0);

        clock.advance(10);
        worker.step();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failed_sync_never_blocks_fire() {
        let (mut worker, clock, actuator, calls) = worker(true);
        clock.set(60);

        let outcome = worker.step();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(outcome, TickOutcome::Fired(_)));
        assert_eq!(actuator.runs().len(), 1);
    }

    #[test]
    fn spawned_loop_fires_and_exits_on_shutdown() {
        let (worker, clock, actuator, _) = worker(false);
        clock.set(60);
        let shutdown = Arc::new(ShutdownSignal::new());

        let handle = worker.spawn(shutdown.clone()).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while actuator.runs().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(2));
        }
        shutdown.trigger();
        handle.join().unwrap();

        assert_eq!(actuator.runs().len(), 1);
    }

    #[test]
    fn tick_racing_shutdown_never_energizes_motor() {
        let clock = Arc::new(ManualClock::new(60));
        let motor = SimulatedMotor::new();
        let actuator = Arc::new(MotorActuator::new(
            Box::new(motor.clone()),
            Duration::from_millis(5),
        ));
        let scheduler = Arc::new(Scheduler::new(
            WateringSchedule::starting_at(0, 3, 60),
            actuator.clone(),
            Arc::new(MemoryStore::default()),
            Duration::ZERO,
        ));
        let mut worker = ScheduleWorker::new(
            scheduler,
            clock,
            Box::new(CountingSync {
                calls: Arc::new(AtomicUsize::new(0)),
                fail: false,
            }),
            3_600,
            Duration::from_millis(5),
        );
        let shutdown = ShutdownSignal::new();

        // The loop already passed its shutdown check when these land.
        shutdown.trigger();
        actuator.shutdown();
        let started = Instant::now();
        let outcome = worker.step();

        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(matches!(
            outcome,
            TickOutcome::Fired(FireReport {
                run: Err(ActuatorError::ShuttingDown),
                ..
            })
        ));
        assert!(motor.energized().is_empty());
        assert_eq!(motor.lines(), LineSnapshot::default());
    }
}
