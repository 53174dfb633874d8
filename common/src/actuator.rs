use std::{
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use log::{debug, info, warn};
use thiserror::Error;

use crate::types::{ActuatorState, Direction};

pub const FULL_DUTY: u16 = u16::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LineDirection {
    Forward,
    Reverse,
    #[default]
    Stopped,
}

impl From<Direction> for LineDirection {
    fn from(direction: Direction) -> Self {
        match direction {
            Direction::Forward => Self::Forward,
            Direction::Reverse => Self::Reverse,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DriverError {
    #[error("line write failed: {0}")]
    Write(String),
    #[error("hardware fault: {0}")]
    Fault(String),
}

impl DriverError {
    fn detail(&self) -> &str {
        match self {
            Self::Write(detail) | Self::Fault(detail) => detail,
        }
    }
}

pub trait MotorDriver: Send {
    fn set_direction(&mut self, direction: LineDirection) -> Result<(), DriverError>;

    fn set_duty(&mut self, duty: u16) -> Result<(), DriverError>;

    fn check_fault(&mut self) -> Result<(), DriverError> {
        Ok(())
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ActuatorError {
    #[error("motor busy")]
    Busy,
    #[error("motor shut down")]
    ShuttingDown,
    #[error("motor fault: {0}")]
    Fault(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed { ran: Duration },
    Stopped { ran: Duration },
}

impl RunOutcome {
    pub fn ran(self) -> Duration {
        match self {
            Self::Completed { ran } | Self::Stopped { ran } => ran,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Phase {
    pub direction: Direction,
    pub duration: Duration,
}

pub trait Actuator: Send + Sync {
    fn run_phases(&self, phases: &[Phase]) -> Result<RunOutcome, ActuatorError>;

    /// Cancels the active run, if any, and forces the outputs off before
    /// returning. A stop that arrives while idle does not affect later runs.
    fn stop(&self);

    /// Like `stop`, but every later run is refused with `ShuttingDown`.
    fn shutdown(&self);

    fn state(&self) -> ActuatorState;

    fn fault(&self) -> Option<String>;

    fn run_cycle(&self, duration: Duration, reverse_flush: Duration) -> Result<RunOutcome, ActuatorError> {
        self.run_phases(&[
            Phase {
                direction: Direction::Forward,
                duration,
            },
            Phase {
                direction: Direction::Reverse,
                duration: reverse_flush,
            },
        ])
    }

    fn run(&self, direction: Direction, duration: Duration) -> Result<RunOutcome, ActuatorError> {
        self.run_phases(&[Phase {
            direction,
            duration,
        }])
    }
}

#[derive(Debug, Clone, Copy)]
struct ActiveRun {
    direction: Direction,
    started: Instant,
}

#[derive(Debug, Default)]
struct RunSlot {
    active: Option<ActiveRun>,
    cancel: bool,
    closed: bool,
    fault: Option<String>,
}

enum PhaseEnd {
    Elapsed,
    Cancelled,
}

// Lock order is slot, then driver.
pub struct MotorActuator {
    driver: Mutex<Box<dyn MotorDriver>>,
    slot: Mutex<RunSlot>,
    wake: Condvar,
    fault_check_interval: Duration,
}

impl MotorActuator {
    pub fn new(driver: Box<dyn MotorDriver>, fault_check_interval: Duration) -> Self {
        let actuator = Self {
            driver: Mutex::new(driver),
            slot: Mutex::new(RunSlot::default()),
            wake: Condvar::new(),
            fault_check_interval: fault_check_interval.max(Duration::from_millis(1)),
        };
        actuator.force_off();
        actuator
    }

    fn lock_driver(&self) -> MutexGuard<'_, Box<dyn MotorDriver>> {
        self.driver.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_slot(&self) -> MutexGuard<'_, RunSlot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn force_off(&self) {
        let mut driver = self.lock_driver();
        if let Err(err) = driver.set_duty(0) {
            warn!("failed to zero motor duty: {err}");
        }
        if let Err(err) = driver.set_direction(LineDirection::Stopped) {
            warn!("failed to release motor direction lines: {err}");
        }
    }

    fn cancel_and_force_off(&self, close: bool) {
        let mut slot = self.lock_slot();
        slot.closed |= close;
        if slot.active.is_some() {
            slot.cancel = true;
            self.wake.notify_all();
        }
        self.force_off();
    }

    fn latch_fault(&self, err: DriverError) -> ActuatorError {
        warn!("motor fault, forcing outputs off: {err}");
        let detail = err.detail().to_string();
        self.lock_slot().fault = Some(detail.clone());
        ActuatorError::Fault(detail)
    }

    fn begin_phase(&self, direction: Direction) -> Result<bool, ActuatorError> {
        let result = {
            let mut slot = self.lock_slot();
            if slot.cancel {
                return Ok(false);
            }
            if let Some(run) = slot.active.as_mut() {
                run.direction = direction;
            }

            let mut driver = self.lock_driver();
            driver
                .set_duty(0)
                .and_then(|()| driver.set_direction(direction.into()))
                .and_then(|()| driver.set_duty(FULL_DUTY))
        };
        result.map_err(|err| self.latch_fault(err))?;
        debug!("motor phase started: {}", direction.as_str());
        Ok(true)
    }

    fn hold_phase(&self, duration: Duration) -> Result<PhaseEnd, ActuatorError> {
        let deadline = Instant::now() + duration;
        loop {
            let slot = self.lock_slot();
            if slot.cancel {
                return Ok(PhaseEnd::Cancelled);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(PhaseEnd::Elapsed);
            }

            let wait = (deadline - now).min(self.fault_check_interval);
            let (slot, _) = self
                .wake
                .wait_timeout_while(slot, wait, |slot| !slot.cancel)
                .unwrap_or_else(PoisonError::into_inner);
            if slot.cancel {
                return Ok(PhaseEnd::Cancelled);
            }
            drop(slot);

            let check = self.lock_driver().check_fault();
            check.map_err(|err| self.latch_fault(err))?;
        }
    }
}

struct RunGuard<'a> {
    actuator: &'a MotorActuator,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.actuator.force_off();
        let mut slot = self.actuator.lock_slot();
        slot.active = None;
        slot.cancel = false;
    }
}

impl Actuator for MotorActuator {
    fn run_phases(&self, phases: &[Phase]) -> Result<RunOutcome, ActuatorError> {
        let Some(first) = phases.iter().find(|phase| !phase.duration.is_zero()) else {
            return Ok(RunOutcome::Completed {
                ran: Duration::ZERO,
            });
        };

        let started = Instant::now();
        {
            let mut slot = self.lock_slot();
            if slot.closed {
                return Err(ActuatorError::ShuttingDown);
            }
            if slot.active.is_some() {
                return Err(ActuatorError::Busy);
            }
            slot.active = Some(ActiveRun {
                direction: first.direction,
                started,
            });
            slot.cancel = false;
            slot.fault = None;
        }
        let _guard = RunGuard { actuator: self };

        for phase in phases.iter().filter(|phase| !phase.duration.is_zero()) {
            if !self.begin_phase(phase.direction)? {
                return Ok(RunOutcome::Stopped {
                    ran: started.elapsed(),
                });
            }
            if let PhaseEnd::Cancelled = self.hold_phase(phase.duration)? {
                info!("motor run stopped after {:?}", started.elapsed());
                return Ok(RunOutcome::Stopped {
                    ran: started.elapsed(),
                });
            }
        }

        Ok(RunOutcome::Completed {
            ran: started.elapsed(),
        })
    }

    fn stop(&self) {
        self.cancel_and_force_off(false);
    }

    fn shutdown(&self) {
        self.cancel_and_force_off(true);
        info!("motor closed for shutdown");
    }

    fn state(&self) -> ActuatorState {
        match self.lock_slot().active {
            Some(run) => ActuatorState::Running {
                direction: run.direction,
                elapsed: run.started.elapsed(),
            },
            None => ActuatorState::Idle,
        }
    }

    fn fault(&self) -> Option<String> {
        self.lock_slot().fault.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LineSnapshot {
    pub direction: LineDirection,
    pub duty: u16,
}

#[derive(Debug, Default)]
struct SimulatedLines {
    current: LineSnapshot,
    history: Vec<LineSnapshot>,
    pending_fault: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SimulatedMotor {
    lines: Arc<Mutex<SimulatedLines>>,
}

impl SimulatedMotor {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SimulatedLines> {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn lines(&self) -> LineSnapshot {
        self.lock().current
    }

    pub fn history(&self) -> Vec<LineSnapshot> {
        self.lock().history.clone()
    }

    pub fn energized(&self) -> Vec<LineDirection> {
        let mut phases: Vec<LineDirection> = Vec::new();
        let mut previous = LineSnapshot::default();
        for snapshot in self.lock().history.iter().copied() {
            if snapshot.duty > 0 && previous.duty == 0 {
                phases.push(snapshot.direction);
            }
            previous = snapshot;
        }
        phases
    }

    pub fn inject_fault(&self, detail: &str) {
        self.lock().pending_fault = Some(detail.to_string());
    }
}

impl MotorDriver for SimulatedMotor {
    fn set_direction(&mut self, direction: LineDirection) -> Result<(), DriverError> {
        let mut lines = self.lock();
        lines.current.direction = direction;
        let snapshot = lines.current;
        lines.history.push(snapshot);
        debug!("simulated motor lines: {snapshot:?}");
        Ok(())
    }

    fn set_duty(&mut self, duty: u16) -> Result<(), DriverError> {
        let mut lines = self.lock();
        lines.current.duty = duty;
        let snapshot = lines.current;
        lines.history.push(snapshot);
        debug!("simulated motor lines: {snapshot:?}");
        Ok(())
    }

    fn check_fault(&mut self) -> Result<(), DriverError> {
        match self.lock().pending_fault.take() {
            Some(detail) => Err(DriverError::Fault(detail)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
pub(crate) use recording::RecordingActuator;

#[cfg(test)]
mod recording {
    use super::*;

    #[derive(Debug, Default)]
    pub(crate) struct RecordingActuator {
        runs: Mutex<Vec<Vec<Phase>>>,
        reject: Mutex<Option<ActuatorError>>,
        stops: Mutex<usize>,
    }

    impl RecordingActuator {
        pub(crate) fn runs(&self) -> Vec<Vec<Phase>> {
            self.runs.lock().unwrap().clone()
        }

        pub(crate) fn stops(&self) -> usize {
            *self.stops.lock().unwrap()
        }

        pub(crate) fn reject_with(&self, err: Option<ActuatorError>) {
            *self.reject.lock().unwrap() = err;
        }
    }

    impl Actuator for RecordingActuator {
        fn run_phases(&self, phases: &[Phase]) -> Result<RunOutcome, ActuatorError> {
            if let Some(err) = self.reject.lock().unwrap().clone() {
                return Err(err);
            }
            let phases: Vec<Phase> = phases
                .iter()
                .copied()
                .filter(|phase| !phase.duration.is_zero())
                .collect();
            let ran = phases.iter().map(|phase| phase.duration).sum();
            self.runs.lock().unwrap().push(phases);
            Ok(RunOutcome::Completed { ran })
        }

        fn stop(&self) {
            *self.stops.lock().unwrap() += 1;
        }

        fn shutdown(&self) {
            self.stop();
        }

        fn state(&self) -> ActuatorState {
            ActuatorState::Idle
        }

        fn fault(&self) -> Option<String> {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;

    const OFF: LineSnapshot = LineSnapshot {
        direction: LineDirection::Stopped,
        duty: 0,
    };

    fn actuator() -> (Arc<MotorActuator>, SimulatedMotor) {
        let motor = SimulatedMotor::new();
        let actuator = MotorActuator::new(Box::new(motor.clone()), Duration::from_millis(5));
        (Arc::new(actuator), motor)
    }

    #[test]
    fn outputs_forced_off_at_construction() {
        let (_actuator, motor) = actuator();
        assert_eq!(motor.lines(), OFF);
        assert_eq!(motor.history().len(), 2);
    }

    #[test]
    fn cycle_runs_forward_then_reverse_flush_then_stops() {
        let (actuator, motor) = actuator();

        let outcome = actuator
            .run_cycle(Duration::from_millis(30), Duration::from_millis(20))
            .unwrap();

        assert!(matches!(outcome, RunOutcome::Completed { .. }));
        assert!(outcome.ran() >= Duration::from_millis(50));
        assert_eq!(
            motor.energized(),
            vec![LineDirection::Forward, LineDirection::Reverse]
        );
        assert_eq!(motor.lines(), OFF);
        assert_eq!(actuator.state(), ActuatorState::Idle);
    }

    #[test]
    fn zero_flush_skips_reverse_phase() {
        let (actuator, motor) = actuator();

        actuator
            .run_cycle(Duration::from_millis(10), Duration::ZERO)
            .unwrap();

        assert_eq!(motor.energized(), vec![LineDirection::Forward]);
        assert_eq!(motor.lines(), OFF);
    }

    #[test]
    fn stop_aborts_run_long_before_duration() {
        let (actuator, motor) = actuator();
        let runner = {
            let actuator = actuator.clone();
            thread::spawn(move || actuator.run(Direction::Forward, Duration::from_secs(30)))
        };

        while !actuator.state().is_running() {
            thread::sleep(Duration::from_millis(1));
        }
        let stopped_at = Instant::now();
        actuator.stop();
        let outcome = runner.join().unwrap().unwrap();

        assert!(matches!(outcome, RunOutcome::Stopped { .. }));
        assert!(stopped_at.elapsed() < Duration::from_secs(2));
        assert_eq!(motor.lines(), OFF);
        assert_eq!(actuator.state(), ActuatorState::Idle);
    }

    #[test]
    fn overlapping_run_is_rejected() {
        let (actuator, motor) = actuator();
        let runner = {
            let actuator = actuator.clone();
            thread::spawn(move || actuator.run(Direction::Forward, Duration::from_secs(30)))
        };
        while motor.lines().duty != FULL_DUTY {
            thread::sleep(Duration::from_millis(1));
        }

        let second = actuator.run(Direction::Reverse, Duration::from_millis(10));
        assert_eq!(second, Err(ActuatorError::Busy));
        assert_eq!(motor.energized(), vec![LineDirection::Forward]);

        actuator.stop();
        runner.join().unwrap().unwrap();
        assert_eq!(motor.lines(), OFF);
    }

    #[test]
    fn stop_while_idle_leaves_outputs_off() {
        let (actuator, motor) = actuator();
        actuator.stop();

        assert_eq!(motor.lines(), OFF);
        assert_eq!(actuator.state(), ActuatorState::Idle);
        assert_eq!(motor.energized(), Vec::<LineDirection>::new());
    }

    #[test]
    fn stale_stop_does_not_cancel_next_run() {
        let (actuator, motor) = actuator();
        actuator.stop();

        let outcome = actuator
            .run(Direction::Reverse, Duration::from_millis(10))
            .unwrap();

        assert!(matches!(outcome, RunOutcome::Completed { .. }));
        assert_eq!(motor.energized(), vec![LineDirection::Reverse]);
    }

    #[test]
    fn hardware_fault_stops_run_and_latches() {
        let (actuator, motor) = actuator();
        motor.inject_fault("stall detected");

        let result = actuator.run(Direction::Forward, Duration::from_secs(30));

        assert_eq!(
            result,
            Err(ActuatorError::Fault("stall detected".to_string()))
        );
        assert_eq!(motor.lines(), OFF);
        assert_eq!(actuator.fault().as_deref(), Some("stall detected"));

        actuator
            .run(Direction::Forward, Duration::from_millis(5))
            .unwrap();
        assert_eq!(actuator.fault(), None);
    }

    #[test]
    fn outputs_are_off_as_soon_as_stop_returns() {
        let (actuator, motor) = actuator();

        for _ in 0..50 {
            let runner = {
                let actuator = actuator.clone();
                thread::spawn(move || actuator.run(Direction::Forward, Duration::from_secs(30)))
            };
            while !actuator.state().is_running() {
                thread::yield_now();
            }

            actuator.stop();
            assert_eq!(motor.lines(), OFF);

            let outcome = runner.join().unwrap().unwrap();
            assert!(matches!(outcome, RunOutcome::Stopped { .. }));
            assert_eq!(motor.lines(), OFF);
        }
    }

    #[test]
    fn shutdown_aborts_active_run_and_refuses_later_runs() {
        let (actuator, motor) = actuator();
        let runner = {
            let actuator = actuator.clone();
            thread::spawn(move || actuator.run(Direction::Forward, Duration::from_secs(30)))
        };
        while motor.lines().duty != FULL_DUTY {
            thread::sleep(Duration::from_millis(1));
        }

        actuator.shutdown();
        let outcome = runner.join().unwrap().unwrap();

        assert!(matches!(outcome, RunOutcome::Stopped { .. }));
        assert_eq!(
            actuator.run(Direction::Reverse, Duration::from_secs(30)),
            Err(ActuatorError::ShuttingDown)
        );
        assert_eq!(motor.energized(), vec![LineDirection::Forward]);
        assert_eq!(motor.lines(), OFF);
    }
}
