use std::{sync::Arc, time::Duration};

use log::{info, warn};

use crate::{
    actuator::{Actuator, ActuatorError, RunOutcome},
    clock::Clock,
    protocol::{
        ControlCommand, ControlReply, DEFAULT_UPDATE_DELAY_DAYS, DEFAULT_UPDATE_DURATION_SECS,
    },
    scheduler::{clamp_duration, Scheduler},
    types::{Direction, MotorStatus},
};

// Manual runs go straight to the actuator and never touch the schedule.
pub struct ControlService {
    scheduler: Arc<Scheduler>,
    actuator: Arc<dyn Actuator>,
    clock: Arc<dyn Clock>,
    manual_run_default_secs: u64,
}

impl ControlService {
    pub fn new(
        scheduler: Arc<Scheduler>,
        actuator: Arc<dyn Actuator>,
        clock: Arc<dyn Clock>,
        manual_run_default_secs: u64,
    ) -> Self {
        Self {
            scheduler,
            actuator,
            clock,
            manual_run_default_secs,
        }
    }

    pub fn actuator(&self) -> &Arc<dyn Actuator> {
        &self.actuator
    }

    pub fn handle(&self, command: ControlCommand) -> ControlReply {
        match command {
            ControlCommand::Preflight => ControlReply::Empty,
            ControlCommand::GetStatus => {
                ControlReply::of(&self.scheduler.status(self.clock.now_epoch()))
            }
            ControlCommand::MotorStatus => ControlReply::of(&self.motor_status()),
            ControlCommand::UpdateSchedule { duration, delay } => {
                let update = self.scheduler.update_schedule(
                    duration.resolve(DEFAULT_UPDATE_DURATION_SECS),
                    delay.resolve(DEFAULT_UPDATE_DELAY_DAYS),
                    self.clock.now_epoch(),
                );
                ControlReply::of(&update)
            }
            ControlCommand::StartMotor => {
                let secs = self.scheduler.snapshot().duration_secs;
                match self.run_manual(Direction::Forward, secs) {
                    Ok(description) => ControlReply::status(&description),
                    Err(reply) => reply,
                }
            }
            ControlCommand::RunMotor {
                direction,
                duration,
            } => {
                let secs = clamp_duration(duration.resolve(self.manual_run_default_secs as f64));
                match self.run_manual(direction, secs) {
                    Ok(description) => ControlReply::message(&description),
                    Err(reply) => reply,
                }
            }
            ControlCommand::StopMotor => {
                self.actuator.stop();
                info!("motor stop requested");
                ControlReply::status("Motor stopped")
            }
            ControlCommand::Malformed => ControlReply::invalid_json(),
            ControlCommand::Unrecognized => ControlReply::invalid_endpoint(),
        }
    }

    pub fn motor_status(&self) -> MotorStatus {
        MotorStatus {
            state: self.actuator.state().as_str(),
            fault: self.actuator.fault(),
        }
    }

    fn run_manual(&self, direction: Direction, secs: u64) -> Result<String, ControlReply> {
        info!("manual run: {} for {secs}s", direction.as_str());
        let reverse = match direction {
            Direction::Forward => "",
            Direction::Reverse => "in reverse ",
        };

        match self.actuator.run(direction, Duration::from_secs(secs)) {
            Ok(RunOutcome::Completed { .. }) => Ok(format!("Motor ran {reverse}for {secs} seconds")),
            Ok(RunOutcome::Stopped { ran }) => {
                Ok(format!("Motor stopped after {} seconds", ran.as_secs()))
            }
            Err(ActuatorError::Busy) => {
                warn!("manual run rejected, motor busy");
                Err(ControlReply::error("Motor busy"))
            }
            Err(ActuatorError::ShuttingDown) => Err(ControlReply::error("Motor shut down")),
            Err(ActuatorError::Fault(detail)) => {
                Err(ControlReply::error(&format!("Motor fault: {detail}")))
            }
        }
    }
}
