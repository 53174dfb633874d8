pub mod actuator;
pub mod clock;
pub mod config;
pub mod control;
pub mod protocol;
pub mod scheduler;
pub mod store;
pub mod types;
pub mod worker;

pub use actuator::{
    Actuator, ActuatorError, DriverError, LineDirection, MotorActuator, MotorDriver, RunOutcome,
    SimulatedMotor, FULL_DUTY,
};
pub use clock::{Clock, ManualClock, OsTimeSync, SystemClock, TimeSync, TimeSyncError};
pub use config::{ControllerConfig, MotorPins, NetworkConfig, RuntimeConfig};
pub use control::ControlService;
pub use protocol::{ControlCommand, ControlReply, NumericField, CORS_HEADERS, MAX_BODY_BYTES};
pub use scheduler::{Scheduler, TickOutcome};
pub use store::{FileStore, ScheduleStore, StoreError};
pub use types::{ActuatorState, Direction, PersistedRecord, WateringSchedule};
pub use worker::{ScheduleWorker, ShutdownSignal};
