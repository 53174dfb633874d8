use serde::{Deserialize, Serialize};

use crate::types::SECONDS_PER_DAY;

pub const MAX_DURATION_SECS: u64 = 86_400;
pub const MAX_DELAY_DAYS: f64 = 3_650.0;
pub const MAX_DELAY_SECS: i64 = 3_650 * SECONDS_PER_DAY;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControllerConfig {
    pub poll_interval_ms: u64,
    pub fault_check_interval_ms: u64,
    pub default_duration_secs: u64,
    pub default_delay_secs: i64,
    pub reverse_flush_secs: u64,
    pub manual_run_default_secs: u64,
    pub time_sync_interval_secs: u64,
    pub catch_up_missed_fire: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            fault_check_interval_ms: 100,
            default_duration_secs: 5,
            default_delay_secs: SECONDS_PER_DAY,
            reverse_flush_secs: 0,
            manual_run_default_secs: 1,
            time_sync_interval_secs: 86_400,
            catch_up_missed_fire: false,
        }
    }
}

impl ControllerConfig {
    pub fn sanitize(&mut self) {
        self.poll_interval_ms = self.poll_interval_ms.clamp(100, 60_000);
        self.fault_check_interval_ms = self.fault_check_interval_ms.clamp(10, 1_000);
        self.default_duration_secs = self.default_duration_secs.clamp(1, MAX_DURATION_SECS);
        self.default_delay_secs = self.default_delay_secs.clamp(1, MAX_DELAY_SECS);
        self.reverse_flush_secs = self.reverse_flush_secs.min(600);
        self.manual_run_default_secs = self.manual_run_default_secs.clamp(1, MAX_DURATION_SECS);
        self.time_sync_interval_secs = self.time_sync_interval_secs.clamp(60, 7 * 86_400);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MotorPins {
    pub speed_pin: i32,
    pub dir1_pin: i32,
    pub dir2_pin: i32,
    pub pwm_frequency_hz: u32,
}

impl Default for MotorPins {
    fn default() -> Self {
        Self {
            speed_pin: 16,
            dir1_pin: 14,
            dir2_pin: 15,
            pwm_frequency_hz: 50,
        }
    }
}

impl MotorPins {
    pub fn sanitize(&mut self) {
        let pins = [self.speed_pin, self.dir1_pin, self.dir2_pin];
        let distinct = pins[0] != pins[1] && pins[0] != pins[2] && pins[1] != pins[2];
        if pins.iter().any(|pin| *pin < 0) || !distinct {
            let defaults = Self::default();
            self.speed_pin = defaults.speed_pin;
            self.dir1_pin = defaults.dir1_pin;
            self.dir2_pin = defaults.dir2_pin;
        }

        self.pwm_frequency_hz = self.pwm_frequency_hz.clamp(1, 40_000);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub http_port: u16,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            http_port: 8080,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    pub controller: ControllerConfig,
    pub motor: MotorPins,
    pub network: NetworkConfig,
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.controller.sanitize();
        self.motor.sanitize();
        if self.network.http_port == 0 {
            self.network.http_port = NetworkConfig::default().http_port;
        }
    }
}
