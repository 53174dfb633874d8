use serde::Serialize;
use serde_json::{json, Map, Value};

use crate::types::Direction;

pub const MAX_BODY_BYTES: usize = 1024;

pub const CORS_HEADERS: [(&str, &str); 3] = [
    ("Access-Control-Allow-Origin", "*"),
    ("Access-Control-Allow-Methods", "GET, POST, OPTIONS"),
    ("Access-Control-Allow-Headers", "Content-Type"),
];

pub const DEFAULT_UPDATE_DURATION_SECS: f64 = 5.0;
pub const DEFAULT_UPDATE_DELAY_DAYS: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NumericField {
    Missing,
    Value(f64),
    Invalid,
}

impl NumericField {
    fn from_json(value: Option<&Value>) -> Self {
        match value {
            None | Some(Value::Null) => Self::Missing,
            Some(Value::Number(number)) => number.as_f64().map_or(Self::Invalid, Self::Value),
            Some(Value::String(text)) => text
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|value| value.is_finite())
                .map_or(Self::Invalid, Self::Value),
            Some(_) => Self::Invalid,
        }
    }

    pub fn resolve(self, default: f64) -> f64 {
        match self {
            Self::Missing => default,
            Self::Value(value) => value,
            Self::Invalid => 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlCommand {
    Preflight,
    GetStatus,
    MotorStatus,
    UpdateSchedule {
        duration: NumericField,
        delay: NumericField,
    },
    StartMotor,
    RunMotor {
        direction: Direction,
        duration: NumericField,
    },
    StopMotor,
    Malformed,
    Unrecognized,
}

impl ControlCommand {
    pub fn parse(method: &str, target: &str, body: &[u8]) -> Self {
        let path = target.split(['?', '#']).next().unwrap_or_default();
        let method = method.to_ascii_uppercase();

        match (method.as_str(), path) {
            ("OPTIONS", _) => Self::Preflight,
            ("GET", "/watering_info") => Self::GetStatus,
            ("GET", "/motor_status") => Self::MotorStatus,
            ("POST", "/start_motor") => Self::StartMotor,
            ("POST", "/stop_motor") => Self::StopMotor,
            ("POST", "/update_watering") => match parse_object(body) {
                Some(fields) => Self::UpdateSchedule {
                    duration: NumericField::from_json(fields.get("duration")),
                    delay: NumericField::from_json(fields.get("delay")),
                },
                None => Self::Malformed,
            },
            ("POST", "/run_motor") => Self::run_motor(Direction::Forward, body),
            ("POST", "/run_motor_reverse") => Self::run_motor(Direction::Reverse, body),
            _ => Self::Unrecognized,
        }
    }

    fn run_motor(direction: Direction, body: &[u8]) -> Self {
        match parse_object(body) {
            Some(fields) => Self::RunMotor {
                direction,
                duration: NumericField::from_json(fields.get("duration")),
            },
            None => Self::Malformed,
        }
    }

    pub fn is_motor_run(&self) -> bool {
        matches!(self, Self::StartMotor | Self::RunMotor { .. })
    }
}

fn parse_object(body: &[u8]) -> Option<Map<String, Value>> {
    if body.len() > MAX_BODY_BYTES {
        return None;
    }
    match serde_json::from_slice::<Value>(body).ok()? {
        Value::Object(fields) => Some(fields),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ControlReply {
    Json(Value),
    Empty,
}

impl ControlReply {
    pub fn of<T: Serialize>(payload: &T) -> Self {
        match serde_json::to_value(payload) {
            Ok(value) => Self::Json(value),
            Err(err) => Self::error(&format!("Encoding failed: {err}")),
        }
    }

    pub fn status(message: &str) -> Self {
        Self::Json(json!({ "status": message }))
    }

    pub fn message(message: &str) -> Self {
        Self::Json(json!({ "message": message }))
    }

    pub fn error(message: &str) -> Self {
        Self::Json(json!({ "error": message }))
    }

    pub fn invalid_json() -> Self {
        Self::error("Invalid JSON")
    }

    pub fn invalid_endpoint() -> Self {
        Self::error("Invalid endpoint")
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Json(Value::Object(fields)) if fields.contains_key("error"))
    }

    pub fn to_body(&self) -> String {
        match self {
            Self::Json(value) => value.to_string(),
            Self::Empty => String::new(),
        }
    }
}
