//! Report records handed to application callbacks.
//!
//! These are ephemeral: the session loop builds one per incoming line and
//! hands it to the relevant [`crate::callbacks::AppCallbacks`] method, it is
//! never retained.

use std::collections::HashMap;

/// Hotend/bed temperature and setpoint, as parsed from a `T:`/`B:` line.
/// Fields the controller didn't report are `None`, not zero.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TemperatureReport {
    pub hotend_temp: Option<f64>,
    pub hotend_setpoint: Option<f64>,
    pub bed_temp: Option<f64>,
    pub bed_setpoint: Option<f64>,
}

impl TemperatureReport {
    pub(crate) fn is_empty(&self) -> bool {
        self.hotend_temp.is_none()
            && self.hotend_setpoint.is_none()
            && self.bed_temp.is_none()
            && self.bed_setpoint.is_none()
    }
}

/// Machine position, as parsed from an `ok C:` line.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionReport {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// A `<State|Key:v1,v2,...|...>` status report.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub state: String,
    pub fields: HashMap<String, Vec<f64>>,
}
