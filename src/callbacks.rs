//! The application-facing observer interface.
//!
//! A [`SessionHandle`](crate::SessionHandle) owns exactly one `AppCallbacks`
//! implementation and invokes it from the session loop's thread — never
//! concurrently, and never for anything outside this trait's surface.

use crate::reports::{PositionReport, StatusReport, TemperatureReport};

/// Notifications pushed from the session loop to the embedding application.
///
/// `connected`, `disconnected` and `stream_finished` are the only calls an
/// application must act on to track session lifecycle; everything else has
/// a no-op default so implementors only override what they display.
pub trait AppCallbacks: Send {
    /// The transport is open and the session loop is ready to accept commands.
    fn connected(&mut self);

    /// The link dropped, or [`SessionHandle::disconnect`](crate::SessionHandle::disconnect) completed.
    fn disconnected(&mut self);

    /// A `stream_gcode` run ended, successfully or not. Called exactly once per stream.
    fn stream_finished(&mut self, ok: bool);

    /// Free-form text the controller sent that isn't a recognized report.
    fn display(&mut self, _text: &str) {}

    fn update_temps(&mut self, _report: &TemperatureReport) {}

    fn update_position(&mut self, _report: &PositionReport) {}

    fn update_status(&mut self, _report: &StatusReport) {}

    /// The controller reported an alarm or error condition.
    fn alarm_state(&mut self, _message: &str) {}

    /// A `// action:pause` comment was seen mid-stream.
    fn pause_prompt(&mut self) {}

    fn change_image(&mut self, _path: &str) {}

    fn sound_alarm(&mut self) {}
}
