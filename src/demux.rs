//! Incoming line classification and dispatch.
//!
//! When a reroute sink is installed every decoded line goes there instead
//! of being classified; otherwise lines are classified in a fixed priority
//! order and turned into a [`LineEvent`] for the session loop to act on.

use tracing::warn;

use crate::flow_control::OkCounter;
use crate::parsers::{parse_position, parse_status, parse_temperature};
use crate::reports::{PositionReport, StatusReport, TemperatureReport};

/// What a classified, non-rerouted line means to the session loop.
#[derive(Debug, Clone, PartialEq)]
pub enum LineEvent {
    Position(PositionReport),
    Temperature(TemperatureReport),
    /// An `ok` acknowledgement was consumed by flow control; nothing further to do.
    Ack,
    Alarm(String),
    Status(StatusReport),
    /// Fewer than three pipe-separated fields in a `<...>` status line.
    OldStatusFormat,
    ActionPause,
    ActionResume,
    ActionDisconnect,
    ActionUnknown(String),
    Display(String),
}

/// A single slot for a temporary line consumer, used for bounded
/// request/response transactions like the SD-card listing.
/// At most one sink may be installed at a time.
#[derive(Default)]
pub struct Demultiplexer {
    reroute: Option<tokio::sync::mpsc::UnboundedSender<String>>,
}

impl Demultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a reroute sink, replacing any previous one.
    pub fn reroute_to(&mut self, sink: tokio::sync::mpsc::UnboundedSender<String>) {
        self.reroute = Some(sink);
    }

    /// Removes the reroute sink, if any, returning classification to normal.
    pub fn clear_reroute(&mut self) {
        self.reroute = None;
    }

    pub fn is_rerouting(&self) -> bool {
        self.reroute.is_some()
    }

    /// Dispatches one decoded line. Returns `None` when the line was
    /// consumed by a reroute sink or silently absorbed as flow control.
    pub fn dispatch(&mut self, line: &str, ok_counter: Option<&OkCounter>) -> Option<LineEvent> {
        if let Some(sink) = &self.reroute {
            // The sink decides when the transaction ends; a closed receiver
            // just means the owner already gave up, nothing to do here.
            let _ = sink.send(line.to_string());
            return None;
        }

        match classify(line) {
            LineEvent::Ack => {
                if let Some(counter) = ok_counter {
                    counter.acknowledge();
                }
                None
            }
            LineEvent::Temperature(_) => match parse_temperature(line) {
                Ok(report) => Some(LineEvent::Temperature(report)),
                Err(err) => {
                    warn!(%line, %err, "dropping malformed temperature report");
                    None
                }
            },
            LineEvent::Position(_) => match parse_position(line) {
                Ok(report) => Some(LineEvent::Position(report)),
                Err(err) => {
                    warn!(%line, %err, "dropping malformed position report");
                    None
                }
            },
            LineEvent::Status(_) => match parse_status(line) {
                Ok(report) => Some(LineEvent::Status(report)),
                Err(_) => Some(LineEvent::OldStatusFormat),
            },
            other => Some(other),
        }
    }
}

/// Pure classification in a fixed priority order. Temperature,
/// position and status events carry placeholder payloads here — the real
/// parse happens in [`Demultiplexer::dispatch`] so this function stays a
/// cheap, side-effect-free first pass.
fn classify(line: &str) -> LineEvent {
    if line.contains("ok C:") {
        return LineEvent::Position(PositionReport { x: 0.0, y: 0.0, z: 0.0 });
    }
    if line.contains("ok T:") || is_temperature_line(line) {
        return LineEvent::Temperature(TemperatureReport::default());
    }
    if line.starts_with("ok") {
        return LineEvent::Ack;
    }
    if line.contains("!!") || line.contains("ALARM") || line.contains("ERROR") {
        return LineEvent::Alarm(line.to_string());
    }
    if line.starts_with('<') {
        return LineEvent::Status(StatusReport {
            state: String::new(),
            fields: Default::default(),
        });
    }
    if let Some(rest) = line.strip_prefix("//") {
        if let Some(pos) = rest.find("action:") {
            let verb = rest[pos + "action:".len()..].trim();
            return match verb {
                "pause" => LineEvent::ActionPause,
                "resume" => LineEvent::ActionResume,
                "disconnect" => LineEvent::ActionDisconnect,
                other => LineEvent::ActionUnknown(other.to_string()),
            };
        }
        return LineEvent::Display(line.to_string());
    }
    LineEvent::Display(line.to_string())
}

/// `(^T:| T:)` — a bare temperature line not already caught by `ok T:`.
fn is_temperature_line(line: &str) -> bool {
    line.starts_with("T:") || line.contains(" T:")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dispatch(line: &str) -> Option<LineEvent> {
        Demultiplexer::new().dispatch(line, None)
    }

    #[test]
    fn classifies_position() {
        assert_eq!(
            dispatch("ok C: X:1.0 Y:2.0 Z:3.0"),
            Some(LineEvent::Position(PositionReport { x: 1.0, y: 2.0, z: 3.0 }))
        );
    }

    #[test]
    fn classifies_temperature() {
        let event = dispatch("ok T:19.8 /0.0 @0").unwrap();
        assert!(matches!(event, LineEvent::Temperature(_)));
    }

    #[test]
    fn classifies_ack_and_consumes_it() {
        assert_eq!(dispatch("ok"), None);
    }

    #[test]
    fn ack_with_no_active_counter_does_not_panic() {
        let mut demux = Demultiplexer::new();
        assert_eq!(demux.dispatch("ok", None), None);
    }

    #[test]
    fn ack_releases_ping_pong_permit() {
        let counter = OkCounter::new_ping_pong();
        let sem = counter.semaphore().unwrap().clone();
        // Drain the initial permit so we can observe the release.
        sem.try_acquire().unwrap().forget();
        assert_eq!(sem.available_permits(), 0);

        let mut demux = Demultiplexer::new();
        demux.dispatch("ok", Some(&counter));
        assert_eq!(sem.available_permits(), 1);
    }

    #[test]
    fn ack_increments_sliding_counter() {
        let counter = OkCounter::new_sliding();
        let mut demux = Demultiplexer::new();
        demux.dispatch("ok", Some(&counter));
        demux.dispatch("ok", Some(&counter));
        assert_eq!(counter.sliding_count(), 2);
    }

    #[test]
    fn classifies_alarm() {
        assert_eq!(dispatch("ALARM: Hard limit +X"), Some(LineEvent::Alarm("ALARM: Hard limit +X".to_string())));
        assert_eq!(dispatch("!!"), Some(LineEvent::Alarm("!!".to_string())));
        assert_eq!(dispatch("ERROR:Homing fail"), Some(LineEvent::Alarm("ERROR:Homing fail".to_string())));
    }

    #[test]
    fn classifies_status_happy_and_old_format() {
        let event = dispatch("<Idle|MPos:1,2,3|WPos:0,0,0>").unwrap();
        assert!(matches!(event, LineEvent::Status(_)));

        assert_eq!(dispatch("<Idle|MPos:1,2,3>"), Some(LineEvent::OldStatusFormat));
    }

    #[test]
    fn classifies_action_comments() {
        assert_eq!(dispatch("// action:pause"), Some(LineEvent::ActionPause));
        assert_eq!(dispatch("// action:resume"), Some(LineEvent::ActionResume));
        assert_eq!(dispatch("// action:disconnect"), Some(LineEvent::ActionDisconnect));
        assert_eq!(
            dispatch("// action:grind"),
            Some(LineEvent::ActionUnknown("grind".to_string()))
        );
    }

    #[test]
    fn comment_without_action_is_display() {
        assert_eq!(
            dispatch("// just a comment"),
            Some(LineEvent::Display("// just a comment".to_string()))
        );
    }

    #[test]
    fn unmatched_line_is_display() {
        assert_eq!(
            dispatch("random chatter"),
            Some(LineEvent::Display("random chatter".to_string()))
        );
    }

    #[test]
    fn reroute_sink_captures_everything() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut demux = Demultiplexer::new();
        demux.reroute_to(tx);
        assert_eq!(demux.dispatch("Begin file list", None), None);
        assert_eq!(demux.dispatch("foo.g", None), None);
        assert_eq!(demux.dispatch("ok", None), None); // would otherwise be flow control

        demux.clear_reroute();
        assert!(!demux.is_rerouting());

        assert_eq!(rx.try_recv().unwrap(), "Begin file list");
        assert_eq!(rx.try_recv().unwrap(), "foo.g");
        assert_eq!(rx.try_recv().unwrap(), "ok");
    }
}
