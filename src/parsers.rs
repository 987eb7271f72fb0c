//! Temperature, position and status report grammars.
//!
//! All parsers here are pure and fallible: malformed input never panics,
//! it is reported via [`crate::Error::ParseError`] and dropped by the
//! caller (see [`crate::demux`]).

use crate::reports::{PositionReport, StatusReport, TemperatureReport};
use crate::{CommsResult, Error};

/// `ok T:19.8 /0.0 @0 B:20.1 /0.0 @0` → hotend/bed current + setpoint.
///
/// Grammar: repeated `([TB]\d*):<float>( /<float>)?`. A field with no
/// parseable value is simply absent from the result rather than an error;
/// the whole line only errors if *nothing* recognizable was found.
pub fn parse_temperature(line: &str) -> CommsResult<TemperatureReport> {
    let mut report = TemperatureReport::default();
    let tokens: Vec<&str> = line.split_whitespace().collect();

    let mut i = 0;
    while i < tokens.len() {
        if let Some((kind, value)) = label_value(tokens[i]) {
            let setpoint = tokens
                .get(i + 1)
                .and_then(|t| t.strip_prefix('/'))
                .and_then(|v| v.parse::<f64>().ok());
            let current = value.parse::<f64>().ok();

            match kind {
                'T' => {
                    report.hotend_temp = report.hotend_temp.or(current);
                    report.hotend_setpoint = report.hotend_setpoint.or(setpoint);
                }
                'B' => {
                    report.bed_temp = report.bed_temp.or(current);
                    report.bed_setpoint = report.bed_setpoint.or(setpoint);
                }
                _ => unreachable!(),
            }
        }
        i += 1;
    }

    if report.is_empty() {
        return Err(Error::ParseError {
            kind: "temperature",
            detail: line.to_string(),
        });
    }
    Ok(report)
}

/// A label token like `T:19.8` or `B12:0.0` → `('T', "19.8")`.
fn label_value(token: &str) -> Option<(char, &str)> {
    let mut chars = token.chars();
    let kind = chars.next()?;
    if kind != 'T' && kind != 'B' {
        return None;
    }
    let rest = chars.as_str();
    let colon = rest.find(':')?;
    let (digits, after_colon) = rest.split_at(colon);
    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some((kind, &after_colon[1..]))
}

/// `ok C: X:0.0000 Y:0.0000 Z:0.0000` → machine position.
///
/// Tokenised by whitespace; fewer than five tokens means the line is
/// ignored entirely (not even a parse error — the caller never calls this
/// unless the `ok C:` prefix already matched).
pub fn parse_position(line: &str) -> CommsResult<PositionReport> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.len() < 5 {
        return Err(Error::ParseError {
            kind: "position",
            detail: line.to_string(),
        });
    }
    let coord = |tok: &str| -> CommsResult<f64> {
        let value = tok.split_once(':').map(|(_, v)| v).unwrap_or(tok);
        value.parse::<f64>().map_err(|_| Error::ParseError {
            kind: "position",
            detail: line.to_string(),
        })
    };
    Ok(PositionReport {
        x: coord(tokens[2])?,
        y: coord(tokens[3])?,
        z: coord(tokens[4])?,
    })
}

/// `<State|Key1:v1,v2,...|Key2:...>` → status name + field map.
///
/// Fewer than three pipe-separated pieces means the device is running an
/// old status format; the caller (§4.4/§4.6 of the spec) turns this into an
/// advisory `update_status("ERROR", ...)` rather than treating it as a hard
/// parse failure, so this returns a distinct error variant for that case.
pub fn parse_status(line: &str) -> CommsResult<StatusReport> {
    let inner = line
        .strip_prefix('<')
        .and_then(|s| s.strip_suffix('>'))
        .ok_or_else(|| Error::ParseError {
            kind: "status",
            detail: line.to_string(),
        })?;

    let pieces: Vec<&str> = inner.split('|').collect();
    if pieces.len() < 3 {
        return Err(Error::ParseError {
            kind: "status-old-format",
            detail: line.to_string(),
        });
    }

    let state = pieces[0].to_string();
    let mut fields = std::collections::HashMap::new();
    for piece in &pieces[1..] {
        let (name, values) = piece.split_once(':').ok_or_else(|| Error::ParseError {
            kind: "status",
            detail: line.to_string(),
        })?;
        let parsed = values
            .split(',')
            .map(|v| v.parse::<f64>())
            .collect::<Result<Vec<f64>, _>>()
            .map_err(|_| Error::ParseError {
                kind: "status",
                detail: line.to_string(),
            })?;
        fields.insert(name.to_string(), parsed);
    }

    Ok(StatusReport { state, fields })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temperature_full_report() {
        let r = parse_temperature("ok T:19.8 /0.0 @0 B:20.1 /0.0 @0").unwrap();
        assert_eq!(r.hotend_temp, Some(19.8));
        assert_eq!(r.hotend_setpoint, Some(0.0));
        assert_eq!(r.bed_temp, Some(20.1));
        assert_eq!(r.bed_setpoint, Some(0.0));
    }

    #[test]
    fn temperature_hotend_only() {
        let r = parse_temperature("ok T:200.5 /210.0 @128").unwrap();
        assert_eq!(r.hotend_temp, Some(200.5));
        assert_eq!(r.bed_temp, None);
        assert_eq!(r.bed_setpoint, None);
    }

    #[test]
    fn temperature_rejects_unparseable_line() {
        assert!(parse_temperature("ok this has no temps").is_err());
    }

    #[test]
    fn position_happy_path() {
        let p = parse_position("ok C: X:1.5000 Y:-2.0000 Z:3.2500").unwrap();
        assert_eq!(p.x, 1.5);
        assert_eq!(p.y, -2.0);
        assert_eq!(p.z, 3.25);
    }

    #[test]
    fn position_rejects_short_line() {
        assert!(parse_position("ok C: X:1.0").is_err());
    }

    #[test]
    fn status_happy_path() {
        let s = parse_status("<Idle|MPos:1,2,3|WPos:0,0,0|F:100|S:1.2>").unwrap();
        assert_eq!(s.state, "Idle");
        assert_eq!(s.fields["MPos"], vec![1.0, 2.0, 3.0]);
        assert_eq!(s.fields["WPos"], vec![0.0, 0.0, 0.0]);
        assert_eq!(s.fields["F"], vec![100.0]);
        assert_eq!(s.fields["S"], vec![1.2]);
    }

    #[test]
    fn status_old_format_is_distinct_error() {
        let err = parse_status("<Idle|MPos:1,2,3>").unwrap_err();
        match err {
            Error::ParseError { kind, .. } => assert_eq!(kind, "status-old-format"),
            other => panic!("unexpected error variant: {other:?}"),
        }
    }
}
