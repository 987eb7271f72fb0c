//! Standalone streamer used to exercise the comms core outside an embedding
//! application: connects, streams one job file, and reports progress/ETA
//! on stdout.

use std::env;
use std::io::BufRead;
use std::process::ExitCode;
use std::sync::mpsc as std_mpsc;
use std::time::{Duration, Instant};

use smoothie_comms::{AppCallbacks, ConnectionDescriptor, PositionReport, SessionConfig, SessionHandle, StatusReport, TemperatureReport};

enum Lifecycle {
    Connected,
    Failed,
    Finished(bool),
}

struct CliApp {
    events: std_mpsc::Sender<Lifecycle>,
}

impl AppCallbacks for CliApp {
    fn connected(&mut self) {
        let _ = self.events.send(Lifecycle::Connected);
    }

    fn disconnected(&mut self) {
        let _ = self.events.send(Lifecycle::Failed);
    }

    fn stream_finished(&mut self, ok: bool) {
        let _ = self.events.send(Lifecycle::Finished(ok));
    }

    fn display(&mut self, text: &str) {
        println!("{text}");
    }

    fn update_temps(&mut self, report: &TemperatureReport) {
        eprintln!("temps: {report:?}");
    }

    fn update_position(&mut self, report: &PositionReport) {
        eprintln!("position: {report:?}");
    }

    fn update_status(&mut self, report: &StatusReport) {
        eprintln!("status: {}", report.state);
    }

    fn alarm_state(&mut self, message: &str) {
        eprintln!("ALARM: {message}");
    }
}

fn file_len(path: &str) -> Option<u64> {
    let file = std::fs::File::open(path).ok()?;
    Some(std::io::BufReader::new(file).lines().count() as u64)
}

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage: {} <descriptor> <file> [fast]", args[0]);
        return ExitCode::FAILURE;
    }

    let descriptor: ConnectionDescriptor = match args[1].parse() {
        Ok(d) => d,
        Err(err) => {
            eprintln!("Error: {err}");
            return ExitCode::FAILURE;
        }
    };
    let path = args[2].clone();
    let fast = args.len() > 3;

    let nlines = file_len(&path);
    match nlines {
        Some(n) => println!("number of lines: {n}"),
        None => println!("could not count lines in {path}"),
    }

    let mut config = SessionConfig { report_rate: Duration::ZERO, ..SessionConfig::default() };
    if fast {
        config.ping_pong = Some(false);
        println!("Fast Stream");
    }

    let (events_tx, events_rx) = std_mpsc::channel();
    let handle = SessionHandle::connect(descriptor, config, Box::new(CliApp { events: events_tx }));

    match events_rx.recv_timeout(Duration::from_secs(5)) {
        Ok(Lifecycle::Connected) => {}
        Ok(Lifecycle::Failed) | Err(_) => {
            eprintln!("Error: Failed to connect");
            return ExitCode::FAILURE;
        }
        Ok(Lifecycle::Finished(_)) => unreachable!("stream finished before it started"),
    }

    let start = Instant::now();
    println!("Print started");

    let started = Instant::now();
    handle.stream_gcode(
        path.into(),
        Box::new(move |n| {
            if let Some(total) = nlines {
                let elapsed = started.elapsed().as_secs();
                if n > 10 && elapsed > 10 {
                    let lps = n as f64 / elapsed as f64;
                    let eta = (total.saturating_sub(n)) as f64 / lps;
                    println!("line {n}/{total}, eta {eta:.0}s");
                }
            }
        }),
    );

    let ok = match events_rx.recv() {
        Ok(Lifecycle::Finished(ok)) => ok,
        _ => false,
    };

    println!("File sent: {}", if ok { "Ok" } else { "Failed" });
    println!("Elapsed time: {}s", start.elapsed().as_secs());

    handle.stop();
    if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE }
}
