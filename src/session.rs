//! The session loop, owning one connection end to end.
//!
//! Owns the transport, the demultiplexer and the application callbacks for
//! the lifetime of one connection. Runs on its own dedicated OS thread (see
//! [`crate::api::SessionHandle::connect`]) driving a `tokio` current-thread
//! runtime; the streaming engine runs as a concurrent task on that same
//! runtime so incoming bytes keep being read while a stream is suspended.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::callbacks::AppCallbacks;
use crate::config::{ConnectionDescriptor, SessionConfig};
use crate::demux::{Demultiplexer, LineEvent};
use crate::flow_control::OkCounter;
use crate::reassembler::LineReassembler;
use crate::reports::StatusReport;
use crate::streaming::{self, StreamControl, StreamEvent};
use crate::transport::Transport;

const READ_POLL_INTERVAL: Duration = Duration::from_millis(250);
const SD_LIST_TIMEOUT: Duration = Duration::from_secs(10);

/// Requests the foreground submits to the session thread.
pub(crate) enum Command {
    Write(Vec<u8>),
    StreamGcode {
        path: PathBuf,
        progress: Box<dyn FnMut(u64) + Send>,
    },
    StreamPause {
        pause: bool,
        abort: bool,
    },
    ListSdcard {
        done: Box<dyn FnOnce(Vec<String>) + Send>,
    },
    Stop,
}

/// Runs the session to completion; returns once the transport is closed or `Stop` is processed.
pub(crate) async fn run(
    descriptor: ConnectionDescriptor,
    config: SessionConfig,
    mut callbacks: Box<dyn AppCallbacks>,
    mut cmd_rx: mpsc::UnboundedReceiver<Command>,
) {
    // --- Open ---
    let is_serial = matches!(descriptor, ConnectionDescriptor::Serial { .. });
    let ping_pong = config.ping_pong_for(&descriptor);
    let transport = match Transport::open(&descriptor).await {
        Ok(t) => Arc::new(t),
        Err(err) => {
            warn!(%err, "failed to open transport");
            callbacks.disconnected();
            return;
        }
    };

    // --- Ready ---
    callbacks.connected();
    let mut poll_deadline = None;
    if config.report_rate > Duration::ZERO {
        let _ = transport.write(b"\nversion\n".to_vec());
        poll_deadline = Some(Instant::now() + config.report_rate);
    }

    let mut state = SessionState {
        transport,
        demux: Demultiplexer::new(),
        reassembler: LineReassembler::new(),
        ok_counter: None,
        stream_control: None,
        stream_events: None,
        sdcard: None,
        config,
        is_serial,
        ping_pong,
    };

    // --- Run ---
    loop {
        let stream_event = async {
            match &mut state.stream_events {
                Some(rx) => rx.recv().await,
                None => std::future::pending().await,
            }
        };
        let sdcard_deadline = state.sdcard.as_ref().map(|listing| listing.deadline);
        let sdcard_line = async {
            match &mut state.sdcard {
                Some(listing) => listing.rx.recv().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(Command::Stop) | None => break,
                    Some(cmd) => handle_command(&mut state, &mut callbacks, cmd).await,
                }
            }
            chunk = state.transport.read_chunk(READ_POLL_INTERVAL) => {
                match chunk {
                    Ok(bytes) if bytes.is_empty() => {}
                    Ok(bytes) => handle_incoming(&mut state, &mut callbacks, &bytes, &mut poll_deadline),
                    Err(_) => break,
                }
            }
            _ = wait_deadline(poll_deadline) => {
                poll_deadline = None;
                get_reports(&mut state);
            }
            Some(event) = stream_event => {
                handle_stream_event(&mut state, &mut callbacks, event);
            }
            line = sdcard_line => {
                match line {
                    Some(line) => handle_sdcard_line(&mut state, line),
                    None => finish_sdcard_listing(&mut state),
                }
            }
            _ = wait_deadline(sdcard_deadline) => {
                finish_sdcard_listing(&mut state);
            }
        }
    }

    // --- Teardown ---
    if let Some(control) = &state.stream_control {
        control.abort.store(true, Ordering::SeqCst);
        if let Some(OkCounter::PingPong(sem)) = &state.ok_counter {
            sem.add_permits(1);
        }
    }
    // Wait for the streaming task to actually observe the abort and report
    // in, so `stream_finished` is invoked exactly once even when torn down mid-stream.
    if let Some(mut rx) = state.stream_events.take() {
        while let Some(event) = rx.recv().await {
            let finished = matches!(event, StreamEvent::Finished(_));
            handle_stream_event(&mut state, &mut callbacks, event);
            if finished {
                break;
            }
        }
    }
    if state.sdcard.is_some() {
        finish_sdcard_listing(&mut state);
    }
    let _ = state.transport.close().await;
    callbacks.disconnected();
}

struct SdcardListing {
    rx: mpsc::UnboundedReceiver<String>,
    names: Vec<String>,
    collecting: bool,
    deadline: Instant,
    done: Box<dyn FnOnce(Vec<String>) + Send>,
}

struct SessionState {
    transport: Arc<Transport>,
    demux: Demultiplexer,
    reassembler: LineReassembler,
    ok_counter: Option<OkCounter>,
    stream_control: Option<StreamControl>,
    stream_events: Option<mpsc::UnboundedReceiver<StreamEvent>>,
    sdcard: Option<SdcardListing>,
    config: SessionConfig,
    is_serial: bool,
    ping_pong: bool,
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

fn handle_incoming(
    state: &mut SessionState,
    callbacks: &mut Box<dyn AppCallbacks>,
    bytes: &[u8],
    poll_deadline: &mut Option<Instant>,
) {
    for line in state.reassembler.feed(bytes) {
        let event = state.demux.dispatch(&line, state.ok_counter.as_ref());
        match event {
            None => {}
            Some(LineEvent::Position(report)) => callbacks.update_position(&report),
            Some(LineEvent::Temperature(report)) => callbacks.update_temps(&report),
            Some(LineEvent::Ack) => {}
            Some(LineEvent::Alarm(line)) => handle_alarm(state, callbacks, &line),
            Some(LineEvent::Status(report)) => {
                callbacks.update_status(&report);
                if state.config.report_rate > Duration::ZERO {
                    *poll_deadline = Some(Instant::now() + state.config.report_rate);
                }
            }
            Some(LineEvent::OldStatusFormat) => {
                warn!("device is using an old status format; set new_status_format true");
                callbacks.update_status(&StatusReport {
                    state: "ERROR".to_string(),
                    fields: HashMap::new(),
                });
                if state.config.report_rate > Duration::ZERO {
                    *poll_deadline = Some(Instant::now() + state.config.report_rate);
                }
            }
            Some(LineEvent::ActionPause) => {
                if let Some(control) = &state.stream_control {
                    control.pause.store(true, Ordering::SeqCst);
                }
                callbacks.pause_prompt();
            }
            Some(LineEvent::ActionResume) => {
                if let Some(control) = &state.stream_control {
                    control.pause.store(false, Ordering::SeqCst);
                }
            }
            Some(LineEvent::ActionDisconnect) => {
                // Handled by the caller observing the next transport close; nothing to do locally.
                debug!("device requested disconnect via action comment");
            }
            Some(LineEvent::ActionUnknown(verb)) => {
                debug!(verb, "ignoring unknown action comment");
            }
            Some(LineEvent::Display(text)) => callbacks.display(&text),
        }
    }
}

fn handle_alarm(state: &mut SessionState, callbacks: &mut Box<dyn AppCallbacks>, line: &str) {
    if let Some(control) = &state.stream_control {
        control.abort.store(true, Ordering::SeqCst);
        if let Some(OkCounter::PingPong(sem)) = &state.ok_counter {
            sem.add_permits(1);
        }
    }
    state.transport.discard_queue();
    callbacks.alarm_state(line);
}

async fn handle_command(state: &mut SessionState, callbacks: &mut Box<dyn AppCallbacks>, cmd: Command) {
    match cmd {
        Command::Write(bytes) => {
            let _ = state.transport.write(bytes);
        }
        Command::StreamGcode { path, progress } => start_stream(state, path, progress),
        Command::StreamPause { pause, abort } => {
            if let Some(control) = &state.stream_control {
                control.pause.store(pause, Ordering::SeqCst);
                if abort {
                    control.abort.store(true, Ordering::SeqCst);
                    if let Some(OkCounter::PingPong(sem)) = &state.ok_counter {
                        sem.add_permits(1);
                    }
                }
            }
        }
        Command::ListSdcard { done } => start_sdcard_listing(state, done),
        Command::Stop => unreachable!("handled by the caller before dispatch"),
    }
    let _ = callbacks; // callbacks only needed by some arms; keeps signature uniform
}

fn start_stream(state: &mut SessionState, path: PathBuf, progress: Box<dyn FnMut(u64) + Send>) {
    if state.stream_control.is_some() {
        warn!("stream_gcode requested while a stream is already active, ignoring");
        return;
    }

    let ok_counter = if state.ping_pong {
        OkCounter::new_ping_pong()
    } else {
        OkCounter::new_sliding()
    };
    let control = StreamControl::new();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let query_commands = status_query_commands(state.config.is_cnc, state.is_serial);

    tokio::spawn(streaming::run(
        Arc::clone(&state.transport),
        ok_counter.clone(),
        control.clone(),
        path,
        progress,
        events_tx,
        query_commands,
    ));

    state.ok_counter = Some(ok_counter);
    state.stream_control = Some(control);
    state.stream_events = Some(events_rx);
}

fn handle_stream_event(state: &mut SessionState, callbacks: &mut Box<dyn AppCallbacks>, event: StreamEvent) {
    match event {
        StreamEvent::ChangeImage(path) => callbacks.change_image(&path),
        StreamEvent::Display(text) => callbacks.display(&text),
        StreamEvent::PausePrompt(msg) => {
            callbacks.pause_prompt();
            if !msg.is_empty() {
                callbacks.display(&msg);
            }
        }
        StreamEvent::SoundAlarm => callbacks.sound_alarm(),
        StreamEvent::Finished(ok) => {
            state.ok_counter = None;
            state.stream_control = None;
            state.stream_events = None;
            callbacks.stream_finished(ok);
        }
    }
}

/// Polls for a status report, or — if a stream is active — defers to its next drain point.
fn get_reports(state: &mut SessionState) {
    if let Some(control) = &state.stream_control
        && control.is_streaming.load(Ordering::SeqCst)
    {
        control.do_query.store(true, Ordering::SeqCst);
        return;
    }
    for cmd in status_query_commands(state.config.is_cnc, state.is_serial) {
        let _ = state.transport.write(cmd);
    }
}

fn status_query_commands(is_cnc: bool, is_serial: bool) -> Vec<Vec<u8>> {
    let mut cmds = Vec::with_capacity(2);
    if !is_cnc {
        cmds.push(b"M105\n".to_vec());
    }
    cmds.push(if is_serial { b"?".to_vec() } else { b"get status\n".to_vec() });
    cmds
}

/// Starts the SD-card listing transaction: a bounded reroute-sink
/// request/response driven from the main select loop (see
/// `handle_sdcard_line`/`finish_sdcard_listing`) rather than awaited inline,
/// since blocking here would stop `read_chunk` from being polled and the
/// reroute sink would never receive anything.
fn start_sdcard_listing(state: &mut SessionState, done: Box<dyn FnOnce(Vec<String>) + Send>) {
    if state.sdcard.is_some() {
        warn!("list_sdcard requested while a previous listing is still in progress, ignoring");
        return;
    }
    let (tx, rx) = mpsc::unbounded_channel::<String>();
    state.demux.reroute_to(tx);
    let _ = state.transport.write(b"M20\n".to_vec());
    state.sdcard = Some(SdcardListing {
        rx,
        names: Vec::new(),
        collecting: false,
        deadline: Instant::now() + SD_LIST_TIMEOUT,
        done,
    });
}

fn handle_sdcard_line(state: &mut SessionState, line: String) {
    if line == "End file list" {
        finish_sdcard_listing(state);
        return;
    }
    let Some(listing) = &mut state.sdcard else { return };
    if line == "Begin file list" {
        listing.collecting = true;
    } else if listing.collecting && line != "ok" {
        listing.names.push(line);
    }
}

/// Ends the listing transaction, whether it finished normally or timed out,
/// restoring normal classification and invoking `done` exactly once.
fn finish_sdcard_listing(state: &mut SessionState) {
    if let Some(listing) = state.sdcard.take() {
        state.demux.clear_reroute();
        info!(count = listing.names.len(), "sd card list complete");
        (listing.done)(listing.names);
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    #[derive(Debug)]
    enum Event {
        Connected,
        Disconnected,
        StreamFinished(bool),
    }

    struct RecordingCallbacks {
        tx: mpsc::UnboundedSender<Event>,
    }

    impl AppCallbacks for RecordingCallbacks {
        fn connected(&mut self) {
            let _ = self.tx.send(Event::Connected);
        }
        fn disconnected(&mut self) {
            let _ = self.tx.send(Event::Disconnected);
        }
        fn stream_finished(&mut self, ok: bool) {
            let _ = self.tx.send(Event::StreamFinished(ok));
        }
    }

    #[tokio::test]
    async fn list_sdcard_drains_names_without_blocking_reads() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let descriptor = ConnectionDescriptor::Network { host: addr.ip().to_string(), port: addr.port() };
        let config = SessionConfig { report_rate: Duration::ZERO, ..SessionConfig::default() };
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let session = tokio::spawn(run(descriptor, config, Box::new(RecordingCallbacks { tx: events_tx }), cmd_rx));
        let (mut server, _) = listener.accept().await.unwrap();

        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        cmd_tx
            .send(Command::ListSdcard { done: Box::new(move |names| { let _ = done_tx.send(names); }) })
            .unwrap();

        let mut buf = vec![0u8; 64];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"M20\n");
        server.write_all(b"Begin file list\nfoo.g\nbar.g\nEnd file list\nok\n").await.unwrap();

        // If the session loop were still blocked awaiting this transaction
        // inline, read_chunk would never run again and this would hang until
        // the test harness's own timeout instead of resolving here.
        let names = done_rx.await.unwrap();
        assert_eq!(names, vec!["foo.g".to_string(), "bar.g".to_string()]);

        cmd_tx.send(Command::Stop).unwrap();
        session.await.unwrap();
    }

    #[tokio::test]
    async fn stop_mid_stream_waits_for_stream_finished_before_disconnecting() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let descriptor = ConnectionDescriptor::Network { host: addr.ip().to_string(), port: addr.port() };
        let config = SessionConfig { report_rate: Duration::ZERO, ping_pong: Some(true), ..SessionConfig::default() };
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let session = tokio::spawn(run(descriptor, config, Box::new(RecordingCallbacks { tx: events_tx }), cmd_rx));
        let (mut server, _) = listener.accept().await.unwrap();
        assert!(matches!(events_rx.recv().await.unwrap(), Event::Connected));

        let mut job = tempfile::NamedTempFile::new().unwrap();
        job.write_all(b"G1 X1\nG1 X2\n").unwrap();

        cmd_tx
            .send(Command::StreamGcode { path: job.path().to_path_buf(), progress: Box::new(|_| {}) })
            .unwrap();

        let mut buf = vec![0u8; 64];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"G1 X1\n");

        // Never acks, so the streaming task is now blocked waiting on the next
        // ping-pong permit. Stop must still unwind it before disconnecting.
        cmd_tx.send(Command::Stop).unwrap();

        let first = events_rx.recv().await.unwrap();
        assert!(matches!(first, Event::StreamFinished(false)), "expected stream_finished before disconnected, got {first:?}");
        let second = events_rx.recv().await.unwrap();
        assert!(matches!(second, Event::Disconnected));

        session.await.unwrap();
        drop(server);
    }
}
