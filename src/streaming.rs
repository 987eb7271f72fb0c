//! The streaming engine: feeds a job file to the transport line by line.
//!
//! Runs as its own `tokio` task, concurrently with the session loop's
//! transport-reading task, so acknowledgements keep arriving while this
//! engine is suspended on a permit or a drain. It never touches
//! [`AppCallbacks`](crate::AppCallbacks) directly — the session loop
//! exclusively owns callbacks, so this engine reports everything it can't
//! handle itself over a [`StreamEvent`] channel.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

use crate::flow_control::OkCounter;
use crate::transport::Transport;

const PAUSE_POLL_INTERVAL: Duration = Duration::from_secs(1);
const PROGRESS_EVERY: u64 = 10;

/// Shared flags the session loop flips from the outside; the engine only reads them.
#[derive(Clone)]
pub(crate) struct StreamControl {
    pub(crate) abort: Arc<AtomicBool>,
    pub(crate) pause: Arc<AtomicBool>,
    /// Set by the session loop's poll timer while a stream is active.
    pub(crate) do_query: Arc<AtomicBool>,
    /// Mirrors whether a stream is currently running, for `_get_reports` to branch on.
    pub(crate) is_streaming: Arc<AtomicBool>,
}

impl StreamControl {
    pub(crate) fn new() -> Self {
        Self {
            abort: Arc::new(AtomicBool::new(false)),
            pause: Arc::new(AtomicBool::new(false)),
            do_query: Arc::new(AtomicBool::new(false)),
            is_streaming: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Things the engine can't do itself because only the session loop may touch callbacks.
#[derive(Debug)]
pub(crate) enum StreamEvent {
    ChangeImage(String),
    Display(String),
    PausePrompt(String),
    SoundAlarm,
    Finished(bool),
}

/// Runs one stream to completion. Spawned as its own task by the session loop.
pub(crate) async fn run(
    transport: Arc<Transport>,
    ok_counter: OkCounter,
    control: StreamControl,
    path: PathBuf,
    mut progress: Box<dyn FnMut(u64) + Send>,
    events: UnboundedSender<StreamEvent>,
    query_commands: Vec<Vec<u8>>,
) {
    control.abort.store(false, Ordering::SeqCst);
    control.pause.store(false, Ordering::SeqCst);
    control.is_streaming.store(true, Ordering::SeqCst);

    let success = run_inner(&transport, &ok_counter, &control, &path, &mut progress, &events, &query_commands).await;

    control.is_streaming.store(false, Ordering::SeqCst);
    control.do_query.store(false, Ordering::SeqCst);
    let _ = events.send(StreamEvent::Finished(success));
}

async fn run_inner(
    transport: &Arc<Transport>,
    ok_counter: &OkCounter,
    control: &StreamControl,
    path: &PathBuf,
    progress: &mut Box<dyn FnMut(u64) + Send>,
    events: &UnboundedSender<StreamEvent>,
    query_commands: &[Vec<u8>],
) -> bool {
    let file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(err) => {
            warn!(%err, path = %path.display(), "failed to open job file");
            return false;
        }
    };
    let mut lines = BufReader::new(file).lines();
    let mut linecnt: u64 = 0;

    loop {
        while control.pause.load(Ordering::SeqCst) {
            if control.abort.load(Ordering::SeqCst) {
                return false;
            }
            tokio::time::sleep(PAUSE_POLL_INTERVAL).await;
        }

        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                warn!(%err, "error reading job file");
                return false;
            }
        };

        if control.abort.load(Ordering::SeqCst) {
            return false;
        }

        let trimmed = line.trim_end();
        if trimmed.is_empty() || trimmed.starts_with(';') {
            continue;
        }

        if let OkCounter::PingPong(sem) = ok_counter {
            match sem.acquire().await {
                Ok(permit) => permit.forget(),
                Err(_) => return false,
            }
            if control.abort.load(Ordering::SeqCst) {
                return false;
            }
        }

        if let Some(body) = trimmed.strip_prefix("(cmd ").and_then(|s| s.strip_suffix(')')) {
            dispatch_directive(body, control, events);
            continue;
        }

        if transport.write(format!("{line}\n").into_bytes()).is_err() {
            return false;
        }

        if transport.drain().await.is_err() {
            return false;
        }

        if control.abort.load(Ordering::SeqCst) {
            return false;
        }

        linecnt += 1;
        if linecnt.is_multiple_of(PROGRESS_EVERY) {
            progress(progress_value(ok_counter, linecnt));
        }

        if control.do_query.swap(false, Ordering::SeqCst) {
            for cmd in query_commands {
                let _ = transport.write(cmd.clone());
            }
            let _ = transport.drain().await;
        }
    }

    if let OkCounter::Sliding(count) = ok_counter {
        loop {
            let seen = count.load(Ordering::SeqCst);
            if seen >= linecnt {
                break;
            }
            if control.abort.load(Ordering::SeqCst) {
                return false;
            }
            progress(seen);
            tokio::time::sleep(PAUSE_POLL_INTERVAL).await;
        }
    }

    true
}

fn progress_value(ok_counter: &OkCounter, linecnt: u64) -> u64 {
    match ok_counter {
        OkCounter::PingPong(_) => linecnt,
        OkCounter::Sliding(count) => count.load(Ordering::SeqCst),
    }
}

fn dispatch_directive(body: &str, control: &StreamControl, events: &UnboundedSender<StreamEvent>) {
    let (verb, rest) = match body.split_once(' ') {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (body, ""),
    };
    match verb {
        "image" => {
            let _ = events.send(StreamEvent::ChangeImage(rest.to_string()));
        }
        "text" => {
            let _ = events.send(StreamEvent::Display(rest.to_string()));
        }
        "pause" => {
            control.pause.store(true, Ordering::SeqCst);
            let _ = events.send(StreamEvent::PausePrompt(rest.to_string()));
        }
        "alarm" => {
            let _ = events.send(StreamEvent::SoundAlarm);
        }
        other => {
            debug!(verb = other, "ignoring unknown host directive");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow_control::OkCounter;
    use std::io::Write;
    use tokio::sync::mpsc;

    fn job_file(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    async fn echo_ok_transport() -> (Arc<Transport>, tokio::net::TcpListener) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let transport = Transport::open(&crate::config::ConnectionDescriptor::Network {
            host: addr.ip().to_string(),
            port: addr.port(),
        })
        .await
        .unwrap();
        (Arc::new(transport), listener)
    }

    #[tokio::test]
    async fn ping_pong_happy_path_drops_comments() {
        let (transport, listener) = echo_ok_transport().await;
        let (mut server, _) = listener.accept().await.unwrap();

        let job = job_file("G1 X1\n; comment\nG1 X2\n");
        let control = StreamControl::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let responder = tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            let mut buf = vec![0u8; 64];
            let mut seen = Vec::new();
            for _ in 0..2 {
                let n = server.read(&mut buf).await.unwrap();
                seen.extend_from_slice(&buf[..n]);
                server.write_all(b"ok\n").await.unwrap();
            }
            seen
        });

        let ok_counter = OkCounter::new_ping_pong();

        // Stand in for the session loop's read side: the streaming engine never
        // reads incoming bytes itself, so acks have to be fed back in here.
        let ack_reader = {
            let transport = Arc::clone(&transport);
            let ok_counter = ok_counter.clone();
            tokio::spawn(async move {
                let chunk = transport.read_chunk(Duration::from_secs(5)).await.unwrap();
                if chunk.windows(2).any(|w| w == b"ok") {
                    ok_counter.acknowledge();
                }
            })
        };

        let success = run_inner(
            &transport,
            &ok_counter,
            &control,
            &job.path().to_path_buf(),
            &mut (Box::new(|_| {}) as Box<dyn FnMut(u64) + Send>),
            &tx,
            &[],
        )
        .await;

        assert!(success);
        let written = responder.await.unwrap();
        assert_eq!(String::from_utf8(written).unwrap(), "G1 X1\nG1 X2\n");
        ack_reader.await.unwrap();
        assert!(rx.try_recv().is_err(), "no host directives in this job, no events expected");
    }

    #[tokio::test]
    async fn host_directive_sets_pause_without_forwarding() {
        let (transport, listener) = echo_ok_transport().await;
        let (server, _) = listener.accept().await.unwrap();

        let job = job_file("(cmd pause please wait)\n");
        let control = StreamControl::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ok_counter = OkCounter::new_ping_pong();

        let abort = Arc::clone(&control.abort);
        let runner = tokio::spawn({
            let control = control.clone();
            async move {
                run_inner(
                    &transport,
                    &ok_counter,
                    &control,
                    &job.path().to_path_buf(),
                    &mut (Box::new(|_| {}) as Box<dyn FnMut(u64) + Send>),
                    &tx,
                    &[],
                )
                .await
            }
        });

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, StreamEvent::PausePrompt(ref msg) if msg == "please wait"));
        assert!(control.pause.load(Ordering::SeqCst));

        abort.store(true, Ordering::SeqCst);
        let success = runner.await.unwrap();
        assert!(!success);
        drop(server);
    }
}
