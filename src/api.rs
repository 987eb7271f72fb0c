//! Host-facing API for embedding applications.
//!
//! Every entrypoint is safe to call from any thread; each one marshals a
//! [`Command`] onto the session loop's dedicated thread rather than
//! touching session state directly.

use std::path::PathBuf;

use tokio::sync::mpsc;
use tracing::error;

use crate::callbacks::AppCallbacks;
use crate::config::{ConnectionDescriptor, SessionConfig};
use crate::session::{self, Command};

/// A live connection to a controller, running its session loop on a dedicated thread.
pub struct SessionHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    join: Option<std::thread::JoinHandle<()>>,
}

impl SessionHandle {
    /// Opens `descriptor` and spawns the session loop on its own thread.
    ///
    /// Returns immediately; connection failures are reported through
    /// `callbacks.disconnected()` rather than an error return, since the
    /// open happens asynchronously on the session thread.
    pub fn connect(
        descriptor: ConnectionDescriptor,
        config: SessionConfig,
        callbacks: Box<dyn AppCallbacks>,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        let join = std::thread::Builder::new()
            .name("smoothie-comms-session".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt,
                    Err(err) => {
                        error!(%err, "failed to start session runtime");
                        return;
                    }
                };
                runtime.block_on(session::run(descriptor, config, callbacks, cmd_rx));
            })
            .expect("failed to spawn session thread");

        Self { cmd_tx, join: Some(join) }
    }

    /// Closes the transport and ends the session loop. Idempotent.
    pub fn disconnect(&self) {
        let _ = self.cmd_tx.send(Command::Stop);
    }

    /// Enqueues one immediate write.
    pub fn write(&self, bytes: Vec<u8>) {
        let _ = self.cmd_tx.send(Command::Write(bytes));
    }

    /// Starts streaming `path` to the controller, invoking `progress(linecnt)` periodically.
    pub fn stream_gcode(&self, path: PathBuf, progress: Box<dyn FnMut(u64) + Send>) {
        let _ = self.cmd_tx.send(Command::StreamGcode { path, progress });
    }

    /// Pauses or resumes the active stream; `abort = true` also terminates it.
    pub fn stream_pause(&self, pause: bool, abort: bool) {
        let _ = self.cmd_tx.send(Command::StreamPause { pause, abort });
    }

    /// Requests the SD-card file listing; `done` is invoked on the session thread once it completes.
    pub fn list_sdcard(&self, done: Box<dyn FnOnce(Vec<String>) + Send>) {
        let _ = self.cmd_tx.send(Command::ListSdcard { done });
    }

    /// Aborts any active stream and closes the transport. Idempotent; blocks until the
    /// session thread exits.
    pub fn stop(mut self) {
        let _ = self.cmd_tx.send(Command::Stop);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        let _ = self.cmd_tx.send(Command::Stop);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}
