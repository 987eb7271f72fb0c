//! Serial port transport: `serial:///dev/ttyACM0?baud=115200`.
//!
//! `SerialPort::read`/`write_all` both take `&self` and are safe to use
//! concurrently, but the device still expects writes in the order they were
//! queued, so a single writer task drains an mpsc channel rather than
//! spawning one task per write. Serial links are not subject to the
//! software watermarks the network transport imposes — those exist to
//! bound its software buffer, which has no equivalent here.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serial2_tokio::SerialPort;
use tokio::sync::mpsc;
use tokio::time::timeout;

use super::READ_CHUNK_SIZE;
use crate::{CommsResult, Error};

struct QueuedChunk {
    epoch: u64,
    data: Vec<u8>,
}

#[derive(Debug)]
pub(crate) struct SerialTransport {
    port: SerialPort,
    writer: mpsc::UnboundedSender<QueuedChunk>,
    queued: Arc<AtomicUsize>,
    epoch: Arc<AtomicU64>,
}

impl SerialTransport {
    pub(crate) fn open(path: &str, baud: u32) -> CommsResult<Self> {
        let port = SerialPort::open(path, baud).map_err(Error::Io)?;
        let writer_port = port.try_clone().map_err(Error::Io)?;

        let (writer, mut rx) = mpsc::unbounded_channel::<QueuedChunk>();
        let queued = Arc::new(AtomicUsize::new(0));
        let epoch = Arc::new(AtomicU64::new(0));
        let queued_for_task = Arc::clone(&queued);
        let epoch_for_task = Arc::clone(&epoch);
        tokio::spawn(async move {
            while let Some(chunk) = rx.recv().await {
                let len = chunk.data.len();
                if chunk.epoch < epoch_for_task.load(Ordering::SeqCst) {
                    continue;
                }
                if writer_port.write_all(&chunk.data).await.is_err() {
                    break;
                }
                // Saturating: discard_queue() may have reset `queued` to 0 while this
                // write was in flight, and a plain fetch_sub would wrap the atomic.
                let _ = queued_for_task.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |q| Some(q.saturating_sub(len)));
            }
        });

        Ok(Self { port, writer, queued, epoch })
    }

    pub(crate) fn write(&self, data: Vec<u8>) -> CommsResult<()> {
        self.queued.fetch_add(data.len(), Ordering::SeqCst);
        let epoch = self.epoch.load(Ordering::SeqCst);
        let _ = self.writer.send(QueuedChunk { epoch, data });
        Ok(())
    }

    /// Drops everything currently queued, for alarm handling.
    pub(crate) fn discard_queue(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.queued.store(0, Ordering::SeqCst);
    }

    /// No write-buffer limit applies to serial, so drain never actually
    /// has anything to wait for.
    pub(crate) async fn drain(&self) -> CommsResult<()> {
        Ok(())
    }

    pub(crate) async fn read_chunk(&self, read_timeout: Duration) -> CommsResult<Vec<u8>> {
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        match timeout(read_timeout, self.port.read(&mut buf)).await {
            Ok(Ok(0)) => Err(Error::ConnectionLost),
            Ok(Ok(n)) => {
                buf.truncate(n);
                Ok(buf)
            }
            Ok(Err(e)) => Err(Error::Io(e)),
            Err(_) => Ok(Vec::new()),
        }
    }

    pub(crate) fn close(&self) -> CommsResult<()> {
        self.port.discard_buffers().map_err(Error::Io)
    }
}
