//! Raw TCP transport: `net://host:port`.
//!
//! Maintains a software outbound queue with high/low watermarks (1024/256),
//! independent of the socket's own send buffer. The OS buffer is sized to
//! 2048 bytes on connect so backpressure is felt at the software layer
//! first, where it is actually observable.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::time::timeout;
use tracing::warn;

use super::{READ_CHUNK_SIZE, WRITE_HIGH_WATERMARK, WRITE_LOW_WATERMARK};
use crate::{CommsResult, Error};

/// The software write buffer is sized independently of the OS socket
/// buffer; the latter only needs to be big enough to not starve the
/// kernel's own TCP window management.
const SOCKET_SEND_BUFFER: u32 = 2048;

struct QueuedChunk {
    epoch: u64,
    data: Vec<u8>,
}

#[derive(Debug)]
pub(crate) struct NetworkTransport {
    // The session loop is the only reader, but `Transport` is shared via
    // `Arc` with the streaming engine for writes, so this needs `&self` access.
    read_half: Mutex<tokio::net::tcp::OwnedReadHalf>,
    writer: mpsc::UnboundedSender<QueuedChunk>,
    queued: Arc<AtomicUsize>,
    paused: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    notify: Arc<Notify>,
    epoch: Arc<AtomicU64>,
}

impl NetworkTransport {
    pub(crate) async fn open(host: &str, port: u16) -> CommsResult<Self> {
        let addr = tokio::net::lookup_host((host, port))
            .await?
            .next()
            .ok_or_else(|| Error::InvalidDescriptor(format!("{host}:{port} resolved to no address")))?;

        let socket = if addr.is_ipv6() {
            TcpSocket::new_v6()?
        } else {
            TcpSocket::new_v4()?
        };
        socket.set_send_buffer_size(SOCKET_SEND_BUFFER)?;
        let stream: TcpStream = socket.connect(addr).await?;
        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();
        let (writer, rx) = mpsc::unbounded_channel::<QueuedChunk>();
        let queued = Arc::new(AtomicUsize::new(0));
        let paused = Arc::new(AtomicBool::new(false));
        let closed = Arc::new(AtomicBool::new(false));
        let notify = Arc::new(Notify::new());
        let epoch = Arc::new(AtomicU64::new(0));
        spawn_writer(
            write_half,
            rx,
            Arc::clone(&queued),
            Arc::clone(&paused),
            Arc::clone(&closed),
            Arc::clone(&notify),
            Arc::clone(&epoch),
        );

        Ok(Self { read_half: Mutex::new(read_half), writer, queued, paused, closed, notify, epoch })
    }

    pub(crate) fn write(&self, data: Vec<u8>) -> CommsResult<()> {
        let total = self.queued.fetch_add(data.len(), Ordering::SeqCst) + data.len();
        if total > WRITE_HIGH_WATERMARK && !self.paused.swap(true, Ordering::SeqCst) {
            tracing::debug!(total, "network transport crossed high watermark, pausing");
        }
        let epoch = self.epoch.load(Ordering::SeqCst);
        let _ = self.writer.send(QueuedChunk { epoch, data });
        Ok(())
    }

    /// Drops everything currently queued; bytes already in flight to the OS
    /// cannot be recalled. Used on alarm.
    pub(crate) fn discard_queue(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.queued.store(0, Ordering::SeqCst);
        if self.paused.swap(false, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    /// Resolves once the queued byte count has drained back below the low
    /// watermark, or immediately if the transport was never paused.
    pub(crate) async fn drain(&self) -> CommsResult<()> {
        loop {
            // Registered before the state check below, so a `notify_waiters()`
            // racing in after the check but before the await isn't missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.closed.load(Ordering::SeqCst) {
                return Err(Error::ConnectionLost);
            }
            if !self.paused.load(Ordering::SeqCst) {
                return Ok(());
            }
            notified.await;
        }
    }

    pub(crate) async fn read_chunk(&self, read_timeout: Duration) -> CommsResult<Vec<u8>> {
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        let mut read_half = self.read_half.lock().await;
        match timeout(read_timeout, read_half.read(&mut buf)).await {
            Ok(Ok(0)) => {
                self.closed.store(true, Ordering::SeqCst);
                self.notify.notify_waiters();
                Err(Error::ConnectionLost)
            }
            Ok(Ok(n)) => {
                buf.truncate(n);
                Ok(buf)
            }
            Ok(Err(e)) => Err(Error::Io(e)),
            Err(_) => Ok(Vec::new()),
        }
    }

    pub(crate) async fn close(&self) -> CommsResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        Ok(())
    }
}

fn spawn_writer(
    mut write_half: tokio::net::tcp::OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<QueuedChunk>,
    queued: Arc<AtomicUsize>,
    paused: Arc<AtomicBool>,
    closed: Arc<AtomicBool>,
    notify: Arc<Notify>,
    epoch: Arc<AtomicU64>,
) {
    tokio::spawn(async move {
        while let Some(chunk) = rx.recv().await {
            let len = chunk.data.len();
            if chunk.epoch < epoch.load(Ordering::SeqCst) {
                continue; // discarded before it went out
            }
            if let Err(err) = write_half.write_all(&chunk.data).await {
                warn!(%err, "network transport write failed, closing");
                closed.store(true, Ordering::SeqCst);
                notify.notify_waiters();
                break;
            }
            // Saturating: discard_queue() may have reset `queued` to 0 while this
            // write was in flight, and a plain fetch_sub would wrap the atomic.
            let remaining = queued
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |q| Some(q.saturating_sub(len)))
                .unwrap()
                .saturating_sub(len);
            if remaining <= WRITE_LOW_WATERMARK && paused.swap(false, Ordering::SeqCst) {
                notify.notify_waiters();
            }
        }
    });
}
