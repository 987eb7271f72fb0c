//! Transport-layer abstraction over serial ports and raw TCP sockets.
//!
//! Both transports present the same read/write surface; the network
//! transport additionally enforces software write-buffer watermarks
//! (high=1024, low=256 bytes) ahead of the OS socket buffer, since
//! `TcpStream::write` alone gives no visibility into how much unsent data
//! is actually queued.

mod network;
mod serial;

use std::time::Duration;

use crate::config::ConnectionDescriptor;
use crate::CommsResult;

pub(crate) use network::NetworkTransport;
pub(crate) use serial::SerialTransport;

/// Read chunk size used when polling the underlying link.
pub(crate) const READ_CHUNK_SIZE: usize = 256;

/// High-watermark: writers should stop queueing more data once the
/// software outbound buffer reaches this many bytes.
pub(crate) const WRITE_HIGH_WATERMARK: usize = 1024;

/// Low-watermark: writers may resume once the buffer drains back to this.
pub(crate) const WRITE_LOW_WATERMARK: usize = 256;

/// A live duplex link to the controller, dispatched over the two
/// concrete implementations. An enum rather than `Box<dyn Transport>`
/// because the read/write paths are `async fn`s and therefore not
/// object-safe without extra boxing machinery.
#[derive(Debug)]
pub(crate) enum Transport {
    Serial(SerialTransport),
    Network(NetworkTransport),
}

impl Transport {
    pub(crate) async fn open(descriptor: &ConnectionDescriptor) -> CommsResult<Self> {
        match descriptor {
            ConnectionDescriptor::Serial { path, baud } => {
                Ok(Transport::Serial(SerialTransport::open(path, *baud)?))
            }
            ConnectionDescriptor::Network { host, port } => Ok(Transport::Network(
                NetworkTransport::open(host, *port).await?,
            )),
        }
    }

    /// Queues `data` for transmission. Returns immediately; backpressure is
    /// observed through [`Transport::drain`].
    pub(crate) fn write(&self, data: Vec<u8>) -> CommsResult<()> {
        match self {
            Transport::Serial(t) => t.write(data),
            Transport::Network(t) => t.write(data),
        }
    }

    /// Resolves once the write buffer has drained below its low watermark
    /// (immediately if it was never above the high one). Fails with
    /// `ConnectionLost` if the link closes while this is pending.
    pub(crate) async fn drain(&self) -> CommsResult<()> {
        match self {
            Transport::Serial(t) => t.drain().await,
            Transport::Network(t) => t.drain().await,
        }
    }

    /// Reads the next available chunk, waiting up to `timeout` for data to arrive.
    pub(crate) async fn read_chunk(&self, timeout: Duration) -> CommsResult<Vec<u8>> {
        match self {
            Transport::Serial(t) => t.read_chunk(timeout).await,
            Transport::Network(t) => t.read_chunk(timeout).await,
        }
    }

    pub(crate) async fn close(&self) -> CommsResult<()> {
        match self {
            Transport::Serial(t) => t.close(),
            Transport::Network(t) => t.close().await,
        }
    }

    /// Best-effort: drops any bytes still sitting in the software outbound
    /// queue rather than letting them trickle out after an alarm.
    /// Bytes already handed to the OS are not recalled.
    pub(crate) fn discard_queue(&self) {
        match self {
            Transport::Serial(t) => t.discard_queue(),
            Transport::Network(t) => t.discard_queue(),
        }
    }
}
