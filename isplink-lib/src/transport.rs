//! Raw byte movement over the serial link. No framing knowledge lives here.

use bytes::{Bytes, BytesMut};
use std::future::Future;
use std::io;
use tracing::trace;

use crate::config::TransportConfig;

/// One transaction on the physical link.
///
/// Implementations wrap the actual bus driver (SPI device, test double, ...).
/// Each call is a single bus transaction; chunking is the caller's job.
pub trait SerialBus {
    /// Clock `data` out to the peer.
    fn transfer_out(&mut self, data: &[u8]) -> impl Future<Output = io::Result<()>> + Send;

    /// Clock `buf.len()` bytes in from the peer.
    fn transfer_in(&mut self, buf: &mut [u8]) -> impl Future<Output = io::Result<()>> + Send;
}

/// Chunked reads and writes over a [`SerialBus`].
pub struct Transport<B> {
    bus: B,
    config: TransportConfig,
}

impl<B: SerialBus> Transport<B> {
    pub fn new(bus: B, config: TransportConfig) -> Self {
        Self { bus, config }
    }

    /// Write `bytes` in command-sized chunks. The first failing chunk aborts the call.
    pub async fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        let chunk = self.config.write_chunk;
        self.write_chunked(bytes, chunk).await
    }

    /// Same as [`Self::write`] with the much larger firmware chunk size.
    pub async fn write_burst(&mut self, bytes: &[u8], chunk_size: usize) -> io::Result<()> {
        self.write_chunked(bytes, chunk_size).await
    }

    /// Read exactly `len` bytes in read-sized chunks.
    pub async fn read(&mut self, len: usize) -> io::Result<Bytes> {
        let mut buf = BytesMut::zeroed(len);
        for (i, chunk) in buf.chunks_mut(self.config.read_chunk.max(1)).enumerate() {
            trace!(chunk = i, len = chunk.len(), "bus read");
            self.bus.transfer_in(chunk).await?;
        }
        Ok(buf.freeze())
    }

    async fn write_chunked(&mut self, bytes: &[u8], chunk_size: usize) -> io::Result<()> {
        for (i, chunk) in bytes.chunks(chunk_size.max(1)).enumerate() {
            trace!(chunk = i, len = chunk.len(), "bus write");
            self.bus.transfer_out(chunk).await?;
        }
        Ok(())
    }
}
