//! Bulk transfer engine for payloads larger than one frame (firmware images).
//!
//! `Idle → Announce → Transferring(chunk) → Completing → Done | Failed`.
//! One start/end handshake encloses the whole transfer; the chunks in
//! between go straight to the transport without acknowledgement.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io::{self, SeekFrom};
use std::path::Path;
use strum_macros::Display;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, trace};

use crate::constants::{FRAME_OVERHEAD, MAX_FRAME_PAYLOAD};
use crate::error::{FrameError, IspError, Result};
use crate::exchange::{Engine, Request};
use crate::frame;
use crate::packet::{PacketId, RequestKind};
use crate::pins::FlowPins;
use crate::transport::SerialBus;

/// How each chunk travels on the wire. Chosen once per transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, Serialize, Deserialize)]
#[repr(u8)]
pub enum ChunkFraming {
    /// Each chunk wrapped in a minimal `FwupData` frame (6 bytes overhead).
    #[default]
    #[strum(to_string = "enveloped")]
    Enveloped = 0,
    /// Bare chunk bytes; the peer knows the total length from the announce.
    #[strum(to_string = "payload-only")]
    PayloadOnly = 1,
}

impl ChunkFraming {
    fn overhead(self) -> usize {
        match self {
            ChunkFraming::Enveloped => FRAME_OVERHEAD,
            ChunkFraming::PayloadOnly => 0,
        }
    }
}

/// Progress of one bulk transfer, for tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkState {
    Idle,
    Announce,
    Transferring(usize),
    Completing,
    Done,
    Failed,
}

/// Summary of a finished transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferReport {
    pub total_bytes: usize,
    pub chunks: usize,
    pub framing: ChunkFraming,
}

/// Where the image bytes come from.
pub trait FirmwareSource {
    /// Total image size in bytes.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fill `buf` with the image bytes starting at `offset`.
    fn read_chunk(&mut self, offset: usize, buf: &mut [u8]) -> impl Future<Output = io::Result<()>> + Send;
}

/// An image already held in memory.
#[derive(Debug, Clone)]
pub struct MemorySource(Bytes);

impl MemorySource {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }
}

impl FirmwareSource for MemorySource {
    fn len(&self) -> usize {
        self.0.len()
    }

    async fn read_chunk(&mut self, offset: usize, buf: &mut [u8]) -> io::Result<()> {
        let src = self
            .0
            .get(offset..offset + buf.len())
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "read past end of image"))?;
        buf.copy_from_slice(src);
        Ok(())
    }
}

/// An image read from a file, chunk by chunk.
#[derive(Debug)]
pub struct FileSource {
    file: tokio::fs::File,
    len: usize,
}

impl FileSource {
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = tokio::fs::File::open(path).await?;
        let len = file.metadata().await?.len() as usize;
        Ok(Self { file, len })
    }
}

impl FirmwareSource for FileSource {
    fn len(&self) -> usize {
        self.len
    }

    async fn read_chunk(&mut self, offset: usize, buf: &mut [u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset as u64)).await?;
        self.file.read_exact(buf).await?;
        Ok(())
    }
}

impl<B: SerialBus + Send, P: FlowPins + Send> Engine<B, P> {
    /// Upload an image: announce, stream every chunk, then wait for the
    /// peer to finish programming.
    pub async fn transfer_firmware<S>(&mut self, source: &mut S, framing: ChunkFraming) -> Result<TransferReport>
    where
        S: FirmwareSource + Send,
    {
        match self.run_transfer(source, framing).await {
            Ok(report) => {
                trace!(state = ?BulkState::Done);
                Ok(report)
            }
            Err(err) => {
                trace!(state = ?BulkState::Failed);
                self.session().record_error(err.code());
                Err(err)
            }
        }
    }

    async fn run_transfer<S>(&mut self, source: &mut S, framing: ChunkFraming) -> Result<TransferReport>
    where
        S: FirmwareSource + Send,
    {
        trace!(state = ?BulkState::Idle);
        let chunk_size = self.config().firmware_chunk;
        if chunk_size == 0 || chunk_size + framing.overhead() > MAX_FRAME_PAYLOAD + FRAME_OVERHEAD {
            return Err(IspError::InvalidChunkSize(chunk_size));
        }
        let total = source.len();
        if total == 0 {
            return Err(FrameError::InvalidPayloadSize(0).into());
        }
        let total_u32 = u32::try_from(total).map_err(|_| FrameError::PayloadTooLarge {
            len: total,
            max: u32::MAX as usize,
        })?;
        let chunks = total.div_ceil(chunk_size);

        trace!(state = ?BulkState::Announce);
        info!(total, chunks, %framing, "starting firmware transfer");
        self.session().peer_event().clear();
        self.session().take_forced_wake();
        let mut announce = BytesMut::with_capacity(5);
        announce.put_u32_le(total_u32);
        announce.put_u8(framing as u8);
        let start = frame::encode_raw(PacketId::FwupStart, announce.freeze())?;
        self.exchange(Request::new(start, None, RequestKind::Firmware)).await?;

        let mut buf = vec![0u8; chunk_size];
        for index in 0..chunks {
            trace!(state = ?BulkState::Transferring(index));
            let offset = index * chunk_size;
            let len = chunk_size.min(total - offset);
            let chunk = &mut buf[..len];
            source.read_chunk(offset, chunk).await?;

            match framing {
                ChunkFraming::Enveloped => {
                    let data = frame::encode_raw(PacketId::FwupData, Bytes::copy_from_slice(chunk))?;
                    self.send_burst(&data.to_bytes(), len + FRAME_OVERHEAD).await?;
                }
                ChunkFraming::PayloadOnly => {
                    self.send_burst(chunk, chunk_size).await?;
                }
            }
            debug!(chunk = index + 1, of = chunks, sent = offset + len, "firmware chunk written");
        }

        trace!(state = ?BulkState::Completing);
        let complete = frame::encode_raw(PacketId::DataComplete, Bytes::new())?;
        self.exchange(Request::new(complete, None, RequestKind::Firmware)).await?;

        info!("image accepted, waiting for the peer to program it");
        let waited = self.config().timeouts.update_complete;
        if !self.session().peer_event().wait(waited).await || self.session().take_forced_wake() {
            return Err(IspError::Timeout {
                packet_id: PacketId::UpdateComplete,
                waited,
            });
        }
        let bytes = self.read_frame().await?;
        let event = frame::decode_event(&bytes, PacketId::UpdateComplete, None)?;
        self.accept_response(PacketId::UpdateComplete, event)?;

        info!(total, chunks, "firmware update complete");
        Ok(TransferReport {
            total_bytes: total,
            chunks,
            framing,
        })
    }
}
