//! Exchange engine: the single path every correlated request/response takes.
//!
//! One exchange walks `Idle → Sending → AwaitingEvent → Reading → Validating`
//! and ends in `Done` or `Failed`. Exchanges are never pipelined and never
//! retried here; only the pre-send busy wait loops.

use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::config::LinkConfig;
use crate::constants::{LENGTH_FIELD_SIZE, MAX_FRAME_PAYLOAD, MAX_PARAM_VALUE, MAX_RESPONSE_LEN, PARAM_HEADER_SIZE};
use crate::error::{FrameError, IspError, Result};
use crate::frame::{self, Frame, ParsedResponse, put_param_record};
use crate::packet::{PacketId, RequestKind, Status};
use crate::pins::{BusyBackoff, FlowPins, LineSample};
use crate::session::Session;
use crate::transport::{SerialBus, Transport};

/// Progress of one exchange, for tracing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    Idle,
    Sending,
    AwaitingEvent,
    Reading,
    Validating,
    Done,
    Failed,
}

/// A request frame plus what is needed to validate its response.
#[derive(Debug, Clone)]
pub struct Request {
    pub frame: Frame,
    /// Parameter ID the response must echo; `None` for raw frames.
    pub parameter_id: Option<u16>,
    pub kind: RequestKind,
}

impl Request {
    pub fn new(frame: Frame, parameter_id: Option<u16>, kind: RequestKind) -> Self {
        Self {
            frame,
            parameter_id,
            kind,
        }
    }
}

/// Owns the link hardware for one device. Always used behind the device lock.
pub struct Engine<B, P> {
    transport: Transport<B>,
    pins: P,
    session: Arc<Session>,
    config: LinkConfig,
    batch: BytesMut,
}

impl<B: SerialBus + Send, P: FlowPins + Send> Engine<B, P> {
    pub fn new(bus: B, pins: P, session: Arc<Session>, config: LinkConfig) -> Self {
        Self {
            transport: Transport::new(bus, config.transport),
            pins,
            session,
            config,
            batch: BytesMut::new(),
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn pins_mut(&mut self) -> &mut P {
        &mut self.pins
    }

    /// Send one request and return the response data.
    pub async fn exchange(&mut self, request: Request) -> Result<Bytes> {
        let packet_id = request.frame.packet_id();
        match self.run_exchange(&request).await {
            Ok(data) => {
                trace!(?packet_id, state = ?ExchangeState::Done);
                Ok(data)
            }
            Err(err) => {
                trace!(?packet_id, state = ?ExchangeState::Failed);
                debug!(?packet_id, parameter_id = ?request.parameter_id, "exchange failed: {err}");
                self.session.record_error(err.code());
                Err(err)
            }
        }
    }

    async fn run_exchange(&mut self, request: &Request) -> Result<Bytes> {
        let packet_id = request.frame.packet_id();
        trace!(?packet_id, state = ?ExchangeState::Idle);

        trace!(?packet_id, state = ?ExchangeState::Sending);
        self.send_frame(&request.frame.to_bytes()).await?;

        trace!(?packet_id, state = ?ExchangeState::AwaitingEvent);
        let waited = request.kind.wait(&self.config.timeouts);
        if !self.session.ap_event().wait(waited).await {
            return Err(IspError::Timeout { packet_id, waited });
        }

        trace!(?packet_id, state = ?ExchangeState::Reading);
        let bytes = self.read_frame().await?;

        trace!(?packet_id, state = ?ExchangeState::Validating);
        let response = frame::decode_response(&bytes, packet_id, request.parameter_id)?;
        self.accept_response(packet_id, response)
    }

    /// Apply the checksum policy and the status byte to a decoded response.
    pub(crate) fn accept_response(&self, packet_id: PacketId, response: ParsedResponse) -> Result<Bytes> {
        if let frame::ChecksumCheck::Mismatch { expected, actual } = response.checksum {
            if self.config.strict_checksum {
                return Err(IspError::ChecksumMismatch { expected, actual });
            }
            warn!(
                ?packet_id,
                "response checksum mismatch (computed {expected:#04x}, got {actual:#04x}), using it anyway"
            );
        }
        match response.status {
            Status::Ok => Ok(response.data),
            Status::Error(code) => Err(IspError::PeerReportedError { packet_id, code }),
        }
    }

    /// Busy-check, then clock `bytes` out with `cmd_ready` asserted.
    pub(crate) async fn send_frame(&mut self, bytes: &[u8]) -> Result<()> {
        self.send_with(bytes, None).await
    }

    /// As [`Self::send_frame`], in bursts of `chunk_size` bytes.
    pub(crate) async fn send_burst(&mut self, bytes: &[u8], chunk_size: usize) -> Result<()> {
        self.send_with(bytes, Some(chunk_size)).await
    }

    async fn send_with(&mut self, bytes: &[u8], burst: Option<usize>) -> Result<()> {
        self.wait_bus_idle().await?;
        // a late response to an earlier, abandoned exchange must not satisfy this one
        self.session.ap_event().clear();
        debug!(len = bytes.len(), head = hex::encode(&bytes[..bytes.len().min(16)]), "tx");
        self.pins.set_cmd_ready(true);
        let result = match burst {
            Some(chunk_size) => self.transport.write_burst(bytes, chunk_size).await,
            None => self.transport.write(bytes).await,
        };
        self.pins.set_cmd_ready(false);
        result.map_err(IspError::from)
    }

    /// Read one frame: the length field first, then the rest of it.
    pub(crate) async fn read_frame(&mut self) -> Result<Bytes> {
        let head = self.transport.read(LENGTH_FIELD_SIZE).await?;
        let declared = u16::from_le_bytes([head[0], head[1]]) as usize;
        // an oversize declaration is read truncated and rejected by the decoder
        let remaining = declared.min(MAX_RESPONSE_LEN - LENGTH_FIELD_SIZE);
        let body = self.transport.read(remaining).await?;

        let mut bytes = BytesMut::with_capacity(LENGTH_FIELD_SIZE + remaining);
        bytes.extend_from_slice(&head);
        bytes.extend_from_slice(&body);
        let bytes = bytes.freeze();
        debug!(bytes = hex::encode(&bytes), "rx");
        Ok(bytes)
    }

    /// Wait until the flow-control lines allow the host to send.
    ///
    /// Returns the number of failed attempts before the bus freed up.
    pub(crate) async fn wait_bus_idle(&mut self) -> Result<u32> {
        let policy = self.config.retry;
        let mut backoff = BusyBackoff::new(policy);
        let mut drained = false;

        loop {
            let sample = LineSample::take(&mut self.pins);
            if sample.is_ready(self.session.notify_owner()) {
                if backoff.attempts() > 0 {
                    debug!(attempts = backoff.attempts(), "bus free after busy wait");
                }
                return Ok(backoff.attempts());
            }

            self.pins.set_cmd_ready(false);

            if !drained
                && backoff.attempts() >= policy.drain_after
                && self.session.peer_event().is_pending()
                && sample.events_idle()
            {
                drained = true;
                self.drain_unread_frame().await;
                continue;
            }

            match backoff.next() {
                Some(pause) => tokio::time::sleep(pause).await,
                None => {
                    warn!(attempts = backoff.attempts(), ?sample, "bus never became free");
                    return Err(IspError::BusBusyTimeout {
                        attempts: backoff.attempts(),
                    });
                }
            }
        }
    }

    /// Recover from a missed acknowledgement by reading the frame the peer
    /// is still holding for us.
    async fn drain_unread_frame(&mut self) {
        self.session.peer_event().clear();
        match self.read_frame().await {
            Ok(bytes) => warn!(bytes = hex::encode(&bytes), "drained unread frame from peer"),
            Err(err) => warn!("failed to drain unread frame: {err}"),
        }
    }

    /// Buffer one parameter record while batch mode is on.
    pub fn queue_batch_record(&mut self, parameter_id: u16, value: &[u8]) -> Result<()> {
        if value.len() > MAX_PARAM_VALUE {
            return Err(FrameError::InvalidPayloadSize(value.len()).into());
        }
        let len = self.batch.len() + PARAM_HEADER_SIZE + value.len();
        if len > MAX_FRAME_PAYLOAD {
            return Err(FrameError::PayloadTooLarge {
                len,
                max: MAX_FRAME_PAYLOAD,
            }
            .into());
        }
        put_param_record(&mut self.batch, parameter_id, value);
        trace!(parameter_id, buffered = self.batch.len(), "batched parameter");
        Ok(())
    }

    pub fn batched_len(&self) -> usize {
        self.batch.len()
    }

    /// Send every buffered record as one `WriteMulti` frame and await a
    /// single acknowledgement. Per-record errors are not distinguishable.
    pub async fn flush_batch(&mut self) -> Result<()> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let payload = self.batch.split().freeze();
        debug!(len = payload.len(), "flushing parameter batch");
        let frame = frame::encode_raw(PacketId::WriteMulti, payload)?;
        self.exchange(Request::new(frame, None, RequestKind::Batch)).await?;
        Ok(())
    }

    /// Discard buffered records without sending them.
    pub fn discard_batch(&mut self) -> usize {
        let dropped = self.batch.len();
        self.batch.clear();
        dropped
    }
}
