use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};

use crate::bulk::{ChunkFraming, FirmwareSource, TransferReport};
use crate::config::LinkConfig;
use crate::constants::params;
use crate::error::{FrameError, IspError, Result};
use crate::exchange::{Engine, Request};
use crate::frame;
use crate::latch::IrqHandle;
use crate::packet::{NotificationId, PacketId, RequestKind};
use crate::pins::FlowPins;
use crate::session::{NotifyOwner, Session};
use crate::transport::SerialBus;

/// A value for one of the fixed-width setters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamValue {
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
}

impl ParamValue {
    fn to_le_bytes(self) -> Vec<u8> {
        match self {
            ParamValue::U8(v) => vec![v],
            ParamValue::U16(v) => v.to_le_bytes().to_vec(),
            ParamValue::U32(v) => v.to_le_bytes().to_vec(),
            ParamValue::U64(v) => v.to_le_bytes().to_vec(),
        }
    }
}

impl From<u8> for ParamValue {
    fn from(v: u8) -> Self {
        ParamValue::U8(v)
    }
}

impl From<u16> for ParamValue {
    fn from(v: u16) -> Self {
        ParamValue::U16(v)
    }
}

impl From<u32> for ParamValue {
    fn from(v: u32) -> Self {
        ParamValue::U32(v)
    }
}

impl From<u64> for ParamValue {
    fn from(v: u64) -> Self {
        ParamValue::U64(v)
    }
}

/// Public operations, as seen by the boot-error guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Initialize,
    SetParameter,
    WriteBlock,
    Query,
    RunCommand,
    PollNotification,
    EnterBatch,
    LeaveBatch,
    TransferFirmware,
}

impl Operation {
    pub fn is_state_changing(self) -> bool {
        !matches!(self, Operation::Query | Operation::PollNotification)
    }

    /// The one path allowed to run after a failed boot.
    pub fn is_recovery(self) -> bool {
        self == Operation::TransferFirmware
    }

    /// Whether the operation may run while the boot error is set. Leaving
    /// batch mode only drops buffered records then, so it stays open.
    pub fn allowed_after_boot_failure(self) -> bool {
        !self.is_state_changing() || self.is_recovery() || self == Operation::LeaveBatch
    }
}

/// Restores the notify line and owner when a notification poll ends, even
/// if the poll fails half way.
struct NotifyPoll<'a, B: SerialBus + Send, P: FlowPins + Send> {
    engine: MutexGuard<'a, Engine<B, P>>,
    previous: NotifyOwner,
}

impl<'a, B: SerialBus + Send, P: FlowPins + Send> NotifyPoll<'a, B, P> {
    fn begin(mut engine: MutexGuard<'a, Engine<B, P>>) -> Self {
        let previous = engine.session().set_notify_owner(NotifyOwner::Host);
        engine.pins_mut().set_notify_ready(true);
        Self { engine, previous }
    }
}

impl<B: SerialBus + Send, P: FlowPins + Send> Drop for NotifyPoll<'_, B, P> {
    fn drop(&mut self) {
        self.engine.pins_mut().set_notify_ready(false);
        self.engine.session().set_notify_owner(self.previous);
    }
}

/// Represents the link to one ISP.
///
/// Every public operation holds the device lock for its whole duration, so
/// at most one exchange or bulk transfer is in flight. Interrupt handlers
/// use [`Isp::irq_handle`] and never take the lock.
pub struct Isp<B, P> {
    engine: Mutex<Engine<B, P>>,
    session: Arc<Session>,
}

impl<B: SerialBus + Send, P: FlowPins + Send> Isp<B, P> {
    pub fn new(bus: B, pins: P, config: LinkConfig) -> Result<Self> {
        config.validate()?;
        let session = Arc::new(Session::new());
        let engine = Engine::new(bus, pins, session.clone(), config);
        Ok(Self {
            engine: Mutex::new(engine),
            session,
        })
    }

    /// Handle for the two interrupt handlers.
    pub fn irq_handle(&self) -> IrqHandle {
        IrqHandle::new(Arc::downgrade(&self.session))
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn boot_error(&self) -> bool {
        self.session.boot_error()
    }

    /// Negative code of the last failed exchange, 0 if none failed.
    pub fn last_error(&self) -> i32 {
        self.session.last_error()
    }

    /// Best-effort unblock of a pending peer-event wait (power-off path).
    /// The woken poll reports no notification and leaves the bus alone.
    pub fn abort_peer_wait(&self) {
        self.session.force_peer_wake();
    }

    /// Single entry point of every public operation: the device lock, then
    /// the sticky boot error check. The flag is read under the lock so a
    /// call queued behind a failing `initialize` sees its outcome.
    async fn lock(&self, op: Operation) -> Result<MutexGuard<'_, Engine<B, P>>> {
        let engine = self.engine.lock().await;
        if self.session.boot_error() && !op.allowed_after_boot_failure() {
            debug!(?op, "rejected: boot error pending");
            return Err(IspError::BootError);
        }
        Ok(engine)
    }

    /// Bring the device up: start the application firmware and read its
    /// version. Any failure leaves the device in the boot-error state.
    pub async fn initialize(&self) -> Result<String> {
        let mut engine = self.lock(Operation::Initialize).await?;
        info!("starting ISP application firmware");
        let result = Self::boot(&mut engine).await;
        match &result {
            Ok(version) => {
                info!(%version, "ISP ready");
                self.session.set_boot_error(false);
            }
            Err(err) => {
                error!("ISP bring-up failed: {err}");
                self.session.set_boot_error(true);
                if self.session.batch_mode() {
                    self.session.set_batch_mode(false);
                    let dropped = engine.discard_batch();
                    warn!(dropped, "batch mode abandoned after failed boot");
                }
            }
        }
        result
    }

    async fn boot(engine: &mut Engine<B, P>) -> Result<String> {
        let start = frame::encode_block(PacketId::Command, params::CMD_START_APP, &[])?;
        engine
            .exchange(Request::new(start, Some(params::CMD_START_APP), RequestKind::Boot))
            .await?;
        Self::read_version(engine).await
    }

    async fn read_version(engine: &mut Engine<B, P>) -> Result<String> {
        let query = frame::encode_query(params::FIRMWARE_VERSION);
        let data = engine
            .exchange(Request::new(query, Some(params::FIRMWARE_VERSION), RequestKind::Ordinary))
            .await?;
        let text = String::from_utf8_lossy(&data);
        Ok(text.trim_end_matches('\0').trim().to_string())
    }

    /// Firmware version string reported by the peer.
    pub async fn firmware_version(&self) -> Result<String> {
        let mut engine = self.lock(Operation::Query).await?;
        Self::read_version(&mut engine).await
    }

    /// Set a 1, 2, 4 or 8 byte parameter. Buffered while batch mode is on.
    pub async fn set_parameter(&self, parameter_id: u16, value: impl Into<ParamValue>) -> Result<()> {
        let value = value.into().to_le_bytes();
        let mut engine = self.lock(Operation::SetParameter).await?;
        if self.session.batch_mode() {
            return engine.queue_batch_record(parameter_id, &value);
        }
        let frame = frame::encode_set(PacketId::Set, parameter_id, &value)?;
        engine
            .exchange(Request::new(frame, Some(parameter_id), RequestKind::Ordinary))
            .await?;
        Ok(())
    }

    pub async fn set_u8(&self, parameter_id: u16, value: u8) -> Result<()> {
        self.set_parameter(parameter_id, value).await
    }

    pub async fn set_u16(&self, parameter_id: u16, value: u16) -> Result<()> {
        self.set_parameter(parameter_id, value).await
    }

    pub async fn set_u32(&self, parameter_id: u16, value: u32) -> Result<()> {
        self.set_parameter(parameter_id, value).await
    }

    pub async fn set_u64(&self, parameter_id: u16, value: u64) -> Result<()> {
        self.set_parameter(parameter_id, value).await
    }

    /// Write a parameter block of up to 255 bytes (EXIF blocks, focus triplets, ...).
    pub async fn write_block(&self, parameter_id: u16, data: &[u8], kind: RequestKind) -> Result<()> {
        let mut engine = self.lock(Operation::WriteBlock).await?;
        let frame = frame::encode_block(PacketId::Set, parameter_id, data)?;
        engine.exchange(Request::new(frame, Some(parameter_id), kind)).await?;
        Ok(())
    }

    /// Read a parameter's raw value.
    pub async fn query(&self, parameter_id: u16) -> Result<Bytes> {
        let mut engine = self.lock(Operation::Query).await?;
        let frame = frame::encode_query(parameter_id);
        engine
            .exchange(Request::new(frame, Some(parameter_id), RequestKind::Ordinary))
            .await
    }

    pub async fn query_u8(&self, parameter_id: u16) -> Result<u8> {
        let data = self.query(parameter_id).await?;
        Ok(fixed::<1>(&data)?[0])
    }

    pub async fn query_u16(&self, parameter_id: u16) -> Result<u16> {
        let data = self.query(parameter_id).await?;
        Ok(u16::from_le_bytes(fixed(&data)?))
    }

    pub async fn query_u32(&self, parameter_id: u16) -> Result<u32> {
        let data = self.query(parameter_id).await?;
        Ok(u32::from_le_bytes(fixed(&data)?))
    }

    /// Run a command with an optional argument block.
    pub async fn run_command(&self, command_id: u16, arg: &[u8], kind: RequestKind) -> Result<Bytes> {
        let mut engine = self.lock(Operation::RunCommand).await?;
        let frame = frame::encode_block(PacketId::Command, command_id, arg)?;
        engine.exchange(Request::new(frame, Some(command_id), kind)).await
    }

    /// Send a pre-built payload under any request packet ID (bypass, script, ...).
    pub async fn run_raw(&self, packet_id: PacketId, payload: Bytes, kind: RequestKind) -> Result<Bytes> {
        let mut engine = self.lock(Operation::RunCommand).await?;
        let frame = frame::encode_raw(packet_id, payload)?;
        engine.exchange(Request::new(frame, None, kind)).await
    }

    /// Check for an unsolicited peer event, waiting at most `timeout`.
    ///
    /// `Ok(None)` means nothing happened, including when the follow-up
    /// exchange times out.
    pub async fn poll_notification(&self, timeout: Duration) -> Result<Option<NotificationId>> {
        let engine = self.lock(Operation::PollNotification).await?;
        if !self.session.peer_event().wait(timeout).await {
            return Ok(None);
        }
        if self.session.take_forced_wake() {
            debug!("peer wait aborted, skipping notification exchange");
            return Ok(None);
        }

        let mut poll = NotifyPoll::begin(engine);
        let query = frame::encode_raw(PacketId::Notification, params::NOTIFY_STATUS.to_le_bytes().to_vec())?;
        let result = poll
            .engine
            .exchange(Request::new(query, Some(params::NOTIFY_STATUS), RequestKind::Ordinary))
            .await;
        drop(poll);

        match result {
            Ok(data) => {
                let id = NotificationId(u16::from_le_bytes(fixed(&data)?));
                debug!(%id, "peer notification");
                Ok(Some(id))
            }
            Err(err) if err.is_timeout() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Peek for a notification without stalling the caller.
    pub async fn peek_notification(&self) -> Result<Option<NotificationId>> {
        let peek = self.engine.lock().await.config().timeouts.peek;
        self.poll_notification(peek).await
    }

    /// Start buffering parameter sets into a single frame.
    pub async fn enter_batch_mode(&self) -> Result<()> {
        let engine = self.lock(Operation::EnterBatch).await?;
        if self.session.batch_mode() {
            warn!(buffered = engine.batched_len(), "already in batch mode");
            return Ok(());
        }
        self.session.set_batch_mode(true);
        debug!("batch mode on");
        Ok(())
    }

    /// Stop buffering and send everything buffered as one exchange.
    pub async fn leave_batch_mode(&self) -> Result<()> {
        let mut engine = self.lock(Operation::LeaveBatch).await?;
        if !self.session.batch_mode() {
            return Ok(());
        }
        self.session.set_batch_mode(false);
        if self.session.boot_error() {
            let dropped = engine.discard_batch();
            warn!(dropped, "batch dropped, peer failed to boot");
            return Ok(());
        }
        debug!(buffered = engine.batched_len(), "batch mode off");
        engine.flush_batch().await
    }

    /// Upload a new firmware image. This is the recovery path: it is allowed
    /// while the boot error is set and clears it on success. Callers should
    /// run [`Isp::initialize`] again afterwards.
    pub async fn transfer_firmware<S>(&self, source: &mut S, framing: ChunkFraming) -> Result<TransferReport>
    where
        S: FirmwareSource + Send,
    {
        let mut engine = self.lock(Operation::TransferFirmware).await?;
        let report = engine.transfer_firmware(source, framing).await?;
        if self.session.boot_error() {
            info!("firmware recovered, clearing boot error");
            self.session.set_boot_error(false);
        }
        Ok(report)
    }
}

fn fixed<const N: usize>(data: &[u8]) -> Result<[u8; N]> {
    data.get(..N)
        .and_then(|head| head.try_into().ok())
        .ok_or_else(|| FrameError::TooShort { expected: N, actual: data.len() }.into())
}
