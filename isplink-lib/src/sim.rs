//! A simulated ISP peer.
//!
//! [`SimulatedIsp`] speaks the peer side of the protocol: it parses the
//! frames the host clocks out, keeps a parameter table, answers with
//! response frames and raises the host's interrupts through an
//! [`IrqHandle`]. Fault knobs in [`SimBehavior`] reproduce a silent,
//! busy or misbehaving peer.

use bytes::{Buf, Bytes, BytesMut};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, trace, warn};

use crate::bulk::ChunkFraming;
use crate::constants::{LENGTH_FIELD_SIZE, STATUS_OK};
use crate::frame::{self, Frame};
use crate::latch::IrqHandle;
use crate::packet::PacketId;
use crate::pins::FlowPins;
use crate::transport::SerialBus;

/// Status byte the simulator answers unknown requests with.
pub const STATUS_UNSUPPORTED: u8 = 0xFF;

/// Status byte for a request whose checksum did not add up.
pub const STATUS_BAD_CHECKSUM: u8 = 0xEC;

/// Status byte of an `UpdateComplete` event after an incomplete image.
pub const STATUS_IMAGE_INCOMPLETE: u8 = 0x02;

/// How long the simulated peer keeps the AP-ready line deasserted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BusyMode {
    #[default]
    Never,
    Forever,
    /// Busy for this many line samples, then free.
    Samples(u32),
}

/// Fault injection knobs.
#[derive(Debug, Clone, Default)]
pub struct SimBehavior {
    /// Never answer and never raise the response interrupt.
    pub silent: bool,
    /// Flip the checksum byte of every response.
    pub corrupt_checksum: bool,
    /// Answer with the wrong response packet ID.
    pub echo_wrong_packet: bool,
    /// Answer with a different parameter ID than requested.
    pub echo_wrong_parameter: bool,
    /// Report this status code instead of success.
    pub fail_status: Option<u8>,
    /// Fail every bus write.
    pub fail_writes: bool,
    /// Raise the response interrupt this long after the request.
    pub response_delay: Option<Duration>,
    /// Accept a firmware image but never report the update as complete.
    pub withhold_update_complete: bool,
    pub busy: BusyMode,
}

#[derive(Debug)]
struct FirmwareRx {
    total: usize,
    framing: ChunkFraming,
    received: Vec<u8>,
}

impl FirmwareRx {
    fn is_complete(&self) -> bool {
        self.received.len() >= self.total
    }
}

#[derive(Debug, Default)]
struct SimState {
    behavior: SimBehavior,
    irq: Option<IrqHandle>,
    rx: BytesMut,
    tx: VecDeque<u8>,
    params: HashMap<u16, Bytes>,
    notifications: VecDeque<u16>,
    firmware: Option<FirmwareRx>,
    image: Option<Vec<u8>>,
    out_transfers: Vec<usize>,
    frames: Vec<PacketId>,
    line_samples: u32,
    busy_samples: u32,
    cmd_ready: bool,
    notify_ready: bool,
}

impl SimState {
    fn ap_ready(&mut self) -> bool {
        self.line_samples += 1;
        let busy = match self.behavior.busy {
            BusyMode::Never => false,
            BusyMode::Forever => true,
            BusyMode::Samples(n) => {
                self.busy_samples += 1;
                self.busy_samples <= n
            }
        };
        // the peer holds the line while a frame waits to be read
        !busy && self.tx.is_empty()
    }

    fn receive(&mut self, data: &[u8]) {
        self.rx.extend_from_slice(data);
        loop {
            if let Some(fw) = self.firmware.as_mut() {
                if fw.framing == ChunkFraming::PayloadOnly && !fw.is_complete() {
                    let take = self.rx.len().min(fw.total - fw.received.len());
                    fw.received.extend_from_slice(&self.rx.split_to(take));
                    if !fw.is_complete() {
                        break;
                    }
                    debug!(len = fw.received.len(), "sim: payload-only image received");
                    continue;
                }
            }

            if self.rx.len() < LENGTH_FIELD_SIZE {
                break;
            }
            let declared = u16::from_le_bytes([self.rx[0], self.rx[1]]) as usize + LENGTH_FIELD_SIZE;
            if self.rx.len() < declared {
                break;
            }
            let bytes = self.rx.split_to(declared).freeze();
            self.handle_frame(&bytes);
        }
    }

    fn handle_frame(&mut self, bytes: &[u8]) {
        let parsed = match Frame::parse(bytes) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!("sim: dropping malformed frame: {err}");
                return;
            }
        };
        let packet_id = parsed.frame.packet_id();
        let payload = parsed.frame.payload().clone();
        self.frames.push(packet_id);
        trace!(?packet_id, len = payload.len(), "sim: frame");

        let parameter_id = if payload.len() >= 2 {
            u16::from_le_bytes([payload[0], payload[1]])
        } else {
            0
        };

        if !parsed.checksum.is_valid() {
            self.respond(packet_id.response(), parameter_id, STATUS_BAD_CHECKSUM, &[]);
            return;
        }

        match packet_id {
            PacketId::Set | PacketId::Command => {
                match frame::split_param_records(&payload) {
                    Ok(records) => {
                        if packet_id == PacketId::Set {
                            self.params.extend(records);
                        }
                        self.respond(packet_id.response(), parameter_id, STATUS_OK, &[]);
                    }
                    Err(_) => self.respond(packet_id.response(), parameter_id, STATUS_UNSUPPORTED, &[]),
                }
            }
            PacketId::Query => {
                let value = self
                    .params
                    .get(&parameter_id)
                    .cloned()
                    .unwrap_or_else(|| Bytes::from_static(&[0]));
                self.respond(PacketId::QueryRes, parameter_id, STATUS_OK, &value);
            }
            PacketId::WriteMulti => match frame::split_param_records(&payload) {
                Ok(records) => {
                    debug!(count = records.len(), "sim: batch");
                    self.params.extend(records);
                    self.respond(PacketId::WriteMultiRes, 0, STATUS_OK, &[]);
                }
                Err(_) => self.respond(PacketId::WriteMultiRes, 0, STATUS_UNSUPPORTED, &[]),
            },
            PacketId::Notification => {
                let id = self.notifications.pop_front().unwrap_or(0);
                self.respond(PacketId::NotificationRes, parameter_id, STATUS_OK, &id.to_le_bytes());
            }
            PacketId::Bypass => {
                self.respond(PacketId::BypassRes, 0, STATUS_OK, &payload);
            }
            PacketId::FwupStart => self.start_firmware(&payload),
            PacketId::FwupData => match self.firmware.as_mut() {
                Some(fw) if fw.framing == ChunkFraming::Enveloped => fw.received.extend_from_slice(&payload),
                _ => warn!("sim: firmware data outside of an update"),
            },
            PacketId::DataComplete => self.finish_firmware(),
            other => {
                warn!(?other, "sim: unsupported request");
                self.respond(other.response(), parameter_id, STATUS_UNSUPPORTED, &[]);
            }
        }
    }

    fn start_firmware(&mut self, mut payload: &[u8]) {
        if payload.len() < 5 {
            self.respond(PacketId::FwupReady, 0, STATUS_UNSUPPORTED, &[]);
            return;
        }
        let total = payload.get_u32_le() as usize;
        let framing = match payload.get_u8() {
            1 => ChunkFraming::PayloadOnly,
            _ => ChunkFraming::Enveloped,
        };
        debug!(total, %framing, "sim: firmware update announced");
        self.firmware = Some(FirmwareRx {
            total,
            framing,
            received: Vec::with_capacity(total),
        });
        self.respond(PacketId::FwupReady, 0, STATUS_OK, &[]);
    }

    fn finish_firmware(&mut self) {
        self.respond(PacketId::DataCompleteRes, 0, STATUS_OK, &[]);
        let status = match self.firmware.take() {
            Some(fw) if fw.received.len() == fw.total => {
                self.image = Some(fw.received);
                STATUS_OK
            }
            Some(fw) => {
                warn!(got = fw.received.len(), want = fw.total, "sim: incomplete image");
                STATUS_IMAGE_INCOMPLETE
            }
            None => STATUS_IMAGE_INCOMPLETE,
        };
        if self.behavior.silent || self.behavior.withhold_update_complete {
            return;
        }
        if let Ok(event) = frame::encode_response(PacketId::UpdateComplete, 0, status, &[]) {
            self.tx.extend(event.to_bytes());
            if let Some(irq) = &self.irq {
                irq.on_peer_interrupt();
            }
        }
    }

    fn respond(&mut self, packet_id: PacketId, parameter_id: u16, status: u8, data: &[u8]) {
        if self.behavior.silent {
            return;
        }
        let packet_id = if self.behavior.echo_wrong_packet {
            PacketId::from(u8::from(packet_id).wrapping_add(2))
        } else {
            packet_id
        };
        let parameter_id = if self.behavior.echo_wrong_parameter {
            parameter_id.wrapping_add(1)
        } else {
            parameter_id
        };
        let status = self.behavior.fail_status.unwrap_or(status);

        let response = match frame::encode_response(packet_id, parameter_id, status, data) {
            Ok(response) => response,
            Err(err) => {
                warn!("sim: cannot build response: {err}");
                return;
            }
        };
        let mut bytes = response.to_bytes().to_vec();
        if self.behavior.corrupt_checksum {
            if let Some(last) = bytes.last_mut() {
                *last ^= 0xA5;
            }
        }
        self.tx.extend(bytes);

        if let Some(irq) = self.irq.clone() {
            match self.behavior.response_delay {
                Some(delay) => {
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        irq.on_ap_interrupt();
                    });
                }
                None => irq.on_ap_interrupt(),
            }
        }
    }
}

/// Shared handle to the simulated peer; clones see the same state.
#[derive(Debug, Clone, Default)]
pub struct SimulatedIsp {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedIsp {
    pub fn new(behavior: SimBehavior) -> Self {
        let sim = Self::default();
        sim.state().behavior = behavior;
        sim
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The bus end to hand to [`crate::Isp::new`].
    pub fn bus(&self) -> SimBus {
        SimBus { sim: self.clone() }
    }

    /// The GPIO end to hand to [`crate::Isp::new`].
    pub fn pins(&self) -> SimPins {
        SimPins { sim: self.clone() }
    }

    /// Connect the peer's interrupt lines to the host.
    pub fn attach(&self, irq: IrqHandle) {
        self.state().irq = Some(irq);
    }

    pub fn set_behavior(&self, behavior: SimBehavior) {
        let mut state = self.state();
        state.behavior = behavior;
        state.busy_samples = 0;
    }

    pub fn set_param(&self, parameter_id: u16, value: impl Into<Bytes>) {
        self.state().params.insert(parameter_id, value.into());
    }

    pub fn param(&self, parameter_id: u16) -> Option<Bytes> {
        self.state().params.get(&parameter_id).cloned()
    }

    /// Queue an unsolicited event: assert the notify line and raise the
    /// peer interrupt.
    pub fn raise_notification(&self, id: u16) {
        let mut state = self.state();
        state.notifications.push_back(id);
        if let Some(irq) = &state.irq {
            irq.on_peer_interrupt();
        }
    }

    /// Leave a frame in the output queue whose acknowledgement the host
    /// missed, and raise the peer interrupt for it.
    pub fn inject_unread_frame(&self, frame: &Frame) {
        let mut state = self.state();
        state.tx.extend(frame.to_bytes());
        if let Some(irq) = &state.irq {
            irq.on_peer_interrupt();
        }
    }

    /// Sizes of every bus write transaction so far.
    pub fn out_transfers(&self) -> Vec<usize> {
        self.state().out_transfers.clone()
    }

    /// Packet IDs of every frame received so far.
    pub fn frames_received(&self) -> Vec<PacketId> {
        self.state().frames.clone()
    }

    /// The last completely received firmware image.
    pub fn received_image(&self) -> Option<Vec<u8>> {
        self.state().image.clone()
    }

    pub fn line_samples(&self) -> u32 {
        self.state().line_samples
    }

    pub fn unread_bytes(&self) -> usize {
        self.state().tx.len()
    }

    pub fn cmd_ready(&self) -> bool {
        self.state().cmd_ready
    }

    pub fn notify_ready(&self) -> bool {
        self.state().notify_ready
    }
}

/// Bus end of the simulated peer.
#[derive(Debug, Clone)]
pub struct SimBus {
    sim: SimulatedIsp,
}

impl SerialBus for SimBus {
    async fn transfer_out(&mut self, data: &[u8]) -> io::Result<()> {
        let mut state = self.sim.state();
        if state.behavior.fail_writes {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "simulated bus fault"));
        }
        state.out_transfers.push(data.len());
        state.receive(data);
        Ok(())
    }

    async fn transfer_in(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let mut state = self.sim.state();
        for byte in buf.iter_mut() {
            *byte = state.tx.pop_front().unwrap_or(0);
        }
        Ok(())
    }
}

/// GPIO end of the simulated peer.
#[derive(Debug, Clone)]
pub struct SimPins {
    sim: SimulatedIsp,
}

impl FlowPins for SimPins {
    fn set_cmd_ready(&mut self, asserted: bool) {
        self.sim.state().cmd_ready = asserted;
    }

    fn set_notify_ready(&mut self, asserted: bool) {
        self.sim.state().notify_ready = asserted;
    }

    fn ap_interrupt_asserted(&mut self) -> bool {
        self.sim.state().ap_ready()
    }

    fn peer_interrupt_asserted(&mut self) -> bool {
        false
    }

    fn notify_line_asserted(&mut self) -> bool {
        !self.sim.state().notifications.is_empty()
    }
}
