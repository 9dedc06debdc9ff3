//! Frame codec: building and parsing the on-wire frame. Pure, no I/O.
//!
//! ```text
//! [len_lo][len_hi][packet_id][payload ...][0xFF][0xFF][checksum]
//! ```
//!
//! The length field holds the number of bytes that follow it, so a frame is
//! always `length + 2` bytes long. The checksum is the two's complement of
//! the 8-bit sum of every byte before it, terminator included, which makes
//! the sum of a whole valid frame zero modulo 256.
//!
//! "Set" and "command" frames carry a parameter record as their payload:
//!
//! ```text
//! [param_id_lo][param_id_hi][value_len][value ...]
//! ```
//!
//! and responses carry `[param_id_lo][param_id_hi][status][data ...]`.

use bytes::{BufMut, Bytes, BytesMut};

use crate::constants::{
    FRAME_OVERHEAD, HEADER_SIZE, LENGTH_FIELD_SIZE, MAX_FRAME_PAYLOAD, MAX_PARAM_VALUE, MIN_RESPONSE_LEN,
    PARAM_HEADER_SIZE, TERMINATOR,
};
use crate::error::FrameError;
use crate::packet::{PacketId, Status};

/// Two's complement of the 8-bit sum of `bytes`.
pub fn checksum(bytes: &[u8]) -> u8 {
    let sum = bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    (!sum).wrapping_add(1)
}

/// One frame: a packet ID and its payload. Length, terminator and checksum
/// are derived when the frame is encoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    packet_id: PacketId,
    payload: Bytes,
}

impl Frame {
    pub fn new(packet_id: PacketId, payload: impl Into<Bytes>) -> Result<Self, FrameError> {
        let payload = payload.into();
        if payload.len() > MAX_FRAME_PAYLOAD {
            return Err(FrameError::PayloadTooLarge {
                len: payload.len(),
                max: MAX_FRAME_PAYLOAD,
            });
        }
        Ok(Self { packet_id, payload })
    }

    pub fn packet_id(&self) -> PacketId {
        self.packet_id
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Byte count of the whole encoded frame, header and trailer included.
    pub fn total_length(&self) -> usize {
        FRAME_OVERHEAD + self.payload.len()
    }

    pub fn to_bytes(&self) -> Bytes {
        let total = self.total_length();
        let mut buf = BytesMut::with_capacity(total);
        // bounded by MAX_FRAME_PAYLOAD in `new`
        buf.put_u16_le((total - LENGTH_FIELD_SIZE) as u16);
        buf.put_u8(self.packet_id.into());
        buf.put_slice(&self.payload);
        buf.put_slice(&TERMINATOR);
        let cs = checksum(&buf);
        buf.put_u8(cs);
        buf.freeze()
    }

    /// Parse a complete frame. The checksum is reported, not enforced.
    pub fn parse(bytes: &[u8]) -> Result<ParsedFrame, FrameError> {
        if bytes.len() < FRAME_OVERHEAD {
            return Err(FrameError::TooShort {
                expected: FRAME_OVERHEAD,
                actual: bytes.len(),
            });
        }

        let declared = u16::from_le_bytes([bytes[0], bytes[1]]) as usize + LENGTH_FIELD_SIZE;
        if declared != bytes.len() {
            return Err(FrameError::LengthMismatch {
                declared,
                actual: bytes.len(),
            });
        }

        let end = bytes.len();
        let terminator = [bytes[end - 3], bytes[end - 2]];
        if terminator != TERMINATOR {
            return Err(FrameError::BadTerminator(terminator));
        }

        let expected = checksum(&bytes[..end - 1]);
        let actual = bytes[end - 1];
        let checksum = if expected == actual {
            ChecksumCheck::Valid
        } else {
            ChecksumCheck::Mismatch { expected, actual }
        };

        Ok(ParsedFrame {
            frame: Frame {
                packet_id: PacketId::from(bytes[2]),
                payload: Bytes::copy_from_slice(&bytes[HEADER_SIZE..end - 3]),
            },
            checksum,
        })
    }
}

/// Result of comparing a received checksum with the computed one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumCheck {
    Valid,
    Mismatch { expected: u8, actual: u8 },
}

impl ChecksumCheck {
    pub fn is_valid(&self) -> bool {
        matches!(self, ChecksumCheck::Valid)
    }
}

/// A frame as read from the wire, with its checksum verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFrame {
    pub frame: Frame,
    pub checksum: ChecksumCheck,
}

/// A validated response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedResponse {
    pub total_length: usize,
    pub packet_id: PacketId,
    pub parameter_id: u16,
    pub status: Status,
    pub data: Bytes,
    pub checksum: ChecksumCheck,
}

fn param_record(parameter_id: u16, value: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(PARAM_HEADER_SIZE + value.len());
    put_param_record(&mut buf, parameter_id, value);
    buf.freeze()
}

/// Append one `[id][len][value]` record to a batch buffer.
pub(crate) fn put_param_record(buf: &mut BytesMut, parameter_id: u16, value: &[u8]) {
    buf.put_u16_le(parameter_id);
    buf.put_u8(value.len() as u8);
    buf.put_slice(value);
}

/// Build a "set" frame for a 1, 2, 4 or 8 byte numeric value.
pub fn encode_set(packet_id: PacketId, parameter_id: u16, value: &[u8]) -> Result<Frame, FrameError> {
    match value.len() {
        1 | 2 | 4 | 8 => Frame::new(packet_id, param_record(parameter_id, value)),
        len => Err(FrameError::InvalidPayloadSize(len)),
    }
}

/// Build a frame carrying a parameter record of arbitrary length (up to 255 bytes).
pub fn encode_block(packet_id: PacketId, parameter_id: u16, value: &[u8]) -> Result<Frame, FrameError> {
    if value.len() > MAX_PARAM_VALUE {
        return Err(FrameError::InvalidPayloadSize(value.len()));
    }
    Frame::new(packet_id, param_record(parameter_id, value))
}

/// Build a query for a single parameter.
pub fn encode_query(parameter_id: u16) -> Frame {
    Frame {
        packet_id: PacketId::Query,
        payload: param_record(parameter_id, &[]),
    }
}

/// Build a frame carrying opaque bytes (opcodes, pre-built blocks, bulk data).
pub fn encode_raw(packet_id: PacketId, payload: impl Into<Bytes>) -> Result<Frame, FrameError> {
    Frame::new(packet_id, payload)
}

/// Validate a response to a request sent with `request_packet_id`.
///
/// `request_parameter_id` is `None` for raw requests, which skips the
/// parameter echo check.
pub fn decode_response(
    bytes: &[u8],
    request_packet_id: PacketId,
    request_parameter_id: Option<u16>,
) -> Result<ParsedResponse, FrameError> {
    decode_event(bytes, request_packet_id.response(), request_parameter_id)
}

/// Validate a response-shaped frame against an explicit packet ID.
pub fn decode_event(
    bytes: &[u8],
    expected_packet_id: PacketId,
    expected_parameter_id: Option<u16>,
) -> Result<ParsedResponse, FrameError> {
    if bytes.len() < MIN_RESPONSE_LEN {
        return Err(FrameError::TooShort {
            expected: MIN_RESPONSE_LEN,
            actual: bytes.len(),
        });
    }

    let ParsedFrame { frame, checksum } = Frame::parse(bytes)?;

    if frame.packet_id != expected_packet_id {
        return Err(FrameError::PacketIdMismatch {
            expected: expected_packet_id.into(),
            actual: frame.packet_id.into(),
        });
    }

    let payload = frame.payload;
    let parameter_id = u16::from_le_bytes([payload[0], payload[1]]);
    match expected_parameter_id {
        Some(expected) if expected != parameter_id => {
            return Err(FrameError::ParameterIdMismatch {
                expected,
                actual: parameter_id,
            });
        }
        _ => {}
    }

    Ok(ParsedResponse {
        total_length: bytes.len(),
        packet_id: frame.packet_id,
        parameter_id,
        status: Status::from(payload[2]),
        data: payload.slice(3..),
        checksum,
    })
}

/// Build a response frame, the peer side of `decode_response`.
pub fn encode_response(
    packet_id: PacketId,
    parameter_id: u16,
    status: u8,
    data: &[u8],
) -> Result<Frame, FrameError> {
    let mut buf = BytesMut::with_capacity(3 + data.len());
    buf.put_u16_le(parameter_id);
    buf.put_u8(status);
    buf.put_slice(data);
    Frame::new(packet_id, buf.freeze())
}

/// Split a batch buffer back into `(parameter_id, value)` records.
pub fn split_param_records(mut payload: &[u8]) -> Result<Vec<(u16, Bytes)>, FrameError> {
    let mut records = Vec::new();
    while !payload.is_empty() {
        if payload.len() < PARAM_HEADER_SIZE {
            return Err(FrameError::TooShort {
                expected: PARAM_HEADER_SIZE,
                actual: payload.len(),
            });
        }
        let id = u16::from_le_bytes([payload[0], payload[1]]);
        let len = payload[2] as usize;
        let rest = &payload[PARAM_HEADER_SIZE..];
        if rest.len() < len {
            return Err(FrameError::TooShort {
                expected: len,
                actual: rest.len(),
            });
        }
        records.push((id, Bytes::copy_from_slice(&rest[..len])));
        payload = &rest[len..];
    }
    Ok(records)
}
