use std::io;
use std::time::Duration;
use thiserror::Error;

use crate::packet::PacketId;

/// Errors produced while building or parsing a wire frame.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame too short: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },

    #[error("Length mismatch: frame declares {declared} bytes, received {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("Bad terminator: expected FF FF, got {0:02X?}")]
    BadTerminator([u8; 2]),

    #[error("Invalid payload size {0}")]
    InvalidPayloadSize(usize),

    #[error("Payload of {len} bytes exceeds the frame limit of {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("Packet ID mismatch: expected {expected:#04x}, got {actual:#04x}")]
    PacketIdMismatch { expected: u8, actual: u8 },

    #[error("Parameter ID mismatch: expected {expected:#06x}, got {actual:#06x}")]
    ParameterIdMismatch { expected: u16, actual: u16 },
}

/// The primary error type for the `isplink-lib` library.
#[derive(Error, Debug)]
pub enum IspError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Bus still busy after {attempts} attempts, link probably out of sync")]
    BusBusyTimeout { attempts: u32 },

    #[error("No response to {packet_id:?} within {waited:?}")]
    Timeout { packet_id: PacketId, waited: Duration },

    #[error("Response did not echo the request: {0}")]
    IdMismatch(FrameError),

    #[error("Peer reported error {code:#04x} for {packet_id:?}")]
    PeerReportedError { packet_id: PacketId, code: u8 },

    #[error("Checksum mismatch: computed {expected:#04x}, frame carries {actual:#04x}")]
    ChecksumMismatch { expected: u8, actual: u8 },

    #[error("Device not ready: boot failed, firmware recovery required")]
    BootError,

    #[error("Malformed frame: {0}")]
    Frame(FrameError),

    #[error("Invalid bulk chunk size {0}")]
    InvalidChunkSize(usize),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<FrameError> for IspError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::PacketIdMismatch { .. } | FrameError::ParameterIdMismatch { .. } => {
                IspError::IdMismatch(err)
            }
            other => IspError::Frame(other),
        }
    }
}

impl From<serde_json::Error> for IspError {
    fn from(err: serde_json::Error) -> Self {
        IspError::Config(err.to_string())
    }
}

// errno values used by the kernel-style negative return codes
const EIO: i32 = 5;
const ENODEV: i32 = 19;
const EBUSY: i32 = 16;
const EINVAL: i32 = 22;
const EPROTO: i32 = 71;
const EBADMSG: i32 = 74;
const ETIMEDOUT: i32 = 110;
const EREMOTEIO: i32 = 121;

impl IspError {
    /// Negative errno-style code for callers that log-and-continue.
    pub fn code(&self) -> i32 {
        let errno = match self {
            IspError::Io(_) => EIO,
            IspError::BusBusyTimeout { .. } => EBUSY,
            IspError::Timeout { .. } => ETIMEDOUT,
            IspError::IdMismatch(_) => EPROTO,
            IspError::PeerReportedError { .. } => EREMOTEIO,
            IspError::ChecksumMismatch { .. } | IspError::Frame(_) => EBADMSG,
            IspError::BootError => ENODEV,
            IspError::InvalidChunkSize(_) | IspError::Config(_) => EINVAL,
        };
        -errno
    }

    /// Pollers treat a timeout as "nothing happened".
    pub fn is_timeout(&self) -> bool {
        matches!(self, IspError::Timeout { .. })
    }
}

pub type Result<T> = std::result::Result<T, IspError>;
