use num_enum::{FromPrimitive, IntoPrimitive};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use strum_macros::Display;

use crate::config::Timeouts;

/// Packet identifiers carried in the third byte of every frame.
///
/// Requests have an even value; the peer acknowledges with the value plus one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum PacketId {
    Query = 0x80,
    QueryRes = 0x81,
    Set = 0x82,
    SetRes = 0x83,
    Command = 0x84,
    CommandRes = 0x85,
    Notification = 0x86,
    NotificationRes = 0x87,
    WriteMulti = 0x88,
    WriteMultiRes = 0x89,

    // factory/bypass sub-protocol
    Bypass = 0x90,
    BypassRes = 0x91,

    // firmware update sub-protocol
    FwupStart = 0xE0,
    FwupReady = 0xE1,
    DataComplete = 0xE2,
    DataCompleteRes = 0xE3,
    UpdateComplete = 0xE5,
    FwupData = 0xF0,

    #[num_enum(catch_all)]
    Unknown(u8),
}

impl PacketId {
    /// The packet ID a well-formed peer answers this request with.
    pub fn response(self) -> PacketId {
        let value: u8 = self.into();
        PacketId::from_primitive(value.wrapping_add(1))
    }

    pub fn is_response(self) -> bool {
        let value: u8 = self.into();
        value & 1 == 1
    }
}

/// How long a request may keep the peer busy before its response event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
pub enum RequestKind {
    Ordinary,
    LiveviewPrepare,
    FlashWrite,
    Script,
    Batch,
    Boot,
    Firmware,
}

impl RequestKind {
    pub fn wait(self, timeouts: &Timeouts) -> Duration {
        match self {
            RequestKind::Ordinary => timeouts.short,
            RequestKind::LiveviewPrepare
            | RequestKind::FlashWrite
            | RequestKind::Script
            | RequestKind::Batch => timeouts.medium,
            RequestKind::Boot | RequestKind::Firmware => timeouts.long,
        }
    }
}

/// Status byte of a response frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Error(u8),
}

impl From<u8> for Status {
    fn from(value: u8) -> Self {
        match value {
            crate::constants::STATUS_OK => Status::Ok,
            code => Status::Error(code),
        }
    }
}

impl From<Status> for u8 {
    fn from(status: Status) -> Self {
        match status {
            Status::Ok => crate::constants::STATUS_OK,
            Status::Error(code) => code,
        }
    }
}

/// Identifier of an unsolicited peer event, as reported by a notification poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NotificationId(pub u16);

impl fmt::Display for NotificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "notification {:#06x}", self.0)
    }
}
