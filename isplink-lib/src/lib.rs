//! Command/response link between a host application processor (AP) and an
//! image signal processor (ISP) over a half-duplex serial bus.
//!
//! - [`frame`]: wire frame codec and checksum
//! - [`transport`]: chunked byte movement over a [`transport::SerialBus`]
//! - [`pins`]: flow-control lines and the busy-wait schedule
//! - [`latch`]: interrupt latches and the [`latch::IrqHandle`] given to ISRs
//! - [`exchange`]: the request/response engine
//! - [`bulk`]: chunked firmware upload
//! - [`device`]: [`Isp`], the locked public entry point
//! - [`sim`]: a simulated peer for tools and tests

pub mod bulk;
pub mod config;
pub mod constants;
pub mod device;
pub mod error;
pub mod exchange;
pub mod frame;
pub mod latch;
pub mod packet;
pub mod pins;
pub mod session;
pub mod sim;
pub mod transport;


pub use bulk::{ChunkFraming, FileSource, FirmwareSource, MemorySource, TransferReport};
pub use config::LinkConfig;
pub use device::{Isp, ParamValue};
pub use error::{FrameError, IspError};
pub use latch::IrqHandle;
pub use packet::{NotificationId, PacketId, RequestKind};
