//! Common test utilities and shared imports

// Shared across test files; not every item is used in every file
#[allow(unused_imports)]
pub use bytes::Bytes;
#[allow(unused_imports)]
pub use hex;
#[allow(unused_imports)]
pub use isplink_lib::bulk::{ChunkFraming, FileSource, MemorySource, TransferReport};
#[allow(unused_imports)]
pub use isplink_lib::config::{LinkConfig, RetryPolicy, Timeouts};
#[allow(unused_imports)]
pub use isplink_lib::constants::{DEFAULT_FIRMWARE_CHUNK, params};
#[allow(unused_imports)]
pub use isplink_lib::device::Isp;
#[allow(unused_imports)]
pub use isplink_lib::error::{FrameError, IspError};
#[allow(unused_imports)]
pub use isplink_lib::frame::{self, ChecksumCheck, Frame};
#[allow(unused_imports)]
pub use isplink_lib::packet::{NotificationId, PacketId, RequestKind, Status};
#[allow(unused_imports)]
pub use isplink_lib::sim::{BusyMode, SimBehavior, SimBus, SimPins, SimulatedIsp};
#[allow(unused_imports)]
pub use std::time::Duration;
#[allow(unused_imports)]
pub use tokio::time::Instant;

#[allow(dead_code)]
pub type SimIsp = Isp<SimBus, SimPins>;

/// Decode hex string to bytes for testing
#[allow(dead_code)]
pub fn hex_to_bytes(hex_data: &str) -> Bytes {
    Bytes::from(hex::decode(hex_data).expect("Failed to decode hex"))
}

/// A device wired to a well-behaved simulated peer.
#[allow(dead_code)]
pub fn connected() -> (SimIsp, SimulatedIsp) {
    connected_with(LinkConfig::default(), SimBehavior::default())
}

/// A device wired to a simulated peer with the given config and faults.
#[allow(dead_code)]
pub fn connected_with(config: LinkConfig, behavior: SimBehavior) -> (SimIsp, SimulatedIsp) {
    let sim = SimulatedIsp::new(behavior);
    let isp = Isp::new(sim.bus(), sim.pins(), config).expect("valid config");
    sim.attach(isp.irq_handle());
    (isp, sim)
}

/// Deterministic test image
#[allow(dead_code)]
pub fn test_image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 7 + i / 251) as u8).collect()
}

/// Route library logs to the test output; honours RUST_LOG
#[allow(dead_code)]
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
