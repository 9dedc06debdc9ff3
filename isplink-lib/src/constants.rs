// Protocol constants for the AP <-> ISP link

/// Size of the little-endian length field at the start of every frame
pub const LENGTH_FIELD_SIZE: usize = 2;

/// Length field plus packet ID (3 bytes)
pub const HEADER_SIZE: usize = LENGTH_FIELD_SIZE + 1;

/// Fixed end-of-frame marker
pub const TERMINATOR: [u8; 2] = [0xFF, 0xFF];

/// Terminator plus checksum (3 bytes)
pub const TRAILER_SIZE: usize = TERMINATOR.len() + 1;

/// Bytes a frame adds around its payload (6 bytes)
pub const FRAME_OVERHEAD: usize = HEADER_SIZE + TRAILER_SIZE;

/// Largest payload whose frame length still fits the 16-bit length field
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize + LENGTH_FIELD_SIZE - FRAME_OVERHEAD;

/// Parameter ID (2 bytes) plus value length (1 byte)
pub const PARAM_HEADER_SIZE: usize = 3;

/// Longest value a single parameter record can carry
pub const MAX_PARAM_VALUE: usize = u8::MAX as usize;

/// Parameter ID (2 bytes) plus status byte in a response payload
pub const RESPONSE_HEADER_SIZE: usize = 3;

/// Smallest well-formed response frame (9 bytes)
pub const MIN_RESPONSE_LEN: usize = FRAME_OVERHEAD + RESPONSE_HEADER_SIZE;

/// Upper bound on a response frame read back after an event
pub const MAX_RESPONSE_LEN: usize = 1024;

/// Status byte value meaning success
pub const STATUS_OK: u8 = 0x00;

/// Default bus transaction size for command frames
pub const DEFAULT_WRITE_CHUNK: usize = 64;

/// Default bus transaction size for reads
pub const DEFAULT_READ_CHUNK: usize = 512;

/// Default firmware chunk size for bulk transfers
pub const DEFAULT_FIRMWARE_CHUNK: usize = 61_440;

/// Well-known parameter IDs used by the link itself.
pub mod params {
    /// Query: pending notification ID (16-bit little endian in the response data)
    pub const NOTIFY_STATUS: u16 = 0x0001;

    /// Query: firmware version string (ASCII, NUL padded)
    pub const FIRMWARE_VERSION: u16 = 0x0A02;

    /// Command: start the application firmware after power-on
    pub const CMD_START_APP: u16 = 0x0F12;
}
