//! Moving image data onto the receiver.
//!
//! [`engine`] erases and writes flash in a windowed, acknowledged fashion;
//! [`ram`] streams an image straight into RAM.

pub mod engine;
pub mod ram;

pub use engine::{
    EngineConfig, PacketState, Progress, SectorState, UpdateEngine, CHIP_ERASE_TIMEOUT,
    DEFAULT_MAX_PENDING_WRITES, ERASE_TIMEOUT, PACKET_SIZE, WRITE_TIMEOUT,
};
pub use ram::download_to_ram;
