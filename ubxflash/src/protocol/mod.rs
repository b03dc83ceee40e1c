//! UBX protocol implementation.

pub mod checksum;
pub mod ubx;

// Re-export common types
pub use checksum::{checksum16, checksum32};
pub use ubx::{Message, Scan, build_frame, scan_for_frame};
