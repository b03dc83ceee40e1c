//! Flash organization: sector layouts and the tables they come from.

pub mod geometry;
pub mod table;

pub use geometry::{BlockDef, FlashLayout, packet_for_address};
pub use table::FlashTable;
