//! # ubxflash
//!
//! A library for updating the firmware of u-blox GNSS receivers.
//!
//! This crate talks UBX to a receiver over a serial line, USB CDC or a
//! serial-over-TCP bridge and provides:
//!
//! - UBX framing, checksums and frame resynchronization
//! - A request/response session with polls, acknowledgements and autobaud
//! - Firmware image validation and FIS merging
//! - A windowed erase/write engine and RAM image streaming
//! - The complete update procedure, from identification to reboot
//!
//! ## Supported Receivers
//!
//! - u-blox 5, 6, 7 and 8 (flash update)
//! - u-blox 9 (flash or RAM update)
//!
//! ## Features
//!
//! - `native` (default): Native serial port support
//! - `serde`: Serialization support for flash layouts
//!
//! ## Example
//!
//! ```rust,no_run
//! use ubxflash::{FirmwareImage, Fis, SerialConfig, UpdateOptions, Updater, open_port};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let image = FirmwareImage::from_file("firmware.bin")?;
//!     let fis = Fis::from_file("flash.fis")?;
//!
//!     let port = open_port(&SerialConfig::new("/dev/ttyACM0", 9600))?;
//!     let mut updater = Updater::new(port, UpdateOptions::default())
//!         .with_image(image)
//!         .with_fis(fis);
//!
//!     let receiver = updater.run(&mut |p| println!("{}%", p.percent()))?;
//!     println!("Updated u-blox generation {}", receiver.generation);
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod error;
pub mod fis;
pub mod flash;
pub mod image;
pub mod port;
pub mod protocol;
pub mod receiver;
pub mod session;
pub mod update;
pub mod updater;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by long-running library loops.
///
/// The checker should return `true` when the current update should stop
/// (for example after receiving Ctrl-C in CLI applications).
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

// Native-specific re-exports
#[cfg(feature = "native")]
pub use port::NativePort;
pub use {
    error::{Error, Result, UnitKind, UpdateError},
    fis::Fis,
    flash::{BlockDef, FlashLayout, FlashTable},
    image::FirmwareImage,
    port::{Port, SerialConfig, TcpPort, open_port},
    protocol::{Message, checksum16, checksum32},
    receiver::{PortId, ReceiverVersion, RomVersion},
    session::{AckOutcome, Session},
    update::{EngineConfig, Progress, UpdateEngine},
    updater::{ReceiverInfo, UpdateOptions, Updater},
};
