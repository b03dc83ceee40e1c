//! Error types for ubxflash.

use std::{fmt, io};
use thiserror::Error;

/// Result type for ubxflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for ubxflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, socket, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// The receiver did not answer in time.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Unexpected or malformed reply from the receiver.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Firmware image failed validation.
    #[error("Invalid image: {0}")]
    InvalidImage(String),

    /// Flash organization unknown or inconsistent with the image.
    #[error("Flash layout error: {0}")]
    FlashLayout(String),

    /// Receiver or operation not supported.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The erase/write engine aborted the update.
    #[error("Update failed: {0}")]
    Update(#[from] UpdateError),
}

/// The kind of unit an engine failure refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    /// A flash sector erase.
    Erase,
    /// A packet write.
    Write,
    /// A whole-chip erase.
    ChipErase,
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Erase => f.write_str("sector erase"),
            Self::Write => f.write_str("packet write"),
            Self::ChipErase => f.write_str("chip erase"),
        }
    }
}

/// Fatal outcomes of an engine run.
///
/// Every variant ends the run. A new run needs a fresh engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpdateError {
    /// A unit kept timing out (or failing to erase) past its retry ceiling.
    #[error("{kind} of unit {unit} exceeded the retry limit")]
    RetriesExceeded {
        /// Sector or packet index.
        unit: usize,
        /// Which operation gave up.
        kind: UnitKind,
    },

    /// The receiver flagged an operation as failed.
    #[error("receiver reported {kind} failure{}", unit.map(|u| format!(" for unit {u}")).unwrap_or_default())]
    DeviceReportedFailure {
        /// Sector or packet index, absent for chip erase.
        unit: Option<usize>,
        /// Which operation failed.
        kind: UnitKind,
    },

    /// The command for a unit could not be written to the transport.
    #[error("could not send {kind} command for unit {unit}")]
    TransportSendFailed {
        /// Sector or packet index.
        unit: usize,
        /// Which command was being sent.
        kind: UnitKind,
    },

    /// The chip erase never reported completion.
    #[error("timed out waiting for chip erase to complete")]
    ChipEraseTimeout,

    /// The embedding application asked to stop.
    #[error("interrupted")]
    Interrupted,
}
