//! Transport abstraction for talking to a receiver.
//!
//! The session layer only sees the [`Port`] trait. Implementations:
//!
//! - **Serial / USB CDC**: [`NativePort`] via the `serialport` crate
//! - **Network**: [`TcpPort`] for `host:port` names (serial-over-TCP bridges)
//!
//! ```text
//! +------------------+
//! |  Update engine   |
//! +--------+---------+
//!          |
//! +--------+---------+
//! |  Message session |
//! +--------+---------+
//!          |
//! +--------+---------+
//! |    Port trait    |
//! +---+----------+---+
//!     |          |
//! +---+----+ +---+----+
//! | Native | |  TCP   |
//! +--------+ +--------+
//! ```

#[cfg(feature = "native")]
pub mod native;

pub mod net;

#[cfg(test)]
pub(crate) mod mock;

use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use crate::error::{Error, Result};

/// Default read timeout used when polling a port for available bytes.
pub const POLL_READ_TIMEOUT: Duration = Duration::from_millis(10);

/// Port configuration.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name: device path, `COMx`, or `host:port`.
    pub port_name: String,
    /// Baud rate (ignored by network ports).
    pub baud_rate: u32,
    /// Read timeout.
    pub timeout: Duration,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: 9600,
            timeout: POLL_READ_TIMEOUT,
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Whether the name designates a network endpoint.
    pub fn is_network(&self) -> bool {
        is_network_name(&self.port_name)
    }
}

/// Whether `name` looks like `host:port`.
pub fn is_network_name(name: &str) -> bool {
    name.contains(':') && !name.starts_with("\\\\")
}

/// Whether `name` refers to an I2C or SPI bridge.
///
/// Such links are byte-addressed and must not receive the UART training sequence.
pub fn is_bus_bridge_name(name: &str) -> bool {
    let upper = name.to_ascii_uppercase();
    ["I2C", "U2C", "SPI", "SPU"]
        .iter()
        .any(|prefix| upper.starts_with(prefix))
}

/// Byte transport to a receiver.
pub trait Port: Read + Write + Send {
    /// Set the read timeout.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Get the current timeout.
    fn timeout(&self) -> Duration;

    /// Set the baud rate.
    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()>;

    /// Get the current baud rate.
    fn baud_rate(&self) -> u32;

    /// Discard pending input and output.
    fn clear_buffers(&mut self) -> Result<()>;

    /// Get the port name.
    fn name(&self) -> &str;

    /// Close the port and release resources.
    ///
    /// After calling this method, the port cannot be used for further I/O.
    fn close(&mut self) -> Result<()>;

    /// Write all bytes, blocking until complete.
    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        std::io::Write::write_all(self, buf)?;
        std::io::Write::flush(self)?;
        Ok(())
    }

    /// Read whatever is available. A read timeout yields zero bytes.
    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize> {
        match self.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }

    /// Re-establish the link after the receiver restarted.
    fn reconnect(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<P: Port + ?Sized> Port for Box<P> {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        (**self).set_timeout(timeout)
    }

    fn timeout(&self) -> Duration {
        (**self).timeout()
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        (**self).set_baud_rate(baud_rate)
    }

    fn baud_rate(&self) -> u32 {
        (**self).baud_rate()
    }

    fn clear_buffers(&mut self) -> Result<()> {
        (**self).clear_buffers()
    }

    fn name(&self) -> &str {
        (**self).name()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
    }

    fn read_available(&mut self, buf: &mut [u8]) -> Result<usize> {
        (**self).read_available(buf)
    }

    fn reconnect(&mut self) -> Result<()> {
        (**self).reconnect()
    }
}

/// Open the transport matching the configured name.
pub fn open_port(config: &SerialConfig) -> Result<Box<dyn Port>> {
    if config.is_network() {
        return Ok(Box::new(net::TcpPort::open(config)?));
    }
    if is_bus_bridge_name(&config.port_name) {
        return Err(Error::Unsupported(format!(
            "I2C/SPI bridge ports are not supported: {}",
            config.port_name
        )));
    }

    #[cfg(feature = "native")]
    {
        Ok(Box::new(native::NativePort::open(config)?))
    }
    #[cfg(not(feature = "native"))]
    {
        Err(Error::Unsupported(format!(
            "serial ports need the `native` feature: {}",
            config.port_name
        )))
    }
}

// Re-export the implementations
#[cfg(feature = "native")]
pub use native::NativePort;
pub use net::TcpPort;
