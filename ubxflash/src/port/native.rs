//! Native serial port implementation using the `serialport` crate.
//!
//! Covers UART links and USB CDC-ACM receivers, which disappear and come back
//! under the same name when the receiver reboots.

use {
    crate::{
        error::{Error, Result},
        port::{Port, SerialConfig},
    },
    log::{debug, trace, warn},
    serialport::ClearBuffer,
    std::{
        io::{Read, Write},
        thread,
        time::Duration,
    },
};

/// Number of attempts to reopen a port after the receiver restarted.
const REOPEN_ATTEMPTS: usize = 10;

/// Pause before each reopen attempt.
const REOPEN_DELAY: Duration = Duration::from_secs(1);

/// Native serial port implementation.
pub struct NativePort {
    port: Option<Box<dyn serialport::SerialPort>>,
    name: String,
    timeout: Duration,
    baud_rate: u32,
}

impl NativePort {
    /// Open a serial port with the given configuration.
    pub fn open(config: &SerialConfig) -> Result<Self> {
        let port = Self::open_raw(&config.port_name, config.baud_rate, config.timeout)?;

        Ok(Self {
            port: Some(port),
            name: config
                .port_name
                .clone(),
            timeout: config.timeout,
            baud_rate: config.baud_rate,
        })
    }

    fn open_raw(
        name: &str,
        baud_rate: u32,
        timeout: Duration,
    ) -> Result<Box<dyn serialport::SerialPort>> {
        trace!("Opening {name} at {baud_rate} baud");
        Ok(serialport::new(name, baud_rate)
            .timeout(timeout)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .open()?)
    }

    fn closed_error() -> Error {
        Error::Serial(serialport::Error::new(
            serialport::ErrorKind::NoDevice,
            "Port is closed",
        ))
    }
}

impl Port for NativePort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        if let Some(ref mut p) = self.port {
            p.set_timeout(timeout)?;
        }
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        debug!("Setting {} to {baud_rate} baud", self.name);
        if let Some(ref mut p) = self.port {
            p.set_baud_rate(baud_rate)?;
        }
        self.baud_rate = baud_rate;
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn clear_buffers(&mut self) -> Result<()> {
        match self.port {
            Some(ref mut p) => {
                p.clear(ClearBuffer::All)?;
                Ok(())
            },
            None => Err(Self::closed_error()),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn close(&mut self) -> Result<()> {
        // Take ownership of the port and let it drop (close)
        self.port
            .take();
        Ok(())
    }

    fn reconnect(&mut self) -> Result<()> {
        self.close()?;

        for attempt in 1..=REOPEN_ATTEMPTS {
            thread::sleep(REOPEN_DELAY);
            match Self::open_raw(&self.name, self.baud_rate, self.timeout) {
                Ok(port) => {
                    debug!("Reopened {} (attempt {attempt}/{REOPEN_ATTEMPTS})", self.name);
                    self.port = Some(port);
                    return Ok(());
                },
                Err(e) => {
                    warn!(
                        "Reopening {} failed (attempt {attempt}/{REOPEN_ATTEMPTS}): {e}",
                        self.name
                    );
                },
            }
        }

        Err(Error::Timeout(format!(
            "{} did not come back after {REOPEN_ATTEMPTS} attempts",
            self.name
        )))
    }
}

impl Read for NativePort {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.port
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "port closed"))
            .and_then(|p| p.read(buf))
    }
}

impl Write for NativePort {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.port
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "port closed"))
            .and_then(|p| p.write(buf))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.port
            .as_mut()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "port closed"))
            .and_then(std::io::Write::flush)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_port_fails() {
        let config = SerialConfig::new("/dev/ubxflash-does-not-exist", 9600);
        assert!(NativePort::open(&config).is_err());
    }
}
