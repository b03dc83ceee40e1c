//! TCP transport for receivers behind a serial-to-network bridge.

use {
    crate::{
        error::Result,
        port::{Port, SerialConfig},
    },
    log::debug,
    std::{
        io::{ErrorKind, Read, Write},
        net::{Shutdown, TcpStream},
        thread,
        time::Duration,
    },
};

/// Time for the bridge to settle after the receiver restarted.
const RECONNECT_SETTLE: Duration = Duration::from_millis(500);

/// Connection timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Network port speaking raw bytes over TCP.
pub struct TcpPort {
    stream: Option<TcpStream>,
    name: String,
    timeout: Duration,
    baud_rate: u32,
}

impl TcpPort {
    /// Connect to `host:port`.
    pub fn open(config: &SerialConfig) -> Result<Self> {
        use std::net::ToSocketAddrs;

        let addr = config
            .port_name
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                std::io::Error::new(
                    ErrorKind::AddrNotAvailable,
                    format!("cannot resolve {}", config.port_name),
                )
            })?;

        debug!("Connecting to {addr}");
        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
        stream.set_read_timeout(Some(config.timeout))?;
        stream.set_nodelay(true)?;

        Ok(Self {
            stream: Some(stream),
            name: config
                .port_name
                .clone(),
            timeout: config.timeout,
            baud_rate: config.baud_rate,
        })
    }

    fn stream(&mut self) -> std::io::Result<&mut TcpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| std::io::Error::new(ErrorKind::NotConnected, "connection closed"))
    }
}

impl Port for TcpPort {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        if let Some(ref s) = self.stream {
            s.set_read_timeout(Some(timeout))?;
        }
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        // The bridge owns the serial line settings.
        debug!("{}: ignoring baud rate change to {baud_rate}", self.name);
        self.baud_rate = baud_rate;
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn clear_buffers(&mut self) -> Result<()> {
        let stream = self.stream()?;
        stream.set_nonblocking(true)?;
        let mut scratch = [0u8; 512];
        let drained = loop {
            match stream.read(&mut scratch) {
                Ok(0) => break Ok(()),
                Ok(_) => {},
                Err(e) if e.kind() == ErrorKind::WouldBlock => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        stream.set_nonblocking(false)?;
        Ok(drained?)
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn close(&mut self) -> Result<()> {
        if let Some(stream) = self
            .stream
            .take()
        {
            let _ = stream.shutdown(Shutdown::Both);
        }
        Ok(())
    }

    fn reconnect(&mut self) -> Result<()> {
        thread::sleep(RECONNECT_SETTLE);
        Ok(())
    }
}

impl Read for TcpPort {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.stream()?
            .read(buf)
    }
}

impl Write for TcpPort {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.stream()?
            .write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.stream()?
            .flush()
    }
}
