//! Scripted in-memory receiver for tests.
//!
//! Outbound bytes are parsed into UBX messages and handed to a responder
//! closure. Replies become readable after a configurable delay.

use {
    crate::{
        error::Result,
        port::Port,
        protocol::ubx::{Message, Scan, class, id, scan_for_frame},
    },
    std::{
        collections::VecDeque,
        io::{ErrorKind, Read, Write},
        time::{Duration, Instant},
    },
};

type Responder = Box<dyn FnMut(&Message) -> Vec<Message> + Send>;

/// Send `log` output through the test harness; `RUST_LOG` selects the level.
pub(crate) fn init_test_logging() {
    let _ = env_logger::builder()
        .is_test(true)
        .try_init();
}

pub(crate) struct MockDevice {
    responder: Responder,
    delay: Duration,
    inbound: Vec<u8>,
    outbound: VecDeque<(Instant, Vec<u8>)>,
    sent: Vec<Message>,
    raw_written: usize,
    baud_rate: u32,
    timeout: Duration,
    reconnects: usize,
}

impl MockDevice {
    pub(crate) fn new<F>(responder: F) -> Self
    where
        F: FnMut(&Message) -> Vec<Message> + Send + 'static,
    {
        init_test_logging();
        Self {
            responder: Box::new(responder),
            delay: Duration::ZERO,
            inbound: Vec::new(),
            outbound: VecDeque::new(),
            sent: Vec::new(),
            raw_written: 0,
            baud_rate: 9600,
            timeout: Duration::from_millis(10),
            reconnects: 0,
        }
    }

    /// A receiver that never answers.
    pub(crate) fn silent() -> Self {
        Self::new(|_| Vec::new())
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Make raw bytes readable immediately.
    pub(crate) fn inject(&mut self, bytes: &[u8]) {
        self.outbound
            .push_back((Instant::now(), bytes.to_vec()));
    }

    pub(crate) fn sent(&self) -> &[Message] {
        &self.sent
    }

    pub(crate) fn sent_count(&self, class: u8, id: u8) -> usize {
        self.sent
            .iter()
            .filter(|m| m.is(class, id))
            .count()
    }

    pub(crate) fn raw_written(&self) -> usize {
        self.raw_written
    }

    pub(crate) fn reconnects(&self) -> usize {
        self.reconnects
    }

    fn process_inbound(&mut self) {
        loop {
            match scan_for_frame(&self.inbound) {
                Scan::Frame { start, len } => {
                    let frame: Vec<u8> = self
                        .inbound
                        .drain(..start + len)
                        .skip(start)
                        .collect();
                    if let Some(msg) = Message::from_frame(&frame) {
                        let due = Instant::now() + self.delay;
                        for reply in (self.responder)(&msg) {
                            self.outbound
                                .push_back((due, reply.to_frame()));
                        }
                        self.sent.push(msg);
                    }
                },
                Scan::Corrupt { resume_at } => {
                    self.inbound
                        .drain(..resume_at);
                },
                Scan::Incomplete { keep_from } => {
                    self.inbound
                        .drain(..keep_from);
                    return;
                },
            }
        }
    }
}

impl Port for MockDevice {
    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> Result<()> {
        self.baud_rate = baud_rate;
        Ok(())
    }

    fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    fn clear_buffers(&mut self) -> Result<()> {
        let now = Instant::now();
        self.outbound
            .retain(|(due, _)| *due > now);
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn reconnect(&mut self) -> Result<()> {
        self.reconnects += 1;
        Ok(())
    }
}

impl Read for MockDevice {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let now = Instant::now();
        let Some((due, bytes)) = self
            .outbound
            .front_mut()
        else {
            return Err(std::io::Error::new(ErrorKind::TimedOut, "no data"));
        };
        if *due > now {
            return Err(std::io::Error::new(ErrorKind::TimedOut, "no data"));
        }

        let n = bytes.len().min(buf.len());
        buf[..n].copy_from_slice(&bytes[..n]);
        bytes.drain(..n);
        if bytes.is_empty() {
            self.outbound
                .pop_front();
        }
        Ok(n)
    }
}

impl Write for MockDevice {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.raw_written += buf.len();
        self.inbound
            .extend_from_slice(buf);
        self.process_inbound();
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// ACK-ACK (or ACK-NAK) for a command.
pub(crate) fn ack_for(msg: &Message, positive: bool) -> Message {
    let ack_id = if positive { id::ACK } else { id::NAK };
    Message::new(class::ACK, ack_id, vec![msg.class, msg.id])
}

/// Reply to UPD-ERASE/UPD-FLWRI with `[address][flag]`.
pub(crate) fn update_ack(msg: &Message, ok: bool) -> Message {
    let mut payload = msg.payload[..4].to_vec();
    payload.push(u8::from(ok));
    Message::new(class::UPD, msg.id, payload)
}

/// Responder for a flash target acknowledging every erase and write.
///
/// Writes to `fail_write_addr` are answered with a failure flag.
pub(crate) fn flash_target(fail_write_addr: Option<u32>) -> impl FnMut(&Message) -> Vec<Message> + Send {
    move |msg| {
        if msg.is(class::UPD, id::UPD_ERASE) {
            vec![update_ack(msg, true)]
        } else if msg.is(class::UPD, id::UPD_FLWRI) {
            let ok = msg.u32_at(0) != fail_write_addr;
            vec![update_ack(msg, ok)]
        } else {
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_init_is_repeatable() {
        init_test_logging();
        init_test_logging();
        log::debug!("mock logging ready");

        let mut dev = MockDevice::new(|msg| vec![ack_for(msg, true)]);
        let frame = Message::new(class::UPD, id::UPD_SAFE, Vec::new()).to_frame();
        dev.write_all(&frame).unwrap();
        assert_eq!(dev.sent_count(class::UPD, id::UPD_SAFE), 1);
    }
}
