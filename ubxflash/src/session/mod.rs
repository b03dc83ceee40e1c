//! Message-oriented session over a byte [`Port`].
//!
//! The session frames outgoing messages, scans incoming bytes for frames and
//! offers the request/response primitives the updater is built from:
//! [`Session::receive`], [`Session::poll`] and [`Session::ack_wait`].
//!
//! Transport problems never escape as errors from these primitives. They
//! read as "not sent" or "nothing received" and the caller decides whether
//! that is fatal.

pub mod buffer;

use {
    crate::{
        error::{Error, Result},
        port::Port,
        protocol::ubx::{Message, build_frame, class, id},
    },
    buffer::ReceiveBuffer,
    log::{debug, info, trace, warn},
    std::{
        thread,
        time::{Duration, Instant},
    },
};

pub use buffer::RECEIVE_BUFFER_SIZE;

/// Attempts made by [`Session::poll`] and [`Session::ack`].
pub const RETRY_COUNT: usize = 3;

/// Pause between transport polls while waiting for data.
const RECEIVE_IDLE: Duration = Duration::from_millis(1);

/// Pause after the training sequence.
const TRAINING_PAUSE: Duration = Duration::from_millis(10);

/// Time for the link to settle after a baud rate change.
const BAUD_SETTLE: Duration = Duration::from_millis(200);

/// Number of `0xFF` bytes written to flush the receiver's input.
const FLUSH_LEN: usize = 1024;

/// Training sequence that wakes a receiver and lets it lock onto the baud rate.
const TRAINING_SEQUENCE: [u8; 2] = [0x55, 0x55];

/// Timeout of a single MON-VER probe during baud rate detection.
const AUTOBAUD_POLL_TIMEOUT: Duration = Duration::from_millis(300);

/// Failed probes tolerated before moving to the next rate.
const AUTOBAUD_PROBES_PER_RATE: usize = 5;

/// Rates tried by [`Session::autobaud`], in order.
pub const AUTOBAUD_RATES: [u32; 6] = [9600, 115200, 57600, 19200, 38400, 230400];

/// Result of waiting for an acknowledgement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// ACK-ACK for the command arrived.
    Acked,
    /// ACK-NAK for the command arrived.
    Nacked,
    /// No matching acknowledgement before the deadline.
    TimedOut,
}

impl AckOutcome {
    /// Whether the receiver answered at all.
    pub fn answered(self) -> bool {
        self != Self::TimedOut
    }
}

/// UBX session over a port.
pub struct Session<P: Port> {
    port: P,
    buffer: ReceiveBuffer,
}

impl<P: Port> Session<P> {
    /// Create a session over an opened port.
    pub fn new(port: P) -> Self {
        Self {
            port,
            buffer: ReceiveBuffer::default(),
        }
    }

    /// Get a reference to the underlying port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Get a mutable reference to the underlying port.
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    /// Consume the session and return the underlying port.
    pub fn into_port(self) -> P {
        self.port
    }

    /// Frame and send a message. Returns whether every byte was written.
    pub fn send(&mut self, class: u8, id: u8, payload: &[u8]) -> bool {
        let frame = build_frame(class, id, payload);
        trace!(
            "-> {class:02X}-{id:02X} ({} bytes payload)",
            payload.len()
        );
        match self
            .port
            .write_all_bytes(&frame)
        {
            Ok(()) => true,
            Err(e) => {
                debug!("Sending {class:02X}-{id:02X} failed: {e}");
                false
            },
        }
    }

    /// Wait up to `timeout` for a message matching `want_class`/`want_id`.
    ///
    /// `None` filters accept anything. Non-matching frames are discarded.
    /// A zero timeout drains what is already available and returns.
    pub fn receive(
        &mut self,
        timeout: Duration,
        want_class: Option<u8>,
        want_id: Option<u8>,
    ) -> Option<Message> {
        let deadline = Instant::now() + timeout;
        loop {
            self.fill();
            while let Some(msg) = self
                .buffer
                .next_frame()
            {
                let class_ok = want_class.is_none_or(|c| c == msg.class);
                let id_ok = want_id.is_none_or(|i| i == msg.id);
                if class_ok && id_ok {
                    trace!("<- {:02X}-{:02X} ({} bytes payload)", msg.class, msg.id, msg.len());
                    return Some(msg);
                }
                trace!("Discarding {:02X}-{:02X}", msg.class, msg.id);
            }

            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(RECEIVE_IDLE);
        }
    }

    /// Send a request and wait for the reply with the same class and id.
    pub fn poll_once(
        &mut self,
        class: u8,
        id: u8,
        payload: &[u8],
        timeout: Duration,
    ) -> Option<Message> {
        if !self.send(class, id, payload) {
            return None;
        }
        self.receive(timeout, Some(class), Some(id))
    }

    /// [`Session::poll_once`] with up to [`RETRY_COUNT`] attempts.
    pub fn poll(
        &mut self,
        class: u8,
        id: u8,
        payload: &[u8],
        timeout: Duration,
    ) -> Option<Message> {
        for attempt in 1..=RETRY_COUNT {
            if let Some(msg) = self.poll_once(class, id, payload, timeout) {
                return Some(msg);
            }
            debug!("No reply to {class:02X}-{id:02X} (attempt {attempt}/{RETRY_COUNT})");
        }
        None
    }

    /// Send a command and wait for its acknowledgement.
    ///
    /// Acknowledgements for other commands are dropped; they do not extend
    /// the deadline.
    pub fn ack_wait(
        &mut self,
        class: u8,
        id: u8,
        payload: &[u8],
        timeout: Duration,
    ) -> AckOutcome {
        let deadline = Instant::now() + timeout;
        if !self.send(class, id, payload) {
            return AckOutcome::TimedOut;
        }

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(msg) = self.receive(remaining, Some(class::ACK), None) else {
                return AckOutcome::TimedOut;
            };

            if msg.payload.get(..2) == Some(&[class, id][..]) {
                match msg.id {
                    id::ACK => return AckOutcome::Acked,
                    id::NAK => return AckOutcome::Nacked,
                    other => debug!("Unknown acknowledgement id {other:02X}"),
                }
            } else {
                debug!(
                    "Ignoring acknowledgement for {:02X?} while waiting for {class:02X}-{id:02X}",
                    msg.payload
                );
            }

            if remaining.is_zero() {
                return AckOutcome::TimedOut;
            }
        }
    }

    /// [`Session::ack_wait`] with up to [`RETRY_COUNT`] attempts.
    pub fn ack(&mut self, class: u8, id: u8, payload: &[u8], timeout: Duration) -> AckOutcome {
        for attempt in 1..=RETRY_COUNT {
            let outcome = self.ack_wait(class, id, payload, timeout);
            if outcome.answered() {
                return outcome;
            }
            debug!("No acknowledgement for {class:02X}-{id:02X} (attempt {attempt}/{RETRY_COUNT})");
        }
        AckOutcome::TimedOut
    }

    /// Send the wake-up/training sequence.
    pub fn send_training(&mut self) {
        trace!("Sending training sequence");
        if let Err(e) = self
            .port
            .write_all_bytes(&TRAINING_SEQUENCE)
        {
            debug!("Training sequence not sent: {e}");
        }
        thread::sleep(TRAINING_PAUSE);
    }

    /// Switch the local baud rate.
    pub fn set_baud(&mut self, baud_rate: u32) -> Result<()> {
        self.buffer
            .clear();
        self.port
            .set_baud_rate(baud_rate)?;
        thread::sleep(BAUD_SETTLE);
        Ok(())
    }

    /// Drop all buffered input on both sides of the port.
    pub fn clear(&mut self) -> Result<()> {
        self.buffer
            .clear();
        self.port
            .clear_buffers()
    }

    /// Clear local buffers and push filler bytes through the receiver's input.
    pub fn flush_receiver(&mut self) -> Result<()> {
        self.clear()?;
        self.port
            .write_all_bytes(&[0xFF; FLUSH_LEN])
    }

    /// Re-open the link after the receiver restarted.
    pub fn reconnect(&mut self) -> Result<()> {
        self.buffer
            .clear();
        self.port
            .reconnect()
    }

    /// Close the port.
    pub fn close(&mut self) -> Result<()> {
        self.buffer
            .clear();
        self.port
            .close()
    }

    /// Find the receiver's baud rate by probing with MON-VER.
    ///
    /// Returns the MON-VER reply.
    pub fn autobaud(&mut self, training: bool) -> Result<Message> {
        self.autobaud_with(training, AUTOBAUD_POLL_TIMEOUT)
    }

    fn autobaud_with(&mut self, training: bool, probe_timeout: Duration) -> Result<Message> {
        let mut rates = AUTOBAUD_RATES.iter();
        let mut failures = 0;

        loop {
            if let Some(msg) = self.poll_once(class::MON, id::MON_VER, &[], probe_timeout) {
                info!("Receiver answers at {} baud", self.port.baud_rate());
                return Ok(msg);
            }

            failures += 1;
            if failures > AUTOBAUD_PROBES_PER_RATE {
                let Some(&rate) = rates.next() else {
                    return Err(Error::Timeout(
                        "no answer from receiver at any baud rate".to_string(),
                    ));
                };
                debug!("Trying {rate} baud");
                self.set_baud(rate)?;
                if training {
                    self.send_training();
                }
                failures = 0;
            }
        }
    }

    fn fill(&mut self) {
        let spare = self
            .buffer
            .spare_mut();
        match self
            .port
            .read_available(spare)
        {
            Ok(n) => self
                .buffer
                .commit(n),
            Err(e) => warn!("Read from {} failed: {e}", self.port.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::mock::{MockDevice, ack_for};
    use crate::protocol::ubx::build_frame;

    fn mon_ver_reply() -> Message {
        Message::new(class::MON, id::MON_VER, b"ROM CORE 3.01\0".to_vec())
    }

    #[test]
    fn test_poll_returns_matching_reply() {
        let dev = MockDevice::new(|msg| {
            if msg.is(class::MON, id::MON_VER) {
                vec![
                    Message::new(0x01, 0x07, vec![0; 4]),
                    mon_ver_reply(),
                ]
            } else {
                Vec::new()
            }
        });
        let mut session = Session::new(dev);

        let reply = session
            .poll(class::MON, id::MON_VER, &[], Duration::from_millis(100))
            .unwrap();
        assert_eq!(reply, mon_ver_reply());
        assert_eq!(
            session
                .port()
                .sent_count(class::MON, id::MON_VER),
            1
        );
    }

    #[test]
    fn test_poll_retries() {
        let mut calls = 0;
        let dev = MockDevice::new(move |_| {
            calls += 1;
            if calls == 3 { vec![mon_ver_reply()] } else { Vec::new() }
        });
        let mut session = Session::new(dev);

        assert!(session
            .poll(class::MON, id::MON_VER, &[], Duration::from_millis(20))
            .is_some());
        assert_eq!(
            session
                .port()
                .sent_count(class::MON, id::MON_VER),
            3
        );
    }

    #[test]
    fn test_receive_times_out() {
        let mut session = Session::new(MockDevice::silent());
        let start = Instant::now();
        assert!(session
            .receive(Duration::from_millis(30), None, None)
            .is_none());
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_receive_zero_timeout_drains_available() {
        let mut dev = MockDevice::silent();
        dev.inject(&build_frame(class::UPD, id::UPD_ERASE, &[0, 0, 0x80, 0, 1]));
        let mut session = Session::new(dev);

        assert!(session
            .receive(Duration::ZERO, Some(class::UPD), None)
            .is_some());
        assert!(session
            .receive(Duration::ZERO, Some(class::UPD), None)
            .is_none());
    }

    #[test]
    fn test_receive_resynchronizes_after_corruption() {
        let mut corrupt = build_frame(class::MON, id::MON_VER, b"garbage");
        corrupt[8] ^= 0x40;
        let mut dev = MockDevice::silent();
        dev.inject(&[0x00, 0xB5]);
        dev.inject(&corrupt);
        dev.inject(&mon_ver_reply().to_frame());
        let mut session = Session::new(dev);

        let msg = session
            .receive(Duration::from_millis(50), Some(class::MON), Some(id::MON_VER))
            .unwrap();
        assert_eq!(msg, mon_ver_reply());
    }

    #[test]
    fn test_ack_wait_correlates() {
        let dev = MockDevice::new(|msg| {
            vec![
                Message::new(class::ACK, id::ACK, vec![class::CFG, id::CFG_RST]),
                ack_for(msg, true),
            ]
        });
        let mut session = Session::new(dev);
        assert_eq!(
            session.ack_wait(class::CFG, id::CFG_PRT, &[0; 20], Duration::from_millis(100)),
            AckOutcome::Acked
        );
    }

    #[test]
    fn test_ack_wait_nak() {
        let dev = MockDevice::new(|msg| vec![ack_for(msg, false)]);
        let mut session = Session::new(dev);
        assert_eq!(
            session.ack_wait(class::UPD, id::UPD_SAFE, &[1], Duration::from_millis(100)),
            AckOutcome::Nacked
        );
    }

    #[test]
    fn test_ack_wait_uncorrelated_does_not_extend_deadline() {
        let dev = MockDevice::new(|_| {
            vec![Message::new(class::ACK, id::ACK, vec![class::MON, id::MON_VER])]
        });
        let mut session = Session::new(dev);
        let start = Instant::now();
        assert_eq!(
            session.ack_wait(class::UPD, id::UPD_FIS, &[], Duration::from_millis(40)),
            AckOutcome::TimedOut
        );
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(40));
        assert!(elapsed < Duration::from_millis(500));
    }

    #[test]
    fn test_ack_retries_on_silence() {
        let mut session = Session::new(MockDevice::silent());
        assert_eq!(
            session.ack(class::UPD, id::UPD_SAFE, &[1], Duration::from_millis(5)),
            AckOutcome::TimedOut
        );
        assert_eq!(
            session
                .port()
                .sent_count(class::UPD, id::UPD_SAFE),
            RETRY_COUNT
        );
    }

    #[test]
    fn test_training_and_flush_bytes() {
        let mut session = Session::new(MockDevice::silent());
        session.send_training();
        session
            .flush_receiver()
            .unwrap();
        assert_eq!(
            session
                .port()
                .raw_written(),
            2 + FLUSH_LEN
        );
    }

    #[test]
    fn test_autobaud_moves_to_next_rate() {
        let mut calls = 0;
        let dev = MockDevice::new(move |msg| {
            calls += 1;
            if msg.is(class::MON, id::MON_VER) && calls > AUTOBAUD_PROBES_PER_RATE + 1 {
                vec![mon_ver_reply()]
            } else {
                Vec::new()
            }
        });
        let mut session = Session::new(dev);
        session
            .port_mut()
            .set_baud_rate(4800)
            .unwrap();

        let msg = session
            .autobaud_with(true, Duration::from_millis(2))
            .unwrap();
        assert_eq!(msg, mon_ver_reply());
        assert_eq!(
            session
                .port()
                .baud_rate(),
            AUTOBAUD_RATES[0]
        );
    }

    #[test]
    fn test_autobaud_gives_up() {
        let mut session = Session::new(MockDevice::silent());
        assert!(matches!(
            session.autobaud_with(false, Duration::from_millis(1)),
            Err(Error::Timeout(_))
        ));
        assert_eq!(
            session
                .port()
                .baud_rate(),
            AUTOBAUD_RATES[AUTOBAUD_RATES.len() - 1]
        );
    }
}
