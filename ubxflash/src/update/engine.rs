//! Windowed erase/write engine.
//!
//! The engine owns one record per flash sector and one per image packet and
//! drives them to their terminal states:
//!
//! ```text
//! sector:  Init -> ErasePending -> EraseAcked
//! packet:  Init -> ErasePending -> EraseAcked -> WritePending -> WriteAcked
//! ```
//!
//! At most `max_pending_erases` erases and `max_pending_writes` writes are in
//! flight. Acknowledgements are applied by address, so duplicates and
//! out-of-order replies are harmless. An erase acknowledgement unlocks every
//! packet of its sector.
//!
//! A run is single use: on any error the engine must be discarded and the
//! update restarted with a new one.

use {
    crate::{
        error::{Error, Result, UnitKind, UpdateError},
        flash::geometry::{FlashLayout, packet_for_address},
        port::Port,
        protocol::ubx::{Message, class, id, payload},
        session::Session,
    },
    log::{debug, error, info, trace, warn},
    std::{
        thread,
        time::{Duration, Instant},
    },
};

/// Bytes per flash write command.
pub const PACKET_SIZE: u32 = 512;

/// Time allowed for one sector erase.
pub const ERASE_TIMEOUT: Duration = Duration::from_secs(12);

/// Time allowed for one packet write.
pub const WRITE_TIMEOUT: Duration = Duration::from_secs(3);

/// Write timeout while a chip erase is still running, and the final wait for it.
pub const CHIP_ERASE_TIMEOUT: Duration = Duration::from_secs(45);

/// Retries per sector before giving up.
pub const ERASE_RETRIES: u8 = 4;

/// Retries per packet before giving up.
pub const WRITE_RETRIES: u8 = 4;

/// Erases the receiver can queue.
pub const MAX_PENDING_ERASES: usize = 2;

/// Default write window.
pub const DEFAULT_MAX_PENDING_WRITES: usize = 10;

/// Pause after draining the receive queue.
const PROCESS_IDLE: Duration = Duration::from_millis(1);

type EngineResult<T> = std::result::Result<T, UpdateError>;

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bytes per write command.
    pub packet_size: u32,
    /// Per-attempt erase timeout.
    pub erase_timeout: Duration,
    /// Per-attempt write timeout.
    pub write_timeout: Duration,
    /// Write timeout during a chip erase, and the final chip erase wait.
    pub chip_erase_timeout: Duration,
    /// Erase retry ceiling.
    pub erase_retries: u8,
    /// Write retry ceiling.
    pub write_retries: u8,
    /// Erase window.
    pub max_pending_erases: usize,
    /// Write window.
    pub max_pending_writes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            packet_size: PACKET_SIZE,
            erase_timeout: ERASE_TIMEOUT,
            write_timeout: WRITE_TIMEOUT,
            chip_erase_timeout: CHIP_ERASE_TIMEOUT,
            erase_retries: ERASE_RETRIES,
            write_retries: WRITE_RETRIES,
            max_pending_erases: MAX_PENDING_ERASES,
            max_pending_writes: DEFAULT_MAX_PENDING_WRITES,
        }
    }
}

impl EngineConfig {
    /// Set the write window.
    #[must_use]
    pub fn with_max_pending_writes(mut self, max: usize) -> Self {
        self.max_pending_writes = max.max(1);
        self
    }
}

/// Erase state of a sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectorState {
    /// Nothing outstanding.
    Init,
    /// Erase sent, waiting for the acknowledgement.
    ErasePending,
    /// Erased.
    EraseAcked,
}

/// State of a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PacketState {
    /// Its sector has not been erased.
    Init,
    /// The erase of its sector was sent.
    ErasePending,
    /// Its sector is erased; ready to write.
    EraseAcked,
    /// Write sent, waiting for the acknowledgement.
    WritePending,
    /// Written.
    WriteAcked,
}

/// Bookkeeping for one sector or packet.
#[derive(Debug, Clone, Copy)]
struct Unit<S> {
    state: S,
    retries: u8,
    deadline: Option<Instant>,
}

impl<S> Unit<S> {
    fn new(state: S) -> Self {
        Self {
            state,
            retries: 0,
            deadline: None,
        }
    }

    fn expired(&self, now: Instant) -> bool {
        self.deadline
            .is_some_and(|d| d <= now)
    }

    fn due(&self, now: Instant) -> bool {
        self.deadline
            .is_none_or(|d| d <= now)
    }
}

/// Snapshot reported after every state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Sectors erased so far.
    pub sectors_erased: usize,
    /// Sectors to erase.
    pub sector_count: usize,
    /// Packets written so far.
    pub packets_written: usize,
    /// Packets to write.
    pub packet_count: usize,
}

impl Progress {
    /// Overall completion in percent, erases and writes weighted by count.
    pub fn percent(&self) -> u64 {
        let total = self.sector_count + self.packet_count;
        if total == 0 {
            return 100;
        }
        ((self.sectors_erased + self.packets_written) * 100 / total) as u64
    }
}

/// The erase/write state machine for one update run.
pub struct UpdateEngine<'a> {
    image: &'a [u8],
    fw_base: u32,
    layout: &'a FlashLayout,
    config: EngineConfig,
    sectors: Vec<Unit<SectorState>>,
    packets: Vec<Unit<PacketState>>,
    /// First packet of each sector, plus one trailing entry.
    sector_first_packet: Vec<usize>,
    pending_erases: usize,
    pending_writes: usize,
    erased_until: usize,
    written_until: usize,
    erase_in_progress: bool,
    sectors_erased: usize,
    packets_written: usize,
}

impl<'a> UpdateEngine<'a> {
    /// Create an engine that erases `sector_count` sectors of `layout` and
    /// writes `image` to `fw_base` in packets.
    ///
    /// With `sector_count == 0` nothing is erased and every packet is
    /// immediately writable.
    pub fn new(
        image: &'a [u8],
        fw_base: u32,
        layout: &'a FlashLayout,
        sector_count: usize,
        config: EngineConfig,
    ) -> Result<Self> {
        if config.packet_size == 0 {
            return Err(Error::Config("packet size must not be zero".to_string()));
        }
        let packet_count = image
            .len()
            .div_ceil(config.packet_size as usize);

        let sector_first_packet = (0..=sector_count)
            .map(|s| layout.first_packet_of_sector(s, config.packet_size))
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| {
                Error::FlashLayout(format!(
                    "{sector_count} sectors do not fit the flash layout ({layout})"
                ))
            })?;
        if sector_count > 0 && sector_first_packet[sector_count] < packet_count {
            return Err(Error::FlashLayout(format!(
                "{sector_count} sectors do not cover the {} byte image",
                image.len()
            )));
        }

        let initial = if sector_count == 0 {
            PacketState::EraseAcked
        } else {
            PacketState::Init
        };

        debug!(
            "Update engine: {sector_count} sectors, {packet_count} packets of {} bytes, base {fw_base:#010X}",
            config.packet_size
        );

        Ok(Self {
            image,
            fw_base,
            layout,
            sectors: vec![Unit::new(SectorState::Init); sector_count],
            packets: vec![Unit::new(initial); packet_count],
            sector_first_packet,
            config,
            pending_erases: 0,
            pending_writes: 0,
            erased_until: 0,
            written_until: 0,
            erase_in_progress: false,
            sectors_erased: 0,
            packets_written: 0,
        })
    }

    /// Mark a chip erase as already running.
    ///
    /// Writes then use the chip erase timeout, and the run does not finish
    /// before the receiver reports the chip erase result.
    #[must_use]
    pub fn with_chip_erase_in_progress(mut self, in_progress: bool) -> Self {
        self.erase_in_progress = in_progress;
        self
    }

    /// Number of sectors to erase.
    pub fn sector_count(&self) -> usize {
        self.sectors
            .len()
    }

    /// Number of packets to write.
    pub fn packet_count(&self) -> usize {
        self.packets
            .len()
    }

    /// State of a sector.
    pub fn sector_state(&self, sector: usize) -> Option<SectorState> {
        self.sectors
            .get(sector)
            .map(|u| u.state)
    }

    /// State of a packet.
    pub fn packet_state(&self, packet: usize) -> Option<PacketState> {
        self.packets
            .get(packet)
            .map(|u| u.state)
    }

    /// Retries spent on a sector.
    pub fn sector_retries(&self, sector: usize) -> Option<u8> {
        self.sectors
            .get(sector)
            .map(|u| u.retries)
    }

    /// Retries spent on a packet.
    pub fn packet_retries(&self, packet: usize) -> Option<u8> {
        self.packets
            .get(packet)
            .map(|u| u.retries)
    }

    /// Erases in flight.
    pub fn pending_erases(&self) -> usize {
        self.pending_erases
    }

    /// Writes in flight.
    pub fn pending_writes(&self) -> usize {
        self.pending_writes
    }

    /// Whether a chip erase is still outstanding.
    pub fn chip_erase_in_progress(&self) -> bool {
        self.erase_in_progress
    }

    /// Current progress snapshot.
    pub fn progress(&self) -> Progress {
        Progress {
            sectors_erased: self.sectors_erased,
            sector_count: self.sectors.len(),
            packets_written: self.packets_written,
            packet_count: self.packets.len(),
        }
    }

    /// Whether every sector is erased.
    pub fn erase_complete(&self) -> bool {
        self.sectors
            .iter()
            .all(|u| u.state == SectorState::EraseAcked)
    }

    /// Whether every packet is written.
    pub fn write_complete(&self) -> bool {
        self.packets
            .iter()
            .all(|u| u.state == PacketState::WriteAcked)
    }

    /// Erase and write everything.
    ///
    /// `progress` is called whenever a unit reaches its terminal state.
    pub fn run<P: Port>(
        &mut self,
        session: &mut Session<P>,
        progress: &mut dyn FnMut(Progress),
    ) -> EngineResult<()> {
        progress(self.progress());

        loop {
            let erase_done = self.erase_complete();
            let write_done = self.write_complete();
            if erase_done && write_done {
                break;
            }
            if crate::is_interrupted_requested() {
                warn!("Update interrupted");
                return Err(UpdateError::Interrupted);
            }

            if !erase_done {
                self.erase_step(session)?;
                self.process_messages(session, progress)?;
            }
            if !self.write_complete() {
                self.write_step(session)?;
                self.process_messages(session, progress)?;
            }
        }

        if self.erase_in_progress {
            debug!("Waiting for chip erase to finish");
            let reply = session.receive(
                self.config
                    .chip_erase_timeout,
                Some(class::UPD),
                Some(id::UPD_CERASE),
            );
            match reply {
                None => {
                    error!("Chip erase timed out");
                    return Err(UpdateError::ChipEraseTimeout);
                },
                Some(msg) if msg.payload.first() == Some(&1) => {
                    debug!("Chip erase finished after the last write");
                    self.erase_in_progress = false;
                },
                Some(_) => {
                    error!("Chip erase failed");
                    return Err(UpdateError::DeviceReportedFailure {
                        unit: None,
                        kind: UnitKind::ChipErase,
                    });
                },
            }
        }

        info!(
            "Erased {} sectors, wrote {} packets",
            self.sectors.len(),
            self.packets.len()
        );
        Ok(())
    }

    /// Issue erases for sectors that are idle or timed out, within the window.
    fn erase_step<P: Port>(&mut self, session: &mut Session<P>) -> EngineResult<()> {
        let mut found_unerased = false;

        for sector in self.erased_until..self.sectors.len() {
            if self.sectors[sector].state == SectorState::EraseAcked {
                if !found_unerased {
                    self.erased_until = sector + 1;
                }
                continue;
            }
            found_unerased = true;

            let now = Instant::now();
            let first_packet = self.sector_first_packet[sector];
            let addr = self.packet_address(first_packet);
            let unit = &mut self.sectors[sector];

            if unit.state == SectorState::ErasePending && unit.expired(now) {
                self.pending_erases = self
                    .pending_erases
                    .saturating_sub(1);
                unit.state = SectorState::Init;
                if unit.retries >= self.config.erase_retries {
                    error!("Erase retries for sector {sector} exceeded");
                    return Err(UpdateError::RetriesExceeded {
                        unit: sector,
                        kind: UnitKind::Erase,
                    });
                }
                unit.retries += 1;
                warn!("Sending erase retry for sector {sector}");
            }

            if self.pending_erases < self.config.max_pending_erases && unit.due(now) {
                if !session.send(class::UPD, id::UPD_ERASE, &payload::address(addr)) {
                    error!("Sending erase for sector {sector} failed");
                    return Err(UpdateError::TransportSendFailed {
                        unit: sector,
                        kind: UnitKind::Erase,
                    });
                }
                trace!("Erase sector {sector} at {addr:#010X}");
                self.pending_erases += 1;
                unit.state = SectorState::ErasePending;
                unit.deadline = Some(Instant::now() + self.config.erase_timeout);

                // The first packet stands for the whole sector until the erase is acknowledged.
                if let Some(p) = self
                    .packets
                    .get_mut(first_packet)
                {
                    if p.state == PacketState::Init {
                        p.state = PacketState::ErasePending;
                    }
                }
            }
        }
        Ok(())
    }

    /// Send at most one write: the next erased packet, or else a timed out one.
    fn write_step<P: Port>(&mut self, session: &mut Session<P>) -> EngineResult<()> {
        let timeout = if self.erase_in_progress {
            self.config
                .chip_erase_timeout
        } else {
            self.config
                .write_timeout
        };

        let mut found_unwritten = false;
        let mut packet = self.written_until;
        while packet < self.packets.len() && self.pending_writes < self.config.max_pending_writes {
            match self.packets[packet].state {
                PacketState::WriteAcked if !found_unwritten => self.written_until = packet + 1,
                PacketState::EraseAcked => return self.send_write(session, packet, timeout),
                _ => found_unwritten = true,
            }
            packet += 1;
        }

        let now = Instant::now();
        for packet in 0..self.packets.len() {
            let unit = &mut self.packets[packet];
            if unit.state != PacketState::WritePending || !unit.expired(now) {
                continue;
            }

            // Releasing the timed out slot always leaves room for the resend.
            self.pending_writes = self
                .pending_writes
                .saturating_sub(1);
            if unit.retries >= self.config.write_retries {
                error!("Write retries for packet {packet} exceeded");
                return Err(UpdateError::RetriesExceeded {
                    unit: packet,
                    kind: UnitKind::Write,
                });
            }
            unit.retries += 1;
            warn!("Sending write retry for packet {packet}");
            return self.send_write(session, packet, timeout);
        }
        Ok(())
    }

    fn send_write<P: Port>(
        &mut self,
        session: &mut Session<P>,
        packet: usize,
        timeout: Duration,
    ) -> EngineResult<()> {
        let size = self.config.packet_size as usize;
        let start = packet * size;
        let end = (start + size).min(self.image.len());
        let addr = self.packet_address(packet);

        let body = payload::flash_write(addr, &self.image[start..end], size);
        if !session.send(class::UPD, id::UPD_FLWRI, &body) {
            error!("Sending write for packet {packet} failed");
            return Err(UpdateError::TransportSendFailed {
                unit: packet,
                kind: UnitKind::Write,
            });
        }

        trace!("Write packet {packet} at {addr:#010X}");
        let unit = &mut self.packets[packet];
        unit.state = PacketState::WritePending;
        unit.deadline = Some(Instant::now() + timeout);
        self.pending_writes += 1;
        Ok(())
    }

    /// Apply every update message already received.
    pub fn process_messages<P: Port>(
        &mut self,
        session: &mut Session<P>,
        progress: &mut dyn FnMut(Progress),
    ) -> EngineResult<()> {
        while let Some(msg) = session.receive(Duration::ZERO, Some(class::UPD), None) {
            let changed = match (msg.id, msg.len()) {
                (id::UPD_ERASE, 5) => self.on_erase_ack(&msg)?,
                (id::UPD_FLWRI, 5) => self.on_write_ack(&msg)?,
                (id::UPD_CERASE, 1) => {
                    self.on_chip_erase(&msg)?;
                    false
                },
                _ => {
                    trace!("Ignoring UPD-{:02X} with {} bytes", msg.id, msg.len());
                    false
                },
            };
            if changed {
                progress(self.progress());
            }
        }
        thread::sleep(PROCESS_IDLE);
        Ok(())
    }

    fn on_erase_ack(&mut self, msg: &Message) -> EngineResult<bool> {
        let addr = msg
            .u32_at(0)
            .unwrap_or_default();
        let ok = msg.payload[4] != 0;

        let Some(sector) = self
            .layout
            .sector_for_address(addr, self.fw_base, 0)
            .filter(|&s| s < self.sectors.len())
        else {
            error!("Erase acknowledgement for unknown address {addr:#010X}");
            return Ok(false);
        };

        let unit = &mut self.sectors[sector];
        if unit.state == SectorState::EraseAcked {
            return Ok(false);
        }
        let was_pending = unit.state == SectorState::ErasePending;

        if !ok {
            error!("Possibly defective flash (erase failed), sector {sector} at {addr:#010X}");
            if was_pending {
                self.pending_erases = self
                    .pending_erases
                    .saturating_sub(1);
            }
            // Retry right away rather than waiting for the timeout.
            unit.state = SectorState::Init;
            unit.deadline = None;
            if unit.retries >= self.config.erase_retries {
                return Err(UpdateError::RetriesExceeded {
                    unit: sector,
                    kind: UnitKind::Erase,
                });
            }
            unit.retries += 1;
            return Ok(false);
        }

        unit.state = SectorState::EraseAcked;
        unit.deadline = None;
        if was_pending {
            self.pending_erases = self
                .pending_erases
                .saturating_sub(1);
        }
        self.sectors_erased += 1;

        let begin = self.sector_first_packet[sector];
        let end = self.sector_first_packet[sector + 1].min(self.packets.len());
        for p in self
            .packets
            .iter_mut()
            .take(end)
            .skip(begin)
        {
            if p.state < PacketState::EraseAcked {
                p.state = PacketState::EraseAcked;
            }
        }
        trace!("Sector {sector} erased, packets {begin}..{end} writable");
        Ok(true)
    }

    fn on_write_ack(&mut self, msg: &Message) -> EngineResult<bool> {
        let addr = msg
            .u32_at(0)
            .unwrap_or_default();
        let ok = msg.payload[4] != 0;

        let Some(packet) = packet_for_address(addr, self.fw_base, self.config.packet_size)
            .filter(|&p| p < self.packets.len())
        else {
            error!("Write acknowledgement for unknown address {addr:#010X}");
            return Ok(false);
        };

        if !ok {
            error!(
                "Defective flash (write failed) in range {addr:#010X}:{:#010X}",
                addr.wrapping_add(self.config.packet_size)
            );
            return Err(UpdateError::DeviceReportedFailure {
                unit: Some(packet),
                kind: UnitKind::Write,
            });
        }

        let unit = &mut self.packets[packet];
        match unit.state {
            PacketState::WritePending => {
                unit.state = PacketState::WriteAcked;
                unit.deadline = None;
                self.pending_writes = self
                    .pending_writes
                    .saturating_sub(1);
                self.packets_written += 1;
                Ok(true)
            },
            PacketState::WriteAcked => {
                debug!("Packet {packet} acknowledged twice");
                Ok(false)
            },
            state => {
                warn!("Packet {packet} ({addr:#010X}) write acknowledged but {state:?}");
                Ok(false)
            },
        }
    }

    fn on_chip_erase(&mut self, msg: &Message) -> EngineResult<()> {
        if !self.erase_in_progress {
            return Ok(());
        }
        if msg.payload[0] != 1 {
            error!("Chip erase failed");
            return Err(UpdateError::DeviceReportedFailure {
                unit: None,
                kind: UnitKind::ChipErase,
            });
        }
        debug!("Chip erase finished");
        self.erase_in_progress = false;
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn packet_address(&self, packet: usize) -> u32 {
        self.fw_base
            .wrapping_add((packet as u32).wrapping_mul(self.config.packet_size))
    }
}
