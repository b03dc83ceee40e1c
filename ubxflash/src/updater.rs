//! The complete update procedure.
//!
//! [`Updater::run`] identifies the receiver, prepares it for the update,
//! moves the image with the [`UpdateEngine`] (or into RAM), verifies the
//! result and restarts the receiver:
//!
//! ```text
//! identify -> ROM CRC -> port -> safeboot / loader -> flash detection
//!          -> update baud -> [patch, FIS] -> erase/write -> verify -> reset
//! ```
//!
//! The first fatal step ends the run. The port is closed in every case.

use {
    crate::{
        error::{Error, Result},
        fis::{FIS_SIZE, Fis},
        flash::{FlashLayout, FlashTable},
        image::{FLASH_BASE, FOOTER_GENERATION, FirmwareImage, RAM_BASE},
        port::Port,
        protocol::{
            checksum32,
            ubx::{class, id, payload},
        },
        receiver::{PortId, ReceiverVersion, RomVersion, generation_name, rom_base, rom_size},
        session::{AckOutcome, RETRY_COUNT, Session},
        update::{EngineConfig, Progress, UpdateEngine, WRITE_TIMEOUT, download_to_ram},
    },
    log::{debug, error, info, warn},
    std::{
        io, thread,
        time::{Duration, Instant},
    },
};

/// Timeout of a single request/response exchange.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Time the receiver may take to checksum the written image.
pub const CRC_TIMEOUT: Duration = Duration::from_secs(3);

/// Pause after commanding safeboot; the receiver runs its power-on checks.
const SAFEBOOT_SETTLE: Duration = Duration::from_millis(500);

/// Additional safeboot pause for generation 9.
const SAFEBOOT_SETTLE_GEN9: Duration = Duration::from_millis(300);

/// Pause after a reboot command.
const REBOOT_SETTLE: Duration = Duration::from_millis(100);

/// Pause between the port reconfiguration and the local baud change.
const PORT_SWITCH_SETTLE: Duration = Duration::from_millis(200);

/// Images above this size trip a ROM bug on some receivers and need a
/// restart before verification.
const LARGE_IMAGE_SIZE: usize = 128 * 4096;

/// Flash-write flag of UPD-DOWNL and UPD-AUTHWRITE.
const FLASH_WRITE_FLAG: u32 = 0x100;

/// Erased-flash marker of u-blox 8 ROM 3.01.
const GEN8_ERASED_MARKER: u32 = 0xEE7B_8F34;

/// Sector following the FIS-only image on u-blox 8.
const GEN8_MARKER_ADDRESS: u32 = 0x1000;

const MARKER_SECTOR: usize = 0x1000;

/// UPD-AUTHREAD request for the last ROM word.
const ROM_CRC_AUTH: [u8; 44] = [
    0x9C, 0x59, 0xC5, 0x22, 0xEC, 0x34, 0x1A, 0x1A, 0x30, 0xCC, 0xB1, 0xFB, 0x69, 0xCB, 0xAD, 0x9A,
    0x41, 0x83, 0x6E, 0xDD, 0x27, 0xE4, 0xFB, 0xA6, 0x8C, 0x71, 0xE3, 0xAB, 0x8A, 0xA4, 0x0D, 0x20,
    0xFC, 0x7F, 0x08, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// Authentication hash of the UPD-AUTHWRITE that invalidates the flash image.
const INVALIDATE_FLASH_HASH: [u8; 32] = [
    0x55, 0x70, 0xC3, 0x2B, 0x19, 0xA7, 0xA5, 0xC9, 0x28, 0x3B, 0xDD, 0xE8, 0xD5, 0x89, 0xC4, 0x91,
    0x8F, 0xE5, 0x32, 0x8B, 0x20, 0x24, 0x1B, 0x45, 0x54, 0xDB, 0x30, 0x0D, 0x35, 0xBB, 0xE1, 0x1E,
];

/// Magic written with the invalidation so the firmware does not start its
/// file system.
const INVALIDATE_FLASH_MAGIC: u32 = u32::from_le_bytes(*b"UBX8");

/// CFG-PRT for SPI: UBX only, no FIFO, CPOL = CPHA = 0, no TX ready.
const SPI_PORT_CONFIG: [u8; 20] = [
    0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x01, 0x00,
    0x00, 0x00, 0x00, 0x00,
];

/// u-blox 7 ROM 1.00 erase timeout patch, RAM part.
const GEN7_PATCH_RAM: [u8; 12] = [
    0x98, 0x01, 0x00, 0x20, 0x00, 0x00, 0x00, 0x00, 0x00, 0x38, 0x9C, 0x1C,
];

/// u-blox 7 ROM 1.00 erase timeout patch, breakpoint unit part.
const GEN7_PATCH_FPB: [u8; 12] = [
    0x20, 0x20, 0x00, 0xE0, 0x00, 0x00, 0x00, 0x00, 0xED, 0x78, 0x04, 0x00,
];

/// Clears the breakpoint installed by [`GEN7_PATCH_FPB`].
const GEN7_PATCH_INVALIDATE: [u8; 12] = [
    0x20, 0x20, 0x00, 0xE0, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// CFG-RST navigation mask and mode that stop GNSS operation.
const STOP_GNSS: (u16, u8) = (0x0000, 0x08);

/// CFG-RST mask and mode for a controlled software reset after a RAM update.
const RAM_RESET: (u16, u8) = (0xFFFF, 0x01);

/// Switches for one update run.
#[derive(Debug, Clone)]
pub struct UpdateOptions {
    /// Baud rate of the safeboot loader.
    pub safe_baud: u32,
    /// Baud rate used for the transfer.
    pub update_baud: u32,
    /// Restart into safeboot instead of starting the loader in place.
    pub safeboot: bool,
    /// Reboot the receiver after a successful update.
    pub reset: bool,
    /// Find the receiver's baud rate when identifying it.
    pub autobaud: bool,
    /// Send the training sequence before talking to the receiver.
    pub training: bool,
    /// Erase the whole flash, not only the sectors the image needs.
    pub erase_all: bool,
    /// Only erase, do not write an image.
    pub erase_only: bool,
    /// Erase the whole chip with one command.
    pub chip_erase: bool,
    /// Only write the FIS.
    pub fis_only: bool,
    /// Do not merge or upload a FIS; newer receivers report their own.
    pub no_fis: bool,
    /// Run the image from RAM instead of flashing it.
    pub update_ram: bool,
    /// Enter the loader by invalidating the flash image over USB.
    pub usb_alt: bool,
    /// Timeout of single request/response exchanges.
    pub poll_timeout: Duration,
    /// Erase/write engine tuning.
    pub engine: EngineConfig,
}

impl Default for UpdateOptions {
    fn default() -> Self {
        Self {
            safe_baud: 9600,
            update_baud: 115_200,
            safeboot: true,
            reset: true,
            autobaud: false,
            training: true,
            erase_all: true,
            erase_only: false,
            chip_erase: false,
            fis_only: false,
            no_fis: false,
            update_ram: false,
            usb_alt: false,
            poll_timeout: POLL_TIMEOUT,
            engine: EngineConfig::default(),
        }
    }
}

impl UpdateOptions {
    /// Whether the run writes no firmware image.
    pub fn without_image(&self) -> bool {
        self.erase_only || self.fis_only
    }
}

/// What the run found out about the receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverInfo {
    /// MON-VER contents.
    pub version: ReceiverVersion,
    /// Hardware generation.
    pub generation: u32,
    /// CRC of the last ROM word.
    pub rom_crc: u32,
    /// ROM version, if the CRC is known.
    pub rom_version: Option<RomVersion>,
    /// Receiver port the host talks to.
    pub port: PortId,
}

/// Drives a complete firmware update over one port.
pub struct Updater<P: Port> {
    session: Session<P>,
    options: UpdateOptions,
    image: Option<FirmwareImage>,
    fis: Option<Fis>,
    flash_table: FlashTable,
}

impl<P: Port> Updater<P> {
    /// Create an updater for an opened port.
    pub fn new(port: P, options: UpdateOptions) -> Self {
        Self {
            session: Session::new(port),
            options,
            image: None,
            fis: None,
            flash_table: FlashTable::default(),
        }
    }

    /// Image to write.
    #[must_use]
    pub fn with_image(mut self, image: FirmwareImage) -> Self {
        self.image = Some(image);
        self
    }

    /// FIS to merge and upload.
    #[must_use]
    pub fn with_fis(mut self, fis: Fis) -> Self {
        self.fis = Some(fis);
        self
    }

    /// Flash organization table for receivers before generation 7.
    #[must_use]
    pub fn with_flash_table(mut self, table: FlashTable) -> Self {
        self.flash_table = table;
        self
    }

    /// Get a reference to the session.
    pub fn session(&self) -> &Session<P> {
        &self.session
    }

    /// Consume the updater and return the session.
    pub fn into_session(self) -> Session<P> {
        self.session
    }

    /// Run the update.
    ///
    /// `progress` is called while sectors are erased and packets written.
    pub fn run(&mut self, progress: &mut dyn FnMut(Progress)) -> Result<ReceiverInfo> {
        let result = self.execute(progress);
        if let Err(e) = self
            .session
            .close()
        {
            warn!("Closing {} failed: {e}", self.session.port().name());
        }
        result
    }

    #[allow(clippy::cast_possible_truncation)]
    fn execute(&mut self, progress: &mut dyn FnMut(Progress)) -> Result<ReceiverInfo> {
        let opts = self
            .options
            .clone();

        let mut image = if opts.without_image() {
            None
        } else {
            Some(
                self.image
                    .clone()
                    .ok_or_else(|| Error::Config("no firmware image given".to_string()))?,
            )
        };
        let image_generation = image
            .as_ref()
            .map_or(0, FirmwareImage::generation);

        // Identify the receiver
        if opts.training {
            self.session
                .send_training();
        }
        let version = self.identify()?;
        let generation = version
            .generation()
            .ok_or_else(|| {
                Error::Unsupported(format!("unknown hardware version '{}'", version.hardware))
            })?;
        info!("{} receiver running '{}'", generation_name(generation), version.software);

        let rom_size = rom_size(generation).ok_or_else(|| {
            Error::Unsupported(format!("no ROM size known for generation {generation}"))
        })?;
        if opts.update_ram && generation < 90 {
            return Err(Error::Unsupported(format!(
                "RAM updates need u-blox 9 or later, found {}",
                generation_name(generation)
            )));
        }
        let ram = opts.update_ram;

        let (rom_crc, mut fw_base) = if generation >= 90 && image_generation >= FOOTER_GENERATION {
            let base = if ram { RAM_BASE } else { FIS_SIZE as u32 };
            (self.read_rom_crc_gen9()?, base)
        } else {
            let base = image
                .as_ref()
                .and_then(FirmwareImage::header)
                .map_or(FLASH_BASE, |h| h.base);
            (self.read_rom_crc(generation, rom_size)?, base)
        };

        let rom_version = RomVersion::from_crc(rom_crc);
        match rom_version {
            Some(rom) => info!("{} {rom} hardware detected ({rom_crc:#010X})", generation_name(generation)),
            None if opts.erase_only => {
                warn!("{} ROM version unknown ({rom_crc:#010X})", generation_name(generation));
            },
            None => {
                return Err(Error::Unsupported(format!(
                    "{} ROM version unknown ({rom_crc:#010X})",
                    generation_name(generation)
                )));
            },
        }

        if let Some(image) = &image {
            if !image.compatible_with(generation) {
                return Err(Error::InvalidImage(format!(
                    "receiver generation ({generation}) incompatible with this image ({})",
                    image.generation()
                )));
            }
        }

        let port = self.detect_port()?;
        let usb = port == PortId::Usb;

        // Bring up the loader
        let mut safeboot = opts.safeboot;
        if opts.usb_alt {
            self.invalidate_flash_image(usb)?;
            safeboot = false;
        }
        if safeboot {
            self.enter_safeboot(generation, usb)?;
        } else {
            self.start_loader()?;
        }

        // Flash organization
        let needs_flash = !ram;
        let (manufacturer, device) = if needs_flash {
            self.detect_flash(fw_base)?
        } else {
            (0, 0)
        };

        let mut fis = None;
        let layout = if !needs_flash {
            FlashLayout::default()
        } else if generation >= 70 {
            let loaded = if generation >= 90 && opts.no_fis {
                self.read_receiver_fis()?
            } else {
                self.fis
                    .clone()
                    .ok_or_else(|| {
                        Error::Config(format!(
                            "{} needs a FIS for flash {manufacturer:#06X}-{device:#06X}",
                            generation_name(generation)
                        ))
                    })?
            };
            if !loaded.checksum_valid() {
                warn!("FIS checksum does not match its contents");
            }

            if opts.fis_only {
                image = Some(FirmwareImage::fis_only(&loaded, generation)?);
            } else if let Some(image) = image.as_mut() {
                if opts.no_fis {
                    debug!("Not merging the FIS");
                } else {
                    image.merge_fis(&loaded, generation)?;
                    if generation >= 90 {
                        fw_base = 0;
                    }
                    debug!("FIS merged");
                }
            }
            let layout = loaded.layout();
            fis = Some(loaded);
            layout
        } else {
            if opts.fis_only {
                return Err(Error::Unsupported(format!(
                    "{} has no FIS",
                    generation_name(generation)
                )));
            }
            self.flash_table
                .lookup(manufacturer, device)
                .cloned()
                .ok_or_else(|| {
                    Error::FlashLayout(format!(
                        "no flash organization known for manufacturer {manufacturer:#06X} device {device:#06X}"
                    ))
                })?
        };

        let image_len = image
            .as_ref()
            .map_or(0, FirmwareImage::len);
        if needs_flash {
            info!("Flash: {layout} ({} KiB)", layout.total_size() / 1024);
            if layout.total_size() < image_len as u64 {
                return Err(Error::FlashLayout(format!(
                    "flash too small for image ({} < {image_len} bytes)",
                    layout.total_size()
                )));
            }
        }

        self.switch_to_update_baud()?;

        let gen7_rom100 = generation == 70 && rom_version == Some(RomVersion(100));
        if gen7_rom100 {
            debug!("Sending patch for the erase timeout");
            for patch in [&GEN7_PATCH_RAM, &GEN7_PATCH_FPB] {
                self.expect_ack(class::UPD, id::UPD_DOWNL, patch, "erase timeout patch")?;
            }
        }

        if !ram && generation >= 90 && !opts.no_fis {
            let fis = fis
                .as_ref()
                .ok_or_else(|| Error::Config("no FIS to send to the receiver".to_string()))?;
            self.upload_fis(fis);
        }

        // Move the image
        let data = image
            .as_ref()
            .map_or(&[][..], FirmwareImage::data);
        if ram {
            if data.is_empty() {
                return Err(Error::Config("no image to download to RAM".to_string()));
            }
            if port == PortId::Spi {
                self.expect_ack(class::CFG, id::CFG_PRT, &SPI_PORT_CONFIG, "SPI configuration")?;
            }
            info!("Receiver info collected, downloading to RAM");
            download_to_ram(&mut self.session, data, opts.poll_timeout, progress)?;
        } else {
            self.write_flash(generation, data, fw_base, &layout, progress)?;
        }

        if gen7_rom100 {
            debug!("Invalidating the erase timeout patch");
            self.expect_ack(class::UPD, id::UPD_DOWNL, &GEN7_PATCH_INVALIDATE, "patch invalidation")?;
        }

        if opts.erase_all && generation == 80 {
            let marker = if opts.fis_only {
                (rom_version == Some(RomVersion(301)))
                    .then_some((GEN8_MARKER_ADDRESS, GEN8_ERASED_MARKER))
            } else if opts.erase_only {
                None
            } else {
                image
                    .as_ref()
                    .and_then(FirmwareImage::header)
                    .filter(|h| h.erased_marker != u32::MAX)
                    .map(|h| {
                        let end = fw_base as usize + image_len;
                        ((end / MARKER_SECTOR + 1) * MARKER_SECTOR, h.erased_marker)
                    })
                    .map(|(address, marker)| (address as u32, marker))
            };
            if let Some((address, marker)) = marker {
                self.write_erased_marker(address, marker)?;
            }
        }

        let buggy_rom = gen7_rom100
            || (generation == 80 && matches!(rom_version, Some(RomVersion(22 | 201))));
        if image_len > LARGE_IMAGE_SIZE && buggy_rom {
            self.restart_loader(usb)?;
        }

        if !opts.without_image() {
            info!("Verifying image on hardware");
            self.verify(data, fw_base, ram, generation)?;
            info!("CRC check passed");
        }

        if opts.reset {
            if ram {
                let (mask, mode) = RAM_RESET;
                if !self
                    .session
                    .send(class::CFG, id::CFG_RST, &payload::reset(mask, mode))
                {
                    warn!("Reset command not sent");
                }
            } else {
                self.reboot();
            }
        }

        Ok(ReceiverInfo {
            version,
            generation,
            rom_crc,
            rom_version,
            port,
        })
    }

    fn identify(&mut self) -> Result<ReceiverVersion> {
        let reply = if self.options.autobaud {
            self.session
                .autobaud(self.options.training)?
        } else {
            self.session
                .poll(class::MON, id::MON_VER, &[], self.options.poll_timeout)
                .ok_or_else(|| Error::Timeout("version poll failed".to_string()))?
        };
        ReceiverVersion::parse(&reply.payload)
    }

    fn read_rom_crc_gen9(&mut self) -> Result<u32> {
        debug!("Polling ROM CRC");
        self.session
            .poll(class::UPD, id::UPD_ROM, &[], self.options.poll_timeout)
            .and_then(|reply| reply.u32_at(8))
            .ok_or_else(|| Error::Timeout("could not get ROM CRC".to_string()))
    }

    /// Read the CRC stored in the last ROM word.
    ///
    /// Both the plain upload and the authenticated read are requested; older
    /// ROMs answer the first, newer ones the second.
    fn read_rom_crc(&mut self, generation: u32, rom_size: u32) -> Result<u32> {
        let request = payload::words(&[rom_base(generation) + rom_size - 4, 4, 0]);
        debug!("Reading ROM CRC");

        for attempt in 1..=RETRY_COUNT {
            if !self
                .session
                .send(class::UPD, id::UPD_UPLOAD, &request)
                || !self
                    .session
                    .send(class::UPD, id::UPD_AUTHREAD, &ROM_CRC_AUTH)
            {
                break;
            }

            let deadline = Instant::now() + self.options.poll_timeout;
            while let Some(reply) = self.session.receive(
                deadline.saturating_duration_since(Instant::now()),
                Some(class::UPD),
                None,
            ) {
                let crc = match reply.id {
                    id::UPD_UPLOAD => reply.u32_at(12),
                    id::UPD_AUTHREAD => reply.u32_at(ROM_CRC_AUTH.len()),
                    _ => None,
                };
                if let Some(crc) = crc {
                    debug!("ROM CRC {crc:#010X}");
                    return Ok(crc);
                }
            }
            debug!("No ROM CRC (attempt {attempt}/{RETRY_COUNT})");
        }
        Err(Error::Timeout("could not get ROM CRC".to_string()))
    }

    fn detect_port(&mut self) -> Result<PortId> {
        info!("Getting port connection to receiver");
        let reply = self
            .session
            .poll(class::CFG, id::CFG_PRT, &[], self.options.poll_timeout)
            .ok_or_else(|| Error::Timeout("getting port connection timed out".to_string()))?;
        let port = reply
            .payload
            .first()
            .map(|&id| PortId::from(id))
            .ok_or_else(|| Error::Protocol("empty port configuration".to_string()))?;
        debug!("Connected port is {port}");
        Ok(port)
    }

    fn invalidate_flash_image(&mut self, usb: bool) -> Result<()> {
        info!("Invalidating flash image");
        let probe = payload::words(&[FLASH_BASE + 12, FLASH_WRITE_FLAG, 0]);
        let outcome = self
            .session
            .ack(class::UPD, id::UPD_DOWNL, &probe, self.options.poll_timeout);
        if outcome != AckOutcome::Acked {
            let mut auth = INVALIDATE_FLASH_HASH.to_vec();
            auth.extend(payload::words(&[FLASH_BASE, FLASH_WRITE_FLAG, INVALIDATE_FLASH_MAGIC]));
            self.expect_ack(class::UPD, id::UPD_AUTHWRITE, &auth, "flash invalidation")?;
        }

        self.reboot();
        thread::sleep(REBOOT_SETTLE);
        self.reenumerate(usb)
    }

    fn enter_safeboot(&mut self, generation: u32, usb: bool) -> Result<()> {
        info!("Commanding safeboot");
        self.send(class::UPD, id::UPD_SAFE, &[], "safeboot command")?;
        thread::sleep(SAFEBOOT_SETTLE);
        if generation == 90 {
            thread::sleep(SAFEBOOT_SETTLE_GEN9);
        }

        self.reenumerate(usb)?;
        if !usb {
            self.session
                .set_baud(self.options.safe_baud)?;
        }
        if self.options.training {
            self.session
                .send_training();
        }
        self.identify()?;
        Ok(())
    }

    fn start_loader(&mut self) -> Result<()> {
        self.launch_loader_task();

        info!("Identifying flash loader");
        let reply = self
            .session
            .poll(class::UPD, id::UPD_IDEN, &[], self.options.poll_timeout)
            .filter(|m| m.len() == 1)
            .ok_or_else(|| Error::Protocol("identifying the flash loader failed".to_string()))?;
        let loader = reply.payload[0];
        debug!("Flash loader version {}.{}", loader >> 4, loader & 0x0F);

        self.stop_gnss()
    }

    fn launch_loader_task(&mut self) {
        info!("Starting flash loader");
        // A NAK still means the loader is running.
        match self
            .session
            .ack(class::UPD, id::UPD_SAFE, &[1], self.options.poll_timeout)
        {
            AckOutcome::TimedOut => error!("Starting flash loader failed"),
            _ => debug!("Flash loader started"),
        }
    }

    fn stop_gnss(&mut self) -> Result<()> {
        info!("Stopping GNSS operation");
        let (mask, mode) = STOP_GNSS;
        self.send(class::CFG, id::CFG_RST, &payload::reset(mask, mode), "stop command")
    }

    fn detect_flash(&mut self, fw_base: u32) -> Result<(u16, u16)> {
        info!("Detecting flash manufacturer and device ids");
        let reply = self
            .session
            .poll(class::UPD, id::UPD_FLDET, &payload::address(fw_base), self.options.poll_timeout)
            .ok_or_else(|| Error::Timeout("flash detection timed out".to_string()))?;
        let (8, Some(manufacturer), Some(device)) = (reply.len(), reply.u16_at(4), reply.u16_at(6))
        else {
            return Err(Error::Protocol(format!(
                "unexpected flash detection reply of {} bytes",
                reply.len()
            )));
        };
        debug!("Flash manufacturer {manufacturer:#06X} device {device:#06X}");
        Ok((manufacturer, device))
    }

    fn read_receiver_fis(&mut self) -> Result<Fis> {
        debug!("Reading FIS from receiver");
        let reply = self
            .session
            .poll(class::UPD, id::UPD_FIS, &[], self.options.poll_timeout)
            .ok_or_else(|| Error::Timeout("receiver did not report its FIS".to_string()))?;
        Fis::from_receiver(&reply.payload)
    }

    fn switch_to_update_baud(&mut self) -> Result<()> {
        let baud = self.options.update_baud;
        debug!("Switching to {baud} baud");
        // The receiver answers at the new rate, if at all.
        self.session
            .send(class::CFG, id::CFG_PRT, &payload::uart_port(baud));
        thread::sleep(PORT_SWITCH_SETTLE);
        self.session
            .set_baud(baud)?;
        self.session
            .flush_receiver()?;

        self.session
            .poll(class::MON, id::MON_VER, &[], self.options.poll_timeout)
            .ok_or_else(|| Error::Timeout(format!("no answer at {baud} baud")))?;
        Ok(())
    }

    fn upload_fis(&mut self, fis: &Fis) {
        let mut data = fis
            .as_bytes()
            .to_vec();
        data.resize(FIS_SIZE, 0xFF);
        match self
            .session
            .ack(class::UPD, id::UPD_FIS, &data[..FIS_SIZE], self.options.poll_timeout)
        {
            AckOutcome::Acked => debug!("FIS sent to the receiver"),
            AckOutcome::Nacked => warn!("FIS not accepted by receiver"),
            AckOutcome::TimedOut => warn!("FIS upload timed out"),
        }
    }

    fn write_flash(
        &mut self,
        generation: u32,
        data: &[u8],
        fw_base: u32,
        layout: &FlashLayout,
        progress: &mut dyn FnMut(Progress),
    ) -> Result<()> {
        let opts = &self.options;
        let too_large = || Error::FlashLayout(format!("flash layout ({layout}) too small"));

        let (sectors, chip_erase) = if opts.chip_erase {
            if generation <= 70 {
                return Err(Error::Unsupported(
                    "chip erase is not supported on this receiver".to_string(),
                ));
            }
            let timeout = opts.poll_timeout;
            if self
                .session
                .ack(class::UPD, id::UPD_CERASE, &[], timeout)
                != AckOutcome::Acked
            {
                return Err(Error::Protocol(
                    "could not start chip erase; does the ROM support it?".to_string(),
                ));
            }
            info!("Chip erase started");
            (0, true)
        } else if opts.erase_all {
            let size = u32::try_from(layout.total_size()).map_err(|_| too_large())?;
            (layout.sector_count_for(0, size).ok_or_else(too_large)?, false)
        } else if opts.erase_only {
            (1, false)
        } else {
            let size = u32::try_from(data.len()).map_err(|_| too_large())?;
            (layout.sector_count_for(0, size).ok_or_else(too_large)?, false)
        };

        info!(
            "Updating flash: {sectors} sectors to erase, {} bytes to write",
            data.len()
        );
        let mut engine = UpdateEngine::new(data, fw_base, layout, sectors, self.options.engine.clone())?
            .with_chip_erase_in_progress(chip_erase);
        engine.run(&mut self.session, progress)?;
        Ok(())
    }

    fn write_erased_marker(&mut self, address: u32, marker: u32) -> Result<()> {
        info!("Writing marker for the file system to speed up first initialization");
        let request = payload::words(&[address, 4, marker]);
        self.session
            .poll(class::UPD, id::UPD_FLWRI, &request, WRITE_TIMEOUT)
            .ok_or_else(|| Error::Timeout("failed to write the file system marker".to_string()))?;
        Ok(())
    }

    /// Restart the loader after large images, which some ROMs cannot
    /// verify in the session that wrote them.
    fn restart_loader(&mut self, usb: bool) -> Result<()> {
        if usb {
            self.reboot();
            thread::sleep(REBOOT_SETTLE);
        } else {
            info!("Commanding safeboot");
            self.send(class::UPD, id::UPD_SAFE, &[], "safeboot command")?;
            thread::sleep(SAFEBOOT_SETTLE);
        }

        self.reenumerate(usb)?;
        if usb {
            self.stop_gnss()?;
            self.launch_loader_task();
        } else {
            self.session
                .set_baud(self.options.safe_baud)?;
            if self.options.training {
                self.session
                    .send_training();
            }
        }
        self.identify()?;
        Ok(())
    }

    fn verify(&mut self, data: &[u8], fw_base: u32, ram: bool, generation: u32) -> Result<()> {
        let (a, b) = checksum32(data)?;
        let size = u32::try_from(data.len())
            .map_err(|_| Error::InvalidImage(format!("image of {} bytes too large", data.len())))?;
        let words = payload::words(&[fw_base, size, a, b]);

        let request = if generation >= 90 {
            let mut request = vec![1, u8::from(!ram)];
            request.extend_from_slice(&words);
            request
        } else {
            words
        };

        let reply = self
            .session
            .poll(class::UPD, id::UPD_CRC, &request, CRC_TIMEOUT)
            .ok_or_else(|| Error::Timeout("polling verify message failed".to_string()))?;
        if reply.len() != 5 || reply.payload[4] == 0 {
            return Err(Error::Protocol("verify failed: CRC mismatch".to_string()));
        }
        Ok(())
    }

    fn reboot(&mut self) {
        info!("Rebooting receiver");
        if !self
            .session
            .send(class::UPD, id::UPD_RBOOT, &[])
        {
            warn!("Reboot command not sent");
        }
    }

    /// Re-open the link after a restart. Only USB devices re-enumerate.
    fn reenumerate(&mut self, usb: bool) -> Result<()> {
        if usb {
            self.session
                .reconnect()?;
        }
        Ok(())
    }

    fn send(&mut self, class: u8, id: u8, payload: &[u8], what: &str) -> Result<()> {
        if self
            .session
            .send(class, id, payload)
        {
            Ok(())
        } else {
            Err(Error::Io(io::Error::other(format!("sending {what} failed"))))
        }
    }

    fn expect_ack(&mut self, class: u8, id: u8, payload: &[u8], what: &str) -> Result<()> {
        match self
            .session
            .ack(class, id, payload, self.options.poll_timeout)
        {
            AckOutcome::Acked => Ok(()),
            AckOutcome::Nacked => Err(Error::Protocol(format!("{what} rejected by receiver"))),
            AckOutcome::TimedOut => Err(Error::Timeout(format!("{what} not acknowledged"))),
        }
    }
}
