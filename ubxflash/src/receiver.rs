//! Receiver identification.
//!
//! The hardware generation comes from the MON-VER hardware string, the
//! ROM version from the CRC of the last ROM word.

use {
    crate::error::{Error, Result},
    log::debug,
    std::fmt,
};

/// Offset of the hardware version string in MON-VER.
const HW_VERSION_OFFSET: usize = 30;

/// Hardware strings and the generation they identify.
const HARDWARE_GENERATIONS: [(&str, u32); 6] = [
    ("00190000", 90),
    ("00080000", 80),
    ("00070000", 70),
    ("00040007", 60),
    ("00040006", 51),
    ("00040005", 50),
];

/// ROM CRCs and the ROM versions they identify.
const ROM_VERSIONS: [(u32, u32); 23] = [
    (0x0000_0000, 200),
    (0xE046_F6C8, 300),
    (0x3CB3_E4FF, 400),
    (0x806A_F596, 500),
    (0xEA00_D0BD, 510),
    (0xB5CD_6FC1, 600),
    (0x2BA1_23BA, 601),
    (0x2886_46C9, 602),
    (0xB94D_4114, 701),
    (0x494D_F1F9, 703),
    (0xD5FC_E753, 10),
    (0xFCE5_98B1, 11),
    (0xED15_2ADE, 14),
    (0x100E_368D, 100),
    (0xDFAA_666C, 21),
    (0x041D_115D, 22),
    (0xA15A_F099, 201),
    (0x2FEF_89EA, 301),
    (0x1893_C329, 351),
    (0xCAAF_619C, 40),
    (0xDD3F_E36C, 101),
    (0x118B_2060, 102),
    (0x3BFC_8935, 404),
];

/// Parsed MON-VER reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverVersion {
    /// Running software.
    pub software: String,
    /// Hardware version string.
    pub hardware: String,
}

impl ReceiverVersion {
    /// Parse a MON-VER payload.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let software = c_string(payload)
            .ok_or_else(|| Error::Protocol("software version information seems corrupt".to_string()))?;
        let hardware = payload
            .get(HW_VERSION_OFFSET..)
            .and_then(c_string)
            .ok_or_else(|| Error::Protocol("hardware version information seems corrupt".to_string()))?;

        debug!("Receiver running SW '{software}', HW '{hardware}'");
        Ok(Self { software, hardware })
    }

    /// Hardware generation, e.g. 80 for u-blox 8.
    pub fn generation(&self) -> Option<u32> {
        HARDWARE_GENERATIONS
            .iter()
            .find(|(hw, _)| *hw == self.hardware)
            .map(|&(_, g)| g)
    }
}

fn c_string(bytes: &[u8]) -> Option<String> {
    let end = bytes
        .iter()
        .position(|&b| b == 0)?;
    Some(String::from_utf8_lossy(&bytes[..end]).into_owned())
}

/// ROM size of a generation.
pub fn rom_size(generation: u32) -> Option<u32> {
    match generation {
        50 => Some(384 * 1024),
        51 | 60 => Some(448 * 1024),
        70 => Some(512 * 1024),
        80 => Some(544 * 1024),
        90 => Some(672 * 1024),
        _ => None,
    }
}

/// Start of the ROM in the receiver's address space.
pub fn rom_base(generation: u32) -> u32 {
    if generation >= 70 { 0x0000_0000 } else { 0x0020_0000 }
}

/// ROM version, stored as `major * 100 + minor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct RomVersion(pub u32);

impl RomVersion {
    /// Identify a ROM by the CRC stored in its last word.
    pub fn from_crc(crc: u32) -> Option<Self> {
        ROM_VERSIONS
            .iter()
            .find(|(c, _)| *c == crc)
            .map(|&(_, v)| Self(v))
    }
}

impl fmt::Display for RomVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ROM{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

/// Receiver port the host is connected to, from CFG-PRT.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortId {
    /// DDC (I2C).
    I2c,
    /// First UART.
    Uart1,
    /// Second UART.
    Uart2,
    /// USB.
    Usb,
    /// SPI.
    Spi,
    /// Anything else.
    Unknown(u8),
}

impl From<u8> for PortId {
    fn from(id: u8) -> Self {
        match id {
            0 => Self::I2c,
            1 => Self::Uart1,
            2 => Self::Uart2,
            3 => Self::Usb,
            4 => Self::Spi,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::I2c => f.write_str("I2C"),
            Self::Uart1 => f.write_str("UART1"),
            Self::Uart2 => f.write_str("UART2"),
            Self::Usb => f.write_str("USB"),
            Self::Spi => f.write_str("SPI"),
            Self::Unknown(_) => f.write_str("???"),
        }
    }
}

/// Human readable generation, e.g. `u-blox 8`.
pub fn generation_name(generation: u32) -> String {
    if generation % 10 == 0 {
        format!("u-blox {}", generation / 10)
    } else {
        format!("u-blox {}.{}", generation / 10, generation % 10)
    }
}
