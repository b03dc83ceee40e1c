//! Flash Information Structure (FIS) blobs.
//!
//! A FIS tells the receiver's loader how to drive its SQI flash. The tool
//! treats it as an opaque blob: it is read from a file or from the receiver,
//! merged into images and sent back with UPD-FIS. Only the sector geometry
//! and the trailing CRC are interpreted.

use {
    crate::{
        error::{Error, Result},
        flash::FlashLayout,
        protocol::checksum::FIS_CRC,
    },
    byteorder::{ByteOrder, LittleEndian},
    log::debug,
    std::{fs, path::Path},
};

/// Size of the FIS as exchanged with newer receivers.
pub const FIS_SIZE: usize = 72;

/// Offset of the FIS inside the first flash sector of older images.
pub const FIS_OFFSET: usize = 0x40;

/// Largest FIS that fits into the first sector after the image header.
pub const MAX_FIS_SIZE: usize = 0x1000 - FIS_OFFSET;

const MAJOR_REV: usize = 0x04;
const MINOR_REV: usize = 0x05;
const SECTOR_SIZE: usize = 0x08;
const SECTOR_COUNT: usize = 0x0C;
const SECTOR_COUNT_V3: usize = 0x08;
const REVISION_V3: usize = 0x20;
const SECTOR_SIZE_V3: u32 = 0x1000;

/// An opaque flash information blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fis {
    data: Vec<u8>,
}

impl Fis {
    /// Wrap raw FIS bytes.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        if data.len() < SECTOR_COUNT + 4 {
            return Err(Error::InvalidImage(format!(
                "FIS too short ({} bytes)",
                data.len()
            )));
        }
        if data.len() > MAX_FIS_SIZE {
            return Err(Error::InvalidImage(format!(
                "FIS too large ({} bytes, at most {MAX_FIS_SIZE})",
                data.len()
            )));
        }
        Ok(Self { data })
    }

    /// Load a binary FIS file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read(path)?;
        debug!("Loaded FIS {} ({} bytes)", path.display(), data.len());
        Self::from_bytes(data)
    }

    /// FIS as reported by the receiver in a UPD-FIS reply.
    ///
    /// Replies without the trailing checksum word are padded. A FIS without
    /// revision information was derived from the flash's SFDP table and is
    /// marked as version 3.0.
    pub fn from_receiver(payload: &[u8]) -> Result<Self> {
        if payload.len() != FIS_SIZE && payload.len() != FIS_SIZE - 4 {
            return Err(Error::Protocol(format!(
                "unexpected UPD-FIS reply of {} bytes",
                payload.len()
            )));
        }
        let mut data = payload.to_vec();
        data.resize(FIS_SIZE, 0xFF);

        if data[REVISION_V3..REVISION_V3 + 4] == [0; 4] {
            data[MAJOR_REV] = 3;
            data[MINOR_REV] = 0;
        }
        Ok(Self { data })
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the blob holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn is_v3(&self) -> bool {
        self.data[MAJOR_REV] == 3 && self.data[MINOR_REV] == 0
    }

    /// Number of flash sectors.
    pub fn sector_count(&self) -> u32 {
        if self.is_v3() {
            u32::from(LittleEndian::read_u16(&self.data[SECTOR_COUNT_V3..]))
        } else {
            LittleEndian::read_u32(&self.data[SECTOR_COUNT..])
        }
    }

    /// Flash sector size in bytes.
    pub fn sector_size(&self) -> u32 {
        if self.is_v3() {
            SECTOR_SIZE_V3
        } else {
            LittleEndian::read_u32(&self.data[SECTOR_SIZE..])
        }
    }

    /// Uniform layout described by this FIS.
    pub fn layout(&self) -> FlashLayout {
        FlashLayout::uniform(self.sector_count(), self.sector_size())
    }

    /// Whether the trailing CRC word matches the contents.
    pub fn checksum_valid(&self) -> bool {
        let Some(split) = self
            .data
            .len()
            .checked_sub(4)
        else {
            return false;
        };
        let (body, stored) = self
            .data
            .split_at(split);
        FIS_CRC.checksum(body) == LittleEndian::read_u32(stored)
    }
}
