//! Firmware image files.
//!
//! ## Header
//!
//! Images up to generation 8 start with a header of little-endian words:
//!
//! ```text
//! +-------+---------+------------+------+-------+-----+---------+-----------+--------------+
//! | magic | execute | entry_safe | base | start | end | version | reserved  | erased_marker|
//! +-------+---------+------------+------+-------+-----+---------+-----------+--------------+
//! |   4   |    4    |     4      |  4   |   4   |  4  |    4    |  4 x 4    |      4       |
//! +-------+---------+------------+------+-------+-----+---------+-----------+--------------+
//! ```
//!
//! The two checksum32 words of the image follow `end`.
//!
//! ## Footer
//!
//! Newer images have no readable header but end with a footer, found by its
//! `UBFL` magic within the last bytes:
//!
//! ```text
//! +-----+---------------+------------+-------------+---------+--------+
//! | crc | image_size[n] | image_count| config_size | version | "UBFL" |
//! +-----+---------------+------------+-------------+---------+--------+
//! |  4  |     4 x n     |     4      |      4      |    4    |   4    |
//! +-----+---------------+------------+-------------+---------+--------+
//! ```
//!
//! The CRC covers everything after it, magic included.

use {
    crate::{
        error::{Error, Result},
        fis::{FIS_OFFSET, FIS_SIZE, Fis},
        protocol::checksum::{FOOTER_CRC, checksum32, verify_trailing_checksum32},
    },
    byteorder::{ByteOrder, LittleEndian, ReadBytesExt},
    log::{debug, info},
    std::{fs, io::Cursor, path::Path},
};

/// Flash base address of the receivers' memory map.
pub const FLASH_BASE: u32 = 0x0080_0000;

/// Base address used for RAM images.
pub const RAM_BASE: u32 = 0x0080_0000;

/// Header size in bytes.
pub const HEADER_SIZE: usize = 48;

/// Generation reported for footer-only images.
pub const FOOTER_GENERATION: u32 = 91;

const FOOTER_MAGIC: &[u8; 4] = b"UBFL";
const MAX_FOOTER_IMAGES: u32 = 2;
const ADDRESS_WINDOW_MASK: u32 = 0xFF80_0000;
const MAX_VERSION_LEN: usize = 100;
const SECTOR_SIZE: usize = 0x1000;

const fn magic(tag: &[u8; 4]) -> u32 {
    u32::from_le_bytes(*tag)
}

/// Header magic words and the generation they identify.
const MAGICS: [(u32, u32); 4] = [
    (magic(b"UBX5"), 50),
    (magic(b"UB51"), 60),
    (magic(b"UBX7"), 70),
    (magic(b"UBX8"), 80),
];

/// Image header of generation 5 to 8 images.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageHeader {
    /// Magic word.
    pub magic: u32,
    /// First instruction.
    pub execute: u32,
    /// Entry point of the safeboot image.
    pub entry_safe: u32,
    /// Base address.
    pub base: u32,
    /// Start address.
    pub start: u32,
    /// End address; the checksum words follow it.
    pub end: u32,
    /// Address of the version string.
    pub version: u32,
    /// Marker telling the file system the flash was fully erased.
    pub erased_marker: u32,
}

impl ImageHeader {
    /// Read a header from the start of `data`.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::InvalidImage(format!(
                "image too short for header ({} bytes)",
                data.len()
            )));
        }
        let mut reader = Cursor::new(data);
        let magic = reader.read_u32::<LittleEndian>()?;
        let execute = reader.read_u32::<LittleEndian>()?;
        let entry_safe = reader.read_u32::<LittleEndian>()?;
        let base = reader.read_u32::<LittleEndian>()?;
        let start = reader.read_u32::<LittleEndian>()?;
        let end = reader.read_u32::<LittleEndian>()?;
        let version = reader.read_u32::<LittleEndian>()?;
        reader.set_position(44);
        let erased_marker = reader.read_u32::<LittleEndian>()?;

        Ok(Self {
            magic,
            execute,
            entry_safe,
            base,
            start,
            end,
            version,
            erased_marker,
        })
    }

    /// Generation identified by the magic word.
    pub fn generation(&self) -> Option<u32> {
        MAGICS
            .iter()
            .find(|(m, _)| *m == self.magic)
            .map(|&(_, g)| g)
    }

    /// Whether all pointers lie in the flash window and are ordered.
    pub fn addresses_valid(&self) -> bool {
        let in_window = |a: u32| a & ADDRESS_WINDOW_MASK == FLASH_BASE;
        self.end >= self.start
            && self.start >= self.base
            && in_window(self.base)
            && in_window(self.start)
            && in_window(self.end)
    }

    /// Offset of the checksum words.
    pub fn checksum_offset(&self) -> usize {
        ((self.end & !1) - self.base) as usize
    }
}

/// Contents of an image footer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FooterInfo {
    /// Sizes of the contained images.
    pub image_sizes: Vec<u32>,
    /// Size of the attached configuration.
    pub config_size: u32,
}

/// Locate and validate the footer.
///
/// `Ok(None)` when there is no footer; an error when there is one but it is
/// damaged or of an unknown version.
pub fn parse_footer(data: &[u8]) -> Result<Option<FooterInfo>> {
    // Up to three bytes of padding may follow the magic.
    let Some(magic_at) = (0..4)
        .filter_map(|pad| data.len().checked_sub(4 + pad))
        .find(|&pos| &data[pos..pos + 4] == FOOTER_MAGIC)
    else {
        return Ok(None);
    };

    let word = |back: usize| -> Option<u32> {
        let pos = magic_at.checked_sub(back)?;
        Some(LittleEndian::read_u32(&data[pos..pos + 4]))
    };
    let invalid = || Error::InvalidImage("invalid image footer".to_string());

    let version = word(4).ok_or_else(invalid)?;
    let count = word(12).ok_or_else(invalid)?;
    if version != 0 || count > MAX_FOOTER_IMAGES {
        return Err(invalid());
    }

    let footer_size = 20 + 4 * count as usize;
    let crc_at = (magic_at + 4)
        .checked_sub(footer_size)
        .ok_or_else(invalid)?;
    let stored = LittleEndian::read_u32(&data[crc_at..crc_at + 4]);
    if FOOTER_CRC.checksum(&data[crc_at + 4..magic_at + 4]) != stored {
        return Err(invalid());
    }

    let image_sizes = (0..count as usize)
        .map(|i| LittleEndian::read_u32(&data[crc_at + 4 + 4 * i..]))
        .collect::<Vec<_>>();
    let config_size = word(8).ok_or_else(invalid)?;
    for (i, size) in image_sizes
        .iter()
        .enumerate()
    {
        debug!("Footer image {i} size {size}");
    }
    debug!("Footer config size {config_size}");

    Ok(Some(FooterInfo {
        image_sizes,
        config_size,
    }))
}

/// A validated firmware image, padded to whole words.
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    data: Vec<u8>,
    generation: u32,
    header: Option<ImageHeader>,
    footer: Option<FooterInfo>,
    version: Option<String>,
}

impl FirmwareImage {
    /// Load and validate an image file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read(path)?;
        debug!("Loaded {} ({} bytes)", path.display(), data.len());
        Self::from_bytes(data)
    }

    /// Validate image bytes.
    pub fn from_bytes(mut data: Vec<u8>) -> Result<Self> {
        let padded = data
            .len()
            .next_multiple_of(4);
        data.resize(padded, 0xFF);

        if data.len() < HEADER_SIZE {
            return Err(Error::InvalidImage(format!(
                "file too small ({} bytes)",
                data.len()
            )));
        }

        let header = ImageHeader::parse(&data)?;
        let footer = parse_footer(&data)?;

        let Some(generation) = header.generation() else {
            if footer.is_some() {
                info!("Image for u-blox 9 accepted ({} bytes)", data.len());
                return Ok(Self {
                    data,
                    generation: FOOTER_GENERATION,
                    header: None,
                    footer,
                    version: None,
                });
            }
            return Err(Error::InvalidImage("no magic word found".to_string()));
        };

        if !header.addresses_valid() {
            return Err(Error::InvalidImage("image addresses invalid".to_string()));
        }

        let crc_at = header.checksum_offset();
        if !verify_trailing_checksum32(&data, 4..crc_at) {
            return Err(Error::InvalidImage("image checksum mismatch".to_string()));
        }

        let version = read_version(&data, &header);
        info!(
            "Image (file size {}) for u-blox{} accepted",
            data.len(),
            generation / 10
        );
        if let Some(v) = &version {
            info!("Image version '{v}'");
        }

        Ok(Self {
            data,
            generation,
            header: Some(header),
            footer,
            version,
        })
    }

    /// Image holding only a FIS, for receivers whose flash is to be prepared.
    ///
    /// Generation 9 and later take the bare structure; older receivers get a
    /// whole first sector with a blank header and the FIS at its usual place.
    pub fn fis_only(fis: &Fis, receiver_generation: u32) -> Result<Self> {
        let data = if receiver_generation >= 90 {
            let mut data = fis.as_bytes().to_vec();
            data.resize(FIS_SIZE, 0xFF);
            data
        } else {
            let mut data = vec![0xFF; SECTOR_SIZE];
            data[..FIS_OFFSET].fill(0);
            data[FIS_OFFSET..FIS_OFFSET + fis.len()].copy_from_slice(fis.as_bytes());
            data
        };
        Ok(Self {
            data,
            generation: receiver_generation,
            header: None,
            footer: None,
            version: None,
        })
    }

    /// Merge a FIS into the image.
    ///
    /// For generation 9 the structure is prepended. Generation 7 and 8
    /// images carry it inside their first sector, so it is written there and
    /// the image checksum is recomputed.
    pub fn merge_fis(&mut self, fis: &Fis, receiver_generation: u32) -> Result<()> {
        if receiver_generation >= 90 {
            let mut merged = fis.as_bytes().to_vec();
            merged.resize(FIS_SIZE, 0xFF);
            merged.extend_from_slice(&self.data);
            self.data = merged;
            debug!("FIS prepended to image");
            return Ok(());
        }

        let Some(header) = self.header else {
            return Err(Error::InvalidImage(
                "image has no header to merge the FIS into".to_string(),
            ));
        };
        let crc_at = header.checksum_offset();
        if crc_at + 8 > self.data.len() || FIS_OFFSET + fis.len() > crc_at {
            return Err(Error::InvalidImage("image too small to hold the FIS".to_string()));
        }

        self.data[FIS_OFFSET..FIS_OFFSET + fis.len()].copy_from_slice(fis.as_bytes());
        let (a, b) = checksum32(&self.data[4..crc_at])?;
        LittleEndian::write_u32(&mut self.data[crc_at..], a);
        LittleEndian::write_u32(&mut self.data[crc_at + 4..], b);
        if !verify_trailing_checksum32(&self.data, 4..crc_at) {
            return Err(Error::InvalidImage("checksum update after FIS merge failed".to_string()));
        }
        debug!("FIS merged into image, checksum {a:#010X} {b:#010X}");
        Ok(())
    }

    /// Image bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Size in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the image is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Generation the image was built for.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Header, for images that have one.
    pub fn header(&self) -> Option<&ImageHeader> {
        self.header
            .as_ref()
    }

    /// Footer, for images that have one.
    pub fn footer(&self) -> Option<&FooterInfo> {
        self.footer
            .as_ref()
    }

    /// Version string embedded in the image.
    pub fn version(&self) -> Option<&str> {
        self.version
            .as_deref()
    }

    /// Whether the image is compatible with a receiver of `receiver_generation`.
    pub fn compatible_with(&self, receiver_generation: u32) -> bool {
        match self.generation {
            FOOTER_GENERATION => receiver_generation == 90,
            60 => matches!(receiver_generation, 51 | 60),
            g => g == receiver_generation,
        }
    }
}

fn read_version(data: &[u8], header: &ImageHeader) -> Option<String> {
    if header.version & ADDRESS_WINDOW_MASK != FLASH_BASE {
        return None;
    }
    let offset = header
        .version
        .checked_sub(header.base)? as usize;
    let bytes = data.get(offset..)?;
    let bytes = &bytes[..bytes.len().min(MAX_VERSION_LEN)];
    let end = bytes
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(bytes.len());
    Some(String::from_utf8_lossy(&bytes[..end]).into_owned())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use byteorder::WriteBytesExt;

    /// A generation 8 image of `size` bytes with a valid checksum and
    /// version string.
    pub(crate) fn gen80_image(size: usize) -> Vec<u8> {
        let base = FLASH_BASE;
        let end = base + (size - 8) as u32;
        let mut data = Vec::with_capacity(size);
        for word in [magic(b"UBX8"), 0, 0, base, base + 0x40, end, base + 0x30, 0, 0, 0, 0] {
            data.write_u32::<LittleEndian>(word).unwrap();
        }
        data.write_u32::<LittleEndian>(0xEE7B_8F34).unwrap();
        data.extend_from_slice(b"ROM SPG 3.01\0\0\0\0");
        data.resize(size - 8, 0x5A);
        let (a, b) = checksum32(&data[4..]).unwrap();
        data.write_u32::<LittleEndian>(a).unwrap();
        data.write_u32::<LittleEndian>(b).unwrap();
        data
    }

    /// A footer-only image with `body` followed by a one-image footer.
    pub(crate) fn footer_image(body: usize) -> Vec<u8> {
        let mut data = vec![0x33; body];
        let crc_at = data.len();
        data.extend_from_slice(&[0; 4]);
        data.write_u32::<LittleEndian>(body as u32).unwrap();
        data.write_u32::<LittleEndian>(1).unwrap();
        data.write_u32::<LittleEndian>(0).unwrap();
        data.write_u32::<LittleEndian>(0).unwrap();
        data.extend_from_slice(FOOTER_MAGIC);
        let crc = FOOTER_CRC.checksum(&data[crc_at + 4..]);
        LittleEndian::write_u32(&mut data[crc_at..], crc);
        data
    }

    #[test]
    fn test_gen80_image_accepted() {
        let image = FirmwareImage::from_bytes(gen80_image(4096)).unwrap();
        assert_eq!(image.generation(), 80);
        assert_eq!(image.len(), 4096);
        assert_eq!(image.version(), Some("ROM SPG 3.01"));
        assert_eq!(image.header().map(|h| h.erased_marker), Some(0xEE7B_8F34));
        assert!(image.compatible_with(80));
        assert!(!image.compatible_with(70));
    }

    #[test]
    fn test_checksum_mismatch_rejected() {
        let mut data = gen80_image(4096);
        data[100] ^= 1;
        assert!(matches!(
            FirmwareImage::from_bytes(data),
            Err(Error::InvalidImage(_))
        ));
    }

    #[test]
    fn test_bad_addresses_rejected() {
        let mut data = gen80_image(1024);
        LittleEndian::write_u32(&mut data[12..], 0x0020_0000);
        assert!(FirmwareImage::from_bytes(data).is_err());
    }

    #[test]
    fn test_no_magic_no_footer_rejected() {
        assert!(FirmwareImage::from_bytes(vec![0x11; 256]).is_err());
        assert!(FirmwareImage::from_bytes(vec![0x11; 8]).is_err());
    }

    #[test]
    fn test_footer_image_is_generation_91() {
        let image = FirmwareImage::from_bytes(footer_image(1000)).unwrap();
        assert_eq!(image.generation(), FOOTER_GENERATION);
        assert_eq!(
            image.footer(),
            Some(&FooterInfo {
                image_sizes: vec![1000],
                config_size: 0,
            })
        );
        assert!(image.compatible_with(90));
        assert!(!image.compatible_with(80));
    }

    #[test]
    fn test_damaged_footer_rejected() {
        let mut data = footer_image(1000);
        data[1004] ^= 0xFF;
        assert!(matches!(parse_footer(&data), Err(Error::InvalidImage(_))));
    }

    #[test]
    fn test_footer_found_behind_padding() {
        let mut data = footer_image(64);
        data.extend_from_slice(&[0xFF; 3]);
        assert!(parse_footer(&data).unwrap().is_some());
        assert!(parse_footer(&[0u8; 64]).unwrap().is_none());
    }

    #[test]
    fn test_odd_length_padded() {
        let data = footer_image(998);
        assert_eq!(data.len(), 1022);
        let image = FirmwareImage::from_bytes(data).unwrap();
        assert_eq!(image.len(), 1024);
        assert_eq!(&image.data()[1022..], &[0xFF, 0xFF]);
    }

    #[test]
    fn test_merge_fis_gen80_updates_checksum() {
        let mut image = FirmwareImage::from_bytes(gen80_image(8192)).unwrap();
        let fis = Fis::from_bytes(vec![0xA5; 64]).unwrap();
        image
            .merge_fis(&fis, 80)
            .unwrap();
        assert_eq!(&image.data()[FIS_OFFSET..FIS_OFFSET + 64], &[0xA5; 64][..]);
        let crc_at = image
            .header()
            .unwrap()
            .checksum_offset();
        assert!(verify_trailing_checksum32(image.data(), 4..crc_at));
    }

    #[test]
    fn test_merge_fis_gen90_prepends() {
        let mut image = FirmwareImage::from_bytes(footer_image(100)).unwrap();
        let before = image.len();
        let fis = Fis::from_bytes(vec![0x42; FIS_SIZE]).unwrap();
        image
            .merge_fis(&fis, 90)
            .unwrap();
        assert_eq!(image.len(), before + FIS_SIZE);
        assert_eq!(&image.data()[..FIS_SIZE], &[0x42; FIS_SIZE][..]);
    }

    #[test]
    fn test_fis_only_images() {
        let fis = Fis::from_bytes(vec![0x42; FIS_SIZE]).unwrap();
        assert_eq!(FirmwareImage::fis_only(&fis, 90).unwrap().len(), FIS_SIZE);

        let sector = FirmwareImage::fis_only(&fis, 80).unwrap();
        assert_eq!(sector.len(), SECTOR_SIZE);
        assert!(sector.data()[..FIS_OFFSET].iter().all(|&b| b == 0));
        assert_eq!(sector.data()[FIS_OFFSET], 0x42);
        assert_eq!(sector.data()[FIS_OFFSET + FIS_SIZE], 0xFF);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fw.bin");
        fs::write(&path, gen80_image(2048)).unwrap();
        assert_eq!(FirmwareImage::from_file(&path).unwrap().generation(), 80);
    }
}
