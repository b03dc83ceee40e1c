//! Flash organization and address arithmetic.
//!
//! A [`FlashLayout`] is an ordered list of blocks, each a run of equally
//! sized sectors. Sectors are numbered from zero across all blocks.

use std::fmt;

/// A run of `count` sectors of `size` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BlockDef {
    /// Number of sectors.
    pub count: u32,
    /// Sector size in bytes.
    pub size: u32,
}

/// Sector layout of a flash device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FlashLayout {
    blocks: Vec<BlockDef>,
}

impl FlashLayout {
    /// Layout from blocks in address order.
    pub fn new(blocks: Vec<BlockDef>) -> Self {
        Self { blocks }
    }

    /// `count` sectors of `size` bytes.
    pub fn uniform(count: u32, size: u32) -> Self {
        Self::new(vec![BlockDef { count, size }])
    }

    /// Blocks in address order.
    pub fn blocks(&self) -> &[BlockDef] {
        &self.blocks
    }

    /// Whether the layout describes no sectors.
    pub fn is_empty(&self) -> bool {
        self.sector_sizes()
            .next()
            .is_none()
    }

    /// Total number of sectors.
    pub fn sector_count(&self) -> usize {
        self.blocks
            .iter()
            .map(|b| b.count as usize)
            .sum()
    }

    /// Total size in bytes.
    pub fn total_size(&self) -> u64 {
        self.blocks
            .iter()
            .map(|b| u64::from(b.count) * u64::from(b.size))
            .sum()
    }

    /// Size of each sector, in order.
    pub fn sector_sizes(&self) -> impl Iterator<Item = u32> + '_ {
        self.blocks
            .iter()
            .flat_map(|b| std::iter::repeat_n(b.size, b.count as usize))
    }

    /// Number of sectors needed to hold `size` bytes starting at the first
    /// sector boundary at or after `offset`.
    ///
    /// `None` if the flash ends first.
    pub fn sector_count_for(&self, offset: u32, size: u32) -> Option<usize> {
        let mut sectors = self.sector_sizes();

        let mut pos = 0u64;
        while pos < u64::from(offset) {
            pos += u64::from(sectors.next()?);
        }

        let mut covered = 0u64;
        let mut count = 0;
        while covered < u64::from(size) {
            covered += u64::from(sectors.next()?);
            count += 1;
        }
        Some(count)
    }

    /// Index of the sector holding `addr`, for an image mapped at `base`
    /// and placed `offset` bytes into the flash.
    ///
    /// Indices count from the sector at `offset`. `None` if the address lies
    /// before `base` or beyond the flash.
    pub fn sector_for_address(&self, addr: u32, base: u32, offset: u32) -> Option<usize> {
        let target = u64::from(addr.checked_sub(base)?) + u64::from(offset);
        let mut sectors = self
            .sector_sizes()
            .peekable();

        let mut pos = 0u64;
        while pos < u64::from(offset) {
            pos += u64::from(sectors.next()?);
        }

        let mut index = 0;
        while pos < target {
            pos += u64::from(sectors.next()?);
            if pos > target {
                break;
            }
            index += 1;
            sectors.peek()?;
        }
        Some(index)
    }

    /// Index of the first `packet_size` packet that falls into `sector`.
    pub fn first_packet_of_sector(&self, sector: usize, packet_size: u32) -> Option<usize> {
        if packet_size == 0 {
            return None;
        }

        if let [block] = self.blocks.as_slice() {
            if sector > block.count as usize {
                return None;
            }
            let bytes = sector as u64 * u64::from(block.size);
            return usize::try_from(bytes / u64::from(packet_size)).ok();
        }

        let mut sectors = self.sector_sizes();
        let mut packet = 0usize;
        for _ in 0..sector {
            packet += (sectors.next()? / packet_size) as usize;
        }
        Some(packet)
    }
}

impl fmt::Display for FlashLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self
            .blocks
            .iter()
            .enumerate()
        {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}x{}K", b.count, b.size / 1024)?;
        }
        Ok(())
    }
}

/// Index of the packet holding `addr`, for an image mapped at `base`.
pub fn packet_for_address(addr: u32, base: u32, packet_size: u32) -> Option<usize> {
    if packet_size == 0 {
        return None;
    }
    Some((addr.checked_sub(base)? / packet_size) as usize)
}
