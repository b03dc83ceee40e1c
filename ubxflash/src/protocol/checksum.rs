//! Running-sum checksums used by UBX frames and firmware images.
//!
//! Both checksums are the same Fletcher-style recurrence (`a += x; b += a`),
//! once over bytes with 8-bit sums and once over little-endian words with
//! 32-bit sums. Image footers and flash information blobs are protected by a
//! reflected CRC-32 with a custom seed and no final xor instead.

use {
    crate::error::{Error, Result},
    crc::{Algorithm, Crc},
};

const fn seeded_crc32(seed: u32) -> Algorithm<u32> {
    Algorithm {
        width: 32,
        poly: 0x04C1_1DB7,
        // The crate reflects `init` for reflected algorithms.
        init: seed.reverse_bits(),
        refin: true,
        refout: true,
        xorout: 0,
        check: 0,
        residue: 0,
    }
}

/// CRC-32 of the firmware image footer.
pub const FOOTER_CRC: Crc<u32> = Crc::<u32>::new(&FOOTER_CRC_ALGORITHM);

/// CRC-32 of a flash information structure.
pub const FIS_CRC: Crc<u32> = Crc::<u32>::new(&FIS_CRC_ALGORITHM);

const FOOTER_CRC_ALGORITHM: Algorithm<u32> = seeded_crc32(0x0F5D_4C69);
const FIS_CRC_ALGORITHM: Algorithm<u32> = seeded_crc32(0x1234_5678);

/// 8-bit running sums over `data`, packed as `(b << 8) | a`.
pub fn checksum16(data: &[u8]) -> u16 {
    let (a, b) = data.iter().fold((0u8, 0u8), |(a, b), &byte| {
        let a = a.wrapping_add(byte);
        (a, b.wrapping_add(a))
    });
    u16::from(b) << 8 | u16::from(a)
}

/// 32-bit running sums over the little-endian words of `data`.
///
/// `data.len()` must be a multiple of 4.
pub fn checksum32(data: &[u8]) -> Result<(u32, u32)> {
    if data.len() % 4 != 0 {
        return Err(Error::Protocol(format!(
            "checksum32 needs a multiple of 4 bytes, got {}",
            data.len()
        )));
    }

    Ok(data
        .chunks_exact(4)
        .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
        .fold((0u32, 0u32), |(a, b), word| {
            let a = a.wrapping_add(word);
            (a, b.wrapping_add(a))
        }))
}

/// Check a range of an image against the two checksum words stored right after it.
///
/// Returns `false` when the range is misaligned or the stored words are missing.
pub fn verify_trailing_checksum32(data: &[u8], range: std::ops::Range<usize>) -> bool {
    let end = range.end;
    let Some(stored) = data.get(end..end + 8) else {
        return false;
    };
    let Some(body) = data.get(range) else {
        return false;
    };
    let Ok((a, b)) = checksum32(body) else {
        return false;
    };

    let stored_a = u32::from_le_bytes([stored[0], stored[1], stored[2], stored[3]]);
    let stored_b = u32::from_le_bytes([stored[4], stored[5], stored[6], stored[7]]);
    a == stored_a && b == stored_b
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum16_mon_ver_poll() {
        // Class 0x0A, id 0x04, empty payload: well-known trailer 0x0E 0x34.
        assert_eq!(checksum16(&[0x0A, 0x04, 0x00, 0x00]), 0x340E);
    }

    #[test]
    fn test_checksum16_empty() {
        assert_eq!(checksum16(&[]), 0);
    }

    #[test]
    fn test_checksum16_wraps() {
        let data = [0xFF; 300];
        let (mut a, mut b) = (0u8, 0u8);
        for &x in &data {
            a = a.wrapping_add(x);
            b = b.wrapping_add(a);
        }
        assert_eq!(checksum16(&data), u16::from(b) << 8 | u16::from(a));
    }

    #[test]
    fn test_seeded_crc32() {
        assert_eq!(FOOTER_CRC.checksum(b"123456789"), 0x105B_F777);
        assert_eq!(FIS_CRC.checksum(b"123456789"), 0xE7FD_94D5);
        assert_eq!(FOOTER_CRC.checksum(&[]), 0x0F5D_4C69);
    }

    #[test]
    fn test_checksum32_words() {
        let data = [1, 0, 0, 0, 2, 0, 0, 0];
        // a = 1, 3; b = 1, 4
        assert_eq!(checksum32(&data).unwrap(), (3, 4));
    }

    #[test]
    fn test_checksum32_wrapping() {
        let data = [0xFF; 8];
        let a1 = 0xFFFF_FFFFu32;
        let a2 = a1.wrapping_add(0xFFFF_FFFF);
        assert_eq!(checksum32(&data).unwrap(), (a2, a1.wrapping_add(a2)));
    }

    #[test]
    fn test_checksum32_rejects_unaligned() {
        assert!(checksum32(&[1, 2, 3]).is_err());
    }

    #[test]
    fn test_verify_trailing_checksum32() {
        let mut data = vec![0u8; 4];
        data.extend_from_slice(&[5, 0, 0, 0, 7, 0, 0, 0]);
        let (a, b) = checksum32(&data[4..12]).unwrap();
        data.extend_from_slice(&a.to_le_bytes());
        data.extend_from_slice(&b.to_le_bytes());

        assert!(verify_trailing_checksum32(&data, 4..12));
        data[5] ^= 1;
        assert!(!verify_trailing_checksum32(&data, 4..12));
        assert!(!verify_trailing_checksum32(&data, 4..16));
    }
}
