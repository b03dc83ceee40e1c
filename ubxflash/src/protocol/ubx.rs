//! UBX message framing.
//!
//! ## Frame Format
//!
//! ```text
//! +------+------+-------+----+---------+-------------+------+------+
//! | 0xB5 | 0x62 | class | id | length  |   payload   | ck_a | ck_b |
//! +------+------+-------+----+---------+-------------+------+------+
//! |  1   |  1   |   1   | 1  | 2 (LE)  |   length    |  1   |  1   |
//! +------+------+-------+----+---------+-------------+------+------+
//! ```
//!
//! The checksum covers `class..payload`, sync bytes excluded.

use {
    crate::protocol::checksum::checksum16,
    byteorder::{ByteOrder, LittleEndian, WriteBytesExt},
    log::warn,
};

/// First sync byte.
pub const SYNC_1: u8 = 0xB5;

/// Second sync byte.
pub const SYNC_2: u8 = 0x62;

/// Header (sync, class, id, length) plus checksum trailer.
pub const FRAME_OVERHEAD: usize = 8;

/// Largest frame accepted from the wire; longer declared lengths are corrupt.
pub const MAX_FRAME_SIZE: usize = 16384;

/// Message classes.
pub mod class {
    /// Acknowledgement.
    pub const ACK: u8 = 0x05;
    /// Configuration.
    pub const CFG: u8 = 0x06;
    /// Firmware update.
    pub const UPD: u8 = 0x09;
    /// Monitoring.
    pub const MON: u8 = 0x0A;
}

/// Message ids within their class.
pub mod id {
    /// ACK-NAK.
    pub const NAK: u8 = 0x00;
    /// ACK-ACK.
    pub const ACK: u8 = 0x01;

    /// CFG-PRT port configuration.
    pub const CFG_PRT: u8 = 0x00;
    /// CFG-RST reset.
    pub const CFG_RST: u8 = 0x04;

    /// MON-VER version information.
    pub const MON_VER: u8 = 0x04;

    /// UPD-DOWNL download into RAM.
    pub const UPD_DOWNL: u8 = 0x01;
    /// UPD-UPLOAD read back memory.
    pub const UPD_UPLOAD: u8 = 0x02;
    /// UPD-IDEN loader identification.
    pub const UPD_IDEN: u8 = 0x06;
    /// UPD-SAFE enter safeboot or start the loader.
    pub const UPD_SAFE: u8 = 0x07;
    /// UPD-FLDET flash detection.
    pub const UPD_FLDET: u8 = 0x08;
    /// UPD-QSIZE queue size.
    pub const UPD_QSIZE: u8 = 0x09;
    /// UPD-ERASE sector erase.
    pub const UPD_ERASE: u8 = 0x0B;
    /// UPD-FLWRI flash write.
    pub const UPD_FLWRI: u8 = 0x0C;
    /// UPD-CRC image checksum check.
    pub const UPD_CRC: u8 = 0x0D;
    /// UPD-RBOOT reboot.
    pub const UPD_RBOOT: u8 = 0x0E;
    /// UPD-SETQ set queue size.
    pub const UPD_SETQ: u8 = 0x0F;
    /// UPD-CERASE chip erase.
    pub const UPD_CERASE: u8 = 0x16;
    /// UPD-FIS flash information structure.
    pub const UPD_FIS: u8 = 0x19;
    /// UPD-IMG RAM image chunk.
    pub const UPD_IMG: u8 = 0x1A;
    /// UPD-AUTHREAD authenticated read.
    pub const UPD_AUTHREAD: u8 = 0x20;
    /// UPD-AUTHWRITE authenticated write.
    pub const UPD_AUTHWRITE: u8 = 0x21;
    /// UPD-ROM ROM information.
    pub const UPD_ROM: u8 = 0x25;
}

/// A decoded UBX message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message class.
    pub class: u8,
    /// Message id.
    pub id: u8,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

impl Message {
    /// Create a message.
    pub fn new(class: u8, id: u8, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            class,
            id,
            payload: payload.into(),
        }
    }

    /// Decode a frame previously located by [`scan_for_frame`].
    ///
    /// Returns `None` if `frame` is not exactly one well-formed frame.
    pub fn from_frame(frame: &[u8]) -> Option<Self> {
        match scan_for_frame(frame) {
            Scan::Frame { start: 0, len } if len == frame.len() => Some(Self::new(
                frame[2],
                frame[3],
                &frame[6..len - 2],
            )),
            _ => None,
        }
    }

    /// Encode to wire bytes.
    pub fn to_frame(&self) -> Vec<u8> {
        build_frame(self.class, self.id, &self.payload)
    }

    /// Whether this message has the given class and id.
    pub fn is(&self, class: u8, id: u8) -> bool {
        self.class == class && self.id == id
    }

    /// Payload length.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Little-endian `u16` at `offset` in the payload.
    pub fn u16_at(&self, offset: usize) -> Option<u16> {
        self.payload
            .get(offset..offset + 2)
            .map(LittleEndian::read_u16)
    }

    /// Little-endian `u32` at `offset` in the payload.
    pub fn u32_at(&self, offset: usize) -> Option<u32> {
        self.payload
            .get(offset..offset + 4)
            .map(LittleEndian::read_u32)
    }
}

/// Build a complete frame.
#[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
#[allow(clippy::cast_possible_truncation)]
pub fn build_frame(class: u8, id: u8, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + FRAME_OVERHEAD);
    frame.push(SYNC_1);
    frame.push(SYNC_2);
    frame.push(class);
    frame.push(id);
    frame
        .write_u16::<LittleEndian>(payload.len() as u16)
        .unwrap();
    frame.extend_from_slice(payload);
    let ck = checksum16(&frame[2..]);
    frame
        .write_u16::<LittleEndian>(ck)
        .unwrap();
    frame
}

/// Outcome of scanning a byte window for a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scan {
    /// A valid frame occupies `start..start + len`.
    Frame {
        /// Offset of the first sync byte.
        start: usize,
        /// Total frame length.
        len: usize,
    },
    /// No complete frame yet. Bytes before `keep_from` can never start one.
    Incomplete {
        /// Offset of the first byte worth keeping.
        keep_from: usize,
    },
    /// A candidate frame was corrupt; scanning must resume at `resume_at`.
    Corrupt {
        /// Offset one past the rejected sync byte.
        resume_at: usize,
    },
}

/// Scan `buf` for the first frame.
///
/// Corrupt candidates (bad checksum, absurd length) are logged and reported
/// so the caller can skip one byte and rescan.
pub fn scan_for_frame(buf: &[u8]) -> Scan {
    let Some(start) = buf
        .windows(2)
        .position(|w| w[0] == SYNC_1 && w[1] == SYNC_2)
    else {
        // A trailing first sync byte may still be completed by the next read.
        let keep_from = match buf.last() {
            Some(&SYNC_1) => buf.len() - 1,
            _ => buf.len(),
        };
        return Scan::Incomplete { keep_from };
    };

    let rest = &buf[start..];
    if rest.len() < FRAME_OVERHEAD {
        return Scan::Incomplete { keep_from: start };
    }

    let size = usize::from(LittleEndian::read_u16(&rest[4..6]));
    let len = size + FRAME_OVERHEAD;
    if len > MAX_FRAME_SIZE {
        warn!("UBX frame with implausible length {size}, resynchronizing");
        return Scan::Corrupt {
            resume_at: start + 1,
        };
    }
    if rest.len() < len {
        return Scan::Incomplete { keep_from: start };
    }

    let expected = checksum16(&rest[2..len - 2]);
    let actual = LittleEndian::read_u16(&rest[len - 2..len]);
    if expected != actual {
        warn!(
            "UBX checksum error in {:02X}-{:02X} (expected {expected:#06x}, got {actual:#06x})",
            rest[2], rest[3]
        );
        return Scan::Corrupt {
            resume_at: start + 1,
        };
    }

    Scan::Frame { start, len }
}

/// Builders for the payloads this tool sends.
pub mod payload {
    use byteorder::{LittleEndian, WriteBytesExt};

    /// Single little-endian address.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn address(addr: u32) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4);
        buf.write_u32::<LittleEndian>(addr)
            .unwrap();
        buf
    }

    /// UPD-FLWRI: `[address][size][data]`, data padded with `0xFF` to `capacity`.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    #[allow(clippy::cast_possible_truncation)]
    pub fn flash_write(addr: u32, data: &[u8], capacity: usize) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + capacity.max(data.len()));
        buf.write_u32::<LittleEndian>(addr)
            .unwrap();
        buf.write_u32::<LittleEndian>(data.len() as u32)
            .unwrap();
        buf.extend_from_slice(data);
        buf.resize(8 + capacity.max(data.len()), 0xFF);
        buf
    }

    /// Sequence of little-endian words.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn words(values: &[u32]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(values.len() * 4);
        for &v in values {
            buf.write_u32::<LittleEndian>(v)
                .unwrap();
        }
        buf
    }

    /// CFG-PRT for UART1 at `baud`, 8N1, UBX in and out.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn uart_port(baud: u32) -> Vec<u8> {
        const MODE_8N1: u32 = (1 << 7) | (1 << 6) | (1 << 11);
        const PROTO_UBX: u16 = 1;

        let mut buf = Vec::with_capacity(20);
        buf.push(1); // portId UART1
        buf.push(0);
        buf.write_u16::<LittleEndian>(0)
            .unwrap(); // txReady
        buf.write_u32::<LittleEndian>(MODE_8N1)
            .unwrap();
        buf.write_u32::<LittleEndian>(baud)
            .unwrap();
        buf.write_u16::<LittleEndian>(PROTO_UBX)
            .unwrap();
        buf.write_u16::<LittleEndian>(PROTO_UBX)
            .unwrap();
        buf.write_u16::<LittleEndian>(0)
            .unwrap(); // flags
        buf.write_u16::<LittleEndian>(0)
            .unwrap();
        buf
    }

    /// CFG-RST with the given navigation bbr mask and reset mode.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn reset(nav_bbr_mask: u16, reset_mode: u8) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4);
        buf.write_u16::<LittleEndian>(nav_bbr_mask)
            .unwrap();
        buf.push(reset_mode);
        buf.push(0);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_frame_mon_ver_poll() {
        let frame = build_frame(class::MON, id::MON_VER, &[]);
        assert_eq!(frame, vec![0xB5, 0x62, 0x0A, 0x04, 0x00, 0x00, 0x0E, 0x34]);
    }

    #[test]
    fn test_frame_round_trip() {
        let msg = Message::new(class::UPD, id::UPD_FLWRI, vec![1, 2, 3, 4, 5]);
        let frame = msg.to_frame();
        assert_eq!(frame.len(), 5 + FRAME_OVERHEAD);
        assert_eq!(scan_for_frame(&frame), Scan::Frame { start: 0, len: 13 });
        assert_eq!(Message::from_frame(&frame), Some(msg));
    }

    #[test]
    fn test_scan_skips_leading_junk() {
        let mut buf = vec![0x00, 0xB5, 0x13];
        buf.extend(build_frame(class::ACK, id::ACK, &[0x09, 0x0B]));
        assert_eq!(scan_for_frame(&buf), Scan::Frame { start: 3, len: 10 });
    }

    #[test]
    fn test_scan_incomplete_header() {
        let frame = build_frame(class::MON, id::MON_VER, &[1, 2, 3]);
        assert_eq!(
            scan_for_frame(&frame[..5]),
            Scan::Incomplete { keep_from: 0 }
        );
        assert_eq!(
            scan_for_frame(&frame[..frame.len() - 1]),
            Scan::Incomplete { keep_from: 0 }
        );
    }

    #[test]
    fn test_scan_no_sync() {
        assert_eq!(
            scan_for_frame(&[1, 2, 3]),
            Scan::Incomplete { keep_from: 3 }
        );
        assert_eq!(
            scan_for_frame(&[1, 2, SYNC_1]),
            Scan::Incomplete { keep_from: 2 }
        );
        assert_eq!(scan_for_frame(&[]), Scan::Incomplete { keep_from: 0 });
    }

    #[test]
    fn test_scan_corrupt_payload_then_resync() {
        let mut bad = build_frame(class::UPD, id::UPD_ERASE, &[0, 0, 0x80, 0, 1]);
        bad[7] ^= 0x55;
        let good = build_frame(class::UPD, id::UPD_FLWRI, &[0, 2, 0x80, 0, 1]);
        let mut buf = bad.clone();
        buf.extend_from_slice(&good);

        let mut offset = 0;
        let found = loop {
            match scan_for_frame(&buf[offset..]) {
                Scan::Corrupt { resume_at } => offset += resume_at,
                Scan::Frame { start, len } => break (offset + start, len),
                Scan::Incomplete { .. } => panic!("valid frame not found"),
            }
        };
        assert_eq!(found, (bad.len(), good.len()));
    }

    #[test]
    fn test_scan_corrupt_without_recovery() {
        let mut bad = build_frame(class::MON, id::MON_VER, &[7; 4]);
        bad[8] = 0;
        assert_eq!(scan_for_frame(&bad), Scan::Corrupt { resume_at: 1 });
        assert!(matches!(
            scan_for_frame(&bad[1..]),
            Scan::Incomplete { .. }
        ));
    }

    #[test]
    fn test_scan_oversized_length() {
        let buf = [0xB5, 0x62, 0x09, 0x0C, 0xFF, 0x7F, 0, 0];
        assert_eq!(scan_for_frame(&buf), Scan::Corrupt { resume_at: 1 });
    }

    #[test]
    fn test_message_accessors() {
        let msg = Message::new(class::UPD, id::UPD_FLDET, vec![0, 0, 0, 0, 0x01, 0x00, 0x70, 0x22]);
        assert!(msg.is(class::UPD, id::UPD_FLDET));
        assert_eq!(msg.u16_at(4), Some(0x0001));
        assert_eq!(msg.u16_at(6), Some(0x2270));
        assert_eq!(msg.u32_at(6), None);
    }

    #[test]
    fn test_flash_write_payload_pads_short_packet() {
        let p = payload::flash_write(0x0080_0200, &[0xAA, 0xBB], 8);
        assert_eq!(&p[..4], &[0x00, 0x02, 0x80, 0x00]);
        assert_eq!(&p[4..8], &[2, 0, 0, 0]);
        assert_eq!(&p[8..], &[0xAA, 0xBB, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_uart_port_payload() {
        let p = payload::uart_port(115200);
        assert_eq!(p.len(), 20);
        assert_eq!(p[0], 1);
        assert_eq!(&p[4..8], &0x8C0u32.to_le_bytes());
        assert_eq!(&p[8..12], &115200u32.to_le_bytes());
        assert_eq!(&p[12..16], &[1, 0, 1, 0]);
    }
}
