//! Fixed-capacity receive window.

use {
    crate::protocol::ubx::{Message, Scan, scan_for_frame},
    log::warn,
};

/// Default capacity of a session's receive buffer.
pub const RECEIVE_BUFFER_SIZE: usize = 65536;

/// Append-only byte window with a read cursor.
///
/// Holds `0 <= cursor <= end <= capacity`. Consumed bytes are dropped
/// (the window is compacted) each time a frame is extracted or the
/// remaining bytes turn out to be junk.
#[derive(Debug)]
pub struct ReceiveBuffer {
    data: Box<[u8]>,
    cursor: usize,
    end: usize,
}

impl Default for ReceiveBuffer {
    fn default() -> Self {
        Self::new(RECEIVE_BUFFER_SIZE)
    }
}

impl ReceiveBuffer {
    /// Create an empty buffer of `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            cursor: 0,
            end: 0,
        }
    }

    /// Unconsumed bytes.
    pub fn len(&self) -> usize {
        self.end - self.cursor
    }

    /// Whether no unconsumed bytes remain.
    pub fn is_empty(&self) -> bool {
        self.cursor == self.end
    }

    /// Total capacity.
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.cursor = 0;
        self.end = 0;
    }

    /// Free space for the next read, compacting first if needed.
    ///
    /// A window full of bytes that never formed a frame is discarded.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        if self.end == self.capacity() {
            self.compact();
        }
        if self.end == self.capacity() {
            warn!(
                "Receive buffer overflow, dropping {} bytes",
                self.len()
            );
            self.clear();
        }
        &mut self.data[self.end..]
    }

    /// Mark `n` bytes of the spare region as filled.
    pub fn commit(&mut self, n: usize) {
        self.end = (self.end + n).min(self.capacity());
    }

    /// Append bytes, as far as they fit.
    pub fn extend(&mut self, bytes: &[u8]) -> usize {
        let spare = self.spare_mut();
        let n = bytes.len().min(spare.len());
        spare[..n].copy_from_slice(&bytes[..n]);
        self.commit(n);
        n
    }

    /// Extract the next valid frame, skipping corrupt data.
    pub fn next_frame(&mut self) -> Option<Message> {
        loop {
            match scan_for_frame(&self.data[self.cursor..self.end]) {
                Scan::Frame { start, len } => {
                    let frame = &self.data[self.cursor + start..self.cursor + start + len];
                    let msg = Message::new(frame[2], frame[3], &frame[6..len - 2]);
                    self.cursor += start + len;
                    self.compact();
                    return Some(msg);
                },
                Scan::Corrupt { resume_at } => {
                    self.cursor += resume_at;
                },
                Scan::Incomplete { keep_from } => {
                    if keep_from > 0 {
                        self.cursor += keep_from;
                        self.compact();
                    }
                    return None;
                },
            }
        }
    }

    fn compact(&mut self) {
        if self.cursor > 0 {
            self.data
                .copy_within(self.cursor..self.end, 0);
            self.end -= self.cursor;
            self.cursor = 0;
        }
    }
}
