//! Streaming an image into receiver RAM with UPD-IMG.
//!
//! Chunks are numbered from zero and carry 512 data bytes, the last one
//! zero-padded. The receiver buffers only a few chunks, so at most
//! [`MAX_PENDING_CHUNKS`] are unacknowledged at any time. Every
//! acknowledgement restarts the inactivity timer.

use {
    crate::{
        error::{Error, Result, UpdateError},
        port::Port,
        protocol::ubx::{class, id},
        session::Session,
        update::engine::Progress,
    },
    byteorder::{LittleEndian, WriteBytesExt},
    log::{debug, error, warn},
    std::{
        thread,
        time::{Duration, Instant},
    },
};

/// Data bytes per UPD-IMG chunk.
pub const CHUNK_SIZE: usize = 512;

/// Unacknowledged chunks the receiver can hold.
pub const MAX_PENDING_CHUNKS: usize = 5;

/// Default inactivity timeout.
pub const RAM_TIMEOUT: Duration = Duration::from_secs(1);

const IDLE: Duration = Duration::from_millis(1);

/// UPD-IMG payload: chunk number, then the zero-padded chunk data.
#[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
fn chunk_payload(number: u16, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(2 + CHUNK_SIZE);
    buf.write_u16::<LittleEndian>(number)
        .unwrap();
    buf.extend_from_slice(data);
    buf.resize(2 + CHUNK_SIZE, 0);
    buf
}

/// Stream `image` to RAM.
///
/// `timeout` bounds the time without any acknowledgement.
pub fn download_to_ram<P: Port>(
    session: &mut Session<P>,
    image: &[u8],
    timeout: Duration,
    progress: &mut dyn FnMut(Progress),
) -> Result<()> {
    let total = image
        .len()
        .div_ceil(CHUNK_SIZE);
    if total > usize::from(u16::MAX) + 1 {
        return Err(Error::InvalidImage(format!(
            "{} bytes do not fit in numbered RAM chunks",
            image.len()
        )));
    }

    let report = |acked: usize| Progress {
        sectors_erased: 0,
        sector_count: 0,
        packets_written: acked,
        packet_count: total,
    };

    let mut sent = 0usize;
    let mut acked = 0usize;
    let mut deadline = Instant::now() + timeout;
    progress(report(0));

    while acked < total {
        if crate::is_interrupted_requested() {
            warn!("RAM download interrupted after {acked} of {total} chunks");
            return Err(UpdateError::Interrupted.into());
        }
        let mut busy = false;

        if sent - acked < MAX_PENDING_CHUNKS && sent < total {
            let start = sent * CHUNK_SIZE;
            let end = (start + CHUNK_SIZE).min(image.len());
            #[allow(clippy::cast_possible_truncation)]
            let body = chunk_payload(sent as u16, &image[start..end]);
            if !session.send(class::UPD, id::UPD_IMG, &body) {
                error!("Chunk {sent} not accepted by receiver");
                return Err(Error::Protocol(format!("could not send RAM chunk {sent}")));
            }
            sent += 1;
            busy = true;
        }

        if let Some(ack) = session.receive(Duration::ZERO, Some(class::ACK), None) {
            busy = true;
            if ack.payload.get(..2) == Some(&[class::UPD, id::UPD_IMG][..]) {
                if ack.id != id::ACK {
                    error!("Received NAK for chunk {acked}");
                    return Err(Error::Protocol(format!("receiver rejected RAM chunk {acked}")));
                }
                acked += 1;
                deadline = Instant::now() + timeout;
                progress(report(acked));
            } else {
                warn!("Received unexpected acknowledgement {:02X?}", ack.payload);
            }
        }

        if Instant::now() > deadline {
            error!("Downloading to RAM timed out, sent {sent}, acked {acked}");
            return Err(Error::Timeout(format!(
                "RAM download stalled after {acked} of {total} chunks"
            )));
        }
        if !busy {
            thread::sleep(IDLE);
        }
    }

    debug!("Downloaded {total} chunks to RAM");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::mock::{MockDevice, ack_for};
    use crate::protocol::ubx::Message;
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    #[test]
    fn test_chunk_payload_is_zero_padded() {
        let p = chunk_payload(3, &[0xAA; 10]);
        assert_eq!(p.len(), 2 + CHUNK_SIZE);
        assert_eq!(&p[..2], &[3, 0]);
        assert!(p[2..12].iter().all(|&b| b == 0xAA));
        assert!(p[12..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_download_all_chunks_acked() {
        let dev = MockDevice::new(|msg| vec![ack_for(msg, true)]).with_delay(Duration::from_millis(2));
        let mut session = Session::new(dev);
        let image = vec![0x5A; 5 * CHUNK_SIZE + 100];

        let mut last = None;
        download_to_ram(&mut session, &image, RAM_TIMEOUT, &mut |p| last = Some(p)).unwrap();

        let chunks: Vec<&Message> = session
            .port()
            .sent()
            .iter()
            .filter(|m| m.is(class::UPD, id::UPD_IMG))
            .collect();
        assert_eq!(chunks.len(), 6);
        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.u16_at(0), Some(i as u16));
        }
        assert_eq!(last.map(|p| p.packets_written), Some(6));
    }

    #[test]
    fn test_window_never_exceeds_five() {
        let sent = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&sent);
        let dev = MockDevice::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Vec::new()
        });
        let mut session = Session::new(dev);
        let image = vec![0; 20 * CHUNK_SIZE];

        let err = download_to_ram(&mut session, &image, Duration::from_millis(30), &mut |_| {});
        assert!(matches!(err, Err(Error::Timeout(_))));
        assert_eq!(sent.load(Ordering::SeqCst), MAX_PENDING_CHUNKS);
    }

    #[test]
    fn test_nak_aborts() {
        let dev = MockDevice::new(|msg| vec![ack_for(msg, false)]);
        let mut session = Session::new(dev);
        let image = vec![0; 2 * CHUNK_SIZE];

        let err = download_to_ram(&mut session, &image, RAM_TIMEOUT, &mut |_| {});
        assert!(matches!(err, Err(Error::Protocol(_))));
    }
}
