//! Binary compressed-payload transfer: `SOH` header, `STX` data chunks,
//! `EOT` trailer with a running sum-mod-256 checksum. Follows the proposal
//! text on the same stream with no other framing.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::error::SessionError;
use super::proposal::{PropCode, Proposal};
use super::reader::StreamReader;
use super::status::{StatusObserver, TransferDirection, TransferStatus};
use super::wire::{CHR_EOT, CHR_NUL, CHR_SOH, CHR_STX, MAX_CHUNK_LEN};
use crate::transport::ExchangeStream;

const STATUS_INTERVAL: Duration = Duration::from_millis(250);

/// Transmits an accepted proposal's payload, starting at its negotiated
/// resume offset. Emits progress every 250 ms and once on completion, then
/// blocks until the transport reports the data on the air.
pub(crate) async fn write_compressed<S: ExchangeStream>(
    rd: &mut StreamReader<S>,
    prop: &Proposal,
    observer: Option<Arc<dyn StatusObserver>>,
) -> Result<(), SessionError> {
    let offset_str = prop.offset().to_string();
    info!(title = prop.title(), offset = prop.offset(), "transmitting");
    if prop.code() == PropCode::Gzip {
        debug!("transmitting gzip compressed message");
    }

    let data = prop
        .compressed_data()
        .get(prop.offset()..)
        .ok_or(SessionError::BadResumeOffset {
            offset: prop.offset(),
            len: prop.compressed_data().len(),
        })?;

    let header_len = prop.title().len() + offset_str.len() + 2;
    let mut header = Vec::with_capacity(2 + header_len);
    header.push(CHR_SOH);
    header.push(header_len as u8);
    header.extend_from_slice(prop.title().as_bytes());
    header.push(CHR_NUL);
    header.extend_from_slice(offset_str.as_bytes());
    header.push(CHR_NUL);
    rd.write_all(&header).await?;

    // Progress is sampled by a ticker task so the transfer loop never waits
    // on the observer. Bytes still queued in the modem's tx buffer are
    // subtracted so progress reflects bytes actually on the air.
    let transferred = Arc::new(AtomicUsize::new(prop.offset()));
    let tx_queued = Arc::new(AtomicUsize::new(0));
    let (done_tx, done_rx) = watch::channel(false);
    let ticker = observer.map(|obs| {
        spawn_progress_ticker(
            obs,
            TransferDirection::Sending,
            prop,
            Arc::clone(&transferred),
            Arc::clone(&tx_queued),
            done_rx,
        )
    });

    let result = async {
        let mut sum: u32 = 0;
        for chunk in data.chunks(MAX_CHUNK_LEN) {
            let mut frame = Vec::with_capacity(2 + chunk.len());
            frame.push(CHR_STX);
            frame.push(chunk.len() as u8);
            frame.extend_from_slice(chunk);
            rd.write_all(&frame).await?;

            for &b in chunk {
                sum = sum.wrapping_add(u32::from(b));
            }
            transferred.fetch_add(chunk.len(), Ordering::Relaxed);
            tx_queued.store(rd.tx_buffer_len().unwrap_or(0), Ordering::Relaxed);
        }

        let checksum = (sum.wrapping_neg() & 0xff) as u8;
        rd.write_all(&[CHR_EOT, checksum]).await?;

        // Block until the whole message has left the transmitter.
        rd.flush_medium().await?;
        Ok(())
    }
    .await;

    // Tear the ticker down explicitly: signal, then join.
    let _ = done_tx.send(true);
    if let Some(handle) = ticker {
        let _ = handle.await;
    }
    result
}

/// Receives the payload of a proposal we accepted, verifying the header
/// length, the running checksum and the total length against the proposal.
pub(crate) async fn read_compressed<S: ExchangeStream>(
    rd: &mut StreamReader<S>,
    prop: &mut Proposal,
    observer: Option<&Arc<dyn StatusObserver>>,
) -> Result<(), SessionError> {
    match rd.read_byte().await? {
        CHR_SOH => {}
        b'*' => {
            let line = rd.next_line(false).await?;
            return Err(SessionError::Remote(line));
        }
        other => return Err(SessionError::BadTransferStart(other)),
    }

    let header_len = rd.read_byte().await? as usize;
    let title_bytes = rd.read_until(CHR_NUL).await?;
    let offset_bytes = rd.read_until(CHR_NUL).await?;

    let actual = title_bytes.len() + offset_bytes.len() + 2;
    if header_len != actual {
        return Err(SessionError::HeaderLengthMismatch {
            expected: header_len,
            actual,
        });
    }

    let offset = String::from_utf8_lossy(&offset_bytes).to_string();
    // Only zero-offset transfers are accepted on receive; requesting
    // resumption of partial messages was never deployed on the network.
    if offset != "0" {
        return Err(SessionError::UnsupportedOffset(offset));
    }

    prop.title = String::from_utf8_lossy(&title_bytes).to_string();
    info!(title = %prop.title, "receiving");
    if prop.code() == PropCode::Gzip {
        debug!("receiving gzip compressed message");
    }

    let mut buf: Vec<u8> = Vec::with_capacity(prop.compressed_size);
    let mut sum: u32 = 0;
    let mut last_update = Instant::now();
    loop {
        match rd.read_byte().await? {
            CHR_STX => {
                let len = match rd.read_byte().await? {
                    0 => 256,
                    n => usize::from(n),
                };
                for _ in 0..len {
                    let b = rd.read_byte().await?;
                    buf.push(b);
                    sum = (sum + u32::from(b)) % 256;
                }

                if let Some(obs) = observer {
                    if last_update.elapsed() >= STATUS_INTERVAL {
                        last_update = Instant::now();
                        obs.update_status(status(prop, TransferDirection::Receiving, buf.len(), false));
                    }
                }
            }
            CHR_EOT => {
                let trailer = rd.read_byte().await?;
                if (sum + u32::from(trailer)) % 256 != 0 {
                    return Err(SessionError::ChecksumMismatch);
                }
                if buf.len() != prop.compressed_size {
                    return Err(SessionError::LengthMismatch {
                        expected: prop.compressed_size,
                        actual: buf.len(),
                    });
                }
                if let Some(obs) = observer {
                    obs.update_status(status(prop, TransferDirection::Receiving, buf.len(), true));
                }
                prop.compressed_data = buf;
                return Ok(());
            }
            other => return Err(SessionError::BadTransferByte(other)),
        }
    }
}

fn status(
    prop: &Proposal,
    direction: TransferDirection,
    transferred: usize,
    done: bool,
) -> TransferStatus {
    TransferStatus {
        direction,
        mid: prop.mid().to_string(),
        title: prop.title().to_string(),
        bytes_transferred: transferred,
        bytes_total: prop.compressed_size(),
        done,
    }
}

fn spawn_progress_ticker(
    obs: Arc<dyn StatusObserver>,
    direction: TransferDirection,
    prop: &Proposal,
    transferred: Arc<AtomicUsize>,
    tx_queued: Arc<AtomicUsize>,
    mut done: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let mid = prop.mid().to_string();
    let title = prop.title().to_string();
    let total = prop.compressed_size();

    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + STATUS_INTERVAL;
        let mut interval = tokio::time::interval_at(start, STATUS_INTERVAL);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let on_air = transferred
                        .load(Ordering::Relaxed)
                        .saturating_sub(tx_queued.load(Ordering::Relaxed));
                    obs.update_status(TransferStatus {
                        direction,
                        mid: mid.clone(),
                        title: title.clone(),
                        bytes_transferred: on_air,
                        bytes_total: total,
                        done: false,
                    });
                }
                changed = done.changed() => {
                    if changed.is_ok() && *done.borrow() {
                        obs.update_status(TransferStatus {
                            direction,
                            mid: mid.clone(),
                            title: title.clone(),
                            bytes_transferred: transferred.load(Ordering::Relaxed),
                            bytes_total: total,
                            done: true,
                        });
                    }
                    break;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outbound_prop(payload: Vec<u8>) -> Proposal {
        Proposal {
            code: PropCode::ExtendedB2,
            msg_type: "EM".into(),
            mid: "TESTMID01".into(),
            title: "Test message".into(),
            size: payload.len() * 2,
            compressed_size: payload.len(),
            compressed_data: payload,
            ..Default::default()
        }
    }

    async fn round_trip(payload: Vec<u8>) -> Proposal {
        let (a, b) = tokio::io::duplex(4096);
        let mut wr = StreamReader::new(a);
        let mut rd = StreamReader::new(b);

        let sent = outbound_prop(payload);
        let mut received = Proposal {
            compressed_size: sent.compressed_size,
            ..sent.clone()
        };
        received.compressed_data = Vec::new();

        let (w, r) = tokio::join!(
            write_compressed(&mut wr, &sent, None),
            read_compressed(&mut rd, &mut received, None),
        );
        w.unwrap();
        r.unwrap();
        assert_eq!(received.compressed_data, sent.compressed_data);
        assert_eq!(received.title, sent.title);
        received
    }

    #[tokio::test]
    async fn payload_round_trips_at_chunk_boundaries() {
        for len in [0usize, 1, 125, 126, 10_000] {
            let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            round_trip(payload).await;
        }
    }

    #[tokio::test]
    async fn corrupted_payload_byte_fails_checksum() {
        let payload: Vec<u8> = (0..125u8).collect();
        let prop = outbound_prop(payload);

        // Capture the encoded frames, then flip one payload byte.
        let (a, b) = tokio::io::duplex(4096);
        let mut wr = StreamReader::new(a);
        write_compressed(&mut wr, &prop, None).await.unwrap();
        drop(wr);

        let mut encoded = Vec::new();
        {
            use tokio::io::AsyncReadExt;
            let mut b = b;
            b.read_to_end(&mut encoded).await.unwrap();
        }
        // Header is SOH, len, title, NUL, "0", NUL; then STX, chunk len.
        let stx = 2 + prop.title().len() + 1 + 1 + 1;
        assert_eq!(encoded[stx], CHR_STX);
        encoded[stx + 2] ^= 0xff;

        let (a2, mut feeder) = tokio::io::duplex(16 * 1024);
        {
            use tokio::io::AsyncWriteExt;
            feeder.write_all(&encoded).await.unwrap();
        }
        let mut rd = StreamReader::new(a2);
        let mut received = Proposal {
            compressed_size: prop.compressed_size,
            ..Proposal::default()
        };
        let err = read_compressed(&mut rd, &mut received, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::ChecksumMismatch));
    }

    #[tokio::test]
    async fn length_mismatch_detected() {
        let payload: Vec<u8> = vec![7; 10];
        let sent = outbound_prop(payload);

        let (a, b) = tokio::io::duplex(4096);
        let mut wr = StreamReader::new(a);
        let mut rd = StreamReader::new(b);
        let mut received = Proposal {
            compressed_size: sent.compressed_size + 1,
            ..Proposal::default()
        };

        let (w, r) = tokio::join!(
            write_compressed(&mut wr, &sent, None),
            read_compressed(&mut rd, &mut received, None),
        );
        w.unwrap();
        assert!(matches!(
            r.unwrap_err(),
            SessionError::LengthMismatch { expected: 11, actual: 10 }
        ));
    }

    #[tokio::test]
    async fn nonzero_offset_rejected_on_receive() {
        let mut sent = outbound_prop(vec![1, 2, 3, 4, 5, 6]);
        sent.offset = 2;

        let (a, b) = tokio::io::duplex(4096);
        let mut wr = StreamReader::new(a);
        let mut rd = StreamReader::new(b);
        let mut received = Proposal::default();

        let (w, r) = tokio::join!(
            write_compressed(&mut wr, &sent, None),
            read_compressed(&mut rd, &mut received, None),
        );
        w.unwrap();
        assert!(matches!(
            r.unwrap_err(),
            SessionError::UnsupportedOffset(ref o) if o == "2"
        ));
    }

    #[tokio::test]
    async fn remote_error_instead_of_header() {
        let (a, mut feeder) = tokio::io::duplex(4096);
        {
            use tokio::io::AsyncWriteExt;
            feeder.write_all(b"*** No such message\r").await.unwrap();
        }
        let mut rd = StreamReader::new(a);
        let mut received = Proposal::default();
        let err = read_compressed(&mut rd, &mut received, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Remote(_)));
    }
}
