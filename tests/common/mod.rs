//! Shared helpers for driving a session from the remote end of an
//! in-memory stream pair: scripted peers read and write raw CR-terminated
//! protocol lines.
#![allow(dead_code)]

use hamlink::mailbox::OutboundMessage;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Reads one CR-terminated line from the raw stream, trimming the stray
/// LF/NUL bytes the protocol allows around terminators.
pub async fn read_cr_line<S: AsyncRead + Unpin>(stream: &mut S) -> String {
    let mut raw = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = stream.read(&mut byte).await.expect("peer read failed");
        if n == 0 || byte[0] == b'\r' {
            break;
        }
        raw.push(byte[0]);
    }
    String::from_utf8_lossy(&raw)
        .trim_matches(|c: char| c.is_whitespace() || c == '\0')
        .to_string()
}

/// Asserts that the peer sends exactly the given lines, in order.
pub async fn expect_lines<S: AsyncRead + Unpin>(stream: &mut S, expected: &[&str]) {
    for (i, expected) in expected.iter().enumerate() {
        let line = read_cr_line(stream).await;
        assert_eq!(&line, expected, "unexpected line [{}]", i);
    }
}

pub async fn send<S: AsyncWrite + Unpin>(stream: &mut S, data: &str) {
    stream
        .write_all(data.as_bytes())
        .await
        .expect("peer write failed");
}

/// An outbound candidate with a deterministic compressed payload.
pub fn make_message(mid: &str, title: &str, size: usize, compressed_len: usize) -> OutboundMessage {
    OutboundMessage {
        mid: mid.to_string(),
        title: title.to_string(),
        msg_type: "EM".to_string(),
        size,
        compressed_data: (0..compressed_len).map(|i| (i % 251) as u8).collect(),
    }
}
