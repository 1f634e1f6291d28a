//! A peekable, byte-at-a-time buffered reader owning the session's stream.
//!
//! The binary compressed-transfer data follows the handshake and proposal
//! text on the same stream with no framing boundary, so both the
//! line-oriented and the binary decode paths must share this one buffer;
//! a second buffering layer would lose or misalign bytes at the phase
//! boundary.

use std::io;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use super::error::SessionError;
use super::wire;
use crate::transport::ExchangeStream;

const BUF_SIZE: usize = 1024;

pub(crate) struct StreamReader<S> {
    stream: S,
    buf: [u8; BUF_SIZE],
    start: usize,
    end: usize,
}

impl<S: ExchangeStream> StreamReader<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            buf: [0; BUF_SIZE],
            start: 0,
            end: 0,
        }
    }

    async fn fill_buf(&mut self) -> io::Result<()> {
        if self.start < self.end {
            return Ok(());
        }
        self.start = 0;
        self.end = self.stream.read(&mut self.buf).await?;
        if self.end == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        Ok(())
    }

    /// Returns the next byte without consuming it.
    pub async fn peek_byte(&mut self) -> io::Result<u8> {
        self.fill_buf().await?;
        Ok(self.buf[self.start])
    }

    pub async fn read_byte(&mut self) -> io::Result<u8> {
        self.fill_buf().await?;
        let b = self.buf[self.start];
        self.start += 1;
        Ok(b)
    }

    /// Reads bytes up to (and consuming) the given delimiter, returning the
    /// bytes before it.
    pub async fn read_until(&mut self, delim: u8) -> io::Result<Vec<u8>> {
        let mut out = Vec::new();
        loop {
            let b = self.read_byte().await?;
            if b == delim {
                return Ok(out);
            }
            out.push(b);
        }
    }

    /// Reads one CR-terminated line, trimming whitespace and stray NULs.
    pub async fn read_line(&mut self) -> io::Result<String> {
        let raw = self.read_until(b'\r').await?;
        let line = String::from_utf8_lossy(&raw);
        Ok(line
            .trim_matches(|c: char| c.is_whitespace() || c == '\0')
            .to_string())
    }

    /// Reads the next protocol line, logging it. With `fail_on_remote_err`,
    /// a `***`-prefixed error report from the peer becomes a session error;
    /// handshake reading disables this because servers send harmless
    /// `*** ...` stats banners.
    pub async fn next_line(&mut self, fail_on_remote_err: bool) -> Result<String, SessionError> {
        let line = self.read_line().await?;
        debug!(target: "hamlink::proto", "<{}", line);

        if fail_on_remote_err {
            if let Some(msg) = wire::remote_error(&line) {
                return Err(SessionError::Remote(msg));
            }
        }
        Ok(line)
    }

    /// Writes directly to the underlying stream. Writes never pass through
    /// the read buffer.
    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        self.stream.write_all(data).await?;
        self.stream.flush().await
    }

    pub async fn write_line(&mut self, line: &str) -> io::Result<()> {
        debug!(target: "hamlink::proto", ">{}", line);
        self.write_all(format!("{}\r", line).as_bytes()).await
    }

    pub fn tx_buffer_len(&self) -> Option<usize> {
        self.stream.tx_buffer_len()
    }

    pub async fn flush_medium(&mut self) -> io::Result<()> {
        self.stream.flush_medium().await
    }

    pub fn set_robust(&mut self, robust: bool) -> bool {
        self.stream.set_robust(robust)
    }

    pub async fn shutdown(&mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lines_and_bytes_share_one_buffer() {
        let (client, mut server) = tokio::io::duplex(256);
        server.write_all(b"FF\r\x01\x06hello").await.unwrap();

        let mut rd = StreamReader::new(client);
        assert_eq!(rd.read_line().await.unwrap(), "FF");
        // Binary phase continues where the text phase stopped.
        assert_eq!(rd.read_byte().await.unwrap(), 0x01);
        assert_eq!(rd.read_byte().await.unwrap(), 0x06);
        assert_eq!(rd.peek_byte().await.unwrap(), b'h');
        assert_eq!(rd.read_byte().await.unwrap(), b'h');
    }

    #[tokio::test]
    async fn read_line_cleans_crlf_and_nul() {
        let (client, mut server) = tokio::io::duplex(256);
        server.write_all(b"\0FQ \r\nnext\r").await.unwrap();

        let mut rd = StreamReader::new(client);
        assert_eq!(rd.read_line().await.unwrap(), "FQ");
        // The stray LF belongs to the previous terminator and is trimmed.
        assert_eq!(rd.read_line().await.unwrap(), "next");
    }

    #[tokio::test]
    async fn eof_is_unexpected_eof() {
        let (client, server) = tokio::io::duplex(256);
        drop(server);

        let mut rd = StreamReader::new(client);
        let err = rd.read_line().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
