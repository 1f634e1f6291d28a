//! Handshake phase: each side announces its forwarding addresses and SID
//! capability code; the station being logged into may also issue a secure
//! login challenge.

use tracing::debug;

use super::error::SessionError;
use super::reader::StreamReader;
use super::wire::{self, Sid, SID_COMP_V2};
use super::Address;
use crate::transport::ExchangeStream;

/// Everything a peer reports during its handshake block.
#[derive(Debug, Default)]
pub(crate) struct HandshakeData {
    pub sid: Option<Sid>,
    pub fw: Vec<Address>,
    pub secure_challenge: Option<String>,
}

/// Reads the peer's handshake block. The block ends when the next line is a
/// protocol command (next byte is `F`) or when a line ends with the `>`
/// turnover prompt.
pub(crate) async fn read_handshake<S: ExchangeStream>(
    rd: &mut StreamReader<S>,
) -> Result<HandshakeData, SessionError> {
    let mut data = HandshakeData::default();

    loop {
        if rd.peek_byte().await? == b'F' {
            return Ok(data);
        }

        // Remote `***` lines are not errors here; servers send stats
        // banners like '*** MTD Stats Total connects = 2580'.
        let line = rd.next_line(false).await?;

        if line.contains('[') {
            let sid = wire::parse_sid(&line)?;
            // The compressed v2 protocol is the only dialect we speak.
            if !sid.has(SID_COMP_V2) {
                return Err(SessionError::UnsupportedRemote);
            }
            data.sid = Some(sid);
        } else if line.starts_with(";FW") {
            data.fw = wire::parse_forwarding_line(&line)?;
        } else if line.starts_with(";PQ") {
            data.secure_challenge = line.get(5..).map(str::to_string);
            debug!("got secure login challenge");
        }

        if line.ends_with('>') {
            return Ok(data);
        }
    }
}

/// Composes our own handshake block: forwarding addresses, SID, the secure
/// login response when one was computed, and a free-text identification
/// line. The master terminates with `>` to hand the turn over.
pub(crate) struct HandshakeBlock<'a> {
    pub motd: &'a [String],
    pub local_fw: &'a [Address],
    pub app_name: &'a str,
    pub app_version: &'a str,
    pub secure_response: Option<&'a str>,
    pub mycall: &'a str,
    pub targetcall: &'a str,
    pub locator: &'a str,
    pub master: bool,
}

impl HandshakeBlock<'_> {
    pub fn compose(&self) -> String {
        use std::fmt::Write;

        let mut block = String::new();
        if self.master {
            for line in self.motd {
                let _ = write!(block, "{}\r", line);
            }
        }

        let _ = write!(block, "{}\r", wire::forwarding_line(self.local_fw));
        let _ = write!(block, "{}\r", wire::sid_line(self.app_name, self.app_version));
        if let Some(resp) = self.secure_response {
            let _ = write!(block, ";PR: {}\r", resp);
        }

        let _ = write!(
            block,
            "; {} DE {} ({})",
            self.targetcall, self.mycall, self.locator
        );
        if self.master {
            block.push('>');
        }
        block.push('\r');
        block
    }
}
