//! Stateless codec for the line-oriented half of the protocol: proposal
//! block checksums, SID capability lines and `;FW:` forwarding lines.
//!
//! Commands and answers travel as CR-terminated ASCII lines; the codec works
//! on cleaned lines (no terminator) and leaves framing to the caller.

use std::sync::OnceLock;

use regex::Regex;

use super::error::SessionError;
use super::Address;

// Control bytes of the binary compressed-transfer framing.
pub(crate) const CHR_NUL: u8 = 0;
pub(crate) const CHR_SOH: u8 = 1;
pub(crate) const CHR_STX: u8 = 2;
pub(crate) const CHR_EOT: u8 = 4;

/// Offsets above six decimal digits cannot be expressed on the wire.
pub const PROTOCOL_OFFSET_LIMIT: usize = 999_999;

/// Maximum proposals per block.
pub const MAX_BLOCK_SIZE: usize = 5;

/// Maximum payload bytes per STX frame. The protocol allows 255, but 125
/// keeps a full frame under the worst-case AX.25 paclen of 128.
pub const MAX_CHUNK_LEN: usize = 125;

// SID capability codes.
pub const SID_ACK_PM: &str = "A"; // acknowledge for person messages
pub const SID_BASIC: &str = "F"; // FBB basic ascii protocol
pub const SID_COMP_V0: &str = "B"; // FBB compressed protocol v0
pub const SID_COMP_V1: &str = "B1"; // FBB compressed protocol v1
pub const SID_COMP_V2: &str = "B2"; // FBB compressed protocol v2 (B2F)
pub const SID_HL: &str = "H"; // hierarchical location designators
pub const SID_MID: &str = "M"; // message identifiers
pub const SID_GZIP: &str = "G"; // gzip compressed transfers (experimental)
pub const SID_BID: &str = "$"; // BID supported, must be last

/// The capability code we advertise.
pub const LOCAL_SID: &str = "B2FHM$";

/// Capability code string announced by a station during handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sid(String);

impl Sid {
    pub fn has(&self, code: &str) -> bool {
        self.0.contains(&code.to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Checksum over the lines of a proposal block: the sum of every byte of
/// every line plus one CR per line, negated, truncated to one byte.
pub fn block_checksum<'a, I>(lines: I) -> u8
where
    I: IntoIterator<Item = &'a str>,
{
    let mut sum: u32 = 0;
    for line in lines {
        for &b in line.as_bytes() {
            sum = sum.wrapping_add(u32::from(b));
        }
        sum = sum.wrapping_add(u32::from(b'\r'));
    }
    (sum.wrapping_neg() & 0xff) as u8
}

/// The `F> XX` line terminating a proposal block.
pub fn checksum_line(sum: u8) -> String {
    format!("F> {:02X}", sum)
}

/// Extracts the checksum from a received `F> XX` line. Peers disagree on
/// hex case, so parsing is case-insensitive; garbage decodes to a value
/// that fails verification rather than aborting the parse.
pub fn parse_checksum_line(line: &str) -> u8 {
    line.get(3..)
        .map(str::trim)
        .and_then(|hex| u8::from_str_radix(hex, 16).ok())
        .unwrap_or(0)
}

/// Extracts the capability code from an SID line like
/// `[WL2K-2.8.4.8-B2FWIHJM$]`: the text between the last `-` and the `]`.
pub fn parse_sid(line: &str) -> Result<Sid, SessionError> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"\[.*-(.*)\]").unwrap());

    let caps = re
        .captures(line)
        .ok_or_else(|| SessionError::MalformedSid(line.to_string()))?;
    Ok(Sid(caps[1].to_uppercase()))
}

/// Composes our own SID line. Neither field may contain a dash.
pub fn sid_line(app_name: &str, app_version: &str) -> String {
    format!("[{}-{}-{}]", app_name, app_version, LOCAL_SID)
}

/// Parses a `;FW: addr addr ...` line listing the addresses the peer
/// requests messages on behalf of.
pub fn parse_forwarding_line(line: &str) -> Result<Vec<Address>, SessionError> {
    let rest = line
        .strip_prefix(";FW: ")
        .ok_or_else(|| SessionError::MalformedForwardingLine(line.to_string()))?;

    Ok(rest
        .split(' ')
        .filter(|s| !s.is_empty())
        .map(Address::new)
        .collect())
}

/// Composes the `;FW:` line for our own auxiliary addresses.
pub fn forwarding_line(addrs: &[Address]) -> String {
    let mut line = String::from(";FW:");
    for addr in addrs {
        line.push(' ');
        line.push_str(addr.as_str());
    }
    line
}

/// Error reporting from the remote is not defined by the protocol, but is
/// conventionally a line prefixed with `***`. Returns the message after the
/// last `*`, if the line looks like one.
pub fn remote_error(line: &str) -> Option<String> {
    if !line.starts_with('*') {
        return None;
    }
    let idx = line.rfind('*')?;
    let msg = line[idx + 1..].trim();
    if msg.is_empty() {
        return None;
    }
    Some(msg.to_string())
}
