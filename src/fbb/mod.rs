//! Client-side implementation of the B2 Forwarding Protocol (B2F) used by
//! the Winlink 2000 network.
//!
//! A [`Session`] drives one complete exchange with a remote station over any
//! bidirectional byte stream: capability handshake, alternating rounds of
//! outbound and inbound message proposals, compressed payload transfer with
//! running checksums, and session turnover until either side quits.

pub mod error;
pub mod proposal;
pub mod secure;
pub mod status;
pub mod wire;

mod handshake;
mod reader;
mod session;
mod transfer;

pub use error::{ErrorCategory, SessionError};
pub use proposal::{PropCode, Proposal, ProposalAnswer};
pub use secure::secure_login_response;
pub use session::{SecureLoginFn, Session, UserAgent};
pub use status::{StatusObserver, TrafficStats, TransferDirection, TransferStatus};
pub use wire::Sid;

use std::fmt;

/// A Winlink address: a bare callsign (`LA5NTA`) or a full `user@domain`
/// recipient. The engine treats it as an opaque token; routing semantics
/// belong to the message store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address(String);

impl Address {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The callsign part, without any `@domain` suffix.
    pub fn callsign(&self) -> &str {
        self.0.split('@').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Address {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_callsign_strips_domain() {
        assert_eq!(Address::new("LA5NTA@winlink.org").callsign(), "LA5NTA");
        assert_eq!(Address::new("LA5NTA").callsign(), "LA5NTA");
    }

    #[test]
    fn address_trims_whitespace() {
        assert_eq!(Address::new(" N0CALL ").as_str(), "N0CALL");
    }
}
