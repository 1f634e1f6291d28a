//! Message-store boundary. The engine never touches stored messages
//! directly: a [`MailboxHandler`] supplies outbound candidates and consumes
//! verified inbound payloads. Compression of message bodies lives on the
//! store side of this boundary; candidates arrive pre-compressed and
//! deliveries hand over the compressed bytes together with their proposal
//! code.

pub mod memory;

use std::io;

use thiserror::Error;

use crate::fbb::{Address, PropCode, Proposal, ProposalAnswer};

pub use memory::{MemoryMailbox, SharedMailbox};

#[derive(Debug, Error)]
pub enum MailboxError {
    #[error("mailbox not ready: {0}")]
    NotReady(String),
    #[error("failed to store message {mid}: {reason}")]
    Store { mid: String, reason: String },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// An outbound candidate: one stored message ready for proposal, already
/// compressed by the store's payload codec.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    /// Message identifier, at most 12 characters.
    pub mid: String,
    /// Subject carried in the transfer header, at most 80 bytes.
    pub title: String,
    /// 1-2 character application message-type code.
    pub msg_type: String,
    /// Uncompressed body length.
    pub size: usize,
    pub compressed_data: Vec<u8>,
}

/// A message received from the remote, checksum-verified but still
/// compressed. The store decompresses according to `code`.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub mid: String,
    pub title: String,
    pub code: PropCode,
    /// Uncompressed body length announced in the proposal.
    pub size: usize,
    pub compressed_data: Vec<u8>,
}

/// Handles both directions of message flow for a session.
pub trait MailboxHandler: Send {
    /// Called once before any other operation in a session. An error here
    /// aborts the exchange before the handshake.
    fn prepare(&mut self) -> Result<(), MailboxError> {
        Ok(())
    }

    /// Pending outbound messages addressed to (and only to) one of the
    /// given forwarding addresses. An empty list implies the remote is a
    /// CMS gateway and everything may be delivered through it.
    fn get_outbound(&mut self, fw: &[Address]) -> Vec<OutboundMessage>;

    /// Marks the message as successfully sent. `rejected` means the remote
    /// already had it.
    fn set_sent(&mut self, mid: &str, rejected: bool);

    /// Marks the message as deferred: the remote wants it later. Deferred
    /// messages must not be returned by `get_outbound` again within the
    /// same session.
    fn set_deferred(&mut self, mid: &str);

    /// Accept/reject/defer verdict for a proposal offered by the remote.
    /// An already-received MID should be rejected.
    fn get_inbound_answer(&mut self, proposal: &Proposal) -> ProposalAnswer;

    /// Persists one received message. The error is echoed to the remote
    /// when possible.
    fn process_inbound(&mut self, message: ReceivedMessage) -> Result<(), MailboxError>;
}
