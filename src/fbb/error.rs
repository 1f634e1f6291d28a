use std::io;
use thiserror::Error;

use crate::mailbox::MailboxError;

/// Terminal error of a B2F exchange.
///
/// Every variant is fatal to the running session; nothing here is retried
/// internally. Connection-level retry policy belongs to the caller.
#[derive(Debug, Error)]
pub enum SessionError {
    // Malformed input from the peer.
    #[error("malformed proposal line: '{0}'")]
    MalformedProposal(String),
    #[error("invalid character '{0}' in proposal answer line")]
    InvalidAnswerChar(char),
    #[error("offset request without an offset value")]
    MissingOffset,
    #[error("got answers for more proposals than were sent")]
    TooManyAnswers,
    #[error("bad SID line: '{0}'")]
    MalformedSid(String),
    #[error("malformed forwarding line: '{0}'")]
    MalformedForwardingLine(String),
    #[error("transfer header length mismatch: header says {expected}, computed {actual}")]
    HeaderLengthMismatch { expected: usize, actual: usize },
    #[error("transfer offset '{0}' not supported on receive, expected 0")]
    UnsupportedOffset(String),
    #[error("unexpected protocol line: '{0}'")]
    UnexpectedLine(String),
    #[error("unknown protocol command '{0}'")]
    UnknownCommand(char),
    #[error("unexpected byte {0:#04x} at start of compressed transfer")]
    BadTransferStart(u8),
    #[error("unexpected byte {0:#04x} in compressed stream")]
    BadTransferByte(u8),
    #[error("expected proposal answer from remote, got: '{0}'")]
    ExpectedAnswer(String),
    #[error("unexpected response after proposal block: '{0}'")]
    UnexpectedResponse(String),
    #[error("got quit command while inbound proposals were pending")]
    UnexpectedQuitWithPending,

    // Integrity failures, logged with expected/actual for link diagnosis.
    #[error("proposal block checksum mismatch: ours {ours:02X}, theirs {theirs:02X}")]
    ChecksumError { ours: u8, theirs: u8 },
    #[error("payload checksum mismatch")]
    ChecksumMismatch,
    #[error("payload length mismatch: proposal says {expected}, received {actual}")]
    LengthMismatch { expected: usize, actual: usize },
    #[error("resume offset {offset} beyond payload length {len}")]
    BadResumeOffset { offset: usize, len: usize },

    // Incompatible remote, surfaced distinctly from I/O failures.
    #[error("no SID in handshake")]
    NoSidInHandshake,
    #[error("remote does not support the B2 forwarding protocol")]
    UnsupportedRemote,
    #[error("got secure login challenge, but no password resolver is registered")]
    MissingSecureLoginHandler,
    #[error("secure login failed: {0}")]
    SecureLogin(String),

    // Session flow.
    #[error("gave up after {0} outbound proposal rounds without a delivery")]
    TooManyProposalRounds(usize),
    #[error("remote error: {0}")]
    Remote(String),
    #[error("mailbox error: {0}")]
    Mailbox(#[from] MailboxError),
    #[error("exchange aborted")]
    Aborted,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Coarse failure class, used to tell the operator which layer of a bad
/// link failed ("could not reach peer" vs "peer rejected handshake" vs
/// "transfer integrity failure").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Protocol,
    Integrity,
    Capability,
    Io,
    Aborted,
}

impl SessionError {
    pub fn category(&self) -> ErrorCategory {
        use SessionError::*;
        match self {
            ChecksumError { .. } | ChecksumMismatch | LengthMismatch { .. } => {
                ErrorCategory::Integrity
            }
            NoSidInHandshake | UnsupportedRemote | MissingSecureLoginHandler
            | SecureLogin(_) => ErrorCategory::Capability,
            Io(_) => ErrorCategory::Io,
            Aborted => ErrorCategory::Aborted,
            _ => ErrorCategory::Protocol,
        }
    }

    pub(crate) fn is_eof(&self) -> bool {
        matches!(self, SessionError::Io(err) if err.kind() == io::ErrorKind::UnexpectedEof)
    }
}
