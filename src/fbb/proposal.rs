//! Proposals: the negotiation unit of a B2F exchange. One proposal offers
//! one message; the peer answers accept, reject or defer before any payload
//! byte is sent.

use tracing::{debug, warn};

use super::error::SessionError;
use super::wire::PROTOCOL_OFFSET_LIMIT;
use crate::mailbox::OutboundMessage;

/// Wire code of a proposal, selecting line format and payload compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PropCode {
    /// Old FBB compressed ASCII proposal (`A`).
    Ascii,
    /// Old FBB basic proposal (`B`).
    Basic,
    /// Winlink extended B2 message, LZH-compressed payload (`C`).
    #[default]
    ExtendedB2,
    /// Gzip-compressed B2 message (`D`), experimental.
    Gzip,
}

impl PropCode {
    pub fn as_char(self) -> char {
        match self {
            PropCode::Ascii => 'A',
            PropCode::Basic => 'B',
            PropCode::ExtendedB2 => 'C',
            PropCode::Gzip => 'D',
        }
    }

    pub fn from_char(c: char) -> Option<Self> {
        match c {
            'A' => Some(PropCode::Ascii),
            'B' => Some(PropCode::Basic),
            'C' => Some(PropCode::ExtendedB2),
            'D' => Some(PropCode::Gzip),
            _ => None,
        }
    }

    /// Whether this side can transfer payloads for the code. Legacy codes
    /// are proposed by old FBB stations; we defer them instead of failing
    /// the session.
    pub fn is_supported(self) -> bool {
        matches!(self, PropCode::ExtendedB2 | PropCode::Gzip)
    }
}

/// Disposition of a proposal. `Pending` until the negotiating round
/// completes; terminal afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProposalAnswer {
    #[default]
    Pending,
    Accept,
    Reject,
    Defer,
}

impl ProposalAnswer {
    fn wire_char(self) -> char {
        match self {
            ProposalAnswer::Accept => '+',
            ProposalAnswer::Reject => '-',
            // A pending answer never belongs on the wire; defer is the only
            // safe fallback if one slips through.
            ProposalAnswer::Defer | ProposalAnswer::Pending => '=',
        }
    }
}

/// One candidate message transfer and its negotiated outcome.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Proposal {
    pub(crate) code: PropCode,
    pub(crate) msg_type: String,
    pub(crate) mid: String,
    pub(crate) title: String,
    pub(crate) answer: ProposalAnswer,
    pub(crate) offset: usize,
    pub(crate) size: usize,
    pub(crate) compressed_size: usize,
    pub(crate) compressed_data: Vec<u8>,
}

impl Proposal {
    /// Builds an outbound proposal from a pre-compressed mailbox candidate.
    pub fn from_outbound(msg: OutboundMessage, code: PropCode) -> Self {
        let mut title = msg.title;
        if title.is_empty() {
            title = String::from("No title");
        }
        // The transfer header carries at most 80 title bytes.
        if title.len() > 80 {
            let mut cut = 80;
            while !title.is_char_boundary(cut) {
                cut -= 1;
            }
            title.truncate(cut);
        }

        Self {
            code,
            msg_type: msg.msg_type,
            mid: msg.mid,
            title,
            size: msg.size,
            compressed_size: msg.compressed_data.len(),
            compressed_data: msg.compressed_data,
            ..Default::default()
        }
    }

    pub fn mid(&self) -> &str {
        &self.mid
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn code(&self) -> PropCode {
        self.code
    }

    pub fn msg_type(&self) -> &str {
        &self.msg_type
    }

    pub fn answer(&self) -> ProposalAnswer {
        self.answer
    }

    /// Resume offset into the compressed payload. Only meaningful when the
    /// answer is `Accept`.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn compressed_size(&self) -> usize {
        self.compressed_size
    }

    pub fn compressed_data(&self) -> &[u8] {
        &self.compressed_data
    }

    /// Encodes the proposal line, without the CR terminator. The trailing
    /// field is a constant zero on the wire.
    pub fn encode_line(&self) -> String {
        format!(
            "F{} {} {} {} {} 0",
            self.code.as_char(),
            self.msg_type,
            self.mid,
            self.size,
            self.compressed_size
        )
    }

    /// Decodes a proposal line like `FC EM TJKYEIMMHSRB 527 123 0`.
    ///
    /// All four codes share the six-field format; the message type is
    /// opaque to the engine beyond its 1-2 character length.
    pub fn decode_line(line: &str) -> Result<Self, SessionError> {
        let malformed = || SessionError::MalformedProposal(line.to_string());

        let fields: Vec<&str> = line.split(' ').collect();
        if fields.len() != 6 {
            return Err(malformed());
        }

        let mut head = fields[0].chars();
        let (Some('F'), Some(code_char), None) = (head.next(), head.next(), head.next()) else {
            return Err(malformed());
        };
        let code = PropCode::from_char(code_char).ok_or_else(malformed)?;

        let msg_type = fields[1];
        if msg_type.is_empty() || msg_type.len() > 2 {
            return Err(malformed());
        }

        let size: usize = fields[3].parse().map_err(|_| malformed())?;
        let compressed_size: usize = fields[4].parse().map_err(|_| malformed())?;

        Ok(Self {
            code,
            msg_type: msg_type.to_string(),
            mid: fields[2].to_string(),
            size,
            compressed_size,
            ..Default::default()
        })
    }
}

/// Composes the `FS ...` answer line for a received proposal block: one
/// character per proposal, in block order.
pub fn encode_answer_line(proposals: &[Proposal]) -> String {
    let mut line = String::from("FS ");
    for prop in proposals {
        line.push(prop.answer.wire_char());
    }
    line
}

/// Parses the peer's `FS ...` answer line, updating the given proposals in
/// block order.
///
/// Accept markers are `Y`/`y`/`H`/`h`/`+`, reject `N`/`n`/`R`/`r`/`-`,
/// defer `L`/`l`/`=`. `A`/`a`/`!` accept at the decimal offset that follows
/// the marker; some peers terminate the digit run with a `!`, which is
/// consumed. Offsets beyond six digits cannot be honored and are clamped to
/// zero rather than failing the session.
pub fn parse_answer_line(line: &str, proposals: &mut [Proposal]) -> Result<(), SessionError> {
    let mut rest = line.strip_prefix("FS ").unwrap_or(line);

    let mut i = 0;
    while !rest.is_empty() {
        if i >= proposals.len() {
            return Err(SessionError::TooManyAnswers);
        }
        let prop = &mut proposals[i];

        let c = rest.chars().next().unwrap_or_default();
        rest = &rest[c.len_utf8()..];

        match c {
            'Y' | 'y' | 'H' | 'h' | '+' => {
                debug!(mid = %prop.mid, "remote accepted");
                prop.answer = ProposalAnswer::Accept;
            }
            'N' | 'n' | 'R' | 'r' | '-' => {
                debug!(mid = %prop.mid, "remote already received");
                prop.answer = ProposalAnswer::Reject;
            }
            'L' | 'l' | '=' => {
                debug!(mid = %prop.mid, "remote deferred");
                prop.answer = ProposalAnswer::Defer;
            }
            'A' | 'a' | '!' => {
                let digits = rest
                    .find(|c: char| !c.is_ascii_digit())
                    .unwrap_or(rest.len());
                if digits == 0 {
                    return Err(SessionError::MissingOffset);
                }
                let offset: usize = rest[..digits].parse().unwrap_or(usize::MAX);
                rest = &rest[digits..];
                rest = rest.strip_prefix('!').unwrap_or(rest);

                // Offset is not a distinct answer on the wire, just a
                // qualified accept.
                prop.answer = ProposalAnswer::Accept;
                if offset > PROTOCOL_OFFSET_LIMIT {
                    warn!(
                        mid = %prop.mid,
                        offset, "requested offset exceeds the protocol limit, ignoring"
                    );
                    prop.offset = 0;
                } else {
                    debug!(mid = %prop.mid, offset, "remote accepted at offset");
                    prop.offset = offset;
                }
            }
            other => return Err(SessionError::InvalidAnswerChar(other)),
        }
        i += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ProposalAnswer::*;

    fn blank(n: usize) -> Vec<Proposal> {
        vec![Proposal::default(); n]
    }

    #[test]
    fn encode_line_format() {
        let prop = Proposal {
            code: PropCode::ExtendedB2,
            msg_type: "EM".into(),
            mid: "TJKYEIMMHSRB".into(),
            size: 527,
            compressed_size: 123,
            ..Default::default()
        };
        assert_eq!(prop.encode_line(), "FC EM TJKYEIMMHSRB 527 123 0");
    }

    #[test]
    fn decode_line_round_trip() {
        for code in [
            PropCode::Ascii,
            PropCode::Basic,
            PropCode::ExtendedB2,
            PropCode::Gzip,
        ] {
            let prop = Proposal {
                code,
                msg_type: "EM".into(),
                mid: "ABC123".into(),
                size: 500,
                compressed_size: 120,
                ..Default::default()
            };
            assert_eq!(Proposal::decode_line(&prop.encode_line()).unwrap(), prop);
        }
    }

    #[test]
    fn decode_line_rejects_short_and_non_numeric() {
        assert!(Proposal::decode_line("FC EM ABC123 500 120").is_err());
        assert!(Proposal::decode_line("FC EM ABC123 x 120 0").is_err());
        assert!(Proposal::decode_line("FC EM ABC123 500 y 0").is_err());
        assert!(Proposal::decode_line("FZ EM ABC123 500 120 0").is_err());
        assert!(Proposal::decode_line("FC LONGTYPE ABC123 500 120 0").is_err());
    }

    #[test]
    fn parse_answers_basic() {
        let mut props = blank(3);
        parse_answer_line("FS YNL", &mut props).unwrap();
        let answers: Vec<_> = props.iter().map(|p| p.answer).collect();
        assert_eq!(answers, vec![Accept, Reject, Defer]);
    }

    #[test]
    fn parse_answers_all_marker_variants() {
        let mut props = blank(5);
        parse_answer_line("FS YLA3350RH", &mut props).unwrap();
        assert_eq!(props[0].answer, Accept);
        assert_eq!(props[1].answer, Defer);
        assert_eq!(props[2].answer, Accept);
        assert_eq!(props[2].offset, 3350);
        assert_eq!(props[3].answer, Reject);
        assert_eq!(props[4].answer, Accept);

        let mut props = blank(5);
        parse_answer_line("FS +=!3350-+", &mut props).unwrap();
        assert_eq!(props[0].answer, Accept);
        assert_eq!(props[1].answer, Defer);
        assert_eq!(props[2].answer, Accept);
        assert_eq!(props[2].offset, 3350);
        assert_eq!(props[3].answer, Reject);
        assert_eq!(props[4].answer, Accept);
    }

    #[test]
    fn parse_answer_offset_with_terminator() {
        let mut props = blank(1);
        parse_answer_line("FS A123!", &mut props).unwrap();
        assert_eq!(props[0].answer, Accept);
        assert_eq!(props[0].offset, 123);
    }

    #[test]
    fn parse_answer_clamps_oversized_offset() {
        let mut props = blank(1);
        parse_answer_line("FS A1000001", &mut props).unwrap();
        assert_eq!(props[0].answer, Accept);
        assert_eq!(props[0].offset, 0);
    }

    #[test]
    fn parse_answer_errors() {
        assert!(matches!(
            parse_answer_line("FS ?", &mut blank(1)),
            Err(SessionError::InvalidAnswerChar('?'))
        ));
        assert!(matches!(
            parse_answer_line("FS A", &mut blank(1)),
            Err(SessionError::MissingOffset)
        ));
        assert!(matches!(
            parse_answer_line("FS YY", &mut blank(1)),
            Err(SessionError::TooManyAnswers)
        ));
    }

    #[test]
    fn answer_line_encoding() {
        let mut props = blank(3);
        props[0].answer = Accept;
        props[1].answer = Reject;
        props[2].answer = Defer;
        assert_eq!(encode_answer_line(&props), "FS +-=");
    }

    #[test]
    fn outbound_title_defaults_and_truncates() {
        let msg = OutboundMessage {
            mid: "X".into(),
            title: String::new(),
            msg_type: "EM".into(),
            size: 0,
            compressed_data: Vec::new(),
        };
        let prop = Proposal::from_outbound(msg, PropCode::ExtendedB2);
        assert_eq!(prop.title(), "No title");

        let msg = OutboundMessage {
            mid: "Y".into(),
            title: "t".repeat(100),
            msg_type: "EM".into(),
            size: 0,
            compressed_data: Vec::new(),
        };
        let prop = Proposal::from_outbound(msg, PropCode::ExtendedB2);
        assert_eq!(prop.title().len(), 80);
    }
}
