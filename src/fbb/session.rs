//! The B2F session state machine: one handshake, then alternating rounds of
//! outbound and inbound proposal exchange until either side quits.

use std::mem;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use super::error::SessionError;
use super::handshake::{read_handshake, HandshakeBlock};
use super::proposal::{encode_answer_line, parse_answer_line, PropCode, Proposal, ProposalAnswer};
use super::reader::StreamReader;
use super::status::{StatusObserver, TrafficStats};
use super::transfer::{read_compressed, write_compressed};
use super::wire::{self, Sid, MAX_BLOCK_SIZE, SID_GZIP};
use super::Address;
use crate::mailbox::{MailboxHandler, ReceivedMessage};
use crate::transport::ExchangeStream;

/// Upper bound on consecutive outbound proposal rounds within one turn.
///
/// When every proposal of a block is deferred or rejected the protocol lets
/// us offer the next block immediately, but nothing stops a hostile or
/// buggy peer from deferring forever; past this bound the session fails
/// instead of spinning.
const MAX_PROPOSAL_ROUNDS: usize = 8;

/// Identification reported in our SID line. Fields must not contain `-`.
#[derive(Debug, Clone)]
pub struct UserAgent {
    pub name: String,
    pub version: String,
}

impl Default for UserAgent {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// Resolves the secure-login password for a target identity. May prompt.
pub type SecureLoginFn = Box<dyn Fn(&str) -> anyhow::Result<String> + Send + Sync>;

/// One B2F exchange with a remote station.
///
/// A session lives exactly as long as one [`exchange`](Session::exchange);
/// it is consumed by the call and never reused across connections.
pub struct Session {
    mycall: String,
    targetcall: String,
    locator: String,
    motd: Vec<String>,
    master: bool,
    robust: bool,
    user_agent: UserAgent,

    local_fw: Vec<Address>,
    remote_sid: Option<Sid>,
    remote_fw: Vec<Address>,

    mailbox: Option<Box<dyn MailboxHandler>>,
    status_observer: Option<Arc<dyn StatusObserver>>,
    secure_login_fn: Option<SecureLoginFn>,

    quit_sent: bool,
    quit_received: bool,
    /// True if the remote's last turn carried no messages for us.
    remote_no_msgs: bool,

    stats: TrafficStats,
}

impl Session {
    /// A mailbox of `None` is allowed, but no messages will be exchanged.
    pub fn new(
        mycall: impl Into<String>,
        targetcall: impl Into<String>,
        locator: impl Into<String>,
        mailbox: Option<Box<dyn MailboxHandler>>,
    ) -> Self {
        let mycall = mycall.into();
        Self {
            local_fw: vec![Address::new(mycall.as_str())],
            mycall,
            targetcall: targetcall.into(),
            locator: locator.into(),
            motd: Vec::new(),
            master: false,
            robust: false,
            user_agent: UserAgent::default(),
            remote_sid: None,
            remote_fw: Vec::new(),
            mailbox,
            status_observer: None,
            secure_login_fn: None,
            quit_sent: false,
            quit_received: false,
            remote_no_msgs: false,
            stats: TrafficStats::default(),
        }
    }

    /// Sets whether this side initiates the handshake and owns turnover.
    pub fn set_master(&mut self, master: bool) {
        self.master = master;
    }

    /// Forces the transport's conservative sub-mode for this exchange, when
    /// the transport supports one.
    pub fn set_robust(&mut self, robust: bool) {
        self.robust = robust;
    }

    /// Free-text lines sent before the handshake block when master.
    pub fn set_motd(&mut self, lines: Vec<String>) {
        self.motd = lines;
    }

    pub fn set_user_agent(&mut self, ua: UserAgent) {
        self.user_agent = ua;
    }

    /// Adds addresses to request messages on behalf of, besides our own
    /// callsign.
    pub fn add_auxiliary_address(&mut self, addrs: impl IntoIterator<Item = Address>) {
        self.local_fw.extend(addrs);
    }

    /// Registers the password resolver used when the remote issues a secure
    /// login challenge.
    pub fn set_secure_login_fn(&mut self, f: SecureLoginFn) {
        self.secure_login_fn = Some(f);
    }

    pub fn set_status_observer(&mut self, observer: Arc<dyn StatusObserver>) {
        self.status_observer = Some(observer);
    }

    pub fn mycall(&self) -> &str {
        &self.mycall
    }

    pub fn targetcall(&self) -> &str {
        &self.targetcall
    }

    /// The remote's capability code, available after the handshake.
    pub fn remote_sid(&self) -> Option<&Sid> {
        self.remote_sid.as_ref()
    }

    /// The addresses the remote requests traffic on behalf of. Typically
    /// the remote P2P station's callsign, and empty for a Winlink CMS.
    pub fn remote_forwarders(&self) -> &[Address] {
        &self.remote_fw
    }

    fn done(&self) -> bool {
        self.quit_sent || self.quit_received
    }

    /// Runs the full exchange over the given stream, consuming the session.
    ///
    /// Returns traffic statistics on clean completion. On error the stream
    /// is closed after a best-effort `*** <error>` echo to the peer; any
    /// messages fully transferred before the failure have already been
    /// committed to the mailbox.
    pub async fn exchange<S: ExchangeStream>(
        mut self,
        stream: S,
    ) -> Result<TrafficStats, SessionError> {
        let mut rd = StreamReader::new(stream);
        let result = self.run(&mut rd).await;

        match result {
            Ok(()) => {
                let _ = rd.shutdown().await;
                info!(
                    sent = self.stats.sent.len(),
                    received = self.stats.received.len(),
                    "exchange complete"
                );
                Ok(mem::take(&mut self.stats))
            }
            Err(err) => {
                if !err.is_eof() {
                    let echo = format!("*** {}\r", err);
                    let _ = tokio::time::timeout(
                        Duration::from_secs(10),
                        rd.write_all(echo.as_bytes()),
                    )
                    .await;
                }
                let _ = rd.shutdown().await;
                Err(err)
            }
        }
    }

    async fn run<S: ExchangeStream>(
        &mut self,
        rd: &mut StreamReader<S>,
    ) -> Result<(), SessionError> {
        if self.robust && !rd.set_robust(true) {
            debug!("transport has no robust mode");
        }

        if let Some(mailbox) = self.mailbox.as_mut() {
            mailbox.prepare()?;
        }

        self.handshake(rd).await?;

        let mut my_turn = !self.master;
        while !self.done() {
            if my_turn {
                self.quit_sent = self.handle_outbound(rd).await?;
            } else {
                self.quit_received = self.handle_inbound(rd).await?;
            }
            my_turn = !my_turn;
        }
        Ok(())
    }

    async fn handshake<S: ExchangeStream>(
        &mut self,
        rd: &mut StreamReader<S>,
    ) -> Result<(), SessionError> {
        if self.master {
            self.send_handshake(rd, None).await?;
        }

        let hs = read_handshake(rd).await?;
        let sid = hs.sid.ok_or(SessionError::NoSidInHandshake)?;
        if sid.has(SID_GZIP) && gzip_experiment_enabled() {
            debug!("gzip compression enabled in this session");
        }
        self.remote_sid = Some(sid);
        self.remote_fw = hs.fw;

        let mut secure_response = None;
        if let Some(challenge) = hs.secure_challenge {
            let resolve = self
                .secure_login_fn
                .as_ref()
                .ok_or(SessionError::MissingSecureLoginHandler)?;
            let password = resolve(&self.targetcall)
                .map_err(|err| SessionError::SecureLogin(err.to_string()))?;
            secure_response = Some(super::secure::secure_login_response(&challenge, &password));
        }

        if !self.master {
            self.send_handshake(rd, secure_response.as_deref()).await?;
        }
        Ok(())
    }

    async fn send_handshake<S: ExchangeStream>(
        &mut self,
        rd: &mut StreamReader<S>,
        secure_response: Option<&str>,
    ) -> Result<(), SessionError> {
        let block = HandshakeBlock {
            motd: &self.motd,
            local_fw: &self.local_fw,
            app_name: &self.user_agent.name,
            app_version: &self.user_agent.version,
            secure_response,
            mycall: &self.mycall,
            targetcall: &self.targetcall,
            locator: &self.locator,
            master: self.master,
        }
        .compose();
        rd.write_all(block.as_bytes()).await?;
        Ok(())
    }

    /// Outbound candidates from the mailbox, as proposals at the highest
    /// code the remote supports.
    fn outbound(&mut self) -> Vec<Proposal> {
        let code = self.highest_prop_code();
        let Some(mailbox) = self.mailbox.as_mut() else {
            return Vec::new();
        };
        mailbox
            .get_outbound(&self.remote_fw)
            .into_iter()
            .map(|msg| Proposal::from_outbound(msg, code))
            .collect()
    }

    fn highest_prop_code(&self) -> PropCode {
        let gzip = self
            .remote_sid
            .as_ref()
            .map(|sid| sid.has(SID_GZIP))
            .unwrap_or(false);
        if gzip && gzip_experiment_enabled() {
            PropCode::Gzip
        } else {
            PropCode::ExtendedB2
        }
    }

    /// One outbound turn. Returns true if we sent `FQ` (quit).
    async fn handle_outbound<S: ExchangeStream>(
        &mut self,
        rd: &mut StreamReader<S>,
    ) -> Result<bool, SessionError> {
        let mut rounds = 0;
        loop {
            let outbound = self.outbound();

            let mut sent = Vec::new();
            if !outbound.is_empty() {
                rounds += 1;
                if rounds > MAX_PROPOSAL_ROUNDS {
                    return Err(SessionError::TooManyProposalRounds(MAX_PROPOSAL_ROUNDS));
                }

                sent = self.send_outbound(rd, outbound).await?;
                for (mid, rejected) in &sent {
                    if let Some(mailbox) = self.mailbox.as_mut() {
                        mailbox.set_sent(mid, *rejected);
                    }
                    if !rejected {
                        self.stats.sent.push(mid.clone());
                    }
                }
            }

            if sent.iter().any(|(_, rejected)| !rejected) {
                // At least one proposal was actually delivered; session
                // turnover is implied.
                return Ok(false);
            }
            if !self.outbound().is_empty() {
                // Everything was deferred; offer the next block.
                continue;
            }
            if self.remote_no_msgs {
                rd.write_line("FQ").await?;
                return Ok(true);
            }

            rd.write_line("FF").await?;

            // The only valid byte after a turnover is 'F'; anything else is
            // the peer telling us the block was not accepted.
            if rd.peek_byte().await? != b'F' {
                let line = rd.next_line(true).await?;
                return Err(SessionError::UnexpectedResponse(line));
            }
            return Ok(false);
        }
    }

    /// Sends one proposal block and transfers the accepted payloads.
    /// Returns `(mid, rejected)` for every proposal that is now in the
    /// remote's hands; deferred proposals are excluded.
    async fn send_outbound<S: ExchangeStream>(
        &mut self,
        rd: &mut StreamReader<S>,
        mut outbound: Vec<Proposal>,
    ) -> Result<Vec<(String, bool)>, SessionError> {
        outbound.truncate(MAX_BLOCK_SIZE);

        let mut block = String::new();
        let mut lines = Vec::with_capacity(outbound.len());
        for prop in &outbound {
            let line = prop.encode_line();
            debug!(target: "hamlink::proto", ">{}", line);
            block.push_str(&line);
            block.push('\r');
            lines.push(line);
        }
        let checksum = wire::block_checksum(lines.iter().map(String::as_str));
        debug!("sending checksum {:02X}", checksum);
        block.push_str(&wire::checksum_line(checksum));
        block.push('\r');
        rd.write_all(block.as_bytes()).await?;

        let reply = rd.next_line(true).await?;
        if !reply.starts_with("FS ") {
            return Err(SessionError::ExpectedAnswer(reply));
        }
        parse_answer_line(&reply, &mut outbound)?;

        let mut sent = Vec::new();
        for prop in &outbound {
            match prop.answer() {
                ProposalAnswer::Defer => {
                    if let Some(mailbox) = self.mailbox.as_mut() {
                        mailbox.set_deferred(prop.mid());
                    }
                }
                ProposalAnswer::Reject => sent.push((prop.mid().to_string(), true)),
                ProposalAnswer::Accept => {
                    write_compressed(rd, prop, self.status_observer.clone()).await?;
                    sent.push((prop.mid().to_string(), false));
                }
                // An unanswered proposal is re-offered next round.
                ProposalAnswer::Pending => {}
            }
        }
        Ok(sent)
    }

    /// One inbound turn. Returns true if the peer sent `FQ` (quit).
    async fn handle_inbound<S: ExchangeStream>(
        &mut self,
        rd: &mut StreamReader<S>,
    ) -> Result<bool, SessionError> {
        let mut proposals: Vec<Proposal> = Vec::new();
        let mut block_lines: Vec<String> = Vec::new();
        let mut answered = true;
        let mut n_accepted = 0;
        let mut quit_received = false;

        loop {
            let line = rd.next_line(true).await?;
            if line.is_empty() || line.starts_with(';') {
                continue;
            }
            let bytes = line.as_bytes();
            if bytes[0] != b'F' || bytes.len() < 2 {
                return Err(SessionError::UnexpectedLine(line));
            }

            match bytes[1] {
                b'A' | b'B' | b'C' | b'D' => {
                    block_lines.push(line.clone());
                    proposals.push(Proposal::decode_line(&line)?);
                    answered = false;
                }
                b'F' => break, // no more messages
                b'Q' => {
                    if !answered {
                        return Err(SessionError::UnexpectedQuitWithPending);
                    }
                    quit_received = true;
                    break;
                }
                b'>' => {
                    let ours = wire::block_checksum(block_lines.iter().map(String::as_str));
                    let theirs = wire::parse_checksum_line(&line);
                    if ours != theirs {
                        return Err(SessionError::ChecksumError { ours, theirs });
                    }
                    block_lines.clear();

                    if proposals.is_empty() {
                        return Ok(false);
                    }
                    info!("{} proposal(s) received", proposals.len());

                    n_accepted = self.write_proposals_answer(rd, &mut proposals).await?;
                    answered = true;
                    if n_accepted > 0 {
                        // Turnover is implied after receiving the messages.
                        break;
                    }
                }
                other => return Err(SessionError::UnknownCommand(other as char)),
            }
        }

        if quit_received && n_accepted > 0 {
            return Err(SessionError::UnexpectedQuitWithPending);
        }

        // Fetch the accepted payloads.
        self.remote_no_msgs = true;
        for prop in proposals.iter_mut() {
            if prop.answer() != ProposalAnswer::Accept {
                continue;
            }
            self.remote_no_msgs = false;

            read_compressed(rd, prop, self.status_observer.as_ref()).await?;

            let message = ReceivedMessage {
                mid: prop.mid().to_string(),
                title: prop.title().to_string(),
                code: prop.code(),
                size: prop.size(),
                compressed_data: mem::take(&mut prop.compressed_data),
            };
            if let Some(mailbox) = self.mailbox.as_mut() {
                mailbox.process_inbound(message)?;
            }
            self.stats.received.push(prop.mid().to_string());
        }

        Ok(quit_received)
    }

    /// Decides and sends the `FS` answer for a received proposal block.
    /// Returns the number of accepted proposals.
    async fn write_proposals_answer<S: ExchangeStream>(
        &mut self,
        rd: &mut StreamReader<S>,
        proposals: &mut [Proposal],
    ) -> Result<usize, SessionError> {
        let mut n_accepted = 0;
        for prop in proposals.iter_mut() {
            let answer = if !prop.code().is_supported() {
                debug!(mid = prop.mid(), "deferring (unsupported format)");
                ProposalAnswer::Defer
            } else {
                match self.mailbox.as_mut() {
                    None => {
                        debug!(mid = prop.mid(), "deferring (missing handler)");
                        ProposalAnswer::Defer
                    }
                    Some(mailbox) => match mailbox.get_inbound_answer(prop) {
                        ProposalAnswer::Accept => {
                            debug!(mid = prop.mid(), "accepting");
                            n_accepted += 1;
                            ProposalAnswer::Accept
                        }
                        // A pending verdict from the store is not a wire
                        // answer; try again later.
                        ProposalAnswer::Pending => ProposalAnswer::Defer,
                        other => other,
                    },
                }
            };
            prop.answer = answer;
        }

        rd.write_line(&encode_answer_line(proposals)).await?;
        Ok(n_accepted)
    }
}

fn gzip_experiment_enabled() -> bool {
    std::env::var_os("GZIP_EXPERIMENT").is_some()
}
